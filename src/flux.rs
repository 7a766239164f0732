//! Per-pixel output flux vector and its batch (struct-of-arrays) form.

use ndarray::{Array1, Zip};

/// Sentinel for "not computed".
pub const NODATA: f32 = -1.0;

/// Retrieved quantities of one pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluxValues {
    pub swdr: f32,
    pub swdr_direct: f32,
    pub par: f32,
    pub par_direct: f32,
    pub uva: f32,
    pub uvb: f32,
    pub toa_up: f32,
    /// Effective surface albedo seen by the SWDR model
    pub rho: f32,
}

impl FluxValues {
    pub const fn splat(v: f32) -> Self {
        Self {
            swdr: v,
            swdr_direct: v,
            par: v,
            par_direct: v,
            uva: v,
            uvb: v,
            toa_up: v,
            rho: v,
        }
    }
}

/// Flux fields of a batch of pixels, one array per quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxFields {
    pub swdr: Array1<f32>,
    pub swdr_direct: Array1<f32>,
    pub par: Array1<f32>,
    pub par_direct: Array1<f32>,
    pub uva: Array1<f32>,
    pub uvb: Array1<f32>,
    pub toa_up: Array1<f32>,
    pub rho: Array1<f32>,
}

impl FluxFields {
    pub fn filled(len: usize, value: f32) -> Self {
        let a = Array1::from_elem(len, value);
        Self {
            swdr: a.clone(),
            swdr_direct: a.clone(),
            par: a.clone(),
            par_direct: a.clone(),
            uva: a.clone(),
            uvb: a.clone(),
            toa_up: a.clone(),
            rho: a,
        }
    }

    pub fn len(&self) -> usize {
        self.swdr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swdr.is_empty()
    }

    pub fn fields(&self) -> [&Array1<f32>; 8] {
        [
            &self.swdr,
            &self.swdr_direct,
            &self.par,
            &self.par_direct,
            &self.uva,
            &self.uvb,
            &self.toa_up,
            &self.rho,
        ]
    }

    pub fn fields_mut(&mut self) -> [&mut Array1<f32>; 8] {
        [
            &mut self.swdr,
            &mut self.swdr_direct,
            &mut self.par,
            &mut self.par_direct,
            &mut self.uva,
            &mut self.uvb,
            &mut self.toa_up,
            &mut self.rho,
        ]
    }

    pub fn get(&self, i: usize) -> FluxValues {
        FluxValues {
            swdr: self.swdr[i],
            swdr_direct: self.swdr_direct[i],
            par: self.par[i],
            par_direct: self.par_direct[i],
            uva: self.uva[i],
            uvb: self.uvb[i],
            toa_up: self.toa_up[i],
            rho: self.rho[i],
        }
    }

    pub fn set(&mut self, i: usize, v: FluxValues) {
        self.swdr[i] = v.swdr;
        self.swdr_direct[i] = v.swdr_direct;
        self.par[i] = v.par;
        self.par_direct[i] = v.par_direct;
        self.uva[i] = v.uva;
        self.uvb[i] = v.uvb;
        self.toa_up[i] = v.toa_up;
        self.rho[i] = v.rho;
    }

    /// Write `other[k]` to position `index[k]` of every field.
    pub fn scatter(&mut self, index: &[usize], other: &FluxFields) {
        for (dst, src) in self.fields_mut().into_iter().zip(other.fields()) {
            for (&i, &v) in index.iter().zip(src.iter()) {
                dst[i] = v;
            }
        }
    }

    /// Copy pixel range `offset..offset + other.len()` from `other`.
    pub fn splice(&mut self, offset: usize, other: &FluxFields) {
        for (dst, src) in self.fields_mut().into_iter().zip(other.fields()) {
            dst.slice_mut(ndarray::s![offset..offset + src.len()]).assign(src);
        }
    }

    /// Per-pixel linear interpolation between `lo` (at `x_lo`) and `hi` (at `x_hi`).
    pub fn lerp(lo: &FluxFields, hi: &FluxFields, x: &Array1<f32>, x_lo: f32, x_hi: f32) -> FluxFields {
        let span = x_hi - x_lo;
        let mut out = lo.clone();
        for ((dst, l), h) in out.fields_mut().into_iter().zip(lo.fields()).zip(hi.fields()) {
            Zip::from(dst).and(l).and(h).and(x).for_each(|d, &l, &h, &x| {
                let slope = (h - l) / span;
                *d = l + slope * (x - x_lo);
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_lerp_endpoints_exact() {
        let lo = FluxFields::filled(3, 100.0);
        let hi = FluxFields::filled(3, 300.0);
        let x = array![0.0, 0.5, 1.0];
        let out = FluxFields::lerp(&lo, &hi, &x, 0.0, 1.0);
        assert_eq!(out.swdr[0], 100.0);
        assert_eq!(out.par[1], 200.0);
        assert_eq!(out.rho[2], 300.0);
    }

    #[test]
    fn test_scatter_and_splice() {
        let mut all = FluxFields::filled(5, NODATA);
        let mut part = FluxFields::filled(2, 0.0);
        part.set(0, FluxValues::splat(7.0));
        part.set(1, FluxValues::splat(9.0));
        all.scatter(&[4, 1], &part);
        assert_eq!(all.uva.to_vec(), vec![-1.0, 9.0, -1.0, -1.0, 7.0]);

        all.splice(2, &part);
        assert_eq!(all.get(2), FluxValues::splat(7.0));
        assert_eq!(all.get(3), FluxValues::splat(9.0));
    }
}
