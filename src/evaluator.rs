//! Pixel batch evaluation.
//!
//! A batch is a set of pixels that share one SZA × VZA × LOS bracket. The
//! sub-LUT handed in holds eight `inner_rows` blocks, one per (SZA corner,
//! VZA corner, DEM corner) combination:
//!
//! ```text
//! block 0  ds_dv dem_dw     block 4  us_dv dem_dw
//! block 1  ds_dv dem_up     block 5  us_dv dem_up
//! block 2  ds_uv dem_dw     block 6  us_uv dem_dw
//! block 3  ds_uv dem_up     block 7  us_uv dem_up
//! ```
//!
//! Every LUT row is inverted against every pixel (rows × pixels tiles), the
//! DEM interpolator runs at each angular corner, and the corners are combined
//! linearly in VZA and then SZA.

use ndarray::{s, Array1, Array2, ArrayView2};
use tracing::debug;

use crate::config::{CandidateFailurePolicy, SensorCalibration};
use crate::error::{Result, RetrievalError};
use crate::flux::{FluxFields, NODATA};
use crate::interpolator::{interpolate_dem, Observation};
use crate::lut::{self, BandColumns, FluxColumns, LUT_COLS};
use crate::reference::{synthesize_references, ReferenceTiles};

/// Number of corner blocks in a bracket sub-LUT.
pub const CORNER_BLOCKS: usize = 8;

/// Pixels evaluated per tile set; bounds the rows × pixels tile memory.
const PIXEL_CHUNK: usize = 512;

/// Grid values of the bracket currently being evaluated.
///
/// Passed by value through the evaluator and interpolator; nothing about the
/// bracket is stored between calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BracketContext {
    pub sza_dw: f32,
    pub sza_up: f32,
    pub vza_dw: f32,
    pub vza_up: f32,
    pub los: f32,
    pub dem_dw: f32,
    pub dem_up: f32,
}

/// Snow-index window of the spectral regime being evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnowWindow {
    pub max: f32,
    pub min: f32,
}

/// Knobs of the neighbour search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InversionSettings {
    pub toa_avg_num: usize,
    pub f_std: f32,
    pub on_failure: CandidateFailurePolicy,
}

/// Per-pixel inputs of a batch, already scaled to physical units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelBatch {
    pub dem: Array1<f32>,
    pub sza: Array1<f32>,
    pub vza: Array1<f32>,
    pub rad_b1: Array1<f32>,
    pub rad_b3: Array1<f32>,
    pub rad_b4: Array1<f32>,
    pub rad_b6: Array1<f32>,
    pub rad_b7: Array1<f32>,
    pub refl_b1: Array1<f32>,
    pub refl_b3: Array1<f32>,
    pub refl_b4: Array1<f32>,
    pub refl_b6: Array1<f32>,
    pub refl_b7: Array1<f32>,
    pub sw_albedo: Array1<f32>,
    pub vis_albedo: Array1<f32>,
}

impl PixelBatch {
    pub fn len(&self) -> usize {
        self.dem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dem.is_empty()
    }

    /// Subset of the batch at `index`, in that order.
    pub fn select(&self, index: &[usize]) -> Self {
        self.map(|a| index.iter().map(|&i| a[i]).collect())
    }

    fn chunk(&self, start: usize, end: usize) -> Self {
        self.map(|a| a.slice(s![start..end]).to_owned())
    }

    fn map(&self, f: impl Fn(&Array1<f32>) -> Array1<f32>) -> Self {
        Self {
            dem: f(&self.dem),
            sza: f(&self.sza),
            vza: f(&self.vza),
            rad_b1: f(&self.rad_b1),
            rad_b3: f(&self.rad_b3),
            rad_b4: f(&self.rad_b4),
            rad_b6: f(&self.rad_b6),
            rad_b7: f(&self.rad_b7),
            refl_b1: f(&self.refl_b1),
            refl_b3: f(&self.refl_b3),
            refl_b4: f(&self.refl_b4),
            refl_b6: f(&self.refl_b6),
            refl_b7: f(&self.refl_b7),
            sw_albedo: f(&self.sw_albedo),
            vis_albedo: f(&self.vis_albedo),
        }
    }

    fn observations(&self) -> Vec<Observation> {
        (0..self.len())
            .map(|p| Observation {
                b1: self.rad_b1[p],
                b3: self.rad_b3[p],
                b6: self.rad_b6[p],
                b7: self.rad_b7[p],
                refl_b3: self.refl_b3[p],
                ref_mean: (self.refl_b1[p] + self.refl_b3[p]) / 2.0,
            })
            .collect()
    }
}

/// Flux fields of a batch plus the pixels that had no usable candidates.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub fluxes: FluxFields,
    /// Pixels set to the nodata value under `CandidateFailurePolicy::SkipPixel`
    pub failed_pixels: Vec<usize>,
}

/// Rows × pixels tiles of one chunk of a batch.
pub(crate) struct BatchTiles {
    pub block_len: usize,
    pub sim_b1: Array2<f32>,
    pub sim_b3: Array2<f32>,
    pub sim_b6: Array2<f32>,
    pub sim_b7: Array2<f32>,
    pub ndsi: Array2<f32>,
    pub refs: ReferenceTiles,
    pub swdr: Array2<f32>,
    pub par: Array2<f32>,
    pub uva: Array2<f32>,
    pub uvb: Array2<f32>,
    pub toa_up: Array2<f32>,
    pub cod: Array1<f32>,
    pub swdr_direct: Array1<f32>,
    pub par_direct: Array1<f32>,
    pub swdr_rho: Array1<f32>,
}

/// TOA radiance of a LUT row for a surface of reflectance `refl`.
#[inline]
pub fn simulate_radiance(i0: f32, rho: f32, complex: f32, refl: f32) -> f32 {
    i0 + complex / (1.0 / refl - rho)
}

/// Surface flux of a LUT row for a surface of albedo `albedo`.
#[inline]
pub fn surface_flux(f0: f32, rho: f32, complex: f32, albedo: f32) -> f32 {
    let ar = albedo * rho;
    f0 + ar / (1.0 - ar) * complex
}

fn band_tile(sub_lut: ArrayView2<f32>, band: BandColumns, refl: &Array1<f32>) -> Array2<f32> {
    let (i0, rho, cv) = (sub_lut.column(band.i0), sub_lut.column(band.rho), sub_lut.column(band.complex));
    Array2::from_shape_fn((sub_lut.nrows(), refl.len()), |(r, p)| {
        simulate_radiance(i0[r], rho[r], cv[r], refl[p])
    })
}

fn flux_tile(sub_lut: ArrayView2<f32>, flux: FluxColumns, albedo: &Array1<f32>) -> Array2<f32> {
    let f0: Array1<f32> = &sub_lut.column(flux.direct) + &sub_lut.column(flux.diffuse);
    let (rho, cv) = (sub_lut.column(flux.rho), sub_lut.column(flux.complex));
    Array2::from_shape_fn((sub_lut.nrows(), albedo.len()), |(r, p)| {
        surface_flux(f0[r], rho[r], cv[r], albedo[p])
    })
}

fn toa_up_tile(sub_lut: ArrayView2<f32>, albedo: &Array1<f32>) -> Array2<f32> {
    let toa = lut::TOA_ALBEDO;
    let (f0, rho, cv) = (sub_lut.column(toa.i0), sub_lut.column(toa.rho), sub_lut.column(toa.complex));
    let down = sub_lut.column(lut::TOA_DOWN_FLUX);
    Array2::from_shape_fn((sub_lut.nrows(), albedo.len()), |(r, p)| {
        let toa_albedo = f0[r] + cv[r] / (1.0 / albedo[p] - rho[r]);
        toa_albedo * down[r]
    })
}

impl BatchTiles {
    pub(crate) fn build(sub_lut: ArrayView2<f32>, batch: &PixelBatch, cal: &SensorCalibration) -> Self {
        let block_len = cal.inner_rows;

        // ── Band inversion ──────────────────────────────────────────
        let sim_b1 = band_tile(sub_lut, lut::BAND1, &batch.refl_b1);
        let sim_b3 = band_tile(sub_lut, lut::BAND3, &batch.refl_b3);
        let sim_b4 = band_tile(sub_lut, lut::BAND4, &batch.refl_b4);
        let sim_b6 = band_tile(sub_lut, lut::BAND6, &batch.refl_b6);
        let sim_b7 = band_tile(sub_lut, lut::BAND7, &batch.refl_b7);

        let mut ndsi = sim_b4;
        ndsi.zip_mut_with(&sim_b6, |a, &b| *a = cal.snow_index(*a, b));

        // ── References ──────────────────────────────────────────────
        let block_starts: Vec<usize> = (0..CORNER_BLOCKS).map(|b| b * block_len).collect();
        let refs = synthesize_references(
            sim_b1.view(),
            sim_b3.view(),
            sim_b6.view(),
            sim_b7.view(),
            &block_starts,
            cal,
        );

        // ── Flux inversion ──────────────────────────────────────────
        Self {
            block_len,
            swdr: flux_tile(sub_lut, lut::SWDR, &batch.sw_albedo),
            par: flux_tile(sub_lut, lut::PAR, &batch.vis_albedo),
            uva: flux_tile(sub_lut, lut::UVA, &batch.vis_albedo),
            uvb: flux_tile(sub_lut, lut::UVB, &batch.vis_albedo),
            toa_up: toa_up_tile(sub_lut, &batch.sw_albedo),
            cod: sub_lut.column(lut::COD).to_owned(),
            swdr_direct: sub_lut.column(lut::SWDR.direct).to_owned(),
            par_direct: sub_lut.column(lut::PAR.direct).to_owned(),
            swdr_rho: sub_lut.column(lut::SWDR.rho).to_owned(),
            sim_b1,
            sim_b3,
            sim_b6,
            sim_b7,
            ndsi,
            refs,
        }
    }
}

/// Evaluate a batch against its bracket sub-LUT.
pub fn evaluate_batch(
    sub_lut: ArrayView2<f32>,
    batch: &PixelBatch,
    ctx: BracketContext,
    window: SnowWindow,
    settings: &InversionSettings,
    cal: &SensorCalibration,
) -> Result<BatchResult> {
    let expected_rows = CORNER_BLOCKS * cal.inner_rows;
    if sub_lut.nrows() != expected_rows || sub_lut.ncols() != LUT_COLS {
        return Err(RetrievalError::LutFormat(format!(
            "bracket sub-LUT is {}x{}, expected {expected_rows}x{LUT_COLS}",
            sub_lut.nrows(),
            sub_lut.ncols()
        )));
    }

    let n = batch.len();
    let mut fluxes = FluxFields::filled(n, NODATA);
    let mut failed_pixels = Vec::new();

    for start in (0..n).step_by(PIXEL_CHUNK) {
        let end = (start + PIXEL_CHUNK).min(n);
        let chunk = batch.chunk(start, end);
        let tiles = BatchTiles::build(sub_lut, &chunk, cal);
        let (part, failed) = evaluate_corners(&tiles, &chunk, ctx, window, settings)?;
        fluxes.splice(start, &part);
        failed_pixels.extend(failed.into_iter().map(|p| p + start));
    }

    failed_pixels.sort_unstable();
    failed_pixels.dedup();
    if !failed_pixels.is_empty() {
        debug!("{} pixels without usable candidates", failed_pixels.len());
        fluxes.scatter(&failed_pixels, &FluxFields::filled(failed_pixels.len(), NODATA));
    }

    Ok(BatchResult { fluxes, failed_pixels })
}

fn evaluate_corners(
    tiles: &BatchTiles,
    batch: &PixelBatch,
    ctx: BracketContext,
    window: SnowWindow,
    settings: &InversionSettings,
) -> Result<(FluxFields, Vec<usize>)> {
    let i = tiles.block_len;
    let obs = batch.observations();
    let mut failed = Vec::new();
    let mut corner = |up_block: usize, dw_block: usize| -> Result<FluxFields> {
        let outcome = interpolate_dem(
            tiles, &obs, &batch.dem, up_block, dw_block, ctx.dem_dw, ctx.dem_up, window, settings,
        )?;
        failed.extend(outcome.failed);
        Ok(outcome.fluxes)
    };

    let vza_differs = ctx.vza_up != ctx.vza_dw;

    // ── Up SZA ──────────────────────────────────────────────────────
    let us_uv = corner(7 * i, 6 * i)?;
    let us = if vza_differs {
        let us_dv = corner(5 * i, 4 * i)?;
        FluxFields::lerp(&us_dv, &us_uv, &batch.vza, ctx.vza_dw, ctx.vza_up)
    } else {
        us_uv
    };
    if ctx.sza_up == ctx.sza_dw {
        return Ok((us, failed));
    }

    // ── Down SZA ────────────────────────────────────────────────────
    let ds_uv = corner(3 * i, 2 * i)?;
    let ds = if vza_differs {
        let ds_dv = corner(i, 0)?;
        FluxFields::lerp(&ds_dv, &ds_uv, &batch.vza, ctx.vza_dw, ctx.vza_up)
    } else {
        ds_uv
    };

    let fluxes = FluxFields::lerp(&ds, &us, &batch.sza, ctx.sza_dw, ctx.sza_up);
    Ok((fluxes, failed))
}
