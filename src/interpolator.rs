//! DEM/neighbour interpolation.
//!
//! For every pixel and each of the two DEM corners of a bracket:
//! classify the local atmospheric state against the clear/overcast
//! references, pick a LUT-row neighbour pool by radiometric similarity,
//! average every flux over the pool with outlier rejection, then interpolate
//! linearly in elevation between the two corners.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use ndarray::{Array1, ArrayView1};
use tracing::debug;

use crate::config::CandidateFailurePolicy;
use crate::error::{Result, RetrievalError};
use crate::evaluator::{BatchTiles, InversionSettings, SnowWindow};
use crate::flux::{FluxFields, FluxValues};

const CLOUD_DEVIATION: f32 = 0.2;
const OVERCAST_REF_MEAN_MAX: f32 = 0.60;
const OVERCAST_VISIBLE_FRACTION: f32 = 0.95;
/// Below this mean of reflectance bands 1 and 3 the band-3 distance pool drives the totals
const DARK_REF_MEAN_MAX: f32 = 0.3;
/// Band-3 reflectance range where the cloud-band cosine replaces the primary one
const CLOUD_BAND_REFL3_MIN: f32 = 0.65;
const CLOUD_BAND_REFL3_MAX: f32 = 0.82;
const CLOUD_COD_MAX: f32 = 60.0;
const CLEAR_COD_MAX: f32 = 1.0;
const SNOW_SIGMA_WIDTH: f32 = 5.0;
const MIN_FILTERED_POOL: usize = 2;
/// The intersection of two pools replaces the distance pool only above this size
const MIN_INTERSECTION: usize = 4;
const FLUX_EPS: f32 = 0.1;
const UV_EPS: f32 = 0.01;

/// Local atmospheric state of a pixel at one DEM corner.
///
/// `Clear` has its own candidate-selection branch but the classifier never
/// assigns it under the current thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtmosphericState {
    Uncertain,
    Clear,
    Cloud,
    Overcast,
}

/// Observed quantities of one pixel used by the neighbour search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub b1: f32,
    pub b3: f32,
    pub b6: f32,
    pub b7: f32,
    pub refl_b3: f32,
    /// Mean of reflectance bands 1 and 3
    pub ref_mean: f32,
}

impl Observation {
    fn primary(&self) -> [f32; 3] {
        [self.b1, self.b3, self.b7]
    }

    fn cloud_bands(&self) -> [f32; 3] {
        [self.b3, self.b6, self.b7]
    }
}

/// Reference radiances of one pixel at one DEM corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerReference {
    /// Bands 1, 3, 6, 7
    pub clear: [f32; 4],
    /// Bands 1, 3, 7
    pub overcast: [f32; 3],
}

impl AtmosphericState {
    pub fn classify(obs: &Observation, reference: &CornerReference) -> Self {
        let clear = [reference.clear[0], reference.clear[1], reference.clear[3]];
        let observed = obs.primary();
        let deviation = observed
            .iter()
            .zip(clear.iter())
            .map(|(o, c)| (o - c).abs() / c)
            .sum::<f32>()
            / 3.0;

        let mut state = if deviation >= CLOUD_DEVIATION {
            AtmosphericState::Cloud
        } else {
            AtmosphericState::Uncertain
        };

        let overcast = reference.overcast;
        if obs.ref_mean < OVERCAST_REF_MEAN_MAX
            && obs.b1 > overcast[0] * OVERCAST_VISIBLE_FRACTION
            && obs.b3 > overcast[1] * OVERCAST_VISIBLE_FRACTION
            && obs.b7 < overcast[2]
        {
            state = AtmosphericState::Overcast;
        }
        state
    }
}

/// Per-pixel result of one DEM bracket.
#[derive(Debug, Clone)]
pub(crate) struct CornerOutcome {
    pub fluxes: FluxFields,
    /// Pixels whose candidate pool came back empty (only under `SkipPixel`)
    pub failed: Vec<usize>,
}

/// Snow-filtered LUT rows of one DEM corner for one pixel.
struct CornerCandidates {
    /// Absolute tile rows that passed the snow-index window
    rows: Vec<usize>,
    sim_b1: Vec<f32>,
    sim_b3: Vec<f32>,
    sim_b6: Vec<f32>,
    sim_b7: Vec<f32>,
    cod: Vec<f32>,
    reference: CornerReference,
}

/// Neighbour pools as positions into `CornerCandidates::rows`.
#[derive(Debug, Clone, PartialEq)]
struct CandidatePools {
    total: Vec<usize>,
    direct: Vec<usize>,
}

/// Interpolate the flux fields of every pixel between the `dw_block` and
/// `up_block` DEM corners of the tiles.
#[allow(clippy::too_many_arguments)]
pub(crate) fn interpolate_dem(
    tiles: &BatchTiles,
    obs: &[Observation],
    dem: &Array1<f32>,
    up_block: usize,
    dw_block: usize,
    dem_dw: f32,
    dem_up: f32,
    window: SnowWindow,
    settings: &InversionSettings,
) -> Result<CornerOutcome> {
    let n_pixels = obs.len();
    let mut up_fields = FluxFields::filled(n_pixels, 0.0);
    let mut dw_fields = FluxFields::filled(n_pixels, 0.0);
    let mut failed = Vec::new();

    for (p, o) in obs.iter().enumerate() {
        let ndsi_column = tiles.ndsi.column(p);
        let sigma = sample_std(ndsi_column);

        let up = CornerCandidates::gather(tiles, p, up_block, window, sigma);
        let dw = CornerCandidates::gather(tiles, p, dw_block, window, sigma);
        let k = settings.toa_avg_num.min(up.rows.len()).min(dw.rows.len());

        let result = up
            .retrieve(tiles, p, o, k, settings.f_std)
            .and_then(|u| dw.retrieve(tiles, p, o, k, settings.f_std).map(|d| (u, d)));

        match result {
            Ok((u, d)) => {
                up_fields.set(p, u);
                dw_fields.set(p, d);
            }
            Err(e) if settings.on_failure == CandidateFailurePolicy::SkipPixel => {
                debug!("pixel {p} skipped: {e}");
                up_fields.set(p, FluxValues::splat(f32::NAN));
                dw_fields.set(p, FluxValues::splat(f32::NAN));
                failed.push(p);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(CornerOutcome {
        fluxes: FluxFields::lerp(&dw_fields, &up_fields, dem, dem_dw, dem_up),
        failed,
    })
}

impl CornerCandidates {
    fn gather(tiles: &BatchTiles, pixel: usize, block: usize, window: SnowWindow, sigma: f32) -> Self {
        let block_rows = block..block + tiles.block_len;
        let ndsi = tiles.ndsi.column(pixel);

        let hi = window.max + SNOW_SIGMA_WIDTH * sigma;
        let lo = window.min - SNOW_SIGMA_WIDTH * sigma;
        let mut rows: Vec<usize> = block_rows
            .clone()
            .filter(|&r| ndsi[r] <= hi && ndsi[r] >= lo)
            .collect();
        if rows.is_empty() {
            rows = block_rows.filter(|&r| ndsi[r] <= 1.0 && ndsi[r] >= -1.0).collect();
        }

        let pick = |tile: &ndarray::Array2<f32>| -> Vec<f32> { rows.iter().map(|&r| tile[[r, pixel]]).collect() };
        let refs = &tiles.refs;
        Self {
            sim_b1: pick(&tiles.sim_b1),
            sim_b3: pick(&tiles.sim_b3),
            sim_b6: pick(&tiles.sim_b6),
            sim_b7: pick(&tiles.sim_b7),
            cod: rows.iter().map(|&r| tiles.cod[r]).collect(),
            reference: CornerReference {
                // constant per column within a block
                clear: [
                    refs.clear_b1[[block, pixel]],
                    refs.clear_b3[[block, pixel]],
                    refs.clear_b6[[block, pixel]],
                    refs.clear_b7[[block, pixel]],
                ],
                overcast: [
                    refs.overcast_b1[[block, pixel]],
                    refs.overcast_b3[[block, pixel]],
                    refs.overcast_b7[[block, pixel]],
                ],
            },
            rows,
        }
    }

    fn retrieve(&self, tiles: &BatchTiles, pixel: usize, obs: &Observation, k: usize, f_std: f32) -> Result<FluxValues> {
        let state = AtmosphericState::classify(obs, &self.reference);
        let pools = self.select(obs, state, k);
        self.average(tiles, pixel, &pools, f_std)
    }

    fn select(&self, obs: &Observation, state: AtmosphericState, k: usize) -> CandidatePools {
        let n = self.rows.len();
        let primary_sim = |q: usize| [self.sim_b1[q], self.sim_b3[q], self.sim_b7[q]];
        let cloud_sim = |q: usize| [self.sim_b3[q], self.sim_b6[q], self.sim_b7[q]];

        let band3_distance: Vec<f32> = self.sim_b3.iter().map(|s| (s - obs.b3).abs()).collect();
        let mut distance_pool = rank(&band3_distance, false);
        distance_pool.truncate(k);

        let pool = match state {
            AtmosphericState::Clear => {
                let dist: Vec<f32> = (0..n).map(|q| log_distance(primary_sim(q), obs.primary())).collect();
                let primary = rank(&dist, false);
                let pool = filter_by_depth(&primary, primary[..k].to_vec(), k, &self.cod, |c| c <= CLEAR_COD_MAX);
                let common = intersect(&pool, &distance_pool);
                distance_pool = if common.len() > MIN_INTERSECTION { common } else { pool.clone() };
                pool
            }
            AtmosphericState::Overcast => {
                let cos: Vec<f32> = (0..n).map(|q| log_cosine(cloud_sim(q), obs.cloud_bands())).collect();
                let mut pool = rank(&cos, true);
                pool.truncate(k);
                pool
            }
            AtmosphericState::Cloud | AtmosphericState::Uncertain => {
                let cos: Vec<f32> = (0..n).map(|q| log_cosine(primary_sim(q), obs.primary())).collect();
                let primary = rank(&cos, true);
                let mut initial = primary[..k].to_vec();
                if obs.refl_b3 >= CLOUD_BAND_REFL3_MIN && obs.refl_b3 < CLOUD_BAND_REFL3_MAX {
                    let cloud_cos: Vec<f32> =
                        (0..n).map(|q| log_cosine(cloud_sim(q), obs.cloud_bands())).collect();
                    initial = rank(&cloud_cos, true);
                    initial.truncate(k);
                }
                let in_range = |c: f32| (0.0..=CLOUD_COD_MAX).contains(&c);
                let pool = filter_by_depth(&primary, initial, k, &self.cod, in_range);

                let common = intersect(&pool, &distance_pool);
                if common.len() > MIN_INTERSECTION {
                    distance_pool = common;
                }
                let filtered: Vec<usize> =
                    distance_pool.iter().copied().filter(|&q| in_range(self.cod[q])).collect();
                distance_pool = if filtered.is_empty() { pool.clone() } else { filtered };
                pool
            }
        };

        let total = if obs.ref_mean < DARK_REF_MEAN_MAX && state != AtmosphericState::Overcast {
            distance_pool
        } else {
            pool.clone()
        };
        CandidatePools { total, direct: pool }
    }

    fn average(&self, tiles: &BatchTiles, pixel: usize, pools: &CandidatePools, f_std: f32) -> Result<FluxValues> {
        let tile_at = |tile: &ndarray::Array2<f32>, pool: &[usize]| -> Vec<f32> {
            pool.iter().map(|&q| tile[[self.rows[q], pixel]]).collect()
        };
        let lut_at = |col: &Array1<f32>, pool: &[usize]| -> Vec<f32> { pool.iter().map(|&q| col[self.rows[q]]).collect() };

        // ── SWDR and rho ─────────────────────────────────────────────
        let swdr = tile_at(&tiles.swdr, &pools.total);
        let keep = robust_keep("SWDR", &swdr, f_std, FLUX_EPS)?;
        let swdr_mean = mean_at(&swdr, &keep);
        let rho_mean = mean_at(&lut_at(&tiles.swdr_rho, &pools.total), &keep);

        // ── Direct components, screened on their totals ─────────────
        let swdr_dir_pool = tile_at(&tiles.swdr, &pools.direct);
        let keep = robust_keep("SWDR(dir)", &swdr_dir_pool, f_std, FLUX_EPS)?;
        let swdr_direct = mean_at(&lut_at(&tiles.swdr_direct, &pools.direct), &keep);

        let par = tile_at(&tiles.par, &pools.total);
        let keep = robust_keep("PAR", &par, f_std, FLUX_EPS)?;
        let par_mean = mean_at(&par, &keep);

        let par_dir_pool = tile_at(&tiles.par, &pools.direct);
        let keep = robust_keep("PAR(dir)", &par_dir_pool, f_std, FLUX_EPS)?;
        let par_direct = mean_at(&lut_at(&tiles.par_direct, &pools.direct), &keep);

        // ── UV and TOA ───────────────────────────────────────────────
        let uva = tile_at(&tiles.uva, &pools.total);
        let uva_mean = mean_at(&uva, &robust_keep("UVA", &uva, f_std, UV_EPS)?);

        let uvb = tile_at(&tiles.uvb, &pools.total);
        let uvb_mean = mean_at(&uvb, &robust_keep("UVB", &uvb, f_std, UV_EPS)?);

        let toa_up = tile_at(&tiles.toa_up, &pools.total);
        let toa_up_mean = mean_at(&toa_up, &robust_keep("TOA_up_flux", &toa_up, f_std, FLUX_EPS)?);

        Ok(FluxValues {
            swdr: swdr_mean,
            swdr_direct,
            par: par_mean,
            par_direct,
            uva: uva_mean,
            uvb: uvb_mean,
            toa_up: toa_up_mean,
            rho: rho_mean,
        })
    }
}

/// Restrict `initial` to rows whose optical depth passes `accept`, growing the
/// pool along the `primary` ranking until at least two rows pass.
///
/// When the ranking runs out, the last pool is kept with every row of
/// non-negative depth, and those positions are read back against `primary`.
fn filter_by_depth(
    primary: &[usize],
    initial: Vec<usize>,
    k: usize,
    cod: &[f32],
    accept: impl Fn(f32) -> bool,
) -> Vec<usize> {
    let positions = |pool: &[usize], pred: &dyn Fn(f32) -> bool| -> Vec<usize> {
        pool.iter()
            .enumerate()
            .filter(|(_, &q)| pred(cod[q]))
            .map(|(i, _)| i)
            .collect()
    };

    let mut pool = initial;
    let mut keep = positions(&pool, &accept);
    let mut k_new = k;
    while keep.len() < MIN_FILTERED_POOL {
        k_new += 1;
        if k_new > primary.len() {
            return positions(&pool, &|c| c >= 0.0)
                .into_iter()
                .map(|i| primary[i])
                .collect();
        }
        pool = primary[..k_new].to_vec();
        keep = positions(&pool, &accept);
    }
    keep.into_iter().map(|i| pool[i]).collect()
}

/// Stable argsort; NaN ranks last in either direction.
fn rank(values: &[f32], descending: bool) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| {
        let (x, y) = (values[a], values[b]);
        match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ if descending => y.total_cmp(&x),
            _ => x.total_cmp(&y),
        }
    });
    idx
}

/// Sorted, de-duplicated common members.
fn intersect(a: &[usize], b: &[usize]) -> Vec<usize> {
    let b: BTreeSet<usize> = b.iter().copied().collect();
    a.iter()
        .copied()
        .filter(|q| b.contains(q))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Cosine similarity of log radiances, both centred on the log of the
/// observed mean. Zero when either vector has zero length.
fn log_cosine(sim: [f32; 3], obs: [f32; 3]) -> f32 {
    let centre = ((obs[0] + obs[1] + obs[2]) / 3.0).ln();
    let a = sim.map(|v| v.ln() - centre);
    let b = obs.map(|v| v.ln() - centre);
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na != 0.0 && nb != 0.0 {
        dot / (na * nb)
    } else {
        0.0
    }
}

fn log_distance(sim: [f32; 3], obs: [f32; 3]) -> f32 {
    sim.iter()
        .zip(obs.iter())
        .map(|(s, o)| (s.ln() - o.ln()).powi(2))
        .sum::<f32>()
        .sqrt()
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

fn mean_at(values: &[f32], keep: &[usize]) -> f32 {
    keep.iter().map(|&i| values[i]).sum::<f32>() / keep.len() as f32
}

/// Sample standard deviation (N-1); zero for a single value, NaN when empty.
pub(crate) fn sample_std(values: ArrayView1<f32>) -> f32 {
    let n = values.len();
    match n {
        0 => f32::NAN,
        1 => 0.0,
        _ => {
            let m = values.sum() / n as f32;
            let ss: f32 = values.iter().map(|v| (v - m) * (v - m)).sum();
            (ss / (n - 1) as f32).sqrt()
        }
    }
}

/// Positions of `values` within `mean ± (std·f_std + eps)`.
fn robust_keep(quantity: &'static str, values: &[f32], f_std: f32, eps: f32) -> Result<Vec<usize>> {
    let m = mean(values);
    let s = sample_std(ArrayView1::from(values)) * f_std;
    let keep: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, &v)| v <= m + s + eps && v >= m - s - eps)
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() {
        return Err(RetrievalError::InsufficientCandidates {
            quantity,
            low: m - s,
            high: m + s,
        });
    }
    Ok(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn observation(b1: f32, b3: f32, b6: f32, b7: f32, refl_b1: f32, refl_b3: f32) -> Observation {
        Observation {
            b1,
            b3,
            b6,
            b7,
            refl_b3,
            ref_mean: (refl_b1 + refl_b3) / 2.0,
        }
    }

    fn reference(clear: f32, overcast: f32) -> CornerReference {
        CornerReference {
            clear: [clear; 4],
            overcast: [overcast; 3],
        }
    }

    #[test]
    fn test_classify_deviation() {
        let obs = observation(100.0, 100.0, 50.0, 100.0, 0.7, 0.7);
        assert_eq!(
            AtmosphericState::classify(&obs, &reference(100.0, 300.0)),
            AtmosphericState::Uncertain
        );
        // 25% away from clear sky on every band
        assert_eq!(
            AtmosphericState::classify(&obs, &reference(80.0, 300.0)),
            AtmosphericState::Cloud
        );
    }

    #[test]
    fn test_classify_overcast_overrides() {
        let obs = observation(290.0, 290.0, 50.0, 250.0, 0.5, 0.5);
        let r = CornerReference {
            clear: [100.0; 4],
            overcast: [300.0, 300.0, 260.0],
        };
        assert_eq!(AtmosphericState::classify(&obs, &r), AtmosphericState::Overcast);

        // too bright a surface for the overcast test
        let bright = observation(290.0, 290.0, 50.0, 250.0, 0.7, 0.7);
        assert_eq!(AtmosphericState::classify(&bright, &r), AtmosphericState::Cloud);
    }

    #[test]
    fn test_clear_state_is_unreachable() {
        let levels = [0.0, 1e-3, 0.5, 1.0, 10.0, 100.0, 1000.0, f32::NAN, f32::INFINITY];
        let refl = [0.0, 0.2, 0.59, 0.6, 0.9];
        for &o in &levels {
            for &c in &levels {
                for &oc in &levels {
                    for &r in &refl {
                        let obs = observation(o, o * 0.9, o, o * 1.1, r, r);
                        let state = AtmosphericState::classify(&obs, &reference(c, oc));
                        assert_ne!(state, AtmosphericState::Clear);
                    }
                }
            }
        }
    }

    #[test]
    fn test_robust_keep_excludes_outlier() {
        let mut pool = vec![100.0, 101.0, 99.0, 100.5, 99.5, 100.2, 99.8, 100.1, 99.9];
        pool.push(400.0);
        let keep = robust_keep("SWDR", &pool, 1.0, FLUX_EPS).unwrap();
        assert!(!keep.contains(&9));
        assert_eq!(keep.len(), 9);
        assert_relative_eq!(mean_at(&pool, &keep), 100.0, epsilon = 1e-4);
    }

    #[test]
    fn test_robust_keep_single_candidate() {
        assert_eq!(robust_keep("PAR", &[42.0], 1.0, FLUX_EPS).unwrap(), vec![0]);
    }

    #[test]
    fn test_robust_keep_empty_pool_fails() {
        let err = robust_keep("UVA", &[], 1.0, UV_EPS).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::InsufficientCandidates { quantity: "UVA", .. }
        ));
    }

    #[test]
    fn test_rank_nan_last() {
        let v = [0.5, f32::NAN, 0.9, 0.1];
        assert_eq!(rank(&v, true), vec![2, 0, 3, 1]);
        assert_eq!(rank(&v, false), vec![3, 0, 2, 1]);
    }

    #[test]
    fn test_rank_is_stable() {
        let v = [1.0, 0.0, 1.0, 0.0];
        assert_eq!(rank(&v, false), vec![1, 3, 0, 2]);
        assert_eq!(rank(&v, true), vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_intersect_sorted_unique() {
        assert_eq!(intersect(&[9, 3, 5, 3, 1], &[1, 5, 9, 7]), vec![1, 5, 9]);
    }

    #[test]
    fn test_filter_by_depth_grows_pool() {
        // ranking 0..6; only rows 4 and 5 have depth in range
        let primary: Vec<usize> = (0..6).collect();
        let cod = [80.0, 90.0, 70.0, 65.0, 10.0, 20.0];
        let pool = filter_by_depth(&primary, primary[..3].to_vec(), 3, &cod, |c| (0.0..=60.0).contains(&c));
        assert_eq!(pool, vec![4, 5]);
    }

    #[test]
    fn test_filter_by_depth_exhausted_pool() {
        let primary: Vec<usize> = (0..4).collect();
        let cod = [80.0, 5.0, 70.0, -1.0];
        // only one row in range, so the whole ranking is consumed
        let pool = filter_by_depth(&primary, primary[..2].to_vec(), 2, &cod, |c| c <= 60.0 && c >= 0.0);
        assert_eq!(pool, vec![0, 1, 2]);
    }

    /// Candidate table from `[b1, b3, b6, b7]` rows.
    fn candidates(sims: &[[f32; 4]], cod: &[f32]) -> CornerCandidates {
        let band = |i: usize| sims.iter().map(|s| s[i]).collect::<Vec<f32>>();
        CornerCandidates {
            rows: (0..sims.len()).collect(),
            sim_b1: band(0),
            sim_b3: band(1),
            sim_b6: band(2),
            sim_b7: band(3),
            cod: cod.to_vec(),
            reference: reference(100.0, 300.0),
        }
    }

    #[test]
    fn test_select_dark_scene_uses_band3_pool_for_totals() {
        let table = candidates(
            &[
                [100.0, 58.0, 30.0, 20.0],
                [105.0, 53.0, 30.0, 21.0],
                [40.0, 60.0, 30.0, 60.0],
                [100.0, 50.0, 30.0, 20.0],
                [30.0, 49.0, 30.0, 70.0],
            ],
            &[5.0, 5.0, 5.0, 90.0, 5.0],
        );
        // row 3 matches best but is too thick, so the ranking grows to rows 1 and 0
        let dark = observation(100.0, 50.0, 30.0, 20.0, 0.2, 0.2);
        let pools = table.select(&dark, AtmosphericState::Cloud, 2);
        assert_eq!(pools.direct, vec![1, 0]);
        assert_eq!(pools.total, vec![4]);

        let bright = observation(100.0, 50.0, 30.0, 20.0, 0.5, 0.5);
        let pools = table.select(&bright, AtmosphericState::Cloud, 2);
        assert_eq!(pools.total, vec![1, 0]);
        assert_eq!(pools.direct, pools.total);
    }

    #[test]
    fn test_select_cloud_band_switch() {
        let table = candidates(
            &[
                [100.0, 50.0, 30.0, 20.0],
                [100.0, 50.0, 90.0, 20.0],
                [300.0, 50.0, 30.0, 20.0],
                [100.0, 52.0, 31.0, 21.0],
            ],
            &[5.0; 4],
        );
        // refl_b3 inside [0.65, 0.82) ranks on bands 3, 6, 7
        let switched = observation(100.0, 50.0, 30.0, 20.0, 0.5, 0.7);
        let pools = table.select(&switched, AtmosphericState::Cloud, 2);
        assert_eq!(pools.direct, vec![0, 2]);
        assert_eq!(pools.total, vec![0, 2]);

        let plain = observation(100.0, 50.0, 30.0, 20.0, 0.5, 0.5);
        assert_eq!(table.select(&plain, AtmosphericState::Cloud, 2).direct, vec![0, 1]);

        // upper edge is exclusive
        let edge = observation(100.0, 50.0, 30.0, 20.0, 0.5, 0.82);
        assert_eq!(table.select(&edge, AtmosphericState::Cloud, 2).direct, vec![0, 1]);
    }

    #[test]
    fn test_select_overcast_ranks_cloud_bands() {
        let table = candidates(
            &[
                [100.0, 50.0, 30.0, 20.0],
                [100.0, 50.0, 90.0, 20.0],
                [300.0, 50.0, 30.0, 20.0],
                [100.0, 52.0, 31.0, 21.0],
            ],
            &[5.0; 4],
        );
        // dark, but overcast never takes the band-3 pool
        let obs = observation(100.0, 50.0, 30.0, 20.0, 0.2, 0.2);
        let pools = table.select(&obs, AtmosphericState::Overcast, 2);
        assert_eq!(pools.direct, vec![0, 2]);
        assert_eq!(pools.total, vec![0, 2]);
    }

    #[test]
    fn test_select_large_intersection_replaces_distance_pool() {
        let table = candidates(
            &[
                [100.0, 60.0, 30.0, 20.0],
                [100.0, 54.0, 30.0, 20.0],
                [100.0, 53.0, 30.0, 20.0],
                [100.0, 52.0, 30.0, 20.0],
                [100.0, 51.0, 30.0, 20.0],
                [100.0, 50.0, 30.0, 20.0],
                [20.0, 70.0, 30.0, 90.0],
                [20.0, 55.0, 30.0, 90.0],
            ],
            &[5.0; 8],
        );
        let obs = observation(100.0, 50.0, 30.0, 20.0, 0.2, 0.2);
        let pools = table.select(&obs, AtmosphericState::Cloud, 6);
        assert_eq!(pools.direct, vec![5, 4, 3, 2, 1, 0]);
        // five common rows, sorted; row 7 from the band-3 pool is dropped
        assert_eq!(pools.total, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_select_clear_exhausted_falls_back_to_ranking() {
        let table = candidates(
            &[
                [100.0, 50.0, 30.0, 20.0],
                [100.0, 70.0, 30.0, 20.0],
                [150.0, 50.0, 30.0, 20.0],
                [110.0, 50.0, 30.0, 22.0],
            ],
            &[3.0, 5.0, 2.0, 8.0],
        );
        // no row is thin enough, so every non-negative depth is kept in distance order
        let obs = observation(100.0, 50.0, 30.0, 20.0, 0.5, 0.5);
        let pools = table.select(&obs, AtmosphericState::Clear, 2);
        assert_eq!(pools.direct, vec![0, 3, 1, 2]);
        assert_eq!(pools.total, pools.direct);
    }

    #[test]
    fn test_log_cosine_identical_shape() {
        let obs = [100.0, 50.0, 20.0];
        assert_relative_eq!(log_cosine(obs, obs), 1.0, epsilon = 1e-5);
        // flat observation has no spectral shape
        assert_eq!(log_cosine(obs, [30.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn test_sample_std() {
        let v = ndarray::array![2.0f32, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(sample_std(v.view()), 2.138_089_9, epsilon = 1e-5);
        assert_eq!(sample_std(ndarray::array![3.0f32].view()), 0.0);
    }
}
