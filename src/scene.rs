//! Scene orchestration.
//!
//! Walks the SZA → VZA → LOS → DEM brackets of a scene, splits every
//! bracket's pixels into spectral regimes, runs the batch evaluator on each
//! regime and scatters the results back into the scene (last write wins).

use std::path::Path;
use std::time::Instant;

use ndarray::{concatenate, Array1, Array2, Array3, ArrayView3, Axis};
use tracing::{debug, info, warn};

use crate::bracket::{find_exact, los_bin, resolve_grid_bracket, value_range};
use crate::config::{CandidateFailurePolicy, RetrievalConfig, SensorCalibration};
use crate::error::{Result, RetrievalError};
use crate::evaluator::{evaluate_batch, BracketContext, InversionSettings, PixelBatch, SnowWindow};
use crate::flux::{FluxFields, NODATA};
use crate::lut::LutTable;
use crate::raster::{self, OUTPUT_BANDS};

/// Bands of an input scene.
pub const INPUT_BANDS: usize = 21;

/// Brackets with fewer pixels are skipped.
const MIN_PIXELS: usize = 5;

const SNOW_BINS: usize = 90;

const DARK_WINDOW: SnowWindow = SnowWindow { max: 1.0, min: -1.0 };
const NO_SNOW_WINDOW: SnowWindow = SnowWindow { max: 0.1, min: -1.0 };

/// Spectral regime that picks the snow-index window of a pixel's batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceRegime {
    /// Any visible or band-4 radiance, or band-3 reflectance, at or under its threshold
    Dark,
    /// Bright and snow index under 0.1
    NoSnow,
    /// Bright snow, in 0.01-wide index bins from 0.1
    Snow(usize),
}

impl SurfaceRegime {
    /// Route one pixel; `None` when a comparison is undecided (NaN) or the
    /// snow index lies past the last bin.
    pub fn classify(cal: &SensorCalibration, b1: f32, b2: f32, b4: f32, b6: f32, refl_b3: f32) -> Option<Self> {
        let snow = &cal.snow_test;
        let (t1, t2, t4) = (b1 / snow.b1_divisor, b2 / snow.b2_divisor, b4 / snow.b4_divisor);
        if t1 <= snow.b1_threshold
            || t2 <= snow.b2_threshold
            || t4 <= snow.b4_threshold
            || refl_b3 <= snow.refl3_threshold
        {
            return Some(Self::Dark);
        }
        let bright = t1 > snow.b1_threshold
            && t2 > snow.b2_threshold
            && t4 > snow.b4_threshold
            && refl_b3 > snow.refl3_threshold;
        if !bright {
            return None;
        }
        let ndsi = cal.snow_index(b4, b6);
        if ndsi < 0.1 {
            return Some(Self::NoSnow);
        }
        (0..SNOW_BINS)
            .find(|&bin| {
                let (lo, hi) = snow_bin_edges(bin);
                ndsi >= lo && ndsi < hi
            })
            .map(Self::Snow)
    }

    pub fn window(self) -> SnowWindow {
        match self {
            Self::Dark => DARK_WINDOW,
            Self::NoSnow => NO_SNOW_WINDOW,
            Self::Snow(bin) => {
                let (lo, hi) = snow_bin_edges(bin);
                // max is the bin's lower edge and min its upper edge
                SnowWindow { max: lo, min: hi }
            }
        }
    }
}

fn snow_bin_edges(bin: usize) -> (f32, f32) {
    ((bin as f64 * 0.01 + 0.1) as f32, (bin as f64 * 0.01 + 0.11) as f32)
}

/// Per-pixel scene inputs in physical units, flattened row-major.
#[derive(Debug, Clone)]
pub struct SceneInputs {
    pub rows: usize,
    pub cols: usize,
    pub flag: Array1<f32>,
    pub los: Array1<f32>,
    pub rad_b2: Array1<f32>,
    /// Every pixel of the scene; `vza` is already curvature-corrected
    pub pixels: PixelBatch,
}

impl SceneInputs {
    /// Scale the raw `(bands, rows, cols)` samples of a scene.
    pub fn from_bands(bands: ArrayView3<f32>, cal: &SensorCalibration) -> Result<Self> {
        let (n_bands, rows, cols) = bands.dim();
        if n_bands != INPUT_BANDS {
            return Err(RetrievalError::raster(
                "",
                format!("scene has {n_bands} bands, expected {INPUT_BANDS}"),
            ));
        }

        let band = |k: usize, scale: f32| -> Array1<f32> {
            bands.index_axis(Axis(0), k).iter().map(|&v| v / scale).collect()
        };
        let radiance = |b: usize| band(cal.radiance_slots[b], cal.radiance_scale[b]);
        let reflectance = |b: usize| band(12 + b, cal.reflectance_scale);

        let ratio = cal.radius_ratio;
        let vza = band(2, cal.angle_scale).mapv(|v| (v.to_radians().sin() * ratio).asin().to_degrees());

        Ok(Self {
            rows,
            cols,
            flag: band(0, 1.0),
            los: band(3, cal.angle_scale),
            rad_b2: radiance(1),
            pixels: PixelBatch {
                dem: band(4, cal.dem_scale),
                sza: band(1, cal.angle_scale),
                vza,
                rad_b1: radiance(0),
                rad_b3: radiance(2),
                rad_b4: radiance(3),
                rad_b6: radiance(5),
                rad_b7: radiance(6),
                refl_b1: reflectance(0),
                refl_b3: reflectance(2),
                refl_b4: reflectance(3),
                refl_b6: reflectance(5),
                refl_b7: reflectance(6),
                sw_albedo: band(19, cal.albedo_scale),
                vis_albedo: band(20, cal.albedo_scale),
            },
        })
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Retrieved fields of a scene, flattened row-major.
#[derive(Debug, Clone)]
pub struct SceneFluxes {
    pub fluxes: FluxFields,
    /// Pixels dropped by the `SkipPixel` policy
    pub failed_pixels: usize,
}

/// Runs the bracket iteration of a scene against a shared LUT.
pub struct SceneRetriever<'a> {
    lut: &'a LutTable,
    cal: SensorCalibration,
    settings: InversionSettings,
    window: usize,
}

impl<'a> SceneRetriever<'a> {
    pub fn new(lut: &'a LutTable, config: &RetrievalConfig) -> Result<Self> {
        Self::with_calibration(lut, config, config.calibration())
    }

    pub fn with_calibration(lut: &'a LutTable, config: &RetrievalConfig, cal: SensorCalibration) -> Result<Self> {
        if lut.layout().inner_rows != cal.inner_rows {
            return Err(RetrievalError::Config(format!(
                "LUT has {} rows per DEM value, calibration expects {}",
                lut.layout().inner_rows,
                cal.inner_rows
            )));
        }
        Ok(Self {
            lut,
            cal,
            settings: InversionSettings {
                toa_avg_num: config.toa_avg_num,
                f_std: config.f_std,
                on_failure: config.candidate_failure,
            },
            window: config.window,
        })
    }

    pub fn calibration(&self) -> &SensorCalibration {
        &self.cal
    }

    /// Retrieve every bracket of the scene.
    pub fn retrieve(&self, scene: &SceneInputs) -> Result<SceneFluxes> {
        let grid = self.lut.layout();
        let px = &scene.pixels;
        let n = scene.len();

        let (sza_min, sza_max) = value_range(px.sza.view())
            .ok_or_else(|| RetrievalError::AngleLookup("scene has no finite SZA".into()))?;
        let (sza_up, sza_dw) = resolve_grid_bracket(sza_min, sza_max, &grid.sza)?;
        let (vza_min, vza_max) = value_range(px.vza.view())
            .ok_or_else(|| RetrievalError::AngleLookup("scene has no finite VZA".into()))?;
        let (vza_up, vza_dw) = resolve_grid_bracket(vza_min, vza_max, &grid.vza)?;
        debug!("SZA brackets {sza_dw}..{sza_up}, VZA brackets {vza_dw}..{vza_up}");

        let mut out = FluxFields::filled(n, NODATA);
        let mut failed_pixels = 0;

        for i in sza_dw..sza_up {
            let (s_dw, s_up) = (grid.sza[i], grid.sza[i + 1]);
            for j in vza_dw..vza_up {
                let (v_dw, v_up) = (grid.vza[j], grid.vza[j + 1]);
                let in_angles = |p: usize| {
                    scene.flag[p] == 1.0
                        && px.sza[p] >= s_dw
                        && px.sza[p] <= s_up
                        && px.vza[p] >= v_dw
                        && px.vza[p] <= v_up
                };
                if (0..n).filter(|&p| in_angles(p)).count() < MIN_PIXELS {
                    continue;
                }

                for &los_center in &grid.los {
                    let (los_lo, los_hi) = los_bin(los_center, self.cal.los_half_width);
                    let los_idx = find_exact(&grid.los, los_center)?;
                    let in_los = |p: usize| in_angles(p) && scene.los[p] >= los_lo && scene.los[p] <= los_hi;
                    if (0..n).filter(|&p| in_los(p)).count() < MIN_PIXELS {
                        continue;
                    }

                    for pair in grid.dem.windows(2) {
                        let (d_dw, d_up) = (pair[0], pair[1]);
                        let dem_up_idx = find_exact(&grid.dem, d_up)?;
                        let dem_dw_idx = find_exact(&grid.dem, d_dw)?;

                        let tile: Vec<usize> = (0..n)
                            .filter(|&p| {
                                in_los(p)
                                    && px.dem[p] >= d_dw
                                    && px.dem[p] <= d_up
                                    && px.rad_b6[p] > 0.0
                                    && px.rad_b7[p] > 0.0
                            })
                            .collect();
                        if tile.len() < MIN_PIXELS {
                            continue;
                        }

                        let ctx = BracketContext {
                            sza_dw: s_dw,
                            sza_up: s_up,
                            vza_dw: v_dw,
                            vza_up: v_up,
                            los: los_center,
                            dem_dw: d_dw,
                            dem_up: d_up,
                        };
                        let sub_lut = self.sub_lut(i, j, los_idx, dem_dw_idx, dem_up_idx)?;
                        match self.retrieve_bracket(&sub_lut, scene, &tile, ctx) {
                            Ok((fluxes, failed)) => {
                                out.scatter(&tile, &fluxes);
                                failed_pixels += failed;
                            }
                            Err(e @ RetrievalError::InsufficientCandidates { .. })
                                if self.settings.on_failure == CandidateFailurePolicy::SkipBatch =>
                            {
                                warn!("bracket {ctx:?} skipped: {e}");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        if failed_pixels > 0 {
            warn!("{failed_pixels} pixels had no usable LUT candidates");
        }
        Ok(SceneFluxes { fluxes: out, failed_pixels })
    }

    /// Eight corner blocks of the bracket, in evaluator order.
    fn sub_lut(&self, sza: usize, vza: usize, los: usize, dem_dw: usize, dem_up: usize) -> Result<Array2<f32>> {
        let layout = self.lut.layout();
        let len = layout.dem_span * (dem_up - dem_dw + 1);
        let lut = self.lut.view();
        let corners = [(sza, vza), (sza, vza + 1), (sza + 1, vza), (sza + 1, vza + 1)];
        let views: Vec<_> = corners
            .iter()
            .map(|&(s, v)| {
                let start = layout.block_start(s, v, los, dem_dw);
                lut.slice_move(ndarray::s![start..start + len, ..])
            })
            .collect();
        concatenate(Axis(0), &views).map_err(|e| RetrievalError::LutFormat(e.to_string()))
    }

    fn retrieve_bracket(
        &self,
        sub_lut: &Array2<f32>,
        scene: &SceneInputs,
        tile: &[usize],
        ctx: BracketContext,
    ) -> Result<(FluxFields, usize)> {
        let batch = scene.pixels.select(tile);
        let regimes: Vec<Option<SurfaceRegime>> = tile
            .iter()
            .enumerate()
            .map(|(p, &t)| {
                SurfaceRegime::classify(
                    &self.cal,
                    batch.rad_b1[p],
                    scene.rad_b2[t],
                    batch.rad_b4[p],
                    batch.rad_b6[p],
                    batch.refl_b3[p],
                )
            })
            .collect();
        let members = |regime: SurfaceRegime| -> Vec<usize> {
            (0..batch.len()).filter(|&p| regimes[p] == Some(regime)).collect()
        };

        let mut fluxes = FluxFields::filled(batch.len(), NODATA);
        let mut failed = 0;

        // ── Dark and bright snow-free surfaces ──────────────────────
        for regime in [SurfaceRegime::Dark, SurfaceRegime::NoSnow] {
            let idx = members(regime);
            if idx.is_empty() {
                continue;
            }
            let result =
                evaluate_batch(sub_lut.view(), &batch.select(&idx), ctx, regime.window(), &self.settings, &self.cal)?;
            fluxes.scatter(&idx, &result.fluxes);
            failed += result.failed_pixels.len();
        }

        // ── Snow, in 0.01-wide index bins ───────────────────────────
        for bin in 0..SNOW_BINS {
            let regime = SurfaceRegime::Snow(bin);
            let idx = members(regime);
            if idx.is_empty() {
                continue;
            }
            match evaluate_batch(sub_lut.view(), &batch.select(&idx), ctx, regime.window(), &self.settings, &self.cal) {
                Ok(result) => {
                    fluxes.scatter(&idx, &result.fluxes);
                    failed += result.failed_pixels.len();
                }
                Err(e @ RetrievalError::InsufficientCandidates { .. })
                    if self.settings.on_failure == CandidateFailurePolicy::SkipBatch =>
                {
                    debug!("snow bin {bin} skipped: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((fluxes, failed))
    }

    /// Smooth (when configured) and scale the retrieved fields to the output bands.
    pub fn encode(&self, scene: &SceneInputs, fluxes: &FluxFields) -> Array3<i16> {
        let grid = |v: &Array1<f32>| Array2::from_shape_fn((scene.rows, scene.cols), |(r, c)| v[r * scene.cols + c]);
        let smoothed = |v: &Array1<f32>| {
            let g = grid(v);
            if self.window > 0 {
                smooth(&g, self.window)
            } else {
                g
            }
        };

        let bands: [(Array2<f32>, f32); OUTPUT_BANDS] = [
            (smoothed(&fluxes.swdr), 10.0),
            (smoothed(&fluxes.swdr_direct), 10.0),
            (smoothed(&fluxes.par), 10.0),
            (smoothed(&fluxes.par_direct), 10.0),
            (smoothed(&fluxes.uva), 200.0),
            (smoothed(&fluxes.uvb), 1000.0),
            (smoothed(&fluxes.toa_up), 10.0),
            (smoothed(&fluxes.rho), 10000.0),
            (grid(&scene.pixels.sw_albedo), 10000.0),
            (grid(&scene.pixels.sza), 100.0),
        ];

        let mut out = Array3::<i16>::zeros((OUTPUT_BANDS, scene.rows, scene.cols));
        for (k, (field, scale)) in bands.iter().enumerate() {
            out.index_axis_mut(Axis(0), k)
                .zip_mut_with(field, |o, &v| *o = scale_to_i16(v, *scale));
        }
        out
    }
}

/// Scale to i16, truncating toward zero and saturating; not-computed and NaN become -1.
pub fn scale_to_i16(value: f32, scale: f32) -> i16 {
    if value.is_nan() || value == NODATA {
        -1
    } else {
        (value * scale) as i16
    }
}

/// `(2w+1)²` moving mean over valid (finite, non-negative) pixels; invalid
/// pixels are written as the nodata value.
pub fn smooth(field: &Array2<f32>, w: usize) -> Array2<f32> {
    let (rows, cols) = field.dim();
    let valid = |v: f32| v.is_finite() && v >= 0.0;
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        if !valid(field[[r, c]]) {
            return NODATA;
        }
        let (r0, r1) = (r.saturating_sub(w), (r + w + 1).min(rows));
        let (c0, c1) = (c.saturating_sub(w), (c + w + 1).min(cols));
        let (sum, count) = field
            .slice(ndarray::s![r0..r1, c0..c1])
            .iter()
            .filter(|&&v| valid(v))
            .fold((0.0f32, 0usize), |(s, n), &v| (s + v, n + 1));
        sum / count as f32
    })
}

/// Read, retrieve and write one scene.
pub fn process_scene(input: &Path, output: &Path, lut: &LutTable, config: &RetrievalConfig) -> Result<SceneFluxes> {
    let retriever = SceneRetriever::new(lut, config)?;
    process_scene_with(&retriever, input, output)
}

pub(crate) fn process_scene_with(retriever: &SceneRetriever, input: &Path, output: &Path) -> Result<SceneFluxes> {
    let timer = Instant::now();
    let raster = raster::read_raster(input)?;
    let scene = SceneInputs::from_bands(raster.bands.view(), retriever.calibration()).map_err(|e| match e {
        RetrievalError::Raster { reason, .. } => RetrievalError::raster(input, reason),
        other => other,
    })?;
    info!("{} read ({} x {})", input.display(), scene.rows, scene.cols);

    let result = retriever.retrieve(&scene)?;
    let bands = retriever.encode(&scene, &result.fluxes);
    raster::write_output(output, &bands, &raster.geo)?;

    info!(
        "{} -> {} in {:.2}s",
        input.display(),
        output.display(),
        timer.elapsed().as_secs_f64()
    );
    Ok(result)
}
