//! Run configuration and per-sensor calibration.
//!
//! The configuration file is a flat `key=value` list with `#` comments:
//!
//! ```text
//! lut_file     = lut/swdr_fy3d.txt
//! toa_avg_num  = 15
//! f_std        = 1.0
//! sza_list     = 0,10,20,30,40,50,60,70,80,85,88,89
//! dem_list     = 0,1,2,3,4,5.9
//! ```
//!
//! Keys are case-insensitive. Unknown keys are rejected so that typos do not
//! silently fall back to defaults. Any [`SensorCalibration`] constant can be
//! overridden by its own key (`clear_rows = 72,73,74`, `snow_b4_threshold =
//! 0.11`, ...) on top of the defaults of the selected `sensor`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, RetrievalError};

/// What to do when the robust average of a pixel's candidate pool is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateFailurePolicy {
    /// Fail the whole scene
    #[default]
    AbortScene,
    /// Drop the current DEM bracket's results and keep iterating
    SkipBatch,
    /// Mark only the failing pixel as not computed
    SkipPixel,
}

impl CandidateFailurePolicy {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "abort_scene" => Ok(Self::AbortScene),
            "skip_batch" => Ok(Self::SkipBatch),
            "skip_pixel" => Ok(Self::SkipPixel),
            other => Err(RetrievalError::Config(format!(
                "candidate_failure must be abort_scene, skip_batch or skip_pixel, got '{other}'"
            ))),
        }
    }
}

/// Satellite instrument the LUT and input rasters were produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sensor {
    #[default]
    Fy3d,
    Modis,
}

impl Sensor {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fy3d" | "fy-3d" => Ok(Self::Fy3d),
            "modis" => Ok(Self::Modis),
            other => Err(RetrievalError::Config(format!(
                "unknown sensor '{other}' (expected fy3d or modis)"
            ))),
        }
    }
}

/// Thresholds of the dark-surface test that routes pixels to the no-snow regime.
#[derive(Debug, Clone, PartialEq)]
pub struct SnowTest {
    pub b1_divisor: f32,
    pub b1_threshold: f32,
    pub b2_divisor: f32,
    pub b2_threshold: f32,
    pub b4_divisor: f32,
    pub b4_threshold: f32,
    /// Band-3 reflectance at or below which a pixel is treated as dark
    pub refl3_threshold: f32,
}

/// Sensor-specific constants that are not derived from data.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCalibration {
    /// LUT rows per DEM grid value (optical depth x visibility inner grid)
    pub inner_rows: usize,
    /// Row offsets inside a DEM block averaged for the clear-sky reference
    pub clear_rows: Vec<usize>,
    /// Row offsets inside a DEM block averaged for the overcast reference
    pub overcast_rows: Vec<usize>,
    /// Snow index divisors for radiance bands 4 and 6
    pub ndsi_b4_divisor: f32,
    pub ndsi_b6_divisor: f32,
    pub snow_test: SnowTest,
    /// Half width of a relative-azimuth bin, degrees
    pub los_half_width: f32,
    /// Earth radius over orbit-shell radius for the VZA curvature correction
    pub radius_ratio: f32,
    pub angle_scale: f32,
    pub dem_scale: f32,
    /// Input raster slot holding radiance bands 1..=7
    pub radiance_slots: [usize; 7],
    pub radiance_scale: [f32; 7],
    pub reflectance_scale: f32,
    pub albedo_scale: f32,
}

impl SensorCalibration {
    pub fn for_sensor(sensor: Sensor) -> Self {
        let (clear_rows, overcast_rows, radiance_slots) = match sensor {
            Sensor::Fy3d => ((72..=77).collect(), vec![243, 257, 271], [7, 8, 5, 6, 9, 10, 11]),
            Sensor::Modis => ((36..=41).collect(), vec![207, 221, 235], [5, 6, 7, 8, 9, 10, 11]),
        };
        Self {
            inner_rows: 360,
            clear_rows,
            overcast_rows,
            ndsi_b4_divisor: 593.84,
            ndsi_b6_divisor: 76.53,
            snow_test: SnowTest {
                b1_divisor: 511.72,
                b1_threshold: 0.1,
                b2_divisor: 315.69,
                b2_threshold: 0.1,
                b4_divisor: 593.84,
                b4_threshold: 0.11,
                refl3_threshold: 0.3,
            },
            los_half_width: 22.5,
            radius_ratio: 6371.0 / 6471.0,
            angle_scale: 100.0,
            dem_scale: 1000.0,
            radiance_slots,
            radiance_scale: [10.0, 10.0, 10.0, 10.0, 100.0, 100.0, 500.0],
            reflectance_scale: 1000.0,
            albedo_scale: 1000.0,
        }
    }

    /// Override one constant from a config `key=value` entry.
    fn apply_override(&mut self, key: &str, value: &str) -> Result<()> {
        let t = &mut self.snow_test;
        match key {
            "inner_rows" => self.inner_rows = parse_scalar(key, value)?,
            "clear_rows" => self.clear_rows = parse_list(key, value)?,
            "overcast_rows" => self.overcast_rows = parse_list(key, value)?,
            "ndsi_b4_divisor" => self.ndsi_b4_divisor = parse_scalar(key, value)?,
            "ndsi_b6_divisor" => self.ndsi_b6_divisor = parse_scalar(key, value)?,
            "snow_b1_divisor" => t.b1_divisor = parse_scalar(key, value)?,
            "snow_b1_threshold" => t.b1_threshold = parse_scalar(key, value)?,
            "snow_b2_divisor" => t.b2_divisor = parse_scalar(key, value)?,
            "snow_b2_threshold" => t.b2_threshold = parse_scalar(key, value)?,
            "snow_b4_divisor" => t.b4_divisor = parse_scalar(key, value)?,
            "snow_b4_threshold" => t.b4_threshold = parse_scalar(key, value)?,
            "snow_refl3_threshold" => t.refl3_threshold = parse_scalar(key, value)?,
            "los_half_width" => self.los_half_width = parse_scalar(key, value)?,
            "radius_ratio" => self.radius_ratio = parse_scalar(key, value)?,
            "angle_scale" => self.angle_scale = parse_scalar(key, value)?,
            "dem_scale" => self.dem_scale = parse_scalar(key, value)?,
            "radiance_slots" => self.radiance_slots = parse_array(key, value)?,
            "radiance_scale" => self.radiance_scale = parse_array(key, value)?,
            "reflectance_scale" => self.reflectance_scale = parse_scalar(key, value)?,
            "albedo_scale" => self.albedo_scale = parse_scalar(key, value)?,
            _ => {
                return Err(RetrievalError::Config(format!(
                    "unknown key '{key}' -> '{value}'"
                )))
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.inner_rows == 0 {
            return Err(RetrievalError::Config("inner_rows must be at least 1".into()));
        }
        for (key, rows) in [("clear_rows", &self.clear_rows), ("overcast_rows", &self.overcast_rows)] {
            if rows.is_empty() {
                return Err(RetrievalError::Config(format!("'{key}' is empty")));
            }
            if let Some(r) = rows.iter().find(|&&r| r >= self.inner_rows) {
                return Err(RetrievalError::Config(format!(
                    "'{key}' row {r} is outside the {} rows of a DEM block",
                    self.inner_rows
                )));
            }
        }
        if let Some(slot) = self.radiance_slots.iter().find(|&&s| s >= 12) {
            return Err(RetrievalError::Config(format!(
                "radiance slot {slot} is not a radiance band of the input scene"
            )));
        }
        Ok(())
    }

    /// Snow index of a band-4 / band-6 radiance pair.
    #[inline]
    pub fn snow_index(&self, b4: f32, b6: f32) -> f32 {
        let a = b4 / self.ndsi_b4_divisor;
        let b = b6 / self.ndsi_b6_divisor;
        (a - b) / (a + b)
    }
}

/// Parsed retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub lut_file: PathBuf,
    /// Number of LUT neighbours averaged per pixel
    pub toa_avg_num: usize,
    pub ref_range: f32,
    pub ref_bin_num: usize,
    /// Outlier rejection width in standard deviations
    pub f_std: f32,
    /// Smoothing half-width in pixels, 0 disables
    pub window: usize,
    /// Worker threads for per-scene parallelism, 0 runs sequentially
    pub cpu_core_num: usize,
    pub sza_list: Vec<f32>,
    pub vza_list: Vec<f32>,
    pub los_list: Vec<f32>,
    pub dem_list: Vec<f32>,
    pub candidate_failure: CandidateFailurePolicy,
    pub sensor: Sensor,
    /// Sensor defaults with any per-key overrides from the file applied
    pub calibration: SensorCalibration,
}

impl RetrievalConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            RetrievalError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&text, base)
    }

    /// Parse config text; a relative `lut_file` resolves against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let mut lut_file = None;
        let mut toa_avg_num = 15;
        let mut ref_range = 0.25;
        let mut ref_bin_num = 5;
        let mut f_std = 1.0;
        let mut window = 0;
        let mut cpu_core_num = 0;
        let mut sza_list = None;
        let mut vza_list = None;
        let mut los_list = None;
        let mut dem_list = None;
        let mut candidate_failure = CandidateFailurePolicy::default();
        let mut sensor = Sensor::default();
        let mut overrides: Vec<(String, String)> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split('=');
            let (key, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(k), Some(v), None) => (k.trim().to_ascii_lowercase(), v.trim()),
                _ => {
                    return Err(RetrievalError::Config(format!(
                        "line {}: expected key=value, got '{line}'",
                        lineno + 1
                    )))
                }
            };

            match key.as_str() {
                "lut_file" => lut_file = Some(base_dir.join(value)),
                "toa_avg_num" => toa_avg_num = parse_scalar(&key, value)?,
                "ref_range" => ref_range = parse_scalar(&key, value)?,
                "ref_bin_num" => ref_bin_num = parse_scalar(&key, value)?,
                "f_std" => f_std = parse_scalar(&key, value)?,
                "window" => window = parse_non_negative(&key, value)?,
                "cpu_core_num" => cpu_core_num = parse_non_negative(&key, value)?,
                "sza_list" => sza_list = Some(parse_list(&key, value)?),
                "vza_list" => vza_list = Some(parse_list(&key, value)?),
                "los_list" => los_list = Some(parse_list(&key, value)?),
                "dem_list" => dem_list = Some(parse_list(&key, value)?),
                "candidate_failure" => candidate_failure = CandidateFailurePolicy::parse(value)?,
                "sensor" => sensor = Sensor::parse(value)?,
                _ => overrides.push((key, value.to_string())),
            }
        }

        if toa_avg_num == 0 {
            return Err(RetrievalError::Config("toa_avg_num must be at least 1".into()));
        }
        if !(f_std >= 0.0 && f32::is_finite(f_std)) {
            return Err(RetrievalError::Config(format!(
                "f_std must be a finite non-negative number, got {f_std}"
            )));
        }

        let mut calibration = SensorCalibration::for_sensor(sensor);
        for (key, value) in &overrides {
            calibration.apply_override(key, value)?;
        }
        calibration.validate()?;

        let config = Self {
            lut_file: lut_file
                .ok_or_else(|| RetrievalError::Config("missing key 'lut_file'".into()))?,
            toa_avg_num,
            ref_range,
            ref_bin_num,
            f_std,
            window,
            cpu_core_num,
            sza_list: require_grid("sza_list", sza_list)?,
            vza_list: require_grid("vza_list", vza_list)?,
            los_list: require_grid("los_list", los_list)?,
            dem_list: require_grid("dem_list", dem_list)?,
            candidate_failure,
            sensor,
            calibration,
        };
        if config.dem_list.len() < 2 {
            return Err(RetrievalError::Config(
                "dem_list needs at least two values to form a bracket".into(),
            ));
        }
        Ok(config)
    }

    pub fn calibration(&self) -> SensorCalibration {
        self.calibration.clone()
    }

    pub fn log_summary(&self) {
        info!("LUT file     : {}", self.lut_file.display());
        info!("toa_avg_num  : {}", self.toa_avg_num);
        info!("ref_range    : {}", self.ref_range);
        info!("ref_bin_num  : {}", self.ref_bin_num);
        info!("f_std        : {}", self.f_std);
        info!("SZA list     : {:?}", self.sza_list);
        info!("VZA list     : {:?}", self.vza_list);
        info!("DEM list     : {:?}", self.dem_list);
        info!("LOS list     : {:?}", self.los_list);
        info!("sensor       : {:?}", self.sensor);
        info!("inner rows   : {}", self.calibration.inner_rows);
        info!("clear rows   : {:?}", self.calibration.clear_rows);
        info!("overcast rows: {:?}", self.calibration.overcast_rows);
        info!("on failure   : {:?}", self.candidate_failure);
        if self.window == 0 {
            info!("window       : 0 (no smoothing)");
        } else {
            let side = self.window * 2 + 1;
            info!("window       : {} ({side}x{side} smoothing)", self.window);
        }
        if self.cpu_core_num == 0 {
            info!("CPU number   : 0 (sequential run)");
        } else {
            info!("CPU number   : {} (parallel run)", self.cpu_core_num);
        }
    }
}

fn parse_scalar<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| RetrievalError::Config(format!("invalid value for '{key}': '{value}'")))
}

fn parse_non_negative(key: &str, value: &str) -> Result<usize> {
    let v: i64 = parse_scalar(key, value)?;
    usize::try_from(v)
        .map_err(|_| RetrievalError::Config(format!("'{key}' cannot be negative, got {v}")))
}

fn parse_list<T: std::str::FromStr>(key: &str, value: &str) -> Result<Vec<T>> {
    value
        .split(',')
        .map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return Err(RetrievalError::Config(format!(
                    "empty item in '{key}': '{value}'"
                )));
            }
            parse_scalar(key, item)
        })
        .collect()
}

fn parse_array<T: std::str::FromStr, const N: usize>(key: &str, value: &str) -> Result<[T; N]> {
    let items: Vec<T> = parse_list(key, value)?;
    let n = items.len();
    items
        .try_into()
        .map_err(|_| RetrievalError::Config(format!("'{key}' needs {N} values, got {n}")))
}

fn require_grid(key: &str, list: Option<Vec<f32>>) -> Result<Vec<f32>> {
    let list = list.ok_or_else(|| RetrievalError::Config(format!("missing key '{key}'")))?;
    if list.is_empty() {
        return Err(RetrievalError::Config(format!("'{key}' is empty")));
    }
    if list.windows(2).any(|w| w[0] >= w[1]) {
        return Err(RetrievalError::Config(format!(
            "'{key}' must be strictly ascending: {list:?}"
        )));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# retrieval settings
LUT_File = lut/table.txt
toa_avg_num = 12
f_std=1.5
window = 1
cpu_core_num = 4
sza_list = 0, 10, 20
vza_list = 0,30
los_list = 0,45,90,135,180
dem_list = 0,1,2,3,4,5.9
";

    #[test]
    fn test_parse_sample() {
        let cfg = RetrievalConfig::parse(SAMPLE, Path::new("/data")).unwrap();
        assert_eq!(cfg.lut_file, PathBuf::from("/data/lut/table.txt"));
        assert_eq!(cfg.toa_avg_num, 12);
        assert_eq!(cfg.f_std, 1.5);
        assert_eq!(cfg.window, 1);
        assert_eq!(cfg.cpu_core_num, 4);
        assert_eq!(cfg.sza_list, vec![0.0, 10.0, 20.0]);
        assert_eq!(cfg.dem_list.last(), Some(&5.9));
        // untouched keys keep their defaults
        assert_eq!(cfg.ref_bin_num, 5);
        assert_eq!(cfg.candidate_failure, CandidateFailurePolicy::AbortScene);
        assert_eq!(cfg.sensor, Sensor::Fy3d);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let text = format!("{SAMPLE}colour = blue\n");
        let err = RetrievalConfig::parse(&text, Path::new("")).unwrap_err();
        assert!(matches!(err, RetrievalError::Config(msg) if msg.contains("colour")));
    }

    #[test]
    fn test_empty_list_item_rejected() {
        let text = SAMPLE.replace("vza_list = 0,30", "vza_list = 0,,30");
        assert!(RetrievalConfig::parse(&text, Path::new("")).is_err());
    }

    #[test]
    fn test_negative_window_rejected() {
        let text = SAMPLE.replace("window = 1", "window = -2");
        assert!(RetrievalConfig::parse(&text, Path::new("")).is_err());
    }

    #[test]
    fn test_missing_lut_file() {
        let text = SAMPLE.replace("LUT_File = lut/table.txt", "");
        let err = RetrievalConfig::parse(&text, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("lut_file"));
    }

    #[test]
    fn test_unsorted_grid_rejected() {
        let text = SAMPLE.replace("sza_list = 0, 10, 20", "sza_list = 10, 0, 20");
        assert!(RetrievalConfig::parse(&text, Path::new("")).is_err());
    }

    #[test]
    fn test_policy_and_sensor_keys() {
        let text = format!("{SAMPLE}candidate_failure = skip_pixel\nsensor = MODIS\n");
        let cfg = RetrievalConfig::parse(&text, Path::new("")).unwrap();
        assert_eq!(cfg.candidate_failure, CandidateFailurePolicy::SkipPixel);
        let cal = cfg.calibration();
        assert_eq!(cal.clear_rows, vec![36, 37, 38, 39, 40, 41]);
        assert_eq!(cal.radiance_slots, [5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_fy3d_calibration() {
        let cal = SensorCalibration::for_sensor(Sensor::Fy3d);
        assert_eq!(cal.clear_rows.first(), Some(&72));
        assert_eq!(cal.clear_rows.last(), Some(&77));
        assert_eq!(cal.overcast_rows, vec![243, 257, 271]);
        assert_eq!(cal.radiance_slots[0], 7);
        assert_eq!(cal.radiance_slots[2], 5);
    }

    #[test]
    fn test_negative_f_std_rejected() {
        let text = SAMPLE.replace("f_std=1.5", "f_std=-0.5");
        let err = RetrievalConfig::parse(&text, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("f_std"));
        let text = SAMPLE.replace("f_std=1.5", "f_std=NaN");
        assert!(RetrievalConfig::parse(&text, Path::new("")).is_err());
    }

    #[test]
    fn test_calibration_overrides() {
        let text = format!(
            "{SAMPLE}sensor = modis\ninner_rows = 120\nclear_rows = 3,4\novercast_rows = 100\n\
             snow_refl3_threshold = 0.25\nradiance_scale = 1,1,1,1,1,1,2\n"
        );
        let cal = RetrievalConfig::parse(&text, Path::new("")).unwrap().calibration();
        assert_eq!(cal.inner_rows, 120);
        assert_eq!(cal.clear_rows, vec![3, 4]);
        assert_eq!(cal.overcast_rows, vec![100]);
        assert_eq!(cal.snow_test.refl3_threshold, 0.25);
        assert_eq!(cal.radiance_scale[6], 2.0);
        // untouched constants keep the sensor defaults
        assert_eq!(cal.radiance_slots, [5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(cal.snow_test.b1_divisor, 511.72);
    }

    #[test]
    fn test_invalid_calibration_overrides() {
        let rows_outside = format!("{SAMPLE}inner_rows = 100\n");
        let err = RetrievalConfig::parse(&rows_outside, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("overcast_rows"));

        let short = format!("{SAMPLE}radiance_slots = 1,2,3\n");
        let err = RetrievalConfig::parse(&short, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("7 values"));

        let bad_slot = format!("{SAMPLE}radiance_slots = 7,8,5,6,9,10,19\n");
        assert!(RetrievalConfig::parse(&bad_slot, Path::new("")).is_err());
    }
}
