//! LUT store: the flattened radiative-transfer table and its grid layout.
//!
//! The text table has one header line and 40 whitespace-separated columns per
//! row. Parsing a full table takes a while, so a binary sidecar `<stem>.bin`
//! is written next to it after the first successful load. The sidecar is
//! rebuilt whenever it is older than the text table or its shape disagrees
//! with the configured grid.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::error::{Result, RetrievalError};

/// Number of columns in every LUT row.
pub const LUT_COLS: usize = 40;

const CACHE_MAGIC: &[u8; 8] = b"SWDRLUT1";

/// Column triple of a band (or TOA-albedo) closed-form model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandColumns {
    pub i0: usize,
    pub rho: usize,
    pub complex: usize,
}

/// Column quadruple of a surface flux model; `f0 = direct + diffuse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FluxColumns {
    pub direct: usize,
    pub diffuse: usize,
    pub rho: usize,
    pub complex: usize,
}

pub const COD: usize = 4;
pub const BAND1: BandColumns = BandColumns { i0: 5, rho: 6, complex: 7 };
pub const BAND3: BandColumns = BandColumns { i0: 8, rho: 9, complex: 10 };
pub const BAND4: BandColumns = BandColumns { i0: 11, rho: 12, complex: 13 };
pub const BAND6: BandColumns = BandColumns { i0: 14, rho: 15, complex: 16 };
pub const BAND7: BandColumns = BandColumns { i0: 17, rho: 18, complex: 19 };
pub const SWDR: FluxColumns = FluxColumns { direct: 20, diffuse: 21, rho: 22, complex: 23 };
pub const PAR: FluxColumns = FluxColumns { direct: 24, diffuse: 25, rho: 26, complex: 27 };
pub const UVA: FluxColumns = FluxColumns { direct: 28, diffuse: 29, rho: 30, complex: 31 };
pub const UVB: FluxColumns = FluxColumns { direct: 32, diffuse: 33, rho: 34, complex: 35 };
pub const TOA_ALBEDO: BandColumns = BandColumns { i0: 36, rho: 37, complex: 38 };
pub const TOA_DOWN_FLUX: usize = 39;

/// Angle/elevation grids of the table and the row span of each dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct LutLayout {
    pub sza: Vec<f32>,
    pub vza: Vec<f32>,
    pub los: Vec<f32>,
    pub dem: Vec<f32>,
    pub inner_rows: usize,
    pub dem_span: usize,
    pub los_span: usize,
    pub vza_span: usize,
    pub sza_span: usize,
}

impl LutLayout {
    pub fn new(sza: Vec<f32>, vza: Vec<f32>, los: Vec<f32>, dem: Vec<f32>, inner_rows: usize) -> Self {
        let dem_span = inner_rows;
        let los_span = dem.len() * dem_span;
        let vza_span = los.len() * los_span;
        let sza_span = vza.len() * vza_span;
        Self {
            sza,
            vza,
            los,
            dem,
            inner_rows,
            dem_span,
            los_span,
            vza_span,
            sza_span,
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(
            config.sza_list.clone(),
            config.vza_list.clone(),
            config.los_list.clone(),
            config.dem_list.clone(),
            config.calibration().inner_rows,
        )
    }

    /// Row count the table must have for this grid.
    pub fn rows(&self) -> usize {
        self.sza.len() * self.sza_span
    }

    /// First row of the (sza, vza, los, dem) cell.
    pub fn block_start(&self, sza: usize, vza: usize, los: usize, dem: usize) -> usize {
        sza * self.sza_span + vza * self.vza_span + los * self.los_span + dem * self.dem_span
    }
}

/// Immutable LUT, shared read-only across scene workers.
#[derive(Debug, Clone)]
pub struct LutTable {
    data: Array2<f32>,
    layout: LutLayout,
}

impl LutTable {
    /// Wrap an in-memory table, checking the row/column invariants.
    pub fn from_array(data: Array2<f32>, layout: LutLayout) -> Result<Self> {
        check_shape(Path::new("<memory>"), data.nrows(), data.ncols(), &layout)?;
        Ok(Self { data, layout })
    }

    /// Load from the text table, going through the binary sidecar when it is fresh.
    pub fn load(path: &Path, layout: LutLayout) -> Result<Self> {
        let cache = cache_path(path);
        if cache_is_fresh(path, &cache) {
            match read_cache(&cache) {
                Ok(data) if check_shape(&cache, data.nrows(), data.ncols(), &layout).is_ok() => {
                    info!("LUT loaded from cache {}", cache.display());
                    return Ok(Self { data, layout });
                }
                Ok(data) => warn!(
                    "LUT cache {} has shape {:?}, expected ({}, {}); rebuilding",
                    cache.display(),
                    data.dim(),
                    layout.rows(),
                    LUT_COLS
                ),
                Err(e) => warn!("ignoring unreadable LUT cache {}: {e}", cache.display()),
            }
        }

        let data = read_text(path)?;
        check_shape(path, data.nrows(), data.ncols(), &layout)?;
        info!("LUT loaded from {} ({} rows)", path.display(), data.nrows());

        if let Err(e) = write_cache(&cache, &data) {
            warn!("could not write LUT cache {}: {e}", cache.display());
        } else {
            debug!("LUT cache written to {}", cache.display());
        }
        Ok(Self { data, layout })
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn layout(&self) -> &LutLayout {
        &self.layout
    }
}

/// `<stem>.bin` next to the text table.
pub fn cache_path(path: &Path) -> PathBuf {
    path.with_extension("bin")
}

fn check_shape(path: &Path, rows: usize, cols: usize, layout: &LutLayout) -> Result<()> {
    if cols != LUT_COLS {
        return Err(RetrievalError::lut(
            path,
            format!("expected {LUT_COLS} columns, found {cols}"),
        ));
    }
    if rows != layout.rows() {
        return Err(RetrievalError::lut(
            path,
            format!(
                "expected {} rows ({} SZA x {} VZA x {} LOS x {} DEM x {}), found {rows}",
                layout.rows(),
                layout.sza.len(),
                layout.vza.len(),
                layout.los.len(),
                layout.dem.len(),
                layout.inner_rows
            ),
        ));
    }
    Ok(())
}

/// The cache is usable when it exists and the text source is absent or not newer.
fn cache_is_fresh(text: &Path, cache: &Path) -> bool {
    let Ok(cache_meta) = fs::metadata(cache) else {
        return false;
    };
    let Ok(text_meta) = fs::metadata(text) else {
        return true;
    };
    match (text_meta.modified(), cache_meta.modified()) {
        (Ok(t), Ok(c)) => c >= t,
        _ => false,
    }
}

fn read_text(path: &Path) -> Result<Array2<f32>> {
    let file = File::open(path).map_err(|e| RetrievalError::lut(path, format!("cannot open: {e}")))?;
    let reader = BufReader::new(file);

    let mut values: Vec<f32> = Vec::new();
    let mut rows = 0usize;
    // first line is a header
    for (lineno, line) in reader.lines().enumerate().skip(1) {
        let line = line.map_err(|e| RetrievalError::lut(path, format!("read failed: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let before = values.len();
        for token in line.split_whitespace() {
            let v: f32 = token.parse().map_err(|_| {
                RetrievalError::lut(
                    path,
                    format!("line {}: non-numeric token '{token}'", lineno + 1),
                )
            })?;
            values.push(v);
        }
        let count = values.len() - before;
        if count != LUT_COLS {
            return Err(RetrievalError::lut(
                path,
                format!("line {}: expected {LUT_COLS} values, found {count}", lineno + 1),
            ));
        }
        rows += 1;
    }

    Array2::from_shape_vec((rows, LUT_COLS), values)
        .map_err(|e| RetrievalError::lut(path, e.to_string()))
}

fn read_cache(path: &Path) -> Result<Array2<f32>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != CACHE_MAGIC {
        return Err(RetrievalError::LutFormat(format!("{}: not a LUT cache file", path.display())));
    }
    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let rows = u64::from_le_bytes(word) as usize;
    reader.read_exact(&mut word)?;
    let cols = u64::from_le_bytes(word) as usize;

    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| {
            RetrievalError::LutFormat(format!("{}: corrupt cache header {rows}x{cols}", path.display()))
        })?;

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() != expected {
        return Err(RetrievalError::LutFormat(format!(
            "{}: truncated cache, {} bytes for {rows}x{cols}",
            path.display(),
            bytes.len()
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec((rows, cols), values).map_err(|e| RetrievalError::lut(path, e.to_string()))
}

/// Write through a per-process temporary file so concurrent writers never
/// leave a half-written sidecar behind.
fn write_cache(path: &Path, data: &Array2<f32>) -> Result<()> {
    let tmp = path.with_extension(format!("bin.tmp{}", std::process::id()));
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(CACHE_MAGIC)?;
        writer.write_all(&(data.nrows() as u64).to_le_bytes())?;
        writer.write_all(&(data.ncols() as u64).to_le_bytes())?;
        for v in data.iter() {
            writer.write_all(&v.to_le_bytes())?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
