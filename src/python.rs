//! Python bindings.

use std::path::PathBuf;

use ndarray::{Array3, Axis};
use numpy::{IntoPyArray, PyArray3, PyReadonlyArray3};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::bracket;
use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use crate::lut::{LutLayout, LutTable};
use crate::scene::{SceneInputs, SceneRetriever};

fn to_py_err(e: RetrievalError) -> PyErr {
    match e {
        RetrievalError::Config(_) | RetrievalError::AngleLookup(_) | RetrievalError::Raster { .. } => {
            PyValueError::new_err(e.to_string())
        }
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Grid indices `(up, down)` enclosing `[observed_min, observed_max]`.
#[pyfunction]
pub fn resolve_bracket(
    observed_min: f32,
    observed_max: f32,
    grid: Vec<f32>,
    grid_min: f32,
    grid_max: f32,
) -> PyResult<(usize, usize)> {
    bracket::resolve_bracket(observed_min, observed_max, &grid, grid_min, grid_max).map_err(to_py_err)
}

/// LUT-inversion retriever; the table is loaded once at construction.
#[pyclass]
pub struct Retriever {
    lut: LutTable,
    config: RetrievalConfig,
}

#[pymethods]
impl Retriever {
    #[new]
    pub fn new(py: Python<'_>, cfg_path: PathBuf) -> PyResult<Self> {
        py.allow_threads(|| -> Result<Self, RetrievalError> {
            let config = RetrievalConfig::from_file(&cfg_path)?;
            let lut = LutTable::load(&config.lut_file, LutLayout::from_config(&config))?;
            Ok(Self { lut, config })
        })
        .map_err(to_py_err)
    }

    /// Retrieve the unscaled flux fields of one scene.
    ///
    /// `bands` holds the 21 raw input bands as `(band, row, col)`. Returns
    /// `(8, row, col)`: SWDR, SWDR direct, PAR, PAR direct, UVA, UVB, TOA
    /// upwelling flux and rho; not-computed pixels are -1.
    pub fn retrieve<'py>(&self, py: Python<'py>, bands: PyReadonlyArray3<'py, f32>) -> PyResult<Bound<'py, PyArray3<f32>>> {
        let bands = bands.as_array().to_owned();
        let out = py
            .allow_threads(|| -> Result<Array3<f32>, RetrievalError> {
                let retriever = SceneRetriever::new(&self.lut, &self.config)?;
                let scene = SceneInputs::from_bands(bands.view(), retriever.calibration())?;
                let result = retriever.retrieve(&scene)?;

                let mut out = Array3::<f32>::zeros((8, scene.rows, scene.cols));
                for (k, field) in result.fluxes.fields().into_iter().enumerate() {
                    let grid = field
                        .view()
                        .into_shape_with_order((scene.rows, scene.cols))
                        .map_err(|e| RetrievalError::raster("", e))?;
                    out.index_axis_mut(Axis(0), k).assign(&grid);
                }
                Ok(out)
            })
            .map_err(to_py_err)?;
        Ok(out.into_pyarray(py))
    }
}
