//! Surface downward shortwave (SWDR), PAR, UVA and UVB retrieval by
//! look-up-table inversion of satellite top-of-atmosphere radiances.

pub mod batch;
pub mod bracket;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod flux;
pub mod interpolator;
pub mod lut;
pub mod raster;
mod reference;
pub mod scene;

#[cfg(feature = "python")]
mod python;

pub use error::{Result, RetrievalError};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn swdr_retrieval(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    register_retrieval_module(py_module)?;
    py_module.add("__doc__", "SWDR/PAR/UV LUT-inversion retrieval implemented in Rust.")?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_retrieval_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "retrieval")?;
    submodule.add("__doc__", "Angle brackets and scene retrieval.")?;
    submodule.add_function(wrap_pyfunction!(python::resolve_bracket, &submodule)?)?;
    submodule.add_class::<python::Retriever>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}
