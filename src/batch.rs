//! Batch runner: every `.tif` scene of an input directory, sequentially or
//! one rayon task per scene.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::config::RetrievalConfig;
use crate::error::{Result, RetrievalError};
use crate::lut::LutTable;
use crate::scene::{process_scene_with, SceneRetriever};

/// Outcome counts of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Sorted `.tif` files (any case) directly inside `dir`.
pub fn collect_scenes(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut scenes: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("tif"))
        })
        .collect();
    scenes.sort();
    if scenes.is_empty() {
        return Err(RetrievalError::Config(format!(
            "no .tif scenes found in {}",
            dir.display()
        )));
    }
    Ok(scenes)
}

/// `<output_dir>/<stem>_all_elements.tif`
pub fn output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("scene");
    output_dir.join(format!("{stem}_all_elements.tif"))
}

/// Process every scene of `input_dir` into `output_dir`.
///
/// Setup problems (no scenes, calibration mismatch, thread pool) are returned
/// as errors; a failing scene is logged and counted and the run goes on.
pub fn run_batch(input_dir: &Path, output_dir: &Path, lut: &LutTable, config: &RetrievalConfig) -> Result<BatchSummary> {
    let retriever = SceneRetriever::new(lut, config)?;
    run_scenes(&retriever, input_dir, output_dir, config.cpu_core_num)
}

pub(crate) fn run_scenes(
    retriever: &SceneRetriever,
    input_dir: &Path,
    output_dir: &Path,
    cpu_core_num: usize,
) -> Result<BatchSummary> {
    let timer = Instant::now();
    let scenes = collect_scenes(input_dir)?;
    info!("{} scenes to process", scenes.len());

    let run_one = |input: &PathBuf| -> bool {
        let output = output_path(input, output_dir);
        if output.exists() {
            info!("removing existing {}", output.display());
            if let Err(e) = fs::remove_file(&output) {
                warn!("could not remove {}: {e}", output.display());
            }
        }
        match process_scene_with(retriever, input, &output) {
            Ok(_) => true,
            Err(e) => {
                error!("{} failed: {e}", input.display());
                false
            }
        }
    };

    let outcomes: Vec<bool> = if cpu_core_num == 0 {
        scenes.iter().map(run_one).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cpu_core_num)
            .build()
            .map_err(|e| RetrievalError::Config(format!("cannot start worker pool: {e}")))?;
        pool.install(|| scenes.par_iter().map(run_one).collect())
    };

    let failed = outcomes.iter().filter(|ok| !**ok).count();
    let summary = BatchSummary {
        processed: outcomes.len() - failed,
        failed,
    };
    info!(
        "batch done: {} processed, {} failed in {:.2}s",
        summary.processed,
        summary.failed,
        timer.elapsed().as_secs_f64()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::tests::small_calibration;
    use crate::scene::tests::{synthetic_lut, test_config, write_scene};
    use tempfile::TempDir;

    // The synthetic LUT has 4 inner rows, so tests build the retriever with
    // the matching small calibration.
    fn run_with(input_dir: &Path, output_dir: &Path, cpu_core_num: usize) -> BatchSummary {
        let lut = synthetic_lut();
        let config = test_config(1, cpu_core_num);
        let retriever = SceneRetriever::with_calibration(&lut, &config, small_calibration()).unwrap();
        run_scenes(&retriever, input_dir, output_dir, cpu_core_num).unwrap()
    }

    fn read_outputs(input_dir: &Path, output_dir: &Path) -> Vec<u8> {
        collect_scenes(input_dir)
            .unwrap()
            .iter()
            .flat_map(|s| fs::read(output_path(s, output_dir)).unwrap())
            .collect()
    }

    #[test]
    fn test_collect_scenes_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["b.tif", "a.TIF", "c.tiff", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("d.tif")).unwrap();
        let scenes = collect_scenes(dir.path()).unwrap();
        let names: Vec<_> = scenes.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["a.TIF", "b.tif"]);
    }

    #[test]
    fn test_empty_input_dir_is_setup_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(collect_scenes(dir.path()), Err(RetrievalError::Config(_))));
    }

    #[test]
    fn test_output_path() {
        let out = output_path(Path::new("/in/FY3D_20200101.tif"), Path::new("/out"));
        assert_eq!(out, PathBuf::from("/out/FY3D_20200101_all_elements.tif"));
    }

    #[test]
    fn test_sequential_and_parallel_identical() {
        let input = TempDir::new().unwrap();
        write_scene(input.path(), "s1.tif", 0.0);
        write_scene(input.path(), "s2.tif", 0.5);
        write_scene(input.path(), "s3.tif", 1.0);

        let seq = TempDir::new().unwrap();
        let par = TempDir::new().unwrap();
        assert_eq!(run_with(input.path(), seq.path(), 0), BatchSummary { processed: 3, failed: 0 });
        assert_eq!(run_with(input.path(), par.path(), 3), BatchSummary { processed: 3, failed: 0 });
        let a = read_outputs(input.path(), seq.path());
        assert!(!a.is_empty());
        assert_eq!(a, read_outputs(input.path(), par.path()));
    }

    #[test]
    fn test_failed_scene_counted_and_run_continues() {
        let input = TempDir::new().unwrap();
        write_scene(input.path(), "good.tif", 0.5);
        fs::write(input.path().join("broken.tif"), b"not a tiff").unwrap();
        let output = TempDir::new().unwrap();
        // stale output is replaced
        fs::write(output.path().join("good_all_elements.tif"), b"old").unwrap();

        let summary = run_with(input.path(), output.path(), 0);
        assert_eq!(summary, BatchSummary { processed: 1, failed: 1 });
        assert_ne!(fs::read(output.path().join("good_all_elements.tif")).unwrap(), b"old");
    }

    #[test]
    fn test_calibration_mismatch_is_setup_error() {
        let input = TempDir::new().unwrap();
        write_scene(input.path(), "good.tif", 0.5);
        let output = TempDir::new().unwrap();
        let lut = synthetic_lut();
        assert!(run_batch(input.path(), output.path(), &lut, &test_config(0, 0)).is_err());
    }
}
