//! Clear-sky and overcast reference radiances.
//!
//! Each DEM block of the bracket sub-LUT holds the full optical-depth inner
//! grid. A few fixed rows near zero optical depth stand in for clear sky and a
//! few rows at high optical depth for overcast; their simulated radiances are
//! averaged per pixel and broadcast over the whole block.

use ndarray::{Array2, ArrayView2, Axis};

use crate::config::SensorCalibration;

/// Broadcast reference tiles, same shape as the simulated-radiance tiles.
#[derive(Debug, Clone)]
pub(crate) struct ReferenceTiles {
    pub clear_b1: Array2<f32>,
    pub clear_b3: Array2<f32>,
    pub clear_b6: Array2<f32>,
    pub clear_b7: Array2<f32>,
    pub overcast_b1: Array2<f32>,
    pub overcast_b3: Array2<f32>,
    pub overcast_b7: Array2<f32>,
}

/// For each block, average `rows` (offsets relative to the block start) of
/// `sim` per column and write the mean to every row of the block.
pub(crate) fn broadcast_block_means(
    sim: ArrayView2<f32>,
    block_starts: &[usize],
    block_len: usize,
    rows: &[usize],
) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(sim.raw_dim());
    for &start in block_starts {
        let picked: Vec<usize> = rows.iter().map(|r| start + r).collect();
        let Some(mean) = sim.select(Axis(0), &picked).mean_axis(Axis(0)) else {
            continue;
        };
        let mut block = out.slice_mut(ndarray::s![start..start + block_len, ..]);
        block.assign(&mean.insert_axis(Axis(0)));
    }
    out
}

pub(crate) fn synthesize_references(
    sim_b1: ArrayView2<f32>,
    sim_b3: ArrayView2<f32>,
    sim_b6: ArrayView2<f32>,
    sim_b7: ArrayView2<f32>,
    block_starts: &[usize],
    cal: &SensorCalibration,
) -> ReferenceTiles {
    let clear = |sim: ArrayView2<f32>| broadcast_block_means(sim, block_starts, cal.inner_rows, &cal.clear_rows);
    let overcast = |sim: ArrayView2<f32>| broadcast_block_means(sim, block_starts, cal.inner_rows, &cal.overcast_rows);
    ReferenceTiles {
        clear_b1: clear(sim_b1),
        clear_b3: clear(sim_b3),
        clear_b6: clear(sim_b6),
        clear_b7: clear(sim_b7),
        overcast_b1: overcast(sim_b1),
        overcast_b3: overcast(sim_b3),
        overcast_b7: overcast(sim_b7),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_block_means_broadcast() {
        // 2 blocks of 4 rows, 2 pixel columns; row value = row index, col 1 doubled
        let sim = Array2::from_shape_fn((8, 2), |(r, c)| (r as f32) * (c as f32 + 1.0));
        let out = broadcast_block_means(sim.view(), &[0, 4], 4, &[1, 2]);

        for r in 0..4 {
            assert_relative_eq!(out[[r, 0]], 1.5);
            assert_relative_eq!(out[[r, 1]], 3.0);
        }
        for r in 4..8 {
            assert_relative_eq!(out[[r, 0]], 5.5);
            assert_relative_eq!(out[[r, 1]], 11.0);
        }
    }

    #[test]
    fn test_synthesize_uses_calibration_rows() {
        let mut cal = SensorCalibration::for_sensor(crate::config::Sensor::Fy3d);
        cal.inner_rows = 4;
        cal.clear_rows = vec![0];
        cal.overcast_rows = vec![2, 3];
        let sim = Array2::from_shape_fn((4, 1), |(r, _)| 10.0 * (r as f32 + 1.0));
        let refs = synthesize_references(sim.view(), sim.view(), sim.view(), sim.view(), &[0], &cal);
        assert_eq!(refs.clear_b6[[3, 0]], 10.0);
        assert_eq!(refs.overcast_b7[[0, 0]], 35.0);
    }
}
