//! Angle bracket resolution against the sorted LUT grids.
//!
//! Two lookups with different matching rules live here:
//! [`resolve_bracket`] encloses an observed range with grid indices (clamping at
//! the grid ends), [`find_exact`] locates a grid value that must be present
//! verbatim (LOS bin centres and DEM bracket ends).

use ndarray::ArrayView1;
use ndarray_stats::QuantileExt;

use crate::error::{Result, RetrievalError};

/// Returns `(up_index, down_index)` enclosing `[observed_min, observed_max]`.
///
/// `up_index` is the first grid value `>= observed_max`, or the index of
/// `grid_max` when the observation is above the grid. `down_index` is the
/// last grid value `<= observed_min`, or the index of `grid_min` when below.
pub fn resolve_bracket(
    observed_min: f32,
    observed_max: f32,
    grid: &[f32],
    grid_min: f32,
    grid_max: f32,
) -> Result<(usize, usize)> {
    let up = if observed_max > grid_max {
        grid.iter().position(|&g| g == grid_max)
    } else {
        grid.iter().position(|&g| g >= observed_max)
    }
    .ok_or_else(|| {
        RetrievalError::AngleLookup(format!(
            "no grid value encloses maximum {observed_max} in {grid:?}"
        ))
    })?;

    let down = if observed_min < grid_min {
        grid.iter().position(|&g| g == grid_min)
    } else {
        grid.iter().rposition(|&g| g <= observed_min)
    }
    .ok_or_else(|| {
        RetrievalError::AngleLookup(format!(
            "no grid value encloses minimum {observed_min} in {grid:?}"
        ))
    })?;

    Ok((up, down))
}

/// Resolve against the grid's own extremes.
pub fn resolve_grid_bracket(observed_min: f32, observed_max: f32, grid: &[f32]) -> Result<(usize, usize)> {
    let (Some(&lo), Some(&hi)) = (grid.first(), grid.last()) else {
        return Err(RetrievalError::AngleLookup("empty grid".into()));
    };
    resolve_bracket(observed_min, observed_max, grid, lo, hi)
}

/// Index of the grid entry equal to `value`.
pub fn find_exact(grid: &[f32], value: f32) -> Result<usize> {
    grid.iter()
        .position(|&g| g == value)
        .ok_or_else(|| RetrievalError::AngleLookup(format!("{value} is not a grid value of {grid:?}")))
}

/// Relative-azimuth bin centred on `center`, clamped to [0, 180] degrees.
pub fn los_bin(center: f32, half_width: f32) -> (f32, f32) {
    ((center - half_width).max(0.0), (center + half_width).min(180.0))
}

/// Min and max ignoring NaN; `None` when nothing finite is left.
pub fn value_range(values: ArrayView1<f32>) -> Option<(f32, f32)> {
    let lo = *values.min_skipnan();
    let hi = *values.max_skipnan();
    (!lo.is_nan() && !hi.is_nan()).then_some((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn grid() -> Vec<f32> {
        (1..=8).map(|v| (v * 10) as f32).collect()
    }

    #[test]
    fn test_up_index_clamps_above_grid() {
        let g = grid();
        let (up, _) = resolve_grid_bracket(30.0, 85.0, &g).unwrap();
        assert_eq!(g[up], 80.0);
    }

    #[test]
    fn test_up_index_first_greater_or_equal() {
        let g = grid();
        let (up, _) = resolve_grid_bracket(30.0, 47.0, &g).unwrap();
        assert_eq!(g[up], 50.0);
        let (up, _) = resolve_grid_bracket(30.0, 50.0, &g).unwrap();
        assert_eq!(g[up], 50.0);
    }

    #[test]
    fn test_down_index_clamps_below_grid() {
        let g = grid();
        let (_, down) = resolve_grid_bracket(5.0, 60.0, &g).unwrap();
        assert_eq!(g[down], 10.0);
    }

    #[test]
    fn test_down_index_last_less_or_equal() {
        let g = grid();
        let (_, down) = resolve_grid_bracket(23.0, 60.0, &g).unwrap();
        assert_eq!(g[down], 20.0);
        let (_, down) = resolve_grid_bracket(20.0, 60.0, &g).unwrap();
        assert_eq!(g[down], 20.0);
    }

    #[test]
    fn test_nan_is_angle_lookup_error() {
        let g = grid();
        let err = resolve_grid_bracket(f32::NAN, f32::NAN, &g).unwrap_err();
        assert!(matches!(err, RetrievalError::AngleLookup(_)));
    }

    #[test]
    fn test_bounds_missing_from_grid() {
        // caller-supplied extremes that are not grid members
        let g = grid();
        assert!(resolve_bracket(30.0, 95.0, &g, 10.0, 90.0).is_err());
    }

    #[test]
    fn test_find_exact() {
        let dem = [0.0, 1.0, 2.0, 3.0, 4.0, 5.9];
        assert_eq!(find_exact(&dem, 5.9).unwrap(), 5);
        assert!(find_exact(&dem, 5.0).is_err());
    }

    #[test]
    fn test_los_bin_clamped() {
        assert_eq!(los_bin(0.0, 22.5), (0.0, 22.5));
        assert_eq!(los_bin(90.0, 22.5), (67.5, 112.5));
        assert_eq!(los_bin(180.0, 22.5), (157.5, 180.0));
    }

    #[test]
    fn test_value_range_skips_nan() {
        let v = array![f32::NAN, 12.0, 3.5, f32::NAN, 40.0];
        assert_eq!(value_range(v.view()), Some((3.5, 40.0)));
        let all_nan = array![f32::NAN, f32::NAN];
        assert_eq!(value_range(all_nan.view()), None);
    }
}
