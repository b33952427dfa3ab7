use crate::core::resample::{resample_to_grid, ResampleMethod};
use crate::types::{is_valid_sample, RasterTile, SarError, SarReal, SarResult};
use chrono::NaiveDateTime;
use ndarray::{Array2, Array3, ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};

/// How co-located samples of one group are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    #[default]
    Median,
    Mean,
    /// Earliest valid acquisition
    First,
    /// Latest valid acquisition
    Last,
}

impl std::fmt::Display for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reducer::Median => write!(f, "median"),
            Reducer::Mean => write!(f, "mean"),
            Reducer::First => write!(f, "first"),
            Reducer::Last => write!(f, "last"),
        }
    }
}

/// Compositing parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositeParams {
    pub reducer: Reducer,
    /// Used for tiles not on the group's reference grid
    pub resample: ResampleMethod,
}

/// Group reduced to one raster, with provenance
#[derive(Debug, Clone)]
pub struct CompositeRaster {
    pub tile: RasterTile,
    pub contributing: usize,
    pub reducer: Reducer,
}

/// Median of a slice, averaging the two central values for even lengths
pub fn median_in_place(values: &mut [SarReal]) -> Option<SarReal> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Reduce one pixel's time series; `lane` is ordered by acquisition
pub fn reduce_lane(lane: ArrayView1<SarReal>, nodata: SarReal, reducer: Reducer) -> SarReal {
    let mut valid = lane.iter().copied().filter(|&v| is_valid_sample(v, nodata));
    match reducer {
        Reducer::First => valid.next().unwrap_or(nodata),
        Reducer::Last => valid.last().unwrap_or(nodata),
        Reducer::Mean => {
            let (sum, count) = valid.fold((0.0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
            if count == 0 {
                nodata
            } else {
                (sum / count as f64) as SarReal
            }
        }
        Reducer::Median => {
            let mut values: Vec<SarReal> = valid.collect();
            median_in_place(&mut values).unwrap_or(nodata)
        }
    }
}

/// Scene Compositor: reduces same-period (and same-track) rasters into one
pub struct SceneCompositor {
    params: CompositeParams,
}

impl SceneCompositor {
    pub fn new() -> Self {
        Self {
            params: CompositeParams::default(),
        }
    }

    pub fn with_params(params: CompositeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CompositeParams {
        &self.params
    }

    /// Composite a group of timestamped tiles
    ///
    /// Tiles are ordered by timestamp before reduction, so the result never
    /// depends on list order. All tiles are brought onto the earliest tile's grid.
    pub fn composite(&self, mut tiles: Vec<(NaiveDateTime, RasterTile)>) -> SarResult<CompositeRaster> {
        if tiles.is_empty() {
            return Err(SarError::EmptyInput("group has no tiles to composite".to_string()));
        }

        let reducer = self.params.reducer;
        tiles.sort_by_key(|(acquired, _)| *acquired);

        if tiles.len() == 1 {
            log::debug!("Single-tile group, copying through");
            let (_, tile) = tiles.remove(0);
            return Ok(CompositeRaster { tile, contributing: 1, reducer });
        }

        log::info!("🧩 Creating {} composite from {} scenes", reducer, tiles.len());

        let reference = tiles[0].1.grid.clone();
        let nodata = tiles[0].1.nodata;
        let (height, width) = (reference.height, reference.width);
        let mut layers = Array3::from_elem((tiles.len(), height, width), nodata);

        for (k, (acquired, tile)) in tiles.iter().enumerate() {
            let aligned;
            let tile = if tile.grid.matches(&reference) {
                tile
            } else {
                log::debug!("Resampling scene acquired {} onto reference grid", acquired);
                aligned = resample_to_grid(tile, &reference, self.params.resample)?;
                &aligned
            };

            // Translate each tile's own nodata into the composite's
            let mut layer = layers.index_axis_mut(Axis(0), k);
            Zip::from(&mut layer).and(&tile.data).for_each(|out, &v| {
                if is_valid_sample(v, tile.nodata) {
                    *out = v;
                }
            });
        }

        let mut data = Array2::from_elem((height, width), nodata);

        #[cfg(feature = "parallel")]
        Zip::from(&mut data)
            .and(layers.lanes(Axis(0)))
            .par_for_each(|out, lane| *out = reduce_lane(lane, nodata, reducer));
        #[cfg(not(feature = "parallel"))]
        Zip::from(&mut data)
            .and(layers.lanes(Axis(0)))
            .for_each(|out, lane| *out = reduce_lane(lane, nodata, reducer));

        let tile = RasterTile::new(reference, nodata, data)?;
        log::debug!("Composite has {} valid pixels", tile.valid_count());

        Ok(CompositeRaster {
            tile,
            contributing: tiles.len(),
            reducer,
        })
    }
}

impl Default for SceneCompositor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, RasterGrid, DEFAULT_NODATA};
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(22, 45, 12)
            .unwrap()
    }

    fn grid() -> RasterGrid {
        RasterGrid::new(GeoTransform::north_up(0.0, 30.0, 10.0, 10.0), 3, 3, "EPSG:32749")
    }

    fn constant(value: f32) -> RasterTile {
        RasterTile::new(grid(), DEFAULT_NODATA, Array2::from_elem((3, 3), value)).unwrap()
    }

    fn compositor(reducer: Reducer) -> SceneCompositor {
        SceneCompositor::with_params(CompositeParams {
            reducer,
            ..Default::default()
        })
    }

    #[test]
    fn test_empty_group_is_an_error() {
        let err = SceneCompositor::new().composite(Vec::new()).unwrap_err();
        assert!(matches!(err, SarError::EmptyInput(_)));
    }

    #[test]
    fn test_single_tile_is_identity() {
        let mut tile = constant(-12.0);
        tile.data[[1, 1]] = DEFAULT_NODATA;
        let out = compositor(Reducer::Mean)
            .composite(vec![(at(3), tile.clone())])
            .unwrap();
        assert_eq!(out.contributing, 1);
        assert_eq!(out.tile.data, tile.data);
    }

    #[test]
    fn test_mean_and_median_ignore_invalid_samples() {
        let mut a = constant(-10.0);
        a.data[[0, 0]] = f32::NAN;
        let b = constant(-20.0);
        let mut c = constant(-12.0);
        c.data[[0, 0]] = DEFAULT_NODATA;

        let tiles = vec![(at(3), a), (at(5), b), (at(9), c)];
        let mean = compositor(Reducer::Mean).composite(tiles.clone()).unwrap();
        assert_abs_diff_eq!(mean.tile.data[[0, 0]], -20.0);
        assert_abs_diff_eq!(mean.tile.data[[2, 2]], -14.0, epsilon = 1e-5);
        assert_eq!(mean.contributing, 3);

        let median = compositor(Reducer::Median).composite(tiles).unwrap();
        assert_abs_diff_eq!(median.tile.data[[2, 2]], -12.0);
    }

    #[test]
    fn test_all_nodata_input_stays_nodata() {
        let tiles = vec![
            (at(3), constant(DEFAULT_NODATA)),
            (at(4), constant(f32::NEG_INFINITY)),
        ];
        for reducer in [Reducer::Mean, Reducer::Median, Reducer::First, Reducer::Last] {
            let out = compositor(reducer).composite(tiles.clone()).unwrap();
            assert!(out.tile.is_empty());
        }
    }

    #[test]
    fn test_mean_median_are_order_independent() {
        let forward = vec![(at(3), constant(-9.0)), (at(5), constant(-11.0)), (at(7), constant(-16.0))];
        let mut backward = forward.clone();
        backward.reverse();

        for reducer in [Reducer::Mean, Reducer::Median] {
            let a = compositor(reducer).composite(forward.clone()).unwrap();
            let b = compositor(reducer).composite(backward.clone()).unwrap();
            assert_eq!(a.tile.data, b.tile.data);
        }
    }

    #[test]
    fn test_first_last_follow_timestamps_not_list_order() {
        let mut early = constant(-5.0);
        early.data[[1, 1]] = DEFAULT_NODATA;
        let late = constant(-15.0);
        let tiles = vec![(at(11), late), (at(2), early)];

        let first = compositor(Reducer::First).composite(tiles.clone()).unwrap();
        assert_eq!(first.tile.data[[0, 0]], -5.0);
        // Falls through to the next acquisition where the earliest is invalid
        assert_eq!(first.tile.data[[1, 1]], -15.0);

        let last = compositor(Reducer::Last).composite(tiles).unwrap();
        assert_eq!(last.tile.data[[0, 0]], -15.0);
    }

    #[test]
    fn test_off_grid_tiles_are_resampled_onto_earliest() {
        let shifted = RasterTile::new(
            RasterGrid::new(GeoTransform::north_up(10.0, 30.0, 10.0, 10.0), 3, 3, "EPSG:32749"),
            DEFAULT_NODATA,
            Array2::from_elem((3, 3), -30.0),
        )
        .unwrap();
        let tiles = vec![(at(3), constant(-10.0)), (at(8), shifted)];
        let out = compositor(Reducer::Mean).composite(tiles).unwrap();

        assert_eq!(out.tile.grid, grid());
        assert_abs_diff_eq!(out.tile.data[[0, 0]], -10.0);
        assert_abs_diff_eq!(out.tile.data[[0, 1]], -20.0);
    }

    #[test]
    fn test_median_even_count() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(median_in_place(&mut values), Some(2.5));
        assert_eq!(median_in_place(&mut []), None);
    }
}
