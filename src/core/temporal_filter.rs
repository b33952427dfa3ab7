use crate::core::stack::{BandSink, BandSource};
use crate::types::{is_valid_sample, SarError, SarReal, SarResult};
use ndarray::{Array2, Array3, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Smoothing weights as configured; normalised when the filter is built
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SmoothingParams {
    pub weight_current: f32,
    pub weight_previous: f32,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            weight_current: 0.5,
            weight_previous: 0.5,
        }
    }
}

impl SmoothingParams {
    pub fn filter(&self) -> SarResult<HeikinAshiFilter> {
        HeikinAshiFilter::new(self.weight_current, self.weight_previous)
    }
}

/// Heikin-Ashi style recursive smoothing along the time axis
///
/// `HA[t] = w_current * v[t] + w_previous * HA[t-1]`, seeded with the first
/// valid sample. Invalid samples pass through and leave the running value
/// untouched, so a gap does not restart the series.
#[derive(Debug, Clone, Copy)]
pub struct HeikinAshiFilter {
    w_current: f32,
    w_previous: f32,
}

impl HeikinAshiFilter {
    /// Weights are normalised to sum to one
    pub fn new(weight_current: f32, weight_previous: f32) -> SarResult<Self> {
        let total = weight_current + weight_previous;
        if weight_current < 0.0 || weight_previous < 0.0 || !total.is_finite() || total <= 0.0 {
            return Err(SarError::Config(format!(
                "Smoothing weights must be non-negative with a positive sum, got {} and {}",
                weight_current, weight_previous
            )));
        }
        Ok(Self {
            w_current: weight_current / total,
            w_previous: weight_previous / total,
        })
    }

    pub fn weights(&self) -> (f32, f32) {
        (self.w_current, self.w_previous)
    }

    #[inline]
    fn step(&self, state: &mut SarReal, value: SarReal, nodata: SarReal) -> SarReal {
        if !is_valid_sample(value, nodata) {
            return value;
        }
        *state = if is_valid_sample(*state, nodata) {
            self.w_current * value + self.w_previous * *state
        } else {
            value
        };
        *state
    }

    fn smooth_lane(&self, mut lane: ArrayViewMut1<SarReal>, nodata: SarReal) {
        let mut state = nodata;
        for v in lane.iter_mut() {
            *v = self.step(&mut state, *v, nodata);
        }
    }

    /// Smooth one series ordered oldest to newest
    pub fn smooth_series(&self, series: &[SarReal], nodata: SarReal) -> Vec<SarReal> {
        let mut state = nodata;
        series
            .iter()
            .map(|&v| self.step(&mut state, v, nodata))
            .collect()
    }

    /// Smooth a (bands, rows, cols) cube in place, pixel by pixel
    pub fn smooth_stack(&self, stack: &mut Array3<SarReal>, nodata: SarReal) {
        let lanes = stack.lanes_mut(Axis(0));

        #[cfg(feature = "parallel")]
        Zip::from(lanes).par_for_each(|lane| self.smooth_lane(lane, nodata));
        #[cfg(not(feature = "parallel"))]
        Zip::from(lanes).for_each(|lane| self.smooth_lane(lane, nodata));
    }

    /// Smooth one band per label from `input` into `output`, holding one band of state
    pub fn smooth_bands(
        &self,
        input: &dyn BandSource,
        output: &mut dyn BandSink,
        labels: &[String],
        nodata: SarReal,
    ) -> SarResult<()> {
        log::info!(
            "〰️ Heikin-Ashi smoothing of {} bands (w_current={:.3}, w_previous={:.3})",
            labels.len(),
            self.w_current,
            self.w_previous
        );

        let mut state: Option<Array2<SarReal>> = None;
        for (k, label) in labels.iter().enumerate() {
            let band = k + 1;
            let mut data = input.read_band(band)?;
            let running = state.get_or_insert_with(|| Array2::from_elem(data.dim(), nodata));
            if running.dim() != data.dim() {
                return Err(SarError::InvalidFormat(format!(
                    "Band {} is {:?}, expected {:?}",
                    band,
                    data.dim(),
                    running.dim()
                )));
            }

            Zip::from(&mut data)
                .and(running)
                .for_each(|v, s| *v = self.step(s, *v, nodata));
            output.write_band(band, &data, label)?;
        }
        Ok(())
    }
}

impl Default for HeikinAshiFilter {
    fn default() -> Self {
        Self {
            w_current: 0.5,
            w_previous: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stack::MemoryBandSink;
    use crate::types::{GeoTransform, RasterGrid, DEFAULT_NODATA};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_recursive_average() {
        let filter = HeikinAshiFilter::default();
        let out = filter.smooth_series(&[-10.0, -20.0, -20.0], DEFAULT_NODATA);
        assert_eq!(out, vec![-10.0, -15.0, -17.5]);
    }

    #[test]
    fn test_weights_are_normalised() {
        let filter = HeikinAshiFilter::new(3.0, 1.0).unwrap();
        let (wc, wp) = filter.weights();
        assert_abs_diff_eq!(wc, 0.75);
        assert_abs_diff_eq!(wp, 0.25);
        assert!(HeikinAshiFilter::new(0.0, 0.0).is_err());
        assert!(HeikinAshiFilter::new(-1.0, 2.0).is_err());
        assert_eq!(SmoothingParams::default().filter().unwrap().weights(), (0.5, 0.5));
    }

    #[test]
    fn test_gaps_pass_through_without_reset() {
        let filter = HeikinAshiFilter::default();
        let n = DEFAULT_NODATA;
        let out = filter.smooth_series(&[n, -8.0, n, -12.0, f32::NAN], n);
        assert_eq!(out[0], n);
        assert_eq!(out[1], -8.0);
        assert_eq!(out[2], n);
        assert_abs_diff_eq!(out[3], -10.0);
        assert!(out[4].is_nan());
    }

    #[test]
    fn test_stack_matches_series() {
        let filter = HeikinAshiFilter::default();
        let n = DEFAULT_NODATA;
        let series = [-6.0, n, -10.0, -14.0];
        let mut stack = Array3::from_elem((4, 2, 2), n);
        for (t, v) in series.iter().enumerate() {
            stack[[t, 0, 1]] = *v;
        }
        filter.smooth_stack(&mut stack, n);

        let expected = filter.smooth_series(&series, n);
        for t in 0..4 {
            assert_eq!(stack[[t, 0, 1]], expected[t]);
            // All-nodata pixel is unchanged
            assert_eq!(stack[[t, 1, 1]], n);
        }
    }

    #[test]
    fn test_band_streaming_matches_cube() {
        let filter = HeikinAshiFilter::new(0.6, 0.4).unwrap();
        let grid = RasterGrid::new(GeoTransform::north_up(0.0, 2.0, 1.0, 1.0), 2, 2, "EPSG:4326");
        let mut input = MemoryBandSink::new(grid.clone(), DEFAULT_NODATA, 3);
        let mut cube = Array3::from_elem((3, 2, 2), DEFAULT_NODATA);
        let labels: Vec<String> = (1..=3).map(|b| format!("P{:02}", b)).collect();
        for band in 1..=3 {
            let mut data = Array2::from_elem((2, 2), -(band as f32) * 3.0);
            data[[1, 0]] = if band == 2 { DEFAULT_NODATA } else { -1.0 };
            cube.index_axis_mut(Axis(0), band - 1).assign(&data);
            input.write_band(band, &data, &labels[band - 1]).unwrap();
        }

        let mut output = MemoryBandSink::new(grid, DEFAULT_NODATA, 3);
        filter.smooth_bands(&input, &mut output, &labels, DEFAULT_NODATA).unwrap();
        filter.smooth_stack(&mut cube, DEFAULT_NODATA);

        for band in 0..3 {
            assert_eq!(output.bands[band], cube.index_axis(Axis(0), band));
            assert_eq!(output.labels[band], labels[band]);
        }
    }
}
