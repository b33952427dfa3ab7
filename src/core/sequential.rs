use crate::core::harmonize::{overlap_stats, HarmonizeMode, LinearCorrection};
use crate::core::mosaic::RasterSource;
use crate::core::processor::{ExternalProcessor, RetryPolicy};
use crate::core::resample::{resample_to_grid, ResampleMethod};
use crate::io::raster_io::RasterReader;
use crate::types::{is_valid_sample, GeoTransform, RasterGrid, RasterTile, SarError, SarResult};
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Order in which scenes join the growing mosaic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SceneOrdering {
    /// Western edge, ties broken by the northern edge
    #[default]
    WestToEast,
    NorthToSouth,
    AsGiven,
}

/// How the merge primitive resolves pixels valid in both inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapRule {
    #[default]
    MosaicWins,
    Average,
}

/// Sequential mosaicking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialParams {
    pub ordering: SceneOrdering,
    pub harmonize: HarmonizeMode,
    /// Overlaps with fewer jointly valid pixels are merged uncorrected
    pub min_overlap_pixels: usize,
    pub overlap_rule: OverlapRule,
    pub keep_intermediates: bool,
}

impl Default for SequentialParams {
    fn default() -> Self {
        Self {
            ordering: SceneOrdering::default(),
            harmonize: HarmonizeMode::default(),
            min_overlap_pixels: 100,
            overlap_rule: OverlapRule::default(),
            keep_intermediates: false,
        }
    }
}

/// Merges an already-harmonized raster into the current mosaic
pub trait MergePrimitive: Send + Sync {
    fn merge(&self, mosaic: &RasterTile, addition: &RasterTile) -> SarResult<RasterTile>;
}

/// In-process merge onto the union extent at the mosaic's pixel size
#[derive(Debug, Clone, Default)]
pub struct UnionMerge {
    pub rule: OverlapRule,
}

impl UnionMerge {
    pub fn new(rule: OverlapRule) -> Self {
        Self { rule }
    }

    /// Union grid snapped to the mosaic's pixel lattice
    fn union_grid(mosaic: &RasterGrid, addition: &RasterGrid) -> RasterGrid {
        let bounds = mosaic.bounds().union(&addition.bounds());
        let t = &mosaic.transform;
        let (pw, ph) = (t.pixel_width.abs(), t.pixel_height.abs());

        let steps_west = ((t.top_left_x - bounds.min_x) / pw - 1e-6).ceil().max(0.0);
        let steps_north = ((bounds.max_y - t.top_left_y) / ph - 1e-6).ceil().max(0.0);
        let x0 = t.top_left_x - steps_west * pw;
        let y0 = t.top_left_y + steps_north * ph;

        let width = ((bounds.max_x - x0) / pw - 1e-6).ceil().max(1.0) as usize;
        let height = ((y0 - bounds.min_y) / ph - 1e-6).ceil().max(1.0) as usize;

        RasterGrid::new(GeoTransform::north_up(x0, y0, pw, ph), width, height, mosaic.crs.clone())
    }
}

impl MergePrimitive for UnionMerge {
    fn merge(&self, mosaic: &RasterTile, addition: &RasterTile) -> SarResult<RasterTile> {
        if !mosaic.grid.same_crs(&addition.grid) {
            return Err(SarError::Processing(
                "cannot merge rasters in different CRSs".to_string(),
            ));
        }

        let grid = Self::union_grid(&mosaic.grid, &addition.grid);
        let base = resample_to_grid(mosaic, &grid, ResampleMethod::Nearest)?;
        let extra = resample_to_grid(addition, &grid, ResampleMethod::Nearest)?;
        let nodata = mosaic.nodata;

        let mut data = base.data;
        let rule = self.rule;
        Zip::from(&mut data).and(&extra.data).for_each(|out, &add| {
            if !is_valid_sample(add, addition.nodata) {
                return;
            }
            if !is_valid_sample(*out, nodata) {
                *out = add;
            } else if rule == OverlapRule::Average {
                *out = (*out + add) / 2.0;
            }
        });

        RasterTile::new(grid, nodata, data)
    }
}

/// Merge delegated to a command-line mosaicking tool such as `otbcli_Mosaic`
///
/// Both operands are written as GeoTIFFs to a scratch directory. `{mosaic}`,
/// `{addition}` and `{output}` in the arguments are replaced by their paths.
/// Every call is bounded by the retry policy's timeout.
#[derive(Debug, Clone)]
pub struct ProcessorMerge {
    program: PathBuf,
    args: Vec<String>,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl ProcessorMerge {
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Program followed by its arguments
    pub fn from_command(command: &[String]) -> SarResult<Self> {
        match command.split_first() {
            Some((program, args)) if !program.trim().is_empty() => Ok(Self::new(program, args.to_vec())),
            _ => Err(SarError::Config("merge command must name a program".to_string())),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl MergePrimitive for ProcessorMerge {
    fn merge(&self, mosaic: &RasterTile, addition: &RasterTile) -> SarResult<RasterTile> {
        let scratch = tempfile::TempDir::new()?;
        let mosaic_path = scratch.path().join("mosaic.tif");
        let addition_path = scratch.path().join("addition.tif");
        let output = scratch.path().join("merged.tif");
        RasterReader::write_geotiff(&mosaic_path, mosaic)?;
        RasterReader::write_geotiff(&addition_path, addition)?;

        let (mosaic_arg, addition_arg) = (mosaic_path.to_string_lossy(), addition_path.to_string_lossy());
        let args = self
            .args
            .iter()
            .map(|a| a.replace("{mosaic}", &mosaic_arg).replace("{addition}", &addition_arg))
            .collect();
        let processor = ExternalProcessor::new(&self.program, args).with_poll_interval(self.poll_interval);

        let attempts = self.retry.run(&processor, &addition_path, &output)?;
        if attempts > 1 {
            log::debug!("Merge succeeded after {} attempts", attempts);
        }
        RasterReader::read_tile(&output)
    }
}

/// Persistence of intermediate mosaics, so long runs can resume
pub trait MosaicCheckpoint {
    fn save(&mut self, step: usize, mosaic: &RasterTile) -> SarResult<()>;

    /// Highest saved step and its mosaic
    fn load_latest(&self) -> SarResult<Option<(usize, RasterTile)>>;

    fn discard(&mut self, step: usize) -> SarResult<()>;

    /// Remove every saved step
    fn clear(&mut self) -> SarResult<()>;
}

/// Checkpoints held in memory
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    steps: BTreeMap<usize, RasterTile>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_steps(&self) -> Vec<usize> {
        self.steps.keys().copied().collect()
    }
}

impl MosaicCheckpoint for MemoryCheckpoint {
    fn save(&mut self, step: usize, mosaic: &RasterTile) -> SarResult<()> {
        self.steps.insert(step, mosaic.clone());
        Ok(())
    }

    fn load_latest(&self) -> SarResult<Option<(usize, RasterTile)>> {
        Ok(self
            .steps
            .iter()
            .next_back()
            .map(|(step, tile)| (*step, tile.clone())))
    }

    fn discard(&mut self, step: usize) -> SarResult<()> {
        self.steps.remove(&step);
        Ok(())
    }

    fn clear(&mut self) -> SarResult<()> {
        self.steps.clear();
        Ok(())
    }
}

/// Checkpoints written as `<prefix>_step<NN>.tif` in a directory
#[derive(Debug, Clone)]
pub struct GeoTiffCheckpoint {
    dir: PathBuf,
    prefix: String,
}

impl GeoTiffCheckpoint {
    pub fn new<P: AsRef<Path>>(dir: P, prefix: impl Into<String>) -> SarResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
        })
    }

    pub fn step_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{}_step{:02}.tif", self.prefix, step))
    }

    fn saved_steps(&self) -> SarResult<Vec<usize>> {
        let marker = format!("{}_step", self.prefix);
        let mut steps = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let step = name
                .strip_prefix(&marker)
                .and_then(|rest| rest.strip_suffix(".tif"))
                .and_then(|digits| digits.parse::<usize>().ok());
            if let Some(step) = step {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }
}

impl MosaicCheckpoint for GeoTiffCheckpoint {
    fn save(&mut self, step: usize, mosaic: &RasterTile) -> SarResult<()> {
        RasterReader::write_geotiff(self.step_path(step), mosaic)
    }

    fn load_latest(&self) -> SarResult<Option<(usize, RasterTile)>> {
        match self.saved_steps()?.last() {
            Some(&step) => Ok(Some((step, RasterReader::read_tile(self.step_path(step))?))),
            None => Ok(None),
        }
    }

    fn discard(&mut self, step: usize) -> SarResult<()> {
        let path = self.step_path(step);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> SarResult<()> {
        for step in self.saved_steps()? {
            self.discard(step)?;
        }
        Ok(())
    }
}

/// One merge of the fold
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub scene: String,
    pub correction: LinearCorrection,
}

/// Outcome of a sequential mosaic; `aborted` keeps the reason when the fold
/// stopped early, in which case `mosaic` holds the partial result
#[derive(Debug, Clone)]
pub struct SequentialResult {
    pub mosaic: RasterTile,
    /// Scenes contained in `mosaic`
    pub merged: usize,
    pub total: usize,
    pub steps: Vec<StepRecord>,
    pub resumed_from: Option<usize>,
    pub aborted: Option<String>,
}

impl SequentialResult {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.merged == self.total
    }
}

/// Sequential Harmonizing Mosaicker
pub struct SequentialMosaicker {
    params: SequentialParams,
    merge: Box<dyn MergePrimitive>,
}

impl SequentialMosaicker {
    pub fn new() -> Self {
        Self::with_params(SequentialParams::default())
    }

    pub fn with_params(params: SequentialParams) -> Self {
        let merge = Box::new(UnionMerge::new(params.overlap_rule));
        Self { params, merge }
    }

    /// Replace the merge primitive
    pub fn with_merge(mut self, merge: Box<dyn MergePrimitive>) -> Self {
        self.merge = merge;
        self
    }

    pub fn params(&self) -> &SequentialParams {
        &self.params
    }

    /// Indices of `sources` in merge order
    pub fn order(&self, sources: &[&dyn RasterSource]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..sources.len()).collect();
        let key = |i: &usize| {
            let b = sources[*i].grid().bounds();
            match self.params.ordering {
                SceneOrdering::WestToEast => (b.min_x, -b.max_y),
                SceneOrdering::NorthToSouth => (-b.max_y, b.min_x),
                SceneOrdering::AsGiven => (*i as f64, 0.0),
            }
        };
        order.sort_by(|a, b| {
            let (ka, kb) = (key(a), key(b));
            ka.0.total_cmp(&kb.0).then(ka.1.total_cmp(&kb.1))
        });
        order
    }

    fn read_whole(source: &dyn RasterSource) -> SarResult<RasterTile> {
        let grid = source.grid().clone();
        let data = source.read_window(0, 0, grid.width, grid.height)?;
        RasterTile::new(grid, source.nodata(), data)
    }

    /// Fold `sources` one at a time into a growing mosaic
    ///
    /// Resumes after the latest step found in `checkpoint`. Each merged step is
    /// saved; the previous one is discarded unless intermediates are kept.
    pub fn mosaic(
        &self,
        sources: &[&dyn RasterSource],
        checkpoint: &mut dyn MosaicCheckpoint,
    ) -> SarResult<SequentialResult> {
        if sources.is_empty() {
            return Err(SarError::EmptyInput("no scenes to mosaic sequentially".to_string()));
        }

        let order = self.order(sources);
        let total = order.len();
        log::info!("🧵 Sequential mosaic of {} scenes ({:?})", total, self.params.ordering);
        for (position, &index) in order.iter().enumerate() {
            log::debug!("  {}. {}", position + 1, sources[index].name());
        }

        let (start, mut mosaic, resumed_from) = match checkpoint.load_latest()? {
            Some((step, tile)) if step < total => {
                log::info!("Resuming after step {}", step);
                (step + 1, tile, Some(step))
            }
            _ => (1, Self::read_whole(sources[order[0]])?, None),
        };

        let mut merged_count = start;
        let mut steps = Vec::new();
        let mut aborted = None;

        for (step, &index) in order.iter().enumerate().skip(start) {
            let source = sources[index];
            log::info!("Step {}/{}: {}", step, total - 1, source.name());

            let scene = match Self::read_whole(source) {
                Ok(scene) => scene,
                Err(e) => {
                    log::error!("Failed to open {} at step {}: {}", source.name(), step, e);
                    aborted = Some(format!("step {}: cannot read {}: {}", step, source.name(), e));
                    break;
                }
            };

            let stats = overlap_stats(&mosaic, &scene);
            let correction = LinearCorrection::estimate(
                stats.as_ref(),
                self.params.harmonize,
                self.params.min_overlap_pixels,
            );
            if correction.is_identity() {
                log::debug!("No correction ({} overlap pixels)", stats.map_or(0, |s| s.pixels));
            } else {
                log::debug!(
                    "Correction gain={:.3} offset={:.3} from {} overlap pixels",
                    correction.gain,
                    correction.offset,
                    correction.overlap_pixels
                );
            }

            let merged = match self.merge.merge(&mosaic, &correction.apply(&scene)) {
                Ok(merged) => merged,
                Err(e) => {
                    log::error!("Merge failed at step {}: {}", step, e);
                    aborted = Some(format!("step {}: merge failed: {}", step, e));
                    break;
                }
            };

            mosaic = merged;
            checkpoint.save(step, &mosaic)?;
            if !self.params.keep_intermediates && step > 1 {
                checkpoint.discard(step - 1)?;
            }

            merged_count = step + 1;
            steps.push(StepRecord {
                step,
                scene: source.name(),
                correction,
            });
        }

        let result = SequentialResult {
            mosaic,
            merged: merged_count,
            total,
            steps,
            resumed_from,
            aborted,
        };
        if result.is_complete() {
            log::info!("✅ Sequential mosaic complete ({} scenes)", total);
        } else {
            log::warn!("Sequential mosaic stopped with {}/{} scenes merged", result.merged, total);
        }
        Ok(result)
    }
}

impl Default for SequentialMosaicker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::harmonize::CorrectionKind;
    use crate::types::{SarRealImage, DEFAULT_NODATA};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn ramp(x: f64, width: usize, offset: f32) -> RasterTile {
        let grid = RasterGrid::new(GeoTransform::north_up(x, 20.0, 1.0, 1.0), width, 20, "EPSG:32749");
        let data = Array2::from_shape_fn((20, width), |(r, c)| {
            -20.0 + ((r * 7 + (c + x as usize) * 3) % 11) as f32 * 0.5 + offset
        });
        RasterTile::new(grid, DEFAULT_NODATA, data).unwrap()
    }

    struct Unreadable(RasterGrid);

    impl RasterSource for Unreadable {
        fn name(&self) -> String {
            "broken.tif".to_string()
        }
        fn grid(&self) -> &RasterGrid {
            &self.0
        }
        fn nodata(&self) -> f32 {
            DEFAULT_NODATA
        }
        fn read_window(&self, _: usize, _: usize, _: usize, _: usize) -> SarResult<SarRealImage> {
            Err(SarError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")))
        }
    }

    #[test]
    fn test_west_to_east_order_with_north_tiebreak() {
        let a = ramp(30.0, 5, 0.0);
        let b = ramp(0.0, 5, 0.0);
        let mut c = ramp(0.0, 5, 0.0);
        c.grid.transform.top_left_y = 40.0;
        let sources: [&dyn RasterSource; 3] = [&a, &b, &c];
        assert_eq!(SequentialMosaicker::new().order(&sources), vec![2, 1, 0]);
    }

    #[test]
    fn test_disjoint_scenes_form_unshifted_union() {
        let west = ramp(0.0, 10, 0.0);
        let east = ramp(15.0, 10, 3.0);
        let sources: [&dyn RasterSource; 2] = [&east, &west];

        let mut checkpoint = MemoryCheckpoint::new();
        let result = SequentialMosaicker::new().mosaic(&sources, &mut checkpoint).unwrap();
        assert!(result.is_complete());
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].correction.kind, CorrectionKind::Identity);

        let mosaic = &result.mosaic;
        assert_eq!(mosaic.width(), 25);
        assert_eq!(mosaic.data[[2, 3]], west.data[[2, 3]]);
        assert_eq!(mosaic.data[[2, 17]], east.data[[2, 2]]);
        assert_eq!(mosaic.data[[2, 12]], DEFAULT_NODATA);
    }

    #[test]
    fn test_offset_scene_is_harmonized() {
        let west = ramp(0.0, 20, 0.0);
        let east = ramp(10.0, 20, 4.0);
        let sources: [&dyn RasterSource; 2] = [&west, &east];

        let params = SequentialParams {
            harmonize: HarmonizeMode::Additive,
            ..Default::default()
        };
        let result = SequentialMosaicker::with_params(params)
            .mosaic(&sources, &mut MemoryCheckpoint::new())
            .unwrap();

        assert_abs_diff_eq!(result.steps[0].correction.offset, -4.0, epsilon = 1e-4);
        // East-only pixels come back onto the western radiometry
        let expected = east.data[[5, 15]] - 4.0;
        assert_abs_diff_eq!(result.mosaic.data[[5, 25]], expected, epsilon = 1e-4);
    }

    #[test]
    fn test_failed_read_aborts_and_keeps_partial_result() {
        let a = ramp(0.0, 10, 0.0);
        let b = ramp(8.0, 10, 0.0);
        let broken = Unreadable(ramp(20.0, 5, 0.0).grid);
        let sources: [&dyn RasterSource; 3] = [&a, &b, &broken];

        let mut checkpoint = MemoryCheckpoint::new();
        let result = SequentialMosaicker::new().mosaic(&sources, &mut checkpoint).unwrap();
        assert!(!result.is_complete());
        assert_eq!(result.merged, 2);
        assert!(result.aborted.as_deref().unwrap().contains("broken.tif"));
        assert_eq!(result.mosaic.width(), 18);
        assert_eq!(checkpoint.saved_steps(), vec![1]);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let a = ramp(0.0, 10, 0.0);
        let b = ramp(8.0, 10, 0.0);
        let c = ramp(16.0, 10, 0.0);
        let sources: [&dyn RasterSource; 3] = [&a, &b, &c];
        let mosaicker = SequentialMosaicker::new();

        let full = mosaicker.mosaic(&sources, &mut MemoryCheckpoint::new()).unwrap();

        let mut checkpoint = MemoryCheckpoint::new();
        let partial = mosaicker.mosaic(&sources[..2], &mut checkpoint).unwrap();
        assert!(partial.is_complete());
        let resumed = mosaicker.mosaic(&sources, &mut checkpoint).unwrap();
        assert_eq!(resumed.resumed_from, Some(1));
        assert_eq!(resumed.steps.len(), 1);
        assert_eq!(resumed.mosaic.data, full.mosaic.data);
        assert_eq!(checkpoint.saved_steps(), vec![2]);
    }

    #[test]
    fn test_keep_intermediates_retains_every_step() {
        let a = ramp(0.0, 10, 0.0);
        let b = ramp(8.0, 10, 0.0);
        let c = ramp(16.0, 10, 0.0);
        let sources: [&dyn RasterSource; 3] = [&a, &b, &c];
        let params = SequentialParams {
            keep_intermediates: true,
            ..Default::default()
        };
        let mut checkpoint = MemoryCheckpoint::new();
        SequentialMosaicker::with_params(params)
            .mosaic(&sources, &mut checkpoint)
            .unwrap();
        assert_eq!(checkpoint.saved_steps(), vec![1, 2]);
    }

    #[test]
    fn test_average_overlap_rule() {
        let a = ramp(0.0, 4, 0.0);
        let mut b = ramp(2.0, 4, 0.0);
        b.data.fill(-1.0);
        let merged = UnionMerge::new(OverlapRule::Average).merge(&a, &b).unwrap();
        assert_eq!(merged.width(), 6);
        assert_abs_diff_eq!(merged.data[[0, 3]], (a.data[[0, 3]] - 1.0) / 2.0);
        assert_eq!(merged.data[[0, 5]], -1.0);

        let kept = UnionMerge::new(OverlapRule::MosaicWins).merge(&a, &b).unwrap();
        assert_eq!(kept.data[[0, 3]], a.data[[0, 3]]);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_merge_runs_the_command() {
        let west = ramp(0.0, 10, 0.0);
        let east = ramp(15.0, 10, 0.0);
        let sources: [&dyn RasterSource; 2] = [&east, &west];

        // Keeps the running mosaic as the merge result
        let keep = ProcessorMerge::from_command(&[
            "sh".to_string(),
            "-c".to_string(),
            "cp \"$0\" \"$1\"".to_string(),
            "{mosaic}".to_string(),
            "{output}".to_string(),
        ])
        .unwrap()
        .with_retry(RetryPolicy::none())
        .with_poll_interval(Duration::from_millis(10));

        let result = SequentialMosaicker::new()
            .with_merge(Box::new(keep))
            .mosaic(&sources, &mut MemoryCheckpoint::new())
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(result.mosaic.width(), 10);
        assert_eq!(result.mosaic.data, west.data);
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_external_merge_times_out_and_aborts() {
        let a = ramp(0.0, 10, 0.0);
        let b = ramp(8.0, 10, 0.0);
        let sources: [&dyn RasterSource; 2] = [&a, &b];

        let slow = ProcessorMerge::new("sleep", vec!["5".to_string()])
            .with_retry(RetryPolicy {
                timeout_secs: 0.2,
                ..RetryPolicy::none()
            })
            .with_poll_interval(Duration::from_millis(10));

        let started = std::time::Instant::now();
        let mut checkpoint = MemoryCheckpoint::new();
        let result = SequentialMosaicker::new()
            .with_merge(Box::new(slow))
            .mosaic(&sources, &mut checkpoint)
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!result.is_complete());
        assert_eq!(result.merged, 1);
        assert!(result.aborted.as_deref().unwrap().contains("timed out"));
        assert_eq!(result.mosaic.data, a.data);
        assert!(checkpoint.saved_steps().is_empty());
    }

    #[test]
    fn test_merge_command_needs_a_program() {
        assert!(matches!(ProcessorMerge::from_command(&[]), Err(SarError::Config(_))));
        assert!(ProcessorMerge::from_command(&[" ".to_string()]).is_err());
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let none: [&dyn RasterSource; 0] = [];
        assert!(matches!(
            SequentialMosaicker::new().mosaic(&none, &mut MemoryCheckpoint::new()),
            Err(SarError::EmptyInput(_))
        ));
    }
}
