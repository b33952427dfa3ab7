use crate::core::composite::{CompositeParams, SceneCompositor};
use crate::core::harmonize::{normalize_to_target, NormalizationTarget, SampleStats};
use crate::core::mosaic::{MosaicParams, RasterSource, TiledMosaicEngine};
use crate::core::period::{CompletenessReport, Group, GroupKey, Period, TemporalGrouper};
use crate::core::processor::{Processor, RetryPolicy};
use crate::core::sequential::{
    GeoTiffCheckpoint, MosaicCheckpoint, ProcessorMerge, SequentialMosaicker, SequentialParams,
};
use crate::core::stack::{StackAssembler, StackParams, StackReport};
use crate::core::temporal_filter::SmoothingParams;
use crate::io::raster_io::{GdalRasterSource, GeoTiffBandReader, GeoTiffBandSink, RasterReader};
use crate::io::scene_id::MetadataExtractor;
use crate::io::status::{StatusStore, WorkState};
use crate::types::{Polarization, SarError, SarResult, SceneMeta, PERIODS_PER_YEAR};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// How the composites of one period are joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MosaicStrategy {
    /// Tiled engine with a fixed overlap policy
    #[default]
    Engine,
    /// Harmonizing fold, one scene at a time
    Sequential,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub year: i32,
    /// Composite per (period, track) instead of per period
    pub by_track: bool,
    pub polarization: Option<Polarization>,
    /// Confirm pass direction from each raster's embedded metadata
    pub read_raster_metadata: bool,
    /// Periods to produce mosaics for; empty means all 31
    pub periods: Vec<u8>,
    pub strategy: MosaicStrategy,
    pub composite: CompositeParams,
    /// Normalize every scene to the batch's median mean/std before compositing
    pub normalize_scenes: bool,
    pub mosaic: MosaicParams,
    pub sequential: SequentialParams,
    /// External merge tool for the sequential strategy, e.g.
    /// `["otbcli_Mosaic", "-il", "{mosaic}", "{addition}", "-out", "{output}"]`
    pub merge_command: Option<Vec<String>>,
    pub stack: StackParams,
    pub smoothing: Option<SmoothingParams>,
    pub retry: RetryPolicy,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Keep composites and sequential checkpoints after their period mosaic exists
    pub keep_intermediates: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            year: 2024,
            by_track: true,
            polarization: Some(Polarization::VH),
            read_raster_metadata: false,
            periods: Vec::new(),
            strategy: MosaicStrategy::default(),
            composite: CompositeParams::default(),
            normalize_scenes: false,
            mosaic: MosaicParams::default(),
            sequential: SequentialParams::default(),
            merge_command: None,
            stack: StackParams::default(),
            smoothing: None,
            retry: RetryPolicy::default(),
            work_dir: PathBuf::from("work"),
            output_dir: PathBuf::from("output"),
            keep_intermediates: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> SarResult<()> {
        Period::new(self.year, 1).map_err(|e| SarError::Config(e.to_string()))?;
        if let Some(p) = self.periods.iter().find(|p| !(1..=PERIODS_PER_YEAR).contains(*p)) {
            return Err(SarError::Config(format!("Period {} outside 1..={}", p, PERIODS_PER_YEAR)));
        }
        if self.mosaic.tile_size == 0 {
            return Err(SarError::Config("mosaic tile_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.stack.complete_coverage) {
            return Err(SarError::Config(format!(
                "stack complete_coverage must be within [0, 1], got {}",
                self.stack.complete_coverage
            )));
        }
        if let Some(smoothing) = &self.smoothing {
            smoothing.filter()?;
        }
        if let Some(command) = &self.merge_command {
            ProcessorMerge::from_command(command)?;
        }
        self.retry.validate()?;
        if self.work_dir.as_os_str().is_empty() || self.output_dir.as_os_str().is_empty() {
            return Err(SarError::Config("work_dir and output_dir must be set".to_string()));
        }
        Ok(())
    }

    pub fn wants_period(&self, period: u8) -> bool {
        self.periods.is_empty() || self.periods.contains(&period)
    }

    pub fn calibrated_dir(&self) -> PathBuf {
        self.work_dir.join("calibrated")
    }

    pub fn composites_dir(&self) -> PathBuf {
        self.work_dir.join("composites")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.work_dir.join("checkpoints")
    }

    pub fn composite_path(&self, key: &GroupKey) -> PathBuf {
        self.composites_dir().join(format!("{}_composite.tif", key))
    }

    pub fn mosaic_path(&self, period: u8) -> PathBuf {
        self.output_dir.join(format!("period_{:02}_mosaic.tif", period))
    }

    pub fn stack_path(&self) -> PathBuf {
        self.output_dir.join(format!("S1_VH_stack_{}_31bands.tif", self.year))
    }

    pub fn smoothed_stack_path(&self) -> PathBuf {
        self.output_dir.join(format!("S1_VH_stack_{}_31bands_smoothed.tif", self.year))
    }
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Calibrate,
    Extract,
    Composite,
    Mosaic,
    Stack,
    Smooth,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Calibrate => "calibrate",
            Stage::Extract => "extract",
            Stage::Composite => "composite",
            Stage::Mosaic => "mosaic",
            Stage::Stack => "stack",
            Stage::Smooth => "smooth",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub succeeded: usize,
    /// Output already present
    pub skipped: usize,
    pub failed: usize,
    /// Inputs left out of otherwise successful units
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub stage: Stage,
    pub unit: String,
    pub error: String,
}

/// Input a unit could not use and carried on without
#[derive(Debug, Clone, Serialize)]
pub struct DroppedInput {
    pub stage: Stage,
    pub unit: String,
    pub input: String,
    pub reason: String,
}

/// Result of one unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Done,
    /// Output already present
    Skipped,
    Failed(String),
}

/// End-of-run summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub year: i32,
    pub stages: BTreeMap<Stage, StageCounts>,
    pub failures: Vec<UnitFailure>,
    pub dropped_inputs: Vec<DroppedInput>,
    /// Scenes outside the processed year
    pub excluded_scenes: Vec<String>,
    /// Periods with fewer tracks than the busiest period
    pub incomplete_periods: Vec<u8>,
    /// Target the scenes were normalized to, when normalization ran
    pub normalization: Option<NormalizationTarget>,
    /// Periods with no mosaic going into the stack
    pub missing_periods: Vec<u8>,
    pub mosaics: BTreeMap<u8, PathBuf>,
    pub stack: Option<PathBuf>,
    pub stack_report: Option<StackReport>,
    pub smoothed_stack: Option<PathBuf>,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            ..Default::default()
        }
    }

    pub fn counts(&self, stage: Stage) -> StageCounts {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn record(&mut self, stage: Stage, unit: &str, outcome: &UnitOutcome) {
        let counts = self.stages.entry(stage).or_default();
        match outcome {
            UnitOutcome::Done => counts.succeeded += 1,
            UnitOutcome::Skipped => counts.skipped += 1,
            UnitOutcome::Failed(error) => {
                counts.failed += 1;
                self.failures.push(UnitFailure {
                    stage,
                    unit: unit.to_string(),
                    error: error.clone(),
                });
            }
        }
    }

    /// Record inputs `unit` went on without
    pub fn record_dropped(&mut self, stage: Stage, unit: &str, dropped: Vec<(String, String)>) {
        if dropped.is_empty() {
            return;
        }
        self.stages.entry(stage).or_default().dropped += dropped.len();
        self.dropped_inputs
            .extend(dropped.into_iter().map(|(input, reason)| DroppedInput {
                stage,
                unit: unit.to_string(),
                input,
                reason,
            }));
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn to_json(&self) -> SarResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> SarResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run report {} ({:.1}s)", self.year, self.elapsed_secs)?;
        for (stage, counts) in &self.stages {
            writeln!(
                f,
                "  {:<10} succeeded={:<4} skipped={:<4} dropped={:<4} failed={}",
                stage, counts.succeeded, counts.skipped, counts.dropped, counts.failed
            )?;
        }
        if !self.missing_periods.is_empty() {
            writeln!(f, "  missing periods: {:?}", self.missing_periods)?;
        }
        if !self.incomplete_periods.is_empty() {
            writeln!(f, "  periods with track gaps: {:?}", self.incomplete_periods)?;
        }
        if let Some(target) = &self.normalization {
            writeln!(f, "  normalized to mean={:.2} std={:.2}", target.mean, target.std)?;
        }
        if let Some(stack) = &self.stack {
            writeln!(f, "  stack: {}", stack.display())?;
        }
        if let Some(smoothed) = &self.smoothed_stack {
            writeln!(f, "  smoothed stack: {}", smoothed.display())?;
        }
        for dropped in &self.dropped_inputs {
            writeln!(
                f,
                "  DROPPED {} {}: {} ({})",
                dropped.stage, dropped.unit, dropped.input, dropped.reason
            )?;
        }
        for failure in &self.failures {
            writeln!(f, "  FAILED {} {}: {}", failure.stage, failure.unit, failure.error)?;
        }
        Ok(())
    }
}

/// Files with `extension` (case-insensitive) directly inside `dir`, sorted
fn list_files(dir: &Path, extensions: &[&str]) -> SarResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
        if name.ends_with(".partial.tif") {
            continue;
        }
        let matches = path
            .extension()
            .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Period Pipeline: extract → group → composite → mosaic → stack
pub struct PeriodPipeline {
    config: PipelineConfig,
    status: Arc<dyn StatusStore>,
}

impl PeriodPipeline {
    pub fn new(config: PipelineConfig, status: Arc<dyn StatusStore>) -> SarResult<Self> {
        config.validate()?;
        Ok(Self { config, status })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> &Arc<dyn StatusStore> {
        &self.status
    }

    /// Run `work` for one unit unless `output` already exists, keeping the status store current
    ///
    /// Only fatal errors are returned; anything else becomes a failed outcome.
    fn track<F>(&self, unit: &str, output: &Path, work: F) -> SarResult<UnitOutcome>
    where
        F: FnOnce() -> SarResult<()>,
    {
        if output.exists() {
            log::debug!("Skipping {}: {} exists", unit, output.display());
            if !self.status.is_completed(unit) {
                self.status
                    .set(unit, WorkState::Completed, Some("output exists".to_string()))?;
            }
            return Ok(UnitOutcome::Skipped);
        }

        self.status.set(unit, WorkState::InProgress, None)?;
        match work() {
            Ok(()) => {
                self.status.set(unit, WorkState::Completed, None)?;
                Ok(UnitOutcome::Done)
            }
            Err(e) => {
                log::error!("❌ {} failed: {}", unit, e);
                self.status.set(unit, WorkState::Failed, Some(e.to_string()))?;
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(UnitOutcome::Failed(e.to_string()))
                }
            }
        }
    }

    /// Calibrate raw archives with `processor` into `{stem}_VH.tif` files
    ///
    /// Returns each usable archive with its calibrated raster.
    pub fn calibrate(
        &self,
        archives: &[PathBuf],
        processor: &dyn Processor,
        report: &mut RunReport,
    ) -> SarResult<Vec<(PathBuf, PathBuf)>> {
        let out_dir = self.config.calibrated_dir();
        std::fs::create_dir_all(&out_dir)?;
        log::info!("🛰️ Calibrating {} archives with {}", archives.len(), processor.name());

        let run_one = |archive: &PathBuf| -> (String, PathBuf, PathBuf, SarResult<UnitOutcome>) {
            let stem = archive
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let output = out_dir.join(format!("{}_VH.tif", stem));
            let unit = format!("calibrate:{}", stem);
            let outcome = self.track(&unit, &output, || {
                let attempts = self.config.retry.run(processor, archive, &output)?;
                if attempts > 1 {
                    log::info!("{} succeeded after {} attempts", stem, attempts);
                }
                Ok(())
            });
            (unit, archive.clone(), output, outcome)
        };

        #[cfg(feature = "parallel")]
        let outcomes: Vec<_> = {
            use rayon::prelude::*;
            archives.par_iter().map(run_one).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<_> = archives.iter().map(run_one).collect();

        let mut calibrated = Vec::new();
        for (unit, archive, output, outcome) in outcomes {
            let outcome = outcome?;
            if !matches!(outcome, UnitOutcome::Failed(_)) {
                calibrated.push((archive, output));
            }
            report.record(Stage::Calibrate, &unit, &outcome);
        }
        Ok(calibrated)
    }

    fn extractor(&self) -> SarResult<MetadataExtractor> {
        Ok(MetadataExtractor::new()?
            .with_polarization(self.config.polarization)
            .with_raster_metadata(self.config.read_raster_metadata))
    }

    /// Calibrate every archive (`.zip` or `.SAFE`) in `archive_dir`, then run the raster stages
    ///
    /// Pass direction read from an archive's manifest carries over to its calibrated raster.
    pub fn run_archives(&self, archive_dir: &Path, processor: &dyn Processor) -> SarResult<RunReport> {
        let started = Instant::now();
        let archives = list_files(archive_dir, &["zip", "safe"])?;
        let mut report = RunReport::new(self.config.year);
        let calibrated = self.calibrate(&archives, processor, &mut report)?;

        let extractor = self.extractor()?;
        let mut from_archives = HashMap::new();
        for (archive, raster) in &calibrated {
            match extractor.extract_archive(archive) {
                Ok(meta) => {
                    from_archives.insert(raster.clone(), meta);
                }
                Err(e) => log::debug!("No archive metadata for {}: {}", archive.display(), e),
            }
        }

        let rasters = calibrated.into_iter().map(|(_, raster)| raster).collect();
        self.run_rasters(rasters, &from_archives, report, started)
    }

    /// Run on a directory of calibrated single-band rasters
    pub fn run(&self, input_dir: &Path) -> SarResult<RunReport> {
        let started = Instant::now();
        let rasters = list_files(input_dir, &["tif", "tiff"])?;
        self.run_rasters(rasters, &HashMap::new(), RunReport::new(self.config.year), started)
    }

    fn run_rasters(
        &self,
        rasters: Vec<PathBuf>,
        from_archives: &HashMap<PathBuf, SceneMeta>,
        mut report: RunReport,
        started: Instant,
    ) -> SarResult<RunReport> {
        log::info!("🚀 Period pipeline for {} on {} rasters", self.config.year, rasters.len());
        std::fs::create_dir_all(&self.config.work_dir)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        // Extract
        let mut extraction = self.extractor()?.extract_batch(&rasters);
        for meta in &mut extraction.scenes {
            if let Some(archive) = from_archives.get(&meta.source).filter(|a| a.pass_confirmed) {
                meta.pass = archive.pass;
                meta.pass_confirmed = true;
            }
        }
        for (path, error) in &extraction.failures {
            report.record(Stage::Extract, &path.display().to_string(), &UnitOutcome::Failed(error.to_string()));
        }
        let extract = report.stages.entry(Stage::Extract).or_default();
        extract.succeeded += extraction.scenes.len();
        extract.skipped += extraction.filtered;

        let completeness = CompletenessReport::from_scenes(self.config.year, &extraction.scenes, None);
        report.incomplete_periods = completeness.incomplete_periods();
        if !report.incomplete_periods.is_empty() {
            log::warn!("Periods with track gaps: {:?}", report.incomplete_periods);
        }

        // Group
        let grouping = TemporalGrouper::new(self.config.year, self.config.by_track).group(
            extraction
                .scenes
                .into_iter()
                .filter(|m| self.config.wants_period(m.period))
                .map(|m| {
                    let path = m.source.clone();
                    (m, path)
                })
                .collect(),
        );
        report.excluded_scenes = grouping.excluded;

        let composites = self.composite_groups(&grouping.groups, &mut report)?;
        self.mosaic_periods(&composites, &mut report)?;
        self.stack_periods(&mut report)?;

        report.elapsed_secs = started.elapsed().as_secs_f64();
        log::info!("🏁 Pipeline finished in {:.1}s", report.elapsed_secs);
        log::info!("\n{}", report);
        Ok(report)
    }

    /// Composite each group; returns composite paths per period
    fn composite_groups(
        &self,
        groups: &[Group<PathBuf>],
        report: &mut RunReport,
    ) -> SarResult<BTreeMap<u8, Vec<PathBuf>>> {
        std::fs::create_dir_all(self.config.composites_dir())?;
        log::info!("🧩 Compositing {} groups", groups.len());
        let compositor = SceneCompositor::with_params(self.config.composite.clone());
        let pending = |group: &Group<PathBuf>| {
            !self.config.mosaic_path(group.key.period).exists()
                && !self.config.composite_path(&group.key).exists()
        };

        let target = if self.config.normalize_scenes && groups.iter().any(pending) {
            self.normalization_target(groups)
        } else {
            None
        };
        report.normalization = target;

        type Composited = (String, u8, PathBuf, SarResult<UnitOutcome>, Vec<(String, String)>);
        let run_one = |group: &Group<PathBuf>| -> Composited {
            let unit = format!("composite:{}", group.key);
            let output = self.config.composite_path(&group.key);
            let mut dropped = Vec::new();
            let outcome = if self.config.mosaic_path(group.key.period).exists() {
                Ok(UnitOutcome::Skipped)
            } else {
                self.track(&unit, &output, || {
                    self.composite_one(&compositor, group, &output, target.as_ref(), &mut dropped)
                })
            };
            (unit, group.key.period, output, outcome, dropped)
        };

        #[cfg(feature = "parallel")]
        let outcomes: Vec<_> = {
            use rayon::prelude::*;
            groups.par_iter().map(run_one).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<_> = groups.iter().map(run_one).collect();

        let mut by_period: BTreeMap<u8, Vec<PathBuf>> = BTreeMap::new();
        for (unit, period, output, outcome, dropped) in outcomes {
            let outcome = outcome?;
            if !matches!(outcome, UnitOutcome::Failed(_)) {
                by_period.entry(period).or_default().push(output);
            }
            report.record(Stage::Composite, &unit, &outcome);
            report.record_dropped(Stage::Composite, &unit, dropped);
        }
        Ok(by_period)
    }

    /// Median mean/std over every readable scene of the batch
    fn normalization_target(&self, groups: &[Group<PathBuf>]) -> Option<NormalizationTarget> {
        let paths: Vec<&PathBuf> = groups
            .iter()
            .flat_map(|g| g.members.iter().map(|(_, path)| path))
            .collect();
        let stats_of = |path: &&PathBuf| -> Option<SampleStats> {
            RasterReader::read_tile(path)
                .ok()
                .and_then(|tile| SampleStats::of_tile(&tile))
        };

        #[cfg(feature = "parallel")]
        let stats: Vec<SampleStats> = {
            use rayon::prelude::*;
            paths.par_iter().filter_map(stats_of).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let stats: Vec<SampleStats> = paths.iter().filter_map(stats_of).collect();

        match NormalizationTarget::from_scene_stats(&stats) {
            Ok(target) => {
                log::info!(
                    "📏 Normalizing {} scenes to mean={:.2} std={:.2}",
                    stats.len(),
                    target.mean,
                    target.std
                );
                Some(target)
            }
            Err(e) => {
                log::warn!("Scenes left unnormalized: {}", e);
                None
            }
        }
    }

    /// Composite one group; members that cannot be read go to `dropped`
    fn composite_one(
        &self,
        compositor: &SceneCompositor,
        group: &Group<PathBuf>,
        output: &Path,
        target: Option<&NormalizationTarget>,
        dropped: &mut Vec<(String, String)>,
    ) -> SarResult<()> {
        let mut tiles = Vec::with_capacity(group.len());
        let mut used: Vec<&SceneMeta> = Vec::with_capacity(group.len());
        for (meta, path) in &group.members {
            match RasterReader::read_tile(path) {
                Ok(tile) => {
                    let tile = match target {
                        Some(target) => normalize_to_target(&tile, target),
                        None => tile,
                    };
                    tiles.push((meta.acquired, tile));
                    used.push(meta);
                }
                Err(e) => {
                    log::warn!("Dropping {} from {}: {}", meta.scene_id, group.key, e);
                    dropped.push((path.display().to_string(), e.to_string()));
                }
            }
        }

        let composite = compositor.composite(tiles)?;
        let mut metadata = HashMap::new();
        metadata.insert("PERIOD".to_string(), group.key.period.to_string());
        if let Some(track) = group.key.track {
            metadata.insert("TRACK".to_string(), track.to_string());
        }
        metadata.insert("REDUCER".to_string(), composite.reducer.to_string());
        metadata.insert("SCENE_COUNT".to_string(), composite.contributing.to_string());
        let scenes: Vec<&str> = used.iter().map(|m| m.scene_id.as_str()).collect();
        metadata.insert("SCENES".to_string(), scenes.join(","));
        if let Some(first) = used.first().filter(|f| used.iter().all(|m| m.pass == f.pass)) {
            metadata.insert("PASS".to_string(), first.pass.to_string());
            let confirmed = used.iter().all(|m| m.pass_confirmed);
            metadata.insert("PASS_CONFIRMED".to_string(), confirmed.to_string());
        }
        if let Some(target) = target {
            metadata.insert("NORMALIZED_MEAN".to_string(), format!("{:.4}", target.mean));
            metadata.insert("NORMALIZED_STD".to_string(), format!("{:.4}", target.std));
        }

        RasterReader::write_geotiff_with_metadata(output, &composite.tile, &metadata)?;
        log::info!("✅ {} composite from {} scenes", group.key, composite.contributing);
        Ok(())
    }

    /// Mosaic each period's composites into its period mosaic
    fn mosaic_periods(&self, composites: &BTreeMap<u8, Vec<PathBuf>>, report: &mut RunReport) -> SarResult<()> {
        log::info!("🗺️ Mosaicking {} periods ({:?})", composites.len(), self.config.strategy);

        for (&period, inputs) in composites {
            let unit = format!("mosaic:P{:02}", period);
            let output = self.config.mosaic_path(period);
            let mut dropped = Vec::new();
            let outcome = self.track(&unit, &output, || match self.config.strategy {
                MosaicStrategy::Engine => self.mosaic_engine(inputs, &output, &mut dropped),
                MosaicStrategy::Sequential => self.mosaic_sequential(period, inputs, &output, &mut dropped),
            })?;

            report.record(Stage::Mosaic, &unit, &outcome);
            report.record_dropped(Stage::Mosaic, &unit, dropped);
            if matches!(outcome, UnitOutcome::Failed(_)) {
                continue;
            }
            report.mosaics.insert(period, output);

            if !self.config.keep_intermediates {
                for path in inputs.iter().filter(|p| p.exists()) {
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    fn mosaic_engine(&self, inputs: &[PathBuf], output: &Path, dropped: &mut Vec<(String, String)>) -> SarResult<()> {
        let engine = TiledMosaicEngine::with_params(self.config.mosaic.clone());
        let summary = engine.mosaic_files(inputs, output)?;
        dropped.extend(summary.skipped);
        Ok(())
    }

    fn mosaic_sequential(
        &self,
        period: u8,
        inputs: &[PathBuf],
        output: &Path,
        dropped: &mut Vec<(String, String)>,
    ) -> SarResult<()> {
        let mut opened = Vec::with_capacity(inputs.len());
        for path in inputs {
            match GdalRasterSource::open(path) {
                Ok(source) => opened.push(source),
                Err(e) => {
                    log::warn!("Cannot open {}: {}", path.display(), e);
                    dropped.push((path.display().to_string(), e.to_string()));
                }
            }
        }
        let sources: Vec<&dyn RasterSource> = opened.iter().map(|s| s as &dyn RasterSource).collect();

        let params = SequentialParams {
            keep_intermediates: self.config.keep_intermediates,
            ..self.config.sequential.clone()
        };
        let mut mosaicker = SequentialMosaicker::with_params(params);
        if let Some(command) = &self.config.merge_command {
            let merge = ProcessorMerge::from_command(command)?.with_retry(self.config.retry.clone());
            mosaicker = mosaicker.with_merge(Box::new(merge));
        }
        let mut checkpoint = GeoTiffCheckpoint::new(self.config.checkpoints_dir(), format!("P{:02}", period))?;
        let result = mosaicker.mosaic(&sources, &mut checkpoint)?;

        if let Some(reason) = result.aborted {
            return Err(SarError::Processing(format!(
                "sequential mosaic stopped at {}/{} scenes ({}); checkpoint kept for resume",
                result.merged, result.total, reason
            )));
        }

        RasterReader::write_geotiff(output, &result.mosaic)?;
        if !self.config.keep_intermediates {
            checkpoint.clear()?;
        }
        Ok(())
    }

    /// Stack every period mosaic present in the output directory
    fn stack_periods(&self, report: &mut RunReport) -> SarResult<()> {
        let stack_path = self.config.stack_path();
        let mut opened: BTreeMap<u8, GdalRasterSource> = BTreeMap::new();
        for period in 1..=PERIODS_PER_YEAR {
            let path = self.config.mosaic_path(period);
            if path.exists() {
                match GdalRasterSource::open(&path) {
                    Ok(source) => {
                        opened.insert(period, source);
                    }
                    Err(e) => log::warn!("Cannot open mosaic {}: {}", path.display(), e),
                }
            }
        }
        report.missing_periods = (1..=PERIODS_PER_YEAR).filter(|p| !opened.contains_key(p)).collect();
        if !report.missing_periods.is_empty() {
            log::warn!("Missing period mosaics: {:?}", report.missing_periods);
        }

        let mosaics: BTreeMap<u8, &dyn RasterSource> = opened
            .iter()
            .map(|(p, s)| (*p, s as &dyn RasterSource))
            .collect();

        let params = StackParams {
            year: self.config.year,
            ..self.config.stack.clone()
        };
        let assembler = StackAssembler::with_params(params);
        let nodata = assembler.params().nodata;

        let mut stack_report = None;
        let outcome = self.track("stack", &stack_path, || {
            let grid = assembler.reference_grid(&mosaics)?;
            let mut sink = GeoTiffBandSink::create(&stack_path, &grid, nodata, PERIODS_PER_YEAR as usize)?;
            let assembled = assembler.assemble(&mosaics, &mut sink)?;
            sink.finish()?;
            log::info!("✅ Stack: {}", stack_path.display());
            stack_report = Some(assembled);
            Ok(())
        })?;

        let smoothed_path = self.config.smoothed_stack_path();
        if outcome == UnitOutcome::Done && smoothed_path.exists() {
            log::info!("Removing {}, smoothed from the previous stack", smoothed_path.display());
            std::fs::remove_file(&smoothed_path)?;
        }

        report.record(Stage::Stack, "stack", &outcome);
        let stack_ready = !matches!(outcome, UnitOutcome::Failed(_));
        if stack_ready {
            report.stack = Some(stack_path);
        }
        report.stack_report = stack_report;

        if let Some(smoothing) = self.config.smoothing.filter(|_| stack_ready) {
            self.smooth_stack(smoothing, report)?;
        }
        Ok(())
    }

    /// Smooth the finished stack along time into its own output
    fn smooth_stack(&self, smoothing: SmoothingParams, report: &mut RunReport) -> SarResult<()> {
        let stack_path = self.config.stack_path();
        let smoothed_path = self.config.smoothed_stack_path();

        let outcome = self.track("smooth", &smoothed_path, || {
            let stack = GeoTiffBandReader::open(&stack_path)?;
            let labels = stack.labels()?;
            let nodata = stack.nodata();
            let mut sink = GeoTiffBandSink::create(&smoothed_path, stack.grid(), nodata, labels.len())?;
            smoothing.filter()?.smooth_bands(&stack, &mut sink, &labels, nodata)?;
            sink.finish()?;
            log::info!("✅ Smoothed stack: {}", smoothed_path.display());
            Ok(())
        })?;

        report.record(Stage::Smooth, "smooth", &outcome);
        if !matches!(outcome, UnitOutcome::Failed(_)) {
            report.smoothed_stack = Some(smoothed_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::status::MemoryStatusStore;
    use tempfile::TempDir;

    fn pipeline(dir: &Path) -> PeriodPipeline {
        let config = PipelineConfig {
            work_dir: dir.join("work"),
            output_dir: dir.join("out"),
            ..Default::default()
        };
        PeriodPipeline::new(config, Arc::new(MemoryStatusStore::new())).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(PipelineConfig::default().validate().is_ok());

        let bad_period = PipelineConfig { periods: vec![0, 3], ..Default::default() };
        assert!(matches!(bad_period.validate(), Err(SarError::Config(_))));

        let mut bad_tiles = PipelineConfig::default();
        bad_tiles.mosaic.tile_size = 0;
        assert!(bad_tiles.validate().is_err());

        let bad_smoothing = PipelineConfig {
            smoothing: Some(SmoothingParams { weight_current: 0.0, weight_previous: 0.0 }),
            ..Default::default()
        };
        assert!(bad_smoothing.validate().is_err());

        let empty_merge = PipelineConfig { merge_command: Some(Vec::new()), ..Default::default() };
        assert!(matches!(empty_merge.validate(), Err(SarError::Config(_))));
        let merge = PipelineConfig {
            merge_command: Some(vec!["otbcli_Mosaic".into(), "-il".into(), "{mosaic}".into(), "{addition}".into()]),
            ..Default::default()
        };
        assert!(merge.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrips_through_json_with_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"year": 2023, "strategy": "sequential"}"#).unwrap();
        assert_eq!(config.year, 2023);
        assert_eq!(config.strategy, MosaicStrategy::Sequential);
        assert!(config.by_track);
        assert_eq!(config.stack_path(), PathBuf::from("output/S1_VH_stack_2023_31bands.tif"));
    }

    #[test]
    fn test_output_paths() {
        let config = PipelineConfig::default();
        let key = GroupKey { period: 5, track: Some(126) };
        assert_eq!(config.composite_path(&key), PathBuf::from("work/composites/P05_T126_composite.tif"));
        assert_eq!(config.mosaic_path(5), PathBuf::from("output/period_05_mosaic.tif"));
        assert!(config.wants_period(17));
        let only = PipelineConfig { periods: vec![2], ..Default::default() };
        assert!(!only.wants_period(17));
    }

    #[test]
    fn test_track_skips_existing_outputs_and_records_failures() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(dir.path());
        let existing = dir.path().join("done.tif");
        std::fs::write(&existing, b"x").unwrap();

        let outcome = pipeline.track("unit:a", &existing, || panic!("must not run")).unwrap();
        assert_eq!(outcome, UnitOutcome::Skipped);
        assert!(pipeline.status().is_completed("unit:a"));

        let missing = dir.path().join("todo.tif");
        let outcome = pipeline
            .track("unit:b", &missing, || Err(SarError::EmptyInput("nothing".to_string())))
            .unwrap();
        assert!(matches!(outcome, UnitOutcome::Failed(_)));
        assert_eq!(pipeline.status().get("unit:b").unwrap().state, WorkState::Failed);

        let fatal = pipeline.track("unit:c", &missing, || Err(SarError::Config("bad".to_string())));
        assert!(fatal.is_err());
    }

    #[test]
    fn test_report_counts_and_display() {
        let mut report = RunReport::new(2024);
        report.record(Stage::Composite, "composite:P01", &UnitOutcome::Done);
        report.record(Stage::Composite, "composite:P02", &UnitOutcome::Skipped);
        report.record(Stage::Mosaic, "mosaic:P03", &UnitOutcome::Failed("boom".to_string()));
        report.missing_periods = vec![3];

        report.record_dropped(Stage::Composite, "composite:P01", vec![("a.tif".to_string(), "truncated".to_string())]);
        report.record_dropped(Stage::Composite, "composite:P02", Vec::new());

        assert_eq!(
            report.counts(Stage::Composite),
            StageCounts { succeeded: 1, skipped: 1, failed: 0, dropped: 1 }
        );
        assert_eq!(report.counts(Stage::Stack), StageCounts::default());
        assert!(!report.is_success());

        let text = report.to_string();
        assert!(text.contains("missing periods: [3]"));
        assert!(text.contains("FAILED mosaic mosaic:P03: boom"));
        assert!(text.contains("DROPPED composite composite:P01: a.tif (truncated)"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["stages"]["composite"]["skipped"], 1);
        assert_eq!(json["failures"][0]["stage"], "mosaic");
        assert_eq!(json["dropped_inputs"][0]["unit"], "composite:P01");
        assert_eq!(json["stages"]["composite"]["dropped"], 1);
    }

    #[test]
    fn test_list_files_ignores_partials() {
        let dir = TempDir::new().unwrap();
        for name in ["b.tif", "a.TIF", "c.partial.tif", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = list_files(dir.path(), &["tif"]).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect();
        assert_eq!(names, vec!["a.TIF", "b.tif"]);
    }
}
