//! Core processing: periods, compositing, mosaicking, harmonization and stacking

pub mod composite;
pub mod harmonize;
pub mod mosaic;
pub mod period;
pub mod pipeline;
pub mod processor;
pub mod resample;
pub mod sequential;
pub mod stack;
pub mod temporal_filter;

// Re-export main types
pub use composite::{CompositeParams, CompositeRaster, Reducer, SceneCompositor};
pub use harmonize::{HarmonizeMode, LinearCorrection, NormalizationTarget, OverlapStats, SampleStats};
pub use mosaic::{MosaicParams, MosaicSummary, OverlapPolicy, RasterSource, TileSink, TiledMosaicEngine};
pub use period::{parse_period_list, CompletenessReport, GroupKey, Period, TemporalGrouper};
pub use pipeline::{MosaicStrategy, PeriodPipeline, PipelineConfig, RunReport, Stage, StageCounts};
pub use processor::{ExternalProcessor, Processor, RetryPolicy};
pub use resample::{resample_to_grid, ResampleMethod};
pub use sequential::{MergePrimitive, MosaicCheckpoint, ProcessorMerge, SequentialMosaicker, SequentialParams, UnionMerge};
pub use stack::{BandSink, BandSource, MemoryBandSink, StackAssembler, StackParams, StackReport};
pub use temporal_filter::{HeikinAshiFilter, SmoothingParams};
