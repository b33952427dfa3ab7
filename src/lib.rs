//! sarstack: period compositing, mosaicking and temporal stacking for Sentinel-1 backscatter
//!
//! Calibrated single-band scenes are grouped into the 31 fixed 12-day periods of a
//! year, composited per period (and optionally per track), mosaicked into one raster
//! per period and assembled into a 31-band stack with temporal gap filling.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, GeoTransform, PassDirection, Polarization, RasterGrid, RasterTile, SarError,
    SarReal, SarRealImage, SarResult, SceneMeta, ValidRange, DEFAULT_NODATA, PERIODS_PER_YEAR,
};

pub use io::{GdalRasterSource, JsonStatusStore, MemoryStatusStore, MetadataExtractor, StatusStore};
pub use crate::core::{PeriodPipeline, PipelineConfig, RunReport};
