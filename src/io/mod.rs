//! Input/output: scene identifiers, archive manifests, GeoTIFF rasters and progress records

pub mod manifest;
pub mod raster_io;
pub mod scene_id;
pub mod status;

// Re-export main types
pub use manifest::{ManifestInfo, ManifestReader};
pub use raster_io::{GdalRasterSource, GeoTiffBandReader, GeoTiffBandSink, GeoTiffTileSink, RasterHeader, RasterReader};
pub use scene_id::{ExtractionResult, MetadataExtractor, SceneIdParser};
pub use status::{JsonStatusStore, MemoryStatusStore, StatusEntry, StatusStore, WorkState};
