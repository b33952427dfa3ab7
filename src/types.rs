use chrono::NaiveDateTime;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Real-valued backscatter sample (usually dB)
pub type SarReal = f32;

/// 2D real raster array (rows x cols)
pub type SarRealImage = Array2<SarReal>;

/// Nodata sentinel written to every composite, mosaic and stack
pub const DEFAULT_NODATA: SarReal = -32768.0;

/// Sentinel-1 orbital repeat cycle (orbits)
pub const REPEAT_CYCLE: u32 = 175;

/// Number of 12-day periods in a year (= bands in the annual stack)
pub const PERIODS_PER_YEAR: u8 = 31;

/// Polarization modes for Sentinel-1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarization {
    VV,
    VH,
    HV,
    HH,
}

impl std::fmt::Display for Polarization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarization::VV => write!(f, "VV"),
            Polarization::VH => write!(f, "VH"),
            Polarization::HV => write!(f, "HV"),
            Polarization::HH => write!(f, "HH"),
        }
    }
}

impl FromStr for Polarization {
    type Err = SarError;

    fn from_str(s: &str) -> SarResult<Self> {
        match s.to_uppercase().as_str() {
            "VV" => Ok(Polarization::VV),
            "VH" => Ok(Polarization::VH),
            "HV" => Ok(Polarization::HV),
            "HH" => Ok(Polarization::HH),
            _ => Err(SarError::InvalidFormat(format!("Invalid polarization: {}", s))),
        }
    }
}

/// Orbit pass direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassDirection {
    Ascending,
    Descending,
}

impl std::fmt::Display for PassDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassDirection::Ascending => write!(f, "ASCENDING"),
            PassDirection::Descending => write!(f, "DESCENDING"),
        }
    }
}

impl FromStr for PassDirection {
    type Err = SarError;

    fn from_str(s: &str) -> SarResult<Self> {
        match s.trim().to_uppercase().as_str() {
            "ASCENDING" | "ASC" | "A" => Ok(PassDirection::Ascending),
            "DESCENDING" | "DESC" | "D" => Ok(PassDirection::Descending),
            other => Err(SarError::InvalidFormat(format!("Invalid pass direction: {}", other))),
        }
    }
}

/// Geospatial bounding box in the raster's own CRS units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Intersection with positive area, if any
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_x = self.min_x.max(other.min_x);
        let max_x = self.max_x.min(other.max_x);
        let min_y = self.min_y.max(other.min_y);
        let max_y = self.max_y.min(other.max_y);

        if max_x > min_x && max_y > min_y {
            Some(BoundingBox { min_x, min_y, max_x, max_y })
        } else {
            None
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection(other).is_some()
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square or rectangular pixels; `pixel_height` is given positive
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn is_rotated(&self) -> bool {
        self.rotation_x != 0.0 || self.rotation_y != 0.0
    }

    /// Ground coordinate of a (fractional) pixel position
    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position of a ground coordinate (axis-aligned grids only)
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    /// Equality up to a fraction of a pixel
    pub fn approx_eq(&self, other: &GeoTransform) -> bool {
        let tol = 1e-6 * self.pixel_width.abs().max(self.pixel_height.abs()).max(1e-12);
        (self.top_left_x - other.top_left_x).abs() <= tol
            && (self.top_left_y - other.top_left_y).abs() <= tol
            && (self.pixel_width - other.pixel_width).abs() <= tol
            && (self.pixel_height - other.pixel_height).abs() <= tol
            && (self.rotation_x - other.rotation_x).abs() <= tol
            && (self.rotation_y - other.rotation_y).abs() <= tol
    }
}

/// Raster grid: transform, dimensions and coordinate reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    /// WKT or authority string ("EPSG:4326"); empty when unknown
    pub crs: String,
}

impl RasterGrid {
    pub fn new(transform: GeoTransform, width: usize, height: usize, crs: impl Into<String>) -> Self {
        Self {
            transform,
            width,
            height,
            crs: crs.into(),
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        let (x0, y0) = self.transform.pixel_to_geo(0.0, 0.0);
        let (x1, y1) = self
            .transform
            .pixel_to_geo(self.width as f64, self.height as f64);
        BoundingBox {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Unknown CRS on either side is treated as compatible
    pub fn same_crs(&self, other: &RasterGrid) -> bool {
        let a = self.crs.trim();
        let b = other.crs.trim();
        a.is_empty() || b.is_empty() || a == b
    }

    /// Same CRS, transform and shape: data can be copied without resampling
    pub fn matches(&self, other: &RasterGrid) -> bool {
        self.same_crs(other)
            && self.width == other.width
            && self.height == other.height
            && self.transform.approx_eq(&other.transform)
    }
}

/// Inclusive physically-plausible value range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: SarReal,
    pub max: SarReal,
}

impl ValidRange {
    /// Plausible backscatter range in dB
    pub fn backscatter_db() -> Self {
        Self { min: -100.0, max: 50.0 }
    }

    pub fn contains(&self, value: SarReal) -> bool {
        value >= self.min && value <= self.max
    }
}

/// A sample is valid when finite and different from the nodata sentinel
#[inline]
pub fn is_valid_sample(value: SarReal, nodata: SarReal) -> bool {
    value.is_finite() && value != nodata
}

/// Single-band raster held in memory
#[derive(Debug, Clone)]
pub struct RasterTile {
    pub grid: RasterGrid,
    pub nodata: SarReal,
    pub data: SarRealImage,
}

impl RasterTile {
    pub fn new(grid: RasterGrid, nodata: SarReal, data: SarRealImage) -> SarResult<Self> {
        if data.dim() != (grid.height, grid.width) {
            return Err(SarError::InvalidFormat(format!(
                "Raster data shape {:?} does not match grid {}x{}",
                data.dim(),
                grid.width,
                grid.height
            )));
        }
        Ok(Self { grid, nodata, data })
    }

    /// Tile on `grid` with every pixel set to nodata
    pub fn filled(grid: RasterGrid, nodata: SarReal) -> Self {
        let data = Array2::from_elem((grid.height, grid.width), nodata);
        Self { grid, nodata, data }
    }

    pub fn width(&self) -> usize {
        self.grid.width
    }

    pub fn height(&self) -> usize {
        self.grid.height
    }

    pub fn bounds(&self) -> BoundingBox {
        self.grid.bounds()
    }

    #[inline]
    pub fn is_valid(&self, value: SarReal) -> bool {
        is_valid_sample(value, self.nodata)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| self.is_valid(v)).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&v| self.is_valid(v))
    }

    /// Valid sample of the pixel containing a ground coordinate
    pub fn sample_at(&self, x: f64, y: f64) -> Option<SarReal> {
        let (col, row) = self.grid.transform.geo_to_pixel(x, y);
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (col, row) = (col.floor() as usize, row.floor() as usize);
        if col >= self.width() || row >= self.height() {
            return None;
        }
        let value = self.data[[row, col]];
        self.is_valid(value).then_some(value)
    }
}

/// Per-scene metadata recovered from the scene identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMeta {
    pub scene_id: String,
    pub source: PathBuf,
    /// S1A, S1B, ...
    pub mission: String,
    pub acquired: NaiveDateTime,
    pub absolute_orbit: u32,
    /// Relative orbit in [1, 175]
    pub track: u16,
    pub pass: PassDirection,
    /// True when the pass direction came from embedded metadata rather than the track heuristic
    pub pass_confirmed: bool,
    pub polarization: Option<Polarization>,
    /// 12-day period index in [1, 31]
    pub period: u8,
}

/// Error types for compositing and mosaicking
#[derive(Debug, thiserror::Error)]
pub enum SarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Unparseable metadata for '{scene}': {reason}")]
    UnparseableMetadata { scene: String, reason: String },

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("{tool} timed out after {seconds:.1}s")]
    Timeout { tool: String, seconds: f64 },
}

impl SarError {
    /// Errors that abort a whole run instead of a single work unit
    pub fn is_fatal(&self) -> bool {
        matches!(self, SarError::Io(_) | SarError::Config(_))
    }
}

/// Result type for SAR operations
pub type SarResult<T> = Result<T, SarError>;
