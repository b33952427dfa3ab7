use crate::core::period::Period;
use crate::io::manifest::ManifestReader;
use crate::io::raster_io::RasterReader;
use crate::types::{PassDirection, Polarization, SarError, SarResult, SceneMeta, REPEAT_CYCLE};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Sentinel-1 product name, optionally followed by processing suffixes:
/// `S1A_IW_GRDH_1SDV_20240103T224512_20240103T224537_052101_064BB2_1A2B_VH.tif`
const SCENE_PATTERN: &str = r"(?P<mission>S1[A-D])_(?P<mode>IW|EW|SM|WV|S[1-6])_[A-Z0-9_]*?_(?P<start>\d{8}T\d{6})_(?P<stop>\d{8}T\d{6})_(?P<orbit>\d{6})(?P<rest>.*)$";

const POLARIZATION_PATTERN: &str = r"(?i)(?:^|[_\-.])(VV|VH|HH|HV)(?:[_\-.]|$)";

/// Midpoint of the repeat cycle used by the pass-direction heuristic
const TRACK_MIDPOINT: u16 = 88;

/// Relative orbit (track) from the absolute orbit number, in [1, 175]
pub fn track_from_orbit(absolute_orbit: u32) -> u16 {
    match absolute_orbit % REPEAT_CYCLE {
        0 => REPEAT_CYCLE as u16,
        track => track as u16,
    }
}

/// Heuristic pass direction; unreliable on its own, see [`pass_from_metadata`]
pub fn pass_from_track(track: u16) -> PassDirection {
    if track < TRACK_MIDPOINT {
        PassDirection::Ascending
    } else {
        PassDirection::Descending
    }
}

/// Explicit pass direction embedded in raster metadata, either as a text field
/// or as a platform heading in degrees
pub fn pass_from_metadata(metadata: &HashMap<String, String>) -> Option<PassDirection> {
    for (key, value) in metadata {
        let key = key.to_uppercase();
        match key.as_str() {
            "PASS" | "PASS_DIRECTION" | "PASSDIRECTION" | "ORBIT_DIRECTION" => {
                if let Ok(pass) = value.parse::<PassDirection>() {
                    return Some(pass);
                }
            }
            _ => {}
        }
    }

    for (key, value) in metadata {
        let key = key.to_uppercase();
        if matches!(
            key.as_str(),
            "HEADING" | "CENTRE_HEADING" | "CENTER_HEADING" | "PLATFORM_HEADING"
        ) {
            if let Ok(degrees) = value.trim().parse::<f64>() {
                let heading = degrees.rem_euclid(360.0);
                // Northbound tracks are ascending
                return Some(if heading > 90.0 && heading < 270.0 {
                    PassDirection::Descending
                } else {
                    PassDirection::Ascending
                });
            }
        }
    }

    None
}

/// Parser for the scene identifier grammar
pub struct SceneIdParser {
    scene: Regex,
    polarization: Regex,
}

impl SceneIdParser {
    pub fn new() -> SarResult<Self> {
        let scene = Regex::new(SCENE_PATTERN)
            .map_err(|e| SarError::Config(format!("Invalid scene pattern: {}", e)))?;
        let polarization = Regex::new(POLARIZATION_PATTERN)
            .map_err(|e| SarError::Config(format!("Invalid polarization pattern: {}", e)))?;
        Ok(Self { scene, polarization })
    }

    /// Parse a scene identifier or file path
    pub fn parse(&self, identifier: &str) -> SarResult<SceneMeta> {
        let path = Path::new(identifier);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| identifier.to_string());

        let unparseable = |reason: &str| SarError::UnparseableMetadata {
            scene: name.clone(),
            reason: reason.to_string(),
        };

        let captures = self
            .scene
            .captures(&name)
            .ok_or_else(|| unparseable("does not match the Sentinel-1 scene grammar"))?;

        let acquired = NaiveDateTime::parse_from_str(&captures["start"], "%Y%m%dT%H%M%S")
            .map_err(|e| unparseable(&format!("invalid acquisition time: {}", e)))?;
        let absolute_orbit: u32 = captures["orbit"]
            .parse()
            .map_err(|_| unparseable("invalid absolute orbit"))?;
        if absolute_orbit == 0 {
            return Err(unparseable("absolute orbit is zero"));
        }

        let polarization = captures
            .name("rest")
            .and_then(|rest| self.polarization.captures(rest.as_str()))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<Polarization>().ok());

        let track = track_from_orbit(absolute_orbit);
        let scene_id = match name.rfind('.') {
            Some(dot) if dot > 0 => name[..dot].to_string(),
            _ => name.clone(),
        };

        Ok(SceneMeta {
            scene_id,
            source: PathBuf::from(identifier),
            mission: captures["mission"].to_string(),
            acquired,
            absolute_orbit,
            track,
            pass: pass_from_track(track),
            pass_confirmed: false,
            polarization,
            period: Period::index_for_date(acquired.date()),
        })
    }

    /// Parse and, when metadata carries an explicit pass or heading, confirm the pass direction
    pub fn parse_with_metadata(
        &self,
        identifier: &str,
        metadata: &HashMap<String, String>,
    ) -> SarResult<SceneMeta> {
        let mut meta = self.parse(identifier)?;
        if let Some(pass) = pass_from_metadata(metadata) {
            if pass != meta.pass {
                log::debug!(
                    "{}: metadata pass {} overrides track heuristic {}",
                    meta.scene_id,
                    pass,
                    meta.pass
                );
            }
            meta.pass = pass;
            meta.pass_confirmed = true;
        }
        Ok(meta)
    }
}

/// Result of extracting metadata from a batch of inputs
#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub scenes: Vec<SceneMeta>,
    /// Inputs excluded from grouping, with the reason
    pub failures: Vec<(PathBuf, SarError)>,
    /// Inputs filtered out by polarization
    pub filtered: usize,
}

/// Metadata Extractor: scene identifiers (and optionally embedded metadata) to [`SceneMeta`]
pub struct MetadataExtractor {
    parser: SceneIdParser,
    polarization: Option<Polarization>,
    read_raster_metadata: bool,
}

impl MetadataExtractor {
    pub fn new() -> SarResult<Self> {
        Ok(Self {
            parser: SceneIdParser::new()?,
            polarization: None,
            read_raster_metadata: false,
        })
    }

    /// Keep only scenes whose identifier names this polarization
    pub fn with_polarization(mut self, polarization: Option<Polarization>) -> Self {
        self.polarization = polarization;
        self
    }

    /// Open each raster to confirm the pass direction from its metadata
    pub fn with_raster_metadata(mut self, enabled: bool) -> Self {
        self.read_raster_metadata = enabled;
        self
    }

    pub fn parser(&self) -> &SceneIdParser {
        &self.parser
    }

    /// Extract one calibrated raster
    pub fn extract_raster(&self, path: &Path) -> SarResult<SceneMeta> {
        let identifier = path.to_string_lossy();
        if !self.read_raster_metadata {
            return self.parser.parse(&identifier);
        }

        match RasterReader::read_metadata(path) {
            Ok(metadata) => self.parser.parse_with_metadata(&identifier, &metadata),
            Err(e) => {
                log::debug!("No readable metadata in {}: {}", path.display(), e);
                self.parser.parse(&identifier)
            }
        }
    }

    /// Extract a raw archive, confirming pass direction from its `manifest.safe`
    pub fn extract_archive(&self, path: &Path) -> SarResult<SceneMeta> {
        let mut meta = self.parser.parse(&path.to_string_lossy())?;

        match ManifestReader::read_archive(path) {
            Ok(info) => {
                if let Some(pass) = info.pass {
                    meta.pass = pass;
                    meta.pass_confirmed = true;
                }
                if let Some(relative) = info.relative_orbit {
                    if relative != meta.track {
                        log::warn!(
                            "{}: manifest relative orbit {} differs from derived track {}",
                            meta.scene_id,
                            relative,
                            meta.track
                        );
                    }
                }
            }
            Err(e) => log::debug!("Manifest not readable for {}: {}", path.display(), e),
        }

        Ok(meta)
    }

    /// Extract a batch; failures are collected, never silently dropped
    pub fn extract_batch(&self, paths: &[PathBuf]) -> ExtractionResult {
        log::info!("🔎 Extracting metadata from {} inputs", paths.len());

        #[cfg(feature = "parallel")]
        let outcomes: Vec<(PathBuf, SarResult<SceneMeta>)> = {
            use rayon::prelude::*;
            paths
                .par_iter()
                .map(|p| (p.clone(), self.extract_raster(p)))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<(PathBuf, SarResult<SceneMeta>)> = paths
            .iter()
            .map(|p| (p.clone(), self.extract_raster(p)))
            .collect();

        let mut result = ExtractionResult::default();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(meta) => {
                    if let Some(wanted) = self.polarization {
                        if meta.polarization.is_some() && meta.polarization != Some(wanted) {
                            result.filtered += 1;
                            continue;
                        }
                    }
                    result.scenes.push(meta);
                }
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    result.failures.push((path, e));
                }
            }
        }

        result
            .scenes
            .sort_by(|a, b| a.acquired.cmp(&b.acquired).then(a.scene_id.cmp(&b.scene_id)));

        log::info!(
            "Extracted {} scenes ({} unparseable, {} filtered by polarization)",
            result.scenes.len(),
            result.failures.len(),
            result.filtered
        );
        result
    }
}
