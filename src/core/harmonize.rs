use crate::types::{RasterTile, SarError, SarReal, SarResult};
use serde::{Deserialize, Serialize};

/// Scene standard deviation (dB) below which a scale factor is not trusted
pub const MIN_RELIABLE_STD: f64 = 0.1;

/// Bounds applied to the std ratio of a linear correction
pub const SCALE_LIMITS: (f64, f64) = (0.2, 5.0);

/// Radiometric harmonization applied before each sequential merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarmonizeMode {
    None,
    /// Mean shift only
    Additive,
    /// Mean shift and std scaling
    #[default]
    Linear,
}

/// Mean and population standard deviation of a set of valid samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
}

impl SampleStats {
    pub fn from_values<I: IntoIterator<Item = SarReal>>(values: I) -> Option<Self> {
        let (mut count, mut sum, mut sum_sq) = (0usize, 0.0f64, 0.0f64);
        for v in values {
            let v = v as f64;
            count += 1;
            sum += v;
            sum_sq += v * v;
        }
        if count == 0 {
            return None;
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        Some(Self { count, mean, std: variance.sqrt() })
    }

    /// Statistics over the valid samples of a tile
    pub fn of_tile(tile: &RasterTile) -> Option<Self> {
        Self::from_values(tile.data.iter().copied().filter(|&v| tile.is_valid(v)))
    }
}

/// Statistics of the pixels valid in both the mosaic and the incoming scene
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlapStats {
    pub pixels: usize,
    pub mosaic: SampleStats,
    pub scene: SampleStats,
}

/// Paired statistics over the ground overlap of two rasters, sampled on the scene's grid
pub fn overlap_stats(mosaic: &RasterTile, scene: &RasterTile) -> Option<OverlapStats> {
    let overlap = mosaic.bounds().intersection(&scene.bounds())?;

    let transform = &scene.grid.transform;
    let (c0, r0) = transform.geo_to_pixel(overlap.min_x, overlap.max_y);
    let (c1, r1) = transform.geo_to_pixel(overlap.max_x, overlap.min_y);
    let col_range = c0.min(c1).floor().max(0.0) as usize..(c0.max(c1).ceil() as usize).min(scene.width());
    let row_range = r0.min(r1).floor().max(0.0) as usize..(r0.max(r1).ceil() as usize).min(scene.height());

    let mut mosaic_values = Vec::new();
    let mut scene_values = Vec::new();
    for row in row_range {
        for col in col_range.clone() {
            let v = scene.data[[row, col]];
            if !scene.is_valid(v) {
                continue;
            }
            let (x, y) = transform.pixel_to_geo(col as f64 + 0.5, row as f64 + 0.5);
            if let Some(m) = mosaic.sample_at(x, y) {
                mosaic_values.push(m);
                scene_values.push(v);
            }
        }
    }

    Some(OverlapStats {
        pixels: scene_values.len(),
        mosaic: SampleStats::from_values(mosaic_values)?,
        scene: SampleStats::from_values(scene_values)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionKind {
    Identity,
    Additive,
    Linear,
}

/// `corrected = value * gain + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearCorrection {
    pub kind: CorrectionKind,
    pub gain: f64,
    pub offset: f64,
    /// Jointly valid overlap pixels the estimate is based on
    pub overlap_pixels: usize,
}

impl LinearCorrection {
    pub fn identity() -> Self {
        Self {
            kind: CorrectionKind::Identity,
            gain: 1.0,
            offset: 0.0,
            overlap_pixels: 0,
        }
    }

    fn additive(stats: &OverlapStats) -> Self {
        Self {
            kind: CorrectionKind::Additive,
            gain: 1.0,
            offset: stats.mosaic.mean - stats.scene.mean,
            overlap_pixels: stats.pixels,
        }
    }

    /// Estimate a correction mapping the scene's overlap statistics onto the mosaic's
    ///
    /// Overlaps below `min_overlap_pixels` are not corrected. A linear estimate
    /// degrades to a shift when the scene's std is below [`MIN_RELIABLE_STD`].
    pub fn estimate(stats: Option<&OverlapStats>, mode: HarmonizeMode, min_overlap_pixels: usize) -> Self {
        let stats = match stats {
            Some(stats) if mode != HarmonizeMode::None && stats.pixels >= min_overlap_pixels.max(1) => stats,
            _ => return Self::identity(),
        };

        if mode == HarmonizeMode::Additive || stats.scene.std < MIN_RELIABLE_STD {
            return Self::additive(stats);
        }

        let scale = stats.mosaic.std / stats.scene.std;
        if !scale.is_finite() {
            return Self::additive(stats);
        }
        let gain = scale.clamp(SCALE_LIMITS.0, SCALE_LIMITS.1);

        Self {
            kind: CorrectionKind::Linear,
            gain,
            offset: stats.mosaic.mean - stats.scene.mean * gain,
            overlap_pixels: stats.pixels,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.kind == CorrectionKind::Identity
    }

    /// Apply to the valid samples of a tile
    pub fn apply(&self, tile: &RasterTile) -> RasterTile {
        let mut out = tile.clone();
        if self.is_identity() {
            return out;
        }
        let nodata = tile.nodata;
        let (gain, offset) = (self.gain, self.offset);
        out.data.mapv_inplace(|v| {
            if crate::types::is_valid_sample(v, nodata) {
                (v as f64 * gain + offset) as SarReal
            } else {
                v
            }
        });
        out
    }
}

/// Global mean/std every scene of a batch is normalized to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationTarget {
    pub mean: f64,
    pub std: f64,
}

impl NormalizationTarget {
    /// Median of the per-scene means and stds
    pub fn from_scene_stats(stats: &[SampleStats]) -> SarResult<Self> {
        if stats.is_empty() {
            return Err(SarError::EmptyInput("no scene statistics to derive a target".to_string()));
        }
        let median = |mut values: Vec<f64>| {
            values.sort_unstable_by(|a, b| a.total_cmp(b));
            let n = values.len();
            if n % 2 == 0 {
                (values[n / 2 - 1] + values[n / 2]) / 2.0
            } else {
                values[n / 2]
            }
        };
        Ok(Self {
            mean: median(stats.iter().map(|s| s.mean).collect()),
            std: median(stats.iter().map(|s| s.std).collect()),
        })
    }
}

/// `(v - mean) / std * target_std + target_mean` over valid samples; scenes
/// without spread or without valid samples are returned unchanged
pub fn normalize_to_target(tile: &RasterTile, target: &NormalizationTarget) -> RasterTile {
    let Some(stats) = SampleStats::of_tile(tile) else {
        return tile.clone();
    };
    if stats.std <= 0.0 {
        log::debug!("Scene has no spread, skipping normalization");
        return tile.clone();
    }

    log::debug!(
        "Normalizing mean={:.2} std={:.2} to mean={:.2} std={:.2}",
        stats.mean,
        stats.std,
        target.mean,
        target.std
    );
    let gain = target.std / stats.std;
    LinearCorrection {
        kind: CorrectionKind::Linear,
        gain,
        offset: target.mean - stats.mean * gain,
        overlap_pixels: stats.count,
    }
    .apply(tile)
}
