use crate::core::mosaic::RasterSource;
use crate::core::period::Period;
use crate::core::resample::{resample_to_grid, ResampleMethod};
use crate::types::{
    is_valid_sample, RasterGrid, RasterTile, SarError, SarReal, SarRealImage, SarResult,
    DEFAULT_NODATA, PERIODS_PER_YEAR,
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stack assembly parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackParams {
    pub year: i32,
    pub nodata: SarReal,
    /// Used for mosaics not on the reference grid
    pub resample: ResampleMethod,
    /// Fill nodata-only bands from their nearest valid neighbours in time
    pub gap_fill: bool,
    /// Valid-pixel fraction above which a band counts as complete
    pub complete_coverage: f64,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            year: 2024,
            nodata: DEFAULT_NODATA,
            resample: ResampleMethod::Nearest,
            gap_fill: true,
            complete_coverage: 0.99,
        }
    }
}

/// Multi-band raster readable band by band
pub trait BandSource {
    /// Read 1-based `band`
    fn read_band(&self, band: usize) -> SarResult<SarRealImage>;
}

/// Destination of a multi-band stack, written band by band
pub trait BandSink: BandSource {
    /// Write 1-based `band` with a description label
    fn write_band(&mut self, band: usize, data: &SarRealImage, label: &str) -> SarResult<()>;
}

/// Stack held in memory
#[derive(Debug, Clone)]
pub struct MemoryBandSink {
    pub grid: RasterGrid,
    pub bands: Vec<SarRealImage>,
    pub labels: Vec<String>,
}

impl MemoryBandSink {
    pub fn new(grid: RasterGrid, nodata: SarReal, bands: usize) -> Self {
        let empty = Array2::from_elem((grid.height, grid.width), nodata);
        Self {
            bands: vec![empty; bands],
            labels: vec![String::new(); bands],
            grid,
        }
    }

    fn index(&self, band: usize) -> SarResult<usize> {
        if band == 0 || band > self.bands.len() {
            return Err(SarError::InvalidFormat(format!(
                "Band {} outside 1..={}",
                band,
                self.bands.len()
            )));
        }
        Ok(band - 1)
    }
}

impl BandSink for MemoryBandSink {
    fn write_band(&mut self, band: usize, data: &SarRealImage, label: &str) -> SarResult<()> {
        let index = self.index(band)?;
        self.bands[index] = data.clone();
        self.labels[index] = label.to_string();
        Ok(())
    }
}

impl BandSource for MemoryBandSink {
    fn read_band(&self, band: usize) -> SarResult<SarRealImage> {
        Ok(self.bands[self.index(band)?].clone())
    }
}

/// How a band's content was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BandStatus {
    Copied,
    Resampled,
    /// Pixel-wise average of the nearest earlier and later bands
    Interpolated { earlier: u8, later: u8 },
    /// Copy of the only valid neighbour
    Duplicated { from: u8 },
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandReport {
    pub band: u8,
    pub label: String,
    pub status: BandStatus,
    /// Fraction of valid pixels after filling
    pub coverage: f64,
}

/// Summary of an assembled stack
#[derive(Debug, Clone, Serialize)]
pub struct StackReport {
    pub bands: Vec<BandReport>,
    /// Bands with coverage above the completeness threshold
    pub complete_bands: usize,
}

impl StackReport {
    pub fn missing_periods(&self) -> Vec<u8> {
        self.bands
            .iter()
            .filter(|b| b.status == BandStatus::Missing)
            .map(|b| b.band)
            .collect()
    }

    pub fn filled_periods(&self) -> Vec<u8> {
        self.bands
            .iter()
            .filter(|b| matches!(b.status, BandStatus::Interpolated { .. } | BandStatus::Duplicated { .. }))
            .map(|b| b.band)
            .collect()
    }
}

/// Temporal Stack Assembler: one band per 12-day period
pub struct StackAssembler {
    params: StackParams,
}

impl StackAssembler {
    pub fn new() -> Self {
        Self {
            params: StackParams::default(),
        }
    }

    pub fn with_params(params: StackParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StackParams {
        &self.params
    }

    /// Grid of the earliest available period
    pub fn reference_grid(&self, mosaics: &BTreeMap<u8, &dyn RasterSource>) -> SarResult<RasterGrid> {
        Self::check_periods(mosaics)?;
        mosaics
            .values()
            .next()
            .map(|source| source.grid().clone())
            .ok_or_else(|| SarError::EmptyInput("no period mosaics to stack".to_string()))
    }

    fn check_periods(mosaics: &BTreeMap<u8, &dyn RasterSource>) -> SarResult<()> {
        match mosaics.keys().find(|p| !(1..=PERIODS_PER_YEAR).contains(*p)) {
            Some(p) => Err(SarError::InvalidFormat(format!(
                "Period {} outside 1..={}",
                p, PERIODS_PER_YEAR
            ))),
            None => Ok(()),
        }
    }

    fn label(&self, period: u8) -> String {
        Period::new(self.params.year, period)
            .map(|p| p.label())
            .unwrap_or_else(|_| format!("P{:02}", period))
    }

    fn coverage(&self, data: &SarRealImage) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let nodata = self.params.nodata;
        let valid = data.iter().filter(|&&v| is_valid_sample(v, nodata)).count();
        valid as f64 / data.len() as f64
    }

    /// Write all 31 bands to `sink`; band index always equals period index
    pub fn assemble(
        &self,
        mosaics: &BTreeMap<u8, &dyn RasterSource>,
        sink: &mut dyn BandSink,
    ) -> SarResult<StackReport> {
        let reference = self.reference_grid(mosaics)?;
        let nodata = self.params.nodata;
        log::info!(
            "📚 Stacking {}/{} period mosaics onto {}x{} reference grid",
            mosaics.len(),
            PERIODS_PER_YEAR,
            reference.width,
            reference.height
        );

        let mut statuses: BTreeMap<u8, BandStatus> = BTreeMap::new();
        let mut coverage: BTreeMap<u8, f64> = BTreeMap::new();

        for period in 1..=PERIODS_PER_YEAR {
            let label = self.label(period);
            let (data, status) = match mosaics.get(&period) {
                Some(source) => self.align(*source, &reference)?,
                None => {
                    log::warn!("Missing: period {} mosaic", period);
                    (Array2::from_elem((reference.height, reference.width), nodata), BandStatus::Missing)
                }
            };

            let band_coverage = self.coverage(&data);
            let status = if band_coverage == 0.0 { BandStatus::Missing } else { status };
            sink.write_band(period as usize, &data, &label)?;
            statuses.insert(period, status);
            coverage.insert(period, band_coverage);
        }

        if self.params.gap_fill {
            self.fill_gaps(sink, &mut statuses, &mut coverage)?;
        }

        let bands: Vec<BandReport> = (1..=PERIODS_PER_YEAR)
            .map(|period| BandReport {
                band: period,
                label: self.label(period),
                status: statuses.get(&period).copied().unwrap_or(BandStatus::Missing),
                coverage: coverage.get(&period).copied().unwrap_or(0.0),
            })
            .collect();
        let complete_bands = bands
            .iter()
            .filter(|b| b.coverage > self.params.complete_coverage)
            .count();

        let report = StackReport { bands, complete_bands };
        log::info!(
            "✅ Stack assembled: {} complete bands, filled {:?}, missing {:?}",
            report.complete_bands,
            report.filled_periods(),
            report.missing_periods()
        );
        Ok(report)
    }

    /// Read a period mosaic and bring it onto the reference grid
    fn align(&self, source: &dyn RasterSource, reference: &RasterGrid) -> SarResult<(SarRealImage, BandStatus)> {
        let grid = source.grid().clone();
        let data = source.read_window(0, 0, grid.width, grid.height)?;
        let tile = RasterTile::new(grid, source.nodata(), data)?;

        let (tile, status) = if tile.grid.matches(reference) {
            (tile, BandStatus::Copied)
        } else {
            log::debug!("Resampling {} onto reference grid", source.name());
            (resample_to_grid(&tile, reference, self.params.resample)?, BandStatus::Resampled)
        };

        // Translate the mosaic's own nodata into the stack's
        let nodata = self.params.nodata;
        let source_nodata = tile.nodata;
        let mut data = tile.data;
        data.mapv_inplace(|v| if is_valid_sample(v, source_nodata) { v } else { nodata });
        Ok((data, status))
    }

    /// Fill nodata-only bands from the nearest original (unfilled) neighbours
    fn fill_gaps(
        &self,
        sink: &mut dyn BandSink,
        statuses: &mut BTreeMap<u8, BandStatus>,
        coverage: &mut BTreeMap<u8, f64>,
    ) -> SarResult<()> {
        let originals: Vec<u8> = statuses
            .iter()
            .filter(|(_, s)| **s != BandStatus::Missing)
            .map(|(p, _)| *p)
            .collect();
        let gaps: Vec<u8> = statuses
            .iter()
            .filter(|(_, s)| **s == BandStatus::Missing)
            .map(|(p, _)| *p)
            .collect();
        let nodata = self.params.nodata;

        for period in gaps {
            let earlier = originals.iter().rev().find(|&&p| p < period).copied();
            let later = originals.iter().find(|&&p| p > period).copied();

            let (data, status) = match (earlier, later) {
                (Some(e), Some(l)) => {
                    let before = sink.read_band(e as usize)?;
                    let after = sink.read_band(l as usize)?;
                    let mut data = Array2::from_elem(before.dim(), nodata);
                    Zip::from(&mut data).and(&before).and(&after).for_each(|out, &a, &b| {
                        *out = match (is_valid_sample(a, nodata), is_valid_sample(b, nodata)) {
                            (true, true) => (a + b) / 2.0,
                            (true, false) => a,
                            (false, true) => b,
                            (false, false) => nodata,
                        };
                    });
                    (data, BandStatus::Interpolated { earlier: e, later: l })
                }
                (Some(n), None) | (None, Some(n)) => {
                    (sink.read_band(n as usize)?, BandStatus::Duplicated { from: n })
                }
                (None, None) => continue,
            };

            log::info!("Filled period {} ({:?})", period, status);
            coverage.insert(period, self.coverage(&data));
            sink.write_band(period as usize, &data, &self.label(period))?;
            statuses.insert(period, status);
        }
        Ok(())
    }
}

impl Default for StackAssembler {
    fn default() -> Self {
        Self::new()
    }
}
