use crate::core::composite::median_in_place;
use crate::io::raster_io::{GdalRasterSource, GeoTiffTileSink};
use crate::types::{
    is_valid_sample, BoundingBox, GeoTransform, RasterGrid, RasterTile, SarError, SarReal,
    SarRealImage, SarResult, ValidRange, DEFAULT_NODATA,
};
use ndarray::{s, Array2, Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Rule combining overlapping valid samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    Minimum,
    Maximum,
    Mean,
    #[default]
    Median,
    /// First listed input with a valid sample wins
    FirstWins,
}

/// Tiled mosaic parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicParams {
    pub policy: OverlapPolicy,
    /// Edge length of the square processing tiles (pixels)
    pub tile_size: usize,
    pub nodata: SarReal,
    /// Samples outside this range are treated as invalid
    pub valid_range: Option<ValidRange>,
    /// Tiles processed concurrently per batch; 0 uses the rayon pool size
    pub max_concurrent_tiles: usize,
}

impl Default for MosaicParams {
    fn default() -> Self {
        Self {
            policy: OverlapPolicy::default(),
            tile_size: 2048,
            nodata: DEFAULT_NODATA,
            valid_range: Some(ValidRange::backscatter_db()),
            max_concurrent_tiles: 0,
        }
    }
}

/// Readable single-band raster participating in a mosaic
pub trait RasterSource: Send + Sync {
    fn name(&self) -> String;

    fn grid(&self) -> &RasterGrid;

    fn nodata(&self) -> SarReal;

    /// Pixel window of the source's own grid
    fn read_window(&self, col: usize, row: usize, width: usize, height: usize)
        -> SarResult<SarRealImage>;
}

impl RasterSource for RasterTile {
    fn name(&self) -> String {
        format!("in-memory {}x{} raster", self.width(), self.height())
    }

    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn nodata(&self) -> SarReal {
        self.nodata
    }

    fn read_window(
        &self,
        col: usize,
        row: usize,
        width: usize,
        height: usize,
    ) -> SarResult<SarRealImage> {
        if col + width > self.width() || row + height > self.height() {
            return Err(SarError::InvalidFormat(format!(
                "Window {}x{} at ({}, {}) outside {}x{} raster",
                width,
                height,
                col,
                row,
                self.width(),
                self.height()
            )));
        }
        Ok(self.data.slice(s![row..row + height, col..col + width]).to_owned())
    }
}

/// Receives finished output tiles at their pixel offset
pub trait TileSink {
    fn write_tile(&mut self, col: usize, row: usize, data: &SarRealImage) -> SarResult<()>;
}

/// Sink assembling the mosaic in memory
pub struct MemorySink {
    tile: RasterTile,
}

impl MemorySink {
    pub fn new(grid: RasterGrid, nodata: SarReal) -> Self {
        Self {
            tile: RasterTile::filled(grid, nodata),
        }
    }

    pub fn into_tile(self) -> RasterTile {
        self.tile
    }
}

impl TileSink for MemorySink {
    fn write_tile(&mut self, col: usize, row: usize, data: &SarRealImage) -> SarResult<()> {
        let (height, width) = data.dim();
        self.tile
            .data
            .slice_mut(s![row..row + height, col..col + width])
            .assign(data);
        Ok(())
    }
}

/// What happened to the inputs of one mosaic
#[derive(Debug, Clone, Default, Serialize)]
pub struct MosaicSummary {
    pub inputs: usize,
    pub used: usize,
    /// Inputs left out, with the reason
    pub skipped: Vec<(String, String)>,
    pub tiles: usize,
    /// Tiles no input contributed to
    pub empty_tiles: usize,
}

/// One output tile: pixel offset and size in the output grid
#[derive(Debug, Clone, Copy)]
struct TileWindow {
    col: usize,
    row: usize,
    width: usize,
    height: usize,
}

/// Accumulated tile, plus inputs that failed to read for it
struct TileOutput {
    data: Option<Array2<SarReal>>,
    read_failures: Vec<(usize, String)>,
}

/// Source pixel ranges covering an output tile
struct SourceWindow {
    /// Per output column, source column relative to `col0`
    col_map: Vec<Option<usize>>,
    /// Per output row, source row relative to `row0`
    row_map: Vec<Option<usize>>,
    col0: usize,
    row0: usize,
    width: usize,
    height: usize,
}

/// Per-tile accumulation buffer
enum Accumulator {
    Extremum { values: Array2<SarReal>, keep_min: bool },
    Mean { sum: Array2<f64>, count: Array2<u32> },
    /// Column store: one layer per intersecting input, reduced lane by lane
    Median { column: Array3<SarReal>, layer: usize },
    FirstWins { values: Array2<SarReal>, filled: Array2<bool> },
}

impl Accumulator {
    fn new(policy: OverlapPolicy, shape: (usize, usize), contributors: usize) -> Self {
        match policy {
            OverlapPolicy::Minimum => Accumulator::Extremum {
                values: Array2::from_elem(shape, SarReal::INFINITY),
                keep_min: true,
            },
            OverlapPolicy::Maximum => Accumulator::Extremum {
                values: Array2::from_elem(shape, SarReal::NEG_INFINITY),
                keep_min: false,
            },
            OverlapPolicy::Mean => Accumulator::Mean {
                sum: Array2::zeros(shape),
                count: Array2::zeros(shape),
            },
            OverlapPolicy::Median => Accumulator::Median {
                column: Array3::from_elem((contributors, shape.0, shape.1), SarReal::NAN),
                layer: 0,
            },
            OverlapPolicy::FirstWins => Accumulator::FirstWins {
                values: Array2::zeros(shape),
                filled: Array2::from_elem(shape, false),
            },
        }
    }

    /// Add one input's samples; `NaN` marks pixels it does not cover
    fn add(&mut self, samples: &Array2<SarReal>) {
        match self {
            Accumulator::Extremum { values, keep_min } => {
                let keep_min = *keep_min;
                Zip::from(values).and(samples).for_each(|acc, &v| {
                    if v.is_nan() {
                        return;
                    }
                    if (keep_min && v < *acc) || (!keep_min && v > *acc) {
                        *acc = v;
                    }
                });
            }
            Accumulator::Mean { sum, count } => {
                Zip::from(sum).and(count).and(samples).for_each(|s, c, &v| {
                    if !v.is_nan() {
                        *s += v as f64;
                        *c += 1;
                    }
                });
            }
            Accumulator::Median { column, layer } => {
                column.index_axis_mut(Axis(0), *layer).assign(samples);
                *layer += 1;
            }
            Accumulator::FirstWins { values, filled } => {
                Zip::from(values).and(filled).and(samples).for_each(|acc, f, &v| {
                    if !*f && !v.is_nan() {
                        *acc = v;
                        *f = true;
                    }
                });
            }
        }
    }

    fn finish(self, nodata: SarReal) -> Array2<SarReal> {
        match self {
            Accumulator::Extremum { mut values, .. } => {
                values.mapv_inplace(|v| if v.is_finite() { v } else { nodata });
                values
            }
            Accumulator::Mean { sum, count } => {
                let mut out = Array2::from_elem(sum.dim(), nodata);
                Zip::from(&mut out).and(&sum).and(&count).for_each(|o, &s, &c| {
                    if c > 0 {
                        *o = (s / c as f64) as SarReal;
                    }
                });
                out
            }
            Accumulator::Median { column, .. } => {
                let (_, height, width) = column.dim();
                let mut out = Array2::from_elem((height, width), nodata);
                let mut scratch = Vec::with_capacity(column.len_of(Axis(0)));
                Zip::from(&mut out)
                    .and(column.lanes(Axis(0)))
                    .for_each(|o, lane| {
                        scratch.clear();
                        scratch.extend(lane.iter().copied().filter(|v| !v.is_nan()));
                        if let Some(m) = median_in_place(&mut scratch) {
                            *o = m;
                        }
                    });
                out
            }
            Accumulator::FirstWins { values, filled } => {
                let mut out = values;
                Zip::from(&mut out).and(&filled).for_each(|o, &f| {
                    if !f {
                        *o = nodata;
                    }
                });
                out
            }
        }
    }
}

/// Tiled Mosaic Engine: bounded-memory merge of overlapping rasters
pub struct TiledMosaicEngine {
    params: MosaicParams,
}

impl TiledMosaicEngine {
    pub fn new() -> Self {
        Self {
            params: MosaicParams::default(),
        }
    }

    pub fn with_params(params: MosaicParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &MosaicParams {
        &self.params
    }

    /// Output grid: union extent of the inputs at the median input pixel size
    pub fn output_grid(&self, sources: &[&dyn RasterSource]) -> SarResult<RasterGrid> {
        let first = sources
            .first()
            .ok_or_else(|| SarError::EmptyInput("no rasters to mosaic".to_string()))?;

        let mut bounds: BoundingBox = first.grid().bounds();
        let mut widths = Vec::with_capacity(sources.len());
        let mut heights = Vec::with_capacity(sources.len());
        for source in sources {
            bounds = bounds.union(&source.grid().bounds());
            widths.push(source.grid().transform.pixel_width.abs());
            heights.push(source.grid().transform.pixel_height.abs());
        }

        let pixel_width = median_f64(&mut widths);
        let pixel_height = median_f64(&mut heights);
        let crs = sources
            .iter()
            .map(|s| s.grid().crs.clone())
            .find(|crs| !crs.trim().is_empty())
            .unwrap_or_default();

        let width = pixel_count(bounds.width(), pixel_width);
        let height = pixel_count(bounds.height(), pixel_height);
        log::debug!(
            "Output grid {}x{} at {:.3}x{:.3} covering [{:.3}, {:.3}, {:.3}, {:.3}]",
            width,
            height,
            pixel_width,
            pixel_height,
            bounds.min_x,
            bounds.min_y,
            bounds.max_x,
            bounds.max_y
        );

        Ok(RasterGrid::new(
            GeoTransform::north_up(bounds.min_x, bounds.max_y, pixel_width, pixel_height),
            width,
            height,
            crs,
        ))
    }

    /// Drop inputs that cannot join this mosaic; the rest share the first usable CRS
    fn usable_sources<'a>(
        &self,
        sources: &[&'a dyn RasterSource],
        summary: &mut MosaicSummary,
    ) -> SarResult<Vec<&'a dyn RasterSource>> {
        let mut usable: Vec<&'a dyn RasterSource> = Vec::with_capacity(sources.len());
        for &source in sources {
            let grid = source.grid();
            let reason = if grid.transform.is_rotated() {
                Some("rotated grid")
            } else if grid.width == 0 || grid.height == 0 {
                Some("empty raster")
            } else if usable.first().map_or(false, |r| !r.grid().same_crs(grid)) {
                Some("CRS differs from the first input")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    log::warn!("Skipping {}: {}", source.name(), reason);
                    summary.skipped.push((source.name(), reason.to_string()));
                }
                None => usable.push(source),
            }
        }

        if usable.is_empty() {
            return Err(SarError::EmptyInput("no usable rasters to mosaic".to_string()));
        }
        summary.inputs += sources.len();
        summary.used = usable.len();
        Ok(usable)
    }

    /// Mosaic `sources` onto a caller-provided grid, writing every tile to `sink`
    pub fn mosaic_into(
        &self,
        sources: &[&dyn RasterSource],
        grid: &RasterGrid,
        sink: &mut dyn TileSink,
    ) -> SarResult<MosaicSummary> {
        let mut summary = MosaicSummary::default();
        let usable = self.usable_sources(sources, &mut summary)?;
        self.run(&usable, grid, sink, summary)
    }

    /// Mosaic in memory onto the union grid of the inputs
    pub fn mosaic_to_memory(
        &self,
        sources: &[&dyn RasterSource],
    ) -> SarResult<(RasterTile, MosaicSummary)> {
        let mut summary = MosaicSummary::default();
        let usable = self.usable_sources(sources, &mut summary)?;
        let grid = self.output_grid(&usable)?;

        let mut sink = MemorySink::new(grid.clone(), self.params.nodata);
        let summary = self.run(&usable, &grid, &mut sink, summary)?;
        Ok((sink.into_tile(), summary))
    }

    /// Mosaic raster files into a GeoTIFF; unopenable inputs are logged and skipped
    pub fn mosaic_files(&self, inputs: &[PathBuf], output: &Path) -> SarResult<MosaicSummary> {
        let mut summary = MosaicSummary::default();
        let mut opened = Vec::with_capacity(inputs.len());
        for path in inputs {
            match GdalRasterSource::open(path) {
                Ok(source) => opened.push(source),
                Err(e) => {
                    log::warn!("Cannot open {}: {}", path.display(), e);
                    summary.inputs += 1;
                    summary.skipped.push((path.display().to_string(), e.to_string()));
                }
            }
        }

        let sources: Vec<&dyn RasterSource> =
            opened.iter().map(|s| s as &dyn RasterSource).collect();
        let usable = self.usable_sources(&sources, &mut summary)?;
        let grid = self.output_grid(&usable)?;

        let mut sink = GeoTiffTileSink::create(output, &grid, self.params.nodata)?;
        let summary = self.run(&usable, &grid, &mut sink, summary)?;
        sink.finish()?;
        Ok(summary)
    }

    fn run(
        &self,
        sources: &[&dyn RasterSource],
        grid: &RasterGrid,
        sink: &mut dyn TileSink,
        mut summary: MosaicSummary,
    ) -> SarResult<MosaicSummary> {
        let windows = self.tile_windows(grid);
        summary.tiles = windows.len();
        let batch_size = match self.params.max_concurrent_tiles {
            0 => rayon::current_num_threads().max(1),
            n => n,
        };

        log::info!(
            "🗺️  Mosaicking {} rasters ({:?}) into {}x{} grid, {} tiles of {}px",
            sources.len(),
            self.params.policy,
            grid.width,
            grid.height,
            windows.len(),
            self.params.tile_size
        );

        // Inputs whose reads fail are dropped for the rest of the run
        let mut active = vec![true; sources.len()];

        for (batch_index, batch) in windows.chunks(batch_size).enumerate() {
            let live: Vec<(usize, &dyn RasterSource)> = sources
                .iter()
                .enumerate()
                .filter(|(i, _)| active[*i])
                .map(|(i, s)| (i, *s))
                .collect();

            #[cfg(feature = "parallel")]
            let results: Vec<TileOutput> = {
                use rayon::prelude::*;
                batch
                    .par_iter()
                    .map(|window| self.process_tile(*window, grid, &live))
                    .collect()
            };
            #[cfg(not(feature = "parallel"))]
            let results: Vec<TileOutput> = batch
                .iter()
                .map(|window| self.process_tile(*window, grid, &live))
                .collect();

            for (window, result) in batch.iter().zip(results) {
                for (index, reason) in result.read_failures {
                    if active[index] {
                        active[index] = false;
                        let name = sources[index].name();
                        log::warn!("Skipping {}: read failed: {}", name, reason);
                        summary.skipped.push((name, format!("read failed: {}", reason)));
                        summary.used = summary.used.saturating_sub(1);
                    }
                }
                let data = match result.data {
                    Some(data) => data,
                    None => {
                        summary.empty_tiles += 1;
                        Array2::from_elem((window.height, window.width), self.params.nodata)
                    }
                };
                sink.write_tile(window.col, window.row, &data)?;
            }
            if !active.iter().any(|a| *a) {
                return Err(SarError::EmptyInput(
                    "every input failed to read".to_string(),
                ));
            }
            log::debug!("Batch {} written ({} tiles)", batch_index + 1, batch.len());
        }

        log::info!(
            "✅ Mosaic complete: {} of {} inputs used, {} empty tiles",
            summary.used,
            summary.inputs,
            summary.empty_tiles
        );
        Ok(summary)
    }

    fn tile_windows(&self, grid: &RasterGrid) -> Vec<TileWindow> {
        let size = self.params.tile_size.max(1);
        let mut windows = Vec::new();
        for row in (0..grid.height).step_by(size) {
            for col in (0..grid.width).step_by(size) {
                windows.push(TileWindow {
                    col,
                    row,
                    width: size.min(grid.width - col),
                    height: size.min(grid.height - row),
                });
            }
        }
        windows
    }

    /// Accumulate all intersecting inputs over one output tile
    ///
    /// An input whose window cannot be read is left out of the tile and
    /// reported by its index in `sources`.
    fn process_tile(
        &self,
        window: TileWindow,
        grid: &RasterGrid,
        sources: &[(usize, &dyn RasterSource)],
    ) -> TileOutput {
        let windows: Vec<(usize, &dyn RasterSource, SourceWindow)> = sources
            .iter()
            .filter_map(|&(index, source)| {
                source_window(source.grid(), grid, window).map(|w| (index, source, w))
            })
            .collect();
        let mut output = TileOutput { data: None, read_failures: Vec::new() };
        if windows.is_empty() {
            return output;
        }

        let shape = (window.height, window.width);
        let mut accumulator = Accumulator::new(self.params.policy, shape, windows.len());
        let mut contributed = false;

        for (index, source, sw) in &windows {
            let block = match source.read_window(sw.col0, sw.row0, sw.width, sw.height) {
                Ok(block) => block,
                Err(e) => {
                    output.read_failures.push((*index, e.to_string()));
                    continue;
                }
            };
            let nodata = source.nodata();
            let mut samples = Array2::from_elem(shape, SarReal::NAN);

            for (i, row) in sw.row_map.iter().enumerate() {
                let Some(r) = row else { continue };
                for (j, col) in sw.col_map.iter().enumerate() {
                    let Some(c) = col else { continue };
                    let v = block[[*r, *c]];
                    if self.is_valid(v, nodata) {
                        samples[[i, j]] = v;
                        contributed = true;
                    }
                }
            }
            accumulator.add(&samples);
        }

        if contributed {
            output.data = Some(accumulator.finish(self.params.nodata));
        }
        output
    }

    fn is_valid(&self, value: SarReal, nodata: SarReal) -> bool {
        is_valid_sample(value, nodata)
            && self.params.valid_range.map_or(true, |range| range.contains(value))
    }
}

impl Default for TiledMosaicEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn median_f64(values: &mut [f64]) -> f64 {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    match values.len() {
        0 => 1.0,
        n if n % 2 == 0 => (values[n / 2 - 1] + values[n / 2]) / 2.0,
        n => values[n / 2],
    }
}

/// Number of pixels covering `extent`, snapping near-integers
fn pixel_count(extent: f64, pixel: f64) -> usize {
    let n = extent / pixel;
    let rounded = n.round();
    if (n - rounded).abs() < 1e-6 {
        rounded.max(1.0) as usize
    } else {
        n.ceil().max(1.0) as usize
    }
}

/// Map output tile pixel centres through the source's own transform
fn source_window(source: &RasterGrid, output: &RasterGrid, window: TileWindow) -> Option<SourceWindow> {
    let col_abs: Vec<Option<usize>> = (0..window.width)
        .map(|j| {
            let (x, _) = output
                .transform
                .pixel_to_geo((window.col + j) as f64 + 0.5, 0.0);
            let c = (x - source.transform.top_left_x) / source.transform.pixel_width;
            (c >= 0.0 && c < source.width as f64).then(|| c.floor() as usize)
        })
        .collect();
    let row_abs: Vec<Option<usize>> = (0..window.height)
        .map(|i| {
            let (_, y) = output
                .transform
                .pixel_to_geo(0.0, (window.row + i) as f64 + 0.5);
            let r = (y - source.transform.top_left_y) / source.transform.pixel_height;
            (r >= 0.0 && r < source.height as f64).then(|| r.floor() as usize)
        })
        .collect();

    let col0 = col_abs.iter().flatten().min().copied()?;
    let col1 = col_abs.iter().flatten().max().copied()?;
    let row0 = row_abs.iter().flatten().min().copied()?;
    let row1 = row_abs.iter().flatten().max().copied()?;

    Some(SourceWindow {
        col_map: col_abs.into_iter().map(|c| c.map(|c| c - col0)).collect(),
        row_map: row_abs.into_iter().map(|r| r.map(|r| r - row0)).collect(),
        col0,
        row0,
        width: col1 - col0 + 1,
        height: row1 - row0 + 1,
    })
}
