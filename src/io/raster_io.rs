use crate::core::mosaic::{RasterSource, TileSink};
use crate::core::stack::{BandSink, BandSource};
use crate::types::{
    GeoTransform, RasterGrid, RasterTile, SarError, SarReal, SarRealImage, SarResult,
    DEFAULT_NODATA,
};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Creation options for every GeoTIFF this crate writes
const CREATION_OPTIONS: [RasterCreationOption<'static>; 3] = [
    RasterCreationOption { key: "COMPRESS", value: "LZW" },
    RasterCreationOption { key: "TILED", value: "YES" },
    RasterCreationOption { key: "BIGTIFF", value: "IF_SAFER" },
];

/// Header of a single-band raster
#[derive(Debug, Clone)]
pub struct RasterHeader {
    pub grid: RasterGrid,
    pub nodata: SarReal,
}

/// Sibling path an output is written to before being renamed into place
pub fn partial_path(path: &Path) -> PathBuf {
    path.with_extension("partial.tif")
}

/// Rename a finished partial output into place
pub fn commit(partial: &Path, path: &Path) -> SarResult<()> {
    std::fs::rename(partial, path)?;
    Ok(())
}

/// GDAL reader/writer for single-band float rasters
pub struct RasterReader;

impl RasterReader {
    /// Grid and nodata of band 1; a missing nodata value falls back to the default sentinel
    pub fn read_header<P: AsRef<Path>>(path: P) -> SarResult<RasterHeader> {
        let dataset = Dataset::open(path.as_ref())?;
        Self::header_of(&dataset)
    }

    fn header_of(dataset: &Dataset) -> SarResult<RasterHeader> {
        let (width, height) = dataset.raster_size();
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let crs = dataset.projection();
        let rasterband = dataset.rasterband(1)?;
        let nodata = rasterband
            .no_data_value()
            .map(|v| v as SarReal)
            .unwrap_or(DEFAULT_NODATA);

        Ok(RasterHeader {
            grid: RasterGrid::new(transform, width, height, crs),
            nodata,
        })
    }

    /// Read the whole of band 1
    pub fn read_tile<P: AsRef<Path>>(path: P) -> SarResult<RasterTile> {
        let path = path.as_ref();
        log::debug!("Reading raster: {}", path.display());

        let dataset = Dataset::open(path)?;
        let header = Self::header_of(&dataset)?;
        let (width, height) = (header.grid.width, header.grid.height);

        let rasterband = dataset.rasterband(1)?;
        let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
        let data = Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| SarError::Processing(format!("Failed to reshape raster data: {}", e)))?;

        RasterTile::new(header.grid, header.nodata, data)
    }

    /// Read a pixel window of band 1
    pub fn read_window<P: AsRef<Path>>(
        path: P,
        col: usize,
        row: usize,
        width: usize,
        height: usize,
    ) -> SarResult<SarRealImage> {
        let dataset = Dataset::open(path.as_ref())?;
        read_band_window(&dataset, 1, col, row, width, height)
    }

    /// Default-domain metadata of the dataset and of band 1 (band entries win)
    pub fn read_metadata<P: AsRef<Path>>(path: P) -> SarResult<HashMap<String, String>> {
        let dataset = Dataset::open(path.as_ref())?;
        let mut metadata = HashMap::new();

        let mut collect = |entries: Option<Vec<String>>| {
            for entry in entries.unwrap_or_default() {
                if let Some((key, value)) = entry.split_once('=') {
                    metadata.insert(key.to_string(), value.to_string());
                }
            }
        };
        collect(dataset.metadata_domain(""));
        collect(dataset.rasterband(1)?.metadata_domain(""));

        Ok(metadata)
    }

    /// Write a tile as a compressed GeoTIFF; the file appears only once complete
    pub fn write_geotiff<P: AsRef<Path>>(path: P, tile: &RasterTile) -> SarResult<()> {
        Self::write_geotiff_with_metadata(path, tile, &HashMap::new())
    }

    pub fn write_geotiff_with_metadata<P: AsRef<Path>>(
        path: P,
        tile: &RasterTile,
        metadata: &HashMap<String, String>,
    ) -> SarResult<()> {
        let path = path.as_ref();
        let partial = partial_path(path);
        log::debug!("Writing GeoTIFF: {}", path.display());

        {
            let mut dataset = create_geotiff(&partial, &tile.grid, 1)?;
            for (key, value) in metadata {
                dataset.set_metadata_item(key, value, "")?;
            }
            let mut rasterband = dataset.rasterband(1)?;
            rasterband.set_no_data_value(Some(tile.nodata as f64))?;
            write_band_window(&mut rasterband, 0, 0, &tile.data)?;
        }

        commit(&partial, path)
    }
}

fn create_geotiff(path: &Path, grid: &RasterGrid, bands: usize) -> SarResult<Dataset> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path,
        grid.width as isize,
        grid.height as isize,
        bands as isize,
        &CREATION_OPTIONS,
    )?;

    dataset.set_geo_transform(&grid.transform.to_gdal())?;
    if !grid.crs.trim().is_empty() {
        let srs = SpatialRef::from_definition(&grid.crs)?;
        dataset.set_spatial_ref(&srs)?;
    }
    Ok(dataset)
}

fn read_band_window(
    dataset: &Dataset,
    band: isize,
    col: usize,
    row: usize,
    width: usize,
    height: usize,
) -> SarResult<SarRealImage> {
    let rasterband = dataset.rasterband(band)?;
    let buffer = rasterband.read_as::<f32>(
        (col as isize, row as isize),
        (width, height),
        (width, height),
        None,
    )?;
    Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| SarError::Processing(format!("Failed to reshape window: {}", e)))
}

fn write_band_window(
    rasterband: &mut gdal::raster::RasterBand,
    col: usize,
    row: usize,
    data: &SarRealImage,
) -> SarResult<()> {
    let (height, width) = data.dim();
    let flat_data: Vec<f32> = data.iter().cloned().collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((col as isize, row as isize), (width, height), &buffer)?;
    Ok(())
}

/// Mosaic input backed by a file; the dataset is reopened on every read so
/// workers never share a GDAL handle
pub struct GdalRasterSource {
    path: PathBuf,
    header: RasterHeader,
}

impl GdalRasterSource {
    pub fn open<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        let path = path.as_ref().to_path_buf();
        let header = RasterReader::read_header(&path)?;
        Ok(Self { path, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RasterSource for GdalRasterSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn grid(&self) -> &RasterGrid {
        &self.header.grid
    }

    fn nodata(&self) -> SarReal {
        self.header.nodata
    }

    fn read_window(
        &self,
        col: usize,
        row: usize,
        width: usize,
        height: usize,
    ) -> SarResult<SarRealImage> {
        RasterReader::read_window(&self.path, col, row, width, height)
    }
}

/// Tile sink writing into a single-band GeoTIFF
pub struct GeoTiffTileSink {
    dataset: Dataset,
    partial: PathBuf,
    path: PathBuf,
}

impl GeoTiffTileSink {
    pub fn create<P: AsRef<Path>>(path: P, grid: &RasterGrid, nodata: SarReal) -> SarResult<Self> {
        let path = path.as_ref().to_path_buf();
        let partial = partial_path(&path);
        let dataset = create_geotiff(&partial, grid, 1)?;
        dataset.rasterband(1)?.set_no_data_value(Some(nodata as f64))?;
        Ok(Self { dataset, partial, path })
    }

    /// Close the dataset and move the file to its final path
    pub fn finish(self) -> SarResult<PathBuf> {
        let Self { dataset, partial, path } = self;
        drop(dataset);
        commit(&partial, &path)?;
        Ok(path)
    }
}

impl TileSink for GeoTiffTileSink {
    fn write_tile(&mut self, col: usize, row: usize, data: &SarRealImage) -> SarResult<()> {
        let mut rasterband = self.dataset.rasterband(1)?;
        write_band_window(&mut rasterband, col, row, data)
    }
}

/// Multi-band GeoTIFF written one band at a time
pub struct GeoTiffBandSink {
    dataset: Dataset,
    partial: PathBuf,
    path: PathBuf,
    bands: usize,
}

impl GeoTiffBandSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        grid: &RasterGrid,
        nodata: SarReal,
        bands: usize,
    ) -> SarResult<Self> {
        let path = path.as_ref().to_path_buf();
        let partial = partial_path(&path);
        let dataset = create_geotiff(&partial, grid, bands)?;
        for band in 1..=bands {
            dataset
                .rasterband(band as isize)?
                .set_no_data_value(Some(nodata as f64))?;
        }
        Ok(Self { dataset, partial, path, bands })
    }

    pub fn finish(self) -> SarResult<PathBuf> {
        let Self { dataset, partial, path, .. } = self;
        drop(dataset);
        commit(&partial, &path)?;
        Ok(path)
    }

    fn check_band(&self, band: usize) -> SarResult<isize> {
        if band == 0 || band > self.bands {
            return Err(SarError::InvalidFormat(format!(
                "Band {} outside 1..={}",
                band, self.bands
            )));
        }
        Ok(band as isize)
    }
}

impl BandSink for GeoTiffBandSink {
    fn write_band(&mut self, band: usize, data: &SarRealImage, label: &str) -> SarResult<()> {
        let index = self.check_band(band)?;
        let mut rasterband = self.dataset.rasterband(index)?;
        rasterband.set_description(label)?;
        write_band_window(&mut rasterband, 0, 0, data)
    }
}

impl BandSource for GeoTiffBandSink {
    fn read_band(&self, band: usize) -> SarResult<SarRealImage> {
        let index = self.check_band(band)?;
        let (width, height) = self.dataset.raster_size();
        read_band_window(&self.dataset, index, 0, 0, width, height)
    }
}

/// Finished multi-band raster opened for band reads
pub struct GeoTiffBandReader {
    dataset: Dataset,
    header: RasterHeader,
    bands: usize,
}

impl GeoTiffBandReader {
    pub fn open<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        let dataset = Dataset::open(path.as_ref())?;
        let header = RasterReader::header_of(&dataset)?;
        let bands = dataset.raster_count() as usize;
        Ok(Self { dataset, header, bands })
    }

    pub fn grid(&self) -> &RasterGrid {
        &self.header.grid
    }

    pub fn nodata(&self) -> SarReal {
        self.header.nodata
    }

    pub fn band_count(&self) -> usize {
        self.bands
    }

    /// Band descriptions in band order
    pub fn labels(&self) -> SarResult<Vec<String>> {
        (1..=self.bands)
            .map(|band| Ok(self.dataset.rasterband(band as isize)?.description()?))
            .collect()
    }
}

impl BandSource for GeoTiffBandReader {
    fn read_band(&self, band: usize) -> SarResult<SarRealImage> {
        if band == 0 || band > self.bands {
            return Err(SarError::InvalidFormat(format!(
                "Band {} outside 1..={}",
                band, self.bands
            )));
        }
        let (width, height) = self.dataset.raster_size();
        read_band_window(&self.dataset, band as isize, 0, 0, width, height)
    }
}

/// Band descriptions of a multi-band raster, in band order
pub fn band_descriptions<P: AsRef<Path>>(path: P) -> SarResult<Vec<String>> {
    let dataset = Dataset::open(path.as_ref())?;
    let count = dataset.raster_count();
    (1..=count)
        .map(|band| Ok(dataset.rasterband(band)?.description()?))
        .collect()
}

/// Read one band of a multi-band raster
pub fn read_band<P: AsRef<Path>>(path: P, band: usize) -> SarResult<SarRealImage> {
    let dataset = Dataset::open(path.as_ref())?;
    let (width, height) = dataset.raster_size();
    read_band_window(&dataset, band as isize, 0, 0, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_tile() -> RasterTile {
        let grid = RasterGrid::new(
            GeoTransform::north_up(500000.0, 9000000.0, 10.0, 10.0),
            6,
            4,
            "EPSG:32749",
        );
        let mut data = Array2::from_shape_fn((4, 6), |(r, c)| -(r as f32) - c as f32 * 0.5);
        data[[0, 0]] = DEFAULT_NODATA;
        RasterTile::new(grid, DEFAULT_NODATA, data).unwrap()
    }

    #[test]
    fn test_geotiff_write_read_preserves_grid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scene.tif");
        let tile = sample_tile();

        RasterReader::write_geotiff(&path, &tile).unwrap();
        assert!(path.exists());
        assert!(!partial_path(&path).exists());

        let back = RasterReader::read_tile(&path).unwrap();
        assert_eq!(back.width(), 6);
        assert_eq!(back.height(), 4);
        assert_eq!(back.nodata, DEFAULT_NODATA);
        assert!(back.grid.transform.approx_eq(&tile.grid.transform));
        assert!(!back.grid.crs.is_empty());
        assert_abs_diff_eq!(back.data[[3, 5]], tile.data[[3, 5]]);
        assert_eq!(back.valid_count(), tile.valid_count());

        let window = RasterReader::read_window(&path, 2, 1, 3, 2).unwrap();
        assert_eq!(window.dim(), (2, 3));
        assert_abs_diff_eq!(window[[0, 0]], tile.data[[1, 2]]);
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta.tif");
        let mut metadata = HashMap::new();
        metadata.insert("PASS".to_string(), "ASCENDING".to_string());

        RasterReader::write_geotiff_with_metadata(&path, &sample_tile(), &metadata).unwrap();
        let read = RasterReader::read_metadata(&path).unwrap();
        assert_eq!(read.get("PASS").map(String::as_str), Some("ASCENDING"));
    }

    #[test]
    fn test_band_sink_labels_and_reads_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stack.tif");
        let tile = sample_tile();

        let mut sink = GeoTiffBandSink::create(&path, &tile.grid, DEFAULT_NODATA, 3).unwrap();
        sink.write_band(2, &tile.data, "P02 2024-01-13/2024-01-24").unwrap();
        assert!(sink.write_band(4, &tile.data, "bad").is_err());
        let band = sink.read_band(2).unwrap();
        assert_abs_diff_eq!(band[[2, 2]], tile.data[[2, 2]]);
        sink.finish().unwrap();

        let labels = band_descriptions(&path).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[1], "P02 2024-01-13/2024-01-24");
        let band = read_band(&path, 2).unwrap();
        assert_abs_diff_eq!(band[[3, 1]], tile.data[[3, 1]]);

        let reader = GeoTiffBandReader::open(&path).unwrap();
        assert_eq!(reader.band_count(), 3);
        assert_eq!(reader.nodata(), DEFAULT_NODATA);
        assert!(reader.grid().transform.approx_eq(&tile.grid.transform));
        assert_eq!(reader.labels().unwrap(), labels);
        assert_abs_diff_eq!(reader.read_band(2).unwrap()[[3, 1]], tile.data[[3, 1]]);
        assert!(reader.read_band(4).is_err());
    }
}
