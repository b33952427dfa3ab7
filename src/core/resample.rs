use crate::types::{RasterGrid, RasterTile, SarError, SarReal, SarResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Interpolation used when a raster is moved onto another grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    #[default]
    Nearest,
    Bilinear,
}

/// Resample (and, when CRSs differ, reproject) a tile onto `target`
///
/// Output pixels falling outside the source, or on invalid source samples,
/// are nodata. Bilinear falls back to nearest where a neighbour is invalid.
pub fn resample_to_grid(
    tile: &RasterTile,
    target: &RasterGrid,
    method: ResampleMethod,
) -> SarResult<RasterTile> {
    if tile.grid.matches(target) {
        let mut copy = tile.clone();
        copy.grid = target.clone();
        return Ok(copy);
    }

    if tile.grid.transform.is_rotated() {
        return Err(SarError::InvalidFormat(
            "Rotated source grids cannot be resampled".to_string(),
        ));
    }

    log::debug!(
        "Resampling {}x{} raster onto {}x{} grid ({:?})",
        tile.width(),
        tile.height(),
        target.width,
        target.height,
        method
    );

    let (cols, rows) = if tile.grid.same_crs(target) {
        source_positions_affine(&tile.grid, target)
    } else {
        source_positions_reprojected(&tile.grid, target)?
    };

    let mut data = Array2::from_elem((target.height, target.width), tile.nodata);
    let sample = |col: f64, row: f64| -> SarReal {
        let value = match method {
            ResampleMethod::Nearest => sample_nearest(tile, col, row),
            ResampleMethod::Bilinear => {
                sample_bilinear(tile, col, row).or_else(|| sample_nearest(tile, col, row))
            }
        };
        value.unwrap_or(tile.nodata)
    };

    #[cfg(feature = "parallel")]
    Zip::from(&mut data)
        .and(&cols)
        .and(&rows)
        .par_for_each(|out, &col, &row| *out = sample(col, row));
    #[cfg(not(feature = "parallel"))]
    Zip::from(&mut data)
        .and(&cols)
        .and(&rows)
        .for_each(|out, &col, &row| *out = sample(col, row));

    RasterTile::new(target.clone(), tile.nodata, data)
}

/// Fractional source pixel position of every target pixel centre, same CRS
fn source_positions_affine(source: &RasterGrid, target: &RasterGrid) -> (Array2<f64>, Array2<f64>) {
    let shape = (target.height, target.width);
    let mut cols = Array2::zeros(shape);
    let mut rows = Array2::zeros(shape);

    Zip::indexed(&mut cols).and(&mut rows).for_each(|(i, j), col, row| {
        let (x, y) = target.transform.pixel_to_geo(j as f64 + 0.5, i as f64 + 0.5);
        let (c, r) = source.transform.geo_to_pixel(x, y);
        *col = c;
        *row = r;
    });

    (cols, rows)
}

fn spatial_ref(crs: &str) -> SarResult<SpatialRef> {
    let mut srs = SpatialRef::from_definition(crs)?;
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// Fractional source pixel positions through a CRS transformation; points
/// that fail to transform map to NaN
fn source_positions_reprojected(
    source: &RasterGrid,
    target: &RasterGrid,
) -> SarResult<(Array2<f64>, Array2<f64>)> {
    log::debug!("Reprojecting from target CRS into source CRS");
    let transform = CoordTransform::new(&spatial_ref(&target.crs)?, &spatial_ref(&source.crs)?)?;

    let shape = (target.height, target.width);
    let mut cols = Array2::from_elem(shape, f64::NAN);
    let mut rows = Array2::from_elem(shape, f64::NAN);

    for i in 0..target.height {
        let mut xs = Vec::with_capacity(target.width);
        let mut ys = Vec::with_capacity(target.width);
        for j in 0..target.width {
            let (x, y) = target.transform.pixel_to_geo(j as f64 + 0.5, i as f64 + 0.5);
            xs.push(x);
            ys.push(y);
        }
        let mut zs = vec![0.0; target.width];

        if transform.transform_coords(&mut xs, &mut ys, &mut zs).is_err() {
            // Retry point by point so one bad coordinate does not blank the row
            for j in 0..target.width {
                let (x, y) = target.transform.pixel_to_geo(j as f64 + 0.5, i as f64 + 0.5);
                let (mut px, mut py, mut pz) = ([x], [y], [0.0]);
                if transform.transform_coords(&mut px, &mut py, &mut pz).is_ok() {
                    xs[j] = px[0];
                    ys[j] = py[0];
                } else {
                    xs[j] = f64::NAN;
                    ys[j] = f64::NAN;
                }
            }
        }

        for j in 0..target.width {
            let (c, r) = source.transform.geo_to_pixel(xs[j], ys[j]);
            cols[[i, j]] = c;
            rows[[i, j]] = r;
        }
    }

    Ok((cols, rows))
}

/// Valid sample of the source pixel containing a fractional position
pub fn sample_nearest(tile: &RasterTile, col: f64, row: f64) -> Option<SarReal> {
    if !(col >= 0.0 && row >= 0.0) {
        return None;
    }
    let (c, r) = (col.floor() as usize, row.floor() as usize);
    if c >= tile.width() || r >= tile.height() {
        return None;
    }
    let value = tile.data[[r, c]];
    tile.is_valid(value).then_some(value)
}

/// Bilinear interpolation between the four surrounding pixel centres;
/// `None` if any of them is outside the raster or invalid
pub fn sample_bilinear(tile: &RasterTile, col: f64, row: f64) -> Option<SarReal> {
    let (x, y) = (col - 0.5, row - 0.5);
    if !(x >= 0.0 && y >= 0.0) {
        return None;
    }
    let (width, height) = (tile.width(), tile.height());
    let x1 = x.floor() as usize;
    let y1 = y.floor() as usize;
    if x1 >= width || y1 >= height {
        return None;
    }
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);

    let v11 = tile.data[[y1, x1]];
    let v12 = tile.data[[y2, x1]];
    let v21 = tile.data[[y1, x2]];
    let v22 = tile.data[[y2, x2]];
    if ![v11, v12, v21, v22].iter().all(|&v| tile.is_valid(v)) {
        return None;
    }

    let dx = x - x1 as f64;
    let dy = y - y1 as f64;
    let interpolated = v11 as f64 * (1.0 - dx) * (1.0 - dy)
        + v21 as f64 * dx * (1.0 - dy)
        + v12 as f64 * (1.0 - dx) * dy
        + v22 as f64 * dx * dy;

    Some(interpolated as SarReal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, DEFAULT_NODATA};
    use approx::assert_abs_diff_eq;

    fn tile(x: f64, y: f64, size: f64, w: usize, h: usize) -> RasterTile {
        let grid = RasterGrid::new(GeoTransform::north_up(x, y, size, size), w, h, "EPSG:32749");
        let data = Array2::from_shape_fn((h, w), |(r, c)| (r * 10 + c) as f32);
        RasterTile::new(grid, DEFAULT_NODATA, data).unwrap()
    }

    #[test]
    fn test_identical_grid_is_copied() {
        let src = tile(0.0, 100.0, 10.0, 4, 4);
        let out = resample_to_grid(&src, &src.grid, ResampleMethod::Bilinear).unwrap();
        assert_eq!(out.data, src.data);
    }

    #[test]
    fn test_nearest_onto_finer_shifted_grid() {
        let src = tile(0.0, 100.0, 10.0, 4, 4);
        let target = RasterGrid::new(GeoTransform::north_up(-10.0, 100.0, 5.0, 5.0), 6, 2, "EPSG:32749");
        let out = resample_to_grid(&src, &target, ResampleMethod::Nearest).unwrap();

        // First two columns lie west of the source
        assert_eq!(out.data[[0, 0]], DEFAULT_NODATA);
        assert_eq!(out.data[[0, 1]], DEFAULT_NODATA);
        assert_eq!(out.data[[0, 2]], 0.0);
        assert_eq!(out.data[[0, 3]], 0.0);
        assert_eq!(out.data[[1, 4]], 1.0);
    }

    #[test]
    fn test_bilinear_interpolates_and_falls_back() {
        let mut src = tile(0.0, 100.0, 10.0, 4, 4);
        let target = RasterGrid::new(GeoTransform::north_up(5.0, 95.0, 10.0, 10.0), 3, 3, "EPSG:32749");
        let out = resample_to_grid(&src, &target, ResampleMethod::Bilinear).unwrap();
        // Centre of pixels (0,0),(0,1),(1,0),(1,1) averages to 5.5
        assert_abs_diff_eq!(out.data[[0, 0]], 5.5, epsilon = 1e-5);

        src.data[[1, 1]] = DEFAULT_NODATA;
        let out = resample_to_grid(&src, &target, ResampleMethod::Bilinear).unwrap();
        // Nearest of position (1.5, 1.5) is the now-invalid pixel
        assert_eq!(out.data[[0, 0]], DEFAULT_NODATA);
        assert_abs_diff_eq!(out.data[[1, 2]], 17.5, epsilon = 1e-5);
        // Neighbourhood of (1,1) touches the invalid pixel, nearest is used instead
        assert_eq!(out.data[[1, 1]], 22.0);
    }

    #[test]
    fn test_rotated_source_is_rejected() {
        let mut src = tile(0.0, 100.0, 10.0, 2, 2);
        src.grid.transform.rotation_x = 0.5;
        let target = tile(0.0, 100.0, 5.0, 2, 2).grid;
        assert!(resample_to_grid(&src, &target, ResampleMethod::Nearest).is_err());
    }
}
