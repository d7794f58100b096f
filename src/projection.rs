//! Spherical Mercator projection into the 256px tile pixel space.
//!
//! At zoom `z` the world is `256 * 2^z` pixels square, x growing east from
//! the antimeridian and y growing south from the northern Mercator limit.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::deal::LatLng;
use crate::error::GeoError;

pub const TILE_SIZE: f64 = 256.0;

/// Latitude where spherical Mercator becomes a square world.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Pixel width of the world at a zoom level. Fractional zooms are allowed.
pub fn world_size(zoom: f64) -> f64 {
    TILE_SIZE * 2f64.powf(zoom)
}

/// Longitude to the unit interval [0, 1].
pub fn lng_x(lng: f64) -> f64 {
    lng / 360.0 + 0.5
}

/// Latitude to the unit interval [0, 1]. The caller is responsible for the
/// latitude already sitting inside the Mercator range.
pub fn lat_y(lat: f64) -> f64 {
    let sin = (lat * PI / 180.0).sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;
    y.clamp(0.0, 1.0)
}

pub fn x_lng(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

pub fn y_lat(y: f64) -> f64 {
    let y2 = (180.0 - y * 360.0) * PI / 180.0;
    360.0 * y2.exp().atan() / PI - 90.0
}

/// Validates a coordinate and returns its unit-square position.
///
/// Latitudes between the Mercator limit and the poles are clamped to the
/// limit; anything outside the geographic range is an error.
pub fn project_unit(ll: LatLng) -> Result<(f64, f64), GeoError> {
    let ll = ll.validate()?;
    let lat = ll.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    Ok((lng_x(ll.lng), lat_y(lat)))
}

/// Projects to tile pixel space at `zoom`.
pub fn project(ll: LatLng, zoom: f64) -> Result<(f64, f64), GeoError> {
    let (x, y) = project_unit(ll)?;
    let size = world_size(zoom);
    Ok((x * size, y * size))
}

/// Inverse of [`project`].
pub fn unproject(x: f64, y: f64, zoom: f64) -> LatLng {
    let size = world_size(zoom);
    LatLng::new(y_lat(y / size), x_lng(x / size))
}

/// Geographic bounding box in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BBox {
    pub const WORLD: BBox = BBox { west: -180.0, south: -90.0, east: 180.0, north: 90.0 };

    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self { west, south, east, north }
    }

    /// Splits the box into unit-square ranges `(min_x, min_y, max_x, max_y)`.
    ///
    /// Latitudes are clamped to the poles, longitudes are wrapped, a box
    /// crossing the antimeridian yields two ranges and a box at least 360
    /// degrees wide covers the whole world. Non-finite or upside-down boxes
    /// yield nothing.
    pub fn unit_ranges(&self) -> Vec<(f64, f64, f64, f64)> {
        let values = [self.west, self.south, self.east, self.north];
        if values.iter().any(|v| !v.is_finite()) {
            return Vec::new();
        }
        let south = self.south.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
        let north = self.north.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
        if south > north {
            return Vec::new();
        }
        let (min_y, max_y) = (lat_y(north), lat_y(south));

        if self.east - self.west >= 360.0 {
            return vec![(0.0, min_y, 1.0, max_y)];
        }
        let west = wrap_lng(self.west);
        let east = if self.east == 180.0 { 180.0 } else { wrap_lng(self.east) };
        if west > east {
            vec![
                (lng_x(west), min_y, 1.0, max_y),
                (0.0, min_y, lng_x(east), max_y),
            ]
        } else {
            vec![(lng_x(west), min_y, lng_x(east), max_y)]
        }
    }

    pub fn contains(&self, ll: LatLng) -> bool {
        let (x, y) = match project_unit(ll) {
            Ok(p) => p,
            Err(_) => return false,
        };
        self.unit_ranges()
            .iter()
            .any(|&(x0, y0, x1, y1)| x >= x0 && x <= x1 && y >= y0 && y <= y1)
    }
}

/// Wraps any longitude into [-180, 180).
pub fn wrap_lng(lng: f64) -> f64 {
    ((lng + 180.0) % 360.0 + 360.0) % 360.0 - 180.0
}
