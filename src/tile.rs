//! Slippy tile math in EPSG:3857 and EPSG:4326.

use std::f64::consts::{LN_2, PI};

use serde::Deserialize;

pub const WEB_MERCATOR: u32 = 3857;
pub const WGS84: u32 = 4326;

/// Half the width of the web mercator world, in metres.
pub const MERCATOR_MAX_EXTENT: f64 = 20_037_508.342789244;
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Pixel width of a tile when converting buffers and scales.
pub const DEFAULT_PIXEL_SCALE: u32 = 256;

/// Buffer (in pixels) applied to tiles when none is requested explicitly.
pub const DEFAULT_TILE_BUFFER: u32 = 64;

/// Size of the MVT coordinate space.
pub const MVT_EXTENT: u32 = 4096;

/// An axis aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(from = "[f64; 4]")]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    /// The web mercator world in degrees.
    pub const WORLD: Bounds = Bounds {
        west: -180.0,
        south: -85.05112877980659,
        east: 180.0,
        north: 85.0511287798066,
    };

    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Bounds {
            west,
            south,
            east,
            north,
        }
    }

    pub fn expand_by(&self, amount: f64) -> Self {
        Bounds {
            west: self.west - amount,
            south: self.south - amount,
            east: self.east + amount,
            north: self.north + amount,
        }
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.west + self.east) / 2.0,
            (self.south + self.north) / 2.0,
        )
    }

    /// Reprojects bounds given in EPSG:3857 metres into EPSG:4326 degrees.
    pub fn to_wgs84(&self) -> Self {
        let (west, south) = mercator_to_lonlat(self.west, self.south);
        let (east, north) = mercator_to_lonlat(self.east, self.north);
        Bounds {
            west,
            south,
            east,
            north,
        }
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds::WORLD
    }
}

impl From<[f64; 4]> for Bounds {
    fn from(b: [f64; 4]) -> Self {
        Bounds::new(b[0], b[1], b[2], b[3])
    }
}

pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (y / EARTH_RADIUS).sinh().atan().to_degrees();
    (lon, lat)
}

/// Computes the EPSG:3857 bounds of an XYZ tile, expanded on every side by
/// `buffer` pixels of a `pixel_scale` wide tile.
pub fn get_epsg_3857_tile_bounds(pixel_scale: u32, zoom: u8, x: u32, y: u32, buffer: u32) -> Bounds {
    let span = tile_span(zoom);
    let west = -MERCATOR_MAX_EXTENT + f64::from(x) * span;
    let north = MERCATOR_MAX_EXTENT - f64::from(y) * span;

    Bounds::new(west, north - span, west + span, north)
        .expand_by(pixels_to_mercator(pixel_scale, zoom, buffer))
}

/// Width of a single tile in metres at `zoom`.
fn tile_span(zoom: u8) -> f64 {
    2.0 * MERCATOR_MAX_EXTENT / 2f64.powi(i32::from(zoom))
}

pub fn pixels_to_mercator(pixel_scale: u32, zoom: u8, pixels: u32) -> f64 {
    tile_span(zoom) / f64::from(pixel_scale) * f64::from(pixels)
}

/// Index of the tile containing the given coordinate, clamped to the grid.
pub fn lonlat_to_tile(lon: f64, lat: f64, zoom: u8) -> (u32, u32) {
    let last = ((1u64 << zoom.min(32)) - 1).min(u64::from(u32::MAX)) as u32;
    let lat = lat.clamp(Bounds::WORLD.south, Bounds::WORLD.north);
    let (x, y) = slippy_map_tilenames::lonlat2tile(lon.clamp(-180.0, 180.0), lat, zoom);
    (x.min(last), y.min(last))
}

/// Largest zoom at which `bounds` (in degrees) fits into a viewport of the
/// given pixel size, capped at 21.
pub fn bound_zoom_level(bounds: &Bounds, map_width_px: u32, map_height_px: u32) -> u8 {
    const WORLD_PX: f64 = 256.0;
    const ZOOM_MAX: f64 = 21.0;

    fn lat_rad(lat: f64) -> f64 {
        let sin = lat.to_radians().sin();
        let rad_x2 = ((1.0 + sin) / (1.0 - sin)).ln() / 2.0;
        rad_x2.clamp(-PI, PI) / 2.0
    }

    fn zoom(map_px: u32, fraction: f64) -> f64 {
        ((f64::from(map_px) / WORLD_PX / fraction).ln() / LN_2).floor()
    }

    let lat_fraction = (lat_rad(bounds.north) - lat_rad(bounds.south)) / PI;
    let mut lng_diff = bounds.east - bounds.west;
    if lng_diff < 0.0 {
        lng_diff += 360.0;
    }
    let lng_fraction = lng_diff / 360.0;

    let lat_zoom = zoom(map_height_px, lat_fraction);
    let lng_zoom = zoom(map_width_px, lng_fraction);
    let z = lat_zoom.min(lng_zoom);

    if z > ZOOM_MAX {
        ZOOM_MAX as u8
    } else {
        // negative and NaN saturate to 0
        z as u8
    }
}

/// A request for the data of one tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRequest {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    /// Margin around the tile, in pixels.
    pub buffer: u32,
    pub srid: u32,
}

impl TileRequest {
    pub fn new(zoom: u8, x: u32, y: u32, buffer: u32, srid: u32) -> Self {
        TileRequest {
            zoom,
            x,
            y,
            buffer,
            srid,
        }
    }

    /// Web mercator tile with the default buffer.
    pub fn web_mercator(zoom: u8, x: u32, y: u32) -> Self {
        Self::new(zoom, x, y, DEFAULT_TILE_BUFFER, WEB_MERCATOR)
    }

    pub fn bounds(&self) -> Bounds {
        get_epsg_3857_tile_bounds(DEFAULT_PIXEL_SCALE, self.zoom, self.x, self.y, 0)
    }

    pub fn buffered_bounds(&self) -> Bounds {
        get_epsg_3857_tile_bounds(DEFAULT_PIXEL_SCALE, self.zoom, self.x, self.y, self.buffer)
    }

    /// Metres covered by one pixel of the tile.
    pub fn pixel_width(&self) -> f64 {
        self.bounds().width() / f64::from(DEFAULT_PIXEL_SCALE)
    }

    pub fn pixel_height(&self) -> f64 {
        self.bounds().height() / f64::from(DEFAULT_PIXEL_SCALE)
    }

    /// OGC scale denominator, assuming 0.28mm pixels.
    pub fn scale_denominator(&self) -> f64 {
        self.pixel_width() / 0.00028
    }
}
