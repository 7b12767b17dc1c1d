//! Probes filling in what a layer configuration leaves out.
//!
//! Max zoom detection walks down from the min zoom, counting the features of
//! the tile at the extent's centroid, and stops at the first zoom where the
//! count drops below [`DENSITY_THRESHOLD`]. This assumes feature density per
//! tile does not grow with zoom; a layer whose centroid tile is empty at low
//! zooms but dense further in gets a max zoom that is too low.

use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::trace;

use crate::backend::{SqlBackend, Value};
use crate::geometry::GeometryKind;
use crate::query::{LayerQuery, Probe};
use crate::tile::{bound_zoom_level, lonlat_to_tile, Bounds, TileRequest, WEB_MERCATOR};
use crate::{Error, Result};

/// Viewport used to pick a min zoom from an extent.
pub const PROBE_VIEWPORT: (u32, u32) = (1920, 1080);

/// Highest zoom the max zoom probe returns.
pub const MAX_ZOOM_CEILING: u8 = 16;

/// Feature count below which a tile is sparse enough to be the max zoom.
pub const DENSITY_THRESHOLD: i64 = 1024;

const PROBE_BUFFER: u32 = 64;

/// The zoom 0 tile probes run against.
pub fn world_probe_tile() -> TileRequest {
    TileRequest::new(0, 0, 0, PROBE_BUFFER, WEB_MERCATOR)
}

pub(crate) struct Inspector<'a> {
    backend: &'a dyn SqlBackend,
    layer: &'a str,
    query: &'a LayerQuery,
}

impl<'a> Inspector<'a> {
    pub fn new(backend: &'a dyn SqlBackend, layer: &'a str, query: &'a LayerQuery) -> Self {
        Inspector {
            backend,
            layer,
            query,
        }
    }

    async fn probe(&self, probe: Probe, tile: &TileRequest) -> Result<Option<Value>> {
        let sql = self.query.probe(probe, tile);
        trace!(layer = self.layer, ?probe, %sql, "probing layer");
        let row = self.backend.fetch_first(&sql).await?;
        Ok(row.and_then(|row| row.first().cloned()))
    }

    pub async fn geometry_kind(&self) -> Result<GeometryKind> {
        match self.probe(Probe::GeometryType, &world_probe_tile()).await? {
            Some(Value::Text(name)) => name.parse().map_err(|name| Error::UnsupportedGeometryType {
                layer: self.layer.to_string(),
                name,
            }),
            None | Some(Value::Null) => Err(Error::NoRows {
                layer: self.layer.to_string(),
            }),
            Some(other) => Err(Error::UnsupportedGeometryType {
                layer: self.layer.to_string(),
                name: format!("{:?}", other),
            }),
        }
    }

    /// Extent of every matching geometry, in EPSG:4326.
    pub async fn extent(&self) -> Result<Bounds> {
        let value = self.probe(Probe::Extent, &world_probe_tile()).await?;
        let parsed = match &value {
            Some(Value::Text(text)) => parse_box(text)?,
            _ => None,
        };

        parsed.ok_or_else(|| Error::ExtentParse {
            layer: self.layer.to_string(),
            value: match value {
                Some(Value::Text(text)) => text,
                other => format!("{:?}", other),
            },
        })
    }

    pub async fn max_zoom(&self, extent: &Bounds, min_zoom: u8) -> Result<u8> {
        let (lon, lat) = extent.center();
        for zoom in min_zoom..MAX_ZOOM_CEILING {
            let (x, y) = lonlat_to_tile(lon, lat, zoom);
            let tile = TileRequest::new(zoom, x, y, PROBE_BUFFER, WEB_MERCATOR);
            let count = match self.probe(Probe::Count, &tile).await? {
                Some(value) => value.as_i64().unwrap_or(0),
                None => 0,
            };
            trace!(layer = self.layer, zoom, count, "counted features");
            if count < DENSITY_THRESHOLD {
                return Ok(zoom);
            }
        }
        Ok(MAX_ZOOM_CEILING)
    }
}

/// Largest zoom at which `extent` still fits the probe viewport.
pub fn min_zoom(extent: &Bounds) -> u8 {
    bound_zoom_level(extent, PROBE_VIEWPORT.0, PROBE_VIEWPORT.1)
}

/// Parses the `BOX(w s,e n)` text PostGIS renders extents as.
pub fn parse_box(text: &str) -> Result<Option<Bounds>> {
    static BOX: OnceCell<Regex> = OnceCell::new();
    let regex = BOX.get_or_try_init(|| Regex::new(r"(?i)BOX\((.*?)\)"))?;

    let Some(inner) = regex.captures(text).and_then(|c| c.get(1)) else {
        return Ok(None);
    };
    let numbers: Option<Vec<f64>> = inner
        .as_str()
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().ok())
        .collect();

    Ok(match numbers.as_deref() {
        Some([west, south, east, north]) => Some(Bounds::new(*west, *south, *east, *north)),
        _ => None,
    })
}
