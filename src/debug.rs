//! A provider without a database, drawing the outline and center of every
//! tile it is asked for.

use std::collections::HashMap;

use async_trait::async_trait;
use geo_types::{coord, Geometry, Point, Rect};
use tokio_util::sync::CancellationToken;

use crate::catalog::{LayerCatalog, LayerDescriptor};
use crate::geometry::GeometryKind;
use crate::provider::{
    Feature, Layerer, TagValue, Tiler, DEFAULT_MAX_ZOOM, DEFAULT_MIN_ZOOM,
};
use crate::registry::{Constructor, DriverRegistry};
use crate::tile::{Bounds, TileRequest, WEB_MERCATOR};
use crate::{Error, Result};

pub const NAME: &str = "debug";

pub const LAYER_TILE_OUTLINE: &str = "debug-tile-outline";
pub const LAYER_TILE_CENTER: &str = "debug-tile-center";

pub struct DebugProvider {
    layers: LayerCatalog,
}

impl DebugProvider {
    pub fn new() -> Result<Self> {
        let mut layers = LayerCatalog::new();
        for (id, kind) in [
            (LAYER_TILE_OUTLINE, GeometryKind::Polygon),
            (LAYER_TILE_CENTER, GeometryKind::Point),
        ] {
            let layer = LayerDescriptor::new(
                id,
                id,
                kind,
                WEB_MERCATOR,
                (DEFAULT_MIN_ZOOM, DEFAULT_MAX_ZOOM),
                Bounds::WORLD,
            );
            layers.insert(layer)?;
        }
        Ok(DebugProvider { layers })
    }
}

/// Registers the `debug` driver. It takes no configuration.
pub fn register(registry: &mut DriverRegistry) -> Result<()> {
    registry.register(
        NAME,
        Some(Constructor::standard(|_config| async {
            Ok(Box::new(DebugProvider::new()?) as Box<dyn Tiler>)
        })),
        None,
    )
}

fn tags(pairs: &[(&str, &str)]) -> HashMap<String, TagValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), TagValue::String(v.to_string())))
        .collect()
}

#[async_trait]
impl Layerer for DebugProvider {
    fn layer(&self, id: &str) -> Option<&LayerDescriptor> {
        self.layers.get(id)
    }

    fn layers(&self) -> Result<Vec<&LayerDescriptor>> {
        Ok(self.layers.iter().collect())
    }

    async fn add_layer(&mut self, _config: &serde_yaml::Value) -> Result<()> {
        Err(Error::Config("can not add debug layer".to_string()))
    }

    fn layer_extent(&self, _id: &str) -> Result<Bounds> {
        Ok(Bounds::WORLD)
    }

    fn layer_min_zoom(&self, _id: &str) -> u8 {
        DEFAULT_MIN_ZOOM
    }

    fn layer_max_zoom(&self, _id: &str) -> u8 {
        DEFAULT_MAX_ZOOM
    }
}

#[async_trait]
impl Tiler for DebugProvider {
    async fn tile_features(
        &self,
        ctx: &CancellationToken,
        layer_id: &str,
        tile: &TileRequest,
        sink: &mut (dyn FnMut(Feature) -> Result<()> + Send),
    ) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }

        let b = tile.bounds();
        let feature = match layer_id {
            LAYER_TILE_OUTLINE => Feature {
                id: 0,
                geometry: Geometry::Polygon(
                    Rect::new(coord! { x: b.west, y: b.south }, coord! { x: b.east, y: b.north })
                        .to_polygon(),
                ),
                srid: WEB_MERCATOR,
                tags: tags(&[("type", "debug_buffer_outline")]),
            },
            LAYER_TILE_CENTER => {
                let (x, y) = b.center();
                let zxy = format!("Z:{}, X:{}, Y:{}", tile.zoom, tile.x, tile.y);
                Feature {
                    id: 1,
                    geometry: Geometry::Point(Point::new(x, y)),
                    srid: WEB_MERCATOR,
                    tags: tags(&[("type", "debug_text"), ("zxy", zxy.as_str())]),
                }
            }
            other => return Err(Error::LayerNotFound(other.to_string())),
        };

        sink(feature)
    }
}
