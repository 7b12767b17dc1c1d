//! The GeoPackage driver.
//!
//! A [`GpkgProvider`] reads feature tables of one GeoPackage file through
//! SQLite. Table layers are filtered with the table's R-tree spatial index
//! and take their geometry column, SRID and geometry type from the
//! GeoPackage metadata tables. Custom SQL layers must filter on `!BBOX!`
//! themselves, which is replaced with an overlap test on the index columns
//! `minx`, `maxx`, `miny` and `maxy`.
//!
//! SQLite cannot reproject, so layers must be stored in EPSG:3857 or
//! EPSG:4326.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{stream_rows, Row, SqlBackend, SqliteBackend, Value};
use crate::catalog::{LayerCatalog, LayerDescriptor};
use crate::geometry::{decode_gpkg, GeometryKind, GpkgGeometry, WkbError};
use crate::provider::{
    feature_id, tag_value, Feature, Layerer, Tiler, DEFAULT_MAX_ZOOM as UNKNOWN_MAX_ZOOM,
    DEFAULT_MIN_ZOOM as UNKNOWN_MIN_ZOOM,
};
use crate::query::{quote_literal, SqlTemplate, TokenValues, ZoomMode, BBOX_TOKEN};
use crate::registry::{cleanup, Cleanup, Constructor, DriverRegistry};
use crate::tile::{Bounds, TileRequest, WEB_MERCATOR, WGS84};
use crate::{Error, Result};

mod config;

pub use config::{GpkgConfig, LayerConfig, LayerSource, DEFAULT_MAX_ZOOM, DEFAULT_MIN_ZOOM};

pub const NAME: &str = "gpkg";

/// Index and zoom filter columns a query may select; never reported as tags.
const RESERVED_COLUMNS: [&str; 6] = ["minx", "miny", "maxx", "maxy", "min_zoom", "max_zoom"];

/// Stands in for `!BBOX!` when a custom query is inspected at registration.
const MATCH_ALL: &str = "1 = 1";

/// The SQL of a layer and the fields its rows are read by.
#[derive(Clone, Debug)]
struct GpkgLayer {
    template: SqlTemplate,
    srid: u32,
    geom_field: String,
    id_field: Option<String>,
}

impl GpkgLayer {
    fn synthesize(&self, tile: &TileRequest) -> String {
        let values = TokenValues::with_envelopes(
            tile,
            rtree_filter(&tile.buffered_bounds(), self.srid),
            rtree_filter(&tile.bounds(), self.srid),
            ZoomMode::Explicit,
        );
        self.template.render(&values)
    }
}

/// What `gpkg_contents` and `gpkg_geometry_columns` say about a table.
#[derive(Clone, Debug)]
struct TableInfo {
    srid: u32,
    geom_field: String,
    geometry_type: String,
    extent: Option<Bounds>,
}

pub struct GpkgProvider {
    backend: Arc<dyn SqlBackend>,
    layers: LayerCatalog,
    queries: HashMap<String, GpkgLayer>,
    reported: Mutex<HashSet<(String, String)>>,
}

impl GpkgProvider {
    pub fn new(backend: Arc<dyn SqlBackend>) -> Self {
        GpkgProvider {
            backend,
            layers: LayerCatalog::new(),
            queries: HashMap::new(),
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Opens the configured file read-only and registers every layer. The
    /// first layer that fails aborts the construction.
    pub async fn open(config: serde_yaml::Value) -> Result<(GpkgProvider, SqlitePool)> {
        let config: GpkgConfig = serde_yaml::from_value(config)?;
        let pool = config
            .pool_options()
            .connect_with(config.connect_options())
            .await?;

        let backend = Arc::new(SqliteBackend::new(pool.clone()));
        let mut provider = GpkgProvider::new(backend);
        for layer in &config.layers {
            provider.add_layer(layer).await?;
        }

        info!(
            file = %config.filepath.display(),
            layers = provider.layers.len(),
            "opened gpkg provider"
        );
        Ok((provider, pool))
    }

    fn layer_query(&self, id: &str) -> Result<&GpkgLayer> {
        self.queries
            .get(id)
            .ok_or_else(|| Error::LayerNotFound(id.to_string()))
    }

    fn report_unsupported(&self, layer: &str, field: &str) -> bool {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((layer.to_string(), field.to_string()))
    }

    async fn table_info(&self, layer: &str, table: &str) -> Result<TableInfo> {
        let sql = format!(
            "SELECT c.srs_id, c.min_x, c.min_y, c.max_x, c.max_y, gc.column_name, gc.geometry_type_name \
             FROM gpkg_contents c JOIN gpkg_geometry_columns gc ON c.table_name = gc.table_name \
             WHERE c.data_type = 'features' AND c.table_name = {}",
            quote_literal(table)
        );
        let row = self
            .backend
            .fetch_first(&sql)
            .await?
            .ok_or_else(|| Error::NotFeatureTable {
                layer: layer.to_string(),
                table: table.to_string(),
            })?;

        let text = |column: &str| match row.get(column) {
            Some(Value::Text(text)) => Ok(text.clone()),
            other => Err(Error::UnexpectedType {
                layer: layer.to_string(),
                column: column.to_string(),
                found: format!("{:?}", other),
            }),
        };
        let srs_id = row.get("srs_id").and_then(Value::as_i64).unwrap_or(0);
        let extent = match ["min_x", "min_y", "max_x", "max_y"].map(|c| row.get(c).and_then(Value::as_f64)) {
            [Some(west), Some(south), Some(east), Some(north)] => {
                Some(Bounds::new(west, south, east, north))
            }
            _ => None,
        };

        Ok(TableInfo {
            srid: check_srid(layer, srs_id)?,
            geom_field: text("column_name")?,
            geometry_type: text("geometry_type_name")?,
            extent,
        })
    }

    /// Reads the geometry of the first row of a custom query for its type
    /// and SRID.
    async fn inspect_sql(
        &self,
        layer: &str,
        template: &SqlTemplate,
        geom_field: &str,
    ) -> Result<(GeometryKind, u32)> {
        let values = TokenValues::with_envelopes(
            &TileRequest::new(0, 0, 0, 0, WEB_MERCATOR),
            MATCH_ALL.to_string(),
            MATCH_ALL.to_string(),
            ZoomMode::AllZooms,
        );
        let sql = format!(
            "SELECT {} FROM ({}) LIMIT 1",
            quote_ident(geom_field),
            template.render(&values)
        );

        let no_rows = || Error::NoRows {
            layer: layer.to_string(),
        };
        let row = self.backend.fetch_first(&sql).await?.ok_or_else(no_rows)?;
        let bytes = match row.first() {
            Some(Value::Bytes(bytes)) => bytes,
            None | Some(Value::Null) => return Err(no_rows()),
            Some(other) => {
                return Err(Error::UnexpectedType {
                    layer: layer.to_string(),
                    column: geom_field.to_string(),
                    found: format!("{:?}", other),
                })
            }
        };

        let decoded = decode_gpkg(bytes).map_err(|source| Error::Geometry {
            layer: layer.to_string(),
            field: geom_field.to_string(),
            source,
        })?;
        let kind = decoded
            .geometry
            .as_ref()
            .and_then(GeometryKind::of)
            .ok_or_else(|| Error::UnsupportedGeometryType {
                layer: layer.to_string(),
                name: "EMPTY".to_string(),
            })?;
        Ok((kind, check_srid(layer, decoded.srs_id.into())?))
    }

    async fn build_layer(&self, config: LayerConfig) -> Result<(LayerDescriptor, GpkgLayer)> {
        let id = config.id.clone();
        if self.layers.contains(&id) {
            return Err(Error::DuplicateLayer(id));
        }

        let source = config.source()?;
        let id_field = Some(config.id_field).filter(|f| !f.is_empty());
        let name = config.name.unwrap_or_else(|| id.clone());
        let configured_kind = config
            .geometry_type
            .map(|name| parse_kind(&id, &name))
            .transpose()?;

        let (layer, kind, extent) = match source {
            LayerSource::Table(table) => {
                let info = self.table_info(&id, &table).await?;
                if id_field.as_deref() == Some(info.geom_field.as_str()) {
                    return Err(Error::FieldCollision {
                        layer: id,
                        field: info.geom_field,
                    });
                }
                let kind = match configured_kind {
                    Some(kind) => kind,
                    None => parse_kind(&id, &info.geometry_type)?,
                };
                let fields = if config.fields.is_empty() {
                    self.backend
                        .columns(&format!("SELECT * FROM {} LIMIT 0", quote_ident(&table)))
                        .await?
                } else {
                    config.fields
                };

                let sql = table_sql(&table, &info.geom_field, id_field.as_deref(), &fields);
                let extent = config
                    .bounds
                    .or_else(|| info.extent.map(|extent| to_wgs84(extent, info.srid)));
                let layer = GpkgLayer {
                    template: SqlTemplate::parse(&sql),
                    srid: info.srid,
                    geom_field: info.geom_field,
                    id_field,
                };
                (layer, kind, extent)
            }
            LayerSource::Sql(sql) => {
                let template = SqlTemplate::parse(&sql);
                if !template.has_bbox() {
                    return Err(Error::MissingToken {
                        layer: id,
                        token: BBOX_TOKEN,
                    });
                }
                let geom_field = config.geom_field;
                if id_field.as_deref() == Some(geom_field.as_str()) {
                    return Err(Error::FieldCollision {
                        layer: id,
                        field: geom_field,
                    });
                }

                let (kind, srid) = match (configured_kind, config.srid) {
                    (Some(kind), Some(srid)) => (kind, check_srid(&id, srid.into())?),
                    (kind, srid) => {
                        let (found_kind, found_srid) =
                            self.inspect_sql(&id, &template, &geom_field).await?;
                        let srid = match srid {
                            Some(srid) => check_srid(&id, srid.into())?,
                            None => found_srid,
                        };
                        (kind.unwrap_or(found_kind), srid)
                    }
                };
                let layer = GpkgLayer {
                    template,
                    srid,
                    geom_field,
                    id_field,
                };
                (layer, kind, config.bounds)
            }
        };

        let min_zoom = config.min_zoom.unwrap_or(DEFAULT_MIN_ZOOM);
        let max_zoom = config.max_zoom.unwrap_or(DEFAULT_MAX_ZOOM);
        if min_zoom > max_zoom {
            return Err(Error::InvalidZoomRange {
                layer: id,
                min: min_zoom.into(),
                max: max_zoom.into(),
            });
        }

        debug!(layer = %id, geometry = %kind, srid = layer.srid, sql = %layer.template, "registered layer");
        let descriptor = LayerDescriptor::new(
            id,
            name,
            kind,
            layer.srid,
            (min_zoom, max_zoom),
            extent.unwrap_or(Bounds::WORLD),
        );
        Ok((descriptor, layer))
    }

    async fn stream_features(
        &self,
        ctx: &CancellationToken,
        layer_id: &str,
        tile: &TileRequest,
        sink: &mut (dyn FnMut(Feature) -> Result<()> + Send),
    ) -> Result<()> {
        let layer = self.layer_query(layer_id)?;
        let sql = layer.synthesize(tile);
        stream_rows(
            self.backend.as_ref(),
            ctx,
            layer_id,
            &layer.geom_field,
            &sql,
            &mut |row: Row| -> Result<()> {
                match self.decode_feature(layer_id, layer, row)? {
                    Some(feature) => sink(feature),
                    None => Ok(()),
                }
            },
        )
        .await?;
        Ok(())
    }

    /// The SRID of a feature is the one in its geometry header, when set.
    fn decode_feature(&self, layer_id: &str, layer: &GpkgLayer, row: Row) -> Result<Option<Feature>> {
        let mut id = 0;
        let mut geometry = None;
        let mut srid = layer.srid;
        let mut tags = HashMap::new();

        for (column, value) in row.into_pairs() {
            if column == layer.geom_field {
                let bytes = match value {
                    Value::Bytes(bytes) if !bytes.is_empty() => bytes,
                    Value::Null | Value::Bytes(_) => return Ok(None),
                    other => {
                        return Err(Error::UnexpectedType {
                            layer: layer_id.to_string(),
                            column,
                            found: format!("{:?}", other),
                        })
                    }
                };
                match decode_gpkg(&bytes) {
                    Ok(GpkgGeometry { geometry: None, .. }) => return Ok(None),
                    Ok(GpkgGeometry {
                        srs_id,
                        geometry: Some(decoded),
                    }) => {
                        if let Ok(header) = u32::try_from(srs_id) {
                            if header > 0 {
                                srid = header;
                            }
                        }
                        geometry = Some(decoded);
                    }
                    Err(WkbError::UnknownGeometryType(code)) => {
                        if self.report_unsupported(layer_id, &column) {
                            warn!(layer = layer_id, field = %column, code, "skipping rows with unsupported geometry");
                        }
                        return Ok(None);
                    }
                    Err(source) => {
                        return Err(Error::Geometry {
                            layer: layer_id.to_string(),
                            field: column,
                            source,
                        })
                    }
                }
            } else if layer.id_field.as_deref() == Some(column.as_str()) {
                id = feature_id(&value)?;
            } else if RESERVED_COLUMNS.contains(&column.as_str()) {
                continue;
            } else if let Some(tag) = tag_value(value) {
                tags.insert(column, tag);
            }
        }

        Ok(geometry.map(|geometry| Feature {
            id,
            geometry,
            srid,
            tags,
        }))
    }
}

fn parse_kind(layer: &str, name: &str) -> Result<GeometryKind> {
    name.parse().map_err(|name| Error::UnsupportedGeometryType {
        layer: layer.to_string(),
        name,
    })
}

fn check_srid(layer: &str, srid: i64) -> Result<u32> {
    match u32::try_from(srid) {
        Ok(srid @ (WEB_MERCATOR | WGS84)) => Ok(srid),
        _ => Err(Error::UnsupportedSrid {
            layer: layer.to_string(),
            srid: u32::try_from(srid).unwrap_or(0),
        }),
    }
}

fn to_wgs84(bounds: Bounds, srid: u32) -> Bounds {
    match srid {
        WEB_MERCATOR => bounds.to_wgs84(),
        _ => bounds,
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Overlap test of EPSG:3857 `bounds` against the R-tree columns, in `srid`.
fn rtree_filter(bounds: &Bounds, srid: u32) -> String {
    let b = to_wgs84(*bounds, srid);
    format!(
        "minx <= {} AND maxx >= {} AND miny <= {} AND maxy >= {}",
        b.east, b.west, b.north, b.south
    )
}

/// A table query joined against the table's `rtree_<table>_<column>` index.
/// Without an id field the join goes through the rowid.
fn table_sql(table: &str, geom_field: &str, id_field: Option<&str>, fields: &[String]) -> String {
    let key = id_field.map_or_else(|| "rowid".to_string(), quote_ident);
    let mut columns = Vec::with_capacity(fields.len() + 2);
    if id_field.is_some() {
        columns.push(format!("l.{}", key));
    }
    columns.push(format!("l.{}", quote_ident(geom_field)));
    columns.extend(
        fields
            .iter()
            .filter(|f| f.as_str() != geom_field && Some(f.as_str()) != id_field)
            .map(|f| format!("l.{}", quote_ident(f))),
    );

    format!(
        "SELECT {} FROM {} l JOIN {} si ON l.{key} = si.id WHERE l.{} IS NOT NULL AND {} ORDER BY l.{key}",
        columns.join(", "),
        quote_ident(table),
        quote_ident(&format!("rtree_{}_{}", table, geom_field)),
        quote_ident(geom_field),
        BBOX_TOKEN,
    )
}

#[async_trait]
impl Layerer for GpkgProvider {
    fn layer(&self, id: &str) -> Option<&LayerDescriptor> {
        self.layers.get(id)
    }

    fn layers(&self) -> Result<Vec<&LayerDescriptor>> {
        Ok(self.layers.iter().collect())
    }

    async fn add_layer(&mut self, config: &serde_yaml::Value) -> Result<()> {
        let config: LayerConfig = serde_yaml::from_value(config.clone())?;
        let (descriptor, layer) = self.build_layer(config).await?;
        let id = descriptor.id().to_string();
        self.layers.insert(descriptor)?;
        self.queries.insert(id, layer);
        Ok(())
    }

    fn layer_extent(&self, id: &str) -> Result<Bounds> {
        self.layers
            .get(id)
            .map(LayerDescriptor::extent)
            .ok_or_else(|| Error::LayerNotFound(id.to_string()))
    }

    fn layer_min_zoom(&self, id: &str) -> u8 {
        self.layers
            .get(id)
            .map_or(UNKNOWN_MIN_ZOOM, LayerDescriptor::min_zoom)
    }

    fn layer_max_zoom(&self, id: &str) -> u8 {
        self.layers
            .get(id)
            .map_or(UNKNOWN_MAX_ZOOM, LayerDescriptor::max_zoom)
    }
}

#[async_trait]
impl Tiler for GpkgProvider {
    async fn tile_features(
        &self,
        ctx: &CancellationToken,
        layer_id: &str,
        tile: &TileRequest,
        sink: &mut (dyn FnMut(Feature) -> Result<()> + Send),
    ) -> Result<()> {
        self.stream_features(ctx, layer_id, tile, sink).await
    }
}

/// Registers `gpkg`. Shutdown closes the pools of every provider it created.
pub fn register(registry: &mut DriverRegistry) -> Result<()> {
    let pools: Arc<Mutex<Vec<SqlitePool>>> = Arc::default();

    let opened = pools.clone();
    registry.register(
        NAME,
        Some(Constructor::standard(move |config| {
            let pools = opened.clone();
            async move {
                let (provider, pool) = GpkgProvider::open(config).await?;
                pools
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(pool);
                Ok(Box::new(provider) as Box<dyn Tiler>)
            }
        })),
        Some(close_pools(pools)),
    )
}

fn close_pools(pools: Arc<Mutex<Vec<SqlitePool>>>) -> Cleanup {
    cleanup(move || {
        let pools = pools.clone();
        async move {
            let open = std::mem::take(&mut *pools.lock().unwrap_or_else(PoisonError::into_inner));
            for pool in open {
                pool.close().await;
            }
        }
    })
}
