//! The PostGIS driver.
//!
//! One [`PostgisProvider`] serves the layers of one database. It is
//! registered twice: as `postgis`, streaming decoded features, and as
//! `mvt_postgis`, letting PostGIS encode the tiles with `ST_AsMVT`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{PgBackend, SqlBackend};
use crate::catalog::{LayerCatalog, LayerDescriptor};
use crate::geometry::GeometryKind;
use crate::provider::{
    Feature, Layerer, MvtTiler, ProviderKind, TileLayer, Tiler, DEFAULT_MAX_ZOOM,
    DEFAULT_MIN_ZOOM,
};
use crate::query::{is_select_query, LayerQuery};
use crate::registry::{cleanup, Cleanup, Constructor, DriverRegistry};
use crate::tile::{Bounds, TileRequest};
use crate::{Error, Result};

mod config;
mod features;
mod introspect;
mod mvt;

pub use config::{LayerConfig, PostgisConfig};
pub use introspect::{DENSITY_THRESHOLD, MAX_ZOOM_CEILING};

use introspect::Inspector;

pub const NAME: &str = "postgis";

pub struct PostgisProvider {
    backend: Arc<dyn SqlBackend>,
    srid: u32,
    kind: ProviderKind,
    layers: LayerCatalog,
    /// (layer, field) pairs already warned about unsupported geometries.
    reported: Mutex<HashSet<(String, String)>>,
}

impl PostgisProvider {
    /// A provider without layers. `srid` and `kind` are the defaults for
    /// layers that do not set their own.
    pub fn new(backend: Arc<dyn SqlBackend>, srid: u32, kind: ProviderKind) -> Self {
        PostgisProvider {
            backend,
            srid,
            kind,
            layers: LayerCatalog::new(),
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Connects to the configured database and registers every layer. The
    /// first layer that fails aborts the construction.
    pub async fn connect(
        config: serde_yaml::Value,
        kind: ProviderKind,
    ) -> Result<(PostgisProvider, PgPool)> {
        let config: PostgisConfig = serde_yaml::from_value(config)?;
        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await?;

        let backend = Arc::new(PgBackend::new(pool.clone()));
        let mut provider = PostgisProvider::new(backend, config.srid, kind);
        for layer in &config.layers {
            provider.add_layer(layer).await?;
        }

        info!(
            host = %config.host,
            database = %config.database,
            layers = provider.layers.len(),
            %kind,
            "connected postgis provider"
        );
        Ok((provider, pool))
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// The descriptor and query of a layer.
    fn layer_query(&self, id: &str) -> Result<(&LayerDescriptor, &LayerQuery)> {
        self.layers
            .get(id)
            .and_then(|layer| layer.query().map(|query| (layer, query)))
            .ok_or_else(|| Error::LayerNotFound(id.to_string()))
    }

    /// Records a row skipped for its geometry. True the first time a
    /// (layer, field) pair is reported.
    fn report_unsupported(&self, layer: &str, field: &str) -> bool {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((layer.to_string(), field.to_string()))
    }

    async fn build_layer(&self, config: LayerConfig) -> Result<LayerDescriptor> {
        let id = config.id;
        if self.layers.contains(&id) {
            return Err(Error::DuplicateLayer(id));
        }

        let geom_field = config.geom_field;
        let id_field = Some(config.id_field).filter(|f| !f.is_empty());
        if id_field.as_deref() == Some(geom_field.as_str()) {
            return Err(Error::FieldCollision {
                layer: id,
                field: geom_field,
            });
        }

        let name = config.name.unwrap_or_else(|| id.clone());
        let srid = config.srid.unwrap_or(self.srid);
        let kind = config.kind.unwrap_or(self.kind);
        let geometry_kind = config
            .geometry_type
            .map(|name| {
                name.parse::<GeometryKind>()
                    .map_err(|name| Error::UnsupportedGeometryType {
                        layer: id.clone(),
                        name,
                    })
            })
            .transpose()?;

        let mut tablename = config.tablename;
        let mut sql = None;
        if let Some(custom) = config.sql.filter(|s| !s.trim().is_empty()) {
            if is_select_query(&custom)? {
                if tablename.is_some() {
                    warn!(layer = %id, "both tablename and sql are set, using sql");
                }
                sql = Some(custom);
            } else {
                tablename = Some(custom);
            }
        }

        let query = match sql {
            Some(sql) => LayerQuery::custom(&id, &sql, &geom_field, id_field.as_deref(), srid, kind)?,
            None => {
                let table = tablename.unwrap_or_else(|| name.clone());
                let fields = if config.fields.is_empty() {
                    self.backend
                        .columns(&format!("SELECT * FROM {} LIMIT 0", table))
                        .await?
                } else {
                    config.fields
                };
                LayerQuery::table(&table, &fields, &geom_field, id_field.as_deref(), srid, kind)
            }
        };

        let inspector = Inspector::new(self.backend.as_ref(), &id, &query);
        let geometry_kind = match geometry_kind {
            Some(kind) => kind,
            None => inspector.geometry_kind().await?,
        };

        let (extent, min_zoom, max_zoom) = match (config.min_zoom, config.max_zoom) {
            (Some(min), Some(max)) => {
                if min > max {
                    return Err(Error::InvalidZoomRange {
                        layer: id.clone(),
                        min: min.into(),
                        max: max.into(),
                    });
                }
                (config.bounds.unwrap_or(Bounds::WORLD), min, max)
            }
            (min, max) => {
                let extent = match config.bounds {
                    Some(bounds) => bounds,
                    None => inspector.extent().await?,
                };
                let min = min.unwrap_or_else(|| {
                    introspect::min_zoom(&extent).min(max.unwrap_or(MAX_ZOOM_CEILING))
                });
                let max = match max {
                    Some(max) => max,
                    None => inspector.max_zoom(&extent, min).await?.max(min),
                };
                (extent, min, max)
            }
        };

        debug!(
            layer = %id,
            geometry = %geometry_kind,
            min_zoom,
            max_zoom,
            sql = %query,
            "registered layer"
        );
        Ok(LayerDescriptor::new(id, name, geometry_kind, srid, (min_zoom, max_zoom), extent)
            .with_query(query))
    }
}

#[async_trait]
impl Layerer for PostgisProvider {
    fn layer(&self, id: &str) -> Option<&LayerDescriptor> {
        self.layers.get(id)
    }

    fn layers(&self) -> Result<Vec<&LayerDescriptor>> {
        Ok(self.layers.iter().collect())
    }

    async fn add_layer(&mut self, config: &serde_yaml::Value) -> Result<()> {
        let config: LayerConfig = serde_yaml::from_value(config.clone())?;
        let layer = self.build_layer(config).await?;
        self.layers.insert(layer)
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
            .map_or(DEFAULT_MIN_ZOOM, LayerDescriptor::min_zoom)
    }

    fn layer_max_zoom(&self, id: &str) -> u8 {
        self.layers
            .get(id)
            .map_or(DEFAULT_MAX_ZOOM, LayerDescriptor::max_zoom)
    }
}

#[async_trait]
impl Tiler for PostgisProvider {
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

#[async_trait]
impl MvtTiler for PostgisProvider {
    async fn mvt_for_layers(
        &self,
        ctx: &CancellationToken,
        tile: &TileRequest,
        layers: &[TileLayer],
    ) -> Result<Vec<u8>> {
        self.aggregate_tile(ctx, tile, layers).await
    }
}

/// Registers `postgis` and `mvt_postgis`. Shutdown closes the pools of every
/// provider either of them created.
pub fn register(registry: &mut DriverRegistry) -> Result<()> {
    let pools: Arc<Mutex<Vec<PgPool>>> = Arc::default();

    let standard = pools.clone();
    registry.register(
        NAME,
        Some(Constructor::standard(move |config| {
            let pools = standard.clone();
            async move {
                let (provider, pool) = PostgisProvider::connect(config, ProviderKind::Standard).await?;
                track(&pools, pool);
                Ok(Box::new(provider) as Box<dyn Tiler>)
            }
        })),
        Some(close_pools(pools.clone())),
    )?;

    let native = pools.clone();
    registry.register(
        &format!("{}{}", ProviderKind::NativeTile.prefix(), NAME),
        Some(Constructor::native_tile(move |config| {
            let pools = native.clone();
            async move {
                let (provider, pool) =
                    PostgisProvider::connect(config, ProviderKind::NativeTile).await?;
                track(&pools, pool);
                Ok(Box::new(provider) as Box<dyn MvtTiler>)
            }
        })),
        Some(close_pools(pools)),
    )
}

fn track(pools: &Mutex<Vec<PgPool>>, pool: PgPool) {
    pools
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(pool);
}

fn close_pools(pools: Arc<Mutex<Vec<PgPool>>>) -> Cleanup {
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
