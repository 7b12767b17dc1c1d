use std::path::PathBuf;

use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use crate::provider::ProviderKind;
use crate::tile::{Bounds, WEB_MERCATOR};
use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;
pub const DEFAULT_SRID: u32 = WEB_MERCATOR;
pub const DEFAULT_GEOM_FIELD: &str = "geom";
pub const DEFAULT_ID_FIELD: &str = "gid";

const APPLICATION_NAME: &str = "tile_provider";

/// Connection settings and layers of a PostGIS provider.
#[derive(Clone, Debug, Deserialize)]
pub struct PostgisConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default)]
    pub ssl_key: Option<PathBuf>,
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,
    #[serde(default)]
    pub ssl_root_cert: Option<PathBuf>,
    /// 0 leaves the pool unbounded.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_srid")]
    pub srid: u32,
    #[serde(default)]
    pub layers: Vec<serde_yaml::Value>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_srid() -> u32 {
    DEFAULT_SRID
}

impl PostgisConfig {
    pub fn ssl_mode(&self) -> Result<PgSslMode> {
        Ok(match self.ssl_mode.as_str() {
            "disable" => PgSslMode::Disable,
            "allow" => PgSslMode::Allow,
            "prefer" => PgSslMode::Prefer,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            other => return Err(Error::InvalidSslMode(other.to_string())),
        })
    }

    /// Options for read-only connections.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(self.ssl_mode()?)
            .application_name(APPLICATION_NAME)
            .options([("default_transaction_read_only", "TRUE")]);

        match (&self.ssl_cert, &self.ssl_key) {
            (Some(cert), Some(key)) => {
                options = options.ssl_client_cert(cert).ssl_client_key(key);
            }
            (None, None) => {}
            _ => {
                return Err(Error::Tls(
                    "ssl_cert and ssl_key must be given together".to_string(),
                ))
            }
        }
        if let Some(root) = &self.ssl_root_cert {
            options = options.ssl_root_cert(root);
        }

        Ok(options)
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        let max = match self.max_connections {
            0 => u32::MAX,
            n => n,
        };
        PgPoolOptions::new().max_connections(max)
    }
}

/// Configuration of one layer.
#[derive(Clone, Debug, Deserialize)]
pub struct LayerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tablename: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default = "default_geom_field", rename = "geometry_fieldname")]
    pub geom_field: String,
    /// An empty id field means features carry no id.
    #[serde(default = "default_id_field", rename = "id_fieldname")]
    pub id_field: String,
    #[serde(default)]
    pub geometry_type: Option<String>,
    #[serde(default)]
    pub srid: Option<u32>,
    #[serde(default, rename = "type")]
    pub kind: Option<ProviderKind>,
    #[serde(default)]
    pub min_zoom: Option<u8>,
    #[serde(default)]
    pub max_zoom: Option<u8>,
    /// `[west, south, east, north]` in EPSG:4326.
    #[serde(default)]
    pub bounds: Option<Bounds>,
}

fn default_geom_field() -> String {
    DEFAULT_GEOM_FIELD.to_string()
}

fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_string()
}
