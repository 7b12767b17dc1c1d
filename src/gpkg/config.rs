use std::path::PathBuf;

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::tile::Bounds;
use crate::{Error, Result};

pub const DEFAULT_GEOM_FIELD: &str = "geom";
pub const DEFAULT_ID_FIELD: &str = "fid";
pub const DEFAULT_MIN_ZOOM: u8 = 0;
pub const DEFAULT_MAX_ZOOM: u8 = 20;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// The file and layers of a GeoPackage provider.
#[derive(Clone, Debug, Deserialize)]
pub struct GpkgConfig {
    pub filepath: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub layers: Vec<serde_yaml::Value>,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

impl GpkgConfig {
    /// Options for read-only connections to the file.
    pub fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.filepath)
            .read_only(true)
    }

    pub fn pool_options(&self) -> SqlitePoolOptions {
        SqlitePoolOptions::new().max_connections(self.max_connections.max(1))
    }
}

/// Configuration of one GeoPackage layer. Exactly one of `tablename` and
/// `sql` must be set.
#[derive(Clone, Debug, Deserialize)]
pub struct LayerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tablename: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    /// Empty reads every column of the table.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Used by `sql` layers; table layers read it from `gpkg_geometry_columns`.
    #[serde(default = "default_geom_field", rename = "geometry_fieldname")]
    pub geom_field: String,
    #[serde(default = "default_id_field", rename = "id_fieldname")]
    pub id_field: String,
    #[serde(default)]
    pub geometry_type: Option<String>,
    #[serde(default)]
    pub srid: Option<u32>,
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

/// Where a layer reads its rows from.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerSource {
    Table(String),
    Sql(String),
}

impl LayerConfig {
    pub fn source(&self) -> Result<LayerSource> {
        let table = self.tablename.as_deref().filter(|t| !t.trim().is_empty());
        let sql = self.sql.as_deref().filter(|s| !s.trim().is_empty());
        match (table, sql) {
            (Some(table), None) => Ok(LayerSource::Table(table.to_string())),
            (None, Some(sql)) => Ok(LayerSource::Sql(sql.to_string())),
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "layer {} sets both tablename and sql",
                self.id
            ))),
            (None, None) => Err(Error::Config(format!(
                "layer {} needs a tablename or sql",
                self.id
            ))),
        }
    }
}
