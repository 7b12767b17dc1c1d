//! The capabilities a provider can offer, and the union dispatching to them.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use geo_types::Geometry;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::backend::Value;
use crate::catalog::LayerDescriptor;
use crate::tile::{Bounds, TileRequest};
use crate::{Error, Result};

/// Min zoom reported when nothing more specific is known.
pub const DEFAULT_MIN_ZOOM: u8 = 0;
/// Max zoom reported when nothing more specific is known.
pub const DEFAULT_MAX_ZOOM: u8 = 16;

/// The two ways a provider can serve tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Streams decoded features to the caller.
    #[serde(alias = "postgis")]
    Standard,
    /// Returns tiles already encoded by the backend.
    #[serde(alias = "mvt_postgis", alias = "mvt")]
    NativeTile,
}

impl ProviderKind {
    /// Prefix of the driver names of this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            ProviderKind::Standard => "",
            ProviderKind::NativeTile => "mvt_",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Standard => f.write_str("Standard Provider"),
            ProviderKind::NativeTile => f.write_str("MVT Provider"),
        }
    }
}

/// A scalar tag value.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    String(String),
}

/// One decoded row of a layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub id: u64,
    pub geometry: Geometry<f64>,
    pub srid: u32,
    pub tags: HashMap<String, TagValue>,
}

/// A layer to encode into a native tile: the catalog id and the name it is
/// written under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileLayer {
    pub id: String,
    pub name: String,
}

impl TileLayer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        TileLayer {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Access to a provider's layers.
#[async_trait]
pub trait Layerer: Send + Sync {
    fn layer(&self, id: &str) -> Option<&LayerDescriptor>;

    /// All layers, in registration order.
    fn layers(&self) -> Result<Vec<&LayerDescriptor>>;

    /// Registers a layer from its configuration.
    async fn add_layer(&mut self, config: &serde_yaml::Value) -> Result<()>;

    /// Extent of a layer in EPSG:4326.
    fn layer_extent(&self, id: &str) -> Result<Bounds>;

    fn layer_min_zoom(&self, id: &str) -> u8;

    fn layer_max_zoom(&self, id: &str) -> u8;
}

/// A provider that streams features.
#[async_trait]
pub trait Tiler: Layerer {
    /// Calls `sink` with every feature of `layer_id` intersecting `tile`, in
    /// result order. An error from `sink` stops the stream and is returned
    /// as is.
    async fn tile_features(
        &self,
        ctx: &CancellationToken,
        layer_id: &str,
        tile: &TileRequest,
        sink: &mut (dyn FnMut(Feature) -> Result<()> + Send),
    ) -> Result<()>;
}

/// A provider that encodes tiles itself.
#[async_trait]
pub trait MvtTiler: Layerer {
    /// Returns the encoded layers concatenated in the order given. Layers
    /// missing from the catalog are left out.
    async fn mvt_for_layers(
        &self,
        ctx: &CancellationToken,
        tile: &TileRequest,
        layers: &[TileLayer],
    ) -> Result<Vec<u8>>;
}

/// A provider instance holding exactly one capability.
#[derive(Default)]
pub enum ProviderUnion {
    Standard(Box<dyn Tiler>),
    NativeTile(Box<dyn MvtTiler>),
    #[default]
    Unavailable,
}

impl ProviderUnion {
    pub fn kind(&self) -> Option<ProviderKind> {
        match self {
            ProviderUnion::Standard(_) => Some(ProviderKind::Standard),
            ProviderUnion::NativeTile(_) => Some(ProviderKind::NativeTile),
            ProviderUnion::Unavailable => None,
        }
    }

    pub fn as_tiler(&self) -> Option<&dyn Tiler> {
        match self {
            ProviderUnion::Standard(tiler) => Some(tiler.as_ref()),
            _ => None,
        }
    }

    pub fn as_mvt_tiler(&self) -> Option<&dyn MvtTiler> {
        match self {
            ProviderUnion::NativeTile(tiler) => Some(tiler.as_ref()),
            _ => None,
        }
    }

    pub fn layers(&self) -> Result<Vec<&LayerDescriptor>> {
        match self {
            ProviderUnion::Standard(p) => p.layers(),
            ProviderUnion::NativeTile(p) => p.layers(),
            ProviderUnion::Unavailable => Err(Error::NoCapability),
        }
    }

    pub fn layer(&self, id: &str) -> Result<Option<&LayerDescriptor>> {
        match self {
            ProviderUnion::Standard(p) => Ok(p.layer(id)),
            ProviderUnion::NativeTile(p) => Ok(p.layer(id)),
            ProviderUnion::Unavailable => Err(Error::NoCapability),
        }
    }

    pub async fn add_layer(&mut self, config: &serde_yaml::Value) -> Result<()> {
        match self {
            ProviderUnion::Standard(p) => p.add_layer(config).await,
            ProviderUnion::NativeTile(p) => p.add_layer(config).await,
            ProviderUnion::Unavailable => Err(Error::NoCapability),
        }
    }

    /// Falls back to the whole world when no capability is present.
    pub fn layer_extent(&self, id: &str) -> Result<Bounds> {
        match self {
            ProviderUnion::Standard(p) => p.layer_extent(id),
            ProviderUnion::NativeTile(p) => p.layer_extent(id),
            ProviderUnion::Unavailable => Ok(Bounds::WORLD),
        }
    }

    pub fn layer_min_zoom(&self, id: &str) -> u8 {
        match self {
            ProviderUnion::Standard(p) => p.layer_min_zoom(id),
            ProviderUnion::NativeTile(p) => p.layer_min_zoom(id),
            ProviderUnion::Unavailable => DEFAULT_MIN_ZOOM,
        }
    }

    pub fn layer_max_zoom(&self, id: &str) -> u8 {
        match self {
            ProviderUnion::Standard(p) => p.layer_max_zoom(id),
            ProviderUnion::NativeTile(p) => p.layer_max_zoom(id),
            ProviderUnion::Unavailable => DEFAULT_MAX_ZOOM,
        }
    }

    pub async fn tile_features(
        &self,
        ctx: &CancellationToken,
        layer_id: &str,
        tile: &TileRequest,
        sink: &mut (dyn FnMut(Feature) -> Result<()> + Send),
    ) -> Result<()> {
        match self {
            ProviderUnion::Standard(p) => p.tile_features(ctx, layer_id, tile, sink).await,
            _ => Err(Error::NoCapability),
        }
    }

    pub async fn mvt_for_layers(
        &self,
        ctx: &CancellationToken,
        tile: &TileRequest,
        layers: &[TileLayer],
    ) -> Result<Vec<u8>> {
        match self {
            ProviderUnion::NativeTile(p) => p.mvt_for_layers(ctx, tile, layers).await,
            _ => Err(Error::NoCapability),
        }
    }
}

impl fmt::Debug for ProviderUnion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layers: Vec<&str> = self
            .layers()
            .map(|layers| layers.into_iter().map(LayerDescriptor::id).collect())
            .unwrap_or_default();
        match self.kind() {
            Some(kind) => f
                .debug_struct("ProviderUnion")
                .field("kind", &kind)
                .field("layers", &layers)
                .finish(),
            None => f.write_str("ProviderUnion::Unavailable"),
        }
    }
}

/// Accepts non-negative integers, integral floats and numeric text.
pub(crate) fn feature_id(value: &Value) -> Result<u64> {
    let invalid = || Error::FeatureId(format!("{:?}", value));
    match value {
        Value::Int2(_) | Value::Int4(_) | Value::Int8(_) => value
            .as_i64()
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(invalid),
        Value::Float4(v) => float_id(f64::from(*v)).ok_or_else(invalid),
        Value::Float8(v) => float_id(*v).ok_or_else(invalid),
        Value::Text(text) => text.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn float_id(v: f64) -> Option<u64> {
    (v >= 0.0 && v.fract() == 0.0 && v < u64::MAX as f64).then_some(v as u64)
}

pub(crate) fn tag_value(value: Value) -> Option<TagValue> {
    Some(match value {
        Value::Bool(v) => TagValue::Bool(v),
        Value::Int2(v) => TagValue::Int2(v),
        Value::Int4(v) => TagValue::Int4(v),
        Value::Int8(v) => TagValue::Int8(v),
        Value::Float4(v) => TagValue::Float4(v),
        Value::Float8(v) => TagValue::Float8(v),
        Value::Text(v) => TagValue::String(v),
        Value::Bytes(v) => TagValue::String(String::from_utf8_lossy(&v).into_owned()),
        Value::Null | Value::Unsupported(_) => return None,
    })
}
