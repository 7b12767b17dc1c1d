//! Per-provider layer descriptors.

use std::collections::HashMap;

use crate::geometry::GeometryKind;
use crate::query::LayerQuery;
use crate::tile::Bounds;
use crate::{Error, Result};

/// Everything a provider knows about one of its layers. Built once at
/// registration; the catalog only hands out shared references afterwards.
#[derive(Clone, Debug)]
pub struct LayerDescriptor {
    id: String,
    name: String,
    geometry_kind: GeometryKind,
    srid: u32,
    min_zoom: u8,
    max_zoom: u8,
    extent: Bounds,
    query: Option<LayerQuery>,
}

impl LayerDescriptor {
    /// A layer that is not backed by a query.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        geometry_kind: GeometryKind,
        srid: u32,
        zooms: (u8, u8),
        extent: Bounds,
    ) -> Self {
        LayerDescriptor {
            id: id.into(),
            name: name.into(),
            geometry_kind,
            srid,
            min_zoom: zooms.0,
            max_zoom: zooms.1,
            extent,
            query: None,
        }
    }

    pub fn with_query(mut self, query: LayerQuery) -> Self {
        self.srid = query.srid;
        self.query = Some(query);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry_kind(&self) -> GeometryKind {
        self.geometry_kind
    }

    pub fn srid(&self) -> u32 {
        self.srid
    }

    pub fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    /// Extent of the layer's geometries in EPSG:4326.
    pub fn extent(&self) -> Bounds {
        self.extent
    }

    pub fn query(&self) -> Option<&LayerQuery> {
        self.query.as_ref()
    }

    pub fn geom_field(&self) -> Option<&str> {
        self.query.as_ref().map(|q| q.geom_field.as_str())
    }

    pub fn id_field(&self) -> Option<&str> {
        self.query.as_ref().and_then(|q| q.id_field.as_deref())
    }

    pub fn tag_fields(&self) -> &[String] {
        self.query
            .as_ref()
            .map(|q| q.tag_fields.as_slice())
            .unwrap_or_default()
    }
}

/// Layers in registration order, indexed by id.
#[derive(Clone, Debug, Default)]
pub struct LayerCatalog {
    layers: Vec<LayerDescriptor>,
    index: HashMap<String, usize>,
}

impl LayerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: LayerDescriptor) -> Result<()> {
        if self.index.contains_key(layer.id()) {
            return Err(Error::DuplicateLayer(layer.id));
        }
        self.index.insert(layer.id.clone(), self.layers.len());
        self.layers.push(layer);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&LayerDescriptor> {
        self.index.get(id).map(|&i| &self.layers[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
