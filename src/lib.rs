//! # Tile Provider
//!
//! The data side of a map tile server: given a tile and a layer, fetch the
//! features that belong in it.
//!
//! ## Overview
//!
//! Providers are created by name from a [`DriverRegistry`]. A driver either
//! streams decoded [`Feature`]s to a callback ([`Tiler`]), or asks the
//! backend to encode whole vector tiles itself ([`MvtTiler`]). Both come back
//! as a [`ProviderUnion`], so callers can check what an instance supports
//! before using it.
//!
//! The PostGIS driver is registered twice, as `postgis` and `mvt_postgis`.
//! Each layer is either a table or a custom SQL query containing `!BBOX!`,
//! which is replaced with the tile envelope at request time. Geometry type,
//! extent and zoom range are probed from the database when a layer does not
//! configure them. The `gpkg` driver streams features out of a GeoPackage
//! file through its R-tree index. The `debug` driver needs no database and
//! draws the tile outline and center.
//!
//! ## Known Limitations
//!
//! Only 2D geometries are decoded; rows with Z or M coordinates are skipped.
//! Max zoom detection assumes the number of features per tile does not grow
//! with zoom. GeoPackage layers must be stored in EPSG:3857 or EPSG:4326.

#![deny(warnings)]

pub mod backend;
pub mod catalog;
pub mod debug;
pub mod error;
pub mod geometry;
pub mod gpkg;
pub mod postgis;
pub mod provider;
pub mod query;
pub mod registry;
pub mod tile;

pub use catalog::{LayerCatalog, LayerDescriptor};
pub use error::{Error, Result};
pub use geometry::GeometryKind;
pub use provider::{Feature, Layerer, MvtTiler, ProviderKind, ProviderUnion, TagValue, TileLayer, Tiler};
pub use registry::{Constructor, DriverRegistry};
pub use tile::{Bounds, TileRequest};
