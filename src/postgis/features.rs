use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::PostgisProvider;
use crate::backend::{stream_rows, Row, Value};
use crate::geometry::{decode_wkb, WkbError};
use crate::provider::{feature_id, tag_value, Feature, ProviderKind};
use crate::query::{LayerQuery, ZoomMode};
use crate::tile::TileRequest;
use crate::{Error, Result};

impl PostgisProvider {
    /// Streams the features of a layer to `sink`.
    ///
    /// Cancellation is checked before the query runs and before every row.
    /// The result must contain the geometry field, even when it has no rows.
    pub(super) async fn stream_features(
        &self,
        ctx: &CancellationToken,
        layer_id: &str,
        tile: &TileRequest,
        sink: &mut (dyn FnMut(Feature) -> Result<()> + Send),
    ) -> Result<()> {
        let (layer, query) = self.layer_query(layer_id)?;
        if query.kind != ProviderKind::Standard {
            return Err(Error::NoCapability);
        }

        let sql = query.synthesize(tile, ZoomMode::Explicit);
        stream_rows(
            self.backend.as_ref(),
            ctx,
            layer.id(),
            &query.geom_field,
            &sql,
            &mut |row: Row| -> Result<()> {
                match self.decode_feature(layer.id(), query, row)? {
                    Some(feature) => sink(feature),
                    None => Ok(()),
                }
            },
        )
        .await?;
        Ok(())
    }

    /// Turns a row into a feature. Rows with an empty geometry, or one that
    /// cannot be represented, yield nothing.
    fn decode_feature(&self, layer: &str, query: &LayerQuery, row: Row) -> Result<Option<Feature>> {
        let mut id = 0;
        let mut geometry = None;
        let mut tags = HashMap::new();

        for (column, value) in row.into_pairs() {
            if column == query.geom_field {
                let bytes = match value {
                    Value::Bytes(bytes) if !bytes.is_empty() => bytes,
                    Value::Null | Value::Bytes(_) => return Ok(None),
                    other => {
                        return Err(Error::UnexpectedType {
                            layer: layer.to_string(),
                            column,
                            found: format!("{:?}", other),
                        })
                    }
                };
                match decode_wkb(&bytes) {
                    Ok(decoded) => geometry = Some(decoded),
                    Err(WkbError::UnknownGeometryType(code)) => {
                        if self.report_unsupported(layer, &column) {
                            warn!(layer, field = %column, code, "skipping rows with unsupported geometry");
                        }
                        return Ok(None);
                    }
                    Err(source) => {
                        return Err(Error::Geometry {
                            layer: layer.to_string(),
                            field: column,
                            source,
                        })
                    }
                }
            } else if query.id_field.as_deref() == Some(column.as_str()) {
                id = feature_id(&value)?;
            } else if let Some(tag) = tag_value(value) {
                tags.insert(column, tag);
            }
        }

        Ok(geometry.map(|geometry| Feature {
            id,
            geometry,
            srid: query.srid,
            tags,
        }))
    }
}
