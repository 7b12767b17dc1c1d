use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::PostgisProvider;
use crate::backend::Value;
use crate::provider::{ProviderKind, TileLayer};
use crate::query::{quote_literal, ZoomMode};
use crate::tile::{TileRequest, MVT_EXTENT};
use crate::{Error, Result};

impl PostgisProvider {
    /// Builds the single statement encoding `layers`, in order. Layers that
    /// are unknown or not native tile layers are left out.
    fn aggregate_sql(&self, tile: &TileRequest, layers: &[TileLayer]) -> Option<String> {
        let mut parts = Vec::with_capacity(layers.len());
        for entry in layers {
            let query = match self.layer_query(&entry.id) {
                Ok((_, query)) if query.kind == ProviderKind::NativeTile => query,
                Ok(_) => {
                    warn!(layer = %entry.id, "not a native tile layer, leaving it out of the tile");
                    continue;
                }
                Err(_) => {
                    warn!(layer = %entry.id, "unknown layer, leaving it out of the tile");
                    continue;
                }
            };

            let mut encode = format!(
                "ST_AsMVT(q, {}, {}, {}",
                quote_literal(&entry.name),
                MVT_EXTENT,
                quote_literal(&query.geom_field)
            );
            if let Some(id_field) = &query.id_field {
                encode.push_str(", ");
                encode.push_str(&quote_literal(id_field));
            }
            encode.push(')');
            parts.push(format!(
                "(SELECT {} AS data FROM ({}) AS q)",
                encode,
                query.synthesize(tile, ZoomMode::Explicit)
            ));
        }

        if parts.is_empty() {
            return None;
        }
        Some(format!("SELECT {} AS data", parts.join(" || ")))
    }

    pub(super) async fn aggregate_tile(
        &self,
        ctx: &CancellationToken,
        tile: &TileRequest,
        layers: &[TileLayer],
    ) -> Result<Vec<u8>> {
        let Some(sql) = self.aggregate_sql(tile, layers) else {
            return Ok(Vec::new());
        };
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }

        trace!(%sql, "aggregating tile");
        let row = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Canceled),
            row = self.backend.fetch_first(&sql) => row?,
        };

        match row.and_then(|row| row.first().cloned()) {
            Some(Value::Bytes(bytes)) => Ok(bytes),
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(other) => Err(Error::UnexpectedType {
                layer: layers
                    .iter()
                    .map(|l| l.id.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                column: "data".to_string(),
                found: format!("{:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::mock::{database_error, row, MockBackend};
    use crate::postgis::tests::provider;
    use crate::provider::MvtTiler;

    const LAYERS: &str = r#"
- id: land
  tablename: land
  fields: [class]
  geometry_type: multipolygon
  min_zoom: 0
  max_zoom: 14
- id: roads
  tablename: roads
  fields: [name]
  id_fieldname: ""
  geometry_type: linestring
  min_zoom: 0
  max_zoom: 14
- id: labels
  tablename: labels
  fields: [name]
  geometry_type: point
  type: postgis
  min_zoom: 0
  max_zoom: 14
"#;

    fn blob(layer: &str) -> Vec<u8> {
        format!("<{}>", layer).into_bytes()
    }

    /// Answers with the blobs of the layers named in the statement, in order.
    fn encoding_backend() -> Arc<MockBackend> {
        Arc::new(MockBackend::new(|sql| {
            let mut positions: Vec<(usize, &str)> = ["Land", "Missing", "Roads", "Labels"]
                .into_iter()
                .filter_map(|name| sql.find(&format!("'{}'", name)).map(|at| (at, name)))
                .collect();
            positions.sort_unstable();
            let data: Vec<u8> = positions.into_iter().flat_map(|(_, name)| blob(name)).collect();
            Ok(vec![row(&["data"], vec![Value::Bytes(data)])])
        }))
    }

    fn tile() -> TileRequest {
        TileRequest::web_mercator(10, 550, 335)
    }

    #[tokio::test]
    async fn test_unknown_layers_are_left_out() {
        let backend = encoding_backend();
        let provider = provider(&backend, ProviderKind::NativeTile, LAYERS).await.unwrap();

        let layers = [
            TileLayer::new("land", "Land"),
            TileLayer::new("rivers", "Missing"),
            TileLayer::new("roads", "Roads"),
        ];
        let data = provider
            .mvt_for_layers(&CancellationToken::new(), &tile(), &layers)
            .await
            .unwrap();

        assert_eq!([blob("Land"), blob("Roads")].concat(), data);
        let queries = backend.queries();
        assert_eq!(1, queries.len());
        assert_eq!(false, queries[0].contains("'Missing'"));
        assert_eq!(true, queries[0].starts_with("SELECT (SELECT ST_AsMVT(q, 'Land', 4096, 'geom', 'gid') AS data FROM (SELECT \"class\", \"gid\", ST_AsMVTGeom(\"geom\", ST_MakeEnvelope("));
        assert_eq!(true, queries[0].contains(") AS q) || (SELECT ST_AsMVT(q, 'Roads', 4096, 'geom') AS data FROM (SELECT \"name\", ST_AsMVTGeom("));
        assert_eq!(true, queries[0].ends_with(") AS q) AS data"));
        assert_eq!(false, queries[0].contains("!BBOX"));
    }

    #[tokio::test]
    async fn test_output_follows_request_order() {
        let backend = encoding_backend();
        let provider = provider(&backend, ProviderKind::NativeTile, LAYERS).await.unwrap();

        let layers = [TileLayer::new("roads", "Roads"), TileLayer::new("land", "Land")];
        let data = provider
            .mvt_for_layers(&CancellationToken::new(), &tile(), &layers)
            .await
            .unwrap();
        assert_eq!([blob("Roads"), blob("Land")].concat(), data);
    }

    #[tokio::test]
    async fn test_nothing_to_encode() {
        let backend = encoding_backend();
        let provider = provider(&backend, ProviderKind::NativeTile, LAYERS).await.unwrap();

        let layers = [TileLayer::new("labels", "Labels"), TileLayer::new("rivers", "Rivers")];
        let data = provider
            .mvt_for_layers(&CancellationToken::new(), &tile(), &layers)
            .await
            .unwrap();
        assert_eq!(true, data.is_empty());
        assert_eq!(true, backend.queries().is_empty());

        let null = Arc::new(MockBackend::with_rows(vec![row(&["data"], vec![Value::Null])]));
        let empty = provider(&null, ProviderKind::NativeTile, LAYERS).await.unwrap();
        let data = empty
            .mvt_for_layers(&CancellationToken::new(), &tile(), &[TileLayer::new("land", "Land")])
            .await
            .unwrap();
        assert_eq!(true, data.is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_errors() {
        let failing = Arc::new(MockBackend::new(|_| {
            Err(database_error("function st_asmvt does not exist"))
        }));
        let provider = provider(&failing, ProviderKind::NativeTile, LAYERS).await.unwrap();
        let layers = [TileLayer::new("land", "Land")];

        match provider
            .mvt_for_layers(&CancellationToken::new(), &tile(), &layers)
            .await
        {
            Err(Error::Database(err)) => {
                assert_eq!(true, err.to_string().contains("function st_asmvt does not exist"))
            }
            other => panic!("unexpected result {:?}", other),
        }

        let ctx = CancellationToken::new();
        ctx.cancel();
        let before = failing.queries().len();
        assert!(matches!(
            provider.mvt_for_layers(&ctx, &tile(), &layers).await,
            Err(Error::Canceled)
        ));
        assert_eq!(before, failing.queries().len());
    }
}
