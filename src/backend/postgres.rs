use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use futures::stream::{StreamExt, TryStreamExt};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::types::Uuid;
use sqlx::{Column, Executor, Row as _, Statement, TypeInfo, ValueRef};
use tracing::trace;

use super::{ResultSet, Row, SqlBackend, Value};
use crate::{Error, Result};

/// A [`SqlBackend`] over a PostgreSQL connection pool.
#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        PgBackend { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SqlBackend for PgBackend {
    async fn query<'a>(&'a self, sql: &'a str) -> Result<ResultSet<'a>> {
        trace!(%sql, "executing");
        let columns: Arc<[String]> = self.columns(sql).await?.into();
        let shared = columns.clone();
        let rows = sqlx::query(sql)
            .fetch(&self.pool)
            .map_err(Error::from)
            .and_then(move |row| future::ready(decode_row(&row, shared.clone())))
            .boxed();
        Ok(ResultSet::new(columns, rows))
    }

    async fn columns(&self, sql: &str) -> Result<Vec<String>> {
        trace!(%sql, "preparing");
        let statement = self.pool.prepare(sql).await?;
        Ok(statement
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect())
    }
}

fn decode_row(row: &PgRow, columns: Arc<[String]>) -> Result<Row> {
    let values = row
        .columns()
        .iter()
        .map(|column| decode_value(row, column.ordinal(), column.type_info().name()))
        .collect::<Result<Vec<_>>>()?;

    Ok(Row::new(columns, values))
}

/// Maps a column onto [`Value`] by its PostgreSQL type name. Identifier and
/// time types are rendered as text.
fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get(index)?),
        "INT2" => Value::Int2(row.try_get(index)?),
        "INT4" => Value::Int4(row.try_get(index)?),
        "INT8" => Value::Int8(row.try_get(index)?),
        "FLOAT4" => Value::Float4(row.try_get(index)?),
        "FLOAT8" => Value::Float8(row.try_get(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get(index)?),
        "BYTEA" => Value::Bytes(row.try_get(index)?),
        "UUID" => Value::Text(row.try_get::<Uuid, _>(index)?.to_string()),
        "DATE" => Value::Text(row.try_get::<NaiveDate, _>(index)?.to_string()),
        "TIMESTAMP" => Value::Text(row.try_get::<NaiveDateTime, _>(index)?.to_string()),
        "TIMESTAMPTZ" => Value::Text(row.try_get::<DateTime<Utc>, _>(index)?.to_rfc3339()),
        other => Value::Unsupported(other.to_string()),
    };

    Ok(value)
}
