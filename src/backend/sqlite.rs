use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use futures::stream::{StreamExt, TryStreamExt};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, Executor, Row as _, Statement, TypeInfo, ValueRef};
use tracing::trace;

use super::{ResultSet, Row, SqlBackend, Value};
use crate::{Error, Result};

/// A [`SqlBackend`] over a SQLite connection pool, used for GeoPackage files.
#[derive(Clone, Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteBackend { pool }
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
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

fn decode_row(row: &SqliteRow, columns: Arc<[String]>) -> Result<Row> {
    let values = (0..row.len())
        .map(|index| decode_value(row, index))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns, values))
}

/// SQLite types values, not columns: the storage class of each value picks
/// the variant.
fn decode_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();

    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => Value::Int8(row.try_get_unchecked(index)?),
        "REAL" | "NUMERIC" => Value::Float8(row.try_get_unchecked(index)?),
        "TEXT" | "DATE" | "TIME" | "DATETIME" => Value::Text(row.try_get_unchecked(index)?),
        "BLOB" => Value::Bytes(row.try_get_unchecked(index)?),
        _ => Value::Unsupported(storage),
    };

    Ok(value)
}
