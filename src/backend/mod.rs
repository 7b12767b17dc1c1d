//! The seam between drivers and the database that executes their SQL.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

#[cfg(test)]
pub(crate) mod mock;
mod postgres;
mod sqlite;

pub use postgres::PgBackend;
pub use sqlite::SqliteBackend;

/// A single decoded column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// A non-null value of a type the backend does not decode, by type name.
    Unsupported(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Widens any integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int2(v) => Some(v.into()),
            Value::Int4(v) => Some(v.into()),
            Value::Int8(v) => Some(v),
            _ => None,
        }
    }

    /// Widens any numeric value.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float4(v) => Some(v.into()),
            Value::Float8(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }
}

/// One result row. Column names are shared between all rows of a result.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Row { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.values.get(index)
    }

    pub fn first(&self) -> Option<&Value> {
        self.values.first()
    }

    /// Consumes the row, pairing every value with its column name.
    pub fn into_pairs(self) -> impl Iterator<Item = (String, Value)> {
        let columns = self.columns;
        self.values
            .into_iter()
            .enumerate()
            .map(move |(i, value)| (columns.get(i).cloned().unwrap_or_default(), value))
    }
}

/// The columns of a result and a stream over its rows. The columns are known
/// even when the result has no rows.
pub struct ResultSet<'a> {
    pub columns: Arc<[String]>,
    pub rows: BoxStream<'a, Result<Row>>,
}

impl<'a> ResultSet<'a> {
    pub fn new(columns: Arc<[String]>, rows: BoxStream<'a, Result<Row>>) -> Self {
        ResultSet { columns, rows }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

/// Executes SQL on behalf of a provider.
///
/// Dropping the [`ResultSet`] returned by [`SqlBackend::query`] releases the
/// underlying cursor and connection.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Runs `sql`, streaming its rows in result order.
    async fn query<'a>(&'a self, sql: &'a str) -> Result<ResultSet<'a>>;

    /// Column names `sql` would return, without executing it.
    async fn columns(&self, sql: &str) -> Result<Vec<String>>;

    async fn fetch_first(&self, sql: &str) -> Result<Option<Row>> {
        let mut result = self.query(sql).await?;
        result.rows.try_next().await
    }
}

/// Runs `sql` and hands its rows to `each`, in order.
///
/// `ctx` is checked before the query and before every row. A result without
/// `geom_field` among its columns fails with
/// [`Error::GeometryFieldMissing`], whether or not it has rows.
pub(crate) async fn stream_rows(
    backend: &dyn SqlBackend,
    ctx: &CancellationToken,
    layer: &str,
    geom_field: &str,
    sql: &str,
    each: &mut (dyn FnMut(Row) -> Result<()> + Send),
) -> Result<usize> {
    if ctx.is_cancelled() {
        return Err(Error::Canceled);
    }

    trace!(layer, %sql, "streaming rows");
    let result = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(Error::Canceled),
        result = backend.query(sql) => result?,
    };
    if !result.has_column(geom_field) {
        return Err(Error::GeometryFieldMissing {
            layer: layer.to_string(),
            field: geom_field.to_string(),
        });
    }

    let mut rows = result.rows;
    let mut count = 0;
    loop {
        let row = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Canceled),
            row = rows.try_next() => row?,
        };
        let Some(row) = row else { break };
        each(row)?;
        count += 1;
    }

    trace!(layer, count, "streamed rows");
    Ok(count)
}
