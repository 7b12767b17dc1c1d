use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::{ResultSet, Row, SqlBackend, Value};
use crate::{Error, Result};

type Handler = Box<dyn Fn(&str) -> Result<Vec<Row>> + Send + Sync>;

/// A scripted backend: every query is recorded and answered by a closure.
pub(crate) struct MockBackend {
    handler: Handler,
    columns: Vec<String>,
    queries: Mutex<Vec<String>>,
    open_cursors: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(handler: impl Fn(&str) -> Result<Vec<Row>> + Send + Sync + 'static) -> Self {
        MockBackend {
            handler: Box::new(handler),
            columns: Vec::new(),
            queries: Mutex::new(Vec::new()),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answers every query with the same rows.
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self::new(move |_| Ok(rows.clone()))
    }

    /// Columns reported when a statement is prepared, and for results
    /// without rows.
    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Number of result streams handed out and not yet dropped.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }
}

struct CursorGuard(Arc<AtomicUsize>);

impl CursorGuard {
    fn open(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        CursorGuard(counter.clone())
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SqlBackend for MockBackend {
    async fn query<'a>(&'a self, sql: &'a str) -> Result<ResultSet<'a>> {
        self.queries.lock().unwrap().push(sql.to_string());
        let rows = (self.handler)(sql)?;
        let columns: Arc<[String]> = match rows.first() {
            Some(first) => first.columns().iter().cloned().collect(),
            None => self.columns.iter().cloned().collect(),
        };

        let guard = CursorGuard::open(&self.open_cursors);
        let rows = stream::iter(rows)
            .map(move |row| {
                let _cursor = &guard;
                Ok(row)
            })
            .boxed();
        Ok(ResultSet::new(columns, rows))
    }

    async fn columns(&self, sql: &str) -> Result<Vec<String>> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self.columns.clone())
    }
}

/// Builds a row from column names and values.
pub(crate) fn row(columns: &[&str], values: Vec<Value>) -> Row {
    let columns: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect();
    Row::new(columns, values)
}

pub(crate) fn text_row(column: &str, value: &str) -> Row {
    row(&[column], vec![Value::Text(value.to_string())])
}

pub(crate) fn database_error(message: &str) -> Error {
    Error::Database(sqlx::Error::Protocol(message.to_string()))
}
