//! Result columns and the lazy row stream.
//!
//! - [`Column`]
//! - [`QueryResult`]
//! - [`Rows`]
//! - [`DecodeError`]
use serde::Deserialize;
use std::{borrow::Cow, fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{Result, error::Error, types::TypeRegistry, value::Value};

/// Result column: name plus the type oid used to select a parser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "typeOid")]
    pub oid: u32,
}

/// One wire row, raw values in column order.
pub(crate) type RawRow = Vec<Option<String>>;

/// Row delivery for one running query.
pub(crate) enum RowEvent {
    Row(RawRow),
    End,
    Error(Error),
}

pub(crate) enum RowSource {
    Empty,
    Http(crate::http::HttpRows),
    Ws(UnboundedReceiver<RowEvent>),
}

/// Response of one statement: columns plus the lazy row stream.
pub struct QueryResult {
    columns: Arc<[Column]>,
    pub rows: Rows,
}

impl QueryResult {
    pub(crate) fn new(columns: Arc<[Column]>, rows: Rows) -> QueryResult {
        QueryResult { columns, rows }
    }

    pub(crate) fn empty(registry: Arc<TypeRegistry>) -> QueryResult {
        let columns: Arc<[Column]> = Vec::new().into();
        QueryResult {
            columns: columns.clone(),
            rows: Rows::new(RowSource::Empty, columns, registry),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("columns", &self.columns)
            .field("rows", &self.rows)
            .finish()
    }
}

/// Lazy stream of rows for one statement.
///
/// Rows may be taken one by one with [`next`][Rows::next], then the rest
/// drained with [`collect`][Rows::collect]. After the stream is drained both
/// return end of stream; a second `collect` returns an empty vec.
pub struct Rows {
    source: RowSource,
    columns: Arc<[Column]>,
    registry: Arc<TypeRegistry>,
    done: bool,
}

impl Rows {
    pub(crate) fn new(source: RowSource, columns: Arc<[Column]>, registry: Arc<TypeRegistry>) -> Rows {
        Rows { source, columns, registry, done: false }
    }

    /// Next row parsed through the registry, `None` at end of stream.
    pub async fn next(&mut self) -> Result<Option<Vec<Value>>> {
        match self.next_raw().await? {
            Some(raw) => Ok(Some(self.registry.parse_row(&self.columns, raw)?)),
            None => Ok(None),
        }
    }

    /// Next raw row, values as wire text.
    pub(crate) async fn next_raw(&mut self) -> Result<Option<RawRow>> {
        if self.done {
            return Ok(None);
        }

        let next = match &mut self.source {
            RowSource::Empty => Ok(None),
            RowSource::Http(rows) => rows.next().await,
            RowSource::Ws(recv) => match recv.recv().await {
                Some(RowEvent::Row(raw)) => Ok(Some(raw)),
                Some(RowEvent::Error(err)) => Err(err),
                Some(RowEvent::End) | None => Ok(None),
            },
        };

        match next {
            Ok(Some(raw)) => Ok(Some(raw)),
            Ok(None) => {
                self.done = true;
                Ok(None)
            },
            Err(err) => {
                self.done = true;
                Err(err)
            },
        }
    }

    /// Drain the remaining rows.
    pub async fn collect(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Mark the stream drained and release the transport side.
    ///
    /// The server keeps executing; remaining rows are discarded as they
    /// arrive.
    pub fn close(&mut self) {
        self.done = true;
        self.source = RowSource::Empty;
    }
}

impl fmt::Debug for Rows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows").field("done", &self.done).finish_non_exhaustive()
    }
}

/// An error when decoding a column value.
pub struct DecodeError {
    oid: u32,
    reason: Cow<'static, str>,
}

impl DecodeError {
    pub(crate) fn new(oid: u32, reason: impl Into<Cow<'static, str>>) -> DecodeError {
        DecodeError { oid, reason: reason.into() }
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to decode value of type {}: {}", self.oid, self.reason)
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Query expected a row but none returned.
pub struct RowNotFound;

impl std::error::Error for RowNotFound { }

impl fmt::Display for RowNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no rows returned")
    }
}

impl fmt::Debug for RowNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;

    fn channel_rows(columns: Vec<Column>) -> (mpsc::UnboundedSender<RowEvent>, Rows) {
        let (tx, rx) = mpsc::unbounded_channel();
        let columns: Arc<[Column]> = columns.into();
        let rows = Rows::new(RowSource::Ws(rx), columns, Arc::new(TypeRegistry::new()));
        (tx, rows)
    }

    fn row(values: &[&str]) -> RowEvent {
        RowEvent::Row(values.iter().map(|v|Some((*v).to_owned())).collect())
    }

    #[tokio::test]
    async fn iterate_then_collect() {
        let (tx, mut rows) = channel_rows(vec![Column { name: "c".into(), oid: 25 }]);
        tx.send(row(&["a"])).unwrap();
        tx.send(row(&["b"])).unwrap();
        tx.send(row(&["c"])).unwrap();
        tx.send(RowEvent::End).unwrap();

        let first = rows.next().await.unwrap().unwrap();
        assert_eq!(first, [Value::Text("a".into())]);

        let rest = rows.collect().await.unwrap();
        assert_eq!(rest.len(), 2);

        // drained: further reads return end of stream
        assert!(rows.next().await.unwrap().is_none());
        assert!(rows.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn collect_twice_is_empty() {
        let (tx, mut rows) = channel_rows(vec![]);
        tx.send(row(&["only"])).unwrap();
        tx.send(RowEvent::End).unwrap();

        assert_eq!(rows.collect().await.unwrap().len(), 1);
        assert!(rows.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_releases_stream() {
        let (tx, mut rows) = channel_rows(vec![]);
        tx.send(row(&["pending"])).unwrap();

        rows.close();
        assert!(rows.next().await.unwrap().is_none());
        // the receiver is gone, later sends fail
        assert!(tx.send(RowEvent::End).is_err());
    }

    #[tokio::test]
    async fn error_is_terminal() {
        let (tx, mut rows) = channel_rows(vec![]);
        tx.send(RowEvent::Error(crate::error::ProtocolError::new("boom").into())).unwrap();

        assert!(rows.next().await.is_err());
        assert!(rows.next().await.unwrap().is_none());
        assert!(rows.collect().await.unwrap().is_empty());
    }
}
