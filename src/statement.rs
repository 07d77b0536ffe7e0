//! The statement builder API.
use crate::{
    Result,
    encode::Encode,
    error::ProtocolError,
    protocol::StatementKind,
    row::{QueryResult, RowNotFound},
    transport::Transport,
    value::Value,
};

/// One statement under construction.
///
/// Bind parameters with [`bind`][Statement::bind], then run it with one of
/// the fetch methods or [`execute`][Statement::execute].
#[derive(Debug)]
#[must_use = "statements do nothing unless awaited via fetch or execute"]
pub struct Statement<'e, E> {
    kind: StatementKind,
    sql: String,
    params: Vec<Value>,
    exe: &'e E,
}

impl<'e, E> Statement<'e, E>
where
    E: Transport,
{
    pub(crate) fn new(kind: StatementKind, sql: impl Into<String>, exe: &'e E) -> Self {
        Statement { kind, sql: sql.into(), params: Vec::new(), exe }
    }

    /// Bind a statement parameter.
    pub fn bind<V: Encode>(mut self, value: V) -> Self {
        self.params.push(value.encode());
        self
    }

    async fn run(self) -> Result<QueryResult> {
        let registry = self.exe.registry();
        let params = self
            .params
            .into_iter()
            .map(|value|registry.serialize(value))
            .collect();
        self.exe.statement(self.kind, &self.sql, params).await
    }

    /// Send the statement and return columns plus the lazy row stream.
    pub async fn fetch(self) -> Result<QueryResult> {
        self.run().await
    }

    /// Fetch all rows.
    pub async fn fetch_all(self) -> Result<Vec<Vec<Value>>> {
        self.run().await?.rows.collect().await
    }

    /// Fetch exactly one row.
    pub async fn fetch_one(self) -> Result<Vec<Value>> {
        match self.fetch_optional().await? {
            Some(row) => Ok(row),
            None => Err(RowNotFound.into()),
        }
    }

    /// Optionally fetch one row, draining the rest.
    pub async fn fetch_optional(self) -> Result<Option<Vec<Value>>> {
        let mut res = self.run().await?;
        let row = res.rows.next().await?;
        res.rows.close();
        Ok(row)
    }

    /// Run as a command and return the number of rows affected.
    pub async fn execute(mut self) -> Result<u64> {
        self.kind = StatementKind::Exec;
        let mut res = self.run().await?;
        affected_count(&mut res).await
    }
}

/// Decode the affected-count row of an exec response: exactly one row whose
/// single value is the decimal count.
pub(crate) async fn affected_count(res: &mut QueryResult) -> Result<u64> {
    let Some(row) = res.rows.next_raw().await? else {
        return Err(ProtocolError::new("exec response is missing its count row").into());
    };

    let count = match row.as_slice() {
        [Some(value)] => value
            .parse()
            .map_err(|_|ProtocolError::new("exec count is not a nonnegative integer"))?,
        _ => return Err(ProtocolError::new("exec count row has the wrong shape").into()),
    };

    res.rows.close();
    Ok(count)
}
