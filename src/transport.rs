//! The [`Transport`] trait.
use std::sync::Arc;

use crate::{
    Result,
    protocol::StatementKind,
    row::QueryResult,
    types::TypeRegistry,
    value::ParamValue,
};

/// A transport which can run one framed statement.
///
/// Implemented by [`Client`][crate::Client] (one HTTP request per
/// statement), [`Session`][crate::Session] (pipelined on a shared
/// WebSocket) and [`Transaction`][crate::Transaction] (delegating to its
/// session).
pub trait Transport {
    /// Run one statement. Resolves once the result columns are known; rows
    /// stream afterwards.
    fn statement(
        &self,
        kind: StatementKind,
        sql: &str,
        params: Vec<ParamValue>,
    ) -> impl Future<Output = Result<QueryResult>> + Send;

    /// Parser and serializer tables in effect for this transport.
    fn registry(&self) -> &Arc<TypeRegistry>;
}

impl<T> Transport for &T
where
    T: Transport + Sync,
{
    fn statement(
        &self,
        kind: StatementKind,
        sql: &str,
        params: Vec<ParamValue>,
    ) -> impl Future<Output = Result<QueryResult>> + Send {
        T::statement(self, kind, sql, params)
    }

    fn registry(&self) -> &Arc<TypeRegistry> {
        T::registry(self)
    }
}
