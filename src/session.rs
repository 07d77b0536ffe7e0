//! Interactive session over one WebSocket connection.
use std::sync::Arc;

use crate::{
    Result,
    config::Config,
    error::WsError,
    protocol::{self, StatementKind},
    row::{Column, QueryResult, RowSource, Rows},
    statement::Statement,
    transport::Transport,
    types::TypeRegistry,
    value::{ParamValue, Value},
    ws::{WsConnection, queue::ReplyReceiver},
};

/// Handle to a single WebSocket connection plus its parser and serializer
/// tables.
///
/// All statements of the session share the socket: frames of one statement
/// are contiguous on the wire, concurrent statements interleave at the
/// statement boundary and resolve in submission order.
pub struct Session {
    conn: WsConnection,
    registry: Arc<TypeRegistry>,
}

impl Session {
    pub(crate) async fn connect(config: &Config, registry: Arc<TypeRegistry>) -> Result<Session> {
        let conn = WsConnection::connect(config).await?;
        Ok(Session { conn, registry })
    }

    #[cfg(test)]
    pub(crate) async fn connect_mock(
        config: &Config,
        registry: Arc<TypeRegistry>,
    ) -> Result<(Session, crate::ws::socket::mock::MockHandle)> {
        let (conn, handle) = WsConnection::connect_mock(config).await?;
        Ok((Session { conn, registry }, handle))
    }

    /// Statement returning rows.
    pub fn query(&self, sql: impl Into<String>) -> Statement<'_, Session> {
        Statement::new(StatementKind::Query, sql, self)
    }

    /// Command statement, run it with [`execute`][Statement::execute].
    pub fn exec(&self, sql: impl Into<String>) -> Statement<'_, Session> {
        Statement::new(StatementKind::Exec, sql, self)
    }

    /// Whether the underlying socket is still open.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Close the socket with a normal closure code.
    ///
    /// Pending transactions on the session are rolled back by the server.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await
    }

    /// Encode and send one statement, leaving the reply pending. Used for
    /// pipelining: later statements may be sent before earlier replies are
    /// claimed.
    pub(crate) async fn enqueue(
        &self,
        kind: StatementKind,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ReplyReceiver> {
        let params = params
            .into_iter()
            .map(|value|self.registry.serialize(value))
            .collect();
        let frames = protocol::encode_statement(kind, sql, params).await?;
        self.conn.pipeline(frames).await
    }

    /// Claim a pending reply.
    pub(crate) async fn resolve(&self, pending: ReplyReceiver) -> Result<QueryResult> {
        let reply = pending
            .await
            .map_err(|_|WsError::closed(None, None))??;

        let columns: Arc<[Column]> = reply.columns.into();
        Ok(QueryResult::new(
            columns.clone(),
            Rows::new(RowSource::Ws(reply.rows), columns, self.registry.clone()),
        ))
    }
}

impl Transport for Session {
    async fn statement(
        &self,
        kind: StatementKind,
        sql: &str,
        params: Vec<ParamValue>,
    ) -> Result<QueryResult> {
        let frames = protocol::encode_statement(kind, sql, params).await?;
        let pending = self.conn.pipeline(frames).await?;
        self.resolve(pending).await
    }

    fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }
}


#[cfg(test)]
mod test {
    use super::test_helpers::{autorespond, connect_session};

    #[tokio::test]
    async fn exec_on_session() {
        let (session, handle) = connect_session().await;
        let mut sql = autorespond(handle);

        let affected = session.exec("DELETE FROM t").execute().await.unwrap();
        assert_eq!(affected, 0);
        assert_eq!(sql.recv().await.unwrap(), "DELETE FROM t");
    }

    #[tokio::test]
    async fn serializer_applies_to_bound_values() {
        let (session, handle) = connect_session().await;
        let mut sql = autorespond(handle);

        session.exec("DELETE FROM t WHERE id=$1").bind(7).execute().await.unwrap();
        assert_eq!(sql.recv().await.unwrap(), "DELETE FROM t WHERE id=$1");
    }
}
