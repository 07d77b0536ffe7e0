//! Interactive transactions.
use std::{future::Future, pin::Pin};

use crate::{
    Result,
    protocol::StatementKind,
    row::QueryResult,
    session::Session,
    statement::Statement,
    transport::Transport,
    types::TypeRegistry,
    value::ParamValue,
};

/// An RAII transaction scope over a dedicated session.
///
/// To commit, use [`Transaction::commit`]. If not committed, when this
/// structure is dropped a rollback is queued on the runtime and the session
/// is closed, best effort; outside a runtime the socket is dropped and the
/// server rolls the transaction back on disconnect.
///
/// # Example
///
/// ```no_run
/// # async fn test(client: ppg::Client) -> ppg::Result<()> {
/// let tx = client.begin().await?;
///
/// tx.exec("insert into post(name) values($1)")
///     .bind("foo")
///     .execute()
///     .await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction {
    session: Option<Session>,
}

impl Transaction {
    pub(crate) async fn begin(session: Session) -> Result<Transaction> {
        session.exec("BEGIN").execute().await?;
        Ok(Transaction { session: Some(session) })
    }

    fn session(&self) -> &Session {
        self.session.as_ref().expect("transaction already finished")
    }

    /// Statement returning rows, inside the transaction.
    pub fn query(&self, sql: impl Into<String>) -> Statement<'_, Transaction> {
        Statement::new(StatementKind::Query, sql, self)
    }

    /// Command statement, inside the transaction.
    pub fn exec(&self, sql: impl Into<String>) -> Statement<'_, Transaction> {
        Statement::new(StatementKind::Exec, sql, self)
    }

    /// Commit the transaction and release the session.
    pub async fn commit(mut self) -> Result<()> {
        let session = self.session.take().expect("transaction already finished");
        let commit = session.exec("COMMIT").execute().await;
        let close = session.close().await;
        commit?;
        close
    }

    /// Roll the transaction back and release the session.
    pub async fn rollback(mut self) -> Result<()> {
        let session = self.session.take().expect("transaction already finished");
        let rollback = session.exec("ROLLBACK").execute().await;
        let close = session.close().await;
        rollback?;
        close
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else { return };

        // drop must not block; outside a runtime the socket drop is the
        // rollback signal
        let Ok(handle) = tokio::runtime::Handle::try_current() else { return };
        handle.spawn(async move {
            let _ = session.exec("ROLLBACK").execute().await;
            let _ = session.close().await;
        });
    }
}

impl Transport for Transaction {
    fn statement(
        &self,
        kind: StatementKind,
        sql: &str,
        params: Vec<ParamValue>,
    ) -> impl Future<Output = Result<QueryResult>> + Send {
        self.session().statement(kind, sql, params)
    }

    fn registry(&self) -> &std::sync::Arc<TypeRegistry> {
        self.session().registry()
    }
}

/// Run user code inside `tx`: commit on success, roll back on error and
/// rethrow. The session is released on every exit path.
pub(crate) async fn run<T, F>(tx: Transaction, f: F) -> Result<T>
where
    F: for<'t> FnOnce(&'t Transaction) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>,
{
    match f(&tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        },
        Err(err) => {
            // best effort rollback, the original error wins
            let _ = tx.rollback().await;
            Err(err)
        },
    }
}
