//! Client entry points.
use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    Result,
    batch::{self, Batch, BatchResult},
    config::Config,
    http::HttpTransport,
    protocol::StatementKind,
    row::QueryResult,
    session::Session,
    statement::Statement,
    transaction::{self, Transaction},
    transport::Transport,
    types::TypeRegistry,
    value::ParamValue,
};

/// Client for one database.
///
/// Statements on the client run over HTTP, one request each. For pipelined
/// statements on a shared connection open a [`Session`]; for transactions
/// use [`begin`][Client::begin] or [`transaction`][Client::transaction].
#[derive(Debug)]
pub struct Client {
    config: Config,
    http: HttpTransport,
    registry: Arc<TypeRegistry>,
}

impl Client {
    /// Client from a connection string.
    pub fn new(url: &str) -> Result<Client> {
        Self::with_config(Config::parse(url)?)
    }

    pub fn with_config(config: Config) -> Result<Client> {
        Self::with_registry(config, TypeRegistry::new())
    }

    /// Client with customized parser and serializer tables.
    pub fn with_registry(config: Config, registry: TypeRegistry) -> Result<Client> {
        let registry = Arc::new(registry);
        let http = HttpTransport::new(&config, registry.clone())?;
        Ok(Client { config, http, registry })
    }

    /// Client from `DATABASE_URL` and the `PG*` environment variables.
    pub fn from_env() -> Result<Client> {
        Self::with_config(Config::from_env()?)
    }

    /// Statement returning rows.
    pub fn query(&self, sql: impl Into<String>) -> Statement<'_, Client> {
        Statement::new(StatementKind::Query, sql, self)
    }

    /// Command statement, run it with [`execute`][Statement::execute].
    pub fn exec(&self, sql: impl Into<String>) -> Statement<'_, Client> {
        Statement::new(StatementKind::Exec, sql, self)
    }

    /// Open a WebSocket session sharing this client's type tables.
    pub async fn session(&self) -> Result<Session> {
        Session::connect(&self.config, self.registry.clone()).await
    }

    /// Begin a transaction on a fresh session.
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.session().await?).await
    }

    /// Run `f` inside a transaction: commit on success, roll back on error
    /// and rethrow. The session is released on every exit path.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn app(client: ppg::Client) -> ppg::Result<()> {
    /// let inserted = client.transaction(|tx|Box::pin(async move {
    ///     tx.exec("INSERT INTO foo(id) VALUES($1)").bind(14).execute().await
    /// })).await?;
    ///
    /// assert_eq!(inserted, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t Transaction) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>,
    {
        transaction::run(self.begin().await?, f).await
    }

    /// Run a batch inside a transaction on a fresh session. Results come
    /// back in input order; any failure rolls the whole batch back.
    pub async fn batch(&self, batch: Batch) -> Result<Vec<BatchResult>> {
        let session = self.session().await?;
        let result = batch::run(&session, batch).await;
        let close = session.close().await;
        match result {
            Ok(results) => {
                close?;
                Ok(results)
            },
            Err(err) => Err(err),
        }
    }
}

impl Transport for Client {
    async fn statement(
        &self,
        kind: StatementKind,
        sql: &str,
        params: Vec<ParamValue>,
    ) -> Result<QueryResult> {
        self.http.statement(kind, sql, params).await
    }

    fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }
}
