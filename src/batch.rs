//! Atomic pipelined batches.
//!
//! A batch runs its statements inside one transaction on a fresh session.
//! All statements are sent before the first reply is claimed, so the server
//! works through them back to back; results come back in input order.
use crate::{
    Result,
    protocol::StatementKind,
    session::Session,
    statement::affected_count,
    value::Value,
};

#[derive(Debug)]
struct BatchItem {
    kind: StatementKind,
    sql: String,
    params: Vec<Value>,
}

/// Builder for a pipelined batch.
///
/// # Example
///
/// ```no_run
/// use ppg::{Batch, Client};
///
/// # async fn app(client: Client) -> ppg::Result<()> {
/// let results = client.batch(
///     Batch::new()
///         .exec("INSERT INTO foo(id) VALUES($1)", [14.into()])
///         .query("SELECT * FROM foo", []),
/// ).await?;
///
/// assert_eq!(results.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
#[must_use = "a batch does nothing until passed to Client::batch"]
pub struct Batch {
    items: Vec<BatchItem>,
}

impl Batch {
    pub fn new() -> Batch {
        Batch { items: Vec::new() }
    }

    /// Append a row-returning statement; its rows are collected in full.
    pub fn query(mut self, sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Batch {
        self.items.push(BatchItem {
            kind: StatementKind::Query,
            sql: sql.into(),
            params: params.into_iter().collect(),
        });
        self
    }

    /// Append a command statement; its result is the affected-row count.
    pub fn exec(mut self, sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Batch {
        self.items.push(BatchItem {
            kind: StatementKind::Exec,
            sql: sql.into(),
            params: params.into_iter().collect(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One positional batch result.
#[derive(Debug)]
pub enum BatchResult {
    /// Rows of a query item.
    Rows(Vec<Vec<Value>>),
    /// Affected-row count of an exec item.
    Affected(u64),
}

/// Run the batch inside a transaction. Any failure rolls back and the
/// original error surfaces. An empty batch still begins and commits.
pub(crate) async fn run(session: &Session, batch: Batch) -> Result<Vec<BatchResult>> {
    session.exec("BEGIN").execute().await?;

    match pipeline(session, batch).await {
        Ok(results) => {
            session.exec("COMMIT").execute().await?;
            Ok(results)
        },
        Err(err) => {
            let _ = session.exec("ROLLBACK").execute().await;
            Err(err)
        },
    }
}

async fn pipeline(session: &Session, batch: Batch) -> Result<Vec<BatchResult>> {
    // send everything first, claim replies second
    let mut pending = Vec::with_capacity(batch.items.len());
    for item in batch.items {
        let reply = session.enqueue(item.kind, &item.sql, item.params).await?;
        pending.push((item.kind, reply));
    }

    let mut results = Vec::with_capacity(pending.len());
    for (kind, reply) in pending {
        let mut res = session.resolve(reply).await?;
        results.push(match kind {
            StatementKind::Query => BatchResult::Rows(res.rows.collect().await?),
            StatementKind::Exec => BatchResult::Affected(affected_count(&mut res).await?),
        });
    }
    Ok(results)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::test_helpers::{autorespond, connect_session};
    use crate::ws::socket::mock::MockHandle;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn results_in_input_order() {
        let (session, handle) = connect_session().await;
        let mut sql = autorespond(handle);

        let batch = Batch::new()
            .exec("INSERT INTO foo(id) VALUES($1)", [1.into()])
            .query("SELECT * FROM foo", [])
            .exec("DELETE FROM foo", []);
        assert_eq!(batch.len(), 3);

        let results = run(&session, batch).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], BatchResult::Affected(0)));
        assert!(matches!(&results[1], BatchResult::Rows(rows) if rows.len() == 1));
        assert!(matches!(results[2], BatchResult::Affected(0)));

        let mut statements = Vec::new();
        while let Ok(stmt) = sql.try_recv() {
            statements.push(stmt);
        }
        assert_eq!(statements, [
            "BEGIN",
            "INSERT INTO foo(id) VALUES($1)",
            "SELECT * FROM foo",
            "DELETE FROM foo",
            "COMMIT",
        ]);
    }

    #[tokio::test]
    async fn empty_batch_still_begins_and_commits() {
        let (session, handle) = connect_session().await;
        let mut sql = autorespond(handle);

        let results = run(&session, Batch::new()).await.unwrap();
        assert!(results.is_empty());

        assert_eq!(sql.recv().await.unwrap(), "BEGIN");
        assert_eq!(sql.recv().await.unwrap(), "COMMIT");
    }

    /// Respond like the autoresponder, but answer statements marked `FAIL`
    /// with an error frame.
    fn respond_with_failures(mut handle: MockHandle) -> UnboundedReceiver<String> {
        let (sql_tx, sql_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut expect_payload = false;
            while let Some(message) = handle.outbound.recv().await {
                let Message::Text(text) = message else { continue };
                if !expect_payload {
                    expect_payload = text.as_str() == crate::protocol::URN_DESCRIPTOR;
                    continue;
                }
                expect_payload = false;

                let descriptor: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                let sql = descriptor
                    .get("query")
                    .or(descriptor.get("exec"))
                    .and_then(|s|s.as_str())
                    .unwrap()
                    .to_owned();
                let failing = sql.contains("FAIL");
                let _ = sql_tx.send(sql);

                let frames: &[(&str, &str)] = if failing {
                    &[(
                        crate::protocol::URN_RESULT_ERROR,
                        r#"{"error":{"message":"boom","code":"XX000"}}"#,
                    )]
                } else {
                    &[
                        (crate::protocol::URN_RESULT_DESCRIPTION, r#"{"columns":[{"name":"rowsAffected","typeOid":20}]}"#),
                        (crate::protocol::URN_RESULT_DATAROW, r#"{"values":["0"]}"#),
                        (crate::protocol::URN_RESULT_COMPLETE, r#"{"complete":true}"#),
                    ]
                };
                for (urn, payload) in frames {
                    let _ = handle.inbound.send(Ok(Message::text(*urn)));
                    let _ = handle.inbound.send(Ok(Message::text(*payload)));
                }
            }
        });
        sql_rx
    }

    #[tokio::test]
    async fn failure_rolls_back_with_the_original_error() {
        let (session, handle) = connect_session().await;
        let mut sql = respond_with_failures(handle);

        let batch = Batch::new()
            .exec("INSERT INTO foo(id) VALUES(1)", [])
            .exec("FAIL", [])
            .exec("DELETE FROM foo", []);

        let err = run(&session, batch).await.unwrap_err();
        match err.kind() {
            crate::ErrorKind::Database(db) => assert_eq!(db.code(), "XX000"),
            other => panic!("unexpected {other:?}"),
        }

        let mut statements = Vec::new();
        while let Ok(stmt) = sql.try_recv() {
            statements.push(stmt);
        }
        assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    }
}
