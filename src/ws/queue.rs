//! Query queue and per-query delivery state.
//!
//! Responses on one connection are strictly FIFO: every inbound frame
//! applies to the query at the head of the queue. A query is popped exactly
//! once, on complete or error.
use std::collections::VecDeque;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    Result,
    error::{Error, ProtocolError},
    protocol::ResponseFrame,
    row::{Column, RowEvent},
};

/// Reply for one statement, sent once its columns are known.
#[derive(Debug)]
pub(crate) struct StatementReply {
    pub columns: Vec<Column>,
    pub rows: UnboundedReceiver<RowEvent>,
}

pub(crate) type ReplyReceiver = oneshot::Receiver<Result<StatementReply>>;

struct RunningQuery {
    id: u64,
    respond: Option<oneshot::Sender<Result<StatementReply>>>,
    rows_tx: UnboundedSender<RowEvent>,
    /// Held until the reply resolves; rows buffered before that stay queued
    /// inside the channel.
    rows_rx: Option<UnboundedReceiver<RowEvent>>,
}

impl RunningQuery {
    fn fail(mut self, err: Error) {
        match self.respond.take() {
            Some(respond) => {
                let _ = respond.send(Err(err));
            },
            None => {
                let _ = self.rows_tx.send(RowEvent::Error(err));
            },
        }
    }
}

pub(crate) struct QueryQueue {
    queue: VecDeque<RunningQuery>,
    next_id: u64,
}

impl QueryQueue {
    pub fn new() -> QueryQueue {
        QueryQueue { queue: VecDeque::new(), next_id: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append a pending query.
    pub fn push(&mut self) -> (u64, ReplyReceiver) {
        let (respond, reply) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(RunningQuery {
            id,
            respond: Some(respond),
            rows_tx,
            rows_rx: Some(rows_rx),
        });
        (id, reply)
    }

    /// Abort one queued query after its frames failed to send.
    pub fn abort(&mut self, id: u64, err: Error) {
        if let Some(idx) = self.queue.iter().position(|q|q.id == id) {
            if let Some(query) = self.queue.remove(idx) {
                query.fail(err);
            }
        }
    }

    /// Abort every queued query, used on socket failure and protocol
    /// violations.
    pub fn abort_all(&mut self, mut err: impl FnMut() -> Error) {
        for query in self.queue.drain(..) {
            query.fail(err());
        }
    }

    /// Apply one inbound frame to the head query.
    ///
    /// An `Err` is a protocol violation and fatal for the connection.
    pub fn dispatch(&mut self, frame: ResponseFrame) -> Result<(), ProtocolError> {
        match frame {
            ResponseFrame::RowDescription { columns } => {
                let Some(head) = self.queue.front_mut() else {
                    return Err(no_query());
                };
                match (head.respond.take(), head.rows_rx.take()) {
                    (Some(respond), Some(rows)) => {
                        let _ = respond.send(Ok(StatementReply { columns, rows }));
                    },
                    _ => return Err(ProtocolError::new("second row description for one query")),
                }
            },
            ResponseFrame::DataRow { values } => {
                let Some(head) = self.queue.front_mut() else {
                    return Err(no_query());
                };
                // a closed receiver means the consumer cancelled; rows are
                // discarded as they arrive
                let _ = head.rows_tx.send(RowEvent::Row(values));
            },
            ResponseFrame::Complete => {
                let Some(mut head) = self.queue.pop_front() else {
                    return Err(no_query());
                };
                let _ = head.rows_tx.send(RowEvent::End);
                // no description seen: resolve with an empty column set
                if let (Some(respond), Some(rows)) = (head.respond.take(), head.rows_rx.take()) {
                    let _ = respond.send(Ok(StatementReply { columns: Vec::new(), rows }));
                }
            },
            ResponseFrame::Error(err) => {
                let Some(head) = self.queue.pop_front() else {
                    return Err(no_query());
                };
                head.fail(err.into());
            },
        }
        Ok(())
    }
}

fn no_query() -> ProtocolError {
    ProtocolError::new("response frame with no query in flight")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::DatabaseError;

    fn description(names: &[&str]) -> ResponseFrame {
        let columns = names
            .iter()
            .map(|n|Column { name: (*n).to_owned(), oid: 25 })
            .collect();
        ResponseFrame::RowDescription { columns }
    }

    fn datarow(value: &str) -> ResponseFrame {
        ResponseFrame::DataRow { values: vec![Some(value.to_owned())] }
    }

    fn db_error(code: &str) -> ResponseFrame {
        let fields = serde_json::json!({ "message": "boom", "code": code });
        ResponseFrame::Error(DatabaseError::from_fields(fields.as_object().unwrap()).unwrap())
    }

    #[tokio::test]
    async fn fifo_dispatch() {
        let mut queue = QueryQueue::new();
        let (_, first) = queue.push();
        let (_, second) = queue.push();

        queue.dispatch(description(&["a"])).unwrap();
        queue.dispatch(datarow("1")).unwrap();
        queue.dispatch(ResponseFrame::Complete).unwrap();

        queue.dispatch(description(&["b"])).unwrap();
        queue.dispatch(datarow("2")).unwrap();
        queue.dispatch(ResponseFrame::Complete).unwrap();

        let mut reply = first.await.unwrap().unwrap();
        assert_eq!(reply.columns[0].name, "a");
        assert!(matches!(reply.rows.recv().await, Some(RowEvent::Row(r)) if r == [Some("1".into())]));
        assert!(matches!(reply.rows.recv().await, Some(RowEvent::End)));

        let reply = second.await.unwrap().unwrap();
        assert_eq!(reply.columns[0].name, "b");
    }

    #[tokio::test]
    async fn complete_without_description() {
        let mut queue = QueryQueue::new();
        let (_, reply) = queue.push();

        queue.dispatch(ResponseFrame::Complete).unwrap();
        assert!(queue.is_empty());

        let mut reply = reply.await.unwrap().unwrap();
        assert!(reply.columns.is_empty());
        assert!(matches!(reply.rows.recv().await, Some(RowEvent::End)));
    }

    #[tokio::test]
    async fn rows_buffer_ahead_of_the_consumer() {
        let mut queue = QueryQueue::new();
        let (_, reply) = queue.push();

        queue.dispatch(description(&["c"])).unwrap();
        for i in 0..100 {
            queue.dispatch(datarow(&i.to_string())).unwrap();
        }
        queue.dispatch(ResponseFrame::Complete).unwrap();

        let mut reply = reply.await.unwrap().unwrap();
        let mut seen = 0;
        while let Some(RowEvent::Row(_)) = reply.rows.recv().await {
            seen += 1;
        }
        assert_eq!(seen, 100);
    }

    #[tokio::test]
    async fn error_rejects_only_the_head() {
        let mut queue = QueryQueue::new();
        let (_, first) = queue.push();
        let (_, second) = queue.push();

        queue.dispatch(db_error("42P01")).unwrap();
        assert!(first.await.unwrap().is_err());
        assert!(!queue.is_empty());

        queue.dispatch(ResponseFrame::Complete).unwrap();
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn error_after_description_surfaces_in_rows() {
        let mut queue = QueryQueue::new();
        let (_, reply) = queue.push();

        queue.dispatch(description(&["c"])).unwrap();
        queue.dispatch(db_error("XX000")).unwrap();

        let mut reply = reply.await.unwrap().unwrap();
        assert!(matches!(reply.rows.recv().await, Some(RowEvent::Error(_))));
    }

    #[tokio::test]
    async fn abort_all_rejects_everything() {
        let mut queue = QueryQueue::new();
        let (_, first) = queue.push();
        let (_, second) = queue.push();
        queue.dispatch(description(&["c"])).unwrap();

        queue.abort_all(||ProtocolError::new("gone").into());
        assert!(queue.is_empty());

        let mut first = first.await.unwrap().unwrap();
        assert!(matches!(first.rows.recv().await, Some(RowEvent::Error(_))));
        assert!(second.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn abort_removes_one_query() {
        let mut queue = QueryQueue::new();
        let (_, first) = queue.push();
        let (id, second) = queue.push();

        queue.abort(id, ProtocolError::new("send failed").into());
        assert!(second.await.unwrap().is_err());

        // the first query is untouched and still head
        queue.dispatch(ResponseFrame::Complete).unwrap();
        assert!(first.await.unwrap().is_ok());
    }

    #[test]
    fn frame_with_no_query_is_a_violation() {
        let mut queue = QueryQueue::new();
        assert!(queue.dispatch(datarow("1")).is_err());
    }

    #[test]
    fn double_description_is_a_violation() {
        let mut queue = QueryQueue::new();
        let (_, _reply) = queue.push();
        queue.dispatch(description(&["a"])).unwrap();
        assert!(queue.dispatch(description(&["b"])).is_err());
    }
}
