//! HTTP transport.
//!
//! One statement is one `POST {endpoint}/db/query_v2` request: the frames
//! stream out as multipart form data, the response streams back as newline
//! delimited json result frames.
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use std::{
    io,
    pin::Pin,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    Result,
    common::verbose,
    config::Config,
    error::{Error, HttpError, ProtocolError},
    protocol::{self, Frame, ParamPayload, ResponseFrame, StatementKind},
    row::{Column, QueryResult, RawRow, RowSource, Rows},
    types::TypeRegistry,
    value::PgFormat,
};

/// Stateless transport: every statement is an independent request.
#[derive(Debug)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    url: String,
    user: String,
    pass: String,
    dbname: Option<String>,
    registry: Arc<TypeRegistry>,
}

impl HttpTransport {
    pub fn new(config: &Config, registry: Arc<TypeRegistry>) -> Result<HttpTransport> {
        let mut builder = reqwest::Client::builder();
        if config.keepalive {
            builder = builder.tcp_keepalive(Some(Duration::from_secs(60)));
        }

        Ok(HttpTransport {
            client: builder.build()?,
            url: format!("{}/db/query_v2", config.http_endpoint()),
            user: config.user.clone(),
            pass: config.pass.clone(),
            dbname: config.dbname.clone(),
            registry,
        })
    }

    pub async fn statement(
        &self,
        kind: StatementKind,
        sql: &str,
        params: Vec<crate::value::ParamValue>,
    ) -> Result<QueryResult> {
        let frames = protocol::encode_statement(kind, sql, params).await?;

        let boundary = boundary();
        let content_type = format!(
            "multipart/form-data; profile=\"{}\"; boundary={boundary}",
            protocol::URN_QUERY,
        );

        let mut request = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(multipart_body(&boundary, frames)));

        if let Some(db) = &self.dbname {
            request = request.query(&[("db", db)]);
        }

        let response = request.send().await?;
        let status = response.status();
        verbose!("statement response status: {status}");

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HttpError::new(status.as_u16(), message).into());
        }

        let body = response.bytes_stream().map(|chunk|chunk.map_err(Error::from));
        prime(NdjsonFrames::new(body), self.registry.clone()).await
    }
}

/// Multipart boundary, guaranteed absent from the json and opaque payloads.
fn boundary() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("----PPG{timestamp}{}", uuid::Uuid::new_v4().simple())
}

enum Segment {
    Bytes(Bytes),
    Stream(crate::value::ByteStream),
}

fn part_header(boundary: &str, name: &str, content_type: &str) -> Bytes {
    Bytes::from(format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{name}\"\r\n\
         Content-Type: {content_type}\r\n\r\n",
    ))
}

/// Assemble the streaming request body, parts in frame order. Stream
/// parameters are forwarded chunk by chunk.
fn multipart_body(
    boundary: &str,
    frames: Vec<Frame>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let mut segments = Vec::with_capacity(frames.len() * 3 + 1);

    for frame in frames {
        let urn = frame.urn();
        match frame {
            Frame::Descriptor(json) => {
                let content_type = format!("application/json; profile=\"{urn}\"");
                segments.push(Segment::Bytes(part_header(boundary, urn, &content_type)));
                segments.push(Segment::Bytes(Bytes::from(json)));
            },
            Frame::Param { format, payload } => {
                let content_type = match format {
                    PgFormat::Text => format!("text/plain; charset=utf-8; profile=\"{urn}\""),
                    PgFormat::Binary => format!("application/octet-stream; profile=\"{urn}\""),
                };
                segments.push(Segment::Bytes(part_header(boundary, urn, &content_type)));
                match payload {
                    ParamPayload::Bytes(data) => segments.push(Segment::Bytes(data)),
                    ParamPayload::Stream(stream) => segments.push(Segment::Stream(stream)),
                }
            },
        }
        segments.push(Segment::Bytes(Bytes::from_static(b"\r\n")));
    }

    segments.push(Segment::Bytes(Bytes::from(format!("--{boundary}--\r\n"))));

    futures_util::stream::iter(segments).flat_map(|segment|match segment {
        Segment::Bytes(bytes) => futures_util::stream::once(std::future::ready(Ok(bytes))).boxed(),
        Segment::Stream(stream) => stream.into_inner(),
    })
}

// ===== Response =====

/// Newline delimited json reader over the response body.
///
/// Lines are split on `\n`, blank lines skipped, and each json object
/// dispatched by shape. Unrecognized shapes are skipped for forward
/// compatibility.
struct NdjsonFrames {
    body: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>,
    buf: BytesMut,
    eof: bool,
}

impl NdjsonFrames {
    fn new(body: impl Stream<Item = Result<Bytes>> + Send + 'static) -> NdjsonFrames {
        NdjsonFrames { body: Box::pin(body), buf: BytesMut::new(), eof: false }
    }

    /// Next recognized frame, `None` at end of body.
    async fn next(&mut self) -> Result<Option<ResponseFrame>> {
        loop {
            let line = match self.buf.iter().position(|b|*b == b'\n') {
                Some(idx) => {
                    let mut line = self.buf.split_to(idx + 1);
                    line.truncate(idx);
                    Some(line)
                },
                None if self.eof && !self.buf.is_empty() => Some(self.buf.split()),
                None if self.eof => return Ok(None),
                None => None,
            };

            match line {
                Some(line) if line.iter().all(u8::is_ascii_whitespace) => continue,
                Some(line) => {
                    let value = serde_json::from_slice(&line)
                        .map_err(|_|ProtocolError::new("response line is not valid json"))?;
                    match ResponseFrame::decode(value) {
                        Some(frame) => return Ok(Some(frame)),
                        None => continue,
                    }
                },
                None => match self.body.next().await {
                    Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                    Some(Err(err)) => return Err(err),
                    None => self.eof = true,
                },
            }
        }
    }
}

/// Row stream of one statement, after the response has been primed.
pub(crate) struct HttpRows {
    frames: NdjsonFrames,
    /// Row observed while priming, replayed before the live frames.
    pending: Option<RawRow>,
}

impl HttpRows {
    pub async fn next(&mut self) -> Result<Option<RawRow>> {
        if let Some(row) = self.pending.take() {
            return Ok(Some(row));
        }

        loop {
            match self.frames.next().await? {
                Some(ResponseFrame::DataRow { values }) => return Ok(Some(values)),
                Some(ResponseFrame::Complete) => return Ok(None),
                Some(ResponseFrame::Error(err)) => return Err(err.into()),
                // a repeated description carries nothing new
                Some(ResponseFrame::RowDescription { .. }) => continue,
                None => return Err(ProtocolError::new("response ended without a terminal frame").into()),
            }
        }
    }
}

/// Drive the response until the columns are known, so the statement result
/// can expose them before any row is read.
async fn prime(mut frames: NdjsonFrames, registry: Arc<TypeRegistry>) -> Result<QueryResult> {
    match frames.next().await? {
        Some(ResponseFrame::RowDescription { columns }) => {
            let columns: Arc<[Column]> = columns.into();
            let rows = HttpRows { frames, pending: None };
            Ok(QueryResult::new(
                columns.clone(),
                Rows::new(RowSource::Http(rows), columns, registry),
            ))
        },
        // a row before any description streams under an empty column set
        Some(ResponseFrame::DataRow { values }) => {
            let columns: Arc<[Column]> = Vec::new().into();
            let rows = HttpRows { frames, pending: Some(values) };
            Ok(QueryResult::new(
                columns.clone(),
                Rows::new(RowSource::Http(rows), columns, registry),
            ))
        },
        Some(ResponseFrame::Complete) => Ok(QueryResult::empty(registry)),
        Some(ResponseFrame::Error(err)) => Err(err.into()),
        None => Err(ProtocolError::new("empty response body").into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::{ByteStream, Value};

    fn body_of(lines: &[&str]) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        let chunks: Vec<Result<Bytes>> = lines
            .iter()
            .map(|l|Ok(Bytes::from(format!("{l}\n"))))
            .collect();
        futures_util::stream::iter(chunks)
    }

    async fn collect_body(stream: impl Stream<Item = io::Result<Bytes>> + Send) -> Vec<u8> {
        let mut body = Box::pin(stream);
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[test]
    fn boundary_shape() {
        let a = boundary();
        let b = boundary();
        assert!(a.starts_with("----PPG"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn multipart_parts_in_frame_order() {
        let frames = vec![
            Frame::Descriptor(r#"{"query":"SELECT $1,$2"}"#.into()),
            Frame::Param {
                format: PgFormat::Text,
                payload: ParamPayload::Stream(ByteStream::from_bytes("streamed text")),
            },
            Frame::Param {
                format: PgFormat::Binary,
                payload: ParamPayload::Bytes(Bytes::from_static(&[1, 2, 3])),
            },
        ];

        let body = collect_body(multipart_body("----PPGtest", frames)).await;
        let body = String::from_utf8_lossy(&body);

        let descriptor = body.find("name=\"urn:prisma:query:descriptor\"").unwrap();
        let text = body.find("name=\"urn:prisma:query:param:text\"").unwrap();
        let binary = body.find("name=\"urn:prisma:query:param:binary\"").unwrap();
        assert!(descriptor < text && text < binary);

        assert!(body.contains("Content-Type: application/json; profile=\"urn:prisma:query:descriptor\""));
        assert!(body.contains("Content-Type: text/plain; charset=utf-8; profile=\"urn:prisma:query:param:text\""));
        assert!(body.contains("Content-Type: application/octet-stream; profile=\"urn:prisma:query:param:binary\""));
        assert!(body.contains("streamed text"));
        assert!(body.ends_with("------PPGtest--\r\n"));
    }

    #[tokio::test]
    async fn ndjson_skips_blank_and_unknown_lines() {
        let mut frames = NdjsonFrames::new(body_of(&[
            "",
            "   ",
            r#"{"ready":true}"#,
            r#"{"values":["a"]}"#,
            r#"{"complete":true}"#,
        ]));

        assert!(matches!(frames.next().await.unwrap(), Some(ResponseFrame::DataRow { .. })));
        assert!(matches!(frames.next().await.unwrap(), Some(ResponseFrame::Complete)));
        assert!(frames.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ndjson_line_split_across_chunks() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"values\":[\"he")),
            Ok(Bytes::from_static(b"llo\"]}\n{\"complete\"")),
            Ok(Bytes::from_static(b":true}\n")),
        ];
        let mut frames = NdjsonFrames::new(futures_util::stream::iter(chunks));

        match frames.next().await.unwrap().unwrap() {
            ResponseFrame::DataRow { values } => assert_eq!(values, [Some("hello".to_owned())]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(frames.next().await.unwrap(), Some(ResponseFrame::Complete)));
    }

    #[tokio::test]
    async fn ndjson_final_line_without_newline() {
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"{\"complete\":true}"))];
        let mut frames = NdjsonFrames::new(futures_util::stream::iter(chunks));
        assert!(matches!(frames.next().await.unwrap(), Some(ResponseFrame::Complete)));
        assert!(frames.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ndjson_invalid_json_is_fatal() {
        let mut frames = NdjsonFrames::new(body_of(&["{nope"]));
        assert!(frames.next().await.is_err());
    }

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::new())
    }

    #[tokio::test]
    async fn primed_statement_response() {
        let frames = NdjsonFrames::new(body_of(&[
            r#"{"columns":[{"name":"c","typeOid":25}]}"#,
            r#"{"values":["hello"]}"#,
            r#"{"complete":true}"#,
        ]));
        let mut res = prime(frames, registry()).await.unwrap();

        assert_eq!(res.columns(), [Column { name: "c".into(), oid: 25 }]);
        let rows = res.rows.collect().await.unwrap();
        assert_eq!(rows, [vec![Value::Text("hello".into())]]);
        assert!(res.rows.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn row_before_description() {
        let frames = NdjsonFrames::new(body_of(&[
            r#"{"values":["early"]}"#,
            r#"{"values":["late"]}"#,
            r#"{"complete":true}"#,
        ]));
        let mut res = prime(frames, registry()).await.unwrap();

        assert!(res.columns().is_empty());
        let rows = res.rows.collect().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], [Value::Text("early".into())]);
    }

    #[tokio::test]
    async fn complete_without_rows() {
        let frames = NdjsonFrames::new(body_of(&[r#"{"complete":true}"#]));
        let mut res = prime(frames, registry()).await.unwrap();
        assert!(res.columns().is_empty());
        assert!(res.rows.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_before_description_fails_the_statement() {
        let frames = NdjsonFrames::new(body_of(&[
            r#"{"error":{"message":"syntax error","code":"42601"}}"#,
        ]));
        let err = prime(frames, registry()).await.unwrap_err();
        match err.kind() {
            crate::ErrorKind::Database(db) => assert_eq!(db.code(), "42601"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_after_rows_surfaces_in_the_stream() {
        let frames = NdjsonFrames::new(body_of(&[
            r#"{"columns":[{"name":"c","typeOid":25}]}"#,
            r#"{"values":["one"]}"#,
            r#"{"error":{"message":"boom","code":"XX000"}}"#,
        ]));
        let mut res = prime(frames, registry()).await.unwrap();

        assert_eq!(res.columns().len(), 1);
        assert!(res.rows.next().await.unwrap().is_some());
        assert!(res.rows.next().await.is_err());
    }

    #[tokio::test]
    async fn empty_body_is_fatal() {
        let frames = NdjsonFrames::new(body_of(&[]));
        assert!(prime(frames, registry()).await.is_err());
    }

    #[tokio::test]
    async fn truncated_body_is_fatal() {
        let frames = NdjsonFrames::new(body_of(&[
            r#"{"columns":[{"name":"c","typeOid":25}]}"#,
            r#"{"values":["one"]}"#,
        ]));
        let mut res = prime(frames, registry()).await.unwrap();
        assert!(res.rows.next().await.unwrap().is_some());
        assert!(res.rows.next().await.is_err());
    }
}
