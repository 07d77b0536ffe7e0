//! Wire frames of the query protocol.
//!
//! One statement is a descriptor frame followed by an extended frame per
//! large parameter, in descriptor order. Responses are a row description,
//! data rows, then a terminal complete or error frame.
//!
//! Frames are discriminated by urn, used as the multipart field name on HTTP
//! and as the header message on WebSocket.
use serde::{Serialize, ser::SerializeMap};
use std::{collections::BTreeMap, fmt};

use crate::{
    row::Column,
    value::{ByteStream, PgFormat},
};

mod encode;

pub(crate) use encode::encode_statement;

/// Content-type profile of the whole exchange.
pub const URN_QUERY: &str = "urn:prisma:query";
/// Query descriptor frame.
pub const URN_DESCRIPTOR: &str = "urn:prisma:query:descriptor";
/// Extended text parameter frame.
pub const URN_PARAM_TEXT: &str = "urn:prisma:query:param:text";
/// Extended binary parameter frame.
pub const URN_PARAM_BINARY: &str = "urn:prisma:query:param:binary";
/// Row description result frame.
pub const URN_RESULT_DESCRIPTION: &str = "urn:prisma:query:result:description";
/// Data row result frame.
pub const URN_RESULT_DATAROW: &str = "urn:prisma:query:result:datarow";
/// Command complete result frame.
pub const URN_RESULT_COMPLETE: &str = "urn:prisma:query:result:complete";
/// Error result frame.
pub const URN_RESULT_ERROR: &str = "urn:prisma:query:result:error";

/// Kind of a statement.
///
/// A query returns rows; an exec returns a single affected-count row under a
/// synthetic single-column schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Exec,
}

impl StatementKind {
    /// Key carrying the sql inside the descriptor.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Query => "query",
            StatementKind::Exec => "exec",
        }
    }
}

/// Descriptor frame body.
#[derive(Debug)]
pub(crate) struct QueryDescriptor<'a> {
    pub kind: StatementKind,
    pub sql: &'a str,
    pub parameters: Vec<ParamDescriptor>,
}

impl Serialize for QueryDescriptor<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let len = 1 + usize::from(!self.parameters.is_empty());
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry(self.kind.as_str(), self.sql)?;
        // the parameters list is omitted when there are none
        if !self.parameters.is_empty() {
            map.serialize_entry("parameters", &self.parameters)?;
        }
        map.end()
    }
}

/// Parameter entry inside a descriptor frame.
///
/// Inline parameters carry their value (base64 when binary); extended
/// parameters only declare the byte size of the follow-up frame.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum ParamDescriptor {
    Inline {
        #[serde(rename = "type")]
        format: PgFormat,
        value: Option<String>,
    },
    Extended {
        #[serde(rename = "type")]
        format: PgFormat,
        #[serde(rename = "byteSize")]
        byte_size: usize,
    },
}

/// One outbound frame.
pub(crate) enum Frame {
    /// Serialized descriptor json.
    Descriptor(String),
    /// Extended parameter payload.
    Param { format: PgFormat, payload: ParamPayload },
}

pub(crate) enum ParamPayload {
    Bytes(bytes::Bytes),
    Stream(ByteStream),
}

impl Frame {
    pub fn urn(&self) -> &'static str {
        match self {
            Frame::Descriptor(_) => URN_DESCRIPTOR,
            Frame::Param { format: PgFormat::Text, .. } => URN_PARAM_TEXT,
            Frame::Param { format: PgFormat::Binary, .. } => URN_PARAM_BINARY,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Descriptor(json) => f.debug_tuple("Descriptor").field(json).finish(),
            Frame::Param { format, payload } => {
                let len = match payload {
                    ParamPayload::Bytes(b) => b.len(),
                    ParamPayload::Stream(s) => s.len(),
                };
                f.debug_struct("Param").field("format", format).field("len", &len).finish()
            },
        }
    }
}

// ===== Inbound =====

/// Result frame urn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultUrn {
    Description,
    DataRow,
    Complete,
    Error,
}

impl ResultUrn {
    pub fn parse(urn: &str) -> Option<ResultUrn> {
        match urn {
            URN_RESULT_DESCRIPTION => Some(ResultUrn::Description),
            URN_RESULT_DATAROW => Some(ResultUrn::DataRow),
            URN_RESULT_COMPLETE => Some(ResultUrn::Complete),
            URN_RESULT_ERROR => Some(ResultUrn::Error),
            _ => None,
        }
    }
}

/// One inbound result frame.
#[derive(Debug)]
pub(crate) enum ResponseFrame {
    RowDescription { columns: Vec<Column> },
    DataRow { values: Vec<Option<String>> },
    Complete,
    Error(DatabaseError),
}

impl ResponseFrame {
    /// Decode a frame from its json form by shape.
    ///
    /// Returns `None` for unrecognized or malformed shapes; the HTTP reader
    /// skips those for forward compatibility, the WebSocket reader treats
    /// them as protocol violations.
    pub fn decode(value: serde_json::Value) -> Option<ResponseFrame> {
        let object = value.as_object()?;

        if let Some(columns) = object.get("columns") {
            let columns = serde_json::from_value(columns.clone()).ok()?;
            return Some(ResponseFrame::RowDescription { columns });
        }

        if let Some(values) = object.get("values") {
            let values = serde_json::from_value(values.clone()).ok()?;
            return Some(ResponseFrame::DataRow { values });
        }

        if object.get("complete").and_then(|c|c.as_bool()) == Some(true) {
            return Some(ResponseFrame::Complete);
        }

        if let Some(error) = object.get("error") {
            return DatabaseError::from_fields(error.as_object()?).map(ResponseFrame::Error);
        }

        None
    }

    /// Whether this frame is the one its urn header announced.
    pub fn matches(&self, urn: ResultUrn) -> bool {
        matches!(
            (urn, self),
            (ResultUrn::Description, ResponseFrame::RowDescription { .. })
                | (ResultUrn::DataRow, ResponseFrame::DataRow { .. })
                | (ResultUrn::Complete, ResponseFrame::Complete)
                | (ResultUrn::Error, ResponseFrame::Error(_))
        )
    }
}

/// Server reported SQL error.
#[derive(Debug, Clone)]
pub struct DatabaseError {
    code: String,
    message: String,
    details: BTreeMap<String, serde_json::Value>,
}

impl DatabaseError {
    /// SQLSTATE code.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extra fields of the error frame, code and message excluded.
    pub fn details(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.details
    }

    pub(crate) fn from_fields(fields: &serde_json::Map<String, serde_json::Value>) -> Option<DatabaseError> {
        let message = fields.get("message")?.as_str()?.to_owned();
        let code = fields.get("code")?.as_str()?.to_owned();
        let details = fields
            .iter()
            .filter(|(key, _)|!matches!(key.as_str(), "message" | "code"))
            .map(|(key, value)|(key.clone(), value.clone()))
            .collect();
        Some(DatabaseError { code, message, details })
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
