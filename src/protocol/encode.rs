//! Frame encoding: statement parameters into descriptor and extended frames.
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use super::{Frame, ParamDescriptor, ParamPayload, QueryDescriptor, StatementKind};
use crate::{
    Result,
    error::ValidationError,
    value::{ParamValue, PgFormat},
};

/// Payloads at most this many bytes ride inside the descriptor.
pub(crate) const INLINE_LIMIT: usize = 1024;

/// Encode one statement into its outbound frames.
///
/// The descriptor comes first, then one extended frame per parameter larger
/// than the inline limit, in descriptor order. Small streams are consumed
/// here and inlined; large streams stay lazy.
pub(crate) async fn encode_statement(
    kind: StatementKind,
    sql: &str,
    params: Vec<ParamValue>,
) -> Result<Vec<Frame>> {
    let mut parameters = Vec::with_capacity(params.len());
    let mut extended = Vec::new();

    for param in params {
        match param {
            ParamValue::Text(None) => {
                parameters.push(ParamDescriptor::Inline { format: PgFormat::Text, value: None });
            },
            ParamValue::Text(Some(text)) => {
                // string byte size is its utf8 encoded length
                if text.len() <= INLINE_LIMIT {
                    parameters.push(ParamDescriptor::Inline {
                        format: PgFormat::Text,
                        value: Some(text),
                    });
                } else {
                    parameters.push(ParamDescriptor::Extended {
                        format: PgFormat::Text,
                        byte_size: text.len(),
                    });
                    extended.push(Frame::Param {
                        format: PgFormat::Text,
                        payload: ParamPayload::Bytes(Bytes::from(text)),
                    });
                }
            },
            ParamValue::Bytes { data, format } => {
                if data.len() <= INLINE_LIMIT {
                    parameters.push(inline_bytes(&data, format)?);
                } else {
                    if format == PgFormat::Text {
                        check_utf8(&data)?;
                    }
                    parameters.push(ParamDescriptor::Extended { format, byte_size: data.len() });
                    extended.push(Frame::Param { format, payload: ParamPayload::Bytes(data) });
                }
            },
            ParamValue::Stream { data, format } => {
                // the declared length decides inline or extended
                let byte_size = data.len();
                if byte_size <= INLINE_LIMIT {
                    let data = data.collect().await?;
                    parameters.push(inline_bytes(&data, format)?);
                } else {
                    parameters.push(ParamDescriptor::Extended { format, byte_size });
                    extended.push(Frame::Param { format, payload: ParamPayload::Stream(data) });
                }
            },
        }
    }

    let descriptor = QueryDescriptor { kind, sql, parameters };
    let descriptor = serde_json::to_string(&descriptor)
        .expect("descriptor serialization is statically known");

    let mut frames = Vec::with_capacity(1 + extended.len());
    frames.push(Frame::Descriptor(descriptor));
    frames.extend(extended);
    Ok(frames)
}

fn inline_bytes(data: &[u8], format: PgFormat) -> Result<ParamDescriptor> {
    let value = match format {
        PgFormat::Text => check_utf8(data)?.to_owned(),
        PgFormat::Binary => BASE64.encode(data),
    };
    Ok(ParamDescriptor::Inline { format, value: Some(value) })
}

fn check_utf8(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data)
        .map_err(|_|ValidationError::new("text parameter is not valid utf8").into())
}
