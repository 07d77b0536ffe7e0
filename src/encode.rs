//! Parameter serialization.
//!
//! Statement parameters start as [`Value`], then pass through the serializer
//! chain: user serializers are probed in registration order, the built-in
//! rules run last.
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

use crate::value::{ParamValue, PgFormat, Value};

/// Value that can be bound to a sql parameter.
pub trait Encode {
    fn encode(self) -> Value;
}

impl<T> Encode for T
where
    T: Into<Value>,
{
    fn encode(self) -> Value {
        self.into()
    }
}

/// A user serializer.
///
/// Return `Ok` to claim the value and produce a raw parameter, or give the
/// value back with `Err` so the rest of the chain can try.
pub type Serializer = Arc<dyn Fn(Value) -> Result<ParamValue, Value> + Send + Sync>;

pub(crate) fn serialize(serializers: &[Serializer], value: Value) -> ParamValue {
    let mut value = value;
    for serializer in serializers {
        match serializer(value) {
            Ok(param) => return param,
            Err(back) => value = back,
        }
    }
    default_serialize(value)
}

/// Built-in serialization rules, always last in the chain.
fn default_serialize(value: Value) -> ParamValue {
    match value {
        Value::Null => ParamValue::Text(None),
        Value::Text(text) => ParamValue::Text(Some(text)),
        Value::Bytes(data) => ParamValue::Bytes { data, format: PgFormat::Binary },
        Value::TextStream(data) => ParamValue::Stream { data, format: PgFormat::Text },
        Value::ByteStream(data) => ParamValue::Stream { data, format: PgFormat::Binary },
        Value::Bool(true) => ParamValue::Text(Some("t".into())),
        Value::Bool(false) => ParamValue::Text(Some("f".into())),
        Value::Int(int) => ParamValue::Text(Some(itoa::Buffer::new().format(int).into())),
        Value::Float(float) => ParamValue::Text(Some(float.to_string())),
        Value::Timestamp(ts) => ParamValue::Text(Some(
            ts.format(&Rfc3339).expect("rfc3339 format is statically known"),
        )),
        Value::Json(json) => ParamValue::Text(Some(json.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn text(value: Value) -> Option<String> {
        match serialize(&[], value) {
            ParamValue::Text(text) => text,
            other => panic!("expected text param, got {other:?}"),
        }
    }

    #[test]
    fn default_rules() {
        assert_eq!(text(Value::Null), None);
        assert_eq!(text(Value::Bool(true)).as_deref(), Some("t"));
        assert_eq!(text(Value::Bool(false)).as_deref(), Some("f"));
        assert_eq!(text(Value::Int(-7)).as_deref(), Some("-7"));
        assert_eq!(text(Value::Float(1.5)).as_deref(), Some("1.5"));
        assert_eq!(text(Value::Text("short".into())).as_deref(), Some("short"));
        assert_eq!(
            text(Value::Json(serde_json::json!({"a":1}))).as_deref(),
            Some(r#"{"a":1}"#),
        );
    }

    #[test]
    fn timestamp_iso8601() {
        let ts = time::OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert_eq!(text(Value::Timestamp(ts)).as_deref(), Some("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn bytes_keep_format() {
        match serialize(&[], Value::Bytes(bytes::Bytes::from_static(&[1,2,3]))) {
            ParamValue::Bytes { data, format } => {
                assert_eq!(&*data, &[1,2,3]);
                assert_eq!(format, PgFormat::Binary);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn user_serializer_first() {
        let custom: Serializer = Arc::new(|value|match value {
            Value::Int(i) => Ok(ParamValue::Text(Some(format!("int:{i}")))),
            other => Err(other),
        });

        let chain = [custom];
        match serialize(&chain, Value::Int(5)) {
            ParamValue::Text(Some(t)) => assert_eq!(t, "int:5"),
            other => panic!("unexpected {other:?}"),
        }

        // unclaimed values fall through to the defaults
        match serialize(&chain, Value::Bool(true)) {
            ParamValue::Text(Some(t)) => assert_eq!(t, "t"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
