//! Parser and serializer dispatch tables.
//!
//! Column values are parsed by a function selected on the column oid;
//! unknown oids pass the raw text through. Parameter serialization probes
//! user serializers first, then the built-in rules.
use std::collections::HashMap;

use crate::{
    encode::{self, Serializer},
    row::{Column, DecodeError},
    value::{ParamValue, Value},
};

/// Postgres type identifier.
pub type Oid = u32;

/// A column parser. Must handle null explicitly.
pub type Parser = fn(Option<&str>) -> Result<Value, DecodeError>;

pub(crate) mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const JSON: Oid = 114;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const VARCHAR: Oid = 1043;
    pub const JSONB: Oid = 3802;
}

/// Per-client parser and serializer tables.
pub struct TypeRegistry {
    parsers: HashMap<Oid, Parser>,
    serializers: Vec<Serializer>,
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("parsers", &self.parsers.len())
            .field("serializers", &self.serializers.len())
            .finish()
    }
}

impl TypeRegistry {
    /// Registry with the built-in parsers.
    pub fn new() -> TypeRegistry {
        let parsers = HashMap::from([
            (oid::BOOL, parse_bool as Parser),
            (oid::INT2, parse_int),
            (oid::INT4, parse_int),
            (oid::INT8, parse_int),
            (oid::FLOAT4, parse_float),
            (oid::FLOAT8, parse_float),
            (oid::TEXT, parse_text),
            (oid::VARCHAR, parse_text),
            (oid::JSON, parse_json),
            (oid::JSONB, parse_json),
        ]);
        TypeRegistry { parsers, serializers: Vec::new() }
    }

    /// Register a parser for a column oid, replacing any previous one.
    pub fn register_parser(&mut self, oid: Oid, parser: Parser) {
        self.parsers.insert(oid, parser);
    }

    /// Register a serializer. Serializers run in registration order, before
    /// the built-in rules.
    pub fn register_serializer(&mut self, serializer: Serializer) {
        self.serializers.push(serializer);
    }

    pub(crate) fn serialize(&self, value: Value) -> ParamValue {
        encode::serialize(&self.serializers, value)
    }

    pub(crate) fn parse(&self, oid: Oid, raw: Option<&str>) -> Result<Value, DecodeError> {
        match self.parsers.get(&oid) {
            Some(parser) => parser(raw),
            None => Ok(match raw {
                Some(text) => Value::Text(text.to_owned()),
                None => Value::Null,
            }),
        }
    }

    /// Parse one wire row. Values past the advertised columns pass through
    /// as raw text.
    pub(crate) fn parse_row(
        &self,
        columns: &[Column],
        raw: Vec<Option<String>>,
    ) -> Result<Vec<Value>, DecodeError> {
        raw.into_iter()
            .enumerate()
            .map(|(i, value)|match columns.get(i) {
                Some(column) => self.parse(column.oid, value.as_deref()),
                None => Ok(match value {
                    Some(text) => Value::Text(text),
                    None => Value::Null,
                }),
            })
            .collect()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(raw: Option<&str>) -> Result<Value, DecodeError> {
    match raw {
        None => Ok(Value::Null),
        Some("t") => Ok(Value::Bool(true)),
        Some("f") => Ok(Value::Bool(false)),
        Some(_) => Err(DecodeError::new(oid::BOOL, "expected t or f")),
    }
}

fn parse_int(raw: Option<&str>) -> Result<Value, DecodeError> {
    match raw {
        None => Ok(Value::Null),
        Some(text) => text
            .parse()
            .map(Value::Int)
            .map_err(|_|DecodeError::new(oid::INT8, "invalid integer")),
    }
}

fn parse_float(raw: Option<&str>) -> Result<Value, DecodeError> {
    match raw {
        None => Ok(Value::Null),
        Some(text) => text
            .parse()
            .map(Value::Float)
            .map_err(|_|DecodeError::new(oid::FLOAT8, "invalid float")),
    }
}

fn parse_text(raw: Option<&str>) -> Result<Value, DecodeError> {
    Ok(match raw {
        Some(text) => Value::Text(text.to_owned()),
        None => Value::Null,
    })
}

fn parse_json(raw: Option<&str>) -> Result<Value, DecodeError> {
    match raw {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(text)
            .map(Value::Json)
            .map_err(|_|DecodeError::new(oid::JSONB, "invalid json")),
    }
}
