//! Decoder for the `decoderbufs` plugin, which emits one protobuf
//! `RowMessage` per change.
//!
//! The message types mirror `pg_logicaldec.proto` and are declared by hand
//! with prost's derive macros.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::DateTime;
use prost::Message as _;
use serde_json::{json, Value};

use super::decoder::Decoder;
use super::types::{ChangeEvent, ChangeOperation, ColumnValues, RelationName};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Op {
    Unknown = -1,
    Insert = 0,
    Update = 1,
    Delete = 2,
    Begin = 3,
    Commit = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Point {
    #[prost(double, required, tag = "1")]
    pub x: f64,
    #[prost(double, required, tag = "2")]
    pub y: f64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DatumMessage {
    #[prost(string, optional, tag = "1")]
    pub column_name: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub column_type: Option<i64>,
    #[prost(oneof = "datum_message::Datum", tags = "3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub datum: Option<datum_message::Datum>,
}

pub mod datum_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Datum {
        #[prost(int32, tag = "3")]
        DatumInt32(i32),
        #[prost(int64, tag = "4")]
        DatumInt64(i64),
        #[prost(float, tag = "5")]
        DatumFloat(f32),
        #[prost(double, tag = "6")]
        DatumDouble(f64),
        #[prost(bool, tag = "7")]
        DatumBool(bool),
        #[prost(string, tag = "8")]
        DatumString(String),
        #[prost(bytes = "vec", tag = "9")]
        DatumBytes(Vec<u8>),
        #[prost(message, tag = "10")]
        DatumPoint(super::Point),
        #[prost(bool, tag = "11")]
        DatumMissing(bool),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TypeInfo {
    #[prost(string, required, tag = "1")]
    pub modifier: String,
    #[prost(bool, required, tag = "2")]
    pub value_optional: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RowMessage {
    #[prost(uint32, optional, tag = "1")]
    pub transaction_id: Option<u32>,
    /// Microseconds since the Unix epoch.
    #[prost(uint64, optional, tag = "2")]
    pub commit_time: Option<u64>,
    #[prost(string, optional, tag = "3")]
    pub table: Option<String>,
    #[prost(enumeration = "Op", optional, tag = "4")]
    pub op: Option<i32>,
    #[prost(message, repeated, tag = "5")]
    pub new_tuple: Vec<DatumMessage>,
    #[prost(message, repeated, tag = "6")]
    pub old_tuple: Vec<DatumMessage>,
    #[prost(message, repeated, tag = "7")]
    pub new_typeinfo: Vec<TypeInfo>,
}

#[derive(Debug, Default)]
pub struct DecoderbufsDecoder;

impl DecoderbufsDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for DecoderbufsDecoder {
    fn plugin(&self) -> &'static str {
        "decoderbufs"
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Option<ChangeEvent>> {
        let row = RowMessage::decode(payload)
            .map_err(|e| Error::decode(format!("Invalid decoderbufs RowMessage: {}", e)))?;

        let raw_op = row.op.unwrap_or(Op::Unknown as i32);
        let op = match Op::try_from(raw_op) {
            Ok(Op::Insert) => ChangeOperation::Insert,
            Ok(Op::Update) => ChangeOperation::Update,
            Ok(Op::Delete) => ChangeOperation::Delete,
            Ok(Op::Begin) => ChangeOperation::Begin,
            Ok(Op::Commit) => ChangeOperation::Commit,
            Ok(Op::Unknown) | Err(_) => {
                return Err(Error::decode(format!("Unknown decoderbufs op: {}", raw_op)));
            }
        };

        let timestamp = row
            .commit_time
            .and_then(|micros| i64::try_from(micros).ok())
            .and_then(DateTime::from_timestamp_micros);

        let mut event = ChangeEvent::new(op)
            .with_xid(row.transaction_id)
            .with_timestamp(timestamp);

        if matches!(op, ChangeOperation::Begin | ChangeOperation::Commit) {
            return Ok(Some(event));
        }

        let table = row
            .table
            .as_deref()
            .ok_or_else(|| Error::decode("decoderbufs row change without table"))?;
        event.relation = Some(RelationName::parse_qualified(table));

        match op {
            ChangeOperation::Delete => {
                event.columns = to_column_values(&row.old_tuple);
            }
            _ => {
                event.columns = to_column_values(&row.new_tuple);
                if !row.old_tuple.is_empty() {
                    event.old_columns = Some(to_column_values(&row.old_tuple));
                }
            }
        }

        Ok(Some(event))
    }
}

fn to_column_values(datums: &[DatumMessage]) -> ColumnValues {
    use datum_message::Datum;

    let mut columns = ColumnValues::new();

    for datum in datums {
        let name = datum.column_name.clone().unwrap_or_default();
        let value = match &datum.datum {
            None => Value::Null,
            Some(Datum::DatumMissing(_)) => continue,
            Some(Datum::DatumInt32(v)) => Value::from(*v),
            Some(Datum::DatumInt64(v)) => Value::from(*v),
            Some(Datum::DatumFloat(v)) => Value::from(*v as f64),
            Some(Datum::DatumDouble(v)) => Value::from(*v),
            Some(Datum::DatumBool(v)) => Value::Bool(*v),
            Some(Datum::DatumString(v)) => Value::String(v.clone()),
            Some(Datum::DatumBytes(v)) => Value::String(BASE64.encode(v)),
            Some(Datum::DatumPoint(p)) => json!({ "x": p.x, "y": p.y }),
        };
        columns.insert(name, value);
    }

    columns
}
