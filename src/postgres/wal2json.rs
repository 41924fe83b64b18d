//! Decoder for the `wal2json` plugin in `format-version 2`, where every
//! payload is one JSON document describing a single change.

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use super::decoder::{parse_text_timestamp, Decoder};
use super::types::{ChangeEvent, ChangeOperation, ColumnValues, RelationName};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    action: String,
    xid: Option<u32>,
    timestamp: Option<String>,
    schema: Option<String>,
    table: Option<String>,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
    #[serde(default)]
    identity: Vec<Wal2JsonColumn>,
    transactional: Option<bool>,
    prefix: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[allow(dead_code)]
    #[serde(rename = "type")]
    type_name: Option<String>,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Default)]
pub struct Wal2JsonDecoder;

impl Wal2JsonDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Wal2JsonDecoder {
    fn plugin(&self) -> &'static str {
        "wal2json"
    }

    fn plugin_options(&self) -> Vec<(String, String)> {
        vec![
            ("format-version".to_string(), "2".to_string()),
            ("include-xids".to_string(), "1".to_string()),
            ("include-timestamp".to_string(), "1".to_string()),
        ]
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Option<ChangeEvent>> {
        let change: Wal2JsonChange = serde_json::from_slice(payload).map_err(|e| {
            Error::decode_at(
                format!("Invalid wal2json document: {}", e),
                byte_offset(payload, e.line(), e.column()),
            )
        })?;

        trace!(action = %change.action, "wal2json change");

        let op = match change.action.as_str() {
            "B" => ChangeOperation::Begin,
            "C" => ChangeOperation::Commit,
            "I" => ChangeOperation::Insert,
            "U" => ChangeOperation::Update,
            "D" => ChangeOperation::Delete,
            "T" => ChangeOperation::Truncate,
            "M" => ChangeOperation::Message,
            other => {
                return Err(Error::decode(format!("Unknown wal2json action: {}", other)));
            }
        };

        let relation = match (&change.schema, &change.table) {
            (Some(schema), Some(table)) => Some(RelationName::new(schema.clone(), table.clone())),
            _ => None,
        };

        let mut event = ChangeEvent::new(op)
            .with_xid(change.xid)
            .with_timestamp(change.timestamp.as_deref().and_then(parse_text_timestamp));

        match op {
            ChangeOperation::Insert => {
                event.relation = relation;
                event.columns = to_column_values(change.columns);
            }
            ChangeOperation::Update => {
                event.relation = relation;
                event.columns = to_column_values(change.columns);
                if !change.identity.is_empty() {
                    event.old_columns = Some(to_column_values(change.identity));
                }
            }
            ChangeOperation::Delete => {
                event.relation = relation;
                event.columns = to_column_values(change.identity);
            }
            ChangeOperation::Truncate => {
                event.truncated = relation.into_iter().collect();
            }
            ChangeOperation::Message => {
                event.columns.insert(
                    "prefix".to_string(),
                    Value::String(change.prefix.unwrap_or_default()),
                );
                event.columns.insert(
                    "content".to_string(),
                    Value::String(change.content.unwrap_or_default()),
                );
                event.columns.insert(
                    "transactional".to_string(),
                    Value::Bool(change.transactional.unwrap_or(false)),
                );
            }
            ChangeOperation::Begin | ChangeOperation::Commit => {}
        }

        Ok(Some(event))
    }
}

fn to_column_values(columns: Vec<Wal2JsonColumn>) -> ColumnValues {
    columns
        .into_iter()
        .map(|column| (column.name, column.value))
        .collect()
}

/// Turns serde_json's 1-based line/column into a byte offset.
fn byte_offset(payload: &[u8], line: usize, column: usize) -> usize {
    let line_start: usize = payload
        .split(|&b| b == b'\n')
        .take(line.saturating_sub(1))
        .map(|l| l.len() + 1)
        .sum();
    (line_start + column.saturating_sub(1)).min(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn decode(doc: &str) -> Result<Option<ChangeEvent>> {
        Wal2JsonDecoder::new().decode(doc.as_bytes())
    }

    #[test]
    fn test_decode_insert() {
        let event = decode(
            r#"{"action":"I","xid":529,"timestamp":"2023-10-15 10:30:00.5+00","schema":"public","table":"users","columns":[{"name":"id","type":"integer","value":1},{"name":"name","type":"text","value":"Jane"}]}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.op, ChangeOperation::Insert);
        assert_eq!(event.relation, Some(RelationName::new("public", "users")));
        assert_eq!(event.columns["id"], json!(1));
        assert_eq!(event.columns["name"], json!("Jane"));
        assert_eq!(event.xid, Some(529));
        assert_eq!(
            event.timestamp,
            Some(Utc.with_ymd_and_hms(2023, 10, 15, 10, 30, 0).unwrap() + chrono::Duration::milliseconds(500))
        );
    }

    #[test]
    fn test_decode_update_with_identity() {
        let event = decode(
            r#"{"action":"U","schema":"public","table":"users","columns":[{"name":"id","type":"integer","value":1},{"name":"name","type":"text","value":"New"}],"identity":[{"name":"id","type":"integer","value":1}]}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.op, ChangeOperation::Update);
        assert_eq!(event.columns["name"], json!("New"));
        assert_eq!(event.old_columns.unwrap()["id"], json!(1));
    }

    #[test]
    fn test_decode_delete_uses_identity() {
        let event = decode(
            r#"{"action":"D","schema":"public","table":"users","identity":[{"name":"id","type":"integer","value":7}]}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.op, ChangeOperation::Delete);
        assert_eq!(event.columns["id"], json!(7));
        assert!(event.old_columns.is_none());
    }

    #[test]
    fn test_decode_transaction_boundaries() {
        let begin = decode(r#"{"action":"B","xid":10}"#).unwrap().unwrap();
        assert_eq!(begin.op, ChangeOperation::Begin);
        assert_eq!(begin.xid, Some(10));

        let commit = decode(r#"{"action":"C","xid":10}"#).unwrap().unwrap();
        assert_eq!(commit.op, ChangeOperation::Commit);
    }

    #[test]
    fn test_decode_truncate() {
        let event = decode(r#"{"action":"T","schema":"public","table":"logs"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.op, ChangeOperation::Truncate);
        assert_eq!(event.truncated, vec![RelationName::new("public", "logs")]);
    }

    #[test]
    fn test_malformed_document_reports_position() {
        match decode(r#"{"action":"I","schema":}"#) {
            Err(Error::Decode {
                position: Some(position),
                ..
            }) => assert!((22..=24).contains(&position)),
            other => panic!("Expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_decode_error() {
        assert!(matches!(decode(r#"{"action":"X"}"#), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_byte_offset_multiline() {
        let payload = b"{\n  \"a\": ,\n}";
        assert_eq!(byte_offset(payload, 2, 8), 9);
    }
}
