use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Column name to decoded value, in column order.
pub type ColumnValues = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
    Truncate,
    Message,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeOperation::Begin => "BEGIN",
            ChangeOperation::Commit => "COMMIT",
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
            ChangeOperation::Truncate => "TRUNCATE",
            ChangeOperation::Message => "MESSAGE",
        };
        f.write_str(name)
    }
}

/// Schema-qualified table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationName {
    pub schema: String,
    pub table: String,
}

impl RelationName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parses `schema.table` as printed by `quote_qualified_identifier`,
    /// honouring double-quoted identifiers. A bare name lands in `public`.
    pub fn parse_qualified(name: &str) -> Self {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut chars = name.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '"' if quoted && chars.peek() == Some(&'"') => {
                    current.push('"');
                    chars.next();
                }
                '"' => quoted = !quoted,
                '.' if !quoted => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }

        let table = current;
        if parts.is_empty() {
            RelationName::new("public", table)
        } else {
            RelationName::new(parts.join("."), table)
        }
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One decoded change, independent of the output plugin that produced it.
///
/// `columns` holds the new row for inserts and updates and the key (or full
/// old row, depending on replica identity) for deletes. `old_columns` is only
/// set for updates that carried the previous key or row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationName>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub columns: ColumnValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_columns: Option<ColumnValues>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated: Vec<RelationName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(op: ChangeOperation) -> Self {
        Self {
            op,
            relation: None,
            columns: Map::new(),
            old_columns: None,
            truncated: Vec::new(),
            xid: None,
            timestamp: None,
        }
    }

    /// A row change against `relation`.
    pub fn row(op: ChangeOperation, relation: RelationName, columns: ColumnValues) -> Self {
        Self {
            relation: Some(relation),
            columns,
            ..Self::new(op)
        }
    }

    pub fn with_old_columns(mut self, old_columns: Option<ColumnValues>) -> Self {
        self.old_columns = old_columns;
        self
    }

    pub fn with_xid(mut self, xid: Option<u32>) -> Self {
        self.xid = xid;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
