//! Decoder for the built-in `pgoutput` plugin (logical replication protocol
//! version 1).
//!
//! pgoutput is stateful: a Relation message describing a table's columns is
//! sent before the first change touching that table, and later tuples only
//! carry the relation id. Those definitions live in a [`RelationCache`] owned
//! by the decoder for the lifetime of the session.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use super::decoder::{parse_postgres_value, Decoder, PayloadReader};
use super::frame::from_pg_timestamp;
use super::types::{ChangeEvent, ChangeOperation, ColumnValues, RelationName};
use crate::lsn::Lsn;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn name(&self) -> RelationName {
        RelationName::new(self.schema.clone(), self.table.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub type_modifier: i32,
    pub is_key: bool,
}

/// Relation definitions keyed by relation id. Entries are replaced when the
/// server re-sends a definition (after `ALTER TABLE`) and never evicted.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relation: RelationInfo) {
        self.relations.insert(relation.id, relation);
    }

    pub fn get(&self, id: u32) -> Result<&RelationInfo> {
        self.relations.get(&id).ok_or(Error::UnknownRelation(id))
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

pub struct PgOutputDecoder {
    publication: String,
    messages: bool,
    relations: RelationCache,
    current_xid: Option<u32>,
    current_timestamp: Option<DateTime<Utc>>,
}

impl PgOutputDecoder {
    pub fn new(publication: impl Into<String>) -> Self {
        Self {
            publication: publication.into(),
            messages: false,
            relations: RelationCache::new(),
            current_xid: None,
            current_timestamp: None,
        }
    }

    /// Also request `pg_logical_emit_message` output.
    pub fn with_messages(mut self, messages: bool) -> Self {
        self.messages = messages;
        self
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    fn decode_begin(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let final_lsn = Lsn(cursor.u64("BEGIN final LSN")?);
        let timestamp = from_pg_timestamp(cursor.i64("BEGIN timestamp")?);
        let xid = cursor.u32("BEGIN xid")?;

        self.current_xid = Some(xid);
        self.current_timestamp = Some(timestamp);

        trace!("BEGIN: lsn={}, xid={}", final_lsn, xid);
        Ok(Some(
            ChangeEvent::new(ChangeOperation::Begin)
                .with_xid(Some(xid))
                .with_timestamp(Some(timestamp)),
        ))
    }

    fn decode_commit(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let _flags = cursor.u8("COMMIT flags")?;
        let _commit_lsn = cursor.u64("COMMIT LSN")?;
        let end_lsn = Lsn(cursor.u64("COMMIT end LSN")?);
        let timestamp = from_pg_timestamp(cursor.i64("COMMIT timestamp")?);

        trace!("COMMIT: lsn={}", end_lsn);
        let event = ChangeEvent::new(ChangeOperation::Commit)
            .with_xid(self.current_xid.take())
            .with_timestamp(Some(timestamp));
        self.current_timestamp = None;

        Ok(Some(event))
    }

    fn decode_origin(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let origin_lsn = Lsn(cursor.u64("ORIGIN LSN")?);
        let name = cursor.cstring("ORIGIN name")?;
        debug!("ORIGIN: {} at {}", name, origin_lsn);
        Ok(None)
    }

    fn decode_relation(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let rel_id = cursor.u32("RELATION id")?;
        let schema = cursor.cstring("RELATION namespace")?;
        let table = cursor.cstring("RELATION name")?;
        let replica_identity = cursor.u8("RELATION replica identity")?;
        let num_columns = cursor.i16("RELATION column count")?;

        let mut columns = Vec::with_capacity(num_columns.max(0) as usize);

        for _ in 0..num_columns {
            let flags = cursor.u8("column flags")?;
            let name = cursor.cstring("column name")?;
            let type_id = cursor.u32("column type")?;
            let type_modifier = cursor.i32("column type modifier")?;

            columns.push(ColumnInfo {
                name,
                type_id,
                type_modifier,
                is_key: (flags & 1) != 0,
            });
        }

        debug!("RELATION: {}={}.{}", rel_id, schema, table);
        self.relations.insert(RelationInfo {
            id: rel_id,
            schema,
            table,
            replica_identity,
            columns,
        });

        Ok(None)
    }

    fn decode_type(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let type_id = cursor.u32("TYPE id")?;
        let schema = cursor.cstring("TYPE namespace")?;
        let name = cursor.cstring("TYPE name")?;
        debug!("TYPE: {}={}.{}", type_id, schema, name);
        Ok(None)
    }

    fn decode_insert(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let rel_id = cursor.u32("INSERT relation id")?;
        let tuple_type = cursor.u8("INSERT tuple type")?;

        if tuple_type != b'N' {
            return Err(Error::decode_at(
                format!("Unexpected tuple type in INSERT: {:?}", tuple_type as char),
                cursor.position() - 1,
            ));
        }

        let relation = self.relations.get(rel_id)?;
        let after = decode_tuple_data(cursor, &relation.columns)?;

        Ok(Some(self.row_event(ChangeOperation::Insert, relation, after, None)))
    }

    fn decode_update(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let rel_id = cursor.u32("UPDATE relation id")?;
        let relation = self.relations.get(rel_id)?;

        let mut before = None;
        let mut tuple_type = cursor.u8("UPDATE tuple type")?;

        if tuple_type == b'O' || tuple_type == b'K' {
            before = Some(decode_tuple_data(cursor, &relation.columns)?);
            tuple_type = cursor.u8("UPDATE new tuple type")?;
        }

        if tuple_type != b'N' {
            return Err(Error::decode_at(
                format!("Unexpected tuple type in UPDATE: {:?}", tuple_type as char),
                cursor.position() - 1,
            ));
        }

        let after = decode_tuple_data(cursor, &relation.columns)?;

        Ok(Some(self.row_event(ChangeOperation::Update, relation, after, before)))
    }

    fn decode_delete(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let rel_id = cursor.u32("DELETE relation id")?;
        let tuple_type = cursor.u8("DELETE tuple type")?;

        if tuple_type != b'O' && tuple_type != b'K' {
            return Err(Error::decode_at(
                format!("Unexpected tuple type in DELETE: {:?}", tuple_type as char),
                cursor.position() - 1,
            ));
        }

        let relation = self.relations.get(rel_id)?;
        let before = decode_tuple_data(cursor, &relation.columns)?;

        Ok(Some(self.row_event(ChangeOperation::Delete, relation, before, None)))
    }

    fn decode_truncate(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let count = cursor.u32("TRUNCATE relation count")?;
        let options = cursor.u8("TRUNCATE options")?;

        // Each id takes four bytes; the count alone cannot size the buffer
        let mut truncated = Vec::with_capacity((count as usize).min(cursor.remaining() / 4));
        for _ in 0..count {
            let rel_id = cursor.u32("TRUNCATE relation id")?;
            truncated.push(self.relations.get(rel_id)?.name());
        }

        let mut event = ChangeEvent::new(ChangeOperation::Truncate)
            .with_xid(self.current_xid)
            .with_timestamp(self.current_timestamp);
        event.truncated = truncated;
        event.columns.insert("cascade".to_string(), Value::Bool(options & 1 != 0));
        event
            .columns
            .insert("restart_identity".to_string(), Value::Bool(options & 2 != 0));

        Ok(Some(event))
    }

    fn decode_message(&mut self, cursor: &mut PayloadReader<'_>) -> Result<Option<ChangeEvent>> {
        let flags = cursor.u8("MESSAGE flags")?;
        let lsn = Lsn(cursor.u64("MESSAGE LSN")?);
        let prefix = cursor.cstring("MESSAGE prefix")?;
        let len = cursor.u32("MESSAGE length")? as usize;
        let content = cursor.bytes(len, "MESSAGE content")?;

        let mut event = ChangeEvent::new(ChangeOperation::Message).with_xid(self.current_xid);
        event.columns.insert("prefix".to_string(), Value::String(prefix));
        event.columns.insert(
            "content".to_string(),
            Value::String(String::from_utf8_lossy(content).into_owned()),
        );
        event
            .columns
            .insert("transactional".to_string(), Value::Bool(flags & 1 != 0));
        event.columns.insert("lsn".to_string(), Value::String(lsn.to_string()));

        Ok(Some(event))
    }

    fn row_event(
        &self,
        op: ChangeOperation,
        relation: &RelationInfo,
        columns: ColumnValues,
        old_columns: Option<ColumnValues>,
    ) -> ChangeEvent {
        ChangeEvent::row(op, relation.name(), columns)
            .with_old_columns(old_columns)
            .with_xid(self.current_xid)
            .with_timestamp(self.current_timestamp)
    }
}

impl Decoder for PgOutputDecoder {
    fn plugin(&self) -> &'static str {
        "pgoutput"
    }

    fn plugin_options(&self) -> Vec<(String, String)> {
        let mut options = vec![
            ("proto_version".to_string(), "1".to_string()),
            ("publication_names".to_string(), self.publication.clone()),
        ];
        if self.messages {
            options.push(("messages".to_string(), "true".to_string()));
        }
        options
    }

    fn decode(&mut self, data: &[u8]) -> Result<Option<ChangeEvent>> {
        let mut cursor = PayloadReader::new(data);

        if cursor.is_empty() {
            return Err(Error::decode_at("Empty pgoutput message", 0));
        }

        let msg_type = cursor.u8("message type")?;

        match msg_type {
            b'B' => self.decode_begin(&mut cursor),
            b'C' => self.decode_commit(&mut cursor),
            b'O' => self.decode_origin(&mut cursor),
            b'R' => self.decode_relation(&mut cursor),
            b'Y' => self.decode_type(&mut cursor),
            b'I' => self.decode_insert(&mut cursor),
            b'U' => self.decode_update(&mut cursor),
            b'D' => self.decode_delete(&mut cursor),
            b'T' => self.decode_truncate(&mut cursor),
            b'M' => self.decode_message(&mut cursor),
            _ => Err(Error::decode_at(
                format!("Unknown pgoutput message type: {:?}", msg_type as char),
                0,
            )),
        }
    }
}

fn decode_tuple_data(cursor: &mut PayloadReader<'_>, columns: &[ColumnInfo]) -> Result<ColumnValues> {
    let start = cursor.position();
    let num_columns = cursor.i16("tuple column count")?;

    if num_columns as usize != columns.len() {
        return Err(Error::decode_at(
            format!("Column count mismatch: {} vs {}", num_columns, columns.len()),
            start,
        ));
    }

    let mut tuple = ColumnValues::new();

    for column in columns {
        let col_type = cursor.u8("column kind")?;

        match col_type {
            b'n' => {
                tuple.insert(column.name.clone(), Value::Null);
            }
            b'u' => {
                // unchanged TOASTed value; the server did not resend it
            }
            b't' => {
                let len = cursor.u32("text value length")? as usize;
                let raw = cursor.bytes(len, "text value")?;
                let text = String::from_utf8_lossy(raw);
                tuple.insert(column.name.clone(), parse_postgres_value(&text, column.type_id));
            }
            b'b' => {
                let len = cursor.u32("binary value length")? as usize;
                let raw = cursor.bytes(len, "binary value")?;
                tuple.insert(column.name.clone(), Value::String(BASE64.encode(raw)));
            }
            _ => {
                return Err(Error::decode_at(
                    format!("Unknown column kind: {:?}", col_type as char),
                    cursor.position() - 1,
                ));
            }
        }
    }

    Ok(tuple)
}
