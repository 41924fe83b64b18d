use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Builds raw pgoutput (protocol version 1) payloads for decoder tests.
pub struct PgOutputMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// One column of a tuple as it appears on the wire.
#[derive(Debug, Clone, Copy)]
pub enum TupleValue<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
    Null,
    UnchangedToast,
}

impl PgOutputMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 0x16B3748,
            timestamp: 750_681_000_000_000, // 2023-10-15 10:30:00 UTC since 2000-01-01
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();

        self.relations.insert(
            id,
            MockRelation {
                id,
                schema: schema.to_string(),
                table: table.to_string(),
                columns,
            },
        );
        self
    }

    pub fn begin_message(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 100);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn relation_message(&self, rel_id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&rel_id)
            .expect("Relation not found. Use add_relation() first.");

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(relation.id);
        put_cstring(&mut buf, &relation.schema);
        put_cstring(&mut buf, &relation.table);
        buf.put_u8(b'd');
        buf.put_i16(relation.columns.len() as i16);

        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstring(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1);
        }

        buf.freeze()
    }

    pub fn type_message(&self, type_id: u32, schema: &str, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Y');
        buf.put_u32(type_id);
        put_cstring(&mut buf, schema);
        put_cstring(&mut buf, name);
        buf.freeze()
    }

    pub fn origin_message(&self, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'O');
        buf.put_u64(self.lsn);
        put_cstring(&mut buf, name);
        buf.freeze()
    }

    pub fn insert_message(&self, rel_id: u32, values: &[TupleValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    /// `old` is sent as a key tuple (`K`) when `key_only`, else as a full
    /// old row (`O`).
    pub fn update_message(
        &self,
        rel_id: u32,
        old: Option<(&[TupleValue<'_>], bool)>,
        new: &[TupleValue<'_>],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);

        if let Some((values, key_only)) = old {
            buf.put_u8(if key_only { b'K' } else { b'O' });
            put_tuple(&mut buf, values);
        }

        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    pub fn delete_message(&self, rel_id: u32, key: &[TupleValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(b'K');
        put_tuple(&mut buf, key);
        buf.freeze()
    }

    pub fn truncate_message(&self, rel_ids: &[u32], cascade: bool, restart_identity: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(rel_ids.len() as u32);
        buf.put_u8(u8::from(cascade) | (u8::from(restart_identity) << 1));
        for id in rel_ids {
            buf.put_u32(*id);
        }
        buf.freeze()
    }

    pub fn logical_message(&self, transactional: bool, prefix: &str, content: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'M');
        buf.put_u8(u8::from(transactional));
        buf.put_u64(self.lsn);
        put_cstring(&mut buf, prefix);
        buf.put_u32(content.len() as u32);
        buf.put_slice(content);
        buf.freeze()
    }

    /// A complete transaction: relation, begin, inserts, commit.
    pub fn insert_transaction(&self, xid: u32, rel_id: u32, rows: &[Vec<TupleValue<'_>>]) -> Vec<Bytes> {
        let mut messages = vec![self.relation_message(rel_id), self.begin_message(xid)];
        messages.extend(rows.iter().map(|row| self.insert_message(rel_id, row)));
        messages.push(self.commit_message());
        messages
    }
}

impl Default for PgOutputMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[TupleValue<'_>]) {
    buf.put_i16(values.len() as i16);

    for value in values {
        match value {
            TupleValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            TupleValue::Binary(raw) => {
                buf.put_u8(b'b');
                buf.put_u32(raw.len() as u32);
                buf.put_slice(raw);
            }
            TupleValue::Null => buf.put_u8(b'n'),
            TupleValue::UnchangedToast => buf.put_u8(b'u'),
        }
    }
}
