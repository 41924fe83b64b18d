//! Decoder for the `test_decoding` contrib plugin.
//!
//! Each payload is one line of text:
//!
//! ```text
//! BEGIN 529
//! table public.users: INSERT: id[integer]:1 name[text]:'Jane'
//! table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 name[text]:'Jane'
//! table public.users: DELETE: id[integer]:2
//! table public.a, public.b: TRUNCATE: cascade
//! message: transactional: 1 prefix: audit, sz: 5 content:hello
//! COMMIT 529 (at 2023-10-15 10:30:00.123456+00)
//! ```

use serde_json::Value;
use tracing::trace;

use super::decoder::{parse_postgres_value, parse_text_timestamp, type_oid_for_name, Decoder};
use super::types::{ChangeEvent, ChangeOperation, ColumnValues, RelationName};
use crate::{Error, Result};

const OLD_KEY: &str = "old-key: ";
const NEW_TUPLE: &str = "new-tuple: ";
const NO_TUPLE_DATA: &str = "(no-tuple-data)";
const UNCHANGED_TOAST: &str = "unchanged-toast-datum";

#[derive(Debug, Default)]
pub struct TestDecodingDecoder;

impl TestDecodingDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TestDecodingDecoder {
    fn plugin(&self) -> &'static str {
        "test_decoding"
    }

    fn plugin_options(&self) -> Vec<(String, String)> {
        vec![
            ("include-xids".to_string(), "1".to_string()),
            ("include-timestamp".to_string(), "1".to_string()),
        ]
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Option<ChangeEvent>> {
        let text = std::str::from_utf8(payload).map_err(|e| {
            Error::decode_at("test_decoding line is not valid UTF-8", e.valid_up_to())
        })?;
        let mut line = LineCursor::new(text.trim_end_matches(['\n', '\r']));

        trace!(line = %line.rest(), "test_decoding line");

        if line.eat_keyword("BEGIN") {
            let xid = line.xid()?;
            return Ok(Some(ChangeEvent::new(ChangeOperation::Begin).with_xid(xid)));
        }

        if line.eat_keyword("COMMIT") {
            let xid = line.xid()?;
            let mut event = ChangeEvent::new(ChangeOperation::Commit).with_xid(xid);
            if line.eat(" (at ") {
                let at = line.until(")", "commit timestamp")?;
                event.timestamp = parse_text_timestamp(at);
            }
            return Ok(Some(event));
        }

        if line.eat("message: ") {
            return decode_message(&mut line).map(Some);
        }

        if line.eat("table ") {
            return decode_table_change(&mut line).map(Some);
        }

        Err(Error::decode_at(
            format!("Unrecognised test_decoding line: {:?}", text),
            0,
        ))
    }
}

fn decode_table_change(line: &mut LineCursor<'_>) -> Result<ChangeEvent> {
    let names = line.raw_until(": ", "relation name")?;
    let action_at = line.position();
    let action = match line.until(": ", "change kind") {
        Ok(action) => action,
        Err(_) => line.take_rest(),
    };

    let op = match action {
        "INSERT" => ChangeOperation::Insert,
        "UPDATE" => ChangeOperation::Update,
        "DELETE" => ChangeOperation::Delete,
        "TRUNCATE" => return Ok(truncate_event(names, line.take_rest())),
        other => {
            return Err(Error::decode_at(
                format!("Unknown test_decoding change kind: {}", other),
                action_at,
            ));
        }
    };

    let relation = RelationName::parse_qualified(names);

    if line.eat(NO_TUPLE_DATA) {
        return Ok(ChangeEvent::row(op, relation, ColumnValues::new()));
    }

    let mut old_columns = None;
    if line.eat(OLD_KEY) {
        old_columns = Some(decode_columns(line)?);
        line.expect(NEW_TUPLE, "new-tuple section")?;
    }

    let columns = decode_columns(line)?;

    Ok(ChangeEvent::row(op, relation, columns).with_old_columns(old_columns))
}

fn truncate_event(names: &str, flags: &str) -> ChangeEvent {
    let mut event = ChangeEvent::new(ChangeOperation::Truncate);
    event.truncated = split_outside_quotes(names, ',')
        .into_iter()
        .map(|name| RelationName::parse_qualified(name.trim()))
        .collect();

    let flags: Vec<&str> = flags.split_whitespace().collect();
    event
        .columns
        .insert("cascade".to_string(), Value::Bool(flags.contains(&"cascade")));
    event.columns.insert(
        "restart_identity".to_string(),
        Value::Bool(flags.contains(&"restart_seqs")),
    );
    event
}

fn decode_message(line: &mut LineCursor<'_>) -> Result<ChangeEvent> {
    line.expect("transactional: ", "message flags")?;
    let transactional = line.until(" ", "transactional flag")? == "1";
    line.expect("prefix: ", "message prefix")?;
    let prefix = line.until(", sz: ", "message prefix")?;
    let _size = line.until(" content:", "message size")?;
    let content = line.take_rest();

    let mut event = ChangeEvent::new(ChangeOperation::Message);
    event
        .columns
        .insert("prefix".to_string(), Value::String(prefix.to_string()));
    event
        .columns
        .insert("content".to_string(), Value::String(content.to_string()));
    event
        .columns
        .insert("transactional".to_string(), Value::Bool(transactional));
    Ok(event)
}

/// Reads `name[type]:value` pairs until the line ends or a `new-tuple:`
/// section starts.
fn decode_columns(line: &mut LineCursor<'_>) -> Result<ColumnValues> {
    let mut columns = ColumnValues::new();

    while !line.is_empty() && !line.rest().starts_with(NEW_TUPLE) {
        let name = unquote_identifier(line.raw_until("[", "column name")?);
        let type_name = line.until("]:", "column type")?;

        let value = if line.eat("'") {
            let text = line.quoted_literal()?;
            Some(parse_postgres_value(&text, type_oid_for_name(type_name)))
        } else {
            match line.until(" ", "column value").unwrap_or_else(|_| line.take_rest()) {
                "null" => Some(Value::Null),
                UNCHANGED_TOAST => None,
                text => Some(parse_postgres_value(text, type_oid_for_name(type_name))),
            }
        };

        if let Some(value) = value {
            columns.insert(name, value);
        }

        line.eat(" ");
    }

    Ok(columns)
}

fn unquote_identifier(raw: &str) -> String {
    match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => raw.to_string(),
    }
}

fn split_outside_quotes(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if c == separator && !quoted {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Position-tracking cursor over one line, so errors report byte offsets.
struct LineCursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> LineCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn take_rest(&mut self) -> &'a str {
        let rest = self.rest();
        self.pos = self.text.len();
        rest
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// Like [`eat`](Self::eat) but only when `word` ends the line or is
    /// followed by a space.
    fn eat_keyword(&mut self, word: &str) -> bool {
        let rest = self.rest();
        let whole = rest
            .strip_prefix(word)
            .is_some_and(|after| after.is_empty() || after.starts_with(' '));
        whole && self.eat(word)
    }

    fn expect(&mut self, prefix: &str, what: &str) -> Result<()> {
        if self.eat(prefix) {
            Ok(())
        } else {
            Err(Error::decode_at(format!("Expected {}", what), self.pos))
        }
    }

    /// Returns the text before `delimiter` and consumes both.
    fn until(&mut self, delimiter: &str, what: &str) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest.find(delimiter).ok_or_else(|| {
            Error::decode_at(format!("Unterminated {}", what), self.pos)
        })?;
        self.pos += end + delimiter.len();
        Ok(&rest[..end])
    }

    /// Like [`until`](Self::until) but ignores delimiters inside double quotes.
    fn raw_until(&mut self, delimiter: &str, what: &str) -> Result<&'a str> {
        let rest = self.rest();
        let mut quoted = false;

        for (i, c) in rest.char_indices() {
            if c == '"' {
                quoted = !quoted;
            } else if !quoted && rest[i..].starts_with(delimiter) {
                self.pos += i + delimiter.len();
                return Ok(&rest[..i]);
            }
        }

        Err(Error::decode_at(format!("Unterminated {}", what), self.pos))
    }

    /// Reads a single-quoted literal whose opening quote was already consumed.
    fn quoted_literal(&mut self) -> Result<String> {
        let start = self.pos;
        let rest = self.rest();
        let mut value = String::new();
        let mut chars = rest.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if c != '\'' {
                value.push(c);
                continue;
            }
            if let Some(&(_, '\'')) = chars.peek() {
                value.push('\'');
                chars.next();
                continue;
            }
            self.pos += i + 1;
            return Ok(value);
        }

        Err(Error::decode_at("Unterminated quoted value", start))
    }

    fn xid(&mut self) -> Result<Option<u32>> {
        if !self.eat(" ") {
            return Ok(None);
        }
        let start = self.pos;
        let digits: &str = {
            let rest = self.rest();
            let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            &rest[..end]
        };
        let xid = digits
            .parse::<u32>()
            .map_err(|_| Error::decode_at(format!("Invalid xid: {:?}", digits), start))?;
        self.pos += digits.len();
        Ok(Some(xid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(line: &str) -> ChangeEvent {
        TestDecodingDecoder::new()
            .decode(line.as_bytes())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_decode_begin_and_commit() {
        let begin = decode("BEGIN 529");
        assert_eq!(begin.op, ChangeOperation::Begin);
        assert_eq!(begin.xid, Some(529));

        let commit = decode("COMMIT 529 (at 2023-10-15 10:30:00.123456+00)");
        assert_eq!(commit.op, ChangeOperation::Commit);
        assert_eq!(commit.xid, Some(529));
        assert_eq!(commit.timestamp.unwrap().timestamp(), 1_697_365_800);
    }

    #[test]
    fn test_decode_insert() {
        let event = decode(
            "table public.users: INSERT: id[integer]:1 name[character varying]:'O''Brien' active[boolean]:true note[text]:null",
        );

        assert_eq!(event.op, ChangeOperation::Insert);
        assert_eq!(event.relation, Some(RelationName::new("public", "users")));
        assert_eq!(event.columns["id"], json!(1));
        assert_eq!(event.columns["name"], json!("O'Brien"));
        assert_eq!(event.columns["active"], json!(true));
        assert_eq!(event.columns["note"], Value::Null);
    }

    #[test]
    fn test_decode_update_with_old_key() {
        let event = decode(
            "table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 bio[text]:unchanged-toast-datum",
        );

        assert_eq!(event.op, ChangeOperation::Update);
        assert_eq!(event.columns["id"], json!(2));
        assert!(!event.columns.contains_key("bio"));
        assert_eq!(event.old_columns.unwrap()["id"], json!(1));
    }

    #[test]
    fn test_decode_quoted_value_with_spaces_and_array_type() {
        let event = decode(
            "table public.docs: INSERT: title[text]:'hello world' tags[text[]]:'{a,b}' meta[jsonb]:'{\"k\": 1}'",
        );

        assert_eq!(event.columns["title"], json!("hello world"));
        assert_eq!(event.columns["tags"], json!("{a,b}"));
        assert_eq!(event.columns["meta"], json!({"k": 1}));
    }

    #[test]
    fn test_decode_delete_without_tuple_data() {
        let event = decode("table \"Sales\".\"Orders\": DELETE: (no-tuple-data)");
        assert_eq!(event.op, ChangeOperation::Delete);
        assert_eq!(event.relation, Some(RelationName::new("Sales", "Orders")));
        assert!(event.columns.is_empty());
    }

    #[test]
    fn test_decode_truncate() {
        let event = decode("table public.a, public.b: TRUNCATE: cascade");
        assert_eq!(event.op, ChangeOperation::Truncate);
        assert_eq!(
            event.truncated,
            vec![RelationName::new("public", "a"), RelationName::new("public", "b")]
        );
        assert_eq!(event.columns["cascade"], json!(true));
        assert_eq!(event.columns["restart_identity"], json!(false));
    }

    #[test]
    fn test_decode_message() {
        let event = decode("message: transactional: 1 prefix: audit, sz: 5 content:hello");
        assert_eq!(event.op, ChangeOperation::Message);
        assert_eq!(event.columns["prefix"], json!("audit"));
        assert_eq!(event.columns["content"], json!("hello"));
        assert_eq!(event.columns["transactional"], json!(true));
    }

    #[test]
    fn test_unterminated_quote_reports_position() {
        let result = TestDecodingDecoder::new()
            .decode(b"table public.users: INSERT: name[text]:'Jane");

        match result {
            Err(Error::Decode { position, .. }) => assert_eq!(position, Some(40)),
            other => panic!("Expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_line_is_decode_error() {
        let result = TestDecodingDecoder::new().decode(b"ROLLBACK 12");
        assert!(matches!(result, Err(Error::Decode { .. })));
    }

    #[test]
    fn test_keyword_must_be_whole_word() {
        for line in ["BEGINX 12", "BEGIN_WORK", "COMMITTED 7"] {
            let result = TestDecodingDecoder::new().decode(line.as_bytes());
            assert!(
                matches!(result, Err(Error::Decode { position: Some(0), .. })),
                "{} decoded as {:?}",
                line,
                result
            );
        }

        assert_eq!(decode("BEGIN").xid, None);
        assert_eq!(decode("COMMIT").op, ChangeOperation::Commit);
    }
}
