//! Output plugin decoders.
//!
//! Every logical decoding output plugin serializes changes differently. A
//! [`Decoder`] turns one XLogData payload from a specific plugin into a
//! [`ChangeEvent`]. The decoder is picked once per session (see
//! [`OutputFormat`]) and owned by the read loop, so stateful decoders such as
//! pgoutput never see two payloads concurrently.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::decoderbufs::DecoderbufsDecoder;
use super::pgoutput::PgOutputDecoder;
use super::test_decoding::TestDecodingDecoder;
use super::types::ChangeEvent;
use super::wal2json::Wal2JsonDecoder;
use crate::config::ReplicationConfig;
use crate::{Error, Result};

/// Turns raw change payloads into [`ChangeEvent`]s.
pub trait Decoder: Send {
    /// Name of the server-side output plugin this decoder understands.
    fn plugin(&self) -> &'static str;

    /// Options passed to the plugin in `START_REPLICATION`.
    fn plugin_options(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Decodes one payload.
    ///
    /// Returns `Ok(None)` when the payload only carried metadata the decoder
    /// absorbed (relation or type definitions, origins).
    fn decode(&mut self, payload: &[u8]) -> Result<Option<ChangeEvent>>;
}

/// The output plugins this crate can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Pgoutput,
    #[serde(rename = "wal2json")]
    Wal2Json,
    Decoderbufs,
    TestDecoding,
}

impl OutputFormat {
    pub fn plugin_name(&self) -> &'static str {
        match self {
            OutputFormat::Pgoutput => "pgoutput",
            OutputFormat::Wal2Json => "wal2json",
            OutputFormat::Decoderbufs => "decoderbufs",
            OutputFormat::TestDecoding => "test_decoding",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plugin_name())
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pgoutput" => Ok(OutputFormat::Pgoutput),
            "wal2json" => Ok(OutputFormat::Wal2Json),
            "decoderbufs" => Ok(OutputFormat::Decoderbufs),
            "test_decoding" => Ok(OutputFormat::TestDecoding),
            other => Err(Error::Config(config::ConfigError::Message(format!(
                "Unknown output format: {}",
                other
            )))),
        }
    }
}

/// Builds the decoder for the configured output format.
pub fn build_decoder(config: &ReplicationConfig) -> Result<Box<dyn Decoder>> {
    let decoder: Box<dyn Decoder> = match config.format {
        OutputFormat::Pgoutput => {
            let publication = config.publication.clone().ok_or_else(|| {
                Error::Config(config::ConfigError::Message(
                    "pgoutput requires replication.publication".to_string(),
                ))
            })?;
            Box::new(PgOutputDecoder::new(publication).with_messages(config.messages))
        }
        OutputFormat::Wal2Json => Box::new(Wal2JsonDecoder::new()),
        OutputFormat::Decoderbufs => Box::new(DecoderbufsDecoder::new()),
        OutputFormat::TestDecoding => Box::new(TestDecodingDecoder::new()),
    };

    Ok(decoder)
}

/// Bounds-checked big-endian reader over a payload.
///
/// Every read reports the byte offset it failed at instead of panicking.
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::decode_at(
                format!("{}: need {} bytes, {} left", what, len, self.remaining()),
                self.pos,
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.bytes(1, what)?[0])
    }

    pub fn i16(&mut self, what: &str) -> Result<i16> {
        let b = self.bytes(2, what)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self, what: &str) -> Result<i32> {
        Ok(self.u32(what)? as i32)
    }

    pub fn u64(&mut self, what: &str) -> Result<u64> {
        let b = self.bytes(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn i64(&mut self, what: &str) -> Result<i64> {
        Ok(self.u64(what)? as i64)
    }

    /// Reads a NUL-terminated string.
    pub fn cstring(&mut self, what: &str) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::decode_at(format!("{}: missing string terminator", what), self.pos)
        })?;
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(text)
    }
}

/// Types a text-format column value by its PostgreSQL type OID.
pub fn parse_postgres_value(text: &str, type_id: u32) -> Value {
    match type_id {
        16 => match text {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        20 | 21 | 23 | 26 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        700 | 701 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        114 | 3802 => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        // numeric keeps its exact text; everything else is passed through
        _ => Value::String(text.to_string()),
    }
}

/// Parses the `timestamptz` text output used by the text-based plugins,
/// e.g. `2023-10-15 10:30:00.123456+00`.
pub fn parse_text_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Maps the type names printed by text-based plugins to OIDs understood by
/// [`parse_postgres_value`].
pub fn type_oid_for_name(type_name: &str) -> u32 {
    match type_name {
        "boolean" | "bool" => 16,
        "bigint" | "int8" => 20,
        "smallint" | "int2" => 21,
        "integer" | "int" | "int4" => 23,
        "oid" => 26,
        "real" | "float4" => 700,
        "double precision" | "float8" => 701,
        "json" => 114,
        "jsonb" => 3802,
        _ => 25,
    }
}
