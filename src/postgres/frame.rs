//! CopyData payloads exchanged once `START_REPLICATION` succeeded.
//!
//! | Tag | Direction | Layout                                              |
//! |-----|-----------|-----------------------------------------------------|
//! | `w` | inbound   | start LSN, end LSN, send time, change payload       |
//! | `k` | inbound   | end LSN, send time, reply-requested flag            |
//! | `r` | outbound  | write LSN, flush LSN, apply LSN, client time, reply |
//!
//! All integers are big-endian; times are microseconds since 2000-01-01 UTC.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::lsn::Lsn;
use crate::{Error, Result};

pub const XLOG_DATA_TAG: u8 = b'w';
pub const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

const XLOG_DATA_HEADER_LEN: usize = 24;
const KEEPALIVE_LEN: usize = 17;
const STANDBY_STATUS_UPDATE_LEN: usize = 1 + 8 * 4 + 1;

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// An inbound replication frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    XLogData {
        start_lsn: Lsn,
        end_lsn: Lsn,
        send_time: DateTime<Utc>,
        payload: Bytes,
    },
    PrimaryKeepalive {
        end_lsn: Lsn,
        send_time: DateTime<Utc>,
        reply_requested: bool,
    },
}

impl ReplicationFrame {
    /// Classifies a CopyData body by its tag byte and slices the remainder.
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Frame("Empty message".to_string()));
        }

        let tag = data.get_u8();

        match tag {
            XLOG_DATA_TAG => {
                if data.remaining() < XLOG_DATA_HEADER_LEN {
                    return Err(Error::Frame(format!(
                        "XLogData header needs {} bytes, got {}",
                        XLOG_DATA_HEADER_LEN,
                        data.remaining()
                    )));
                }

                let start_lsn = Lsn(data.get_u64());
                let end_lsn = Lsn(data.get_u64());
                let send_time = from_pg_timestamp(data.get_i64());

                Ok(ReplicationFrame::XLogData {
                    start_lsn,
                    end_lsn,
                    send_time,
                    payload: data,
                })
            }
            PRIMARY_KEEPALIVE_TAG => {
                if data.remaining() < KEEPALIVE_LEN {
                    return Err(Error::Frame(format!(
                        "Keepalive needs {} bytes, got {}",
                        KEEPALIVE_LEN,
                        data.remaining()
                    )));
                }

                let end_lsn = Lsn(data.get_u64());
                let send_time = from_pg_timestamp(data.get_i64());
                let reply_requested = data.get_u8() != 0;

                Ok(ReplicationFrame::PrimaryKeepalive {
                    end_lsn,
                    send_time,
                    reply_requested,
                })
            }
            _ => Err(Error::Frame(format!(
                "Unknown message tag: {:?}",
                tag as char
            ))),
        }
    }

    /// The position this frame reports: the start of the change for XLogData
    /// (falling back to its end when the server sent `0/0`), and the server's
    /// WAL end for keepalives.
    pub fn lsn(&self) -> Lsn {
        match self {
            ReplicationFrame::XLogData {
                start_lsn, end_lsn, ..
            } => {
                if start_lsn.is_zero() {
                    *end_lsn
                } else {
                    *start_lsn
                }
            }
            ReplicationFrame::PrimaryKeepalive { end_lsn, .. } => *end_lsn,
        }
    }

    /// Serializes the frame the way the server sends it.
    pub fn encode(&self) -> Bytes {
        match self {
            ReplicationFrame::XLogData {
                start_lsn,
                end_lsn,
                send_time,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(1 + XLOG_DATA_HEADER_LEN + payload.len());
                buf.put_u8(XLOG_DATA_TAG);
                buf.put_u64(start_lsn.0);
                buf.put_u64(end_lsn.0);
                buf.put_i64(to_pg_timestamp(*send_time));
                buf.put_slice(payload);
                buf.freeze()
            }
            ReplicationFrame::PrimaryKeepalive {
                end_lsn,
                send_time,
                reply_requested,
            } => {
                let mut buf = BytesMut::with_capacity(1 + KEEPALIVE_LEN);
                buf.put_u8(PRIMARY_KEEPALIVE_TAG);
                buf.put_u64(end_lsn.0);
                buf.put_i64(to_pg_timestamp(*send_time));
                buf.put_u8(u8::from(*reply_requested));
                buf.freeze()
            }
        }
    }
}

/// Outbound acknowledgment of replay progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StandbyStatusUpdate {
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub apply_lsn: Lsn,
    pub client_time: DateTime<Utc>,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// An update reporting `lsn` as written, flushed and applied.
    pub fn at(lsn: Lsn, client_time: DateTime<Utc>) -> Self {
        Self {
            write_lsn: lsn,
            flush_lsn: lsn,
            apply_lsn: lsn,
            client_time,
            reply_requested: false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STANDBY_STATUS_UPDATE_LEN);
        buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
        buf.put_u64(self.write_lsn.0);
        buf.put_u64(self.flush_lsn.0);
        buf.put_u64(self.apply_lsn.0);
        buf.put_i64(to_pg_timestamp(self.client_time));
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() != STANDBY_STATUS_UPDATE_LEN || data[0] != STANDBY_STATUS_UPDATE_TAG {
            return Err(Error::Frame(format!(
                "Standby status update must be {} bytes starting with 'r'",
                STANDBY_STATUS_UPDATE_LEN
            )));
        }
        data.advance(1);

        Ok(Self {
            write_lsn: Lsn(data.get_u64()),
            flush_lsn: Lsn(data.get_u64()),
            apply_lsn: Lsn(data.get_u64()),
            client_time: from_pg_timestamp(data.get_i64()),
            reply_requested: data.get_u8() != 0,
        })
    }
}

/// Converts microseconds since 2000-01-01 to a UTC timestamp.
pub fn from_pg_timestamp(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros.saturating_add(PG_EPOCH_OFFSET_MICROS);
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = (unix_micros.rem_euclid(1_000_000) * 1_000) as u32;

    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Converts a UTC timestamp to microseconds since 2000-01-01.
pub fn to_pg_timestamp(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}
