pub mod connection;
pub mod decoder;
pub mod decoderbufs;
pub mod frame;
pub mod mock;
pub mod pgoutput;
pub mod test_decoding;
pub mod types;
pub mod wal2json;

#[cfg(test)]
mod decoder_tests;
#[cfg(test)]
mod test_utils;

pub use connection::{PgConnection, ReplicationConnection, SimpleRow, StartReplication, SystemInfo};
pub use decoder::{build_decoder, Decoder, OutputFormat};
pub use decoderbufs::DecoderbufsDecoder;
pub use frame::{ReplicationFrame, StandbyStatusUpdate};
pub use pgoutput::{ColumnInfo, PgOutputDecoder, RelationCache, RelationInfo};
pub use test_decoding::TestDecodingDecoder;
pub use types::*;
pub use wal2json::Wal2JsonDecoder;
