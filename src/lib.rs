pub mod acknowledger;
pub mod config;
pub mod error;
pub mod lsn;
pub mod session;

pub mod postgres;

pub use config::{AcknowledgmentConfig, Config};
pub use error::{Error, Result};
pub use lsn::{Lsn, LsnTracker};
pub use session::{ReplicationSession, SessionEvent, SessionEvents, SessionHandle, SessionState, SubscribeOptions};
