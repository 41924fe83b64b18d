use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::lsn::Lsn;
use crate::postgres::OutputFormat;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub acknowledge: AcknowledgmentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    pub slot_name: String,
    #[serde(default)]
    pub format: OutputFormat,
    /// Publication streamed by pgoutput; ignored by the other formats.
    #[serde(default)]
    pub publication: Option<String>,
    #[serde(default = "default_true")]
    pub create_slot: bool,
    #[serde(default)]
    pub temporary_slot: bool,
    #[serde(default)]
    pub start_lsn: Option<Lsn>,
    /// Ask pgoutput for `pg_logical_emit_message` output as well.
    #[serde(default)]
    pub messages: bool,
    /// Extra plugin options appended to `START_REPLICATION`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Controls the automatic standby status updates sent while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct AcknowledgmentConfig {
    #[serde(default = "default_true")]
    pub auto: bool,
    #[serde(default = "default_ack_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ack_tick_millis")]
    pub tick_millis: u64,
}

impl Default for AcknowledgmentConfig {
    fn default() -> Self {
        Self {
            auto: true,
            timeout_secs: default_ack_timeout_secs(),
            tick_millis: default_ack_tick_millis(),
        }
    }
}

impl AcknowledgmentConfig {
    pub fn new(auto: bool, timeout_secs: u64) -> Self {
        Self {
            auto,
            timeout_secs,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_WALSUB")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?connect_timeout={}",
            self.postgres.username,
            self.postgres.password,
            self.postgres.host,
            self.postgres.port,
            self.postgres.database,
            self.postgres.connect_timeout_secs
        )
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_ack_tick_millis() -> u64 {
    1000
}
