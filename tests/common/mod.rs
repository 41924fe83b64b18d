#![allow(dead_code)]

use pg_walsub::config::{AcknowledgmentConfig, Config, PostgresConfig, ReplicationConfig};
use pg_walsub::postgres::OutputFormat;
use pg_walsub::{SessionEvent, SessionEvents};
use std::collections::BTreeMap;
use std::env;

/// Get test configuration from environment variables
pub fn get_test_config(format: OutputFormat) -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 10,
    };

    let replication = ReplicationConfig {
        slot_name: format!("test_slot_{}", std::process::id()),
        format,
        publication: Some(format!("test_publication_{}", std::process::id())),
        create_slot: true,
        temporary_slot: true,
        start_lsn: None,
        messages: false,
        options: BTreeMap::new(),
    };

    Config {
        postgres,
        replication,
        // Frequent acknowledgments for tests
        acknowledge: AcknowledgmentConfig::new(true, 1),
    }
}

/// Everything published so far, without waiting.
pub fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn data_lsns(events: &[SessionEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Data { lsn, .. } => Some(lsn.0),
            _ => None,
        })
        .collect()
}
