use anyhow::Context;
use clap::Parser;
use pg_walsub::postgres::{build_decoder, ChangeEvent, PgConnection};
use pg_walsub::{Config, Lsn, ReplicationSession, SessionEvent, SubscribeOptions};
use serde::Serialize;
use std::path::PathBuf;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-walsub")]
#[command(about = "Streams PostgreSQL logical replication changes as JSON lines", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

/// One line on stdout per decoded change.
#[derive(Serialize)]
struct ChangeLine<'a> {
    lsn: Lsn,
    #[serde(flatten)]
    change: &'a ChangeEvent,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-walsub");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %config.replication.slot_name,
        format = %config.replication.format,
        auto_acknowledge = config.acknowledge.auto,
        "Configuration summary"
    );

    let decoder = build_decoder(&config.replication)?;
    let connection = PgConnection::connect(&config.postgres_url())
        .await
        .context("Failed to connect to PostgreSQL")?;

    let mut session = ReplicationSession::new(connection, config.acknowledge);
    let options = SubscribeOptions {
        start_lsn: config.replication.start_lsn,
        create_slot: config.replication.create_slot,
        temporary_slot: config.replication.temporary_slot,
        plugin_options: config.replication.options.clone().into_iter().collect(),
    };

    let events = session
        .subscribe(decoder, config.replication.slot_name.clone(), options)
        .await
        .context("Failed to start replication")?;
    let mut events = UnboundedReceiverStream::new(events);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            event = events.next() => match event {
                Some(SessionEvent::Data { lsn, event }) => {
                    let line = serde_json::to_string(&ChangeLine { lsn, change: &event })?;
                    println!("{}", line);
                }
                Some(SessionEvent::Error(e)) if e.is_fatal() => {
                    error!("Replication failed: {}", e);
                }
                Some(SessionEvent::Error(e)) => warn!("{}", e),
                Some(SessionEvent::Ended) | None => break,
            },
        }
    }

    session.stop().await?;
    info!(
        acknowledged = %session.acknowledged(),
        "pg-walsub stopped"
    );

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_walsub=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_walsub=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
