//! The replication connection seen by a session, and a PostgreSQL
//! implementation of it speaking the frontend/backend protocol directly.
//!
//! tokio-postgres 0.7 cannot enter CopyBoth mode, so [`PgConnection`] drives
//! the socket itself with the message codecs from `postgres-protocol`.

use std::collections::HashMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::message::backend::{ErrorResponseBody, Message};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::config::Host;
use tracing::{debug, info, trace, warn};

use crate::lsn::Lsn;
use crate::{Error, Result};

/// CopyBothResponse; postgres-protocol has no parser for it.
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// What a replication session needs from the server connection.
///
/// `recv_frame` must be cancel-safe: the session races it against shutdown
/// and commands, and dropping the future must not lose a frame.
#[async_trait]
pub trait ReplicationConnection: Send + 'static {
    /// Creates the slot if asked to, then enters streaming mode.
    async fn start_replication(&mut self, command: &StartReplication) -> Result<()>;

    /// Next CopyData payload, or `None` once the server ends the stream.
    async fn recv_frame(&mut self) -> Result<Option<Bytes>>;

    async fn send_frame(&mut self, frame: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Everything needed to create a slot and start logical replication on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReplication {
    pub slot_name: String,
    pub plugin: String,
    pub start_lsn: Lsn,
    pub options: Vec<(String, String)>,
    pub create_slot: bool,
    pub temporary_slot: bool,
}

impl StartReplication {
    pub fn create_slot_command(&self) -> String {
        format!(
            "CREATE_REPLICATION_SLOT {}{} LOGICAL {} NOEXPORT_SNAPSHOT",
            quote_identifier(&self.slot_name),
            if self.temporary_slot { " TEMPORARY" } else { "" },
            quote_identifier(&self.plugin)
        )
    }

    pub fn start_replication_command(&self) -> String {
        let mut command = format!(
            "START_REPLICATION SLOT {} LOGICAL {}",
            quote_identifier(&self.slot_name),
            self.start_lsn
        );

        if !self.options.is_empty() {
            command.push_str(" (");
            for (i, (name, value)) in self.options.iter().enumerate() {
                if i > 0 {
                    command.push_str(", ");
                }
                let _ = write!(command, "{} {}", quote_identifier(name), quote_literal(value));
            }
            command.push(')');
        }

        command
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// One row of a simple-query result, all values in text form.
#[derive(Debug, Clone, Default)]
pub struct SimpleRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)?.as_deref()
    }
}

enum BackendMessage {
    CopyBothResponse,
    Protocol(Message),
}

/// A replication-mode connection to PostgreSQL over plain TCP.
pub struct PgConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    streaming: bool,
    parameters: HashMap<String, String>,
}

impl PgConnection {
    /// Connects using a libpq-style URL or key/value string and
    /// authenticates with `replication=database`.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e| Error::Transport(format!("Invalid connection string: {}", e)))?;
        Self::connect_with(&config).await
    }

    pub async fn connect_with(config: &tokio_postgres::Config) -> Result<Self> {
        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            #[cfg(unix)]
            Some(Host::Unix(_)) => {
                return Err(Error::Transport(
                    "Unix socket connections are not supported".to_string(),
                ));
            }
            None => "localhost".to_string(),
        };
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config
            .get_user()
            .ok_or_else(|| Error::Authentication("No user in connection string".to_string()))?
            .to_string();

        info!("Connecting to PostgreSQL at {}:{} in replication mode", host, port);

        let connect = TcpStream::connect((host.as_str(), port));
        let stream = match config.get_connect_timeout() {
            Some(timeout) => tokio::time::timeout(*timeout, connect).await.map_err(|_| {
                Error::Transport(format!("Timed out connecting to {}:{}", host, port))
            })??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;

        let mut connection = Self {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::new(),
            streaming: false,
            parameters: HashMap::new(),
        };

        let database = config.get_dbname().unwrap_or(&user).to_string();
        connection
            .startup(&user, &database, config.get_password(), config.get_application_name())
            .await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(connection)
    }

    /// Server parameters reported during startup (`server_version`, ...).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    async fn startup(
        &mut self,
        user: &str,
        database: &str,
        password: Option<&[u8]>,
        application_name: Option<&str>,
    ) -> Result<()> {
        let mut params = vec![
            ("user", user),
            ("database", database),
            ("replication", "database"),
            ("client_encoding", "UTF8"),
        ];
        if let Some(name) = application_name {
            params.push(("application_name", name));
        }
        frontend::startup_message(params, &mut self.write_buf)?;
        self.flush().await?;

        let mut scram: Option<ScramSha256> = None;

        loop {
            let message = match self.read_message().await? {
                BackendMessage::Protocol(message) => message,
                BackendMessage::CopyBothResponse => {
                    return Err(Error::Transport("Unexpected CopyBothResponse during startup".to_string()));
                }
            };

            match message {
                Message::AuthenticationOk => debug!("Authenticated as {}", user),
                Message::AuthenticationCleartextPassword => {
                    let password = require_password(password)?;
                    frontend::password_message(password, &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = require_password(password)?;
                    let hash = md5_hash(user.as_bytes(), password, body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationSasl(body) => {
                    let password = require_password(password)?;
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        supported |= mechanism == SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "Server offered no supported SASL mechanism".to_string(),
                        ));
                    }

                    let state = ScramSha256::new(password, ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, state.message(), &mut self.write_buf)?;
                    self.flush().await?;
                    scram = Some(state);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        Error::Authentication("SASL continue without SASL start".to_string())
                    })?;
                    state
                        .update(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(state.message(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        Error::Authentication("SASL final without SASL start".to_string())
                    })?;
                    state
                        .finish(body.data())
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                }
                Message::ParameterStatus(body) => {
                    self.parameters
                        .insert(body.name()?.to_string(), body.value()?.to_string());
                }
                Message::BackendKeyData(_) => {}
                Message::NoticeResponse(body) => log_notice(&body_message(body.fields())?),
                Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(error_message(&body)?));
                }
                Message::ReadyForQuery(_) => return Ok(()),
                _ => {
                    return Err(Error::Authentication(
                        "Unsupported authentication method requested by server".to_string(),
                    ));
                }
            }
        }
    }

    /// Runs a replication command through the simple query protocol.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        if self.streaming {
            return Err(Error::InvalidState {
                expected: "command mode",
                actual: "streaming".to_string(),
            });
        }

        debug!("Executing: {}", query);
        frontend::query(query, &mut self.write_buf)?;
        self.flush().await?;

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            let message = match self.read_message().await? {
                BackendMessage::Protocol(message) => message,
                BackendMessage::CopyBothResponse => {
                    return Err(Error::Transport(format!(
                        "Unexpected CopyBothResponse for {}",
                        query
                    )));
                }
            };

            match message {
                Message::RowDescription(body) => {
                    columns = body
                        .fields()
                        .map(|field| Ok(field.name().to_string()))
                        .collect()?;
                }
                Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let values = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                        })
                        .collect()?;
                    rows.push(SimpleRow {
                        columns: columns.clone(),
                        values,
                    });
                }
                Message::ErrorResponse(body) => failure = Some(error_message(&body)?),
                Message::NoticeResponse(body) => log_notice(&body_message(body.fields())?),
                Message::ReadyForQuery(_) => break,
                _ => {}
            }
        }

        match failure {
            Some(message) => Err(Error::Server(message)),
            None => Ok(rows),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Server("IDENTIFY_SYSTEM returned no rows".to_string()))?;

        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or("unknown").to_string(),
            timeline: row.get("timeline").and_then(|t| t.parse().ok()).unwrap_or(1),
            xlogpos: row.get("xlogpos").unwrap_or("0/0").parse()?,
            dbname: row.get("dbname").map(str::to_string),
        };

        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Creates the logical slot, returning its consistent point. An existing
    /// slot is reused and yields `None`.
    pub async fn create_slot(&mut self, command: &StartReplication) -> Result<Option<Lsn>> {
        info!("Creating replication slot: {}", command.slot_name);

        match self.simple_query(&command.create_slot_command()).await {
            Ok(rows) => {
                let consistent_point = rows
                    .first()
                    .and_then(|row| row.get("consistent_point"))
                    .map(str::parse::<Lsn>)
                    .transpose()?;
                info!(
                    slot = %command.slot_name,
                    "Created replication slot at LSN {}",
                    consistent_point.unwrap_or_default()
                );
                Ok(consistent_point)
            }
            Err(Error::Server(message)) if message.contains("already exists") => {
                info!("Replication slot '{}' already exists", command.slot_name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn drop_slot(&mut self, slot_name: &str) -> Result<()> {
        info!("Dropping replication slot: {}", slot_name);

        match self
            .simple_query(&format!("DROP_REPLICATION_SLOT {}", quote_identifier(slot_name)))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Server(message)) if message.contains("does not exist") => {
                warn!("Replication slot '{}' does not exist", slot_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(message) = self.parse_buffered()? {
                return Ok(message);
            }

            // read_buf is cancel-safe: nothing is consumed unless it returns
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::Transport("Server closed the connection".to_string()));
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<BackendMessage>> {
        if self.read_buf.len() >= 5 && self.read_buf[0] == COPY_BOTH_RESPONSE_TAG {
            let header = &self.read_buf[1..5];
            let len = copy_both_length([header[0], header[1], header[2], header[3]])?;
            if self.read_buf.len() < len + 1 {
                return Ok(None);
            }
            self.read_buf.advance(len + 1);
            return Ok(Some(BackendMessage::CopyBothResponse));
        }

        Ok(Message::parse(&mut self.read_buf)?.map(BackendMessage::Protocol))
    }

    /// Writes out and empties the write buffer. The buffer is emptied even
    /// when the write fails, so a half-sent message never prefixes the next.
    async fn flush(&mut self) -> Result<()> {
        let written = self.stream.write_all(&self.write_buf).await;
        self.write_buf.clear();
        written?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ReplicationConnection for PgConnection {
    async fn start_replication(&mut self, command: &StartReplication) -> Result<()> {
        if command.create_slot {
            self.create_slot(command).await?;
        }

        let query = command.start_replication_command();
        info!("Starting replication from LSN: {}", command.start_lsn);
        debug!("Executing: {}", query);

        frontend::query(&query, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            match self.read_message().await? {
                BackendMessage::CopyBothResponse => {
                    self.streaming = true;
                    info!(slot = %command.slot_name, "Replication stream started");
                    return Ok(());
                }
                BackendMessage::Protocol(Message::ErrorResponse(body)) => {
                    let message = error_message(&body)?;
                    // drain up to ReadyForQuery so the connection stays usable
                    loop {
                        if let BackendMessage::Protocol(Message::ReadyForQuery(_)) =
                            self.read_message().await?
                        {
                            break;
                        }
                    }
                    return Err(Error::Server(message));
                }
                BackendMessage::Protocol(Message::NoticeResponse(body)) => {
                    log_notice(&body_message(body.fields())?)
                }
                BackendMessage::Protocol(_) => {}
            }
        }
    }

    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.streaming {
            return Ok(None);
        }

        loop {
            match self.read_message().await? {
                BackendMessage::Protocol(Message::CopyData(body)) => {
                    let data = body.into_bytes();
                    trace!("Received CopyData of {} bytes", data.len());
                    return Ok(Some(data));
                }
                BackendMessage::Protocol(Message::CopyDone) => {
                    info!("Server ended the replication stream");
                    self.streaming = false;
                    return Ok(None);
                }
                BackendMessage::Protocol(Message::ErrorResponse(body)) => {
                    self.streaming = false;
                    return Err(Error::Server(error_message(&body)?));
                }
                BackendMessage::Protocol(Message::NoticeResponse(body)) => {
                    log_notice(&body_message(body.fields())?)
                }
                BackendMessage::Protocol(Message::ParameterStatus(body)) => {
                    self.parameters
                        .insert(body.name()?.to_string(), body.value()?.to_string());
                }
                BackendMessage::Protocol(_) | BackendMessage::CopyBothResponse => {
                    return Err(Error::Transport(
                        "Unexpected message in replication stream".to_string(),
                    ));
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        if !self.streaming {
            return Err(Error::Transport("Replication stream is not active".to_string()));
        }

        frontend::CopyData::new(frame)?.write(&mut self.write_buf);
        self.flush()
            .await
            .map_err(|e| Error::Transport(format!("Failed to send frame: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing replication connection");

        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
            self.streaming = false;
        }
        frontend::terminate(&mut self.write_buf);
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn require_password(password: Option<&[u8]>) -> Result<&[u8]> {
    password.ok_or_else(|| Error::Authentication("Server requested a password".to_string()))
}

fn error_message(body: &ErrorResponseBody) -> Result<String> {
    body_message(body.fields())
}

/// Renders `SEVERITY: message` from the fields of an ErrorResponse or
/// NoticeResponse.
fn body_message(mut fields: postgres_protocol::message::backend::ErrorFields<'_>) -> Result<String> {
    let mut severity = None;
    let mut message = None;

    while let Some(field) = fields.next()? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
    }

    Ok(format!(
        "{}: {}",
        severity.unwrap_or_else(|| "ERROR".to_string()),
        message.unwrap_or_default()
    ))
}

fn log_notice(message: &str) {
    info!("Server notice: {}", message);
}

/// Validates the self-inclusive length of a CopyBothResponse header.
fn copy_both_length(header: [u8; 4]) -> Result<usize> {
    let len = i32::from_be_bytes(header);
    match usize::try_from(len) {
        Ok(len) if len >= 4 => Ok(len),
        _ => Err(Error::Transport(format!(
            "Invalid CopyBothResponse length: {}",
            len
        ))),
    }
}
