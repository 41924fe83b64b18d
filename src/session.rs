//! The replication session: lifecycle, read loop and acknowledgments.
//!
//! `subscribe` hands the connection to a driver task that owns it for the
//! rest of the session. The driver reads frames, decodes them and publishes
//! [`SessionEvent`]s, and executes acknowledgment commands sent through a
//! [`SessionHandle`], so every send on the connection happens on one task.
//!
//! ```text
//! Idle -> Subscribing -> Streaming -> Stopping -> Stopped
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::acknowledger::AckScheduler;
use crate::config::AcknowledgmentConfig;
use crate::lsn::{Lsn, LsnTracker};
use crate::postgres::{
    ChangeEvent, Decoder, ReplicationConnection, ReplicationFrame, StandbyStatusUpdate,
    StartReplication,
};
use crate::{Error, Result};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Idle,
    Subscribing,
    Streaming,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Subscribing => "subscribing",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Notifications published by a running session.
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded change and the position it was read at.
    Data { lsn: Lsn, event: ChangeEvent },
    /// A failure. Fatal errors are followed by [`SessionEvent::Ended`].
    Error(Error),
    /// The read loop exited; nothing but late acknowledgment errors follows.
    Ended,
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Position to resume from; the server picks the slot's confirmed
    /// position when absent.
    pub start_lsn: Option<Lsn>,
    pub create_slot: bool,
    pub temporary_slot: bool,
    /// Plugin options appended to the decoder's own.
    pub plugin_options: Vec<(String, String)>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start_lsn: None,
            create_slot: true,
            temporary_slot: false,
            plugin_options: Vec::new(),
        }
    }
}

enum Command {
    Acknowledge {
        lsn: Lsn,
        reply: oneshot::Sender<Result<bool>>,
    },
}

/// Cloneable access to a session from other tasks.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    tracker: Arc<LsnTracker>,
}

impl SessionHandle {
    /// Sends a standby status update for `lsn`.
    ///
    /// Returns `Ok(false)` without sending when `lsn` is not ahead of the
    /// acknowledged position, and `Ok(true)` once an advancing update was
    /// written to the connection.
    pub async fn acknowledge(&self, lsn: Lsn) -> Result<bool> {
        let state = self.state();
        if !matches!(state, SessionState::Subscribing | SessionState::Streaming) {
            return Err(Error::InvalidState {
                expected: "subscribing or streaming",
                actual: state.to_string(),
            });
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Acknowledge { lsn, reply })
            .await
            .map_err(|_| Error::Acknowledgment("session is no longer running".to_string()))?;

        response.await.map_err(|_| {
            Error::Acknowledgment("session stopped before acknowledging".to_string())
        })?
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Waits until the session reaches `state` or a later one.
    pub async fn wait_for(&mut self, state: SessionState) -> SessionState {
        match self.state.wait_for(|current| *current >= state).await {
            Ok(current) => *current,
            Err(_) => SessionState::Stopped,
        }
    }

    pub fn last_seen(&self) -> Option<Lsn> {
        self.tracker.last_seen()
    }

    pub fn acknowledged(&self) -> Lsn {
        self.tracker.acknowledged()
    }

    pub(crate) fn tracker(&self) -> &LsnTracker {
        &self.tracker
    }
}

pub struct ReplicationSession<C: ReplicationConnection> {
    connection: Option<C>,
    config: AcknowledgmentConfig,
    tracker: Arc<LsnTracker>,
    state: Arc<watch::Sender<SessionState>>,
    handle: SessionHandle,
    commands: Option<mpsc::Receiver<Command>>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    scheduler: Option<AckScheduler>,
}

impl<C: ReplicationConnection> ReplicationSession<C> {
    pub fn new(connection: C, config: AcknowledgmentConfig) -> Self {
        let tracker = Arc::new(LsnTracker::new());
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            tracker: tracker.clone(),
        };

        Self {
            connection: Some(connection),
            config,
            tracker,
            state: Arc::new(state_tx),
            handle,
            commands: Some(command_rx),
            cancel: CancellationToken::new(),
            driver: None,
            scheduler: None,
        }
    }

    /// Starts replication from `slot_name` and begins streaming.
    ///
    /// Only valid on a fresh session. If the server rejects the start command
    /// the session ends in `Stopped`.
    pub async fn subscribe(
        &mut self,
        decoder: Box<dyn Decoder>,
        slot_name: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<SessionEvents> {
        let state = self.state();
        let (mut connection, commands) = match (state, self.connection.take(), self.commands.take()) {
            (SessionState::Idle, Some(connection), Some(commands)) => (connection, commands),
            (_, connection, commands) => {
                self.connection = connection;
                self.commands = commands;
                return Err(Error::InvalidState {
                    expected: "idle",
                    actual: state.to_string(),
                });
            }
        };

        let slot_name = slot_name.into();
        let mut plugin_options = decoder.plugin_options();
        plugin_options.extend(options.plugin_options);

        let command = StartReplication {
            slot_name: slot_name.clone(),
            plugin: decoder.plugin().to_string(),
            start_lsn: options.start_lsn.unwrap_or(Lsn::ZERO),
            options: plugin_options,
            create_slot: options.create_slot,
            temporary_slot: options.temporary_slot,
        };

        transition(&self.state, SessionState::Subscribing);
        info!(slot = %slot_name, plugin = %command.plugin, "Subscribing to replication slot");

        if let Err(e) = connection.start_replication(&command).await {
            error!(slot = %slot_name, "Failed to start replication: {}", e);
            if let Err(close_error) = connection.close().await {
                warn!("Error closing replication connection: {}", close_error);
            }
            transition(&self.state, SessionState::Stopped);
            return Err(e);
        }

        let now = Instant::now();
        if let Some(start) = options.start_lsn {
            self.tracker.observe(start);
            self.tracker.record_ack(start, now);
        }
        self.tracker.touch(now);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            connection,
            decoder,
            tracker: self.tracker.clone(),
            state: self.state.clone(),
            events: events_tx.clone(),
            commands,
            cancel: self.cancel.clone(),
            slot_name,
        };
        self.driver = Some(tokio::spawn(driver.run()));

        self.scheduler = Some(AckScheduler::spawn(
            self.config,
            self.handle.clone(),
            events_tx,
            self.cancel.child_token(),
        ));

        Ok(events_rx)
    }

    /// See [`SessionHandle::acknowledge`].
    pub async fn acknowledge(&self, lsn: Lsn) -> Result<bool> {
        self.handle.acknowledge(lsn).await
    }

    /// Stops the scheduler and the read loop and closes the connection.
    ///
    /// Takes effect while the read loop is blocked waiting for a frame. Calling
    /// it on a stopped session does nothing.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state() == SessionState::Stopped && self.driver.is_none() {
            return Ok(());
        }

        transition(&self.state, SessionState::Stopping);
        info!("Stopping replication session");

        if let Some(scheduler) = self.scheduler.take() {
            scheduler.cancel().await;
        }
        self.cancel.cancel();

        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!("Replication read loop failed: {}", e);
            }
        }

        if let Some(mut connection) = self.connection.take() {
            connection.close().await?;
        }

        transition(&self.state, SessionState::Stopped);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn last_seen(&self) -> Option<Lsn> {
        self.tracker.last_seen()
    }

    pub fn acknowledged(&self) -> Lsn {
        self.tracker.acknowledged()
    }

    pub fn config(&self) -> &AcknowledgmentConfig {
        &self.config
    }

    /// Acknowledgments started by the scheduler, including no-ops and failures.
    pub fn scheduled_acknowledgments(&self) -> u64 {
        self.scheduler.as_ref().map_or(0, AckScheduler::attempts)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }
}

impl<C: ReplicationConnection> Drop for ReplicationSession<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Lifecycle only moves forward.
fn transition(state: &watch::Sender<SessionState>, to: SessionState) {
    state.send_if_modified(|current| {
        if to <= *current {
            return false;
        }
        info!("Session state: {} -> {}", current, to);
        *current = to;
        true
    });
}

/// Owns the connection and the decoder for the lifetime of the stream.
struct Driver<C> {
    connection: C,
    decoder: Box<dyn Decoder>,
    tracker: Arc<LsnTracker>,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    slot_name: String,
}

impl<C: ReplicationConnection> Driver<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Read loop cancelled");
                    break;
                }
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                frame = self.connection.recv_frame() => match frame {
                    Ok(Some(data)) => self.handle_frame(data).await,
                    Ok(None) => {
                        self.fail(Error::Transport("server ended the replication stream".to_string()));
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        self.fail(e);
                        break;
                    }
                    Err(e) => {
                        warn!("Skipping unreadable frame: {}", e);
                        self.publish(SessionEvent::Error(e));
                    }
                },
            }
        }

        self.cancel.cancel();
        if let Err(e) = self.connection.close().await {
            warn!("Error closing replication connection: {}", e);
        }
        transition(&self.state, SessionState::Stopped);
        info!(slot = %self.slot_name, "Replication stream closed");
        self.publish(SessionEvent::Ended);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Acknowledge { lsn, reply } => {
                let result = self.acknowledge(lsn, false).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_frame(&mut self, data: bytes::Bytes) {
        transition(&self.state, SessionState::Streaming);

        let frame = match ReplicationFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping malformed frame: {}", e);
                self.publish(SessionEvent::Error(e));
                return;
            }
        };

        let lsn = frame.lsn();

        match frame {
            ReplicationFrame::XLogData { payload, .. } => {
                trace!(lsn = %lsn, "XLogData of {} bytes", payload.len());
                match self.decoder.decode(&payload) {
                    Ok(Some(event)) => {
                        self.tracker.observe(lsn);
                        self.publish(SessionEvent::Data { lsn, event });
                    }
                    Ok(None) => self.tracker.observe(lsn),
                    Err(e) => {
                        warn!(lsn = %lsn, "Failed to decode change: {}", e);
                        self.publish(SessionEvent::Error(e));
                    }
                }
            }
            ReplicationFrame::PrimaryKeepalive {
                reply_requested, ..
            } => {
                debug!(lsn = %lsn, reply_requested, "Primary keepalive");
                self.tracker.observe(lsn);
                if reply_requested {
                    if let Err(e) = self.acknowledge(lsn, true).await {
                        warn!(lsn = %lsn, "Failed to answer keepalive: {}", e);
                        self.publish(SessionEvent::Error(Error::acknowledgment_failed(lsn, e)));
                    }
                }
            }
        }
    }

    /// Acknowledges `lsn` unless it is behind the acknowledged position.
    /// A requested keepalive reply is sent even when the position did not
    /// move, at the acknowledged position.
    async fn acknowledge(&mut self, lsn: Lsn, reply_requested: bool) -> Result<bool> {
        let acknowledged = self.tracker.acknowledged();

        let target = if lsn > acknowledged {
            lsn
        } else if reply_requested {
            acknowledged
        } else {
            trace!(lsn = %lsn, acknowledged = %acknowledged, "Nothing new to acknowledge");
            return Ok(false);
        };

        if let Some(last_seen) = self.tracker.last_seen() {
            if target > last_seen {
                return Err(Error::Acknowledgment(format!(
                    "{} is ahead of the last received position {}",
                    target, last_seen
                )));
            }
        } else if !target.is_zero() {
            return Err(Error::Acknowledgment(format!(
                "{} acknowledged before any position was received",
                target
            )));
        }

        let update = StandbyStatusUpdate::at(target, Utc::now());
        self.connection.send_frame(update.encode()).await?;
        self.tracker.record_ack(target, Instant::now());

        debug!(lsn = %target, "Sent standby status update");
        Ok(target > acknowledged)
    }

    /// Reports a fatal error once; the loop exits right after.
    fn fail(&mut self, error: Error) {
        error!(slot = %self.slot_name, "Replication stream failed: {}", error);
        self.publish(SessionEvent::Error(error));
    }

    fn publish(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("No listener for session events");
        }
    }
}
