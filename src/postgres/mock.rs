//! In-memory [`ReplicationConnection`] for exercising sessions without a
//! server.
//!
//! [`MockConnection::new`] returns the connection plus a [`MockServer`]
//! handle. The handle injects inbound frames and inspects what the session
//! sent, and can make sends fail or stall.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;

use super::connection::{ReplicationConnection, StartReplication};
use super::frame::{ReplicationFrame, StandbyStatusUpdate};
use crate::lsn::Lsn;
use crate::{Error, Result};

#[derive(Default)]
struct MockState {
    started: Mutex<Option<StartReplication>>,
    sent: Mutex<Vec<Bytes>>,
    send_attempts: AtomicUsize,
    fail_sends: AtomicBool,
    fail_start: Mutex<Option<String>>,
    send_delay: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

pub struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Result<Option<Bytes>>>,
    state: Arc<MockState>,
}

/// Test-side handle of a [`MockConnection`].
#[derive(Clone)]
pub struct MockServer {
    inbound: mpsc::UnboundedSender<Result<Option<Bytes>>>,
    state: Arc<MockState>,
}

impl MockConnection {
    pub fn new() -> (Self, MockServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState::default());

        (
            Self {
                inbound: rx,
                state: state.clone(),
            },
            MockServer { inbound: tx, state },
        )
    }
}

impl MockServer {
    /// Queues a raw CopyData body.
    pub fn push_frame(&self, frame: Bytes) {
        let _ = self.inbound.send(Ok(Some(frame)));
    }

    /// Queues an XLogData frame starting at `lsn`.
    pub fn push_change(&self, lsn: Lsn, payload: impl Into<Bytes>) {
        let frame = ReplicationFrame::XLogData {
            start_lsn: lsn,
            end_lsn: lsn,
            send_time: Utc::now(),
            payload: payload.into(),
        };
        self.push_frame(frame.encode());
    }

    pub fn push_keepalive(&self, lsn: Lsn, reply_requested: bool) {
        let frame = ReplicationFrame::PrimaryKeepalive {
            end_lsn: lsn,
            send_time: Utc::now(),
            reply_requested,
        };
        self.push_frame(frame.encode());
    }

    /// Makes the next read fail as if the socket broke.
    pub fn push_read_error(&self, error: Error) {
        let _ = self.inbound.send(Err(error));
    }

    /// Ends the copy stream from the server side.
    pub fn end_stream(&self) {
        let _ = self.inbound.send(Ok(None));
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, message: impl Into<String>) {
        *lock(&self.state.fail_start) = Some(message.into());
    }

    /// Every send waits this long before completing.
    pub fn set_send_delay(&self, delay: Duration) {
        *lock(&self.state.send_delay) = Some(delay);
    }

    pub fn started(&self) -> Option<StartReplication> {
        lock(&self.state.started).clone()
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        lock(&self.state.sent).clone()
    }

    /// Successfully sent frames decoded as standby status updates.
    pub fn status_updates(&self) -> Vec<StandbyStatusUpdate> {
        self.sent_frames()
            .into_iter()
            .filter_map(|frame| StandbyStatusUpdate::decode(frame).ok())
            .collect()
    }

    /// Sends attempted, including failed ones.
    pub fn send_attempts(&self) -> usize {
        self.state.send_attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationConnection for MockConnection {
    async fn start_replication(&mut self, command: &StartReplication) -> Result<()> {
        if let Some(message) = lock(&self.state.fail_start).take() {
            return Err(Error::Server(message));
        }
        *lock(&self.state.started) = Some(command.clone());
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        match self.inbound.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        self.state.send_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.state.send_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock send failure".to_string()));
        }

        lock(&self.state.sent).push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
