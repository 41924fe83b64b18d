//! Periodic standby status updates.
//!
//! The scheduler ticks on its own task. On every tick where the session is
//! streaming and the last acknowledgment is older than the configured
//! timeout, it acknowledges the last received position through a
//! [`SessionHandle`]. Each attempt runs in a [`JoinSet`] with its failure
//! handler attached before the tick returns, so a failed or panicked attempt
//! becomes a [`SessionEvent::Error`] instead of an unobserved task failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AcknowledgmentConfig;
use crate::session::{SessionEvent, SessionHandle, SessionState};
use crate::Error;

pub struct AckScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    attempts: Arc<AtomicU64>,
}

impl AckScheduler {
    pub fn spawn(
        config: AcknowledgmentConfig,
        session: SessionHandle,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let attempts = Arc::new(AtomicU64::new(0));

        info!(
            "Starting acknowledgment scheduler: timeout {:?}, tick {:?}",
            config.timeout(),
            config.tick()
        );

        let task = tokio::spawn(run(
            config,
            session,
            events,
            cancel.clone(),
            attempts.clone(),
        ));

        Self {
            cancel,
            task,
            attempts,
        }
    }

    /// Acknowledgments the scheduler has started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Stops the ticker and waits for the tick loop to exit. Attempts still in
    /// flight finish on their own and report through the event channel.
    pub async fn cancel(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Acknowledgment scheduler task failed: {}", e);
        }
        debug!("Acknowledgment scheduler stopped");
    }
}

async fn run(
    config: AcknowledgmentConfig,
    session: SessionHandle,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    attempts: Arc<AtomicU64>,
) {
    let mut ticker = interval(config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut pending = JoinSet::new();
    let in_flight = Arc::new(AtomicBool::new(false));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        reap(&mut pending, &in_flight, &events);

        if !config.auto || session.state() != SessionState::Streaming {
            continue;
        }

        let Some(lsn) = session.last_seen() else {
            continue;
        };

        if !session.tracker().is_stale(config.timeout(), Instant::now()) {
            continue;
        }

        if in_flight.swap(true, Ordering::AcqRel) {
            debug!("Previous acknowledgment still in flight, skipping tick");
            continue;
        }

        attempts.fetch_add(1, Ordering::AcqRel);
        debug!(lsn = %lsn, "Acknowledgment timeout elapsed");

        let session = session.clone();
        let events = events.clone();
        let in_flight = in_flight.clone();

        pending.spawn(async move {
            let result = session.acknowledge(lsn).await;
            in_flight.store(false, Ordering::Release);

            if let Err(e) = result {
                warn!(lsn = %lsn, "Scheduled acknowledgment failed: {}", e);
                let _ = events.send(SessionEvent::Error(Error::acknowledgment_failed(lsn, e)));
            }
        });
    }

    reap(&mut pending, &in_flight, &events);
    pending.detach_all();
}

/// Collects finished attempts. Ordinary failures were already reported by
/// the attempt itself; a panic is reported here.
fn reap(
    pending: &mut JoinSet<()>,
    in_flight: &AtomicBool,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(result) = pending.try_join_next() {
        if let Err(e) = result {
            in_flight.store(false, Ordering::Release);
            error!("Acknowledgment task failed: {}", e);
            let _ = events.send(SessionEvent::Error(Error::Acknowledgment(format!(
                "acknowledgment task failed: {}",
                e
            ))));
        }
    }
}
