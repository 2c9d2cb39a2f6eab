//! Background sync tasks.
//!
//! Two cooperating tasks per session: the feeder listens to the change log
//! and wakes the protocol task whenever a local operation is appended; the
//! protocol task runs rounds on wake-up or when the poll interval elapses,
//! backing off exponentially after failed or throttled rounds.

use super::{Backoff, RoundReport, SyncSession};
use crate::error::{ReplicaError, Result};
use concord_engine::OperationId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ARCHIVE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Handle to a running sync session.
pub struct SyncDriver {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    reports: watch::Receiver<Option<RoundReport>>,
    protocol: JoinHandle<SyncSession>,
    feeder: JoinHandle<()>,
}

impl SyncDriver {
    /// Start syncing in the background.
    pub fn spawn(session: SyncSession) -> Self {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let (report_tx, reports) = watch::channel(None);

        let appended = session.replica().change_log().subscribe();
        let feeder = tokio::spawn(feed(appended, wake.clone(), cancel.clone()));
        let protocol = tokio::spawn(drive(session, wake.clone(), cancel.clone(), report_tx));

        Self {
            cancel,
            wake,
            reports,
            protocol,
            feeder,
        }
    }

    /// Run a round now instead of waiting for the poll interval.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Latest round report.
    pub fn reports(&self) -> watch::Receiver<Option<RoundReport>> {
        self.reports.clone()
    }

    /// Stop both tasks and hand the session back.
    pub async fn shutdown(self) -> Result<SyncSession> {
        self.cancel.cancel();
        let _ = self.feeder.await;
        self.protocol
            .await
            .map_err(|e| ReplicaError::Protocol(format!("sync task failed: {e}")))
    }
}

async fn feed(
    mut appended: broadcast::Receiver<OperationId>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = appended.recv() => match received {
                Ok(op_id) => {
                    debug!(%op_id, "Local operation queued for sync");
                    wake.notify_one();
                }
                // Missed ids do not matter, the round reads the log
                Err(broadcast::error::RecvError::Lagged(_)) => wake.notify_one(),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn drive(
    mut session: SyncSession,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    reports: watch::Sender<Option<RoundReport>>,
) -> SyncSession {
    let tuning = session.replica().config().sync.clone();
    let mut backoff = Backoff::new(tuning.backoff_base(), tuning.backoff_cap());
    let mut delay = Duration::ZERO;
    let mut last_archive: Option<Instant> = None;

    info!(peer = %session.peer(), "Sync driver started");
    loop {
        let backing_off = backoff.failures() > 0;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified(), if !backing_off => {}
            _ = tokio::time::sleep(delay) => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = timeout(tuning.round_timeout(), session.run_round()) => Some(result),
        };
        let Some(outcome) = outcome else { break };

        delay = match outcome {
            Ok(Ok(report)) => {
                let clean = report.is_clean();
                reports.send_replace(Some(report));
                if clean {
                    backoff.reset();
                    tuning.poll_interval()
                } else {
                    backoff.next_delay()
                }
            }
            Ok(Err(e)) => {
                let delay = backoff.next_delay();
                debug!(
                    error = %e,
                    retryable = e.is_retryable(),
                    delay_ms = delay.as_millis() as u64,
                    "Backing off"
                );
                delay
            }
            Err(_) => {
                session.abort(&ReplicaError::Timeout(tuning.round_timeout()));
                backoff.next_delay()
            }
        };

        if last_archive.map_or(true, |at| at.elapsed() >= ARCHIVE_INTERVAL) {
            last_archive = Some(Instant::now());
            if let Err(e) = session.replica().archive_expired_conflicts().await {
                warn!(error = %e, "Failed to archive expired conflicts");
            }
        }
    }

    session.disconnect();
    info!(peer = %session.peer(), "Sync driver stopped");
    session
}
