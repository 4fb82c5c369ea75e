//! Build executor client: one live connection per session.
//!
//! Each attempt gets a fresh epoch. The connection is driven by a spawned
//! task that forwards progress lines and exactly one outcome into the
//! orchestrator's inbox. Opening a new attempt supersedes the previous one,
//! and [`BuildExecutorClient::accept`] drops anything the superseded
//! connection still manages to post.

use std::sync::Arc;
use std::time::Duration;

use botforge_sdk::ExecutorEvent;
use botforge_sdk::executor::{
    BuildConnection, BuildRequest, BuildTransport, CLOSE_CLIENT_TIMEOUT, CLOSE_NORMAL,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::event::{BuildEvent, BuildOutcome, Inbound};

/// Default time a single attempt may take before it is abandoned.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(120);

struct ActiveBuild {
    epoch: u64,
    resolved: bool,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct BuildExecutorClient {
    transport: Arc<dyn BuildTransport>,
    inbox: mpsc::UnboundedSender<Inbound>,
    watchdog: Duration,
    epoch: u64,
    active: Option<ActiveBuild>,
}

impl BuildExecutorClient {
    pub fn new(
        transport: Arc<dyn BuildTransport>,
        inbox: mpsc::UnboundedSender<Inbound>,
        watchdog: Duration,
    ) -> Self {
        Self {
            transport,
            inbox,
            watchdog,
            epoch: 0,
            active: None,
        }
    }

    /// Start a build attempt, closing any previous connection first.
    /// Returns the new attempt's epoch.
    pub fn open(&mut self, request: BuildRequest) -> u64 {
        self.supersede();
        self.epoch += 1;
        let epoch = self.epoch;
        let files = request.files.len();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(drive_attempt(
            self.transport.clone(),
            request,
            epoch,
            self.watchdog,
            cancel_rx,
            self.inbox.clone(),
        ));
        tracing::info!(epoch, files, "Build attempt opened");
        self.active = Some(ActiveBuild {
            epoch,
            resolved: false,
            cancel: Some(cancel_tx),
            task,
        });
        epoch
    }

    /// Close the live connection, if any, with a normal close code. Events it
    /// already queued are dropped by [`accept`](Self::accept).
    pub fn supersede(&mut self) {
        if let Some(active) = self.active.take() {
            if let Some(cancel) = active.cancel {
                let _ = cancel.send(());
            }
            tracing::debug!(epoch = active.epoch, "Build connection superseded");
        }
    }

    /// Whether an attempt is open and has not produced its outcome yet.
    pub fn is_live(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.resolved)
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.epoch)
    }

    /// Gate an inbound build event. Returns it only when it belongs to the
    /// current attempt and that attempt has not resolved yet.
    pub fn accept(&mut self, epoch: u64, event: BuildEvent) -> Option<BuildEvent> {
        let active = self.active.as_mut()?;
        if active.epoch != epoch || active.resolved {
            tracing::trace!(epoch, current = active.epoch, "Dropping stale build event");
            return None;
        }
        if matches!(event, BuildEvent::Finished(_)) {
            active.resolved = true;
            active.cancel = None;
        }
        Some(event)
    }
}

impl Drop for BuildExecutorClient {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

/// Folds the executor's events for one attempt into a single outcome.
#[derive(Debug, Default)]
struct AttemptTracker {
    error_lines: Vec<String>,
    decided: bool,
}

impl AttemptTracker {
    /// Remember lines that look like errors. They become the failure message
    /// when the executor reports a failure without one.
    fn observe(&mut self, line: &str) {
        if line.to_ascii_lowercase().contains("error") {
            self.error_lines.push(line.to_string());
        }
    }

    fn fallback(&self, default: &str) -> String {
        if self.error_lines.is_empty() {
            default.to_string()
        } else {
            self.error_lines.join("\n")
        }
    }

    /// Outcome for a terminal event. Only the first call returns `Some`.
    fn resolve(&mut self, event: ExecutorEvent) -> Option<BuildOutcome> {
        if self.decided {
            return None;
        }
        let outcome = match event {
            ExecutorEvent::Log(line) => {
                self.observe(&line);
                return None;
            }
            ExecutorEvent::Done { image } => BuildOutcome::Succeeded { image },
            ExecutorEvent::Failed { message } if !message.trim().is_empty() => {
                BuildOutcome::Failed { message }
            }
            ExecutorEvent::Failed { .. } => BuildOutcome::Failed {
                message: self.fallback("build failed"),
            },
            ExecutorEvent::Closed { code, .. } if code == CLOSE_NORMAL => BuildOutcome::Failed {
                message: self.fallback("connection closed before the build finished"),
            },
            ExecutorEvent::Closed { code, reason } => {
                let mut message = format!("connection closed unexpectedly (code {code})");
                if !reason.is_empty() {
                    message.push_str(&format!(": {reason}"));
                }
                if !self.error_lines.is_empty() {
                    message.push('\n');
                    message.push_str(&self.error_lines.join("\n"));
                }
                BuildOutcome::Failed { message }
            }
            ExecutorEvent::TransportError(e) => BuildOutcome::Failed {
                message: format!("build connection error: {e}"),
            },
        };
        self.decided = true;
        Some(outcome)
    }

    fn timeout(&mut self, watchdog: Duration) -> Option<BuildOutcome> {
        if self.decided {
            return None;
        }
        self.decided = true;
        Some(BuildOutcome::Failed {
            message: format!("build timed out after {}s", watchdog.as_secs()),
        })
    }
}

async fn drive_attempt(
    transport: Arc<dyn BuildTransport>,
    request: BuildRequest,
    epoch: u64,
    watchdog: Duration,
    mut cancel: oneshot::Receiver<()>,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    let emit = |event: BuildEvent| {
        let _ = inbox.send(Inbound::Build { epoch, event });
    };
    let mut tracker = AttemptTracker::default();
    let deadline = tokio::time::sleep(watchdog);
    tokio::pin!(deadline);

    let mut conn: Box<dyn BuildConnection> = tokio::select! {
        _ = &mut cancel => return,
        _ = &mut deadline => {
            if let Some(outcome) = tracker.timeout(watchdog) {
                emit(BuildEvent::Finished(outcome));
            }
            return;
        }
        opened = transport.open(&request) => match opened {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(epoch, error = %e, "Could not open build connection");
                emit(BuildEvent::Finished(BuildOutcome::Failed {
                    message: format!("could not reach build executor: {}", e.message()),
                }));
                return;
            }
        }
    };

    loop {
        tokio::select! {
            _ = &mut cancel => {
                conn.close(CLOSE_NORMAL, "superseded").await;
                return;
            }
            _ = &mut deadline => {
                tracing::warn!(epoch, secs = watchdog.as_secs(), "Build watchdog fired");
                conn.close(CLOSE_CLIENT_TIMEOUT, "client timeout").await;
                if let Some(outcome) = tracker.timeout(watchdog) {
                    emit(BuildEvent::Finished(outcome));
                }
                return;
            }
            event = conn.next_event() => {
                let event = event.unwrap_or(ExecutorEvent::Closed {
                    code: 1006,
                    reason: "stream ended".into(),
                });
                if let ExecutorEvent::Log(line) = event {
                    tracker.observe(&line);
                    emit(BuildEvent::Log(line));
                    continue;
                }
                if let Some(outcome) = tracker.resolve(event) {
                    conn.close(CLOSE_NORMAL, "done").await;
                    emit(BuildEvent::Finished(outcome));
                }
                return;
            }
        }
    }
}
