//! Runtime session manager: the running bot, its log stream and countdown.
//!
//! Every start arms a new generation. The stream reader and the one-second
//! ticker tag what they post with that generation, so once a run is stopped
//! nothing it left in the inbox can affect the next one.

use std::sync::Arc;
use std::time::Duration;

use botforge_sdk::ClientError;
use botforge_sdk::runtime::{RuntimeController, RuntimeInfo};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::LifecycleError;
use crate::event::{Inbound, RuntimeEvent};

pub const DEFAULT_RUNTIME_DURATION: Duration = Duration::from_secs(600);
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    Running,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Stopped => write!(f, "stopped"),
            RuntimeState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    /// The run was torn down. `warning` carries a controller failure, which
    /// does not keep the local state from moving to stopped.
    Stopped { warning: Option<String> },
}

pub struct RuntimeSessionManager {
    controller: Arc<dyn RuntimeController>,
    inbox: mpsc::UnboundedSender<Inbound>,
    duration: Duration,
    restart_delay: Duration,
    state: RuntimeState,
    countdown: u64,
    generation: u64,
    info: Option<RuntimeInfo>,
    stream_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
}

impl RuntimeSessionManager {
    pub fn new(
        controller: Arc<dyn RuntimeController>,
        inbox: mpsc::UnboundedSender<Inbound>,
        duration: Duration,
        restart_delay: Duration,
    ) -> Self {
        Self {
            controller,
            inbox,
            duration,
            restart_delay,
            state: RuntimeState::Stopped,
            countdown: duration.as_secs(),
            generation: 0,
            info: None,
            stream_task: None,
            timer_task: None,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Seconds left before the running bot is stopped.
    pub fn countdown(&self) -> u64 {
        self.countdown
    }

    pub fn info(&self) -> Option<&RuntimeInfo> {
        self.info.as_ref()
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    pub fn reset_countdown(&mut self) {
        self.countdown = self.duration.as_secs();
    }

    /// Whether an event tagged `generation` belongs to the current run.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state == RuntimeState::Running && generation == self.generation
    }

    /// Start `image`, then attach the log stream and arm the countdown.
    pub async fn start(&mut self, image: &str) -> Result<StartOutcome, LifecycleError> {
        if self.state == RuntimeState::Running {
            return Ok(StartOutcome::AlreadyRunning);
        }
        let info = self.controller.start(image).await.map_err(|e| {
            tracing::warn!(image, error = %e, "Runtime start failed");
            LifecycleError::RuntimeStart(e.message())
        })?;

        self.release();
        self.generation += 1;
        self.countdown = self.duration.as_secs();
        self.state = RuntimeState::Running;
        tracing::info!(
            image,
            generation = self.generation,
            id = info.id.as_deref().unwrap_or("-"),
            "Runtime started"
        );
        self.info = Some(info);
        self.stream_task = Some(tokio::spawn(follow_logs(
            self.controller.clone(),
            self.generation,
            self.inbox.clone(),
        )));
        self.timer_task = Some(tokio::spawn(tick_every_second(
            self.generation,
            self.inbox.clone(),
        )));
        Ok(StartOutcome::Started)
    }

    /// Close the stream, cancel the countdown and ask the controller to stop.
    pub async fn stop(&mut self) -> StopOutcome {
        if self.state == RuntimeState::Stopped {
            return StopOutcome::AlreadyStopped;
        }
        self.release();
        self.generation += 1;
        self.state = RuntimeState::Stopped;
        self.info = None;
        let warning = match self.controller.stop().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Runtime stop request failed");
                Some(e.message())
            }
        };
        tracing::info!(generation = self.generation, "Runtime stopped");
        StopOutcome::Stopped { warning }
    }

    /// Count one second down. Returns true when the time limit is reached.
    pub fn tick(&mut self) -> bool {
        self.countdown = self.countdown.saturating_sub(1);
        self.countdown == 0
    }

    fn release(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        if let Some(task) = self.timer_task.take() {
            task.abort();
        }
    }
}

impl Drop for RuntimeSessionManager {
    fn drop(&mut self) {
        self.release();
    }
}

async fn follow_logs(
    controller: Arc<dyn RuntimeController>,
    generation: u64,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    let send = |event: RuntimeEvent| inbox.send(Inbound::Runtime { generation, event }).is_ok();

    let mut stream = match controller.logs().await {
        Ok(stream) => stream,
        Err(e) => {
            send(RuntimeEvent::Disconnected { reason: e.message() });
            return;
        }
    };
    while let Some(item) = stream.next().await {
        match item {
            Ok(entry) => {
                if !send(RuntimeEvent::Log(entry)) {
                    return;
                }
            }
            Err(ClientError::Decode(e)) => {
                tracing::warn!(generation, error = %e, "Skipping undecodable runtime log entry");
            }
            Err(e) => {
                send(RuntimeEvent::Disconnected { reason: e.message() });
                return;
            }
        }
    }
    send(RuntimeEvent::Disconnected {
        reason: "log stream ended".into(),
    });
}

async fn tick_every_second(generation: u64, inbox: mpsc::UnboundedSender<Inbound>) {
    let period = Duration::from_secs(1);
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticks.tick().await;
        let tick = Inbound::Runtime {
            generation,
            event: RuntimeEvent::Tick,
        };
        if inbox.send(tick).is_err() {
            return;
        }
    }
}
