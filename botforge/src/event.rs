//! Events flowing into and out of the orchestrator.
//!
//! Background sources (build socket, runtime log stream, countdown timer)
//! never touch session state. They post an [`Inbound`] tagged with the
//! epoch/generation of the resource that produced it, and the orchestrator
//! applies it in arrival order. Observers receive [`SessionEvent`]s.

use botforge_sdk::LogEntry;

use crate::logs::Phase;
use crate::runtime_session::RuntimeState;
use crate::session::BuildState;

/// Something a background task observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// From the build connection opened for `epoch`.
    Build { epoch: u64, event: BuildEvent },
    /// From the runtime stream or timer armed for `generation`.
    Runtime { generation: u64, event: RuntimeEvent },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// A progress line, forwarded verbatim.
    Log(String),
    /// The attempt's single outcome.
    Finished(BuildOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Succeeded { image: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Log(LogEntry),
    /// One second of the countdown elapsed.
    Tick,
    Disconnected { reason: String },
}

/// What observers of a session see.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: BuildState, to: BuildState },
    RuntimeChanged { from: RuntimeState, to: RuntimeState },
    Log { phase: Phase, entry: LogEntry },
    RepairApplied {
        attempt: u32,
        confidence: f64,
        summaries: Vec<String>,
    },
    RuntimeStartFailed { message: String },
}
