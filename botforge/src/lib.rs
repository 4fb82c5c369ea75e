//! botforge: turns a plain-language bot description into a running bot.
//!
//! One [`orchestrator::Orchestrator`] owns one session and walks it through
//! validation, secret gathering, planning, code generation, container builds
//! with a bounded repair loop, and a time-limited run. Collaborators live in
//! `botforge-sdk`; this crate holds the lifecycle and its state.

pub mod build_client;
pub mod compiler;
pub mod config;
pub mod debug_loop;
pub mod error;
pub mod event;
pub mod llm;
pub mod logs;
pub mod orchestrator;
pub mod output;
pub mod runtime_session;
pub mod session;

pub use error::LifecycleError;
pub use event::SessionEvent;
pub use orchestrator::{Collaborators, Limits, Orchestrator, StartRequest};
pub use session::{Access, BuildState, FileView};
