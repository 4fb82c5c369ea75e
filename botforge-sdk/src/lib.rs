//! botforge-sdk: clients for the collaborators a bot build session talks to.
//!
//! - [`executor`]: build executor over a persistent WebSocket
//! - [`runtime`]: runtime controller over HTTP, with a server-sent log stream
//! - [`verifier`]: bot credential verification (Telegram Bot API)
//! - [`compiler`]: specification compiler contract and data types
//!
//! Every collaborator is a trait so callers can substitute their own transport.

pub mod compiler;
pub mod error;
pub mod event;
pub mod executor;
pub mod runtime;
pub mod sse;
pub mod verifier;

pub use error::{ClientError, ClientResult};
pub use event::{ExecutorEvent, LogEntry, LogKind};
