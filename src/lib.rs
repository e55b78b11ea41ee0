//! ccore - core runtime for a hierarchical, interactive multi-agent
//! orchestration system: session tree, interactive subagent loop, atomic
//! file transactions, escalating retry, and structured logging.
//!
//! This crate is the engine room only — no CLI, no TUI, no wire protocol.
//! Host applications embed it and drive it through [`session::SessionManager`].

#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::module_inception)]
#![allow(clippy::needless_borrows_for_generic_args)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod retry;
pub mod session;
pub mod transaction;

pub use config::RuntimeConfig;
pub use error::CcoreError;
pub use event::{Event, EventBus, SessionEvent, SubagentEvent};
pub use logging::{get_logger, init_logger, Logger, LoggerOptions};
pub use session::{SessionId, SessionManager, SessionStatus};
