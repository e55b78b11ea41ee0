//! Crate-wide error taxonomy.
//!
//! The runtime distinguishes structural misuse of the public API (always
//! synchronous and always fatal to the call that triggered it) from the
//! recoverable/warning/critical errors raised while a session is running.
//! See spec §7 for the full severity mapping.

use thiserror::Error;

/// Structural errors thrown synchronously by [`crate::session::SessionManager`]
/// and [`crate::session::SessionStore`].
///
/// These are always *critical*: the retry engine must never re-attempt an
/// operation that failed with one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct SessionError {
    pub code: SessionErrorCode,
    pub message: String,
}

impl SessionError {
    pub fn new(code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Stable, matchable codes for [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorCode {
    DuplicateSession,
    SessionNotFound,
    MaxDepthExceeded,
    ContextNotFound,
    ParentNotFound,
    InvalidTransition,
}

impl std::fmt::Display for SessionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionErrorCode::DuplicateSession => "DUPLICATE_SESSION",
            SessionErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            SessionErrorCode::MaxDepthExceeded => "MAX_DEPTH_EXCEEDED",
            SessionErrorCode::ContextNotFound => "CONTEXT_NOT_FOUND",
            SessionErrorCode::ParentNotFound => "PARENT_NOT_FOUND",
            SessionErrorCode::InvalidTransition => "INVALID_TRANSITION",
        };
        write!(f, "{}", s)
    }
}

/// Agent/tool-dispatch errors surfaced by the interactive subagent scope.
///
/// Unlike [`SessionError`], these are recoverable by default — only
/// [`AgentError::ChatClientInit`] is critical (the spec requires the scope
/// to treat a failed chat-object construction as unrecoverable).
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to construct chat client: {0}")]
    ChatClientInit(String),

    #[error("chat client call failed: {0}")]
    ChatClient(String),

    #[error("tool dispatch failed for '{tool}': {message}")]
    ToolDispatch { tool: String, message: String },
}

impl AgentError {
    /// Per spec §7: only construction failures are critical.
    pub fn is_critical(&self) -> bool {
        matches!(self, AgentError::ChatClientInit(_))
    }
}

/// File-operation errors raised by the transaction engine.
///
/// Always recoverable; the transaction engine never propagates these as
/// Rust errors past `commit` — they are carried inside
/// [`crate::transaction::CommitResult`] instead. The type still implements
/// `std::error::Error` so it composes with `?` inside the engine's own
/// staging/commit helpers.
#[derive(Error, Debug, Clone)]
#[error("{operation} failed on '{path}': {cause}")]
pub struct FileOperationError {
    pub operation: &'static str,
    pub path: String,
    pub cause: String,
}

impl FileOperationError {
    pub fn new(operation: &'static str, path: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            operation,
            path: path.into(),
            cause: cause.to_string(),
        }
    }
}

/// Malformed input to a public operation. Warning severity, never retried.
#[derive(Error, Debug, Clone)]
#[error("validation error: {0}")]
pub struct ValidationError(pub String);

/// Token/budget limit exceeded mid-round. Recoverable — the host may prune
/// context and retry.
#[derive(Error, Debug, Clone)]
#[error("context overflow: {0}")]
pub struct ContextOverflowError(pub String);

/// Umbrella error for code paths that need one error type across kinds
/// (e.g. the retry engine's generic operation signature).
#[derive(Error, Debug)]
pub enum CcoreError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    FileOperation(#[from] FileOperationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ContextOverflow(#[from] ContextOverflowError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CcoreError {
    /// Severity mapping per spec §7.
    pub fn is_critical(&self) -> bool {
        match self {
            CcoreError::Session(_) => true,
            CcoreError::Agent(e) => e.is_critical(),
            CcoreError::Validation(_) => false,
            _ => false,
        }
    }

    /// Whether the retry engine is allowed to attempt this again.
    pub fn is_retryable(&self) -> bool {
        !self.is_critical() && !matches!(self, CcoreError::Validation(_))
    }
}
