//! Session tree data model (C4, C5) — see spec §3 and §4.4/§4.5.

pub mod manager;
pub mod scope;
mod store;

pub use manager::SessionManager;
pub use scope::{ChatClient, InteractiveSubagentScope, StreamEvent, ToolRegistry};
pub use store::SessionStore;

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque, process-unique session identifier. Callers must not parse it —
/// the `<name>-<suffix>` shape is a debugging aid only (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Builds an id directly from a string (used by tests and for
    /// deserializing ids received from elsewhere).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generates a fresh id of the form `<name>-<6-char-random>`. A
    /// process-wide monotonic counter is folded into the random suffix so
    /// that even very long-running processes don't collide in practice,
    /// without changing the externally visible `<name>-<suffix>` shape
    /// (spec §9 open question: "session id uniqueness").
    pub fn generate(name: &str) -> Self {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut rng = rand::rng();
        let random_part: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        let slug = slugify(name);
        Self(format!("{}-{:x}{}", slug, n & 0xf, random_part))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a [`SessionNode`]. `Completed` and `Aborted` are
/// terminal — no node may transition out of them (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Immutable-once-set per-session configuration (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentSessionConfig {
    pub interactive: bool,
    pub max_depth: u32,
    pub auto_switch: bool,
    pub inherit_context: bool,
    pub allow_user_interaction: bool,
}

impl Default for SubagentSessionConfig {
    fn default() -> Self {
        Self {
            interactive: false,
            max_depth: 1,
            auto_switch: false,
            inherit_context: false,
            allow_user_interaction: false,
        }
    }
}

/// A node in the session tree (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNode {
    pub id: SessionId,
    pub name: String,
    pub subagent_name: Option<String>,
    pub depth: u32,
    pub status: SessionStatus,
    pub parent_id: Option<SessionId>,
    pub children: Vec<SessionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: SubagentSessionConfig,
}

/// Per-session keyed state (C5). Construction from a parent MUST copy
/// every key/value the parent holds at that instant — afterwards parent
/// and child are fully independent (spec §4.5).
#[derive(Debug, Default)]
pub struct SessionContext {
    values: RwLock<HashMap<String, Value>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context by copying every key/value currently held by
    /// `parent`. Later mutations of `parent` do not propagate (spec §3).
    pub fn inherit_from(parent: &SessionContext) -> Self {
        let copied = parent.values.read().unwrap().clone();
        Self {
            values: RwLock::new(copied),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.write().unwrap().insert(key.into(), value);
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().unwrap().keys().cloned().collect()
    }

    /// Snapshot of every key/value, used by the logger to attach session
    /// context to a record and by tests to assert on full state.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_embed_the_given_name() {
        let id = SessionId::generate("root");
        assert!(id.as_str().starts_with("root-"));
    }

    #[test]
    fn terminal_statuses_are_recognized() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn context_inheritance_is_a_one_shot_copy() {
        let parent = SessionContext::new();
        parent.set("project", Value::String("P".into()));
        parent.set("tech", Value::String("T".into()));

        let child = SessionContext::inherit_from(&parent);
        assert_eq!(child.get("project"), Some(Value::String("P".into())));
        assert_eq!(child.get("tech"), Some(Value::String("T".into())));

        parent.set("project", Value::String("P2".into()));
        assert_eq!(child.get("project"), Some(Value::String("P".into())));

        child.set("project", Value::String("C".into()));
        assert_eq!(parent.get("project"), Some(Value::String("P2".into())));
    }
}
