//! Typed, synchronous event fan-out (C8).
//!
//! Events are a tagged union rather than a string-keyed dispatch (Design
//! Note "Ad-hoc event emission"). Subscribers are plain closures held in a
//! `Mutex`-guarded list; [`EventBus::subscribe`] returns a
//! [`SubscriptionHandle`] whose `Drop` detaches the listener deterministically
//! (Design Note "EventEmitter subclasses leaking listener lifecycles") —
//! nothing here relies on garbage collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{SessionId, SessionNode};

/// Session-level events emitted by [`crate::session::SessionManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    SessionStarted { node: SessionNode },
    SessionSwitched { from: Option<SessionId> },
    SessionPaused,
    SessionResumed,
    SessionCompleted {
        result: Option<Value>,
        terminate_reason: Option<String>,
    },
    SessionAborted { reason: Option<String> },
    UserMessageToSession { text: String },
    SubagentMessageToUser {
        text_chunk: Option<String>,
        final_text: Option<String>,
    },
}

/// Subagent-round events emitted by [`crate::session::scope::InteractiveSubagentScope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SubagentEvent {
    Start,
    RoundStart { round: u64, prompt_id: String },
    StreamText { text: String },
    ToolCall { name: String, call_id: String },
    ToolResult {
        call_id: String,
        success: bool,
        summary: Option<String>,
    },
    ToolWaitingApproval { call_id: String },
    RoundEnd { round: u64 },
    Finish { stats: Option<Value> },
    Error { message: String },
}

/// One envelope carrying a session or subagent event, always stamped with
/// the originating session id and a timestamp (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventKind {
    Session(SessionEvent),
    Subagent(SubagentEvent),
}

impl Event {
    pub fn session(session_id: SessionId, event: SessionEvent) -> Self {
        Self {
            session_id,
            timestamp: Utc::now(),
            kind: EventKind::Session(event),
        }
    }

    pub fn subagent(session_id: SessionId, event: SubagentEvent) -> Self {
        Self {
            session_id,
            timestamp: Utc::now(),
            kind: EventKind::Subagent(event),
        }
    }
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: u64,
    listener: Listener,
}

/// Synchronous fan-out of [`Event`]s to any number of listeners.
///
/// Listeners are invoked in subscription order on the emitting thread. A
/// listener that panics is caught (via [`std::panic::catch_unwind`]) and
/// logged rather than allowed to abort the emission loop for the remaining
/// listeners (spec §4.6's "listener exception policy").
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener, returning a handle that detaches it on drop.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().unwrap().push(Subscription {
            id,
            listener: Box::new(listener),
        });
        SubscriptionHandle {
            id,
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }

    /// Emits `event` to every current listener, synchronously, in
    /// subscription order.
    pub fn emit(&self, event: Event) {
        let subs = self.subscriptions.lock().unwrap();
        for sub in subs.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (sub.listener)(&event);
            }));
            if let Err(_) = result {
                tracing::error!(
                    subscription_id = sub.id,
                    "event listener panicked; continuing emission"
                );
            }
        }
    }
}

/// Detaches its listener from the owning [`EventBus`] on drop.
pub struct SubscriptionHandle {
    id: u64,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.subscriptions.lock().unwrap().retain(|s| s.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering as AtOrdering};

    #[test]
    fn listeners_are_invoked_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let _h1 = bus.subscribe(move |_| o1.lock().unwrap().push(1));
        let o2 = Arc::clone(&order);
        let _h2 = bus.subscribe(move |_| o2.lock().unwrap().push(2));

        bus.emit(Event::session(
            SessionId::new("root"),
            SessionEvent::SessionPaused,
        ));

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn dropping_handle_detaches_listener() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = bus.subscribe(move |_| {
            c.fetch_add(1, AtOrdering::SeqCst);
        });

        bus.emit(Event::session(
            SessionId::new("root"),
            SessionEvent::SessionPaused,
        ));
        assert_eq!(count.load(AtOrdering::SeqCst), 1);

        drop(handle);

        bus.emit(Event::session(
            SessionId::new("root"),
            SessionEvent::SessionPaused,
        ));
        assert_eq!(count.load(AtOrdering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_emission() {
        let bus = EventBus::new();
        let _h1 = bus.subscribe(|_| panic!("boom"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _h2 = bus.subscribe(move |_| {
            c.fetch_add(1, AtOrdering::SeqCst);
        });

        bus.emit(Event::session(
            SessionId::new("root"),
            SessionEvent::SessionPaused,
        ));

        assert_eq!(count.load(AtOrdering::SeqCst), 1);
    }
}
