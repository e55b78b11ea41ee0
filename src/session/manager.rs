//! Public façade coordinating the session store, contexts, scopes, and the
//! event bus (C6) — spec §4.6.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{SessionError, SessionErrorCode};
use crate::event::{Event, EventBus, SessionEvent};
use crate::logging::Logger;

use super::scope::ScopeHandle;
use super::{SessionContext, SessionId, SessionNode, SessionStatus, SessionStore, SubagentSessionConfig};

/// Arguments to [`SessionManager::create_session`].
pub struct CreateSessionArgs {
    pub name: String,
    pub subagent_name: Option<String>,
    pub parent_id: Option<SessionId>,
    pub config: SubagentSessionConfig,
    pub task_prompt: Option<String>,
}

/// The single public façade over C4 (store), C5 (contexts), C7 (scopes)
/// and C8 (event bus).
pub struct SessionManager {
    store: SessionStore,
    contexts: DashMap<SessionId, Arc<SessionContext>>,
    scopes: DashMap<SessionId, ScopeHandle>,
    events: EventBus,
    logger: Arc<Logger>,
}

impl SessionManager {
    pub fn new(logger: Arc<Logger>) -> Arc<Self> {
        Arc::new(Self {
            store: SessionStore::new(),
            contexts: DashMap::new(),
            scopes: DashMap::new(),
            events: EventBus::new(),
            logger,
        })
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Creates a session node and its context. See spec §4.6 for the full
    /// sequencing contract.
    pub fn create_session(&self, args: CreateSessionArgs) -> Result<SessionId, SessionError> {
        let depth = match &args.parent_id {
            Some(parent_id) => {
                let parent_depth = self.store.get_depth(parent_id).ok_or_else(|| {
                    SessionError::new(
                        SessionErrorCode::ParentNotFound,
                        format!("parent session '{}' not found", parent_id),
                    )
                })?;
                parent_depth + 1
            }
            None => 0,
        };

        if depth >= args.config.max_depth {
            return Err(SessionError::new(
                SessionErrorCode::MaxDepthExceeded,
                format!(
                    "depth {} would reach or exceed max_depth {}",
                    depth, args.config.max_depth
                ),
            ));
        }

        let id = SessionId::generate(&args.name);
        let now = Utc::now();
        let node = SessionNode {
            id: id.clone(),
            name: args.name,
            subagent_name: args.subagent_name,
            depth,
            status: SessionStatus::Active,
            parent_id: args.parent_id.clone(),
            children: Vec::new(),
            created_at: now,
            updated_at: now,
            config: args.config.clone(),
        };

        self.store.add_node(node.clone())?;
        self.store.link_child(args.parent_id.as_ref(), &id)?;

        let context = if args.config.inherit_context {
            match &args.parent_id {
                Some(parent_id) => {
                    let parent_ctx = self.contexts.get(parent_id);
                    match parent_ctx {
                        Some(parent_ctx) => SessionContext::inherit_from(&parent_ctx),
                        None => SessionContext::new(),
                    }
                }
                None => SessionContext::new(),
            }
        } else {
            SessionContext::new()
        };

        if let Some(prompt) = &args.task_prompt {
            context.set("task_prompt", Value::String(prompt.clone()));
        }
        self.contexts.insert(id.clone(), Arc::new(context));

        self.events.emit(Event::session(
            id.clone(),
            SessionEvent::SessionStarted { node },
        ));

        if args.config.auto_switch {
            self.switch_active_session(id.clone())?;
        }

        Ok(id)
    }

    /// Pushes `id` onto the active stack, emitting `SESSION_SWITCHED`.
    pub fn switch_active_session(&self, id: SessionId) -> Result<(), SessionError> {
        let from = self.store.get_active();
        self.store.push(id.clone())?;
        self.events
            .emit(Event::session(id, SessionEvent::SessionSwitched { from }));
        Ok(())
    }

    /// Pops the active stack; if a session remains active, emits
    /// `SESSION_SWITCHED` to it. Returns the new active id, if any.
    pub fn back_to_parent(&self) -> Option<SessionId> {
        let popped = self.store.pop()?;
        let new_active = self.store.get_active();
        if let Some(active) = &new_active {
            self.events.emit(Event::session(
                active.clone(),
                SessionEvent::SessionSwitched {
                    from: Some(popped),
                },
            ));
        }
        new_active
    }

    pub fn pause(&self, id: &SessionId) -> Result<(), SessionError> {
        let node = self.require_node(id)?;
        if node.status.is_terminal() {
            return Err(SessionError::new(
                SessionErrorCode::InvalidTransition,
                format!("cannot pause session '{}' in terminal status {}", id, node.status),
            ));
        }
        self.store.set_status(id, SessionStatus::Paused)?;
        self.events
            .emit(Event::session(id.clone(), SessionEvent::SessionPaused));
        Ok(())
    }

    pub fn resume(&self, id: &SessionId) -> Result<(), SessionError> {
        let node = self.require_node(id)?;
        if node.status.is_terminal() {
            return Err(SessionError::new(
                SessionErrorCode::InvalidTransition,
                format!("cannot resume session '{}' in terminal status {}", id, node.status),
            ));
        }
        self.store.set_status(id, SessionStatus::Active)?;
        self.events
            .emit(Event::session(id.clone(), SessionEvent::SessionResumed));
        Ok(())
    }

    pub fn complete(
        &self,
        id: &SessionId,
        result: Option<Value>,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        let node = self.require_node(id)?;
        if node.status.is_terminal() {
            return Err(SessionError::new(
                SessionErrorCode::InvalidTransition,
                format!("cannot complete session '{}' in terminal status {}", id, node.status),
            ));
        }
        self.store.set_status(id, SessionStatus::Completed)?;
        self.events.emit(Event::session(
            id.clone(),
            SessionEvent::SessionCompleted {
                result,
                terminate_reason: reason,
            },
        ));
        self.pop_if_active(id);
        Ok(())
    }

    pub fn abort(&self, id: &SessionId, reason: Option<String>) -> Result<(), SessionError> {
        let node = self.require_node(id)?;
        if node.status.is_terminal() {
            return Err(SessionError::new(
                SessionErrorCode::InvalidTransition,
                format!("cannot abort session '{}' in terminal status {}", id, node.status),
            ));
        }
        self.store.set_status(id, SessionStatus::Aborted)?;
        self.events.emit(Event::session(
            id.clone(),
            SessionEvent::SessionAborted { reason },
        ));
        self.pop_if_active(id);
        Ok(())
    }

    fn pop_if_active(&self, id: &SessionId) {
        if self.store.get_active().as_ref() == Some(id) {
            self.back_to_parent();
        }
    }

    /// Emits `USER_MESSAGE_TO_SESSION`, then forwards to a bound scope's
    /// `enqueue_user_message` if one is registered. No-op beyond the event
    /// otherwise (spec §4.6).
    pub fn send_user_message(&self, id: &SessionId, text: impl Into<String>) {
        let text = text.into();
        self.events.emit(Event::session(
            id.clone(),
            SessionEvent::UserMessageToSession { text: text.clone() },
        ));

        if let Some(scope) = self.scopes.get(id) {
            scope.enqueue_user_message(text);
        }
    }

    /// Registers the scope bound to `id`. Refuses to replace an
    /// already-bound scope — the source's scope-rebinding behavior is
    /// unspecified (spec §9 open question), so this takes the conservative
    /// reading rather than silently orphaning the previous scope's loop.
    /// Use [`SessionManager::rebind_scope`] for an explicit takeover.
    pub fn bind_scope(&self, id: SessionId, scope: ScopeHandle) -> Result<(), SessionError> {
        if self.scopes.contains_key(&id) {
            return Err(SessionError::new(
                SessionErrorCode::InvalidTransition,
                format!("session '{}' already has a bound scope", id),
            ));
        }
        self.scopes.insert(id, scope);
        Ok(())
    }

    /// Forcibly replaces the scope bound to `id`, even if one already
    /// exists. The caller is responsible for shutting down the previous
    /// scope; this call does not signal it.
    pub fn rebind_scope(&self, id: SessionId, scope: ScopeHandle) {
        self.scopes.insert(id, scope);
    }

    /// Cancels the in-flight round of the active session's bound scope, if
    /// any; otherwise logs and returns.
    pub fn cancel_current_message(&self) {
        let Some(active) = self.store.get_active() else {
            self.logger
                .warn("cancel_current_message: no active session", None);
            return;
        };
        match self.scopes.get(&active) {
            Some(scope) => scope.cancel_current_message(),
            None => self
                .logger
                .warn("cancel_current_message: no scope bound to active session", None),
        }
    }

    pub fn get_active_session_id(&self) -> Option<SessionId> {
        self.store.get_active()
    }

    pub fn get_session_node(&self, id: &SessionId) -> Option<SessionNode> {
        self.store.get_node(id)
    }

    pub fn get_tree(&self) -> Vec<SessionNode> {
        self.store.get_tree()
    }

    pub fn get_breadcrumb(&self, id: &SessionId) -> Vec<String> {
        self.store.get_breadcrumb(id)
    }

    pub fn get_depth(&self, id: &SessionId) -> Option<u32> {
        self.store.get_depth(id)
    }

    pub fn has_session(&self, id: &SessionId) -> bool {
        self.store.has(id)
    }

    pub fn get_session_count(&self) -> usize {
        self.store.size()
    }

    pub fn get_stack_depth(&self) -> usize {
        self.store.list().len()
    }

    pub fn get_session_context(&self, id: &SessionId) -> Result<Arc<SessionContext>, SessionError> {
        self.contexts.get(id).map(|r| Arc::clone(&r)).ok_or_else(|| {
            SessionError::new(
                SessionErrorCode::ContextNotFound,
                format!("no context for session '{}'", id),
            )
        })
    }

    fn require_node(&self, id: &SessionId) -> Result<SessionNode, SessionError> {
        self.store.get_node(id).ok_or_else(|| {
            SessionError::new(
                SessionErrorCode::SessionNotFound,
                format!("session '{}' not found", id),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Logger, LoggerOptions};

    fn manager() -> Arc<SessionManager> {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(LoggerOptions::new("test", dir.path()));
        SessionManager::new(logger)
    }

    fn config(max_depth: u32, auto_switch: bool, inherit: bool) -> SubagentSessionConfig {
        SubagentSessionConfig {
            interactive: false,
            max_depth,
            auto_switch,
            inherit_context: inherit,
            allow_user_interaction: false,
        }
    }

    #[test]
    fn s1_root_session_happy_path() {
        let mgr = manager();
        let id = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        assert_eq!(mgr.get_active_session_id(), Some(id.clone()));
        assert_eq!(mgr.get_breadcrumb(&id), vec!["root".to_string()]);
        assert_eq!(mgr.get_depth(&id), Some(0));
    }

    #[test]
    fn s2_depth_limited_nesting() {
        let mgr = manager();
        let root = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        let child1 = mgr
            .create_session(CreateSessionArgs {
                name: "child1".to_string(),
                subagent_name: None,
                parent_id: Some(root.clone()),
                config: config(2, true, false),
                task_prompt: None,
            })
            .unwrap();

        let child2 = mgr
            .create_session(CreateSessionArgs {
                name: "child2".to_string(),
                subagent_name: None,
                parent_id: Some(child1.clone()),
                config: config(2, true, false),
                task_prompt: None,
            })
            .unwrap();

        let err = mgr
            .create_session(CreateSessionArgs {
                name: "child3".to_string(),
                subagent_name: None,
                parent_id: Some(child2.clone()),
                config: config(2, true, false),
                task_prompt: None,
            })
            .unwrap_err();

        assert_eq!(err.code, SessionErrorCode::MaxDepthExceeded);
        assert_eq!(
            mgr.get_breadcrumb(&child2),
            vec!["root".to_string(), "child1".to_string(), "child2".to_string()]
        );
    }

    #[test]
    fn s3_context_inheritance_is_copy_at_creation() {
        let mgr = manager();
        let root = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, false, false),
                task_prompt: None,
            })
            .unwrap();

        let root_ctx = mgr.get_session_context(&root).unwrap();
        root_ctx.set("project", Value::String("P".into()));
        root_ctx.set("tech", Value::String("T".into()));

        let child = mgr
            .create_session(CreateSessionArgs {
                name: "child".to_string(),
                subagent_name: None,
                parent_id: Some(root.clone()),
                config: config(3, false, true),
                task_prompt: None,
            })
            .unwrap();

        root_ctx.set("project", Value::String("P2".into()));

        let child_ctx = mgr.get_session_context(&child).unwrap();
        assert_eq!(child_ctx.get("project"), Some(Value::String("P".into())));
        assert_eq!(child_ctx.get("tech"), Some(Value::String("T".into())));
    }

    #[test]
    fn create_session_round_trip_restores_prior_active() {
        let mgr = manager();
        let root = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        let _child = mgr
            .create_session(CreateSessionArgs {
                name: "child".to_string(),
                subagent_name: None,
                parent_id: Some(root.clone()),
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        let restored = mgr.back_to_parent();
        assert_eq!(restored, Some(root));
    }

    #[test]
    fn pause_then_resume_returns_to_active() {
        let mgr = manager();
        let root = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        mgr.pause(&root).unwrap();
        assert_eq!(mgr.get_session_node(&root).unwrap().status, SessionStatus::Paused);

        mgr.resume(&root).unwrap();
        assert_eq!(mgr.get_session_node(&root).unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn back_to_parent_on_empty_stack_returns_none() {
        let mgr = manager();
        assert_eq!(mgr.back_to_parent(), None);
    }

    #[test]
    fn completed_and_aborted_are_terminal() {
        let mgr = manager();
        let root = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        mgr.complete(&root, None, None).unwrap();
        let err = mgr.pause(&root).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::InvalidTransition);
        assert_eq!(mgr.get_session_node(&root).unwrap().status, SessionStatus::Completed);

        let err = mgr.resume(&root).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::InvalidTransition);

        let err = mgr.complete(&root, None, None).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::InvalidTransition);
        assert_eq!(mgr.get_session_node(&root).unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn abort_refuses_an_already_terminal_session() {
        let mgr = manager();
        let root = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        mgr.abort(&root, None).unwrap();
        assert_eq!(mgr.get_session_node(&root).unwrap().status, SessionStatus::Aborted);

        let err = mgr.abort(&root, None).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::InvalidTransition);
        let err = mgr.resume(&root).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::InvalidTransition);
    }

    struct NoopScope;
    impl super::super::scope::ScopeControl for NoopScope {
        fn enqueue_user_message(&self, _text: String) {}
        fn cancel_current_message(&self) {}
    }

    #[test]
    fn rebinding_an_already_bound_scope_is_refused() {
        let mgr = manager();
        let root = mgr
            .create_session(CreateSessionArgs {
                name: "root".to_string(),
                subagent_name: None,
                parent_id: None,
                config: config(3, true, false),
                task_prompt: None,
            })
            .unwrap();

        mgr.bind_scope(root.clone(), Arc::new(NoopScope)).unwrap();
        let err = mgr.bind_scope(root.clone(), Arc::new(NoopScope)).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::InvalidTransition);

        mgr.rebind_scope(root, Arc::new(NoopScope));
    }
}
