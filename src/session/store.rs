//! In-memory session tree and active-path stack (C4) — spec §4.4.

use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;

use crate::error::{SessionError, SessionErrorCode};

use super::{SessionId, SessionNode, SessionStatus};

/// Authoritative store of session nodes plus the active-session stack.
///
/// The node map is a [`DashMap`] (teacher dependency, used the same way
/// for concurrent session/task maps throughout `ccswarm`); the stack is a
/// single coarse `Mutex<Vec<SessionId>>` per spec §5 ("one coarse lock is
/// acceptable given the low contention expected").
#[derive(Default)]
pub struct SessionStore {
    nodes: DashMap<SessionId, SessionNode>,
    stack: Mutex<Vec<SessionId>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: SessionNode) -> Result<(), SessionError> {
        if self.nodes.contains_key(&node.id) {
            return Err(SessionError::new(
                SessionErrorCode::DuplicateSession,
                format!("session '{}' already exists", node.id),
            ));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn get_node(&self, id: &SessionId) -> Option<SessionNode> {
        self.nodes.get(id).map(|r| r.clone())
    }

    pub fn has(&self, id: &SessionId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Links `child_id` under `parent_id`. A `None` parent is a no-op
    /// (root). Idempotent on repeated linking of the same pair.
    pub fn link_child(
        &self,
        parent_id: Option<&SessionId>,
        child_id: &SessionId,
    ) -> Result<(), SessionError> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };

        if !self.nodes.contains_key(child_id) {
            return Err(SessionError::new(
                SessionErrorCode::SessionNotFound,
                format!("child session '{}' not found", child_id),
            ));
        }

        let mut parent = self.nodes.get_mut(parent_id).ok_or_else(|| {
            SessionError::new(
                SessionErrorCode::ParentNotFound,
                format!("parent session '{}' not found", parent_id),
            )
        })?;

        if !parent.children.contains(child_id) {
            parent.children.push(child_id.clone());
        }
        Ok(())
    }

    /// Refuses to transition a node whose status is already terminal
    /// (spec §3: "once a node reaches a terminal status, its status never
    /// changes again"). This is the backstop guard — callers should also
    /// check `is_terminal()` themselves for a friendlier error message, but
    /// this makes the invariant hold even if one forgets to.
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), SessionError> {
        let mut node = self.nodes.get_mut(id).ok_or_else(|| {
            SessionError::new(
                SessionErrorCode::SessionNotFound,
                format!("session '{}' not found", id),
            )
        })?;
        if node.status.is_terminal() {
            return Err(SessionError::new(
                SessionErrorCode::InvalidTransition,
                format!("session '{}' is already in terminal status {}", id, node.status),
            ));
        }
        node.status = status;
        node.updated_at = Utc::now();
        Ok(())
    }

    pub fn push(&self, id: SessionId) -> Result<(), SessionError> {
        if !self.nodes.contains_key(&id) {
            return Err(SessionError::new(
                SessionErrorCode::SessionNotFound,
                format!("session '{}' not found", id),
            ));
        }
        self.stack.lock().unwrap().push(id);
        Ok(())
    }

    /// Pops the active stack. A no-op on an empty stack, returning `None`.
    pub fn pop(&self) -> Option<SessionId> {
        self.stack.lock().unwrap().pop()
    }

    pub fn get_active(&self) -> Option<SessionId> {
        self.stack.lock().unwrap().last().cloned()
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.stack.lock().unwrap().clone()
    }

    pub fn get_tree(&self) -> Vec<SessionNode> {
        self.nodes.iter().map(|r| r.clone()).collect()
    }

    pub fn get_children(&self, id: &SessionId) -> Vec<SessionId> {
        self.nodes
            .get(id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn get_parent(&self, id: &SessionId) -> Option<SessionId> {
        self.nodes.get(id).and_then(|n| n.parent_id.clone())
    }

    pub fn get_depth(&self, id: &SessionId) -> Option<u32> {
        self.nodes.get(id).map(|n| n.depth)
    }

    /// Walks parents to the root, returning names from root to `id`. On a
    /// detached node, returns only the names discoverable upward from it
    /// (spec §4.4).
    pub fn get_breadcrumb(&self, id: &SessionId) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = self.nodes.get(id).map(|n| n.clone());
        while let Some(node) = current {
            names.push(node.name.clone());
            current = node
                .parent_id
                .as_ref()
                .and_then(|pid| self.nodes.get(pid).map(|n| n.clone()));
        }
        names.reverse();
        names
    }

    /// Wipes everything. Test hook only — not used in production flows
    /// (spec §4.4).
    pub fn clear(&self) {
        self.nodes.clear();
        self.stack.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SubagentSessionConfig;

    fn node(id: &str, parent: Option<&str>, depth: u32) -> SessionNode {
        let now = Utc::now();
        SessionNode {
            id: SessionId::new(id),
            name: id.to_string(),
            subagent_name: None,
            depth,
            status: SessionStatus::Active,
            parent_id: parent.map(SessionId::new),
            children: Vec::new(),
            created_at: now,
            updated_at: now,
            config: SubagentSessionConfig::default(),
        }
    }

    #[test]
    fn add_node_rejects_duplicates() {
        let store = SessionStore::new();
        store.add_node(node("a", None, 0)).unwrap();
        let err = store.add_node(node("a", None, 0)).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::DuplicateSession);
    }

    #[test]
    fn push_rejects_unknown_id() {
        let store = SessionStore::new();
        let err = store.push(SessionId::new("ghost")).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::SessionNotFound);
    }

    #[test]
    fn pop_on_empty_stack_is_a_noop_returning_none() {
        let store = SessionStore::new();
        assert_eq!(store.pop(), None);
    }

    #[test]
    fn breadcrumb_walks_from_root_to_node() {
        let store = SessionStore::new();
        store.add_node(node("root", None, 0)).unwrap();
        store.add_node(node("child", Some("root"), 1)).unwrap();
        store.link_child(Some(&SessionId::new("root")), &SessionId::new("child")).unwrap();

        assert_eq!(
            store.get_breadcrumb(&SessionId::new("child")),
            vec!["root".to_string(), "child".to_string()]
        );
    }

    #[test]
    fn link_child_is_idempotent() {
        let store = SessionStore::new();
        store.add_node(node("root", None, 0)).unwrap();
        store.add_node(node("child", Some("root"), 1)).unwrap();
        let parent = SessionId::new("root");
        let child = SessionId::new("child");
        store.link_child(Some(&parent), &child).unwrap();
        store.link_child(Some(&parent), &child).unwrap();

        assert_eq!(store.get_children(&parent), vec![child]);
    }
}
