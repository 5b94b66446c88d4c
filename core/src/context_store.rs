//! Mutable planning state consulted and updated while a workflow runs.
//!
//! The context store holds the checklist, to-dos, free-form thinking log,
//! key/value variables and per-stage completion flags. Its snapshot is the
//! `state` payload sent with every sequence and feedback request.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Point-in-time copy of the context store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub checklist: Vec<ChecklistItem>,
    pub todos: Vec<TodoItem>,
    pub thinking: Vec<ThinkingEntry>,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub stage_completion: BTreeMap<String, bool>,
}

/// Shared handle to a run's planning state.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<ContextSnapshot>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.inner.read().clone()
    }

    pub fn add_checklist_item(&self, id: impl Into<String>, text: impl Into<String>) {
        self.inner.write().checklist.push(ChecklistItem {
            id: id.into(),
            text: text.into(),
            checked: false,
        });
    }

    /// Mark a checklist item done. Returns false if no such item exists.
    pub fn check_item(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.checklist.iter_mut().find(|i| i.id == id) {
            Some(item) => {
                item.checked = true;
                true
            }
            None => false,
        }
    }

    pub fn add_todo(&self, id: impl Into<String>, text: impl Into<String>) {
        self.inner.write().todos.push(TodoItem {
            id: id.into(),
            text: text.into(),
            done: false,
        });
    }

    /// Mark a to-do done. Returns false if no such to-do exists.
    pub fn complete_todo(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.todos.iter_mut().find(|t| t.id == id) {
            Some(todo) => {
                todo.done = true;
                true
            }
            None => false,
        }
    }

    pub fn append_thinking(&self, text: impl Into<String>) {
        self.inner.write().thinking.push(ThinkingEntry {
            timestamp: Utc::now(),
            text: text.into(),
        });
    }

    pub fn set_variable(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().variables.insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().variables.get(key).cloned()
    }

    pub fn remove_variable(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.write().variables.remove(key)
    }

    pub fn mark_stage_completed(&self, stage_id: impl Into<String>) {
        self.inner.write().stage_completion.insert(stage_id.into(), true);
    }

    pub fn is_stage_completed(&self, stage_id: &str) -> bool {
        self.inner
            .read()
            .stage_completion
            .get(stage_id)
            .copied()
            .unwrap_or(false)
    }

    /// Backend `state` payload: the snapshot plus the active behavior.
    pub fn to_payload(&self, current_behavior_id: Option<&str>) -> serde_json::Value {
        let snapshot = self.snapshot();
        serde_json::json!({
            "checklist": snapshot.checklist,
            "todos": snapshot.todos,
            "thinking": snapshot.thinking,
            "variables": snapshot.variables,
            "stage_completion": snapshot.stage_completion,
            "current_behavior_id": current_behavior_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checklist_and_todos() {
        let store = ContextStore::new();
        store.add_checklist_item("c1", "read data");
        store.add_todo("t1", "plot it");

        assert!(store.check_item("c1"));
        assert!(!store.check_item("c2"));
        assert!(store.complete_todo("t1"));

        let snap = store.snapshot();
        assert!(snap.checklist[0].checked);
        assert!(snap.todos[0].done);
    }

    #[test]
    fn test_variables() {
        let store = ContextStore::new();
        store.set_variable("rows", json!(120));
        assert_eq!(store.variable("rows"), Some(json!(120)));
        assert_eq!(store.remove_variable("rows"), Some(json!(120)));
        assert_eq!(store.variable("rows"), None);
    }

    #[test]
    fn test_stage_completion_flags() {
        let store = ContextStore::new();
        assert!(!store.is_stage_completed("load"));
        store.mark_stage_completed("load");
        assert!(store.is_stage_completed("load"));
    }

    #[test]
    fn test_payload_shape() {
        let store = ContextStore::new();
        store.append_thinking("looks clean");
        let payload = store.to_payload(Some("b1"));
        assert_eq!(payload["current_behavior_id"], json!("b1"));
        assert_eq!(payload["thinking"][0]["text"], json!("looks clean"));
        assert!(payload["variables"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let store = ContextStore::new();
        let other = store.clone();
        other.set_variable("k", json!("v"));
        assert_eq!(store.variable("k"), Some(json!("v")));
    }
}
