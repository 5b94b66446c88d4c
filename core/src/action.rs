//! Actions: the smallest executable unit produced by the sequence endpoint.
//!
//! The state machine treats actions as opaque. Execution is delegated to an
//! [`ActionExecutor`]; [`LocalActionExecutor`] covers the built-in kinds that
//! edit the context store or propose plan changes.

use crate::context_store::ContextStore;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::template::{Step, TemplateStore, WorkflowTemplate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Backend-supplied unit of work: a kind plus free-form arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    fn require_str(&self, key: &str) -> WorkflowResult<&str> {
        self.arg_str(key).ok_or_else(|| {
            WorkflowError::ActionFailed(format!("{} action is missing '{}'", self.kind, key))
        })
    }

    fn require<T: serde::de::DeserializeOwned>(&self, key: &str) -> WorkflowResult<T> {
        let value = self.args.get(key).cloned().ok_or_else(|| {
            WorkflowError::ActionFailed(format!("{} action is missing '{}'", self.kind, key))
        })?;
        serde_json::from_value(value).map_err(|e| {
            WorkflowError::ActionFailed(format!("{} action has invalid '{}': {}", self.kind, key, e))
        })
    }
}

/// Channel through which a running action can propose plan changes.
///
/// Implemented by the runner handle; requests are only accepted while the
/// machine is in `ACTION_RUNNING`.
#[async_trait]
pub trait UpdateRequester: Send + Sync {
    async fn request_workflow_update(
        &self,
        template: WorkflowTemplate,
        next_stage_id: Option<String>,
    ) -> WorkflowResult<bool>;

    async fn request_step_update(&self, stage_id: String, steps: Vec<Step>)
        -> WorkflowResult<bool>;
}

/// What an action may touch while it runs.
#[derive(Clone)]
pub struct ActionScope {
    pub stage_id: String,
    pub step_id: String,
    pub behavior_id: String,
    pub context: ContextStore,
    pub template: TemplateStore,
    pub updates: Arc<dyn UpdateRequester>,
}

/// Local action-execution capability.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action, scope: &ActionScope) -> WorkflowResult<()>;
}

/// Executes the built-in action kinds against the context store.
///
/// Unknown kinds are logged and treated as completed.
#[derive(Debug, Default, Clone)]
pub struct LocalActionExecutor;

impl LocalActionExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActionExecutor for LocalActionExecutor {
    async fn execute(&self, action: &Action, scope: &ActionScope) -> WorkflowResult<()> {
        debug!(
            "Executing action '{}' for {}/{}/{}",
            action.kind, scope.stage_id, scope.step_id, scope.behavior_id
        );

        match action.kind.as_str() {
            "think" => {
                scope.context.append_thinking(action.require_str("text")?);
            }
            "set_variable" => {
                let key = action.require_str("key")?;
                let value = action.args.get("value").cloned().unwrap_or(Value::Null);
                scope.context.set_variable(key, value);
            }
            "add_checklist_item" => {
                scope
                    .context
                    .add_checklist_item(action.require_str("id")?, action.require_str("text")?);
            }
            "check_item" => {
                let id = action.require_str("id")?;
                if !scope.context.check_item(id) {
                    return Err(WorkflowError::ActionFailed(format!(
                        "checklist item not found: {}",
                        id
                    )));
                }
            }
            "add_todo" => {
                let id = action
                    .arg_str("id")
                    .map(String::from)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                scope.context.add_todo(id, action.require_str("text")?);
            }
            "complete_todo" => {
                let id = action.require_str("id")?;
                if !scope.context.complete_todo(id) {
                    return Err(WorkflowError::ActionFailed(format!("todo not found: {}", id)));
                }
            }
            "update_workflow" => {
                let template: WorkflowTemplate = action.require("template")?;
                let next_stage_id = action.arg_str("next_stage_id").map(String::from);
                let accepted = scope
                    .updates
                    .request_workflow_update(template, next_stage_id)
                    .await?;
                if !accepted {
                    return Err(WorkflowError::ActionFailed(
                        "workflow update was not accepted".to_string(),
                    ));
                }
                info!("Workflow update proposed");
            }
            "update_steps" => {
                let stage_id = action
                    .arg_str("stage_id")
                    .unwrap_or(scope.stage_id.as_str())
                    .to_string();
                let steps: Vec<Step> = action.require("steps")?;
                let accepted = scope
                    .updates
                    .request_step_update(stage_id.clone(), steps)
                    .await?;
                if !accepted {
                    return Err(WorkflowError::ActionFailed(format!(
                        "step update for stage {} was not accepted",
                        stage_id
                    )));
                }
                info!("Step update proposed for stage {}", stage_id);
            }
            other => {
                info!("No local handler for action '{}', marking complete", other);
            }
        }

        Ok(())
    }
}
