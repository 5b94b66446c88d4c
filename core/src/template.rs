//! Workflow templates: the static stage/step blueprint a run executes.
//!
//! A template is loaded once per run and shared through a [`TemplateStore`].
//! The only writer after load is the state machine, when a pending
//! workflow or step update is confirmed.

use crate::errors::{TemplateError, TemplateResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Static blueprint of a workflow: ordered stages, each with ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// Top-level phase of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Unit of work within a stage. Array position is execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    /// Behavior ids to run for this step; the first one is started.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub behaviors: Vec<String>,
}

/// Informational status carried by a template step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Step {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            status: None,
            behaviors: Vec::new(),
        }
    }

    pub fn with_behaviors<I, S>(mut self, behaviors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.behaviors = behaviors.into_iter().map(Into::into).collect();
        self
    }

    /// Behavior started when the step is entered.
    ///
    /// Steps without an explicit behavior list run a single default
    /// behavior named after the step.
    pub fn first_behavior_id(&self) -> String {
        self.behaviors
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{}:default", self.id))
    }
}

impl Stage {
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            steps,
        }
    }

    pub fn first_step_id(&self) -> Option<&str> {
        self.steps.first().map(|s| s.id.as_str())
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    pub fn stage(&self, stage_id: &str) -> TemplateResult<&Stage> {
        self.stages
            .iter()
            .find(|s| s.id == stage_id)
            .ok_or_else(|| TemplateError::StageNotFound(stage_id.to_string()))
    }

    pub fn step(&self, stage_id: &str, step_id: &str) -> TemplateResult<&Step> {
        self.stage(stage_id)?
            .step(step_id)
            .ok_or_else(|| TemplateError::StepNotFound {
                stage_id: stage_id.to_string(),
                step_id: step_id.to_string(),
            })
    }

    pub fn step_index(&self, stage_id: &str, step_id: &str) -> TemplateResult<usize> {
        self.stage(stage_id)?
            .step_index(step_id)
            .ok_or_else(|| TemplateError::StepNotFound {
                stage_id: stage_id.to_string(),
                step_id: step_id.to_string(),
            })
    }

    /// Step following `step_id` in its stage, or `None` if it is the last.
    pub fn next_step_id(&self, stage_id: &str, step_id: &str) -> TemplateResult<Option<String>> {
        let stage = self.stage(stage_id)?;
        let index = self.step_index(stage_id, step_id)?;
        Ok(stage.steps.get(index + 1).map(|s| s.id.clone()))
    }

    /// Stage following `stage_id`, or `None` if it is the last.
    pub fn next_stage_id(&self, stage_id: &str) -> TemplateResult<Option<String>> {
        let index = self
            .stages
            .iter()
            .position(|s| s.id == stage_id)
            .ok_or_else(|| TemplateError::StageNotFound(stage_id.to_string()))?;
        Ok(self.stages.get(index + 1).map(|s| s.id.clone()))
    }

    /// Check id uniqueness and required names.
    pub fn validate(&self) -> TemplateResult<()> {
        if self.name.trim().is_empty() {
            return Err(TemplateError::Invalid("template name is empty".to_string()));
        }

        let mut stage_ids = HashSet::new();
        for stage in &self.stages {
            if stage.id.is_empty() {
                return Err(TemplateError::Invalid("stage id is empty".to_string()));
            }
            if !stage_ids.insert(stage.id.as_str()) {
                return Err(TemplateError::DuplicateId(stage.id.clone()));
            }
            validate_steps(&stage.id, &stage.steps)?;
        }

        Ok(())
    }
}

fn validate_steps(stage_id: &str, steps: &[Step]) -> TemplateResult<()> {
    let mut step_ids = HashSet::new();
    for step in steps {
        if step.id.is_empty() {
            return Err(TemplateError::Invalid(format!(
                "step id is empty in stage {}",
                stage_id
            )));
        }
        if !step_ids.insert(step.id.as_str()) {
            return Err(TemplateError::DuplicateId(format!("{}/{}", stage_id, step.id)));
        }
    }
    Ok(())
}

/// On-disk encoding of a template, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Json,
    Toml,
}

impl TemplateFormat {
    pub fn from_path(path: &Path) -> TemplateResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(TemplateFormat::Json),
            Some("toml") => Ok(TemplateFormat::Toml),
            other => Err(TemplateError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    pub fn parse(&self, content: &str) -> TemplateResult<WorkflowTemplate> {
        let template = match self {
            TemplateFormat::Json => serde_json::from_str(content)?,
            TemplateFormat::Toml => toml::from_str(content)?,
        };
        Ok(template)
    }

    pub fn render(&self, template: &WorkflowTemplate) -> TemplateResult<String> {
        let content = match self {
            TemplateFormat::Json => serde_json::to_string_pretty(template)?,
            TemplateFormat::Toml => toml::to_string_pretty(template)?,
        };
        Ok(content)
    }
}

/// Shared handle to the template of one workflow run.
///
/// Cloning the store clones the handle, not the template.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    inner: Arc<RwLock<WorkflowTemplate>>,
}

impl TemplateStore {
    pub fn new(template: WorkflowTemplate) -> Self {
        Self {
            inner: Arc::new(RwLock::new(template)),
        }
    }

    /// Load and validate a template file (`.json` or `.toml`).
    pub fn load(path: &Path) -> TemplateResult<Self> {
        let format = TemplateFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)?;
        let template = format.parse(&content)?;
        template.validate()?;
        info!(
            "Loaded workflow template '{}' ({} stages) from {:?}",
            template.name,
            template.stages.len(),
            path
        );
        Ok(Self::new(template))
    }

    pub fn save(&self, path: &Path) -> TemplateResult<()> {
        let format = TemplateFormat::from_path(path)?;
        let content = format.render(&self.inner.read())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        info!("Workflow template saved to {:?}", path);
        Ok(())
    }

    /// Clone of the current template.
    pub fn snapshot(&self) -> WorkflowTemplate {
        self.inner.read().clone()
    }

    /// Run a read-only query against the current template.
    pub fn read<T>(&self, f: impl FnOnce(&WorkflowTemplate) -> T) -> T {
        f(&self.inner.read())
    }

    /// Swap the whole template (confirmed workflow update).
    pub fn replace(&self, template: WorkflowTemplate) {
        debug!("Replacing workflow template with '{}'", template.name);
        *self.inner.write() = template;
    }

    /// Check that `steps` could replace the steps of `stage_id`.
    pub fn check_steps(&self, stage_id: &str, steps: &[Step]) -> TemplateResult<()> {
        self.read(|t| t.stage(stage_id).map(|_| ()))?;
        validate_steps(stage_id, steps)
    }

    /// Swap one stage's step list (confirmed step update).
    pub fn replace_steps(&self, stage_id: &str, steps: Vec<Step>) -> TemplateResult<()> {
        validate_steps(stage_id, &steps)?;
        let mut template = self.inner.write();
        let stage = template
            .stages
            .iter_mut()
            .find(|s| s.id == stage_id)
            .ok_or_else(|| TemplateError::StageNotFound(stage_id.to_string()))?;
        debug!(
            "Replacing {} steps of stage {} with {}",
            stage.steps.len(),
            stage_id,
            steps.len()
        );
        stage.steps = steps;
        Ok(())
    }
}
