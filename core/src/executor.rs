//! Per-state effects.
//!
//! Each effect reads the execution context, performs at most one unit of
//! external work and returns exactly one follow-up event. Effects never mutate
//! the machine; errors are returned and turned into `FAIL` by the runner.

use crate::action::{ActionExecutor, ActionScope, UpdateRequester};
use crate::action_stream::SequenceRecord;
use crate::backend::{FeedbackRequest, FeedbackResponse, SequenceRequest, WorkflowBackend};
use crate::context_store::ContextStore;
use crate::errors::{TemplateError, WorkflowError, WorkflowResult};
use crate::state_machine::{ExecutionContext, WorkflowEvent, WorkflowState};
use crate::template::TemplateStore;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collaborators the effects need.
#[derive(Clone)]
pub struct EffectDeps {
    pub backend: Arc<dyn WorkflowBackend>,
    pub actions: Arc<dyn ActionExecutor>,
    pub template: TemplateStore,
    pub context: ContextStore,
}

pub struct Executor {
    deps: EffectDeps,
    malformed_lines: AtomicU64,
}

impl Executor {
    pub fn new(deps: EffectDeps) -> Self {
        Self {
            deps,
            malformed_lines: AtomicU64::new(0),
        }
    }

    pub fn context_store(&self) -> &ContextStore {
        &self.deps.context
    }

    /// Sequence lines dropped as malformed over the executor's lifetime.
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    /// Run the effect for `state` and return its follow-up event.
    pub async fn run_effect(
        &self,
        state: WorkflowState,
        ctx: &ExecutionContext,
        updates: Arc<dyn UpdateRequester>,
    ) -> WorkflowResult<WorkflowEvent> {
        debug!("Running effect for {}", state);
        match state {
            WorkflowState::StageRunning => self.enter_stage(ctx),
            WorkflowState::StepRunning => self.enter_step(ctx),
            WorkflowState::BehaviorRunning => self.fetch_sequence(ctx).await,
            WorkflowState::ActionRunning => self.execute_action(ctx, updates).await,
            WorkflowState::ActionCompleted => Ok(advance_action(ctx)),
            WorkflowState::BehaviorCompleted => self.evaluate_behavior(ctx).await,
            WorkflowState::StepCompleted => self.advance_step(ctx),
            WorkflowState::StageCompleted => self.advance_stage(ctx),
            other => Err(WorkflowError::NoEffect(other.to_string())),
        }
    }

    fn enter_stage(&self, ctx: &ExecutionContext) -> WorkflowResult<WorkflowEvent> {
        let stage_id = current_stage(ctx)?;
        let hint = ctx.current_step_id.as_deref();

        let step_id = self.deps.template.read(|t| {
            let stage = t.stage(stage_id)?;
            let step = match hint {
                Some(hint) if stage.step(hint).is_some() => Some(hint.to_string()),
                Some(hint) => {
                    warn!(
                        "Starting step {} is not in stage {}, using the first step",
                        hint, stage_id
                    );
                    stage.first_step_id().map(String::from)
                }
                None => stage.first_step_id().map(String::from),
            };
            step.ok_or_else(|| TemplateError::Invalid(format!("stage {} has no steps", stage_id)))
        })?;

        Ok(WorkflowEvent::StartStep { step_id })
    }

    fn enter_step(&self, ctx: &ExecutionContext) -> WorkflowResult<WorkflowEvent> {
        let stage_id = current_stage(ctx)?;
        let step_id = current_step(ctx)?;
        let behavior_id = self
            .deps
            .template
            .read(|t| t.step(stage_id, step_id).map(|s| s.first_behavior_id()))?;
        Ok(WorkflowEvent::StartBehavior { behavior_id })
    }

    async fn fetch_sequence(&self, ctx: &ExecutionContext) -> WorkflowResult<WorkflowEvent> {
        let stage_id = current_stage(ctx)?;
        let step_index = self.step_index(ctx)?;

        let request = SequenceRequest {
            stage_id: stage_id.to_string(),
            step_index,
            state: self.backend_state(ctx),
            stream: true,
        };
        let mut stream = self.deps.backend.sequence(request).await?;

        let mut actions = Vec::new();
        while let Some(record) = stream.next().await {
            match record? {
                SequenceRecord::Action(action) => actions.push(action),
                SequenceRecord::Malformed(_) => {
                    self.malformed_lines.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        info!(
            "Behavior {} expanded into {} actions",
            ctx.current_behavior_id.as_deref().unwrap_or("?"),
            actions.len()
        );

        if actions.is_empty() {
            Ok(WorkflowEvent::CompleteBehavior)
        } else {
            Ok(WorkflowEvent::StartAction {
                index: 0,
                actions: Some(actions),
            })
        }
    }

    async fn execute_action(
        &self,
        ctx: &ExecutionContext,
        updates: Arc<dyn UpdateRequester>,
    ) -> WorkflowResult<WorkflowEvent> {
        let action = ctx
            .current_action()
            .ok_or(WorkflowError::ActionOutOfRange {
                index: ctx.current_action_index,
                len: ctx.current_behavior_actions.len(),
            })?;

        let scope = ActionScope {
            stage_id: current_stage(ctx)?.to_string(),
            step_id: current_step(ctx)?.to_string(),
            behavior_id: current_behavior(ctx)?.to_string(),
            context: self.deps.context.clone(),
            template: self.deps.template.clone(),
            updates,
        };

        self.deps.actions.execute(action, &scope).await?;
        Ok(WorkflowEvent::CompleteAction)
    }

    async fn evaluate_behavior(&self, ctx: &ExecutionContext) -> WorkflowResult<WorkflowEvent> {
        let stage_id = current_stage(ctx)?;
        let behavior_id = current_behavior(ctx)?;
        let request = FeedbackRequest {
            stage_id: stage_id.to_string(),
            step_index: self.step_index(ctx)?,
            state: self.backend_state(ctx),
        };

        let feedback = self.deps.backend.feedback(request).await?;
        debug!("Feedback for behavior {}: {:?}", behavior_id, feedback);
        Ok(feedback_event(behavior_id, &feedback))
    }

    fn advance_step(&self, ctx: &ExecutionContext) -> WorkflowResult<WorkflowEvent> {
        let stage_id = current_stage(ctx)?;
        let step_id = current_step(ctx)?;

        match self.deps.template.read(|t| t.next_step_id(stage_id, step_id))? {
            Some(next) => Ok(WorkflowEvent::StartStep { step_id: next }),
            None => Ok(WorkflowEvent::CompleteStage {
                stage_id: stage_id.to_string(),
            }),
        }
    }

    fn advance_stage(&self, ctx: &ExecutionContext) -> WorkflowResult<WorkflowEvent> {
        let stage_id = current_stage(ctx)?;
        self.deps.context.mark_stage_completed(stage_id);
        info!("Stage {} completed", stage_id);

        let next = self.deps.template.read(|t| {
            if let Some(target) = ctx.next_stage_override.as_deref() {
                if t.stage(target).is_ok() {
                    return Ok(Some(target.to_string()));
                }
                warn!("Stage override {} is not in the template, ignoring", target);
            }
            t.next_stage_id(stage_id)
        })?;

        match next {
            Some(stage_id) => Ok(WorkflowEvent::StartWorkflow {
                stage_id,
                step_id: None,
            }),
            None => Ok(WorkflowEvent::CompleteWorkflow),
        }
    }

    fn step_index(&self, ctx: &ExecutionContext) -> WorkflowResult<usize> {
        let stage_id = current_stage(ctx)?;
        let step_id = current_step(ctx)?;
        Ok(self
            .deps
            .template
            .read(|t| t.step_index(stage_id, step_id))?)
    }

    fn backend_state(&self, ctx: &ExecutionContext) -> serde_json::Value {
        self.deps
            .context
            .to_payload(ctx.current_behavior_id.as_deref())
    }
}

fn current_stage(ctx: &ExecutionContext) -> WorkflowResult<&str> {
    ctx.current_stage_id
        .as_deref()
        .ok_or(WorkflowError::MissingContext("stage"))
}

fn current_step(ctx: &ExecutionContext) -> WorkflowResult<&str> {
    ctx.current_step_id
        .as_deref()
        .ok_or(WorkflowError::MissingContext("step"))
}

fn current_behavior(ctx: &ExecutionContext) -> WorkflowResult<&str> {
    ctx.current_behavior_id
        .as_deref()
        .ok_or(WorkflowError::MissingContext("behavior"))
}

fn advance_action(ctx: &ExecutionContext) -> WorkflowEvent {
    if ctx.has_next_action() {
        WorkflowEvent::StartAction {
            index: ctx.current_action_index + 1,
            actions: None,
        }
    } else {
        WorkflowEvent::CompleteBehavior
    }
}

/// Map a feedback verdict onto the next event.
///
/// A behavior that missed its target is retried under the same id.
pub fn feedback_event(behavior_id: &str, feedback: &FeedbackResponse) -> WorkflowEvent {
    if !feedback.target_achieved {
        return WorkflowEvent::NextBehavior {
            behavior_id: behavior_id.to_string(),
        };
    }

    if feedback.step_completed == Some(true) {
        return WorkflowEvent::CompleteStep;
    }

    match &feedback.next_behavior_id {
        Some(next) => WorkflowEvent::NextBehavior {
            behavior_id: next.clone(),
        },
        None => WorkflowEvent::CompleteStep,
    }
}
