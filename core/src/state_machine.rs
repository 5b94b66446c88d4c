//! Hierarchical workflow state machine (Workflow → Stage → Step → Behavior → Action)
//!
//! The machine holds `(state, execution context)` and is the single writer of
//! both. It provides:
//! - A normative transition table keyed by `(state, event kind)`
//! - Typed event payloads applied to the execution context on acceptance
//! - An append-only execution history
//! - Pending plan updates gated behind confirmation
//!
//! Effects are not run here; see `executor` and `runner`.

use crate::action::Action;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::template::{Step, TemplateStore, WorkflowTemplate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

// ============================================================================
// STATES AND EVENTS
// ============================================================================

/// Every state the machine can be in. States are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Idle,
    StageRunning,
    StageCompleted,
    StepRunning,
    StepCompleted,
    BehaviorRunning,
    BehaviorCompleted,
    ActionRunning,
    ActionCompleted,
    WorkflowCompleted,
    WorkflowUpdatePending,
    StepUpdatePending,
    Error,
    Cancelled,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 14] = [
        WorkflowState::Idle,
        WorkflowState::StageRunning,
        WorkflowState::StageCompleted,
        WorkflowState::StepRunning,
        WorkflowState::StepCompleted,
        WorkflowState::BehaviorRunning,
        WorkflowState::BehaviorCompleted,
        WorkflowState::ActionRunning,
        WorkflowState::ActionCompleted,
        WorkflowState::WorkflowCompleted,
        WorkflowState::WorkflowUpdatePending,
        WorkflowState::StepUpdatePending,
        WorkflowState::Error,
        WorkflowState::Cancelled,
    ];

    /// States that only `RESET` can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::WorkflowCompleted | WorkflowState::Error | WorkflowState::Cancelled
        )
    }

    /// Suspended states waiting on a confirm/reject decision.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            WorkflowState::WorkflowUpdatePending | WorkflowState::StepUpdatePending
        )
    }

    /// States whose entry schedules an effect.
    pub fn has_effect(&self) -> bool {
        matches!(
            self,
            WorkflowState::StageRunning
                | WorkflowState::StageCompleted
                | WorkflowState::StepRunning
                | WorkflowState::StepCompleted
                | WorkflowState::BehaviorRunning
                | WorkflowState::BehaviorCompleted
                | WorkflowState::ActionRunning
                | WorkflowState::ActionCompleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "IDLE",
            WorkflowState::StageRunning => "STAGE_RUNNING",
            WorkflowState::StageCompleted => "STAGE_COMPLETED",
            WorkflowState::StepRunning => "STEP_RUNNING",
            WorkflowState::StepCompleted => "STEP_COMPLETED",
            WorkflowState::BehaviorRunning => "BEHAVIOR_RUNNING",
            WorkflowState::BehaviorCompleted => "BEHAVIOR_COMPLETED",
            WorkflowState::ActionRunning => "ACTION_RUNNING",
            WorkflowState::ActionCompleted => "ACTION_COMPLETED",
            WorkflowState::WorkflowCompleted => "WORKFLOW_COMPLETED",
            WorkflowState::WorkflowUpdatePending => "WORKFLOW_UPDATE_PENDING",
            WorkflowState::StepUpdatePending => "STEP_UPDATE_PENDING",
            WorkflowState::Error => "ERROR",
            WorkflowState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload-free event identifier used as the transition table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StartWorkflow,
    StartStep,
    StartBehavior,
    StartAction,
    CompleteAction,
    CompleteBehavior,
    CompleteStep,
    CompleteStage,
    CompleteWorkflow,
    NextAction,
    NextBehavior,
    NextStep,
    NextStage,
    UpdateWorkflow,
    UpdateWorkflowConfirmed,
    UpdateWorkflowRejected,
    UpdateStep,
    UpdateStepConfirmed,
    UpdateStepRejected,
    Fail,
    Cancel,
    Reset,
}

impl EventKind {
    pub const ALL: [EventKind; 22] = [
        EventKind::StartWorkflow,
        EventKind::StartStep,
        EventKind::StartBehavior,
        EventKind::StartAction,
        EventKind::CompleteAction,
        EventKind::CompleteBehavior,
        EventKind::CompleteStep,
        EventKind::CompleteStage,
        EventKind::CompleteWorkflow,
        EventKind::NextAction,
        EventKind::NextBehavior,
        EventKind::NextStep,
        EventKind::NextStage,
        EventKind::UpdateWorkflow,
        EventKind::UpdateWorkflowConfirmed,
        EventKind::UpdateWorkflowRejected,
        EventKind::UpdateStep,
        EventKind::UpdateStepConfirmed,
        EventKind::UpdateStepRejected,
        EventKind::Fail,
        EventKind::Cancel,
        EventKind::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StartWorkflow => "START_WORKFLOW",
            EventKind::StartStep => "START_STEP",
            EventKind::StartBehavior => "START_BEHAVIOR",
            EventKind::StartAction => "START_ACTION",
            EventKind::CompleteAction => "COMPLETE_ACTION",
            EventKind::CompleteBehavior => "COMPLETE_BEHAVIOR",
            EventKind::CompleteStep => "COMPLETE_STEP",
            EventKind::CompleteStage => "COMPLETE_STAGE",
            EventKind::CompleteWorkflow => "COMPLETE_WORKFLOW",
            EventKind::NextAction => "NEXT_ACTION",
            EventKind::NextBehavior => "NEXT_BEHAVIOR",
            EventKind::NextStep => "NEXT_STEP",
            EventKind::NextStage => "NEXT_STAGE",
            EventKind::UpdateWorkflow => "UPDATE_WORKFLOW",
            EventKind::UpdateWorkflowConfirmed => "UPDATE_WORKFLOW_CONFIRMED",
            EventKind::UpdateWorkflowRejected => "UPDATE_WORKFLOW_REJECTED",
            EventKind::UpdateStep => "UPDATE_STEP",
            EventKind::UpdateStepConfirmed => "UPDATE_STEP_CONFIRMED",
            EventKind::UpdateStepRejected => "UPDATE_STEP_REJECTED",
            EventKind::Fail => "FAIL",
            EventKind::Cancel => "CANCEL",
            EventKind::Reset => "RESET",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events with the payload each transition needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEvent {
    /// Enter a stage. Also raised by `STAGE_COMPLETED` to advance.
    StartWorkflow {
        stage_id: String,
        /// Starting step hint; resolved by the `STAGE_RUNNING` effect
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
    NextStage {
        stage_id: String,
    },
    StartStep {
        step_id: String,
    },
    NextStep {
        step_id: String,
    },
    StartBehavior {
        behavior_id: String,
    },
    NextBehavior {
        behavior_id: String,
    },
    /// Run the action at `index`. `actions` replaces the behavior's action
    /// list when a fresh sequence was fetched.
    StartAction {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actions: Option<Vec<Action>>,
    },
    NextAction {
        index: usize,
    },
    CompleteAction,
    CompleteBehavior,
    CompleteStep,
    CompleteStage {
        stage_id: String,
    },
    CompleteWorkflow,
    UpdateWorkflow {
        template: WorkflowTemplate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_stage_id: Option<String>,
    },
    UpdateWorkflowConfirmed,
    UpdateWorkflowRejected,
    UpdateStep {
        stage_id: String,
        steps: Vec<Step>,
    },
    UpdateStepConfirmed,
    UpdateStepRejected,
    Fail {
        error: String,
    },
    Cancel,
    Reset,
}

impl WorkflowEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkflowEvent::StartWorkflow { .. } => EventKind::StartWorkflow,
            WorkflowEvent::NextStage { .. } => EventKind::NextStage,
            WorkflowEvent::StartStep { .. } => EventKind::StartStep,
            WorkflowEvent::NextStep { .. } => EventKind::NextStep,
            WorkflowEvent::StartBehavior { .. } => EventKind::StartBehavior,
            WorkflowEvent::NextBehavior { .. } => EventKind::NextBehavior,
            WorkflowEvent::StartAction { .. } => EventKind::StartAction,
            WorkflowEvent::NextAction { .. } => EventKind::NextAction,
            WorkflowEvent::CompleteAction => EventKind::CompleteAction,
            WorkflowEvent::CompleteBehavior => EventKind::CompleteBehavior,
            WorkflowEvent::CompleteStep => EventKind::CompleteStep,
            WorkflowEvent::CompleteStage { .. } => EventKind::CompleteStage,
            WorkflowEvent::CompleteWorkflow => EventKind::CompleteWorkflow,
            WorkflowEvent::UpdateWorkflow { .. } => EventKind::UpdateWorkflow,
            WorkflowEvent::UpdateWorkflowConfirmed => EventKind::UpdateWorkflowConfirmed,
            WorkflowEvent::UpdateWorkflowRejected => EventKind::UpdateWorkflowRejected,
            WorkflowEvent::UpdateStep { .. } => EventKind::UpdateStep,
            WorkflowEvent::UpdateStepConfirmed => EventKind::UpdateStepConfirmed,
            WorkflowEvent::UpdateStepRejected => EventKind::UpdateStepRejected,
            WorkflowEvent::Fail { .. } => EventKind::Fail,
            WorkflowEvent::Cancel => EventKind::Cancel,
            WorkflowEvent::Reset => EventKind::Reset,
        }
    }

    pub fn fail(error: impl fmt::Display) -> Self {
        WorkflowEvent::Fail {
            error: error.to_string(),
        }
    }

    /// Payload as recorded in history (`null` for payload-free events).
    pub fn payload_json(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut obj)) => {
                obj.remove("payload").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowEvent::Fail { error } => write!(f, "FAIL({})", error),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

// ============================================================================
// TRANSITION TABLE
// ============================================================================

/// The normative transition table: `(state, event kind) -> next state`.
///
/// `None` means the transition is not legal from `state`.
pub fn lookup(state: WorkflowState, event: EventKind) -> Option<WorkflowState> {
    use EventKind as E;
    use WorkflowState as S;

    let target = match (state, event) {
        (S::Idle, E::StartWorkflow) => S::StageRunning,

        (S::StageRunning, E::StartStep) => S::StepRunning,
        (S::StepRunning, E::StartBehavior) => S::BehaviorRunning,

        (S::BehaviorRunning, E::StartAction) => S::ActionRunning,
        (S::BehaviorRunning, E::CompleteBehavior) => S::BehaviorCompleted,

        (S::ActionRunning, E::CompleteAction) => S::ActionCompleted,
        (S::ActionRunning, E::UpdateWorkflow) => S::WorkflowUpdatePending,
        (S::ActionRunning, E::UpdateStep) => S::StepUpdatePending,

        (S::ActionCompleted, E::StartAction | E::NextAction) => S::ActionRunning,
        (S::ActionCompleted, E::CompleteBehavior) => S::BehaviorCompleted,

        (S::BehaviorCompleted, E::CompleteStep) => S::StepCompleted,
        (S::BehaviorCompleted, E::NextBehavior) => S::BehaviorRunning,

        (S::StepCompleted, E::StartStep | E::NextStep) => S::StepRunning,
        (S::StepCompleted, E::CompleteStage) => S::StageCompleted,

        (S::StageCompleted, E::StartWorkflow | E::NextStage) => S::StageRunning,
        (S::StageCompleted, E::CompleteWorkflow) => S::WorkflowCompleted,

        (S::WorkflowUpdatePending, E::UpdateWorkflowConfirmed | E::UpdateWorkflowRejected) => {
            S::ActionCompleted
        }
        (S::StepUpdatePending, E::UpdateStepConfirmed | E::UpdateStepRejected) => {
            S::ActionCompleted
        }

        (s, E::Fail) if s.has_effect() => S::Error,
        (s, E::Cancel) if s.has_effect() || s.is_pending() => S::Cancelled,

        (S::Idle | S::WorkflowCompleted | S::Error | S::Cancelled, E::Reset) => S::Idle,

        _ => return None,
    };

    Some(target)
}

/// Every legal `(from, event, to)` row, in state then event order.
pub fn transition_table() -> Vec<(WorkflowState, EventKind, WorkflowState)> {
    WorkflowState::ALL
        .iter()
        .flat_map(|state| {
            EventKind::ALL
                .iter()
                .filter_map(move |event| lookup(*state, *event).map(|to| (*state, *event, to)))
        })
        .collect()
}

// ============================================================================
// EXECUTION CONTEXT, HISTORY, PENDING UPDATES
// ============================================================================

/// Where the run currently is in the stage/step/behavior/action hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub current_stage_id: Option<String>,
    pub current_step_id: Option<String>,
    pub current_behavior_id: Option<String>,
    pub current_behavior_actions: Vec<Action>,
    pub current_action_index: usize,
    /// Stage to enter after the current one, set by a confirmed workflow update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ExecutionContext {
    pub fn current_action(&self) -> Option<&Action> {
        self.current_behavior_actions.get(self.current_action_index)
    }

    pub fn has_next_action(&self) -> bool {
        self.current_action_index + 1 < self.current_behavior_actions.len()
    }
}

/// One accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub from_state: WorkflowState,
    pub to_state: WorkflowState,
    pub event: EventKind,
    pub payload: serde_json::Value,
}

/// Append-only log of accepted transitions. Cleared only by `RESET`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    entries: Vec<ExecutionHistoryEntry>,
}

impl ExecutionHistory {
    fn push(&mut self, entry: ExecutionHistoryEntry) {
        self.entries.push(entry);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ExecutionHistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ExecutionHistoryEntry> {
        self.entries.last()
    }

    /// The newest `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<&ExecutionHistoryEntry> {
        self.entries.iter().rev().take(n).collect()
    }

    /// Sequence of states visited, starting from the first `from_state`.
    pub fn state_path(&self) -> Vec<WorkflowState> {
        let mut path: Vec<WorkflowState> = self
            .entries
            .first()
            .map(|e| vec![e.from_state])
            .unwrap_or_default();
        path.extend(self.entries.iter().map(|e| e.to_state));
        path
    }
}

/// A staged plan change awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingUpdate {
    Workflow {
        workflow_template: WorkflowTemplate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_stage_id: Option<String>,
    },
    Steps {
        stage_id: String,
        steps: Vec<Step>,
    },
}

/// Read-only view published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub run_id: Uuid,
    pub state: WorkflowState,
    pub context: ExecutionContext,
    pub pending: Option<PendingUpdate>,
    pub history_len: usize,
}

// ============================================================================
// WORKFLOW STATE MACHINE
// ============================================================================

/// Transition core. Single-threaded: the runner owns it exclusively.
pub struct WorkflowStateMachine {
    run_id: Uuid,
    state: WorkflowState,
    context: ExecutionContext,
    history: ExecutionHistory,
    pending: Option<PendingUpdate>,
    template: TemplateStore,
}

impl WorkflowStateMachine {
    pub fn new(template: TemplateStore) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: WorkflowState::Idle,
            context: ExecutionContext::default(),
            history: ExecutionHistory::default(),
            pending: None,
            template,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn pending(&self) -> Option<&PendingUpdate> {
        self.pending.as_ref()
    }

    pub fn template(&self) -> &TemplateStore {
        &self.template
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            run_id: self.run_id,
            state: self.state,
            context: self.context.clone(),
            pending: self.pending.clone(),
            history_len: self.history.len(),
        }
    }

    /// Begin a run at `stage_id`. Only legal from `IDLE`; elsewhere it is a
    /// rejected transition and nothing changes.
    pub fn start_workflow(
        &mut self,
        stage_id: impl Into<String>,
        step_id: Option<String>,
    ) -> Option<WorkflowState> {
        if self.state != WorkflowState::Idle {
            warn!(
                "Invalid transition: {} from {} (workflow already started)",
                EventKind::StartWorkflow,
                self.state
            );
            return None;
        }

        self.transition(WorkflowEvent::StartWorkflow {
            stage_id: stage_id.into(),
            step_id,
        })
    }

    /// Apply `event` if the table allows it from the current state.
    ///
    /// Returns the new state, or `None` when the transition was rejected, in
    /// which case state, context and history are untouched. A listed
    /// transition is still rejected when its payload would leave the context
    /// or a pending update invalid.
    pub fn transition(&mut self, event: WorkflowEvent) -> Option<WorkflowState> {
        let from = self.state;
        let kind = event.kind();

        let Some(to) = lookup(from, kind) else {
            warn!("Invalid transition: {} from {}", kind, from);
            return None;
        };

        if let Err(e) = self.check_payload(&event) {
            warn!("Invalid transition: {} from {} ({})", kind, from, e);
            return None;
        }

        if kind == EventKind::Reset {
            self.context = ExecutionContext::default();
            self.pending = None;
            self.history.clear();
            self.state = to;
            info!("Workflow reset: {} -> {}", from, to);
            return Some(to);
        }

        self.history.push(ExecutionHistoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            from_state: from,
            to_state: to,
            event: kind,
            payload: event.payload_json(),
        });
        self.state = to;
        self.apply(event);

        info!("Transition: {} --{}--> {}", from, kind, to);
        Some(to)
    }

    fn check_payload(&self, event: &WorkflowEvent) -> WorkflowResult<()> {
        let in_range = |index: usize, len: usize| {
            if index < len {
                Ok(())
            } else {
                Err(WorkflowError::ActionOutOfRange { index, len })
            }
        };

        match event {
            WorkflowEvent::UpdateWorkflow { template, .. } => Ok(template.validate()?),
            WorkflowEvent::UpdateStep { stage_id, steps } => {
                Ok(self.template.check_steps(stage_id, steps)?)
            }
            WorkflowEvent::StartAction { index, actions } => {
                let len = actions
                    .as_ref()
                    .map_or(self.context.current_behavior_actions.len(), Vec::len);
                in_range(*index, len)
            }
            WorkflowEvent::NextAction { index } => {
                in_range(*index, self.context.current_behavior_actions.len())
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, event: WorkflowEvent) {
        let ctx = &mut self.context;
        match event {
            WorkflowEvent::StartWorkflow { stage_id, step_id } => {
                *ctx = ExecutionContext {
                    current_stage_id: Some(stage_id),
                    current_step_id: step_id,
                    ..ExecutionContext::default()
                };
            }
            WorkflowEvent::NextStage { stage_id } => {
                *ctx = ExecutionContext {
                    current_stage_id: Some(stage_id),
                    ..ExecutionContext::default()
                };
            }
            WorkflowEvent::StartStep { step_id } | WorkflowEvent::NextStep { step_id } => {
                ctx.current_step_id = Some(step_id);
                ctx.current_behavior_id = None;
                ctx.current_behavior_actions.clear();
                ctx.current_action_index = 0;
            }
            WorkflowEvent::StartBehavior { behavior_id }
            | WorkflowEvent::NextBehavior { behavior_id } => {
                ctx.current_behavior_id = Some(behavior_id);
                ctx.current_behavior_actions.clear();
                ctx.current_action_index = 0;
            }
            WorkflowEvent::StartAction { index, actions } => {
                if let Some(actions) = actions {
                    ctx.current_behavior_actions = actions;
                }
                ctx.current_action_index = index;
            }
            WorkflowEvent::NextAction { index } => {
                ctx.current_action_index = index;
            }
            WorkflowEvent::UpdateWorkflow {
                template,
                next_stage_id,
            } => {
                self.pending = Some(PendingUpdate::Workflow {
                    workflow_template: template,
                    next_stage_id,
                });
            }
            WorkflowEvent::UpdateStep { stage_id, steps } => {
                self.pending = Some(PendingUpdate::Steps { stage_id, steps });
            }
            WorkflowEvent::UpdateWorkflowConfirmed | WorkflowEvent::UpdateStepConfirmed => {
                self.apply_pending();
            }
            WorkflowEvent::UpdateWorkflowRejected | WorkflowEvent::UpdateStepRejected => {
                if self.pending.take().is_some() {
                    info!("Pending update discarded");
                }
            }
            WorkflowEvent::Fail { error } => {
                ctx.last_error = Some(error);
            }
            WorkflowEvent::Cancel => {
                self.pending = None;
            }
            WorkflowEvent::CompleteAction
            | WorkflowEvent::CompleteBehavior
            | WorkflowEvent::CompleteStep
            | WorkflowEvent::CompleteStage { .. }
            | WorkflowEvent::CompleteWorkflow
            | WorkflowEvent::Reset => {}
        }
    }

    fn apply_pending(&mut self) {
        match self.pending.take() {
            Some(PendingUpdate::Workflow {
                workflow_template,
                next_stage_id,
            }) => {
                info!("Applying workflow update '{}'", workflow_template.name);
                self.template.replace(workflow_template);
                self.context.next_stage_override = next_stage_id;
            }
            Some(PendingUpdate::Steps { stage_id, steps }) => {
                info!("Applying step update for stage {}", stage_id);
                // checked when proposed; the template cannot change while pending
                if let Err(e) = self.template.replace_steps(&stage_id, steps) {
                    warn!("Confirmed step update could not be applied: {}", e);
                }
            }
            None => warn!("Update confirmed with nothing pending"),
        }
    }
}

impl fmt::Debug for WorkflowStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStateMachine")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("history_len", &self.history.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
