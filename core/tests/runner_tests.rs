/// Integration tests for the workflow runner.
///
/// Drives complete runs against a scripted in-memory backend and checks
/// the resulting state, history and context store.
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stepwise_core::{
    Action, ActionExecutor, ActionScope, BackendResult, ContextStore, EffectDeps, EventKind,
    FeedbackRequest, FeedbackResponse, LocalActionExecutor, MachineSnapshot, RunnerConfig,
    SequenceRecord, SequenceRequest, SequenceStream, Stage, Step, TemplateStore, WorkflowBackend,
    WorkflowError, WorkflowEvent, WorkflowHandle, WorkflowResult, WorkflowRunner, WorkflowState,
    WorkflowTemplate,
};
use tokio::time::{sleep, timeout, Duration};

// ===== Scripted backend =====

#[derive(Default)]
struct ScriptedBackend {
    /// Queued action lists per behavior id; empty once exhausted
    sequences: Mutex<HashMap<String, VecDeque<Vec<Action>>>>,
    feedback: Mutex<VecDeque<FeedbackResponse>>,
    calls: Mutex<Vec<(String, usize, String)>>,
    hang: bool,
    dropped: Arc<AtomicBool>,
}

impl ScriptedBackend {
    fn with_sequence(self, behavior_id: &str, actions: Vec<Action>) -> Self {
        self.sequences
            .lock()
            .entry(behavior_id.to_string())
            .or_default()
            .push_back(actions);
        self
    }

    fn with_feedback(self, feedback: FeedbackResponse) -> Self {
        self.feedback.lock().push_back(feedback);
        self
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkflowBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn sequence(&self, request: SequenceRequest) -> BackendResult<SequenceStream> {
        let behavior = request.state["current_behavior_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.calls
            .lock()
            .push((request.stage_id, request.step_index, behavior.clone()));

        if self.hang {
            let _guard = DropFlag(self.dropped.clone());
            return futures::future::pending().await;
        }

        let actions = self
            .sequences
            .lock()
            .get_mut(&behavior)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default();
        let records: Vec<BackendResult<SequenceRecord>> = actions
            .into_iter()
            .map(|a| Ok(SequenceRecord::Action(a)))
            .collect();
        Ok(Box::pin(futures::stream::iter(records)))
    }

    async fn feedback(&self, _request: FeedbackRequest) -> BackendResult<FeedbackResponse> {
        Ok(self.feedback.lock().pop_front().unwrap_or(FeedbackResponse {
            target_achieved: true,
            ..FeedbackResponse::default()
        }))
    }
}

struct PanickingExecutor;

#[async_trait]
impl ActionExecutor for PanickingExecutor {
    async fn execute(&self, action: &Action, _scope: &ActionScope) -> WorkflowResult<()> {
        panic!("executor blew up on {}", action.kind);
    }
}

// ===== Helpers =====

fn two_stage_template() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "pipeline",
        vec![
            Stage::new("s1", vec![Step::new("a"), Step::new("b")]),
            Stage::new("s2", vec![Step::new("c")]),
        ],
    )
}

struct Harness {
    handle: WorkflowHandle,
    backend: Arc<ScriptedBackend>,
    template: TemplateStore,
    context: ContextStore,
}

fn spawn_with(
    template: WorkflowTemplate,
    backend: ScriptedBackend,
    actions: Arc<dyn ActionExecutor>,
) -> Harness {
    let backend = Arc::new(backend);
    let template = TemplateStore::new(template);
    let context = ContextStore::new();
    let (handle, _join) = WorkflowRunner::spawn(
        EffectDeps {
            backend: backend.clone(),
            actions,
            template: template.clone(),
            context: context.clone(),
        },
        &RunnerConfig::default(),
    );
    Harness {
        handle,
        backend,
        template,
        context,
    }
}

fn spawn(template: WorkflowTemplate, backend: ScriptedBackend) -> Harness {
    spawn_with(template, backend, Arc::new(LocalActionExecutor::new()))
}

async fn wait_for_state(handle: &WorkflowHandle, target: WorkflowState) -> MachineSnapshot {
    timeout(Duration::from_secs(5), handle.wait_until(|s| s.state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", target))
        .unwrap()
}

fn think(text: &str) -> Action {
    Action::new("think").with_arg("text", json!(text))
}

// ===== Tests =====

#[tokio::test]
async fn test_runs_to_completion() {
    let backend = ScriptedBackend::default().with_sequence("a:default", vec![think("one"), think("two")]);
    let h = spawn(two_stage_template(), backend);

    assert!(h.handle.start_workflow("s1", None).await.unwrap());
    wait_for_state(&h.handle, WorkflowState::WorkflowCompleted).await;

    let history = h.handle.history().await.unwrap();
    let actions_run = history
        .entries()
        .iter()
        .filter(|e| e.to_state == WorkflowState::ActionRunning)
        .count();
    assert_eq!(actions_run, 2);
    assert_eq!(history.last().unwrap().event, EventKind::CompleteWorkflow);
    assert_eq!(history.state_path()[0], WorkflowState::Idle);

    let snap = h.context.snapshot();
    assert_eq!(snap.thinking.len(), 2);
    assert!(h.context.is_stage_completed("s1"));
    assert!(h.context.is_stage_completed("s2"));

    // one sequence call per step, step_index is the position in its stage
    let calls = h.backend.calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            ("s1".to_string(), 0, "a:default".to_string()),
            ("s1".to_string(), 1, "b:default".to_string()),
            ("s2".to_string(), 0, "c:default".to_string()),
        ]
    );

    assert!(h.handle.reset().await.unwrap());
    let snap = h.handle.snapshot();
    assert_eq!(snap.state, WorkflowState::Idle);
    assert_eq!(snap.context, stepwise_core::ExecutionContext::default());
}

#[tokio::test]
async fn test_missed_target_retries_behavior() {
    let template = WorkflowTemplate::new("w", vec![Stage::new("s1", vec![Step::new("a")])]);
    let backend = ScriptedBackend::default().with_feedback(FeedbackResponse {
        target_achieved: false,
        ..FeedbackResponse::default()
    });
    let h = spawn(template, backend);

    h.handle.start_workflow("s1", None).await.unwrap();
    wait_for_state(&h.handle, WorkflowState::WorkflowCompleted).await;

    let history = h.handle.history().await.unwrap();
    let retry = history
        .entries()
        .iter()
        .find(|e| e.event == EventKind::NextBehavior)
        .unwrap();
    assert_eq!(retry.payload["behavior_id"], json!("a:default"));
    assert_eq!(h.backend.calls.lock().len(), 2);
}

#[tokio::test]
async fn test_feedback_switches_behavior() {
    let template = WorkflowTemplate::new(
        "w",
        vec![Stage::new("s1", vec![Step::new("a").with_behaviors(["explore"])])],
    );
    let backend = ScriptedBackend::default()
        .with_feedback(FeedbackResponse {
            target_achieved: true,
            step_completed: None,
            next_behavior_id: Some("refine".to_string()),
        })
        .with_feedback(FeedbackResponse {
            target_achieved: true,
            step_completed: Some(true),
            next_behavior_id: None,
        });
    let h = spawn(template, backend);

    h.handle.start_workflow("s1", None).await.unwrap();
    wait_for_state(&h.handle, WorkflowState::WorkflowCompleted).await;

    let behaviors: Vec<String> = h.backend.calls.lock().iter().map(|c| c.2.clone()).collect();
    assert_eq!(behaviors, vec!["explore", "refine"]);
}

#[tokio::test]
async fn test_stage_without_steps_fails_then_resets() {
    let template = WorkflowTemplate::new("w", vec![Stage::new("empty", vec![])]);
    let h = spawn(template, ScriptedBackend::default());

    h.handle.start_workflow("empty", None).await.unwrap();
    let snap = wait_for_state(&h.handle, WorkflowState::Error).await;
    assert!(snap.context.last_error.unwrap().contains("no steps"));

    // terminal until reset
    assert!(!h.handle.start_workflow("empty", None).await.unwrap());
    assert!(h.handle.reset().await.unwrap());

    let snap = h.handle.snapshot();
    assert_eq!(snap.state, WorkflowState::Idle);
    assert_eq!(snap.history_len, 0);
    assert!(h.handle.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_stage_fails() {
    let h = spawn(two_stage_template(), ScriptedBackend::default());
    h.handle.start_workflow("nope", None).await.unwrap();
    let snap = wait_for_state(&h.handle, WorkflowState::Error).await;
    assert!(snap.context.last_error.unwrap().contains("Stage not found"));
}

#[tokio::test]
async fn test_start_hint_selects_step() {
    let h = spawn(two_stage_template(), ScriptedBackend::default());
    h.handle
        .start_workflow("s1", Some("b".to_string()))
        .await
        .unwrap();
    wait_for_state(&h.handle, WorkflowState::WorkflowCompleted).await;

    let first = h.backend.calls.lock()[0].clone();
    assert_eq!(first, ("s1".to_string(), 1, "b:default".to_string()));
}

#[tokio::test]
async fn test_start_rejected_while_running() {
    let h = spawn(two_stage_template(), ScriptedBackend::hanging());
    assert!(h.handle.start_workflow("s1", None).await.unwrap());
    wait_for_state(&h.handle, WorkflowState::BehaviorRunning).await;

    let before = h.handle.snapshot();
    assert!(!h.handle.start_workflow("s2", None).await.unwrap());
    assert_eq!(h.handle.snapshot(), before);
}

#[tokio::test]
async fn test_cancel_drops_inflight_request() {
    let h = spawn(two_stage_template(), ScriptedBackend::hanging());
    h.handle.start_workflow("s1", None).await.unwrap();
    wait_for_state(&h.handle, WorkflowState::BehaviorRunning).await;

    assert!(h.handle.cancel().await.unwrap());
    assert_eq!(h.handle.snapshot().state, WorkflowState::Cancelled);

    timeout(Duration::from_secs(5), async {
        while !h.backend.dropped.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("in-flight sequence request was not dropped");

    // a late completion finds no transition
    let len = h.handle.snapshot().history_len;
    assert!(!h.handle.transition(WorkflowEvent::CompleteBehavior).await.unwrap());
    assert_eq!(h.handle.snapshot().state, WorkflowState::Cancelled);
    assert_eq!(h.handle.snapshot().history_len, len);
}

#[tokio::test]
async fn test_workflow_update_confirmed() {
    let replacement = json!({
        "name": "pipeline-v2",
        "stages": [
            {"id": "s1", "steps": [{"id": "a"}]},
            {"id": "s2", "steps": [{"id": "c"}]},
            {"id": "s9", "steps": [{"id": "z"}]}
        ]
    });
    let backend = ScriptedBackend::default().with_sequence(
        "a:default",
        vec![Action::new("update_workflow")
            .with_arg("template", replacement)
            .with_arg("next_stage_id", json!("s9"))],
    );
    let h = spawn(two_stage_template(), backend);

    h.handle.start_workflow("s1", None).await.unwrap();
    let snap = wait_for_state(&h.handle, WorkflowState::WorkflowUpdatePending).await;
    assert!(snap.pending.is_some());

    // suspended: only confirm, reject or cancel are accepted
    assert!(!h.handle.transition(WorkflowEvent::CompleteAction).await.unwrap());

    assert!(h.handle.confirm_workflow_update().await.unwrap());
    wait_for_state(&h.handle, WorkflowState::WorkflowCompleted).await;

    assert_eq!(h.template.snapshot().name, "pipeline-v2");
    let stages: Vec<String> = h.backend.calls.lock().iter().map(|c| c.0.clone()).collect();
    assert_eq!(stages, vec!["s1", "s9"]);
}

#[tokio::test]
async fn test_step_update_rejected() {
    let backend = ScriptedBackend::default().with_sequence(
        "a:default",
        vec![Action::new("update_steps").with_arg("steps", json!([{"id": "a"}, {"id": "extra"}]))],
    );
    let h = spawn(
        WorkflowTemplate::new("w", vec![Stage::new("s1", vec![Step::new("a")])]),
        backend,
    );

    h.handle.start_workflow("s1", None).await.unwrap();
    wait_for_state(&h.handle, WorkflowState::StepUpdatePending).await;

    assert!(!h.handle.confirm_workflow_update().await.unwrap());
    assert!(h.handle.reject_step_update().await.unwrap());
    wait_for_state(&h.handle, WorkflowState::WorkflowCompleted).await;

    assert_eq!(h.template.snapshot().stages[0].steps.len(), 1);
    assert_eq!(h.backend.calls.lock().len(), 1);
}

#[tokio::test]
async fn test_workflow_update_rejected() {
    let replacement = json!({
        "name": "pipeline-v2",
        "stages": [{"id": "s9", "steps": [{"id": "z"}]}]
    });
    let backend = ScriptedBackend::default().with_sequence(
        "a:default",
        vec![Action::new("update_workflow")
            .with_arg("template", replacement)
            .with_arg("next_stage_id", json!("s9"))],
    );
    let h = spawn(two_stage_template(), backend);

    h.handle.start_workflow("s1", None).await.unwrap();
    wait_for_state(&h.handle, WorkflowState::WorkflowUpdatePending).await;

    assert!(!h.handle.reject_step_update().await.unwrap());
    assert!(h.handle.reject_workflow_update().await.unwrap());
    let snap = wait_for_state(&h.handle, WorkflowState::WorkflowCompleted).await;

    assert!(snap.pending.is_none());
    assert_eq!(snap.context.next_stage_override, None);
    assert_eq!(h.template.snapshot(), two_stage_template());

    let stages: Vec<String> = h.backend.calls.lock().iter().map(|c| c.0.clone()).collect();
    assert_eq!(stages, vec!["s1", "s1", "s2"]);
    assert!(h.context.is_stage_completed("s1"));
    assert!(h.context.is_stage_completed("s2"));

    let history = h.handle.history().await.unwrap();
    let rejected = history
        .entries()
        .iter()
        .find(|e| e.event == EventKind::UpdateWorkflowRejected)
        .unwrap();
    assert_eq!(rejected.to_state, WorkflowState::ActionCompleted);
}

#[tokio::test]
async fn test_invalid_step_proposal_fails_action() {
    let backend = ScriptedBackend::default().with_sequence(
        "a:default",
        vec![Action::new("update_steps").with_arg("steps", json!([{"id": "q"}, {"id": "q"}]))],
    );
    let h = spawn(two_stage_template(), backend);

    h.handle.start_workflow("s1", None).await.unwrap();
    let snap = wait_for_state(&h.handle, WorkflowState::Error).await;

    assert!(snap.pending.is_none());
    assert!(snap.context.last_error.unwrap().contains("not accepted"));
    assert_eq!(h.template.snapshot(), two_stage_template());

    let history = h.handle.history().await.unwrap();
    assert!(!history
        .entries()
        .iter()
        .any(|e| e.event == EventKind::UpdateStep));
}

#[tokio::test]
async fn test_update_request_outside_action_rejected() {
    let h = spawn(two_stage_template(), ScriptedBackend::hanging());
    h.handle.start_workflow("s1", None).await.unwrap();
    wait_for_state(&h.handle, WorkflowState::BehaviorRunning).await;

    assert!(!h
        .handle
        .request_step_update("s1", vec![Step::new("x")])
        .await
        .unwrap());
    assert!(h.handle.snapshot().pending.is_none());
}

#[tokio::test]
async fn test_action_error_becomes_fail() {
    let backend = ScriptedBackend::default()
        .with_sequence("a:default", vec![Action::new("check_item").with_arg("id", json!("missing"))]);
    let h = spawn(two_stage_template(), backend);

    h.handle.start_workflow("s1", None).await.unwrap();
    let snap = wait_for_state(&h.handle, WorkflowState::Error).await;
    assert!(snap
        .context
        .last_error
        .unwrap()
        .contains("checklist item not found"));

    let history = h.handle.history().await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.event, EventKind::Fail);
    assert_eq!(last.from_state, WorkflowState::ActionRunning);
}

#[tokio::test]
async fn test_panicking_effect_becomes_fail() {
    let backend = ScriptedBackend::default().with_sequence("a:default", vec![think("x")]);
    let h = spawn_with(two_stage_template(), backend, Arc::new(PanickingExecutor));

    h.handle.start_workflow("s1", None).await.unwrap();
    let snap = wait_for_state(&h.handle, WorkflowState::Error).await;
    assert!(snap.context.last_error.unwrap().contains("Effect task failed"));
}

#[tokio::test]
async fn test_subscribe_sees_terminal_state() {
    let h = spawn(two_stage_template(), ScriptedBackend::default());
    let mut rx = h.handle.subscribe();

    h.handle.start_workflow("s1", None).await.unwrap();
    timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.state == WorkflowState::WorkflowCompleted),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_handle() {
    let h = spawn(two_stage_template(), ScriptedBackend::default());
    assert!(h.handle.shutdown().await.unwrap());
    assert!(matches!(
        h.handle.start_workflow("s1", None).await,
        Err(WorkflowError::RunnerClosed)
    ));
}
