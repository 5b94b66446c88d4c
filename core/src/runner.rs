//! Effect dispatch loop.
//!
//! One tokio task owns the [`WorkflowStateMachine`]. External commands and
//! effect completions share a single queue and are processed strictly in
//! order. Every accepted transition into a state with an effect spawns one
//! effect task tagged with a generation number; completions from an older
//! generation are dropped.

use crate::action::UpdateRequester;
use crate::config::RunnerConfig;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::executor::{EffectDeps, Executor};
use crate::state_machine::{
    ExecutionHistory, MachineSnapshot, WorkflowEvent, WorkflowState, WorkflowStateMachine,
};
use crate::template::{Step, WorkflowTemplate};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// COMMANDS
// ============================================================================

enum Command {
    Start {
        stage_id: String,
        step_id: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    Transition {
        event: WorkflowEvent,
        reply: oneshot::Sender<bool>,
    },
    EffectDone {
        generation: u64,
        result: WorkflowResult<WorkflowEvent>,
    },
    History {
        reply: oneshot::Sender<ExecutionHistory>,
    },
    Shutdown {
        reply: oneshot::Sender<bool>,
    },
}

async fn request<T>(
    tx: &mpsc::Sender<Command>,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> WorkflowResult<T> {
    let (reply, response) = oneshot::channel();
    tx.send(build(reply))
        .await
        .map_err(|_| WorkflowError::RunnerClosed)?;
    response.await.map_err(|_| WorkflowError::RunnerClosed)
}

// ============================================================================
// HANDLE
// ============================================================================

/// Cloneable front door to a running workflow.
#[derive(Clone)]
pub struct WorkflowHandle {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<MachineSnapshot>,
    executor: Arc<Executor>,
}

impl WorkflowHandle {
    pub async fn start_workflow(
        &self,
        stage_id: impl Into<String>,
        step_id: Option<String>,
    ) -> WorkflowResult<bool> {
        let stage_id = stage_id.into();
        request(&self.tx, |reply| Command::Start {
            stage_id,
            step_id,
            reply,
        })
        .await
    }

    /// Submit an event. Returns whether the machine accepted it.
    pub async fn transition(&self, event: WorkflowEvent) -> WorkflowResult<bool> {
        request(&self.tx, |reply| Command::Transition { event, reply }).await
    }

    pub async fn fail(&self, error: impl Into<String>) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::Fail {
            error: error.into(),
        })
        .await
    }

    pub async fn cancel(&self) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::Cancel).await
    }

    pub async fn reset(&self) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::Reset).await
    }

    pub async fn request_workflow_update(
        &self,
        template: WorkflowTemplate,
        next_stage_id: Option<String>,
    ) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::UpdateWorkflow {
            template,
            next_stage_id,
        })
        .await
    }

    pub async fn request_step_update(
        &self,
        stage_id: impl Into<String>,
        steps: Vec<Step>,
    ) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::UpdateStep {
            stage_id: stage_id.into(),
            steps,
        })
        .await
    }

    pub async fn confirm_workflow_update(&self) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::UpdateWorkflowConfirmed).await
    }

    pub async fn reject_workflow_update(&self) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::UpdateWorkflowRejected).await
    }

    pub async fn confirm_step_update(&self) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::UpdateStepConfirmed).await
    }

    pub async fn reject_step_update(&self) -> WorkflowResult<bool> {
        self.transition(WorkflowEvent::UpdateStepRejected).await
    }

    /// Stop the runner. Any in-flight effect is cancelled.
    pub async fn shutdown(&self) -> WorkflowResult<bool> {
        request(&self.tx, |reply| Command::Shutdown { reply }).await
    }

    /// Full execution history, oldest first.
    pub async fn history(&self) -> WorkflowResult<ExecutionHistory> {
        request(&self.tx, |reply| Command::History { reply }).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&MachineSnapshot) -> bool,
    ) -> WorkflowResult<MachineSnapshot> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| WorkflowError::RunnerClosed)?;
        Ok(snapshot.clone())
    }

    /// Wait for a terminal or pending state.
    pub async fn wait_until_settled(&self) -> WorkflowResult<MachineSnapshot> {
        self.wait_until(|s| s.state.is_terminal() || s.state.is_pending())
            .await
    }

    pub fn malformed_lines(&self) -> u64 {
        self.executor.malformed_lines()
    }
}

/// Update channel handed to running actions. Holds a weak sender so that
/// the runner stops once every [`WorkflowHandle`] is dropped.
struct RunnerUpdates {
    tx: mpsc::WeakSender<Command>,
}

impl RunnerUpdates {
    async fn submit(&self, event: WorkflowEvent) -> WorkflowResult<bool> {
        let tx = self.tx.upgrade().ok_or(WorkflowError::RunnerClosed)?;
        request(&tx, |reply| Command::Transition { event, reply }).await
    }
}

#[async_trait]
impl UpdateRequester for RunnerUpdates {
    async fn request_workflow_update(
        &self,
        template: WorkflowTemplate,
        next_stage_id: Option<String>,
    ) -> WorkflowResult<bool> {
        self.submit(WorkflowEvent::UpdateWorkflow {
            template,
            next_stage_id,
        })
        .await
    }

    async fn request_step_update(
        &self,
        stage_id: String,
        steps: Vec<Step>,
    ) -> WorkflowResult<bool> {
        self.submit(WorkflowEvent::UpdateStep { stage_id, steps })
            .await
    }
}

// ============================================================================
// RUNNER
// ============================================================================

struct ActiveEffect {
    generation: u64,
    state: WorkflowState,
    token: CancellationToken,
}

pub struct WorkflowRunner {
    machine: WorkflowStateMachine,
    executor: Arc<Executor>,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::WeakSender<Command>,
    snapshots: watch::Sender<MachineSnapshot>,
    generation: u64,
    active: Option<ActiveEffect>,
}

impl WorkflowRunner {
    /// Start the dispatch task and return a handle to it.
    pub fn spawn(deps: EffectDeps, config: &RunnerConfig) -> (WorkflowHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let machine = WorkflowStateMachine::new(deps.template.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());
        let executor = Arc::new(Executor::new(deps));

        let runner = WorkflowRunner {
            machine,
            executor: executor.clone(),
            rx,
            tx: tx.downgrade(),
            snapshots: snapshot_tx,
            generation: 0,
            active: None,
        };

        let handle = WorkflowHandle {
            tx,
            snapshots: snapshot_rx,
            executor,
        };

        (handle, tokio::spawn(runner.run()))
    }

    async fn run(mut self) {
        info!("Workflow runner {} started", self.machine.run_id());

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Start {
                    stage_id,
                    step_id,
                    reply,
                } => {
                    let accepted = match self.machine.start_workflow(stage_id, step_id) {
                        Some(state) => {
                            self.on_enter(state);
                            true
                        }
                        None => false,
                    };
                    self.publish();
                    let _ = reply.send(accepted);
                }
                Command::Transition { event, reply } => {
                    let accepted = self.apply(event);
                    self.publish();
                    let _ = reply.send(accepted);
                }
                Command::EffectDone { generation, result } => {
                    self.on_effect_done(generation, result);
                    self.publish();
                }
                Command::History { reply } => {
                    let _ = reply.send(self.machine.history().clone());
                }
                Command::Shutdown { reply } => {
                    self.cancel_active();
                    let _ = reply.send(true);
                    break;
                }
            }
        }

        self.cancel_active();
        info!(
            "Workflow runner {} stopped in state {}",
            self.machine.run_id(),
            self.machine.state()
        );
    }

    // published before replying so callers observe their own command
    fn publish(&self) {
        self.snapshots.send_replace(self.machine.snapshot());
    }

    fn apply(&mut self, event: WorkflowEvent) -> bool {
        match self.machine.transition(event) {
            Some(state) => {
                self.on_enter(state);
                true
            }
            None => false,
        }
    }

    fn on_enter(&mut self, state: WorkflowState) {
        match state {
            WorkflowState::Cancelled | WorkflowState::Error | WorkflowState::Idle => {
                self.cancel_active();
            }
            WorkflowState::WorkflowCompleted => {
                info!("Workflow {} completed", self.machine.run_id());
            }
            s if s.has_effect() => self.spawn_effect(s),
            // pending: the running action finishes and its completion is rejected
            _ => {}
        }
    }

    fn on_effect_done(&mut self, generation: u64, result: WorkflowResult<WorkflowEvent>) {
        let state = match &self.active {
            Some(active) if active.generation == generation => active.state,
            _ => {
                debug!("Dropping completion from superseded effect (generation {})", generation);
                return;
            }
        };
        self.active = None;

        let event = match result {
            Ok(event) => event,
            Err(e) => {
                error!("Effect for {} failed: {}", state, e);
                WorkflowEvent::fail(e)
            }
        };
        self.apply(event);
    }

    fn spawn_effect(&mut self, state: WorkflowState) {
        self.cancel_active();

        let Some(tx) = self.tx.upgrade() else {
            warn!("No handles left, not scheduling effect for {}", state);
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        self.active = Some(ActiveEffect {
            generation,
            state,
            token: token.clone(),
        });

        let executor = self.executor.clone();
        let ctx = self.machine.context().clone();
        let updates: Arc<dyn UpdateRequester> = Arc::new(RunnerUpdates {
            tx: self.tx.clone(),
        });

        debug!("Scheduling effect for {} (generation {})", state, generation);

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                result = executor.run_effect(state, &ctx, updates) => Some(result),
            }
        });

        tokio::spawn(async move {
            let result = match task.await {
                Ok(Some(result)) => result,
                Ok(None) => {
                    debug!("Effect for {} cancelled (generation {})", state, generation);
                    return;
                }
                Err(e) => Err(WorkflowError::EffectPanicked(e.to_string())),
            };
            let _ = tx.send(Command::EffectDone { generation, result }).await;
        });
    }

    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(
                "Cancelling effect for {} (generation {})",
                active.state, active.generation
            );
            active.token.cancel();
        }
    }
}
