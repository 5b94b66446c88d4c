use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use stepwise_core::{
    ContextStore, EffectDeps, ExecutionHistory, HttpBackend, LocalActionExecutor,
    MachineSnapshot, PendingUpdate, StepwiseConfig, TemplateStore, WorkflowHandle,
    WorkflowRunner, WorkflowState,
};
use tokio::sync::oneshot;
use tracing::info;

pub async fn execute(
    config: &StepwiseConfig,
    template_path: &Path,
    stage: Option<&str>,
    step: Option<&str>,
    auto_confirm: bool,
    history_out: Option<&Path>,
) -> Result<()> {
    let template = TemplateStore::load(template_path)
        .with_context(|| format!("Failed to load template {}", template_path.display()))?;

    let stage_id = match stage {
        Some(id) => id.to_string(),
        None => template
            .read(|t| t.stages.first().map(|s| s.id.clone()))
            .ok_or_else(|| anyhow!("Template has no stages"))?,
    };

    println!("{}", "Starting workflow...".green().bold());
    println!("  Template: {}", template.read(|t| t.name.clone()).cyan());
    println!("  Backend: {}", config.backend.base_url.yellow());
    println!("  Stage: {}", stage_id.yellow());
    if let Some(step) = step {
        println!("  Step: {}", step.yellow());
    }
    println!();

    let backend = HttpBackend::new(config.backend.clone())?;
    let context = ContextStore::new();
    let (handle, join) = WorkflowRunner::spawn(
        EffectDeps {
            backend: Arc::new(backend),
            actions: Arc::new(LocalActionExecutor::new()),
            template: template.clone(),
            context: context.clone(),
        },
        &config.runner,
    );

    if !handle
        .start_workflow(stage_id.as_str(), step.map(String::from))
        .await?
    {
        return Err(anyhow!("Workflow could not be started"));
    }

    let last = drive(&handle, auto_confirm).await?;
    let history = handle.history().await?;

    println!();
    print_summary(&last, &history, handle.malformed_lines());

    if let Some(path) = history_out {
        write_history(path, &last, &history)?;
        println!("  History: {}", path.display().to_string().dimmed());
    }

    handle.shutdown().await?;
    join.await?;

    match last.state {
        WorkflowState::WorkflowCompleted => {
            let done = context.snapshot().stage_completion.len();
            info!("Run {} finished, {} stages completed", last.run_id, done);
            Ok(())
        }
        WorkflowState::Cancelled => Err(anyhow!("Workflow cancelled")),
        _ => Err(anyhow!(
            "Workflow failed: {}",
            last.context.last_error.as_deref().unwrap_or("unknown error")
        )),
    }
}

/// Follow the run until it reaches a terminal state, answering update gates
/// and turning Ctrl-C into a cancel.
async fn drive(handle: &WorkflowHandle, auto_confirm: bool) -> Result<MachineSnapshot> {
    let mut rx = handle.subscribe();
    let mut last_state = WorkflowState::Idle;

    loop {
        let snapshot = rx.borrow_and_update().clone();

        if snapshot.state != last_state {
            print_state(&snapshot);
            last_state = snapshot.state;
        }

        if snapshot.state.is_terminal() {
            return Ok(snapshot);
        }

        if let Some(pending) = snapshot.pending.as_ref().filter(|_| snapshot.state.is_pending()) {
            decide(handle, pending, auto_confirm).await?;
            continue;
        }

        tokio::select! {
            changed = rx.changed() => changed?,
            _ = tokio::signal::ctrl_c() => {
                println!("\n{}", "Cancelling workflow...".yellow());
                handle.cancel().await?;
            }
        }
    }
}

async fn decide(handle: &WorkflowHandle, pending: &PendingUpdate, auto_confirm: bool) -> Result<()> {
    let question = match pending {
        PendingUpdate::Workflow {
            workflow_template,
            next_stage_id,
        } => format!(
            "Replace workflow with '{}' ({} stages{})?",
            workflow_template.name,
            workflow_template.stages.len(),
            next_stage_id
                .as_deref()
                .map(|s| format!(", continuing at {}", s))
                .unwrap_or_default()
        ),
        PendingUpdate::Steps { stage_id, steps } => format!(
            "Replace steps of stage {} with [{}]?",
            stage_id,
            steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(", ")
        ),
    };

    let approve = if auto_confirm {
        println!("  {} {}", "auto-confirm:".dimmed(), question);
        Some(true)
    } else {
        tokio::select! {
            answer = prompt_yes_no(question) => Some(answer?),
            _ = tokio::signal::ctrl_c() => None,
        }
    };

    let accepted = match (pending, approve) {
        (_, None) => {
            println!("\n{}", "Cancelling workflow...".yellow());
            handle.cancel().await?
        }
        (PendingUpdate::Workflow { .. }, Some(true)) => handle.confirm_workflow_update().await?,
        (PendingUpdate::Workflow { .. }, Some(false)) => handle.reject_workflow_update().await?,
        (PendingUpdate::Steps { .. }, Some(true)) => handle.confirm_step_update().await?,
        (PendingUpdate::Steps { .. }, Some(false)) => handle.reject_step_update().await?,
    };

    if !accepted {
        return Err(anyhow!("Update decision was not accepted by the workflow"));
    }
    Ok(())
}

/// Ask on stdin. The read runs on a detached thread: a prompt abandoned on
/// Ctrl-C must not keep the runtime from shutting down.
async fn prompt_yes_no(question: String) -> Result<bool> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(read_answer(&question));
    });
    let answer = rx.await.context("Prompt thread exited without an answer")??;
    Ok(answer)
}

fn read_answer(question: &str) -> io::Result<bool> {
    print!("  {} {} ", question.bold(), "[y/N]".dimmed());
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_state(snapshot: &MachineSnapshot) {
    let ctx = &snapshot.context;
    let location = [
        ctx.current_stage_id.as_deref(),
        ctx.current_step_id.as_deref(),
        ctx.current_behavior_id.as_deref(),
    ]
    .iter()
    .flatten()
    .copied()
    .collect::<Vec<_>>()
    .join(" / ");

    let state = match snapshot.state {
        WorkflowState::WorkflowCompleted => snapshot.state.as_str().green().bold(),
        WorkflowState::Error => snapshot.state.as_str().red().bold(),
        WorkflowState::Cancelled => snapshot.state.as_str().yellow().bold(),
        s if s.is_pending() => s.as_str().magenta(),
        s => s.as_str().cyan(),
    };

    if snapshot.state == WorkflowState::ActionRunning {
        let action = ctx
            .current_action()
            .map(|a| a.kind.as_str())
            .unwrap_or("?");
        println!(
            "  {:<24} {} {}",
            state,
            location.dimmed(),
            format!(
                "[{}/{} {}]",
                ctx.current_action_index + 1,
                ctx.current_behavior_actions.len(),
                action
            )
            .dimmed()
        );
    } else {
        println!("  {:<24} {}", state, location.dimmed());
    }
}

fn print_summary(snapshot: &MachineSnapshot, history: &ExecutionHistory, malformed: u64) {
    let outcome = match snapshot.state {
        WorkflowState::WorkflowCompleted => "completed".green().bold(),
        WorkflowState::Cancelled => "cancelled".yellow().bold(),
        _ => "failed".red().bold(),
    };
    println!("{} {}", "Workflow".bold(), outcome);
    println!("  Run: {}", snapshot.run_id.to_string().dimmed());
    println!("  Transitions: {}", history.len());
    if malformed > 0 {
        println!("  Malformed sequence lines: {}", malformed.to_string().yellow());
    }
    if let Some(error) = &snapshot.context.last_error {
        println!("  Error: {}", error.red());
    }

    println!("  Recent:");
    for entry in history.recent(5) {
        println!(
            "    {} {} --{}--> {}",
            entry.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            entry.from_state,
            entry.event,
            entry.to_state
        );
    }
}

fn write_history(path: &Path, snapshot: &MachineSnapshot, history: &ExecutionHistory) -> Result<()> {
    let document = serde_json::json!({
        "snapshot": snapshot,
        "history": history.entries(),
    });
    std::fs::write(path, serde_json::to_string_pretty(&document)?)
        .with_context(|| format!("Failed to write history to {}", path.display()))?;
    Ok(())
}
