//! Run lifecycle controller.
//!
//! Spawns a workflow and races it against Ctrl-C, turning the first signal into
//! a cooperative cancel and the second into an abort.

use crate::engine::{Cancelled, EngineControl, WorkflowEngine};
use crate::model::{RunConfig, WorkflowOutcome};
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Which Terraform flow to drive.
#[derive(Debug, Clone)]
pub(crate) enum Flow {
    RunWorkspace,
    ConfirmApply { run_id: String },
}

/// Run `flow` to completion, cancelling it when the user presses Ctrl-C.
pub(crate) async fn run_controller(cfg: RunConfig, flow: Flow) -> Result<WorkflowOutcome> {
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    let engine = WorkflowEngine::new(cfg);
    let mut handle = tokio::spawn(async move {
        match flow {
            Flow::RunWorkspace => engine.run_workspace(ctrl_rx).await,
            Flow::ConfirmApply { run_id } => engine.confirm_apply(run_id, ctrl_rx).await,
        }
    });

    let mut signals_armed = true;
    let mut cancel_sent = false;
    // Cancel watchdog: a request in flight can delay the next cancel check.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            // Awaiting by reference keeps the handle alive if another branch wins.
            joined = &mut handle => {
                return joined.context("workflow task failed")?;
            }
            sig = tokio::signal::ctrl_c(), if signals_armed => {
                if let Err(e) = sig {
                    tracing::warn!("Ctrl-C handling unavailable: {e}");
                    signals_armed = false;
                    continue;
                }
                if cancel_sent {
                    tracing::warn!("Second interrupt; aborting");
                    handle.abort();
                    return Err(Cancelled.into());
                }
                tracing::warn!("Cancelling… press Ctrl-C again to abort");
                let _ = ctrl_tx.send(EngineControl::Cancel);
                cancel_sent = true;
                cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::warn!("Still cancelling…");
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}
