use crate::engine::terraform::TerraformClient;
use crate::engine::{sleep_or_cancel, Cancelled};
use crate::model::{ApplyAttributes, Document, RunDecision, RunStatus};
use anyhow::{bail, Context, Result};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pacing shared by every status loop.
#[derive(Clone)]
pub(crate) struct PollParams {
    pub interval: Duration,
    pub timeout: Duration,
    pub cancel: Arc<AtomicBool>,
}

/// Call `step` every `interval` until it yields a value, the timeout passes, or the run is cancelled.
pub(crate) async fn poll_until<T, F, Fut>(what: &str, params: &PollParams, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    loop {
        if let Some(v) = step().await? {
            return Ok(v);
        }
        if start.elapsed() >= params.timeout {
            bail!(
                "timed out after {} waiting for {what}",
                humantime::format_duration(params.timeout)
            );
        }
        tracing::debug!("Waiting {:?} before next {what} check", params.interval);
        if sleep_or_cancel(params.interval, &params.cancel).await {
            return Err(Cancelled.into());
        }
    }
}

/// Route on a polled run state.
pub fn decide(status: &RunStatus, is_confirmable: bool, auto_approve: bool) -> RunDecision {
    match status {
        s if s.awaits_confirmation() && is_confirmable => {
            if auto_approve {
                RunDecision::Apply
            } else {
                RunDecision::ReviewPlan
            }
        }
        RunStatus::PlannedAndFinished => RunDecision::NoChanges,
        RunStatus::Errored => RunDecision::Errored,
        RunStatus::Applied
        | RunStatus::Discarded
        | RunStatus::Canceled
        | RunStatus::ForceCanceled => RunDecision::Halted,
        _ => RunDecision::Wait,
    }
}

pub(crate) async fn wait_for_upload(
    client: &TerraformClient,
    config_version_id: &str,
    params: &PollParams,
) -> Result<()> {
    poll_until("configuration version upload", params, move || async move {
        let doc = client
            .show_config_version(config_version_id)
            .await
            .context("show configuration version")?;
        match doc.data.attributes.status.as_str() {
            "uploaded" => {
                tracing::info!("Configuration version status: uploaded");
                Ok(Some(()))
            }
            "errored" => bail!("configuration version upload errored; unable to proceed"),
            other => {
                tracing::debug!("Configuration version status: {other}");
                Ok(None)
            }
        }
    })
    .await
}

/// Poll a run until it needs something from us; returns the decision and the raw status.
pub(crate) async fn wait_for_run(
    client: &TerraformClient,
    run_id: &str,
    auto_approve: bool,
    params: &PollParams,
) -> Result<(RunDecision, String)> {
    poll_until("run", params, move || async move {
        let doc = client.get_run(run_id, None).await.context("get run")?;
        let attrs = doc.data.attributes;
        tracing::info!("Run status: {}", attrs.status);
        tracing::debug!("Run is confirmable: {}", attrs.actions.is_confirmable);
        let decision = decide(
            &RunStatus::from(attrs.status.as_str()),
            attrs.actions.is_confirmable,
            auto_approve,
        );
        Ok::<_, anyhow::Error>((decision != RunDecision::Wait).then_some((decision, attrs.status)))
    })
    .await
}

/// Poll an apply until it reaches a terminal state and return its last document.
pub(crate) async fn wait_for_apply(
    client: &TerraformClient,
    apply_id: &str,
    params: &PollParams,
) -> Result<Document<ApplyAttributes>> {
    poll_until("apply", params, move || async move {
        let doc = client.show_apply(apply_id).await.context("show apply")?;
        tracing::info!("Apply status: {}", doc.data.attributes.status);
        let done = matches!(
            doc.data.attributes.status.as_str(),
            "finished" | "errored" | "canceled" | "unreachable"
        );
        Ok::<_, anyhow::Error>(done.then_some(doc))
    })
    .await
}
