mod poll;
mod tarball;
pub mod terraform;
mod variables;

use crate::model::{
    Document, RunConfig, RunDecision, RunStatus, WorkflowOutcome, WorkspaceAttributes,
};
use anyhow::{anyhow, Context, Result};
use poll::PollParams;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use terraform::{included_field, RunInclude, TerraformClient};
use tokio::sync::mpsc;

const RUN_MESSAGE: &str = "Queued manually via the Terraform Cloud API";
const DESTROY_MESSAGE: &str = "Queued to destroy infrastructure via the Terraform Cloud API";
const APPLY_COMMENT: &str = "Applied via the Terraform Cloud API";

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Stop at the next poll tick
    Cancel,
}

/// Returned when a flow stops because of `EngineControl::Cancel`.
#[derive(Debug, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

pub(crate) fn is_cancelled(cancel: &AtomicBool) -> bool {
    cancel.load(Ordering::Relaxed)
}

/// Sleep for `d`, waking early on cancel. Returns true if cancelled.
pub(crate) async fn sleep_or_cancel(d: Duration, cancel: &AtomicBool) -> bool {
    let deadline = tokio::time::Instant::now() + d;
    loop {
        if is_cancelled(cancel) {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep((deadline - now).min(Duration::from_millis(50))).await;
    }
}

/// Drives the Terraform Cloud flows against one workspace.
pub struct WorkflowEngine {
    cfg: RunConfig,
}

impl WorkflowEngine {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg }
    }

    /// Upload the configuration directory, reconcile variables, queue a run and follow it.
    pub async fn run_workspace(
        self,
        control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<WorkflowOutcome> {
        let client = TerraformClient::new(&self.cfg)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let control_handle = spawn_control_listener(control_rx, cancel.clone());

        let res = self.load_and_run(&client, cancel).await;

        // Dropping a JoinHandle does not stop the task.
        control_handle.abort();
        res
    }

    /// Apply a run that is waiting for confirmation.
    pub async fn confirm_apply(
        self,
        run_id: String,
        control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<WorkflowOutcome> {
        let client = TerraformClient::new(&self.cfg)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let control_handle = spawn_control_listener(control_rx, cancel.clone());

        let res = self.confirm(&client, &run_id, cancel).await;

        control_handle.abort();
        res
    }

    fn new_outcome(&self) -> WorkflowOutcome {
        WorkflowOutcome {
            timestamp_utc: crate::model::now_rfc3339(),
            organization: self.cfg.organization.clone(),
            workspace: self.cfg.workspace.clone(),
            ..Default::default()
        }
    }

    fn poll_params(&self, cancel: Arc<AtomicBool>) -> PollParams {
        PollParams {
            interval: self.cfg.poll_interval,
            timeout: self.cfg.poll_timeout,
            cancel,
        }
    }

    async fn load_and_run(
        &self,
        client: &TerraformClient,
        cancel: Arc<AtomicBool>,
    ) -> Result<WorkflowOutcome> {
        let mut outcome = self.new_outcome();
        let params = self.poll_params(cancel.clone());
        let directory = self
            .cfg
            .directory
            .clone()
            .context("a terraform directory is required")?;

        let workspace_id = self.ensure_workspace(client, &mut outcome).await?;
        tracing::info!("Workspace ID: {workspace_id}");

        let cv = client
            .create_config_version(&workspace_id)
            .await
            .context("create configuration version")?;
        let upload_url = cv
            .data
            .attributes
            .upload_url
            .clone()
            .ok_or_else(|| anyhow!("configuration version {} has no upload-url", cv.data.id))?;
        tracing::info!("Configuration Version ID: {}", cv.data.id);
        outcome.config_version_id = Some(cv.data.id.clone());

        let dir = directory.clone();
        let tarball = tokio::task::spawn_blocking(move || tarball::pack_directory(&dir))
            .await
            .context("tarball task failed")??;
        tracing::debug!(
            "Packed {} into {} byte tarball",
            directory.display(),
            tarball.len()
        );
        client
            .upload_config(&upload_url, tarball)
            .await
            .context("upload configuration tarball")?;
        tracing::debug!("Upload request completed");

        poll::wait_for_upload(client, &cv.data.id, &params).await?;

        let desired = variables::load_desired(&directory.join("variables.json"))?;
        if !desired.is_empty() {
            let existing = client
                .list_variables(&workspace_id)
                .await
                .context("list workspace variables")?;
            let planned = variables::plan(&desired, &existing.data);
            outcome.variables = variables::apply(
                client,
                &workspace_id,
                &planned,
                self.cfg.variable_delay,
                &cancel,
            )
            .await?;
        }

        let message = if self.cfg.destroy {
            DESTROY_MESSAGE
        } else {
            RUN_MESSAGE
        };
        let run = client
            .create_run(&workspace_id, self.cfg.destroy, message)
            .await
            .context("create run")?;
        let run_id = run.data.id;
        tracing::info!("Run ID: {run_id}");
        outcome.run_id = Some(run_id.clone());

        let (decision, status) =
            poll::wait_for_run(client, &run_id, self.cfg.auto_approve, &params).await?;
        outcome.run_status = Some(status);
        outcome.decision = Some(decision);

        match decision {
            RunDecision::ReviewPlan | RunDecision::Errored => {
                if decision == RunDecision::Errored {
                    tracing::error!("Run {run_id} errored during plan");
                } else {
                    tracing::debug!("Ready to review plan");
                }
                outcome.plan_log = Some(self.fetch_plan_log(client, &run_id).await?);
            }
            RunDecision::Apply => {
                tracing::debug!("Ready to apply run");
                let doc = client
                    .get_run(&run_id, Some(RunInclude::Apply))
                    .await
                    .context("get run with apply")?;
                let apply_id = included_field(&doc.included, "/id")
                    .ok_or_else(|| anyhow!("run {run_id} has no included apply"))?
                    .to_string();
                self.apply(client, &run_id, &apply_id, &params, &mut outcome)
                    .await?;
            }
            RunDecision::NoChanges => {
                tracing::info!("No changes. Infrastructure is up-to-date.");
            }
            RunDecision::Halted => {
                tracing::warn!(
                    "Run {run_id} ended with status {}",
                    outcome.run_status.as_deref().unwrap_or("unknown")
                );
            }
            RunDecision::Wait => {}
        }

        Ok(outcome)
    }

    /// Find the workspace, creating it on first use.
    async fn ensure_workspace(
        &self,
        client: &TerraformClient,
        outcome: &mut WorkflowOutcome,
    ) -> Result<String> {
        if let Some(ws) = client.show_workspace().await.context("show workspace")? {
            tracing::debug!("Workspace found");
            self.pin_terraform_version(client, &ws).await?;
            outcome.workspace_id = Some(ws.data.id.clone());
            return Ok(ws.data.id);
        }
        let created = client
            .create_workspace(&self.cfg.terraform_version)
            .await
            .context("create workspace")?;
        let id = match created {
            Some(ws) => {
                tracing::info!("Workspace '{}' created", self.cfg.workspace);
                outcome.workspace_created = true;
                ws.data.id
            }
            // Someone else created it between our show and create.
            None => {
                let ws = client
                    .show_workspace()
                    .await
                    .context("show workspace")?
                    .ok_or_else(|| {
                        anyhow!("workspace '{}' could not be created", self.cfg.workspace)
                    })?;
                self.pin_terraform_version(client, &ws).await?;
                ws.data.id
            }
        };
        outcome.workspace_id = Some(id.clone());
        Ok(id)
    }

    /// PATCH the workspace when it pins a different terraform version.
    async fn pin_terraform_version(
        &self,
        client: &TerraformClient,
        ws: &Document<WorkspaceAttributes>,
    ) -> Result<()> {
        let pinned = ws.data.attributes.terraform_version.as_deref();
        if self.cfg.terraform_version.is_empty()
            || pinned == Some(self.cfg.terraform_version.as_str())
        {
            return Ok(());
        }
        tracing::info!(
            "Updating workspace terraform version from {} to {}",
            pinned.unwrap_or("unset"),
            self.cfg.terraform_version
        );
        client
            .update_workspace(serde_json::json!({"terraform-version": self.cfg.terraform_version}))
            .await
            .context("update workspace")?;
        Ok(())
    }

    async fn fetch_plan_log(&self, client: &TerraformClient, run_id: &str) -> Result<String> {
        let doc = client
            .get_run(run_id, Some(RunInclude::Plan))
            .await
            .context("get run with plan")?;
        let url = included_field(&doc.included, "/attributes/log-read-url")
            .ok_or_else(|| anyhow!("run {run_id} has no plan log-read-url"))?;
        client.download_log(url).await.context("download plan log")
    }

    async fn apply(
        &self,
        client: &TerraformClient,
        run_id: &str,
        apply_id: &str,
        params: &PollParams,
        outcome: &mut WorkflowOutcome,
    ) -> Result<()> {
        tracing::info!("Apply ID: {apply_id}");
        outcome.apply_id = Some(apply_id.to_string());
        client
            .apply_run(run_id, APPLY_COMMENT)
            .await
            .context("apply run")?;
        tracing::debug!("Apply requested for run {run_id}");

        let doc = poll::wait_for_apply(client, apply_id, params).await?;
        let attrs = doc.data.attributes;
        if attrs.status == "finished" {
            tracing::debug!("Apply finished");
            if let Some(url) = attrs.log_read_url.as_deref() {
                let log = client
                    .download_log(url)
                    .await
                    .context("download apply log")?;
                outcome.apply_log = Some(log);
            }
        } else {
            tracing::error!("Apply {apply_id} ended with status {}", attrs.status);
        }
        outcome.apply_status = Some(attrs.status);
        Ok(())
    }

    async fn confirm(
        &self,
        client: &TerraformClient,
        run_id: &str,
        cancel: Arc<AtomicBool>,
    ) -> Result<WorkflowOutcome> {
        let mut outcome = self.new_outcome();
        outcome.run_id = Some(run_id.to_string());
        let params = self.poll_params(cancel);

        let doc = client
            .get_run(run_id, Some(RunInclude::Apply))
            .await
            .context("get run with apply")?;
        let attrs = &doc.data.attributes;
        tracing::info!("Run status: {}", attrs.status);
        tracing::debug!("Run is confirmable: {}", attrs.actions.is_confirmable);
        outcome.run_status = Some(attrs.status.clone());

        let status = RunStatus::from(attrs.status.as_str());
        if !(status.awaits_confirmation() && attrs.actions.is_confirmable) {
            tracing::warn!(
                "Run {run_id} is not waiting for confirmation (status {}); nothing to apply",
                attrs.status
            );
            return Ok(outcome);
        }

        outcome.decision = Some(RunDecision::Apply);
        let apply_id = included_field(&doc.included, "/id")
            .ok_or_else(|| anyhow!("run {run_id} has no included apply"))?
            .to_string();
        self.apply(client, run_id, &apply_id, &params, &mut outcome)
            .await?;
        Ok(outcome)
    }
}

fn spawn_control_listener(
    mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    cancel: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = control_rx.recv().await {
            match msg {
                EngineControl::Cancel => {
                    cancel.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
    })
}
