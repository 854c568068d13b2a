use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Resolved settings for the Terraform Cloud flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub address: String,
    pub organization: String,
    pub workspace: String,
    pub terraform_version: String,
    #[serde(skip)]
    pub token: String,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    pub auto_approve: bool,
    pub destroy: bool,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub variable_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub log_dir: PathBuf,
    pub user_agent: String,
}

/// Resolved settings for the Azure DevOps version bump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevOpsConfig {
    pub organization: String,
    pub project: String,
    pub variable_group: String,
    #[serde(skip)]
    pub token: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

/// Resolved settings for the scoring service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub bind: SocketAddr,
    pub model_path: PathBuf,
    #[serde(default)]
    pub influx: Option<InfluxConfig>,
}

/// InfluxDB v1 connection for recording scored sales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

/// A single-resource JSON:API document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document<A> {
    pub data: Resource<A>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Value>,
}

/// A collection JSON:API document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection<A> {
    pub data: Vec<Resource<A>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource<A> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: A,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceAttributes {
    pub name: String,
    #[serde(rename = "terraform-version", default)]
    pub terraform_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersionAttributes {
    pub status: String,
    #[serde(rename = "upload-url", default)]
    pub upload_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunActions {
    #[serde(rename = "is-confirmable", default)]
    pub is_confirmable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAttributes {
    pub status: String,
    #[serde(default)]
    pub actions: RunActions,
    #[serde(rename = "is-destroy", default)]
    pub is_destroy: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyAttributes {
    pub status: String,
    #[serde(rename = "log-read-url", default)]
    pub log_read_url: Option<String>,
}

/// Workspace variable attributes are compared field by field, so they stay untyped.
pub type VariableAttributes = Map<String, Value>;

/// One entry of `variables.json`: `{"data": {"type": "vars", "attributes": {...}}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDocument {
    pub data: VariableData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableData {
    #[serde(rename = "type", default = "vars_type")]
    pub kind: String,
    pub attributes: VariableAttributes,
}

fn vars_type() -> String {
    "vars".to_string()
}

impl VariableDocument {
    pub fn key(&self) -> &str {
        self.data
            .attributes
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn category(&self) -> &str {
        category_of(&self.data.attributes)
    }

    pub fn is_sensitive(&self) -> bool {
        sensitive_of(&self.data.attributes)
    }
}

pub(crate) fn category_of(attrs: &VariableAttributes) -> &str {
    attrs
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or("terraform")
}

pub(crate) fn sensitive_of(attrs: &VariableAttributes) -> bool {
    attrs
        .get("sensitive")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Run states reported by Terraform Cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Planning,
    Planned,
    CostEstimated,
    PolicyChecked,
    PlannedAndFinished,
    Applied,
    Errored,
    Discarded,
    Canceled,
    ForceCanceled,
    Other(String),
}

impl From<&str> for RunStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => RunStatus::Pending,
            "planning" => RunStatus::Planning,
            "planned" => RunStatus::Planned,
            "cost_estimated" => RunStatus::CostEstimated,
            "policy_checked" => RunStatus::PolicyChecked,
            "planned_and_finished" => RunStatus::PlannedAndFinished,
            "applied" => RunStatus::Applied,
            "errored" => RunStatus::Errored,
            "discarded" => RunStatus::Discarded,
            "canceled" => RunStatus::Canceled,
            "force_canceled" => RunStatus::ForceCanceled,
            other => RunStatus::Other(other.to_string()),
        }
    }
}

impl RunStatus {
    /// States in which a confirmable run is waiting for someone to apply it.
    pub fn awaits_confirmation(&self) -> bool {
        matches!(
            self,
            RunStatus::Planned | RunStatus::CostEstimated | RunStatus::PolicyChecked
        )
    }
}

/// What the run poller decided to do with the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDecision {
    /// Keep polling.
    Wait,
    /// Plan is ready; print it and leave the apply to a reviewer.
    ReviewPlan,
    /// Plan is ready and auto-approve is on.
    Apply,
    /// Nothing to change.
    NoChanges,
    /// The plan failed; print it and fail.
    Errored,
    /// Run reached a terminal state without an apply from us.
    Halted,
}

/// Reconciliation outcome for one desired workspace variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableAction {
    Create,
    Update,
    Replace,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableChange {
    pub key: String,
    pub category: String,
    pub action: VariableAction,
}

/// Summary of a Terraform flow, printed as text or JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    #[serde(default)]
    pub timestamp_utc: String,
    pub organization: String,
    pub workspace: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub workspace_created: bool,
    #[serde(default)]
    pub config_version_id: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableChange>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub run_status: Option<String>,
    #[serde(default)]
    pub decision: Option<RunDecision>,
    #[serde(default)]
    pub apply_id: Option<String>,
    #[serde(default)]
    pub apply_status: Option<String>,
    #[serde(default)]
    pub plan_log_path: Option<PathBuf>,
    #[serde(default)]
    pub apply_log_path: Option<PathBuf>,
    #[serde(skip)]
    pub plan_log: Option<String>,
    #[serde(skip)]
    pub apply_log: Option<String>,
}

impl WorkflowOutcome {
    /// Why the flow should exit non-zero, once its logs have been printed.
    pub fn failure(&self) -> Option<String> {
        match self.decision {
            Some(RunDecision::Errored) => {
                return Some(format!(
                    "run {} errored during plan",
                    self.run_id.as_deref().unwrap_or("-")
                ))
            }
            Some(RunDecision::Halted) if self.run_status.as_deref() != Some("applied") => {
                return Some(format!(
                    "run {} ended with status {}",
                    self.run_id.as_deref().unwrap_or("-"),
                    self.run_status.as_deref().unwrap_or("unknown")
                ))
            }
            _ => {}
        }
        match self.apply_status.as_deref() {
            Some("finished") | None => None,
            Some(status) => Some(format!(
                "apply {} ended with status {status}",
                self.apply_id.as_deref().unwrap_or("-")
            )),
        }
    }
}

/// One variable group touched by the version bump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionBump {
    pub group_id: i64,
    pub group_name: String,
    pub previous: i64,
    pub version: i64,
}

/// Timestamp used in outcome records and log file names.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
