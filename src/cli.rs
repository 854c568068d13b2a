use crate::logging::LoggingConfig;
use crate::model::{DevOpsConfig, InfluxConfig, RunConfig, ScoringConfig};
use crate::orchestrator::{process_run_completion, run_controller, Flow};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Spawn a blocking stdout writer to avoid blocking async tasks.
fn spawn_output_writer() -> (mpsc::UnboundedSender<String>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let mut out = std::io::LineWriter::new(stdout.lock());
        while let Some(line) = rx.blocking_recv() {
            let _ = writeln!(out, "{}", line);
        }
        let _ = out.flush();
    });
    (tx, handle)
}

/// Accepts tracing levels plus the WARNING/CRITICAL/FATAL spellings.
fn parse_level(s: &str) -> Result<tracing::Level, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "warning" => Ok(tracing::Level::WARN),
        "critical" | "fatal" => Ok(tracing::Level::ERROR),
        other => other
            .parse()
            .map_err(|_| format!("unknown log level '{s}'")),
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "cloud-pipeline",
    version,
    about = "Terraform Cloud runs, Azure DevOps version bumps and a sale price scoring service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Console log level; `--log` alone means info.
    ///
    /// Give it after the subcommand: a bare `--log` in front of one would take
    /// the subcommand name as its level.
    #[arg(
        long,
        global = true,
        num_args = 0..=1,
        default_value = "warn",
        default_missing_value = "info",
        value_name = "LEVEL",
        value_parser = parse_level
    )]
    pub log: tracing::Level,

    /// Directory for the debug log and saved plan/apply logs [default: system temp dir]
    #[arg(long, global = true, env = "CLOUD_PIPELINE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Print the outcome as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Upload a Terraform directory to a workspace, sync its variables and queue a run
    WorkspaceRun(WorkspaceRunArgs),
    /// Apply a run that is waiting for confirmation
    ConfirmApply(ConfirmApplyArgs),
    /// Increment the `version` variable of an Azure DevOps variable group
    BumpVersion(BumpVersionArgs),
    /// Serve the sale price scoring API
    ServeScoring(ServeScoringArgs),
}

#[derive(Debug, Args, Clone)]
pub struct TerraformArgs {
    /// Terraform Cloud or Enterprise address
    #[arg(long, env = "TF_ADDRESS", default_value = "https://app.terraform.io")]
    pub address: String,

    /// Terraform Cloud organization
    #[arg(long, env = "TF_ORGANIZATION")]
    pub organization: String,

    /// Terraform workspace name
    #[arg(long, env = "TF_WORKSPACE")]
    pub workspace: String,

    /// Terraform version for a newly created workspace
    #[arg(long = "terraform-version", visible_alias = "tf-version", env = "TF_VERSION")]
    pub terraform_version: String,

    /// Terraform API token
    #[arg(long, env = "TF_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Delay between status checks
    #[arg(long, default_value = "5s")]
    pub poll_interval: humantime::Duration,

    /// Give up waiting on any single status after this long
    #[arg(long, default_value = "60m")]
    pub poll_timeout: humantime::Duration,

    /// Timeout for each HTTP request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,
}

#[derive(Debug, Args, Clone)]
pub struct WorkspaceRunArgs {
    #[command(flatten)]
    pub terraform: TerraformArgs,

    /// Directory holding the Terraform configuration and optional variables.json
    #[arg(long, env = "TF_DIRECTORY")]
    pub directory: PathBuf,

    /// Apply the run as soon as its plan is confirmable
    #[arg(short = 'a', long)]
    pub auto_approve: bool,

    /// Queue a destroy run
    #[arg(short = 'd', long)]
    pub destroy: bool,

    /// Pause between workspace variable changes
    #[arg(long, default_value = "2s")]
    pub variable_delay: humantime::Duration,
}

#[derive(Debug, Args, Clone)]
pub struct ConfirmApplyArgs {
    #[command(flatten)]
    pub terraform: TerraformArgs,

    /// Run to apply
    #[arg(long = "run", visible_alias = "run-id", env = "TF_RUNID")]
    pub run_id: String,
}

#[derive(Debug, Args, Clone)]
pub struct BumpVersionArgs {
    /// Azure DevOps organization URL, e.g. https://dev.azure.com/acme
    #[arg(long)]
    pub organization: String,

    /// Azure DevOps team project
    #[arg(long)]
    pub project: String,

    /// Variable group holding the `version` variable
    #[arg(long = "vargroup", visible_alias = "variable-group")]
    pub variable_group: String,

    /// Azure DevOps personal access token
    #[arg(long, env = "AZURE_DEVOPS_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Timeout for each HTTP request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,
}

#[derive(Debug, Args, Clone)]
pub struct ServeScoringArgs {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Linear model artifact (JSON)
    #[arg(long, env = "SCORING_MODEL")]
    pub model: PathBuf,

    /// InfluxDB base URL; scores are not recorded when absent
    #[arg(long, env = "INFLUXDB_URL")]
    pub influx_url: Option<String>,

    #[arg(long, env = "INFLUXDB_DATABASE", default_value = "housing")]
    pub influx_database: String,

    #[arg(long, env = "INFLUXDB_USERNAME")]
    pub influx_username: Option<String>,

    #[arg(long, env = "INFLUXDB_PASSWORD", hide_env_values = true)]
    pub influx_password: Option<String>,

    /// Timeout for each InfluxDB request
    #[arg(long, default_value = "10s")]
    pub request_timeout: humantime::Duration,
}

fn user_agent() -> String {
    format!("cloud-pipeline/{}", env!("CARGO_PKG_VERSION"))
}

fn log_dir(args: &Cli) -> PathBuf {
    args.log_dir.clone().unwrap_or_else(std::env::temp_dir)
}

/// Logging sinks for the chosen subcommand, with its secrets registered for redaction.
pub fn logging_config(args: &Cli) -> LoggingConfig {
    let (file_name, secrets) = match &args.command {
        Command::WorkspaceRun(a) => ("workspace-run.log", vec![a.terraform.token.clone()]),
        Command::ConfirmApply(a) => ("confirm-apply.log", vec![a.terraform.token.clone()]),
        Command::BumpVersion(a) => ("bump-version.log", vec![a.token.clone()]),
        Command::ServeScoring(a) => (
            "serve-scoring.log",
            a.influx_password.iter().cloned().collect(),
        ),
    };
    LoggingConfig {
        console_level: args.log,
        log_dir: Some(log_dir(args)),
        file_name: file_name.to_string(),
        secrets,
    }
}

/// Build a `RunConfig` from the shared Terraform arguments.
pub fn build_run_config(args: &Cli, tf: &TerraformArgs) -> RunConfig {
    RunConfig {
        address: tf.address.clone(),
        organization: tf.organization.clone(),
        workspace: tf.workspace.clone(),
        terraform_version: tf.terraform_version.clone(),
        token: tf.token.clone(),
        directory: None,
        auto_approve: false,
        destroy: false,
        poll_interval: Duration::from(tf.poll_interval),
        poll_timeout: Duration::from(tf.poll_timeout),
        variable_delay: Duration::ZERO,
        request_timeout: Duration::from(tf.request_timeout),
        log_dir: log_dir(args),
        user_agent: user_agent(),
    }
}

pub fn build_devops_config(a: &BumpVersionArgs) -> DevOpsConfig {
    DevOpsConfig {
        organization: a.organization.clone(),
        project: a.project.clone(),
        variable_group: a.variable_group.clone(),
        token: a.token.clone(),
        request_timeout: Duration::from(a.request_timeout),
        user_agent: user_agent(),
    }
}

pub fn build_scoring_config(a: &ServeScoringArgs) -> ScoringConfig {
    ScoringConfig {
        bind: a.bind,
        model_path: a.model.clone(),
        influx: a.influx_url.as_ref().map(|url| InfluxConfig {
            url: url.clone(),
            database: a.influx_database.clone(),
            username: a.influx_username.clone(),
            password: a.influx_password.clone(),
            request_timeout: Duration::from(a.request_timeout),
            user_agent: user_agent(),
        }),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    match &args.command {
        Command::WorkspaceRun(a) => {
            let mut cfg = build_run_config(&args, &a.terraform);
            cfg.directory = Some(a.directory.clone());
            cfg.auto_approve = a.auto_approve;
            cfg.destroy = a.destroy;
            cfg.variable_delay = Duration::from(a.variable_delay);
            run_terraform(cfg, Flow::RunWorkspace, args.json).await
        }
        Command::ConfirmApply(a) => {
            let cfg = build_run_config(&args, &a.terraform);
            let flow = Flow::ConfirmApply {
                run_id: a.run_id.clone(),
            };
            run_terraform(cfg, flow, args.json).await
        }
        Command::BumpVersion(a) => run_bump_version(build_devops_config(a), args.json).await,
        Command::ServeScoring(a) => {
            let cfg = build_scoring_config(a);
            tracing::debug!("Config: {}", serde_json::to_string(&cfg)?);
            crate::scoring::serve(cfg, async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received Ctrl-C, shutting down");
            })
            .await
        }
    }
}

async fn run_terraform(cfg: RunConfig, flow: Flow, json: bool) -> Result<()> {
    tracing::debug!("Config: {}", serde_json::to_string(&cfg)?);
    let log_dir = cfg.log_dir.clone();
    let outcome = run_controller(cfg, flow).await?;
    let processed = process_run_completion(&log_dir, outcome)?;

    let (out_tx, out_handle) = spawn_output_writer();
    if json {
        let out = serde_json::to_string_pretty(&processed.outcome)?;
        let _ = out_tx.send(out);
    } else {
        for line in processed.pipeline_lines {
            let _ = out_tx.send(line);
        }
        let summary = crate::text_summary::build_workflow_summary(&processed.outcome);
        for line in summary.lines {
            let _ = out_tx.send(line);
        }
    }
    drop(out_tx);
    let _ = out_handle.await;

    if let Some(reason) = processed.outcome.failure() {
        bail!(reason);
    }
    Ok(())
}

async fn run_bump_version(cfg: DevOpsConfig, json: bool) -> Result<()> {
    tracing::debug!("Config: {}", serde_json::to_string(&cfg)?);
    let bumps = crate::devops::bump_version(&cfg)
        .await
        .context("version bump failed")?;

    let (out_tx, out_handle) = spawn_output_writer();
    if json {
        let _ = out_tx.send(serde_json::to_string_pretty(&bumps)?);
    } else {
        for line in crate::text_summary::build_bump_summary(&bumps).lines {
            let _ = out_tx.send(line);
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}
