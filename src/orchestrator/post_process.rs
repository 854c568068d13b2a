//! Post-run processing utilities.
//!
//! Saves downloaded plan/apply logs next to the debug log and builds the lines
//! the pipeline reads from stdout.

use crate::model::{RunDecision, WorkflowOutcome};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use time::macros::format_description;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub outcome: WorkflowOutcome,
    /// Pipeline-facing lines: the RUN_ID variable and raw Terraform logs.
    pub pipeline_lines: Vec<String>,
}

/// Pipeline logging command that exposes the run id to later tasks.
pub(crate) fn run_id_command(run_id: &str) -> String {
    format!("##vso[task.setvariable variable=RUN_ID;]{run_id}")
}

fn file_stamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .unwrap_or_else(|_| "unknown".into())
}

fn save_log(dir: &Path, kind: &str, stamp: &str, text: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(format!("{kind}-{stamp}.log"));
    std::fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
    tracing::info!("Saved {kind} log: {}", path.display());
    Ok(path)
}

/// Save any downloaded logs under `log_dir` and collect the stdout lines for the pipeline.
pub(crate) fn process_run_completion(
    log_dir: &Path,
    mut outcome: WorkflowOutcome,
) -> Result<ProcessedRun> {
    let stamp = file_stamp();
    let mut pipeline_lines = Vec::new();

    if matches!(
        outcome.decision,
        Some(RunDecision::ReviewPlan | RunDecision::Errored)
    ) {
        if let Some(run_id) = outcome.run_id.as_deref() {
            pipeline_lines.push(run_id_command(run_id));
        }
    }
    if let Some(log) = outcome.plan_log.as_deref() {
        outcome.plan_log_path = Some(save_log(log_dir, "plan", &stamp, log)?);
        pipeline_lines.push(log.trim_end().to_string());
    }
    if let Some(log) = outcome.apply_log.as_deref() {
        outcome.apply_log_path = Some(save_log(log_dir, "apply", &stamp, log)?);
        pipeline_lines.push(log.trim_end().to_string());
    }

    Ok(ProcessedRun {
        outcome,
        pipeline_lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_saves_plan_and_exposes_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = WorkflowOutcome {
            run_id: Some("run-7".into()),
            decision: Some(RunDecision::ReviewPlan),
            plan_log: Some("Plan: 2 to add\n".into()),
            ..Default::default()
        };
        let processed = process_run_completion(dir.path(), outcome).unwrap();
        assert_eq!(
            processed.pipeline_lines,
            vec![
                "##vso[task.setvariable variable=RUN_ID;]run-7".to_string(),
                "Plan: 2 to add".to_string()
            ]
        );
        let path = processed.outcome.plan_log_path.unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("plan-"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "Plan: 2 to add\n");
        assert!(processed.outcome.apply_log_path.is_none());
    }

    #[test]
    fn applied_run_saves_apply_log_without_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = WorkflowOutcome {
            run_id: Some("run-7".into()),
            decision: Some(RunDecision::Apply),
            apply_log: Some("Apply complete!".into()),
            ..Default::default()
        };
        let processed = process_run_completion(&dir.path().join("logs"), outcome).unwrap();
        assert_eq!(processed.pipeline_lines, vec!["Apply complete!".to_string()]);
        assert!(processed.outcome.apply_log_path.unwrap().exists());
    }
}
