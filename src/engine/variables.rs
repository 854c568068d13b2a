//! Workspace variable reconciliation.
//!
//! Desired variables come from `variables.json` in the Terraform directory.
//! Planning is pure; applying walks the plan in order against the API.

use crate::engine::terraform::TerraformClient;
use crate::engine::{is_cancelled, sleep_or_cancel, Cancelled};
use crate::model::{
    category_of, sensitive_of, Resource, VariableAction, VariableAttributes, VariableChange,
    VariableDocument,
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Attributes the API adds that never appear in a desired document.
const SERVER_ONLY_ATTRIBUTES: &[&str] = &["created-at", "version-id"];

#[derive(Debug, Clone)]
pub struct PlannedVariable<'a> {
    pub desired: &'a VariableDocument,
    pub existing_id: Option<String>,
    pub action: VariableAction,
}

/// Read `variables.json`; a missing file means there is nothing to reconcile.
pub fn load_desired(path: &Path) -> Result<Vec<VariableDocument>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read variables from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse variables in {}", path.display()))
}

pub fn plan<'a>(
    desired: &'a [VariableDocument],
    existing: &[Resource<VariableAttributes>],
) -> Vec<PlannedVariable<'a>> {
    desired
        .iter()
        .map(|want| {
            let found = existing.iter().find(|have| {
                have.attributes.get("key").and_then(Value::as_str) == Some(want.key())
                    && category_of(&have.attributes) == want.category()
            });
            match found {
                None => PlannedVariable {
                    desired: want,
                    existing_id: None,
                    action: VariableAction::Create,
                },
                Some(have) if attributes_match(&want.data.attributes, &have.attributes) => {
                    PlannedVariable {
                        desired: want,
                        existing_id: Some(have.id.clone()),
                        action: VariableAction::Unchanged,
                    }
                }
                Some(have) => PlannedVariable {
                    desired: want,
                    existing_id: Some(have.id.clone()),
                    // Sensitive values are write-only, so they can only be replaced.
                    action: if sensitive_of(&have.attributes) {
                        VariableAction::Replace
                    } else {
                        VariableAction::Update
                    },
                },
            }
        })
        .collect()
}

fn attributes_match(desired: &VariableAttributes, existing: &VariableAttributes) -> bool {
    desired
        .iter()
        .filter(|(k, _)| !SERVER_ONLY_ATTRIBUTES.contains(&k.as_str()))
        .all(|(k, v)| existing.get(k) == Some(v))
}

/// Issue the planned calls in order, pausing `delay` between variables.
pub async fn apply(
    client: &TerraformClient,
    workspace_id: &str,
    planned: &[PlannedVariable<'_>],
    delay: Duration,
    cancel: &Arc<AtomicBool>,
) -> Result<Vec<VariableChange>> {
    let mut changes = Vec::with_capacity(planned.len());
    for (i, p) in planned.iter().enumerate() {
        if is_cancelled(cancel) {
            return Err(Cancelled.into());
        }
        let key = p.desired.key();
        match (p.action, p.existing_id.as_deref()) {
            (VariableAction::Unchanged, _) => {
                tracing::info!("Workspace variable '{key}' matches; no update required");
            }
            (VariableAction::Update, Some(id)) => {
                client
                    .update_variable(workspace_id, id, p.desired)
                    .await
                    .with_context(|| format!("update variable '{key}'"))?;
                tracing::info!("Workspace variable '{key}' has been updated");
                log_value(p.desired);
            }
            (VariableAction::Replace, Some(id)) => {
                tracing::info!("Workspace variable '{key}' is sensitive; deleting before re-adding");
                client
                    .delete_variable(workspace_id, id)
                    .await
                    .with_context(|| format!("delete variable '{key}'"))?;
                client
                    .create_variable(workspace_id, p.desired)
                    .await
                    .with_context(|| format!("re-add variable '{key}'"))?;
                tracing::info!("Workspace variable '{key}' has been replaced");
            }
            _ => {
                client
                    .create_variable(workspace_id, p.desired)
                    .await
                    .with_context(|| format!("create variable '{key}'"))?;
                tracing::info!("Workspace variable '{key}' has been added");
                log_value(p.desired);
            }
        }
        changes.push(VariableChange {
            key: key.to_string(),
            category: p.desired.category().to_string(),
            action: p.action,
        });
        if i + 1 < planned.len() && p.action != VariableAction::Unchanged {
            tracing::debug!("Waiting {:?} before next variable", delay);
            if sleep_or_cancel(delay, cancel).await {
                return Err(Cancelled.into());
            }
        }
    }
    Ok(changes)
}

fn log_value(v: &VariableDocument) {
    if v.is_sensitive() {
        return;
    }
    if let Some(value) = v.data.attributes.get("value") {
        tracing::debug!("{}: {}", v.key(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{run_config, MockServer};
    use axum::extract::{Path as UrlPath, State};
    use axum::http::StatusCode;
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<String>>>;

    /// Workspace `ws-1` vars endpoints that record every write.
    fn vars_api(calls: Calls) -> Router {
        Router::new()
            .route(
                "/api/v2/workspaces/ws-1/vars",
                post(|State(c): State<Calls>, Json(body): Json<Value>| async move {
                    let key = body["data"]["attributes"]["key"].as_str().unwrap_or("").to_string();
                    c.lock().unwrap().push(format!("POST vars:{key}"));
                    (
                        StatusCode::CREATED,
                        Json(json!({"data": {"id": "var-10", "type": "vars", "attributes": body["data"]["attributes"].clone()}})),
                    )
                }),
            )
            .route(
                "/api/v2/workspaces/ws-1/vars/{id}",
                delete(|State(c): State<Calls>, UrlPath(id): UrlPath<String>| async move {
                    c.lock().unwrap().push(format!("DELETE vars/{id}"));
                    StatusCode::NO_CONTENT
                }),
            )
            .with_state(calls)
    }

    fn desired(v: Value) -> VariableDocument {
        serde_json::from_value(json!({"data": {"type": "vars", "attributes": v}})).unwrap()
    }

    fn existing(id: &str, v: Value) -> Resource<VariableAttributes> {
        serde_json::from_value(json!({"id": id, "type": "vars", "attributes": v})).unwrap()
    }

    #[test]
    fn plans_each_action() {
        let want = vec![
            desired(json!({"key": "region", "value": "eu-west-1", "category": "terraform", "sensitive": false})),
            desired(json!({"key": "size", "value": "large", "category": "terraform", "sensitive": false})),
            desired(json!({"key": "password", "value": "hunter2", "category": "env", "sensitive": true})),
            desired(json!({"key": "fresh", "value": "1", "category": "terraform", "sensitive": false})),
        ];
        let have = vec![
            existing("var-1", json!({"key": "region", "value": "eu-west-1", "category": "terraform", "sensitive": false, "hcl": false, "created-at": "2020-01-01T00:00:00Z"})),
            existing("var-2", json!({"key": "size", "value": "small", "category": "terraform", "sensitive": false})),
            existing("var-3", json!({"key": "password", "value": null, "category": "env", "sensitive": true})),
        ];

        let planned = plan(&want, &have);
        let actions: Vec<_> = planned.iter().map(|p| p.action).collect();
        assert_eq!(
            actions,
            vec![
                VariableAction::Unchanged,
                VariableAction::Update,
                VariableAction::Replace,
                VariableAction::Create,
            ]
        );
        assert_eq!(planned[1].existing_id.as_deref(), Some("var-2"));
        assert_eq!(planned[3].existing_id, None);
    }

    #[test]
    fn same_key_in_other_category_is_a_different_variable() {
        let want = vec![desired(json!({"key": "TOKEN", "value": "x", "category": "env"}))];
        let have = vec![existing("var-1", json!({"key": "TOKEN", "value": "x", "category": "terraform"}))];
        assert_eq!(plan(&want, &have)[0].action, VariableAction::Create);
    }

    #[test]
    fn missing_category_defaults_to_terraform() {
        let want = vec![desired(json!({"key": "region", "value": "us-east-1"}))];
        let have = vec![existing("var-1", json!({"key": "region", "value": "us-east-1", "category": "terraform"}))];
        assert_eq!(plan(&want, &have)[0].action, VariableAction::Unchanged);
    }

    #[test]
    fn load_desired_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_desired(&dir.path().join("variables.json")).unwrap().is_empty());

        let path = dir.path().join("variables.json");
        std::fs::write(
            &path,
            r#"[{"data": {"type": "vars", "attributes": {"key": "a", "value": "1"}}}]"#,
        )
        .unwrap();
        let loaded = load_desired(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key(), "a");
    }

    #[test]
    fn malformed_variables_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_desired(&path).unwrap_err();
        assert!(format!("{err:#}").contains("variables.json"));
    }

    #[tokio::test]
    async fn sensitive_change_deletes_then_recreates() {
        let calls: Calls = Arc::default();
        let server = MockServer::start(vars_api(calls.clone())).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();

        let want = vec![desired(
            json!({"key": "password", "value": "hunter3", "category": "env", "sensitive": true}),
        )];
        let have = vec![existing(
            "var-3",
            json!({"key": "password", "value": null, "category": "env", "sensitive": true}),
        )];
        let planned = plan(&want, &have);
        let cancel = Arc::new(AtomicBool::new(false));

        let changes = apply(&client, "ws-1", &planned, Duration::from_millis(1), &cancel)
            .await
            .unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, VariableAction::Replace);
        assert_eq!(changes[0].category, "env");
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["DELETE vars/var-3".to_string(), "POST vars:password".to_string()]
        );
    }

    #[tokio::test]
    async fn cancel_interrupts_delay_between_variables() {
        let calls: Calls = Arc::default();
        let server = MockServer::start(vars_api(calls.clone())).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();

        let want = vec![
            desired(json!({"key": "a", "value": "1", "category": "terraform"})),
            desired(json!({"key": "b", "value": "2", "category": "terraform"})),
        ];
        let planned = plan(&want, &[]);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::Relaxed);
        });

        let start = std::time::Instant::now();
        let err = apply(&client, "ws-1", &planned, Duration::from_secs(3), &cancel)
            .await
            .unwrap_err();

        assert!(err.is::<Cancelled>());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(*calls.lock().unwrap(), vec!["POST vars:a".to_string()]);
    }
}
