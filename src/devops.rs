//! Azure DevOps variable-group version bump.
//!
//! Looks up a library variable group by name, increments its `version`
//! variable and writes the whole group back.

use crate::error::{check_status, decode, ApiError};
use crate::model::{DevOpsConfig, VersionBump};
use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::Value;

const LIST_API_VERSION: &str = "6.0-preview.2";
const UPDATE_API_VERSION: &str = "5.1-preview.1";

#[derive(Debug, Deserialize)]
struct GroupList {
    #[serde(default)]
    value: Vec<Value>,
}

pub struct DevOpsClient {
    http: reqwest::Client,
    groups_url: String,
    token: String,
}

impl DevOpsClient {
    pub fn new(cfg: &DevOpsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            groups_url: format!(
                "{}/{}/_apis/distributedtask/variablegroups",
                cfg.organization.trim_end_matches('/'),
                cfg.project.trim_matches('/')
            ),
            token: cfg.token.clone(),
        })
    }

    /// Groups whose name matches `name`, as full documents.
    pub async fn find_variable_groups(&self, name: &str) -> Result<Vec<Value>, ApiError> {
        let url = &self.groups_url;
        let resp = self
            .http
            .get(url)
            .query(&[("groupName", name), ("api-version", LIST_API_VERSION)])
            .basic_auth("", Some(&self.token))
            .send()
            .await
            .map_err(|e| ApiError::transport(url, e))?;
        let resp = check_status("GET", url, resp).await?;
        let list: GroupList = decode(url, resp).await?;
        Ok(list.value)
    }

    pub async fn update_variable_group(&self, id: i64, group: &Value) -> Result<Value, ApiError> {
        let url = format!("{}/{id}", self.groups_url);
        let resp = self
            .http
            .put(&url)
            .query(&[("api-version", UPDATE_API_VERSION)])
            .basic_auth("", Some(&self.token))
            .header(CONTENT_TYPE, "application/json")
            .json(group)
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;
        let resp = check_status("PUT", &url, resp).await?;
        decode(&url, resp).await
    }
}

/// Increment `variables.version.value` in place.
pub fn bump_group(group: &mut Value) -> Result<VersionBump> {
    let group_id = group
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("variable group has no numeric id"))?;
    let group_name = group
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let slot = group
        .pointer_mut("/variables/version/value")
        .ok_or_else(|| anyhow!("variable group '{group_name}' has no 'version' variable"))?;
    let previous = match slot {
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("variable group '{group_name}' has a non-numeric version: {slot}"))?;
    let version = previous + 1;
    *slot = Value::String(version.to_string());
    Ok(VersionBump {
        group_id,
        group_name,
        previous,
        version,
    })
}

/// Bump every group named `cfg.variable_group`.
pub async fn bump_version(cfg: &DevOpsConfig) -> Result<Vec<VersionBump>> {
    let client = DevOpsClient::new(cfg)?;
    let groups = client
        .find_variable_groups(&cfg.variable_group)
        .await
        .context("list variable groups")?;
    if groups.is_empty() {
        bail!(
            "no variable group named '{}' in project '{}'",
            cfg.variable_group,
            cfg.project
        );
    }

    let mut bumps = Vec::with_capacity(groups.len());
    for mut group in groups {
        let bump = bump_group(&mut group)?;
        tracing::info!("Variable Group ID: {}", bump.group_id);
        tracing::debug!("Previous version: {}", bump.previous);
        tracing::info!("Version: {}", bump.version);
        client
            .update_variable_group(bump.group_id, &group)
            .await
            .with_context(|| format!("update variable group {}", bump.group_id))?;
        tracing::debug!("Variable group {} updated", bump.group_id);
        bumps.push(bump);
    }
    Ok(bumps)
}
