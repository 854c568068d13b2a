//! Terraform Cloud v2 API client.
//!
//! Covers the workspace, configuration-version, variable, run and apply
//! endpoints the workflows need. Every call except the tarball upload and the
//! log downloads is authenticated with the team or user token.

use crate::error::{check_status, decode, ApiError};
use crate::model::{
    ApplyAttributes, Collection, ConfigVersionAttributes, Document, RunAttributes, RunConfig,
    VariableAttributes, VariableDocument, WorkspaceAttributes,
};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

const JSON_API: &str = "application/vnd.api+json";

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Which related resource to side-load with a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunInclude {
    Plan,
    Apply,
}

impl RunInclude {
    fn as_query(self) -> &'static str {
        match self {
            RunInclude::Plan => "plan",
            RunInclude::Apply => "apply",
        }
    }
}

#[derive(Clone)]
pub struct TerraformClient {
    http: reqwest::Client,
    api_base: String,
    organization: String,
    workspace: String,
    auth: HeaderValue,
}

impl TerraformClient {
    pub fn new(cfg: &RunConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", cfg.token))?;
        auth.set_sensitive(true);
        Ok(Self {
            http,
            api_base: format!("{}/api/v2", cfg.address.trim_end_matches('/')),
            organization: cfg.organization.clone(),
            workspace: cfg.workspace.clone(),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_API));
        h.insert(AUTHORIZATION, self.auth.clone());
        h
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> ApiResult<reqwest::Response> {
        let label = method_label(&method);
        let mut req = self.http.request(method, url).headers(self.headers());
        if let Some(body) = body {
            // serde_json::to_vec on a Value cannot fail.
            req = req.body(serde_json::to_vec(body).unwrap_or_default());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::transport(url, e))?;
        check_status(label, url, resp).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ApiResult<T> {
        let url = self.url(path);
        let resp = self.send(method, &url, body).await?;
        decode(&url, resp).await
    }

    // Workspaces

    /// `None` when the workspace does not exist yet.
    pub async fn show_workspace(&self) -> ApiResult<Option<Document<WorkspaceAttributes>>> {
        let path = format!(
            "/organizations/{}/workspaces/{}",
            self.organization, self.workspace
        );
        match self.call(Method::GET, &path, None).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `None` when the API answers 422, which it does for a name that is already taken.
    pub async fn create_workspace(
        &self,
        terraform_version: &str,
    ) -> ApiResult<Option<Document<WorkspaceAttributes>>> {
        let path = format!("/organizations/{}/workspaces", self.organization);
        let body = json!({
            "data": {
                "type": "workspaces",
                "attributes": {
                    "name": self.workspace,
                    "terraform-version": terraform_version,
                }
            }
        });
        match self.call(Method::POST, &path, Some(&body)).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.status() == Some(StatusCode::UNPROCESSABLE_ENTITY) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn update_workspace(
        &self,
        attributes: Value,
    ) -> ApiResult<Document<WorkspaceAttributes>> {
        let path = format!(
            "/organizations/{}/workspaces/{}",
            self.organization, self.workspace
        );
        let body = json!({"data": {"type": "workspaces", "attributes": attributes}});
        self.call(Method::PATCH, &path, Some(&body)).await
    }

    #[allow(dead_code)]
    pub async fn list_workspaces(&self) -> ApiResult<Collection<WorkspaceAttributes>> {
        let path = format!("/organizations/{}/workspaces", self.organization);
        self.call(Method::GET, &path, None).await
    }

    // Configuration versions

    pub async fn create_config_version(
        &self,
        workspace_id: &str,
    ) -> ApiResult<Document<ConfigVersionAttributes>> {
        let path = format!("/workspaces/{workspace_id}/configuration-versions");
        let body = json!({
            "data": {
                "type": "configuration-versions",
                "attributes": {"auto-queue-runs": false}
            }
        });
        self.call(Method::POST, &path, Some(&body)).await
    }

    pub async fn show_config_version(
        &self,
        config_version_id: &str,
    ) -> ApiResult<Document<ConfigVersionAttributes>> {
        let path = format!("/configuration-versions/{config_version_id}");
        self.call(Method::GET, &path, None).await
    }

    #[allow(dead_code)]
    pub async fn list_config_versions(
        &self,
        workspace_id: &str,
    ) -> ApiResult<Collection<ConfigVersionAttributes>> {
        let path = format!("/workspaces/{workspace_id}/configuration-versions");
        self.call(Method::GET, &path, None).await
    }

    /// The upload URL is pre-signed; it takes no Authorization header.
    pub async fn upload_config(&self, upload_url: &str, tarball: Bytes) -> ApiResult<()> {
        let resp = self
            .http
            .put(upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(tarball)
            .send()
            .await
            .map_err(|e| ApiError::transport(upload_url, e))?;
        check_status("PUT", upload_url, resp).await?;
        Ok(())
    }

    // Variables

    pub async fn list_variables(
        &self,
        workspace_id: &str,
    ) -> ApiResult<Collection<VariableAttributes>> {
        let path = format!("/workspaces/{workspace_id}/vars");
        self.call(Method::GET, &path, None).await
    }

    pub async fn create_variable(
        &self,
        workspace_id: &str,
        variable: &VariableDocument,
    ) -> ApiResult<String> {
        let path = format!("/workspaces/{workspace_id}/vars");
        let body = to_value(variable);
        let doc: Document<VariableAttributes> = self.call(Method::POST, &path, Some(&body)).await?;
        Ok(doc.data.id)
    }

    pub async fn update_variable(
        &self,
        workspace_id: &str,
        variable_id: &str,
        variable: &VariableDocument,
    ) -> ApiResult<()> {
        let path = format!("/workspaces/{workspace_id}/vars/{variable_id}");
        let url = self.url(&path);
        let mut body = to_value(variable);
        body["data"]["id"] = Value::String(variable_id.to_string());
        self.send(Method::PATCH, &url, Some(&body)).await?;
        Ok(())
    }

    pub async fn delete_variable(&self, workspace_id: &str, variable_id: &str) -> ApiResult<()> {
        let url = self.url(&format!("/workspaces/{workspace_id}/vars/{variable_id}"));
        self.send(Method::DELETE, &url, None).await?;
        Ok(())
    }

    // Runs and applies

    pub async fn create_run(
        &self,
        workspace_id: &str,
        destroy: bool,
        message: &str,
    ) -> ApiResult<Document<RunAttributes>> {
        let body = json!({
            "data": {
                "type": "runs",
                "attributes": {
                    "is-destroy": destroy,
                    "message": message,
                },
                "relationships": {
                    "workspace": {
                        "data": {"type": "workspaces", "id": workspace_id}
                    }
                }
            }
        });
        self.call(Method::POST, "/runs", Some(&body)).await
    }

    pub async fn get_run(
        &self,
        run_id: &str,
        include: Option<RunInclude>,
    ) -> ApiResult<Document<RunAttributes>> {
        let path = match include {
            Some(inc) => format!("/runs/{run_id}?include={}", inc.as_query()),
            None => format!("/runs/{run_id}"),
        };
        self.call(Method::GET, &path, None).await
    }

    pub async fn apply_run(&self, run_id: &str, comment: &str) -> ApiResult<()> {
        let url = self.url(&format!("/runs/{run_id}/actions/apply"));
        let body = json!({"comment": comment});
        self.send(Method::POST, &url, Some(&body)).await?;
        Ok(())
    }

    pub async fn show_apply(&self, apply_id: &str) -> ApiResult<Document<ApplyAttributes>> {
        self.call(Method::GET, &format!("/applies/{apply_id}"), None)
            .await
    }

    /// Fetch a plan or apply log from its pre-signed `log-read-url`.
    pub async fn download_log(&self, log_url: &str) -> ApiResult<String> {
        let resp = self
            .http
            .get(log_url)
            .send()
            .await
            .map_err(|e| ApiError::transport(log_url, e))?;
        let resp = check_status("GET", log_url, resp).await?;
        resp.text()
            .await
            .map_err(|e| ApiError::transport(log_url, e))
    }
}

/// `included[0].<field path>` from a side-loaded run document.
pub fn included_field<'a>(included: &'a [Value], pointer: &str) -> Option<&'a str> {
    included.first()?.pointer(pointer)?.as_str()
}

fn to_value(variable: &VariableDocument) -> Value {
    serde_json::to_value(variable).unwrap_or(Value::Null)
}

fn method_label(m: &Method) -> &'static str {
    match *m {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::PATCH => "PATCH",
        Method::DELETE => "DELETE",
        _ => "REQUEST",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{run_config, MockServer};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    #[tokio::test]
    async fn show_workspace_maps_404_to_none() {
        let app = Router::new().route(
            "/api/v2/organizations/acme/workspaces/net",
            get(|| async { (AxumStatus::NOT_FOUND, "{}") }),
        );
        let server = MockServer::start(app).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();
        assert!(client.show_workspace().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_workspace_maps_422_to_none() {
        let app = Router::new().route(
            "/api/v2/organizations/acme/workspaces",
            post(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "{}") }),
        );
        let server = MockServer::start(app).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();
        assert!(client.create_workspace("1.6.0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_errors_keep_status_and_body() {
        let app = Router::new().route(
            "/api/v2/runs/run-1",
            get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let server = MockServer::start(app).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();
        let err = client.get_run("run-1", None).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn requests_carry_bearer_token_and_json_api_type() {
        let app = Router::new().route(
            "/api/v2/organizations/acme/workspaces/net",
            get(|headers: AxumHeaders| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let ctype = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth == "Bearer test-token" && ctype == JSON_API {
                    Json(json!({
                        "data": {"id": "ws-1", "type": "workspaces", "attributes": {"name": "net"}}
                    }))
                    .into_response()
                } else {
                    AxumStatus::UNAUTHORIZED.into_response()
                }
            }),
        );
        let server = MockServer::start(app).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();
        let ws = client.show_workspace().await.unwrap().unwrap();
        assert_eq!(ws.data.id, "ws-1");
    }

    #[tokio::test]
    async fn list_calls_decode_collections() {
        let app = Router::new()
            .route(
                "/api/v2/organizations/acme/workspaces",
                get(|| async {
                    Json(json!({"data": [
                        {"id": "ws-1", "type": "workspaces", "attributes": {"name": "net", "terraform-version": "1.5.7"}},
                        {"id": "ws-2", "type": "workspaces", "attributes": {"name": "dns"}}
                    ]}))
                }),
            )
            .route(
                "/api/v2/workspaces/ws-1/configuration-versions",
                get(|| async {
                    Json(json!({"data": [
                        {"id": "cv-2", "type": "configuration-versions", "attributes": {"status": "uploaded"}}
                    ]}))
                }),
            );
        let server = MockServer::start(app).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();

        let workspaces = client.list_workspaces().await.unwrap();
        assert_eq!(workspaces.data.len(), 2);
        assert_eq!(
            workspaces.data[0].attributes.terraform_version.as_deref(),
            Some("1.5.7")
        );
        let versions = client.list_config_versions("ws-1").await.unwrap();
        assert_eq!(versions.data[0].attributes.status, "uploaded");
    }

    #[tokio::test]
    async fn update_workspace_patches_attributes() {
        let app = Router::new().route(
            "/api/v2/organizations/acme/workspaces/net",
            axum::routing::patch(|Json(body): Json<Value>| async move {
                let version = body["data"]["attributes"]["terraform-version"].clone();
                Json(json!({
                    "data": {"id": "ws-1", "type": "workspaces",
                        "attributes": {"name": "net", "terraform-version": version}}
                }))
            }),
        );
        let server = MockServer::start(app).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();
        let ws = client
            .update_workspace(json!({"terraform-version": "1.7.0"}))
            .await
            .unwrap();
        assert_eq!(ws.data.attributes.terraform_version.as_deref(), Some("1.7.0"));
    }

    #[tokio::test]
    async fn bad_json_is_a_decode_error() {
        let app = Router::new().route(
            "/api/v2/applies/apply-1",
            get(|| async { "not json" }),
        );
        let server = MockServer::start(app).await;
        let client = TerraformClient::new(&run_config(&server.url)).unwrap();
        let err = client.show_apply("apply-1").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[test]
    fn included_field_reads_first_entry() {
        let included = vec![json!({"id": "plan-1", "attributes": {"log-read-url": "https://x/log"}})];
        assert_eq!(included_field(&included, "/id"), Some("plan-1"));
        assert_eq!(
            included_field(&included, "/attributes/log-read-url"),
            Some("https://x/log")
        );
        assert_eq!(included_field(&[], "/id"), None);
    }
}
