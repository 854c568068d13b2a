//! In-process HTTP fakes for the remote APIs.

use crate::model::RunConfig;
use axum::Router;
use std::time::Duration;

/// An axum app served on an ephemeral localhost port for the lifetime of the value.
pub(crate) struct MockServer {
    pub url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                eprintln!("mock server error: {e}");
            }
        });
        Self {
            url: format!("http://{addr}"),
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Terraform settings pointed at a mock server, with millisecond poll pacing.
pub(crate) fn run_config(address: &str) -> RunConfig {
    RunConfig {
        address: address.to_string(),
        organization: "acme".into(),
        workspace: "net".into(),
        terraform_version: "1.6.0".into(),
        token: "test-token".into(),
        directory: None,
        auto_approve: false,
        destroy: false,
        poll_interval: Duration::from_millis(5),
        poll_timeout: Duration::from_secs(5),
        variable_delay: Duration::from_millis(1),
        request_timeout: Duration::from_secs(5),
        log_dir: std::env::temp_dir(),
        user_agent: "cloud-pipeline/test".into(),
    }
}
