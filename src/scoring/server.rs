use super::influx::{sale_lines, InfluxWriter};
use super::record::{parse_payload, SALE_PRICE};
use super::scorer::{LinearModel, Scorer};
use crate::model::ScoringConfig;
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub scorer: Arc<dyn Scorer>,
    pub influx: Option<Arc<InfluxWriter>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/score", post(score))
        .with_state(state)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({"status": "Connection Successful"}))
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

async fn score(State(state): State<AppState>, body: Bytes) -> Response {
    let records = match parse_payload(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Rejected score request: {e:#}");
            return error_response(StatusCode::BAD_REQUEST, format!("{e:#}"));
        }
    };
    tracing::debug!("Payload: {} record(s)", records.len());

    let prices = match state.scorer.score(&records) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Scoring failed: {e:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"));
        }
    };
    tracing::debug!("Payload score: {prices:?}");

    if let Some(influx) = state.influx.as_ref() {
        let now_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let lines = sale_lines(&records, &prices, now_ms);
        if let Err(e) = influx.write_lines(&lines).await {
            tracing::error!("Failed to record scores in InfluxDB: {e}");
        }
    }

    Json(json!({ SALE_PRICE: prices })).into_response()
}

/// Load the model, prepare InfluxDB, and serve until `shutdown` resolves.
pub async fn serve<F>(cfg: ScoringConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let model = LinearModel::load(&cfg.model_path)?;
    tracing::info!(
        "Loaded model from {} ({} numeric, {} categorical terms)",
        cfg.model_path.display(),
        model.numeric.len(),
        model.categorical.len()
    );

    let influx = match cfg.influx {
        Some(influx_cfg) => {
            let database = influx_cfg.database.clone();
            let writer = InfluxWriter::new(influx_cfg)?;
            writer
                .create_database()
                .await
                .with_context(|| format!("create InfluxDB database '{database}'"))?;
            tracing::info!("Recording scores in InfluxDB database '{database}'");
            Some(Arc::new(writer))
        }
        None => None,
    };

    let app = router(AppState {
        scorer: Arc::new(model),
        influx,
    });
    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    tracing::info!("Scoring service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("scoring server failed")?;
    tracing::info!("Scoring service stopped");
    Ok(())
}
