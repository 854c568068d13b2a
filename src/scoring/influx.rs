//! Minimal InfluxDB v1 HTTP writer for scored sales.

use super::record::{self, HousingRecord};
use crate::error::{check_status, ApiError};
use crate::model::InfluxConfig;
use anyhow::Result;

pub const MEASUREMENT: &str = "sale_prices";

pub struct InfluxWriter {
    http: reqwest::Client,
    cfg: InfluxConfig,
}

impl InfluxWriter {
    pub fn new(cfg: InfluxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self { http, cfg })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.cfg.url.trim_end_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.cfg.username {
            Some(user) => req.basic_auth(user, self.cfg.password.as_deref()),
            None => req,
        }
    }

    /// `CREATE DATABASE` is idempotent on the server side.
    pub async fn create_database(&self) -> Result<(), ApiError> {
        let url = self.endpoint("query");
        let q = format!("CREATE DATABASE \"{}\"", self.cfg.database.replace('"', "\\\""));
        let resp = self
            .authorize(self.http.post(&url).query(&[("q", q.as_str())]))
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;
        check_status("POST", &url, resp).await?;
        Ok(())
    }

    pub async fn write_lines(&self, lines: &[String]) -> Result<(), ApiError> {
        if lines.is_empty() {
            return Ok(());
        }
        let url = self.endpoint("write");
        let resp = self
            .authorize(
                self.http
                    .post(&url)
                    .query(&[("db", self.cfg.database.as_str()), ("precision", "ms")])
                    .body(lines.join("\n")),
            )
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;
        check_status("POST", &url, resp).await?;
        Ok(())
    }
}

/// One line-protocol point per scored record, all stamped with `timestamp_ms`.
pub fn sale_lines(records: &[HousingRecord], prices: &[f64], timestamp_ms: i64) -> Vec<String> {
    records
        .iter()
        .zip(prices)
        .map(|(r, price)| {
            let mut fields: Vec<String> = Vec::with_capacity(10);
            for (name, v) in r.numeric_fields() {
                fields.push(format!("{}={v}i", escape_key(name)));
            }
            for (name, v) in r.categorical_fields() {
                fields.push(format!("{}={}", escape_key(name), quote_string(v)));
            }
            fields.push(format!("{}={price}", escape_key(record::SALE_PRICE)));
            format!(
                "{} {} {timestamp_ms}",
                escape_key(MEASUREMENT),
                fields.join(",")
            )
        })
        .collect()
}

fn escape_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn quote_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockServer;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn record() -> HousingRecord {
        HousingRecord {
            borough: 1,
            neighborhood: "ALPHABET CITY".into(),
            building_class_category: "07 RENTALS, \"WALKUP\"".into(),
            commercial_units: 0,
            total_units: 5,
            land_square_feet: 1633,
            gross_square_feet: 6440,
            year_built: 1900,
            building_class_at_sale: "C2".into(),
        }
    }

    #[test]
    fn line_protocol_escapes_keys_and_strings() {
        let lines = sale_lines(&[record()], &[1250000.5], 1_700_000_000_000);
        assert_eq!(
            lines[0],
            "sale_prices BOROUGH=1i,COMMERCIAL\\ UNITS=0i,TOTAL\\ UNITS=5i,\
             LAND\\ SQUARE\\ FEET=1633i,GROSS\\ SQUARE\\ FEET=6440i,YEAR\\ BUILT=1900i,\
             NEIGHBORHOOD=\"ALPHABET CITY\",\
             BUILDING\\ CLASS\\ CATEGORY=\"07 RENTALS, \\\"WALKUP\\\"\",\
             BUILDING\\ CLASS\\ AT\\ TIME\\ OF\\ SALE=\"C2\",\
             SALE\\ PRICE=1250000.5 1700000000000"
        );
    }

    #[tokio::test]
    async fn creates_database_and_writes_points() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let app = Router::new()
            .route(
                "/query",
                post(
                    |State(s): State<Arc<Mutex<Vec<String>>>>,
                     Query(q): Query<HashMap<String, String>>| async move {
                        s.lock().unwrap().push(q["q"].clone());
                        StatusCode::OK
                    },
                ),
            )
            .route(
                "/write",
                post(
                    |State(s): State<Arc<Mutex<Vec<String>>>>,
                     Query(q): Query<HashMap<String, String>>,
                     body: String| async move {
                        assert_eq!(q["db"], "housing");
                        assert_eq!(q["precision"], "ms");
                        s.lock().unwrap().push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(seen.clone());
        let server = MockServer::start(app).await;
        let writer = InfluxWriter::new(InfluxConfig {
            url: format!("{}/", server.url),
            database: "housing".into(),
            username: Some("svc".into()),
            password: Some("pw".into()),
            request_timeout: Duration::from_secs(5),
            user_agent: "cloud-pipeline/test".into(),
        })
        .unwrap();

        writer.create_database().await.unwrap();
        let lines = sale_lines(&[record(), record()], &[1.0, 2.0], 10);
        writer.write_lines(&lines).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "CREATE DATABASE \"housing\"");
        assert_eq!(seen[1].lines().count(), 2);
        assert!(seen[1].ends_with("SALE\\ PRICE=2 10"));
    }
}
