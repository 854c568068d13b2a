//! Errors raised by the remote API clients.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("malformed response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn transport(url: &str, source: reqwest::Error) -> Self {
        ApiError::Transport {
            url: url.to_string(),
            source,
        }
    }
}

/// Turn a non-success response into `ApiError::Status`, keeping a prefix of the body.
pub(crate) async fn check_status(
    method: &'static str,
    url: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    Err(ApiError::Status {
        method,
        url: url.to_string(),
        status,
        body,
    })
}

/// Read the body and parse it as JSON; a parse failure is `ApiError::Decode`.
pub(crate) async fn decode<T: DeserializeOwned>(
    url: &str,
    resp: reqwest::Response,
) -> Result<T, ApiError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ApiError::transport(url, e))?;
    serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}
