//! Retry with exponential backoff for upstream HTTP APIs.
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use anyhow::Result;

use crate::error::RagError;

/// Send the request built by `build` until it succeeds or `max_retries`
/// retries are exhausted, and decode the JSON body.
///
/// `build` is called once per attempt since a `RequestBuilder` is consumed
/// by `send`.
pub async fn send_json<F>(provider: &str, max_retries: u32, build: F) -> Result<serde_json::Value>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(provider, attempt, ?delay, "retrying upstream request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await.map_err(|e| {
                        RagError::upstream(provider, format!("invalid JSON response: {}", e))
                    })?;
                    return Ok(json);
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = RagError::upstream(provider, format!("HTTP {}: {}", status, body_text));

                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(provider, %status, attempt, "transient upstream error");
                    last_err = Some(err);
                    continue;
                }

                return Err(err.into());
            }
            Err(e) => {
                tracing::warn!(provider, attempt, error = %e, "upstream connection error");
                last_err = Some(RagError::upstream(provider, e.to_string()));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| RagError::upstream(provider, "request failed after retries"))
        .into())
}

/// Build a client with the given per-request timeout.
pub fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}
