use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{clock::DefaultClock, state::InMemoryState, Quota, RateLimiter};
use reqwest::Client;
use tracing::trace;

use delta_desk_execution::ExecError;

use crate::session::NeoSession;

type DirectLimiter = RateLimiter<governor::state::direct::NotKeyed, InMemoryState, DefaultClock>;

/// Rate-limited HTTP client for the Neo order gateway.
///
/// The gateway takes form posts with the JSON payload in a `jData` field and
/// answers 429 when throttled; that is surfaced as `ExecError::RateLimited`
/// so the chase engine owns the backoff.
pub struct NeoClient {
    http: Client,
    base_url: String,
    limiter: Arc<DirectLimiter>,
}

impl NeoClient {
    #[must_use]
    pub fn new(base_url: String, requests_per_sec: u32) -> Self {
        let per_second =
            NonZeroU32::new(requests_per_sec).unwrap_or(NonZeroU32::MIN);
        Self {
            http: Client::new(),
            base_url,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    pub async fn form_post(
        &self,
        path: &str,
        session: &NeoSession,
        j_data: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecError> {
        self.limiter.until_ready().await;

        let url = format!("{}{}?sId={}", self.base_url, path, session.server_id);
        trace!(url, "Neo form post");
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", session.bearer))
            .header("Sid", &session.sid)
            .header("Auth", &session.auth)
            .header("neo-fin-key", &session.fin_key)
            .form(&[("jData", j_data.to_string())])
            .send()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExecError::RateLimited);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExecError::Transport(format!(
                "gateway returned {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))
    }
}
