//! HTTP client shared by every adapter of a session (one connection pool).

use std::time::Duration;

use livetv_core::config::HttpConfig;

use crate::error::{PlaybackError, PlaybackResult};

/// Build the stream client. No overall request timeout: live bodies never end,
/// the negotiation deadline bounds how long we wait for them.
pub fn build_client(config: &HttpConfig) -> PlaybackResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .user_agent(config.user_agent.clone())
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| PlaybackError::Client(format!("Failed to create HTTP client: {e}")))
}
