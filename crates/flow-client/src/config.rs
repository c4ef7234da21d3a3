//! Connection settings for the HTTP backend

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where and how to reach the orchestrator API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpBackendConfig {
    /// Scheme, host and port, e.g. `http://localhost:3000`
    pub base_url: String,
    /// Path prefix of the workflow API
    pub api_prefix: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Team the requests act for
    pub team_id: Option<String>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            api_prefix: "/api/workflow".to_string(),
            token: None,
            team_id: None,
            timeout_ms: 30_000,
        }
    }
}

impl HttpBackendConfig {
    /// Config for `base_url` with the default prefix and timeout
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Send `token` as a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Send `team_id` with every request
    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Per-request timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Absolute URL of an API path such as `/executions/search`
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_prefix.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_slashes() {
        let config = HttpBackendConfig::new("http://host:1/");
        assert_eq!(
            config.url("/executions/abc"),
            "http://host:1/api/workflow/executions/abc"
        );

        let config = HttpBackendConfig {
            api_prefix: "v2/".into(),
            ..HttpBackendConfig::new("http://host")
        };
        assert_eq!(config.url("metadata/wf"), "http://host/v2/metadata/wf");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HttpBackendConfig =
            serde_json::from_str(r#"{"baseUrl": "http://x", "teamId": "t1"}"#).unwrap();
        assert_eq!(config.api_prefix, "/api/workflow");
        assert_eq!(config.team_id.as_deref(), Some("t1"));
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }
}
