// Runtime configuration for a sync session

use std::env;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://team-sync-2.onrender.com";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST API
    pub api_url: String,
    /// Base URL of the realtime channel; derived from `api_url` when unset
    pub socket_url: Option<String>,
    /// Coalescing window for outbound typing notifications
    pub typing_debounce: Duration,
    /// How long an inbound typing flag stays visible
    pub typing_expiry: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// None retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Client-side deadline for REST calls; None waits for the server
    pub request_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: None,
            typing_debounce: Duration::from_millis(500),
            typing_expiry: Duration::from_secs(3),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            request_timeout: None,
        }
    }
}

impl SyncConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        SyncConfig {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Defaults overridden by TEAMSYNC_API_URL and TEAMSYNC_SOCKET_URL
    pub fn from_env() -> Self {
        let mut config = match env::var("TEAMSYNC_API_URL") {
            Ok(url) if !url.trim().is_empty() => SyncConfig::new(url.trim()),
            _ => SyncConfig::default(),
        };
        if let Ok(url) = env::var("TEAMSYNC_SOCKET_URL") {
            if !url.trim().is_empty() {
                config.socket_url = Some(url.trim().trim_end_matches('/').to_string());
            }
        }
        config
    }

    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = Some(url.into());
        self
    }

    pub fn with_reconnect_limit(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// WebSocket endpoint for the Engine.IO transport
    pub fn channel_endpoint(&self) -> String {
        let base = match &self.socket_url {
            Some(url) => url.clone(),
            None => self.api_url.clone(),
        };
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base
        };
        format!(
            "{}/socket.io/?EIO=4&transport=websocket",
            base.trim_end_matches('/')
        )
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}
