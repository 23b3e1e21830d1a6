//! Configuration loading and persistence.
//!
//! Resolves where the backend lives and how the transport behaves when the
//! link drops. The auth token is never written to disk; it only arrives via
//! the environment or the caller.

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::connection::ReconnectPolicy;
use crate::constants;
use crate::ws::http_to_ws_scheme;

/// File name of the persisted configuration inside the config directory.
const CONFIG_FILE: &str = "config.json";

/// Configuration for the transport core.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend base address. `None` falls back to [`constants::DEFAULT_BASE_URL`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Path of the shared RPC/event socket.
    pub rpc_path: String,
    /// Path template of a session stream; `{id}` is replaced by the session id.
    pub terminal_ws_path: String,
    /// Path template of the provisioning endpoint; `{id}` as above.
    pub terminal_api_path: String,
    /// What to do after the socket drops.
    pub reconnect: ReconnectPolicy,
    /// Default RPC deadline. `None` means requests wait until disconnect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// How long a new terminal session may take to reach the open state.
    pub open_timeout_ms: u64,
    /// Bearer token forwarded on handshakes and provisioning calls.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            rpc_path: constants::DEFAULT_RPC_PATH.to_string(),
            terminal_ws_path: constants::DEFAULT_TERMINAL_WS_PATH.to_string(),
            terminal_api_path: constants::DEFAULT_TERMINAL_API_PATH.to_string(),
            reconnect: ReconnectPolicy::default(),
            request_timeout_ms: None,
            open_timeout_ms: constants::SESSION_OPEN_TIMEOUT.as_millis() as u64,
            token: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `AUTOWIRE_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("AUTOWIRE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("autowire")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, then applies
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir` without consulting the environment.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Applies `AUTOWIRE_*` overrides read through `lookup`.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup("AUTOWIRE_BASE_URL") {
            self.base_url = Some(base_url);
        }

        if let Some(token) = lookup("AUTOWIRE_TOKEN") {
            self.token = Some(token);
        }

        if let Some(delay) = lookup("AUTOWIRE_RECONNECT_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(delay_ms) => self.reconnect = ReconnectPolicy::Fixed { delay_ms },
                Err(e) => log::warn!("Ignoring AUTOWIRE_RECONNECT_DELAY_MS={delay}: {e}"),
            }
        }

        if let Some(timeout) = lookup("AUTOWIRE_REQUEST_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.request_timeout_ms = Some(ms),
                Err(e) => log::warn!("Ignoring AUTOWIRE_REQUEST_TIMEOUT_MS={timeout}: {e}"),
            }
        }
    }

    /// Persists the configuration to `dir` (token excluded).
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Persists the configuration to the default config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Configured base address, or the local default.
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or(constants::DEFAULT_BASE_URL)
    }

    /// Picks the backend address for a client served from `page_origin`.
    ///
    /// A non-local origin means the backend serves the page itself, so the
    /// origin wins. Local or absent origins use the configured address.
    pub fn resolve_base_url(&self, page_origin: Option<&str>) -> String {
        let remote_origin = page_origin.and_then(|origin| {
            let url = Url::parse(origin).ok()?;
            let host = url.host_str()?;
            if matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1") {
                None
            } else {
                Some(origin.trim_end_matches('/').to_string())
            }
        });
        remote_origin.unwrap_or_else(|| self.base_url().trim_end_matches('/').to_string())
    }

    /// WebSocket URL of the shared RPC/event socket.
    pub fn rpc_url(&self) -> Result<String> {
        let url = join_path(self.base_url(), &self.rpc_path, None)?;
        Ok(http_to_ws_scheme(url.as_str()))
    }

    /// WebSocket URL of a session's dedicated stream.
    pub fn terminal_ws_url(&self, session_id: &str) -> Result<String> {
        let url = join_path(self.base_url(), &self.terminal_ws_path, Some(session_id))?;
        Ok(http_to_ws_scheme(url.as_str()))
    }

    /// HTTP URL of a session's provisioning endpoint.
    pub fn terminal_api_url(&self, session_id: &str) -> Result<Url> {
        join_path(self.base_url(), &self.terminal_api_path, Some(session_id))
    }

    /// Default RPC deadline, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Deadline for a session stream to open.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Headers sent with every handshake and provisioning request.
    pub fn auth_headers(&self) -> Vec<(String, String)> {
        self.token
            .iter()
            .filter(|token| !token.is_empty())
            .map(|token| ("Authorization".to_string(), format!("Bearer {token}")))
            .collect()
    }
}

/// Appends `template` to the path of `base`, substituting `{id}` segments
/// with the (percent-encoded) id.
fn join_path(base: &str, template: &str, id: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid base URL: {base}"))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|()| anyhow::anyhow!("base URL cannot carry a path: {base}"))?;
        segments.pop_if_empty();
        for segment in template.split('/').filter(|s| !s.is_empty()) {
            match (segment, id) {
                ("{id}", Some(id)) => segments.push(id),
                ("{id}", None) => anyhow::bail!("path template {template} needs an id"),
                (segment, _) => segments.push(segment),
            };
        }
    }
    Ok(url)
}
