//! Provisioning side channel for terminal sessions.
//!
//! Before a session's stream is opened, the backend must start the remote
//! process: `POST {terminal_api_path}?cwd=..&command=..&auto_start=..`.
//! Tearing it down is a `DELETE` on the same path. A `404` on delete means
//! the process is already gone and counts as success.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::constants;
use crate::error::{Error, Result};

/// How a terminal session should be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Working directory for the remote process.
    pub cwd: Option<String>,
    /// Command to run instead of the default shell.
    pub command: Option<String>,
    /// Start the process immediately.
    pub auto_start: bool,
    /// Initial columns.
    pub cols: u16,
    /// Initial rows.
    pub rows: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            command: None,
            auto_start: true,
            cols: constants::DEFAULT_COLS,
            rows: constants::DEFAULT_ROWS,
        }
    }
}

impl SessionOptions {
    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the initial command.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set the initial size.
    #[must_use]
    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// Starts and stops the remote process behind a session.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start the remote process for `session_id`.
    async fn create(&self, session_id: &str, options: &SessionOptions) -> Result<()>;

    /// Stop the remote process. Already-gone counts as success.
    async fn destroy(&self, session_id: &str) -> Result<()>;
}

/// [`Provisioner`] speaking HTTP to the backend.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: Client,
    config: Config,
}

impl HttpProvisioner {
    /// Provisioner for the backend described by `config`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, session_id: &str) -> Result<Url> {
        self.config
            .terminal_api_url(session_id)
            .map_err(|e| Error::Provisioning(format!("{e:#}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create(&self, session_id: &str, options: &SessionOptions) -> Result<()> {
        let mut url = self.url(session_id)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(cwd) = &options.cwd {
                query.append_pair("cwd", cwd);
            }
            if let Some(command) = &options.command {
                query.append_pair("command", command);
            }
            query.append_pair("auto_start", if options.auto_start { "true" } else { "false" });
        }

        let response = self
            .authorize(self.client.post(url))
            .send()
            .await
            .map_err(|e| Error::Provisioning(format!("create {session_id}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provisioning(format!(
                "create {session_id}: HTTP {status}: {}",
                body.trim()
            )));
        }

        log::info!("[Provision] Created terminal {}", session_id);
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        let url = self.url(session_id)?;
        let response = self
            .authorize(self.client.delete(url))
            .send()
            .await
            .map_err(|e| Error::Provisioning(format!("destroy {session_id}: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                log::info!("[Provision] Destroyed terminal {}", session_id);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                log::debug!("[Provision] Terminal {} already gone", session_id);
                Ok(())
            }
            status => Err(Error::Provisioning(format!(
                "destroy {session_id}: HTTP {status}"
            ))),
        }
    }
}
