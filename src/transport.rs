//! The transport service: one RPC socket plus the terminal multiplexer.
//!
//! Construct one per backend and hand it (or its parts) to consumers. Nothing
//! connects until [`Transport::start`]; [`Transport::stop`] tears down every
//! terminal session and the shared socket. Independent instances share no
//! state, so tests can run several side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::events::EventRouter;
use crate::rpc::RpcClient;
use crate::terminal::{HttpProvisioner, Provisioner, TerminalMux};

/// Explicitly constructed transport service.
#[derive(Debug)]
pub struct Transport {
    config: Config,
    rpc: RpcClient,
    terminals: TerminalMux,
    running: AtomicBool,
}

impl Transport {
    /// Service for `config`, provisioning terminals over HTTP.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let provisioner = Arc::new(HttpProvisioner::new(config.clone())?);
        Self::with_provisioner(config, provisioner)
    }

    /// Service with a custom terminal provisioner.
    pub fn with_provisioner(
        config: Config,
        provisioner: Arc<dyn Provisioner>,
    ) -> anyhow::Result<Self> {
        let rpc = RpcClient::from_config(&config)?;
        let terminals = TerminalMux::new(config.clone(), provisioner);
        Ok(Self {
            config,
            rpc,
            terminals,
            running: AtomicBool::new(false),
        })
    }

    /// Open the shared socket. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[Transport] Starting against {}", self.config.base_url());
        self.rpc.start();
    }

    /// Destroy every terminal session and close the shared socket.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let sessions = self.terminals.shutdown().await;
        self.rpc.stop().await;
        log::info!("[Transport] Stopped ({} terminal session(s) closed)", sessions);
    }

    /// Whether `start` has been called without a matching `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The RPC façade.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Router for server-pushed events on the shared socket.
    pub fn events(&self) -> &EventRouter {
        self.rpc.events()
    }

    /// The terminal multiplexer.
    pub fn terminals(&self) -> &TerminalMux {
        &self.terminals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, ReconnectPolicy};

    fn offline_config() -> Config {
        Config {
            base_url: Some("http://127.0.0.1:1".to_string()),
            reconnect: ReconnectPolicy::Never,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let transport = Transport::new(offline_config()).unwrap();
        assert!(!transport.is_running());

        transport.start();
        transport.start();
        assert!(transport.is_running());

        transport.stop().await;
        assert!(!transport.is_running());
        assert_eq!(transport.rpc().state(), ConnectionState::Closed);
        assert!(transport.terminals().sessions().is_empty());
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let a = Transport::new(offline_config()).unwrap();
        let b = Transport::new(offline_config()).unwrap();

        let _sub = a.events().on("*", |_| {});
        assert_eq!(a.events().listener_count(), 1);
        assert_eq!(b.events().listener_count(), 0);
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = Config {
            base_url: Some("not a url".to_string()),
            ..Config::default()
        };
        assert!(Transport::new(config).is_err());
    }
}
