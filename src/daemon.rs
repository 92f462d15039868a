//! Daemon - the edge service
//!
//! Builds the orchestrator the configuration selects, connects it to the
//! platform, and serves device connections until interrupted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::Bridge;
use crate::config::Mode;
use crate::gateway::{Gateway, MemorySubDeviceStore, SubDeviceStore};
use crate::server::{DeviceHandler, DeviceServer};
use crate::transport::PlatformLink;
use crate::{Config, Result};

/// The orchestrator a daemon runs
#[derive(Debug, Clone)]
pub enum Orchestrator {
    Bridge(Bridge),
    Gateway(Gateway),
}

impl Orchestrator {
    /// Subscribe and connect to the platform
    ///
    /// # Errors
    ///
    /// Returns error if the initial platform connection fails
    pub async fn start(&self) -> Result<()> {
        match self {
            Self::Bridge(bridge) => bridge.start().await,
            Self::Gateway(gateway) => gateway.start().await,
        }
    }

    /// Disconnect and close every device channel
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to disconnect cleanly
    pub async fn close(&self) -> Result<()> {
        match self {
            Self::Bridge(bridge) => bridge.close().await,
            Self::Gateway(gateway) => gateway.close().await,
        }
    }

    fn handler(&self) -> Arc<dyn DeviceHandler> {
        match self {
            Self::Bridge(bridge) => Arc::new(bridge.clone()),
            Self::Gateway(gateway) => Arc::new(gateway.clone()),
        }
    }
}

/// The edge daemon
pub struct Daemon {
    config: Config,
    orchestrator: Orchestrator,
}

impl Daemon {
    /// Create a daemon over `link`
    ///
    /// Gateway mode starts from an empty in-memory sub-device store; use
    /// [`Self::with_store`] to supply another.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: Config, link: Arc<dyn PlatformLink>) -> Result<Self> {
        Self::with_store(config, link, Arc::new(MemorySubDeviceStore::new()))
    }

    /// Create a daemon with an explicit sub-device store
    ///
    /// The store is unused in bridge mode.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn with_store(
        config: Config,
        link: Arc<dyn PlatformLink>,
        store: Arc<dyn SubDeviceStore>,
    ) -> Result<Self> {
        let orchestrator = match config.mode {
            Mode::Bridge => Orchestrator::Bridge(Bridge::from_config(link, &config)?),
            Mode::Gateway => Orchestrator::Gateway(Gateway::from_config(link, &config, store)?),
        };
        Ok(Self {
            config,
            orchestrator,
        })
    }

    /// The running orchestrator
    #[must_use]
    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the platform connection or the device listener
    /// cannot be established
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.cancel();
            }
        });
        self.run_until(shutdown).await
    }

    /// Run the daemon until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns error if the platform connection or the device listener
    /// cannot be established
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        self.orchestrator.start().await?;

        let server = DeviceServer::bind(
            &self.config.device.listen_addr,
            self.orchestrator.handler(),
            self.config.device.max_frame_len,
        )
        .await;
        let server = match server {
            Ok(server) => server,
            Err(e) => {
                let _ = self.orchestrator.close().await;
                return Err(e);
            }
        };

        tracing::info!(
            mode = ?self.config.mode,
            listen = %self.config.device.listen_addr,
            server_uri = %self.config.platform.server_uri,
            "daemon running"
        );

        server.run(shutdown).await?;
        tracing::info!("shutdown requested");
        self.orchestrator.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryLink;

    fn config(mode: Mode) -> Config {
        let mut config = Config {
            mode,
            ..Config::default()
        };
        config.platform.server_uri = "tcp://broker:1883".to_string();
        config.platform.bridge_id = Some("bridge-1".to_string());
        config.platform.device_id = Some("gw-1".to_string());
        config.platform.secret = Some("s3cret".to_string());
        config
    }

    #[test]
    fn mode_selects_orchestrator() {
        let link = Arc::new(MemoryLink::new());

        let daemon = Daemon::new(config(Mode::Bridge), link.clone()).unwrap();
        assert!(matches!(daemon.orchestrator(), Orchestrator::Bridge(_)));

        let daemon = Daemon::new(config(Mode::Gateway), link).unwrap();
        assert!(matches!(daemon.orchestrator(), Orchestrator::Gateway(_)));
    }

    #[test]
    fn invalid_config_is_fatal() {
        let mut config = config(Mode::Bridge);
        config.platform.server_uri = String::new();

        assert!(Daemon::new(config, Arc::new(MemoryLink::new())).is_err());
    }

    #[tokio::test]
    async fn refused_platform_connect_stops_startup() {
        let link = Arc::new(MemoryLink::new());
        link.fail_next_connects(1);
        let daemon = Daemon::new(config(Mode::Bridge), link).unwrap();

        assert!(daemon.run_until(CancellationToken::new()).await.is_err());
    }
}
