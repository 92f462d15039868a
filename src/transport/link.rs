//! Connection seam to the platform broker
//!
//! The MQTT/TLS stack lives behind [`PlatformLink`]; the transport client only
//! sees connect, subscribe, publish and a stream of [`LinkEvent`]s.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::credentials::Credentials;
use crate::Result;

/// Parameters for one connection attempt
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Broker URI (e.g. `ssl://iot-mqtts.example.com:8883`)
    pub server_uri: String,
    /// Derived credentials for this attempt
    pub credentials: Credentials,
    /// Keep-alive interval
    pub keep_alive: Duration,
}

/// Something the broker told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A message arrived on a subscribed topic
    Message {
        /// Full topic string
        topic: String,
        /// Raw payload
        payload: Vec<u8>,
    },
    /// The connection dropped unexpectedly
    ConnectionLost {
        /// Human-readable cause
        reason: String,
    },
}

/// Trait for platform broker connections
#[async_trait]
pub trait PlatformLink: Send + Sync {
    /// Link implementation name, for logs
    fn name(&self) -> &'static str;

    /// Connect and return the event stream for this connection
    ///
    /// Resolves once the broker acknowledged the connection or refused it.
    async fn connect(&self, options: &ConnectOptions) -> Result<mpsc::Receiver<LinkEvent>>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Publish a payload
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;
}
