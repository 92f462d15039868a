//! In-process platform link
//!
//! A loopback [`PlatformLink`] that records what the client does and lets the
//! caller play the broker: inject downlinks, drop the connection, refuse
//! connects, fail publishes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::credentials::Credentials;
use super::link::{ConnectOptions, LinkEvent, PlatformLink};
use crate::{Error, Result};

const EVENT_BUFFER: usize = 64;

/// A message the client published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    /// Payload parsed as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Default)]
struct State {
    events: Option<mpsc::Sender<LinkEvent>>,
    connected: bool,
    fail_connects: u32,
    fail_publishes: u32,
    connect_count: usize,
    last_credentials: Option<Credentials>,
    subscriptions: Vec<String>,
    published: Vec<Published>,
}

/// Loopback broker link
pub struct MemoryLink {
    state: Mutex<State>,
    published_tx: mpsc::UnboundedSender<Published>,
    published_rx: AsyncMutex<mpsc::UnboundedReceiver<Published>>,
}

impl Default for MemoryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryLink")
            .field("connected", &state.connected)
            .field("subscriptions", &state.subscriptions)
            .field("published", &state.published.len())
            .finish_non_exhaustive()
    }
}

impl MemoryLink {
    #[must_use]
    pub fn new() -> Self {
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            published_tx,
            published_rx: AsyncMutex::new(published_rx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `n` connect attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    /// Fail the next `n` publishes
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().fail_publishes = n;
    }

    /// Deliver a downlink as if the broker sent it
    pub async fn inject(&self, topic: &str, payload: Vec<u8>) {
        let events = self.lock().events.clone();
        let Some(events) = events else {
            tracing::debug!(topic, "not connected, dropping injected message");
            return;
        };

        let event = LinkEvent::Message {
            topic: topic.to_string(),
            payload,
        };
        if events.send(event).await.is_err() {
            tracing::debug!(topic, "client stopped listening");
        }
    }

    /// Drop the connection as if the broker went away
    pub async fn drop_connection(&self, reason: &str) {
        let events = {
            let mut state = self.lock();
            state.connected = false;
            state.events.take()
        };

        if let Some(events) = events {
            let _ = events
                .send(LinkEvent::ConnectionLost {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Whether a connection is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Connect attempts so far, refused ones included
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    /// Credentials presented on the latest connect attempt
    #[must_use]
    pub fn last_credentials(&self) -> Option<Credentials> {
        self.lock().last_credentials.clone()
    }

    /// Subscriptions made so far, in order
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// Forget recorded subscriptions
    pub fn clear_subscriptions(&self) {
        self.lock().subscriptions.clear();
    }

    /// Everything published so far
    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Published messages whose topic contains `needle`
    #[must_use]
    pub fn published_to(&self, needle: &str) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.topic.contains(needle))
            .cloned()
            .collect()
    }

    /// Wait for the next successful publish
    pub async fn next_published(&self) -> Option<Published> {
        self.published_rx.lock().await.recv().await
    }
}

#[async_trait]
impl PlatformLink for MemoryLink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<mpsc::Receiver<LinkEvent>> {
        let mut state = self.lock();
        state.connect_count += 1;
        state.last_credentials = Some(options.credentials.clone());

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        state.events = Some(tx);
        state.connected = true;
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(Error::Transport("not connected".to_string()));
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let published = {
            let mut state = self.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(Error::Transport("publish rejected".to_string()));
            }
            if !state.connected {
                return Err(Error::Transport("not connected".to_string()));
            }

            let published = Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            state.published.push(published.clone());
            published
        };

        let _ = self.published_tx.send(published);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        state.connected = false;
        state.events = None;
        Ok(())
    }
}
