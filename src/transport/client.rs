//! The single platform connection
//!
//! [`TransportClient`] owns the [`PlatformLink`]. Orchestrators never touch the
//! link directly: they publish through an outbound queue, receive downlinks
//! through the [`DispatchTable`] they built, and learn about connectivity via
//! [`ConnectionListener`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffPolicy, ReconnectBackoff};
use super::credentials::{AuthMode, Credentials};
use super::dispatch::DispatchTable;
use super::link::{ConnectOptions, LinkEvent, PlatformLink};
use crate::{Error, Result};

/// Default time allowed for the broker to acknowledge a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters for the transport client
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Broker URI
    pub server_uri: String,
    /// Identity the connection authenticates as (bridge or gateway id)
    pub identity: String,
    /// Authentication mode
    pub auth: AuthMode,
    /// Connect-complete timeout
    pub connect_timeout: Duration,
    /// MQTT keep-alive
    pub keep_alive: Duration,
    /// Reconnect backoff
    pub backoff: BackoffPolicy,
}

impl TransportOptions {
    /// Options with default timeouts and backoff
    #[must_use]
    pub fn new(server_uri: impl Into<String>, identity: impl Into<String>, auth: AuthMode) -> Self {
        Self {
            server_uri: server_uri.into(),
            identity: identity.into(),
            auth,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Connectivity callbacks
///
/// Called from the transport's own tasks; implementations must not block.
pub trait ConnectionListener: Send + Sync {
    /// Connection established; `reconnect` is false only for the first one
    fn on_connected(&self, reconnect: bool) {
        let _ = reconnect;
    }

    /// Connection dropped unexpectedly
    fn on_connection_lost(&self, reason: &str) {
        let _ = reason;
    }

    /// A queued publish could not be delivered; it is not retried
    fn on_publish_failed(&self, topic: &str, error: &Error) {
        let _ = (topic, error);
    }
}

struct Outbound {
    topic: String,
    payload: Vec<u8>,
}

/// Platform transport client
pub struct TransportClient {
    link: Arc<dyn PlatformLink>,
    options: TransportOptions,
    dispatch: DispatchTable,
    listeners: Vec<Arc<dyn ConnectionListener>>,
    subscriptions: Mutex<Vec<String>>,
    backoff: Mutex<ReconnectBackoff>,
    state: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    connected_once: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("link", &self.link.name())
            .field("identity", &self.options.identity)
            .field("state", &*self.state.borrow())
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl TransportClient {
    /// Create a client; nothing is connected until [`Self::connect`]
    #[must_use]
    pub fn new(
        link: Arc<dyn PlatformLink>,
        options: TransportOptions,
        dispatch: DispatchTable,
        listeners: Vec<Arc<dyn ConnectionListener>>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = ReconnectBackoff::new(options.backoff);

        Arc::new(Self {
            link,
            options,
            dispatch,
            listeners,
            subscriptions: Mutex::new(Vec::new()),
            backoff: Mutex::new(backoff),
            state,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            connected_once: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Identity this client authenticates as
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.options.identity
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether the connection is currently up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect, waiting up to the connect timeout
    ///
    /// Starts the downlink and publisher tasks on success. Unexpected drops
    /// afterwards are recovered in the background with backoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker refuses the connection, the connect
    /// timeout elapses, or the client was closed
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Transport("client is closed".to_string()));
        }
        if self.is_connected() {
            return Ok(());
        }

        let events = self.establish().await?;
        self.on_established().await;

        if let Some(outbound) = self.outbound_rx.lock().await.take() {
            tokio::spawn(Arc::clone(self).run_publisher(outbound));
        }
        tokio::spawn(Arc::clone(self).run_downlink(events));

        Ok(())
    }

    /// Subscribe to a topic filter, now and after every reconnect
    ///
    /// # Errors
    ///
    /// Returns an error if the link rejects the subscription while connected
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        {
            let mut subs = self.subscriptions.lock().await;
            if !subs.iter().any(|t| t == topic) {
                subs.push(topic.to_string());
            }
        }

        if self.is_connected() {
            self.link.subscribe(topic).await?;
            tracing::debug!(topic, "subscribed");
        }
        Ok(())
    }

    /// Topics re-subscribed on reconnect
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    /// Queue a publish; failures are reported to listeners, never retried
    pub fn publish(&self, topic: String, payload: Vec<u8>) {
        tracing::debug!(topic = %topic, bytes = payload.len(), "queueing publish");
        if let Err(mpsc::error::SendError(rejected)) = self.outbound_tx.send(Outbound { topic, payload }) {
            let error = Error::Transport("publisher stopped".to_string());
            self.notify_publish_failed(&rejected.topic, &error);
        }
    }

    /// Stop background tasks and disconnect
    ///
    /// # Errors
    ///
    /// Returns an error if the link fails to disconnect cleanly
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let was_connected = self.is_connected();
        self.state.send_replace(ConnectionState::Closed);

        if was_connected {
            self.link.disconnect().await?;
        }
        tracing::info!(identity = %self.options.identity, "transport closed");
        Ok(())
    }

    async fn establish(&self) -> Result<mpsc::Receiver<LinkEvent>> {
        let credentials = Credentials::derive(&self.options.identity, &self.options.auth, Utc::now())?;
        let connect = ConnectOptions {
            server_uri: self.options.server_uri.clone(),
            credentials,
            keep_alive: self.options.keep_alive,
        };

        self.state.send_replace(ConnectionState::Connecting);
        tracing::debug!(
            link = self.link.name(),
            server_uri = %self.options.server_uri,
            client_id = %connect.credentials.client_id,
            "connecting"
        );

        let result =
            match tokio::time::timeout(self.options.connect_timeout, self.link.connect(&connect)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(format!(
                    "connect timed out after {:?}",
                    self.options.connect_timeout
                ))),
            };

        if result.is_err() {
            self.state.send_replace(ConnectionState::Disconnected);
        }
        result
    }

    async fn on_established(&self) {
        self.backoff.lock().await.reset();

        // Topics recorded during the replay are picked up on the next pass;
        // the state flips under the lock so `subscribe` sees one or the other.
        let mut replayed = 0;
        loop {
            let pending = {
                let subs = self.subscriptions.lock().await;
                if subs.len() == replayed {
                    self.state.send_replace(ConnectionState::Connected);
                    break;
                }
                let pending = subs[replayed..].to_vec();
                replayed = subs.len();
                pending
            };
            for topic in pending {
                if let Err(e) = self.link.subscribe(&topic).await {
                    tracing::warn!(topic = %topic, error = %e, "failed to subscribe");
                }
            }
        }

        let reconnect = self.connected_once.swap(true, Ordering::SeqCst);
        tracing::info!(
            identity = %self.options.identity,
            server_uri = %self.options.server_uri,
            reconnect,
            "connected to platform"
        );

        for listener in &self.listeners {
            listener.on_connected(reconnect);
        }
    }

    async fn run_downlink(self: Arc<Self>, mut events: mpsc::Receiver<LinkEvent>) {
        loop {
            let reason = tokio::select! {
                () = self.shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(LinkEvent::Message { topic, payload }) => {
                        self.dispatch.dispatch(&topic, payload);
                        continue;
                    }
                    Some(LinkEvent::ConnectionLost { reason }) => reason,
                    None => "event stream closed".to_string(),
                },
            };

            if self.shutdown.is_cancelled() {
                return;
            }

            self.state.send_replace(ConnectionState::Disconnected);
            tracing::warn!(identity = %self.options.identity, reason = %reason, "platform connection lost");
            for listener in &self.listeners {
                listener.on_connection_lost(&reason);
            }

            match self.reconnect().await {
                Some(next) => events = next,
                None => return,
            }
        }
    }

    async fn reconnect(&self) -> Option<mpsc::Receiver<LinkEvent>> {
        loop {
            let (delay, attempt) = {
                let mut backoff = self.backoff.lock().await;
                let delay = backoff.next_delay();
                (delay, backoff.failures())
            };
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "reconnecting"
            );

            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(events) => {
                    self.on_established().await;
                    return Some(events);
                }
                Err(e) => tracing::warn!(attempt, error = %e, "reconnect failed"),
            }
        }
    }

    async fn run_publisher(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => return,
                next = outbound.recv() => next,
            };
            let Some(Outbound { topic, payload }) = next else {
                return;
            };

            match self.link.publish(&topic, &payload).await {
                Ok(()) => tracing::debug!(topic = %topic, "published"),
                Err(e) => self.notify_publish_failed(&topic, &e),
            }
        }
    }

    fn notify_publish_failed(&self, topic: &str, error: &Error) {
        tracing::warn!(topic, error = %error, "publish failed");
        for listener in &self.listeners {
            listener.on_publish_failed(topic, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::transport::memory::MemoryLink;
    use crate::transport::topic::{COMMANDS, device_wildcard};

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl ConnectionListener for Recorder {
        fn on_connected(&self, reconnect: bool) {
            self.events.lock().unwrap().push(format!("connected:{reconnect}"));
        }

        fn on_connection_lost(&self, reason: &str) {
            self.events.lock().unwrap().push(format!("lost:{reason}"));
        }

        fn on_publish_failed(&self, topic: &str, _error: &Error) {
            self.events.lock().unwrap().push(format!("failed:{topic}"));
        }
    }

    fn options() -> TransportOptions {
        TransportOptions::new(
            "tcp://localhost:1883",
            "gw-1",
            AuthMode::Secret {
                secret: "s3cr3t".to_string(),
            },
        )
    }

    async fn wait_for(client: &TransportClient, wanted: ConnectionState) {
        let mut rx = client.watch_state();
        while *rx.borrow_and_update() != wanted {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn connect_derives_credentials() {
        let link = Arc::new(MemoryLink::new());
        let client = TransportClient::new(link.clone(), options(), DispatchTable::default(), Vec::new());

        client.connect().await.unwrap();

        assert!(client.is_connected());
        let creds = link.last_credentials().unwrap();
        assert!(creds.client_id.starts_with("gw-1_0_0_"));
        assert!(creds.password.is_some());
    }

    #[tokio::test]
    async fn refused_connect_is_returned() {
        let link = Arc::new(MemoryLink::new());
        link.fail_next_connects(1);
        let client = TransportClient::new(link, options(), DispatchTable::default(), Vec::new());

        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn downlinks_reach_dispatch_table() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatch = DispatchTable::builder()
            .on(COMMANDS, move |d| {
                let _ = tx.send(d.request_id().map(str::to_string));
            })
            .build();
        let link = Arc::new(MemoryLink::new());
        let client = TransportClient::new(link.clone(), options(), dispatch, Vec::new());
        client.connect().await.unwrap();

        link.inject("$oc/devices/gw-1/sys/commands/request_id=5", b"{}".to_vec())
            .await;

        assert_eq!(rx.recv().await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn publish_failure_reaches_listener() {
        let recorder = Arc::new(Recorder::default());
        let link = Arc::new(MemoryLink::new());
        let client = TransportClient::new(
            link.clone(),
            options(),
            DispatchTable::default(),
            vec![recorder.clone() as Arc<dyn ConnectionListener>],
        );
        client.connect().await.unwrap();

        link.fail_next_publishes(1);
        client.publish("t/1".to_string(), b"x".to_vec());
        client.publish("t/2".to_string(), b"y".to_vec());

        assert_eq!(link.next_published().await.unwrap().topic, "t/2");
        assert!(recorder.events.lock().unwrap().contains(&"failed:t/1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_resubscribes() {
        let recorder = Arc::new(Recorder::default());
        let link = Arc::new(MemoryLink::new());
        let client = TransportClient::new(
            link.clone(),
            options(),
            DispatchTable::default(),
            vec![recorder.clone() as Arc<dyn ConnectionListener>],
        );
        client.connect().await.unwrap();
        client.subscribe(&device_wildcard("gw-1")).await.unwrap();
        client.subscribe("$oc/devices/gw-1/user/extra").await.unwrap();
        link.clear_subscriptions();

        link.fail_next_connects(2);
        link.drop_connection("broker restart").await;
        wait_for(&client, ConnectionState::Disconnected).await;
        wait_for(&client, ConnectionState::Connected).await;

        assert_eq!(link.connect_count(), 4);
        assert_eq!(
            link.subscriptions(),
            vec![device_wildcard("gw-1"), "$oc/devices/gw-1/user/extra".to_string()]
        );
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["connected:false", "lost:broker restart", "connected:true"]
        );
    }

    /// Records a new subscription on the client while it replays the list
    struct SubscribesDuringReplay {
        inner: Arc<MemoryLink>,
        client: StdMutex<Option<Arc<TransportClient>>>,
    }

    #[async_trait::async_trait]
    impl PlatformLink for SubscribesDuringReplay {
        fn name(&self) -> &'static str {
            "replay-hook"
        }

        async fn connect(&self, options: &ConnectOptions) -> Result<mpsc::Receiver<LinkEvent>> {
            self.inner.connect(options).await
        }

        async fn subscribe(&self, topic: &str) -> Result<()> {
            let client = self.client.lock().unwrap().take();
            if let Some(client) = client {
                client.subscribe("$oc/devices/gw-1/user/late").await?;
            }
            self.inner.subscribe(topic).await
        }

        async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
            self.inner.publish(topic, payload).await
        }

        async fn disconnect(&self) -> Result<()> {
            self.inner.disconnect().await
        }
    }

    #[tokio::test]
    async fn subscription_recorded_during_replay_is_sent() {
        let memory = Arc::new(MemoryLink::new());
        let link = Arc::new(SubscribesDuringReplay {
            inner: memory.clone(),
            client: StdMutex::new(None),
        });
        let client = TransportClient::new(link.clone(), options(), DispatchTable::default(), Vec::new());
        client.subscribe(&device_wildcard("gw-1")).await.unwrap();
        *link.client.lock().unwrap() = Some(Arc::clone(&client));

        client.connect().await.unwrap();

        assert!(client.is_connected());
        assert_eq!(
            memory.subscriptions(),
            vec![device_wildcard("gw-1"), "$oc/devices/gw-1/user/late".to_string()]
        );
    }

    #[tokio::test]
    async fn close_stops_the_client() {
        let link = Arc::new(MemoryLink::new());
        let client = TransportClient::new(link.clone(), options(), DispatchTable::default(), Vec::new());
        client.connect().await.unwrap();

        client.close().await.unwrap();

        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.connect().await.is_err());
        assert!(!link.is_connected());
    }
}
