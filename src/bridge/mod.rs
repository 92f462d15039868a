//! Bridge orchestrator
//!
//! Relays individually authenticated devices under one bridge identity. Each
//! device logs in on its own channel; the bridge forwards the login to the
//! platform, and once accepted binds the channel to the device id so uplinks
//! become property reports and downlinks become device commands.
//!
//! ```text
//! device ──line──▶ DeviceServer ──Message──▶ Bridge ──publish──▶ TransportClient ──▶ platform
//!    ▲                                         │  ▲                     │
//!    └──────────── DeviceChannel ◀── relay ────┘  └──── DispatchTable ◀─┘
//! ```

pub mod relay;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

pub use relay::DeviceRelay;

use crate::codec::{Codec, Delimiters, Header, MSG_FREQUENCY_LOCATION_SET, Message};
use crate::config::{Config, DuplicateLogin, Mode};
use crate::correlator::RequestCorrelator;
use crate::platform::{
    self, Command, CommandResponse, DeviceLoginRequest, DeviceMessage, EventBatch, PlatformResult,
    PropertiesReport, PropertyGet, PropertySet, ServiceProperty, ShadowGet, ShadowResponse,
};
use crate::server::DeviceHandler;
use crate::session::{ChannelId, DeviceChannel, Location, Session, SessionRegistry, SessionState};
use crate::transport::credentials::{sign_secret, timestamp};
use crate::transport::topic::{self, TopicScope};
use crate::transport::{DispatchTable, Downlink, PlatformLink, TransportClient, TransportOptions};
use crate::{Error, Result};

/// Result code for success
pub const RESULT_SUCCESS: i32 = 0;
/// Result code when the platform could not be reached or the login failed locally
pub const RESULT_FAILURE: i32 = 1;
/// Result code for a command the device cannot perform
pub const RESULT_UNSUPPORTED: i32 = 2;
/// Result code for a login refused because the key is live on another channel
pub const RESULT_DUPLICATE_LOGIN: i32 = 3;

/// Bridge behaviour
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Bridge identity in platform topics
    pub bridge_id: String,
    /// Timeout for synchronous platform calls
    pub request_timeout: Duration,
    /// Timeout for device acknowledgments
    pub ack_timeout: Duration,
    /// Duplicate-login policy
    pub duplicate_login: DuplicateLogin,
    /// Close the channel when a login fails
    pub close_on_login_failure: bool,
    /// Device frame delimiters
    pub delimiters: Delimiters,
}

impl BridgeOptions {
    /// Options with default timeouts and policies
    #[must_use]
    pub fn new(bridge_id: impl Into<String>) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            request_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(30),
            duplicate_login: DuplicateLogin::default(),
            close_on_login_failure: true,
            delimiters: Delimiters::default(),
        }
    }

    /// Options from a validated bridge-mode configuration
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is not for bridge mode
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.mode != Mode::Bridge {
            return Err(Error::Config("bridge requires bridge mode".to_string()));
        }
        let bridge_id = config
            .identity()
            .ok_or_else(|| Error::Config("bridge mode requires bridge_id".to_string()))?;

        Ok(Self {
            bridge_id: bridge_id.to_string(),
            request_timeout: config.platform.request_timeout,
            ack_timeout: config.platform.ack_timeout,
            duplicate_login: config.device.duplicate_login,
            close_on_login_failure: config.device.close_on_login_failure,
            delimiters: config.device.delimiters,
        })
    }
}

/// Outcome of binding a logged-in channel to its key
pub(crate) enum Binding {
    /// The channel now owns the session
    Bound(Arc<Session>),
    /// Another channel owns the key and the policy keeps it
    Refused(Arc<Session>),
}

/// Bind `channel` to `key` under the duplicate-login policy
pub(crate) fn bind_session(
    sessions: &SessionRegistry,
    policy: DuplicateLogin,
    key: &str,
    device_id: &str,
    channel: &DeviceChannel,
) -> Binding {
    match policy {
        DuplicateLogin::Reuse => {
            let (session, is_new) = sessions.try_create(key, device_id, channel);
            if is_new || session.channel().id() == channel.id() {
                Binding::Bound(session)
            } else {
                Binding::Refused(session)
            }
        }
        DuplicateLogin::Replace => {
            if let Some(existing) = sessions.get(key) {
                if existing.channel().id() == channel.id() {
                    return Binding::Bound(existing);
                }
            }

            let (session, previous) = sessions.replace(key, device_id, channel);
            if let Some(old) = previous {
                if old.channel().id() != channel.id() {
                    tracing::info!(
                        key,
                        old_channel = %old.channel().id(),
                        new_channel = %channel.id(),
                        "replacing session from new login"
                    );
                    old.channel().close();
                }
            }
            Binding::Bound(session)
        }
    }
}

/// Serialize and queue a publish, logging failures
pub(crate) fn publish_json<T: Serialize>(transport: &TransportClient, topic: String, body: &T) {
    match platform::to_payload(body) {
        Ok(payload) => transport.publish(topic, payload),
        Err(e) => tracing::warn!(topic = %topic, error = %e, "failed to serialize payload"),
    }
}

/// Write a login result to the device
pub(crate) fn reply_login(codec: &Codec, channel: &DeviceChannel, header: &Header, result_code: i32) {
    let reply = Message::login_response(&header.device_id, &header.flow_no, result_code);
    if let Err(e) = channel.write(codec.encode(&reply)) {
        tracing::debug!(channel = %channel.id(), error = %e, "could not deliver login result");
    }
}

struct Inner {
    options: BridgeOptions,
    sessions: SessionRegistry,
    relay: DeviceRelay,
    calls: RequestCorrelator<String, Vec<u8>>,
    pending_logins: DashMap<ChannelId, String>,
    transport: Arc<TransportClient>,
}

/// Bridge orchestrator
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("bridge_id", &self.inner.options.bridge_id)
            .field("sessions", &self.inner.sessions.len())
            .field("transport", &self.inner.transport)
            .finish()
    }
}

impl Bridge {
    /// Build a bridge around `link`; nothing connects until [`Self::start`]
    #[must_use]
    pub fn new(link: Arc<dyn PlatformLink>, transport: TransportOptions, options: BridgeOptions) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let codec = Codec::new(options.delimiters);
            Inner {
                relay: DeviceRelay::new(codec, options.ack_timeout),
                calls: RequestCorrelator::new(options.request_timeout),
                sessions: SessionRegistry::new(),
                pending_logins: DashMap::new(),
                transport: TransportClient::new(link, transport, routes(weak), Vec::new()),
                options,
            }
        });
        Self { inner }
    }

    /// Build a bridge from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or not for bridge mode
    pub fn from_config(link: Arc<dyn PlatformLink>, config: &Config) -> Result<Self> {
        config.validate()?;
        let options = BridgeOptions::from_config(config)?;
        Ok(Self::new(link, config.transport_options()?, options))
    }

    /// Subscribe to the bridge's downlinks and connect
    ///
    /// # Errors
    ///
    /// Returns error if the platform connection cannot be established
    pub async fn start(&self) -> Result<()> {
        let wildcard = topic::bridge_wildcard(&self.inner.options.bridge_id);
        self.inner.transport.subscribe(&wildcard).await?;
        self.inner.transport.connect().await
    }

    /// Disconnect from the platform and close every device channel
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to disconnect cleanly
    pub async fn close(&self) -> Result<()> {
        for key in self.inner.sessions.keys() {
            if let Some(session) = self.inner.sessions.remove(&key) {
                session.channel().close();
            }
        }
        self.inner.transport.close().await
    }

    /// Live sessions
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Platform transport
    #[must_use]
    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.inner.transport
    }

    /// Lifecycle state of a device channel
    #[must_use]
    pub fn session_state(&self, channel: ChannelId) -> SessionState {
        if self.inner.pending_logins.contains_key(&channel) {
            SessionState::LoginPending
        } else if self.inner.sessions.key_for_channel(channel).is_some() {
            SessionState::Online
        } else {
            SessionState::Disconnected
        }
    }

    /// Log a device in and wait for the platform's verdict
    ///
    /// # Errors
    ///
    /// Returns error if the call times out or the response is malformed
    pub async fn login_sync(&self, device_id: &str, secret: &str) -> Result<PlatformResult> {
        self.inner.login_sync(device_id, secret).await
    }

    /// Tell the platform a device went away; not awaited
    pub fn logout(&self, device_id: &str) {
        self.inner.logout(device_id);
    }

    /// Report service properties for a device
    pub fn report_properties(&self, device_id: &str, services: Vec<ServiceProperty>) {
        self.inner.report_properties(device_id, services);
    }

    /// Report events for a device
    pub fn report_event(&self, device_id: &str, events: &EventBatch) {
        let topic = self.inner.scope(device_id).topic(topic::EVENTS_UP);
        publish_json(&self.inner.transport, topic, events);
    }

    /// Report a free-form message for a device
    pub fn report_message(&self, device_id: &str, message: &DeviceMessage) {
        let topic = self.inner.scope(device_id).topic(topic::MESSAGES_UP);
        publish_json(&self.inner.transport, topic, message);
    }

    /// Fetch a device shadow and wait for it
    ///
    /// # Errors
    ///
    /// Returns error if the call times out or the response is malformed
    pub async fn shadow_get_sync(&self, device_id: &str, service_id: Option<&str>) -> Result<ShadowResponse> {
        let request = ShadowGet {
            object_device_id: Some(device_id.to_string()),
            service_id: service_id.map(str::to_string),
        };
        let payload = self.inner.call(device_id, topic::SHADOW_GET, &request).await?;
        platform::from_payload(&payload)
    }

    /// Answer a platform command
    pub fn respond_command(&self, device_id: &str, request_id: &str, response: &CommandResponse) {
        self.inner.respond(device_id, topic::COMMANDS_RESPONSE, request_id, response);
    }

    /// Answer a platform property query
    pub fn respond_properties_get(&self, device_id: &str, request_id: &str, report: &PropertiesReport) {
        self.inner
            .respond(device_id, topic::PROPERTIES_GET_RESPONSE, request_id, report);
    }

    /// Answer a platform property update
    pub fn respond_properties_set(&self, device_id: &str, request_id: &str, result: &PlatformResult) {
        self.inner
            .respond(device_id, topic::PROPERTIES_SET_RESPONSE, request_id, result);
    }
}

/// Downlink routes; responses to our own uplinks are listed before the
/// request prefixes they share
fn routes(weak: &Weak<Inner>) -> DispatchTable {
    DispatchTable::builder()
        .on(topic::LOGIN_RESPONSE, route(weak, Inner::on_call_response))
        .on(topic::LOGOUT_RESPONSE, log_logout_response)
        .on(topic::SHADOW_GET_RESPONSE, route(weak, Inner::on_call_response))
        .on(topic::COMMANDS_RESPONSE, ignore_echo)
        .on(topic::PROPERTIES_SET_RESPONSE, ignore_echo)
        .on(topic::PROPERTIES_GET_RESPONSE, ignore_echo)
        .on(topic::COMMANDS, route(weak, Inner::on_command))
        .on(topic::PROPERTIES_SET, route(weak, Inner::on_properties_set))
        .on(topic::PROPERTIES_GET, route(weak, Inner::on_properties_get))
        .on(topic::MESSAGES_DOWN, log_message_down)
        .on(topic::EVENTS_DOWN, log_event_down)
        .on(topic::DISCONNECT, route(weak, Inner::on_disconnect))
        .build()
}

fn route(weak: &Weak<Inner>, handler: fn(&Arc<Inner>, Downlink)) -> impl Fn(Downlink) + Send + Sync + 'static {
    let weak = weak.clone();
    move |downlink| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, downlink);
        }
    }
}

pub(crate) fn ignore_echo(downlink: Downlink) {
    tracing::trace!(topic = %downlink.topic, "ignoring echoed uplink");
}

pub(crate) fn log_logout_response(downlink: Downlink) {
    match platform::from_payload::<PlatformResult>(&downlink.payload) {
        Ok(result) if result.is_success() => {
            tracing::debug!(device_id = %downlink.topic.device_id, "logout acknowledged");
        }
        Ok(result) => tracing::warn!(
            device_id = %downlink.topic.device_id,
            result_code = result.result_code,
            "platform rejected logout"
        ),
        Err(e) => tracing::warn!(error = %e, "malformed logout response"),
    }
}

pub(crate) fn log_message_down(downlink: Downlink) {
    tracing::info!(
        device_id = %downlink.topic.device_id,
        bytes = downlink.payload.len(),
        "platform message for device, no device-side counterpart"
    );
}

pub(crate) fn log_event_down(downlink: Downlink) {
    match platform::from_payload::<EventBatch>(&downlink.payload) {
        Ok(events) => {
            for event in events.services {
                tracing::info!(
                    device_id = %downlink.topic.device_id,
                    service_id = %event.service_id,
                    event_type = %event.event_type,
                    "platform event for device, no device-side counterpart"
                );
            }
        }
        Err(e) => tracing::warn!(device_id = %downlink.topic.device_id, error = %e, "malformed event"),
    }
}

impl Inner {
    fn scope(&self, device_id: &str) -> TopicScope {
        TopicScope::bridged(&self.options.bridge_id, device_id)
    }

    fn codec(&self) -> &Codec {
        self.relay.codec()
    }

    async fn call<T: Serialize>(&self, device_id: &str, suffix: &str, body: &T) -> Result<Vec<u8>> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let payload = platform::to_payload(body)?;
        let handle = self.calls.register(request_id.clone())?;

        self.transport
            .publish(self.scope(device_id).request(suffix, &request_id), payload);
        Ok(self.calls.await_sync(handle).await?)
    }

    async fn login_sync(&self, device_id: &str, secret: &str) -> Result<PlatformResult> {
        let stamp = timestamp(Utc::now());
        let request = DeviceLoginRequest {
            password: sign_secret(secret, &stamp)?,
            timestamp: stamp,
        };
        let payload = self.call(device_id, topic::LOGIN, &request).await?;
        platform::from_payload(&payload)
    }

    fn logout(&self, device_id: &str) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let topic = self.scope(device_id).request(topic::LOGOUT, &request_id);
        publish_json(&self.transport, topic, &serde_json::json!({}));
        tracing::info!(device_id, "device logged out");
    }

    fn report_properties(&self, device_id: &str, services: Vec<ServiceProperty>) {
        let topic = self.scope(device_id).topic(topic::PROPERTIES_REPORT);
        publish_json(&self.transport, topic, &PropertiesReport { services });
    }

    fn respond<T: Serialize>(&self, device_id: &str, suffix: &str, request_id: &str, body: &T) {
        let topic = self.scope(device_id).request(suffix, request_id);
        publish_json(&self.transport, topic, body);
    }

    async fn handle_login(&self, channel: &DeviceChannel, header: Header, secret: String) {
        let device_id = header.device_id.clone();

        if let Some(bound) = self.sessions.key_for_channel(channel.id()) {
            if bound != device_id {
                tracing::warn!(
                    channel = %channel.id(),
                    bound = %bound,
                    device_id = %device_id,
                    "channel already logged in as another device, refusing"
                );
                reply_login(self.codec(), channel, &header, RESULT_FAILURE);
                return;
            }
        }

        if let Some(existing) = self.sessions.get(&device_id) {
            if existing.channel().id() == channel.id() {
                tracing::debug!(device_id = %device_id, "repeated login on the same channel");
                reply_login(self.codec(), channel, &header, RESULT_SUCCESS);
                return;
            }
            if self.options.duplicate_login == DuplicateLogin::Reuse {
                self.refuse_duplicate(channel, &header, &existing);
                return;
            }
        }

        if self.pending_logins.insert(channel.id(), device_id.clone()).is_some() {
            tracing::warn!(channel = %channel.id(), device_id = %device_id, "login already in progress");
            return;
        }
        let result = self.login_sync(&device_id, &secret).await;
        self.pending_logins.remove(&channel.id());

        let result_code = match result {
            Ok(result) => result.result_code,
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "device login failed");
                RESULT_FAILURE
            }
        };

        if result_code != RESULT_SUCCESS {
            tracing::warn!(device_id = %device_id, result_code, "platform rejected device login");
            reply_login(self.codec(), channel, &header, result_code);
            if self.options.close_on_login_failure {
                channel.close();
            }
            return;
        }

        if channel.is_closed() {
            tracing::info!(device_id = %device_id, "channel closed during login");
            self.logout(&device_id);
            return;
        }

        match bind_session(
            &self.sessions,
            self.options.duplicate_login,
            &device_id,
            &device_id,
            channel,
        ) {
            Binding::Bound(_) => {
                tracing::info!(device_id = %device_id, channel = %channel.id(), peer = %channel.peer(), "device logged in");
                reply_login(self.codec(), channel, &header, RESULT_SUCCESS);
            }
            Binding::Refused(existing) => self.refuse_duplicate(channel, &header, &existing),
        }
    }

    fn refuse_duplicate(&self, channel: &DeviceChannel, header: &Header, existing: &Session) {
        tracing::warn!(
            device_id = %header.device_id,
            channel = %channel.id(),
            live_channel = %existing.channel().id(),
            "device already online on another channel, refusing login"
        );
        reply_login(self.codec(), channel, header, RESULT_DUPLICATE_LOGIN);
        if self.options.close_on_login_failure {
            channel.close();
        }
    }

    /// Session bound to `channel`, if the header names the device it logged in as
    fn online_session(&self, channel: &DeviceChannel, header: &Header) -> Option<Arc<Session>> {
        let Some(key) = self.sessions.key_for_channel(channel.id()) else {
            tracing::warn!(
                channel = %channel.id(),
                msg_type = %header.msg_type,
                "message before login, dropping"
            );
            return None;
        };
        if key != header.device_id {
            tracing::warn!(
                channel = %channel.id(),
                bound = %key,
                device_id = %header.device_id,
                "device id does not match login, dropping"
            );
            return None;
        }
        self.sessions.get(&key)
    }

    fn handle_location(&self, channel: &DeviceChannel, header: &Header, longitude: String, latitude: String) {
        let Some(session) = self.online_session(channel, header) else {
            return;
        };

        tracing::debug!(device_id = %session.device_id(), %longitude, %latitude, "location report");
        self.report_properties(
            session.device_id(),
            vec![ServiceProperty::location(&longitude, &latitude)],
        );
        session.set_location(Location { longitude, latitude });
    }

    fn handle_ack(&self, channel: &DeviceChannel, header: &Header, result_code: i32) {
        if header.msg_type != MSG_FREQUENCY_LOCATION_SET {
            tracing::warn!(msg_type = %header.msg_type, "unexpected acknowledgment type, dropping");
            return;
        }
        let Some(session) = self.online_session(channel, header) else {
            return;
        };
        self.relay
            .on_device_ack(session.key(), &header.flow_no, result_code);
    }

    fn on_call_response(self: &Arc<Self>, downlink: Downlink) {
        let Some(request_id) = downlink.request_id() else {
            tracing::warn!(topic = %downlink.topic, "response without request id, dropping");
            return;
        };
        self.calls.complete(&request_id.to_string(), downlink.payload);
    }

    fn on_command(self: &Arc<Self>, downlink: Downlink) {
        let device_id = downlink.topic.device_id.clone();
        let Some(request_id) = downlink.request_id().map(str::to_string) else {
            tracing::warn!(device_id = %device_id, "command without request id, dropping");
            return;
        };
        let command: Command = match platform::from_payload(&downlink.payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "malformed command, dropping");
                return;
            }
        };
        let Some(session) = self.sessions.get(&device_id) else {
            tracing::warn!(
                device_id = %device_id,
                command = %command.command_name,
                "device is offline, dropping command"
            );
            return;
        };

        let period = command
            .period()
            .filter(|_| command.command_name.eq_ignore_ascii_case(MSG_FREQUENCY_LOCATION_SET));
        let Some(period) = period else {
            tracing::warn!(device_id = %device_id, command = %command.command_name, "unsupported command");
            let mut response = CommandResponse::new(RESULT_UNSUPPORTED);
            response.response_name = Some(command.command_name);
            self.respond(&device_id, topic::COMMANDS_RESPONSE, &request_id, &response);
            return;
        };

        let transport = Arc::clone(&self.transport);
        let topic = self.scope(&device_id).request(topic::COMMANDS_RESPONSE, &request_id);
        let relayed = self.relay.send_frequency(&session, period, move |ack| match ack {
            Ok(code) => publish_json(&transport, topic, &CommandResponse::new(code)),
            Err(e) => tracing::warn!(topic = %topic, error = %e, "device did not acknowledge command"),
        });

        if let Err(e) = relayed {
            tracing::warn!(device_id = %device_id, error = %e, "failed to relay command");
            self.respond(
                &device_id,
                topic::COMMANDS_RESPONSE,
                &request_id,
                &CommandResponse::new(RESULT_FAILURE),
            );
        }
    }

    fn on_properties_set(self: &Arc<Self>, downlink: Downlink) {
        let device_id = downlink.topic.device_id.clone();
        let Some(request_id) = downlink.request_id().map(str::to_string) else {
            tracing::warn!(device_id = %device_id, "property set without request id, dropping");
            return;
        };
        let request: PropertySet = match platform::from_payload(&downlink.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "malformed property set, dropping");
                return;
            }
        };
        let Some(session) = self.sessions.get(&device_id) else {
            tracing::warn!(device_id = %device_id, "device is offline, dropping property set");
            return;
        };

        let Some(period) = request.period() else {
            let result = PlatformResult::with_code(RESULT_UNSUPPORTED, "unsupported property");
            self.respond(&device_id, topic::PROPERTIES_SET_RESPONSE, &request_id, &result);
            return;
        };

        let transport = Arc::clone(&self.transport);
        let topic = self
            .scope(&device_id)
            .request(topic::PROPERTIES_SET_RESPONSE, &request_id);
        let relayed = self.relay.send_frequency(&session, period, move |ack| match ack {
            Ok(code) => {
                let desc = if code == RESULT_SUCCESS { "success" } else { "device rejected" };
                publish_json(&transport, topic, &PlatformResult::with_code(code, desc));
            }
            Err(e) => tracing::warn!(topic = %topic, error = %e, "device did not acknowledge property set"),
        });

        if let Err(e) = relayed {
            tracing::warn!(device_id = %device_id, error = %e, "failed to relay property set");
            let result = PlatformResult::with_code(RESULT_FAILURE, "device unreachable");
            self.respond(&device_id, topic::PROPERTIES_SET_RESPONSE, &request_id, &result);
        }
    }

    fn on_properties_get(self: &Arc<Self>, downlink: Downlink) {
        let device_id = downlink.topic.device_id.clone();
        let Some(request_id) = downlink.request_id() else {
            tracing::warn!(device_id = %device_id, "property get without request id, dropping");
            return;
        };
        let query: PropertyGet = match platform::from_payload(&downlink.payload) {
            Ok(query) => query,
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "malformed property get, dropping");
                return;
            }
        };
        let Some(session) = self.sessions.get(&device_id) else {
            tracing::warn!(device_id = %device_id, "device is offline, dropping property get");
            return;
        };

        let wants_location = query
            .service_id
            .as_deref()
            .is_none_or(|s| s == platform::LOCATION_SERVICE_ID);
        let services = session
            .location()
            .filter(|_| wants_location)
            .map(|l| vec![ServiceProperty::location(&l.longitude, &l.latitude)])
            .unwrap_or_default();

        self.respond(
            &device_id,
            topic::PROPERTIES_GET_RESPONSE,
            request_id,
            &PropertiesReport { services },
        );
    }

    fn on_disconnect(self: &Arc<Self>, downlink: Downlink) {
        let device_id = &downlink.topic.device_id;
        match self.sessions.remove(device_id) {
            Some(session) => {
                tracing::info!(device_id = %device_id, channel = %session.channel().id(), "platform disconnected device");
                session.channel().close();
            }
            None => tracing::debug!(device_id = %device_id, "disconnect for unknown device"),
        }
    }
}

#[async_trait]
impl DeviceHandler for Bridge {
    fn codec(&self) -> &Codec {
        self.inner.codec()
    }

    async fn on_message(&self, channel: &DeviceChannel, message: Message) {
        match message {
            Message::Login { header, secret } => self.inner.handle_login(channel, header, secret).await,
            Message::LocationReport {
                header,
                longitude,
                latitude,
            } => self.inner.handle_location(channel, &header, longitude, latitude),
            Message::CommandResponse { header, result_code } => {
                self.inner.handle_ack(channel, &header, result_code);
            }
            Message::FrequencySet { header, .. } => tracing::warn!(
                device_id = %header.device_id,
                "device sent a downlink-only message, dropping"
            ),
        }
    }

    async fn on_channel_closed(&self, channel: &DeviceChannel) {
        self.inner.pending_logins.remove(&channel.id());
        if let Some(session) = self.inner.sessions.remove_by_channel(channel.id()) {
            tracing::info!(device_id = %session.device_id(), channel = %channel.id(), "device channel closed");
            self.inner.logout(session.device_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_refuses_second_channel() {
        let sessions = SessionRegistry::new();
        let (first, _rx1) = DeviceChannel::new("a");
        let (second, _rx2) = DeviceChannel::new("b");

        assert!(matches!(
            bind_session(&sessions, DuplicateLogin::Reuse, "dev1", "dev1", &first),
            Binding::Bound(_)
        ));
        assert!(matches!(
            bind_session(&sessions, DuplicateLogin::Reuse, "dev1", "dev1", &first),
            Binding::Bound(_)
        ));
        assert!(matches!(
            bind_session(&sessions, DuplicateLogin::Reuse, "dev1", "dev1", &second),
            Binding::Refused(_)
        ));
        assert_eq!(sessions.get("dev1").unwrap().channel().id(), first.id());
    }

    #[tokio::test]
    async fn replace_closes_previous_channel() {
        let sessions = SessionRegistry::new();
        let (first, mut rx1) = DeviceChannel::new("a");
        let (second, _rx2) = DeviceChannel::new("b");

        bind_session(&sessions, DuplicateLogin::Replace, "dev1", "dev1", &first);
        let Binding::Bound(session) =
            bind_session(&sessions, DuplicateLogin::Replace, "dev1", "dev1", &second)
        else {
            panic!("replace must bind");
        };

        assert_eq!(session.channel().id(), second.id());
        assert_eq!(rx1.recv().await, Some(crate::session::ChannelCommand::Close));
        assert!(sessions.remove_by_channel(first.id()).is_none());
    }

    #[test]
    fn options_require_bridge_mode() {
        let config = Config {
            mode: Mode::Gateway,
            ..Config::default()
        };
        assert!(BridgeOptions::from_config(&config).is_err());
    }
}
