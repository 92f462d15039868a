//! Gateway orchestrator
//!
//! Represents a fixed set of sub-devices under one gateway device. Sub-devices
//! log in with their node id, which must be known to the [`SubDeviceStore`];
//! there is no per-device authentication. All platform traffic uses the
//! gateway's own topics, with the target sub-device named in the payload.
//!
//! The platform owns the sub-device list. It pushes additions and deletions
//! as `$sub_device_manager` events, and the gateway asks for anything it
//! missed with a sync request carrying its stored version on every connect.

pub mod store;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};

pub use store::{MemorySubDeviceStore, SubDeviceRecord, SubDeviceStore};

use crate::bridge::{
    Binding, DeviceRelay, RESULT_DUPLICATE_LOGIN, RESULT_FAILURE, RESULT_SUCCESS, RESULT_UNSUPPORTED,
    bind_session, ignore_echo, log_message_down, publish_json, reply_login,
};
use crate::codec::{Codec, Delimiters, Header, MSG_FREQUENCY_LOCATION_SET, Message};
use crate::config::{Config, DuplicateLogin, Mode};
use crate::platform::{
    self, Command, CommandResponse, DeviceProperties, DeviceStatus, DeviceStatuses, EventBatch,
    PlatformResult, PropertiesReport, PropertyGet, PropertySet, ServiceEvent, ServiceProperty,
    SubDevicesParas, SubDevicesPropertiesReport,
};
use crate::server::DeviceHandler;
use crate::session::{ChannelId, DeviceChannel, Location, Session, SessionRegistry, SessionState};
use crate::transport::topic::{self, TopicScope};
use crate::transport::{
    ConnectionListener, DispatchTable, Downlink, PlatformLink, TransportClient, TransportOptions,
};
use crate::{Error, Result};

/// Gateway behaviour
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Gateway device id in platform topics
    pub gateway_id: String,
    /// Timeout for device acknowledgments
    pub ack_timeout: Duration,
    /// Duplicate-login policy
    pub duplicate_login: DuplicateLogin,
    /// Close the channel when a login is refused
    pub close_on_login_failure: bool,
    /// Device frame delimiters
    pub delimiters: Delimiters,
}

impl GatewayOptions {
    /// Options with default timeouts and policies
    #[must_use]
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            ack_timeout: Duration::from_secs(30),
            duplicate_login: DuplicateLogin::default(),
            close_on_login_failure: true,
            delimiters: Delimiters::default(),
        }
    }

    /// Options from a validated gateway-mode configuration
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is not for gateway mode
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.mode != Mode::Gateway {
            return Err(Error::Config("gateway requires gateway mode".to_string()));
        }
        let gateway_id = config
            .identity()
            .ok_or_else(|| Error::Config("gateway mode requires device_id".to_string()))?;

        Ok(Self {
            gateway_id: gateway_id.to_string(),
            ack_timeout: config.platform.ack_timeout,
            duplicate_login: config.device.duplicate_login,
            close_on_login_failure: config.device.close_on_login_failure,
            delimiters: config.device.delimiters,
        })
    }
}

struct Inner {
    options: GatewayOptions,
    sessions: SessionRegistry,
    relay: DeviceRelay,
    store: Arc<dyn SubDeviceStore>,
    /// platform device id -> node id of live sessions
    devices: DashMap<String, String>,
    /// `$sub_device_manager` events, applied one at a time in delivery order
    events_tx: mpsc::UnboundedSender<ServiceEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceEvent>>>,
    transport: Arc<TransportClient>,
}

/// Gateway orchestrator
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("gateway_id", &self.inner.options.gateway_id)
            .field("sessions", &self.inner.sessions.len())
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

/// Issues the sub-device sync request whenever the platform connection comes up
struct SyncOnConnect(Weak<Inner>);

impl ConnectionListener for SyncOnConnect {
    fn on_connected(&self, reconnect: bool) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = inner.request_sync().await {
                tracing::warn!(error = %e, "failed to request sub-device sync");
            }
            if reconnect {
                inner.report_live_sessions_online();
            }
        });
    }

    fn on_publish_failed(&self, topic: &str, error: &Error) {
        tracing::debug!(topic, error = %error, "gateway uplink lost");
    }
}

impl Gateway {
    /// Build a gateway around `link`; nothing connects until [`Self::start`]
    #[must_use]
    pub fn new(
        link: Arc<dyn PlatformLink>,
        transport: TransportOptions,
        options: GatewayOptions,
        store: Arc<dyn SubDeviceStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let listener: Arc<dyn ConnectionListener> = Arc::new(SyncOnConnect(weak.clone()));
            Inner {
                relay: DeviceRelay::new(Codec::new(options.delimiters), options.ack_timeout),
                sessions: SessionRegistry::new(),
                store,
                devices: DashMap::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                transport: TransportClient::new(link, transport, routes(weak), vec![listener]),
                options,
            }
        });
        Self { inner }
    }

    /// Build a gateway from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or not for gateway mode
    pub fn from_config(
        link: Arc<dyn PlatformLink>,
        config: &Config,
        store: Arc<dyn SubDeviceStore>,
    ) -> Result<Self> {
        config.validate()?;
        let options = GatewayOptions::from_config(config)?;
        Ok(Self::new(link, config.transport_options()?, options, store))
    }

    /// Subscribe to the gateway's downlinks and connect
    ///
    /// # Errors
    ///
    /// Returns error if the platform connection cannot be established
    pub async fn start(&self) -> Result<()> {
        if let Some(events) = self.inner.events_rx.lock().await.take() {
            tokio::spawn(run_sub_device_events(Arc::downgrade(&self.inner), events));
        }
        let wildcard = topic::device_wildcard(&self.inner.options.gateway_id);
        self.inner.transport.subscribe(&wildcard).await?;
        self.inner.transport.connect().await
    }

    /// Disconnect from the platform and close every sub-device channel
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to disconnect cleanly
    pub async fn close(&self) -> Result<()> {
        for key in self.inner.sessions.keys() {
            if let Some(session) = self.inner.sessions.remove(&key) {
                self.inner.devices.remove(session.device_id());
                session.channel().close();
            }
        }
        self.inner.transport.close().await
    }

    /// Live sub-device sessions, keyed by node id
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Sub-device store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SubDeviceStore> {
        &self.inner.store
    }

    /// Platform transport
    #[must_use]
    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.inner.transport
    }

    /// Lifecycle state of a device channel
    #[must_use]
    pub fn session_state(&self, channel: ChannelId) -> SessionState {
        if self.inner.sessions.key_for_channel(channel).is_some() {
            SessionState::Online
        } else {
            SessionState::Disconnected
        }
    }

    /// Ask the platform to resend sub-device changes since the stored version
    ///
    /// # Errors
    ///
    /// Returns error if the stored version cannot be read
    pub async fn request_sync(&self) -> Result<()> {
        self.inner.request_sync().await
    }

    /// Report sub-device online state
    pub fn update_sub_device_status(&self, statuses: Vec<DeviceStatus>) {
        self.inner.update_status(statuses);
    }

    /// Report properties for several sub-devices at once
    pub fn report_sub_device_properties(&self, devices: Vec<DeviceProperties>) {
        self.inner.report_sub_device_properties(devices);
    }

    /// Answer a platform command
    pub fn respond_command(&self, request_id: &str, response: &CommandResponse) {
        self.inner.respond(topic::COMMANDS_RESPONSE, request_id, response);
    }

    /// Answer a platform property query
    pub fn respond_properties_get(&self, request_id: &str, report: &PropertiesReport) {
        self.inner
            .respond(topic::PROPERTIES_GET_RESPONSE, request_id, report);
    }

    /// Answer a platform property update
    pub fn respond_properties_set(&self, request_id: &str, result: &PlatformResult) {
        self.inner
            .respond(topic::PROPERTIES_SET_RESPONSE, request_id, result);
    }
}

fn routes(weak: &Weak<Inner>) -> DispatchTable {
    DispatchTable::builder()
        .on(topic::COMMANDS_RESPONSE, ignore_echo)
        .on(topic::PROPERTIES_SET_RESPONSE, ignore_echo)
        .on(topic::PROPERTIES_GET_RESPONSE, ignore_echo)
        .on(topic::COMMANDS, route(weak, Inner::on_command))
        .on(topic::PROPERTIES_SET, route(weak, Inner::on_properties_set))
        .on(topic::PROPERTIES_GET, route(weak, Inner::on_properties_get))
        .on(topic::EVENTS_DOWN, route(weak, Inner::on_event_down))
        .on(topic::MESSAGES_DOWN, log_message_down)
        .build()
}

async fn run_sub_device_events(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ServiceEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.apply_sub_device_event(event).await;
    }
    tracing::debug!("sub-device event worker stopped");
}

fn route(weak: &Weak<Inner>, handler: fn(&Arc<Inner>, Downlink)) -> impl Fn(Downlink) + Send + Sync + 'static {
    let weak = weak.clone();
    move |downlink| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, downlink);
        }
    }
}

impl Inner {
    fn scope(&self) -> TopicScope {
        TopicScope::device(&self.options.gateway_id)
    }

    fn codec(&self) -> &Codec {
        self.relay.codec()
    }

    fn respond<T: Serialize>(&self, suffix: &str, request_id: &str, body: &T) {
        publish_json(&self.transport, self.scope().request(suffix, request_id), body);
    }

    async fn request_sync(&self) -> Result<()> {
        let version = self.store.get_version().await?;
        let events = EventBatch {
            object_device_id: Some(self.options.gateway_id.clone()),
            services: vec![ServiceEvent::sub_device_manager(
                platform::EVENT_SYNC_REQUEST,
                json!({ "version": version }),
            )],
        };
        publish_json(&self.transport, self.scope().topic(topic::EVENTS_UP), &events);
        tracing::info!(version, "requested sub-device sync");
        Ok(())
    }

    fn update_status(&self, device_statuses: Vec<DeviceStatus>) {
        let paras = match serde_json::to_value(DeviceStatuses { device_statuses }) {
            Ok(paras) => paras,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize sub-device status");
                return;
            }
        };
        let events = EventBatch {
            object_device_id: Some(self.options.gateway_id.clone()),
            services: vec![ServiceEvent::sub_device_manager(
                platform::EVENT_UPDATE_STATUS,
                paras,
            )],
        };
        publish_json(&self.transport, self.scope().topic(topic::EVENTS_UP), &events);
    }

    fn report_live_sessions_online(&self) {
        let statuses: Vec<DeviceStatus> = self
            .sessions
            .keys()
            .iter()
            .filter_map(|key| self.sessions.get(key))
            .map(|s| DeviceStatus::online(s.device_id()))
            .collect();
        if !statuses.is_empty() {
            tracing::info!(count = statuses.len(), "re-reporting live sub-devices online");
            self.update_status(statuses);
        }
    }

    fn report_sub_device_properties(&self, devices: Vec<DeviceProperties>) {
        let topic = self.scope().topic(topic::SUB_DEVICES_PROPERTIES_REPORT);
        publish_json(&self.transport, topic, &SubDevicesPropertiesReport { devices });
    }

    async fn handle_login(&self, channel: &DeviceChannel, header: Header) {
        let node_id = header.device_id.clone();

        if let Some(bound) = self.sessions.key_for_channel(channel.id()) {
            if bound != node_id {
                tracing::warn!(
                    channel = %channel.id(),
                    bound = %bound,
                    node_id = %node_id,
                    "channel already logged in as another sub-device, refusing"
                );
                reply_login(self.codec(), channel, &header, RESULT_FAILURE);
                return;
            }
        }

        let record = match self.store.get_sub_device(&node_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(node_id = %node_id, channel = %channel.id(), "unknown sub-device, closing channel");
                reply_login(self.codec(), channel, &header, RESULT_FAILURE);
                channel.close();
                return;
            }
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "sub-device lookup failed");
                reply_login(self.codec(), channel, &header, RESULT_FAILURE);
                if self.options.close_on_login_failure {
                    channel.close();
                }
                return;
            }
        };

        match bind_session(
            &self.sessions,
            self.options.duplicate_login,
            &node_id,
            &record.device_id,
            channel,
        ) {
            Binding::Bound(session) => {
                self.devices
                    .insert(record.device_id.clone(), node_id.clone());
                tracing::info!(
                    node_id = %node_id,
                    device_id = %session.device_id(),
                    channel = %channel.id(),
                    "sub-device logged in"
                );
                reply_login(self.codec(), channel, &header, RESULT_SUCCESS);
                self.update_status(vec![DeviceStatus::online(&record.device_id)]);
            }
            Binding::Refused(existing) => {
                tracing::warn!(
                    node_id = %node_id,
                    channel = %channel.id(),
                    live_channel = %existing.channel().id(),
                    "sub-device already online on another channel, refusing login"
                );
                reply_login(self.codec(), channel, &header, RESULT_DUPLICATE_LOGIN);
                if self.options.close_on_login_failure {
                    channel.close();
                }
            }
        }
    }

    fn online_session(&self, channel: &DeviceChannel, header: &Header) -> Option<Arc<Session>> {
        let Some(key) = self.sessions.key_for_channel(channel.id()) else {
            tracing::warn!(channel = %channel.id(), msg_type = %header.msg_type, "message before login, dropping");
            return None;
        };
        if key != header.device_id {
            tracing::warn!(
                channel = %channel.id(),
                bound = %key,
                node_id = %header.device_id,
                "node id does not match login, dropping"
            );
            return None;
        }
        self.sessions.get(&key)
    }

    fn handle_location(&self, channel: &DeviceChannel, header: &Header, longitude: String, latitude: String) {
        let Some(session) = self.online_session(channel, header) else {
            return;
        };

        self.report_sub_device_properties(vec![DeviceProperties {
            device_id: session.device_id().to_string(),
            services: vec![ServiceProperty::location(&longitude, &latitude)],
        }]);
        session.set_location(Location { longitude, latitude });
    }

    fn handle_ack(&self, channel: &DeviceChannel, header: &Header, result_code: i32) {
        if header.msg_type != MSG_FREQUENCY_LOCATION_SET {
            tracing::warn!(msg_type = %header.msg_type, "unexpected acknowledgment type, dropping");
            return;
        }
        if let Some(session) = self.online_session(channel, header) {
            self.relay
                .on_device_ack(session.key(), &header.flow_no, result_code);
        }
    }

    /// Live session of the sub-device a downlink addresses
    fn target(&self, object_device_id: Option<&str>) -> Option<Arc<Session>> {
        let device_id = object_device_id?;
        let node_id = self.devices.get(device_id)?.value().clone();
        self.sessions.get(&node_id)
    }

    fn on_command(self: &Arc<Self>, downlink: Downlink) {
        let Some(request_id) = downlink.request_id().map(str::to_string) else {
            tracing::warn!("command without request id, dropping");
            return;
        };
        let command: Command = match platform::from_payload(&downlink.payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "malformed command, dropping");
                return;
            }
        };

        let addressed = command.object_device_id.as_deref();
        if addressed.is_none_or(|id| id == self.options.gateway_id) {
            tracing::warn!(command = %command.command_name, "gateway has no commands of its own");
            self.respond(
                topic::COMMANDS_RESPONSE,
                &request_id,
                &CommandResponse::new(RESULT_UNSUPPORTED),
            );
            return;
        }
        let Some(session) = self.target(addressed) else {
            tracing::warn!(
                device_id = ?addressed,
                command = %command.command_name,
                "sub-device is offline, dropping command"
            );
            return;
        };

        let period = command
            .period()
            .filter(|_| command.command_name.eq_ignore_ascii_case(MSG_FREQUENCY_LOCATION_SET));
        let Some(period) = period else {
            tracing::warn!(device_id = %session.device_id(), command = %command.command_name, "unsupported command");
            self.respond(
                topic::COMMANDS_RESPONSE,
                &request_id,
                &CommandResponse::new(RESULT_UNSUPPORTED),
            );
            return;
        };

        let transport = Arc::clone(&self.transport);
        let topic = self.scope().request(topic::COMMANDS_RESPONSE, &request_id);
        let relayed = self.relay.send_frequency(&session, period, move |ack| match ack {
            Ok(code) => publish_json(&transport, topic, &CommandResponse::new(code)),
            Err(e) => tracing::warn!(topic = %topic, error = %e, "sub-device did not acknowledge command"),
        });
        if let Err(e) = relayed {
            tracing::warn!(device_id = %session.device_id(), error = %e, "failed to relay command");
            self.respond(
                topic::COMMANDS_RESPONSE,
                &request_id,
                &CommandResponse::new(RESULT_FAILURE),
            );
        }
    }

    fn on_properties_set(self: &Arc<Self>, downlink: Downlink) {
        let Some(request_id) = downlink.request_id().map(str::to_string) else {
            tracing::warn!("property set without request id, dropping");
            return;
        };
        let request: PropertySet = match platform::from_payload(&downlink.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed property set, dropping");
                return;
            }
        };
        let Some(session) = self.target(request.object_device_id.as_deref()) else {
            tracing::warn!(device_id = ?request.object_device_id, "sub-device is offline, dropping property set");
            return;
        };
        let Some(period) = request.period() else {
            let result = PlatformResult::with_code(RESULT_UNSUPPORTED, "unsupported property");
            self.respond(topic::PROPERTIES_SET_RESPONSE, &request_id, &result);
            return;
        };

        let transport = Arc::clone(&self.transport);
        let topic = self
            .scope()
            .request(topic::PROPERTIES_SET_RESPONSE, &request_id);
        let relayed = self.relay.send_frequency(&session, period, move |ack| match ack {
            Ok(code) => {
                let desc = if code == RESULT_SUCCESS { "success" } else { "device rejected" };
                publish_json(&transport, topic, &PlatformResult::with_code(code, desc));
            }
            Err(e) => tracing::warn!(topic = %topic, error = %e, "sub-device did not acknowledge property set"),
        });
        if let Err(e) = relayed {
            tracing::warn!(device_id = %session.device_id(), error = %e, "failed to relay property set");
            let result = PlatformResult::with_code(RESULT_FAILURE, "device unreachable");
            self.respond(topic::PROPERTIES_SET_RESPONSE, &request_id, &result);
        }
    }

    fn on_properties_get(self: &Arc<Self>, downlink: Downlink) {
        let Some(request_id) = downlink.request_id() else {
            tracing::warn!("property get without request id, dropping");
            return;
        };
        let query: PropertyGet = match platform::from_payload(&downlink.payload) {
            Ok(query) => query,
            Err(e) => {
                tracing::warn!(error = %e, "malformed property get, dropping");
                return;
            }
        };
        let Some(session) = self.target(query.object_device_id.as_deref()) else {
            tracing::warn!(device_id = ?query.object_device_id, "sub-device is offline, dropping property get");
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
            topic::PROPERTIES_GET_RESPONSE,
            request_id,
            &PropertiesReport { services },
        );
    }

    fn on_event_down(self: &Arc<Self>, downlink: Downlink) {
        let events: EventBatch = match platform::from_payload(&downlink.payload) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "malformed event, dropping");
                return;
            }
        };

        let (managed, other): (Vec<_>, Vec<_>) = events
            .services
            .into_iter()
            .partition(|e| e.service_id == platform::SUB_DEVICE_MANAGER);
        for event in other {
            tracing::info!(service_id = %event.service_id, event_type = %event.event_type, "platform event for gateway");
        }
        for event in managed {
            if self.events_tx.send(event).is_err() {
                tracing::warn!("sub-device event worker is gone, dropping event");
                return;
            }
        }
    }

    async fn apply_sub_device_event(&self, event: ServiceEvent) {
        let paras: SubDevicesParas = match serde_json::from_value(event.paras) {
            Ok(paras) => paras,
            Err(e) => {
                tracing::warn!(event_type = %event.event_type, error = %e, "malformed sub-device event");
                return;
            }
        };
        let records: Vec<SubDeviceRecord> = paras
            .devices
            .into_iter()
            .map(|d| SubDeviceRecord {
                node_id: d.node_id,
                device_id: d.device_id,
                product_id: d.product_id,
                version: paras.version,
            })
            .collect();

        match event.event_type.as_str() {
            platform::EVENT_ADD_SUB_DEVICE => {
                match self.store.add_sub_devices(&records, paras.version).await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!(version = paras.version, "stale sub-device add ignored"),
                    Err(e) => tracing::warn!(error = %e, "failed to store added sub-devices"),
                }
            }
            platform::EVENT_DELETE_SUB_DEVICE => {
                match self.store.delete_sub_devices(&records, paras.version).await {
                    Ok(true) => {
                        for record in &records {
                            if let Some(session) = self.sessions.remove(&record.node_id) {
                                self.devices.remove(session.device_id());
                                tracing::info!(node_id = %record.node_id, "sub-device deleted, closing channel");
                                session.channel().close();
                            }
                        }
                    }
                    Ok(false) => tracing::debug!(version = paras.version, "stale sub-device delete ignored"),
                    Err(e) => tracing::warn!(error = %e, "failed to delete sub-devices"),
                }
            }
            other => tracing::debug!(event_type = other, "ignoring sub-device manager event"),
        }
    }
}

#[async_trait]
impl DeviceHandler for Gateway {
    fn codec(&self) -> &Codec {
        self.inner.codec()
    }

    async fn on_message(&self, channel: &DeviceChannel, message: Message) {
        match message {
            Message::Login { header, .. } => self.inner.handle_login(channel, header).await,
            Message::LocationReport {
                header,
                longitude,
                latitude,
            } => self.inner.handle_location(channel, &header, longitude, latitude),
            Message::CommandResponse { header, result_code } => {
                self.inner.handle_ack(channel, &header, result_code);
            }
            Message::FrequencySet { header, .. } => tracing::warn!(
                node_id = %header.device_id,
                "sub-device sent a downlink-only message, dropping"
            ),
        }
    }

    async fn on_channel_closed(&self, channel: &DeviceChannel) {
        let Some(session) = self.inner.sessions.remove_by_channel(channel.id()) else {
            return;
        };
        self.inner
            .devices
            .remove_if(session.device_id(), |_, node| node == session.key());
        tracing::info!(node_id = %session.key(), device_id = %session.device_id(), "sub-device channel closed");
        self.inner
            .update_status(vec![DeviceStatus::offline(session.device_id())]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_require_gateway_mode() {
        assert!(GatewayOptions::from_config(&Config::default()).is_err());
    }

    #[test]
    fn options_from_gateway_config() {
        let mut config = Config {
            mode: Mode::Gateway,
            ..Config::default()
        };
        config.platform.device_id = Some("gw-1".to_string());

        let options = GatewayOptions::from_config(&config).unwrap();
        assert_eq!(options.gateway_id, "gw-1");
        assert_eq!(options.ack_timeout, Duration::from_secs(30));
    }
}
