//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use edge_bridge::codec::Message;
use edge_bridge::config::{Config, Mode};
use edge_bridge::gateway::SubDeviceRecord;
use edge_bridge::server::serve_connection;
use edge_bridge::transport::topic::{self, PlatformTopic, TopicScope};
use edge_bridge::transport::{MemoryLink, Published};
use edge_bridge::{Bridge, Codec, DeviceHandler, Gateway, MemorySubDeviceStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const BRIDGE_ID: &str = "bridge-1";
pub const GATEWAY_ID: &str = "gw-1";

/// How long a test waits for something that should happen
pub const WAIT: Duration = Duration::from_secs(2);

static TRACING: Once = Once::new();

/// Route crate logs to the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A valid configuration for `mode`
#[must_use]
pub fn test_config(mode: Mode) -> Config {
    let mut config = Config {
        mode,
        ..Config::default()
    };
    config.platform.server_uri = "tcp://broker.test:1883".to_string();
    config.platform.bridge_id = Some(BRIDGE_ID.to_string());
    config.platform.device_id = Some(GATEWAY_ID.to_string());
    config.platform.secret = Some("bridge-secret".to_string());
    config.platform.request_timeout = Duration::from_millis(500);
    config.platform.ack_timeout = Duration::from_millis(500);
    config
}

/// A started bridge over a fresh in-memory link
pub async fn started_bridge(config: &Config) -> (Bridge, Arc<MemoryLink>) {
    init_tracing();
    let link = Arc::new(MemoryLink::new());
    let bridge = Bridge::from_config(link.clone(), config).expect("bridge config");
    bridge.start().await.expect("bridge start");
    (bridge, link)
}

/// A started gateway over a fresh in-memory link
///
/// The sync request issued on connect is consumed before returning.
pub async fn started_gateway(
    config: &Config,
    store: Arc<MemorySubDeviceStore>,
) -> (Gateway, Arc<MemoryLink>) {
    init_tracing();
    let link = Arc::new(MemoryLink::new());
    let gateway = Gateway::from_config(link.clone(), config, store).expect("gateway config");
    gateway.start().await.expect("gateway start");
    let sync = next_published(&link).await;
    assert!(sync.topic.ends_with(topic::EVENTS_UP), "unexpected {}", sync.topic);
    (gateway, link)
}

/// A sub-device record whose platform id is derived from the node id
#[must_use]
pub fn sub_device(node_id: &str, version: i64) -> SubDeviceRecord {
    SubDeviceRecord {
        node_id: node_id.to_string(),
        device_id: format!("prod_{node_id}"),
        product_id: Some("prod".to_string()),
        version,
    }
}

/// Wait for the next publish, failing the test if none arrives
pub async fn next_published(link: &MemoryLink) -> Published {
    tokio::time::timeout(WAIT, link.next_published())
        .await
        .expect("timed out waiting for publish")
        .expect("link closed")
}

/// Assert that nothing is published for a short while
pub async fn assert_no_publish(link: &MemoryLink) {
    let next = tokio::time::timeout(Duration::from_millis(200), link.next_published()).await;
    assert!(next.is_err(), "unexpected publish: {next:?}");
}

/// Request id of a published topic
#[must_use]
pub fn request_id(published: &Published) -> String {
    PlatformTopic::parse(&published.topic)
        .and_then(|t| t.request_id)
        .expect("topic carries a request id")
}

/// Deliver a JSON downlink to the client
pub async fn inject_json(link: &MemoryLink, topic: &str, body: &serde_json::Value) {
    link.inject(topic, serde_json::to_vec(body).expect("json"))
        .await;
}

/// Answer the bridged login call in `login` with `result_code`
pub async fn answer_login(link: &MemoryLink, login: &Published, result_code: i32) {
    let parsed = PlatformTopic::parse(&login.topic).expect("platform topic");
    let reply = TopicScope::bridged(BRIDGE_ID, &parsed.device_id)
        .request(topic::LOGIN_RESPONSE, &request_id(login));
    inject_json(link, &reply, &serde_json::json!({ "result_code": result_code })).await;
}

/// The device side of one connection served by a handler
pub struct FakeDevice {
    stream: DuplexStream,
    codec: Codec,
    buf: Vec<u8>,
}

impl FakeDevice {
    /// Connect a device to `handler` over an in-memory stream
    #[must_use]
    pub fn connect(handler: Arc<dyn DeviceHandler>) -> Self {
        let codec = handler.codec().clone();
        let (device, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, "fake-device".to_string(), handler, 4096));
        Self {
            stream: device,
            codec,
            buf: Vec::new(),
        }
    }

    /// Send one message
    pub async fn send(&mut self, message: &Message) {
        let line = self.codec.encode(message);
        self.send_raw(&line).await;
    }

    /// Send raw bytes
    pub async fn send_raw(&mut self, raw: &str) {
        self.stream
            .write_all(raw.as_bytes())
            .await
            .expect("device write");
    }

    /// Next decoded message from the edge, `None` once the edge closed
    pub async fn recv(&mut self) -> Option<Message> {
        let end = self.codec.delimiters().end;
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(pos) = self.buf.iter().position(|b| *b == end) {
                    let frame: Vec<u8> = self.buf.drain(..=pos).collect();
                    let line = String::from_utf8(frame).expect("utf-8 frame");
                    return Some(self.codec.decode(&line).expect("decodable frame"));
                }
                let mut chunk = [0u8; 512];
                let n = self.stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for the edge")
    }

    /// Assert that nothing arrives for a short while
    pub async fn assert_silent(&mut self) {
        let mut chunk = [0u8; 512];
        let read =
            tokio::time::timeout(Duration::from_millis(200), self.stream.read(&mut chunk)).await;
        assert!(read.is_err(), "unexpected device traffic: {read:?}");
    }

    /// Whether the edge closed the connection, skipping any pending lines
    pub async fn is_closed(&mut self) -> bool {
        let mut chunk = [0u8; 512];
        loop {
            match tokio::time::timeout(WAIT, self.stream.read(&mut chunk)).await {
                Ok(Ok(0) | Err(_)) => return true,
                Ok(Ok(_)) => {}
                Err(_) => return false,
            }
        }
    }
}

/// Log a device in through the bridge and answer the platform login
pub async fn login_bridged(device: &mut FakeDevice, link: &MemoryLink, device_id: &str) {
    device
        .send(&Message::login(device_id, "1", "device-secret"))
        .await;
    let login = next_published(link).await;
    assert!(login.topic.contains("/sys/login/"), "unexpected {}", login.topic);
    answer_login(link, &login, 0).await;

    let reply = device.recv().await.expect("login reply");
    assert!(matches!(reply, Message::CommandResponse { result_code: 0, .. }));
}
