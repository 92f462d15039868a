//! Per-device session registry
//!
//! A session exists for every device that completed login. Sessions are keyed
//! by device id (bridge) or node id (gateway); a reverse map from channel to
//! key lets the connection task find its session when the socket closes.
//!
//! Both maps are sharded, so mutations on one key never block unrelated keys.

mod channel;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

pub use channel::{ChannelCommand, ChannelId, DeviceChannel};

/// Lifecycle of a device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session and no login in flight
    Disconnected,
    /// Login sent to the platform, awaiting its result
    LoginPending,
    /// Logged in; traffic is relayed
    Online,
}

/// Last position reported by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub longitude: String,
    pub latitude: String,
}

/// A logged-in device
#[derive(Debug)]
pub struct Session {
    key: String,
    device_id: String,
    channel: DeviceChannel,
    sequence: AtomicU64,
    last_location: Mutex<Option<Location>>,
    connected_at: DateTime<Utc>,
}

impl Session {
    fn new(key: String, device_id: String, channel: DeviceChannel) -> Self {
        Self::continuing(key, device_id, channel, 0)
    }

    fn continuing(key: String, device_id: String, channel: DeviceChannel, sequence: u64) -> Self {
        Self {
            key,
            device_id,
            channel,
            sequence: AtomicU64::new(sequence),
            last_location: Mutex::new(None),
            connected_at: Utc::now(),
        }
    }

    /// Registry key (device id or node id)
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Platform device id
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Channel the device is connected on
    #[must_use]
    pub const fn channel(&self) -> &DeviceChannel {
        &self.channel
    }

    /// When the session was created
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Allocate the next flow number for an outgoing correlated request
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last flow number handed out (zero before the first request)
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Remember the latest reported position
    pub fn set_location(&self, location: Location) {
        if let Ok(mut slot) = self.last_location.lock() {
            *slot = Some(location);
        }
    }

    /// Latest reported position, if any
    #[must_use]
    pub fn location(&self) -> Option<Location> {
        self.last_location.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Registry of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    channels: DashMap<ChannelId, String>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for `key`, creating it if absent
    ///
    /// Returns `(session, is_new)`. When a session already exists it is
    /// returned untouched with `is_new == false`; the caller decides whether
    /// that is a duplicate login.
    pub fn try_create(
        &self,
        key: &str,
        device_id: &str,
        channel: &DeviceChannel,
    ) -> (Arc<Session>, bool) {
        match self.sessions.entry(key.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                let session = Arc::new(Session::new(
                    key.to_string(),
                    device_id.to_string(),
                    channel.clone(),
                ));
                slot.insert(Arc::clone(&session));
                self.channels.insert(channel.id(), key.to_string());
                tracing::debug!(key, channel = %channel.id(), "session created");
                (session, true)
            }
        }
    }

    /// Install a fresh session for `key`, returning the one it displaced
    ///
    /// The new session continues the displaced one's flow numbers, so a
    /// command still in flight on the old channel keeps a distinct key.
    pub fn replace(
        &self,
        key: &str,
        device_id: &str,
        channel: &DeviceChannel,
    ) -> (Arc<Session>, Option<Arc<Session>>) {
        let fresh = |sequence| {
            Arc::new(Session::continuing(
                key.to_string(),
                device_id.to_string(),
                channel.clone(),
                sequence,
            ))
        };
        let (session, previous) = match self.sessions.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                let session = fresh(existing.get().current_sequence());
                let previous = existing.insert(Arc::clone(&session));
                (session, Some(previous))
            }
            Entry::Vacant(slot) => {
                let session = fresh(0);
                slot.insert(Arc::clone(&session));
                (session, None)
            }
        };

        if let Some(old) = &previous {
            self.channels
                .remove_if(&old.channel().id(), |_, bound| bound == key);
        }
        self.channels.insert(channel.id(), key.to_string());

        (session, previous)
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Remove a session and its channel binding
    pub fn remove(&self, key: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(key)?;
        self.channels
            .remove_if(&session.channel().id(), |_, bound| bound == key);
        tracing::debug!(key, "session removed");
        Some(session)
    }

    /// Remove whichever session is bound to `channel`
    ///
    /// A session that has since been rebound to another channel is left alone.
    pub fn remove_by_channel(&self, channel: ChannelId) -> Option<Arc<Session>> {
        let (_, key) = self.channels.remove(&channel)?;
        let (_, session) = self
            .sessions
            .remove_if(&key, |_, s| s.channel().id() == channel)?;
        tracing::debug!(key = %key, %channel, "session removed with its channel");
        Some(session)
    }

    /// Key bound to a channel, if it has logged in
    #[must_use]
    pub fn key_for_channel(&self, channel: ChannelId) -> Option<String> {
        self.channels.get(&channel).map(|k| k.value().clone())
    }

    /// Allocate the next flow number for `session`
    pub fn next_sequence(session: &Session) -> u64 {
        session.next_sequence()
    }

    /// Keys of all live sessions
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
