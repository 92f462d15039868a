//! Platform topic catalogue
//!
//! Topics are `<scope>/<suffix>[/request_id=<id>]` where the scope is either
//! `$oc/devices/{deviceId}` (a directly connected device or gateway) or
//! `$oc/bridges/{bridgeId}/devices/{deviceId}` (a device relayed by a bridge).

use std::fmt;

const ROOT: &str = "$oc";
const REQUEST_ID: &str = "request_id=";

// uplink
pub const LOGIN: &str = "sys/login";
pub const LOGOUT: &str = "sys/logout";
pub const PROPERTIES_REPORT: &str = "sys/properties/report";
pub const EVENTS_UP: &str = "sys/events/up";
pub const MESSAGES_UP: &str = "sys/messages/up";
pub const COMMANDS_RESPONSE: &str = "sys/commands/response";
pub const PROPERTIES_GET_RESPONSE: &str = "sys/properties/get/response";
pub const PROPERTIES_SET_RESPONSE: &str = "sys/properties/set/response";
pub const SHADOW_GET: &str = "sys/shadow/get";
pub const SUB_DEVICES_PROPERTIES_REPORT: &str = "sys/gateway/sub_devices/properties/report";

// downlink
pub const MESSAGES_DOWN: &str = "sys/messages/down";
pub const COMMANDS: &str = "sys/commands";
pub const PROPERTIES_SET: &str = "sys/properties/set";
pub const PROPERTIES_GET: &str = "sys/properties/get";
pub const EVENTS_DOWN: &str = "sys/events/down";
pub const SHADOW_GET_RESPONSE: &str = "sys/shadow/get/response";
pub const LOGIN_RESPONSE: &str = "sys/login/response";
pub const LOGOUT_RESPONSE: &str = "sys/logout/response";
pub const DISCONNECT: &str = "sys/disconnect";

/// Whose topic namespace a topic lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicScope {
    /// `$oc/devices/{device_id}`
    Device {
        /// Platform device id
        device_id: String,
    },
    /// `$oc/bridges/{bridge_id}/devices/{device_id}`
    Bridged {
        /// Bridge id
        bridge_id: String,
        /// Platform device id
        device_id: String,
    },
}

impl TopicScope {
    /// Scope of a directly connected device
    #[must_use]
    pub fn device(device_id: &str) -> Self {
        Self::Device {
            device_id: device_id.to_string(),
        }
    }

    /// Scope of a device relayed by `bridge_id`
    #[must_use]
    pub fn bridged(bridge_id: &str, device_id: &str) -> Self {
        Self::Bridged {
            bridge_id: bridge_id.to_string(),
            device_id: device_id.to_string(),
        }
    }

    /// Device id this scope addresses
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Device { device_id } | Self::Bridged { device_id, .. } => device_id,
        }
    }

    /// Topic for `suffix` without a request id
    #[must_use]
    pub fn topic(&self, suffix: &str) -> String {
        format!("{self}/{suffix}")
    }

    /// Topic for `suffix` tagged with `request_id`
    #[must_use]
    pub fn request(&self, suffix: &str, request_id: &str) -> String {
        format!("{self}/{suffix}/{REQUEST_ID}{request_id}")
    }
}

impl fmt::Display for TopicScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { device_id } => write!(f, "{ROOT}/devices/{device_id}"),
            Self::Bridged {
                bridge_id,
                device_id,
            } => write!(f, "{ROOT}/bridges/{bridge_id}/devices/{device_id}"),
        }
    }
}

/// Subscription filter for all system topics of a directly connected device
#[must_use]
pub fn device_wildcard(device_id: &str) -> String {
    format!("{ROOT}/devices/{device_id}/sys/#")
}

/// Subscription filter for all system topics of every device behind a bridge
#[must_use]
pub fn bridge_wildcard(bridge_id: &str) -> String {
    format!("{ROOT}/bridges/{bridge_id}/devices/+/sys/#")
}

/// A received topic split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTopic {
    /// Bridge id for bridged topics
    pub bridge_id: Option<String>,
    /// Platform device id
    pub device_id: String,
    /// Path after the scope, without the request id (e.g. `sys/commands`)
    pub suffix: String,
    /// Request id, when the topic carried one
    pub request_id: Option<String>,
}

impl PlatformTopic {
    /// Parse a topic string; `None` if it is not a platform topic
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let rest = topic.strip_prefix(ROOT)?.strip_prefix('/')?;

        let (bridge_id, rest) = match rest.strip_prefix("bridges/") {
            Some(bridged) => {
                let (bridge_id, rest) = bridged.split_once('/')?;
                (Some(bridge_id.to_string()), rest)
            }
            None => (None, rest),
        };

        let (device_id, path) = rest.strip_prefix("devices/")?.split_once('/')?;
        if device_id.is_empty() || path.is_empty() {
            return None;
        }

        let (suffix, request_id) = match path.rsplit_once('/') {
            Some((head, last)) if last.starts_with(REQUEST_ID) => {
                let id = &last[REQUEST_ID.len()..];
                (head, (!id.is_empty()).then(|| id.to_string()))
            }
            _ => (path, None),
        };

        Some(Self {
            bridge_id: bridge_id.filter(|b| !b.is_empty()),
            device_id: device_id.to_string(),
            suffix: suffix.to_string(),
            request_id,
        })
    }

    /// Scope the topic belongs to
    #[must_use]
    pub fn scope(&self) -> TopicScope {
        match &self.bridge_id {
            Some(bridge_id) => TopicScope::bridged(bridge_id, &self.device_id),
            None => TopicScope::device(&self.device_id),
        }
    }

    /// Whether this topic answers an earlier request
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.suffix.ends_with("/response")
    }
}

impl fmt::Display for PlatformTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request_id {
            Some(id) => f.write_str(&self.scope().request(&self.suffix, id)),
            None => f.write_str(&self.scope().topic(&self.suffix)),
        }
    }
}
