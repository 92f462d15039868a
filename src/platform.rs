//! Platform payload bodies
//!
//! JSON documents exchanged on platform topics. Service properties and
//! command parameters stay opaque maps; only the fields the orchestrators
//! route on are typed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// Service id of the sub-device management events
pub const SUB_DEVICE_MANAGER: &str = "$sub_device_manager";

/// Platform added sub-devices
pub const EVENT_ADD_SUB_DEVICE: &str = "add_sub_device_notify";
/// Platform deleted sub-devices
pub const EVENT_DELETE_SUB_DEVICE: &str = "delete_sub_device_notify";
/// Gateway asks for the authoritative sub-device list
pub const EVENT_SYNC_REQUEST: &str = "sub_device_sync_request";
/// Gateway reports sub-device online state
pub const EVENT_UPDATE_STATUS: &str = "sub_device_update_status";

/// Service id used for device location properties
pub const LOCATION_SERVICE_ID: &str = "Location";
/// Property / parameter carrying a report period in seconds
pub const PERIOD_PROPERTY: &str = "period";

/// Opaque property or parameter map
pub type Properties = Map<String, Value>;

/// Platform event timestamp (`yyyyMMddTHHmmssZ`)
#[must_use]
pub fn event_time(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Serialize a payload body
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn to_payload<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(body)?)
}

/// Parse a payload body
///
/// # Errors
///
/// Returns an error if the payload is not the expected JSON shape
pub fn from_payload<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// One service's properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProperty {
    pub service_id: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
}

impl ServiceProperty {
    #[must_use]
    pub const fn new(service_id: String, properties: Properties) -> Self {
        Self {
            service_id,
            properties,
            event_time: None,
        }
    }

    /// The location service built from a device fix
    #[must_use]
    pub fn location(longitude: &str, latitude: &str) -> Self {
        let mut properties = Properties::new();
        properties.insert("longitude".to_string(), Value::String(longitude.to_string()));
        properties.insert("latitude".to_string(), Value::String(latitude.to_string()));
        Self::new(LOCATION_SERVICE_ID.to_string(), properties)
    }
}

/// `sys/properties/report` and `sys/properties/get/response` body
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertiesReport {
    pub services: Vec<ServiceProperty>,
}

/// One sub-device's properties in a gateway batch report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub device_id: String,
    pub services: Vec<ServiceProperty>,
}

/// `sys/gateway/sub_devices/properties/report` body
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubDevicesPropertiesReport {
    pub devices: Vec<DeviceProperties>,
}

/// `sys/commands` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub command_name: String,
    #[serde(default)]
    pub paras: Properties,
}

impl Command {
    /// Report period carried in the parameters, if any
    #[must_use]
    pub fn period(&self) -> Option<u32> {
        period_of(&self.paras)
    }
}

/// `sys/commands/response` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paras: Option<Properties>,
}

impl CommandResponse {
    #[must_use]
    pub const fn new(result_code: i32) -> Self {
        Self {
            result_code,
            response_name: None,
            paras: None,
        }
    }
}

/// `sys/properties/set` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    pub services: Vec<ServiceProperty>,
}

impl PropertySet {
    /// First numeric `period` property across all services
    #[must_use]
    pub fn period(&self) -> Option<u32> {
        self.services.iter().find_map(|s| period_of(&s.properties))
    }
}

/// `sys/properties/get` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyGet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

/// Result body for set responses and login/logout responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub result_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_desc: Option<String>,
}

impl PlatformResult {
    #[must_use]
    pub fn success() -> Self {
        Self::with_code(0, "success")
    }

    #[must_use]
    pub fn with_code(result_code: i32, desc: &str) -> Self {
        Self {
            result_code,
            result_desc: Some(desc.to_string()),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

/// One event in an events body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub service_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub paras: Value,
}

impl ServiceEvent {
    /// A `$sub_device_manager` event stamped with the current time
    #[must_use]
    pub fn sub_device_manager(event_type: &str, paras: Value) -> Self {
        Self {
            service_id: SUB_DEVICE_MANAGER.to_string(),
            event_type: event_type.to_string(),
            event_time: Some(event_time(Utc::now())),
            event_id: None,
            paras,
        }
    }
}

/// `sys/events/up` and `sys/events/down` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    pub services: Vec<ServiceEvent>,
}

/// `sys/messages/up` and `sys/messages/down` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: Value,
}

/// Bridged device `sys/login` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLoginRequest {
    /// HMAC of the device secret keyed by `timestamp`
    pub password: String,
    /// `YYYYMMDDHH` signing window
    pub timestamp: String,
}

/// `sys/shadow/get` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowGet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

/// Desired or reported half of a shadow entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowProperties {
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
}

/// One service's shadow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowData {
    pub service_id: String,
    #[serde(default)]
    pub desired: ShadowProperties,
    #[serde(default)]
    pub reported: ShadowProperties,
    #[serde(default)]
    pub version: i64,
}

/// `sys/shadow/get/response` body
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    #[serde(default)]
    pub shadow: Vec<ShadowData>,
}

/// A sub-device as announced by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_device_id: Option<String>,
}

/// Parameters of add/delete sub-device notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDevicesParas {
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default)]
    pub version: i64,
}

/// Online state of one sub-device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: String,
}

impl DeviceStatus {
    #[must_use]
    pub fn online(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: "ONLINE".to_string(),
        }
    }

    #[must_use]
    pub fn offline(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: "OFFLINE".to_string(),
        }
    }
}

/// Parameters of `sub_device_update_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatuses {
    pub device_statuses: Vec<DeviceStatus>,
}

fn period_of(map: &Properties) -> Option<u32> {
    match map.get(PERIOD_PROPERTY)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn location_report_shape() {
        let report = PropertiesReport {
            services: vec![ServiceProperty::location("12.34", "56.78")],
        };

        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "services": [{
                    "service_id": "Location",
                    "properties": { "longitude": "12.34", "latitude": "56.78" }
                }]
            })
        );
    }

    #[test]
    fn command_period_from_number_or_string() {
        let numeric: Command = serde_json::from_value(json!({
            "service_id": "Location",
            "command_name": "FREQUENCY_LOCATION_SET",
            "paras": { "period": 30 }
        }))
        .unwrap();
        let textual: Command = serde_json::from_value(json!({
            "command_name": "FREQUENCY_LOCATION_SET",
            "paras": { "period": "15" }
        }))
        .unwrap();
        let missing: Command = serde_json::from_value(json!({ "command_name": "REBOOT" })).unwrap();

        assert_eq!(numeric.period(), Some(30));
        assert_eq!(textual.period(), Some(15));
        assert_eq!(missing.period(), None);
    }

    #[test]
    fn property_set_period_searches_all_services() {
        let set: PropertySet = serde_json::from_value(json!({
            "services": [
                { "service_id": "Battery", "properties": { "low": true } },
                { "service_id": "Location", "properties": { "period": 60 } }
            ]
        }))
        .unwrap();

        assert_eq!(set.period(), Some(60));
    }

    #[test]
    fn sub_device_notification_parses() {
        let events: EventBatch = serde_json::from_value(json!({
            "object_device_id": "gw-1",
            "services": [{
                "service_id": "$sub_device_manager",
                "event_type": "add_sub_device_notify",
                "event_time": "20240309T074512Z",
                "paras": {
                    "devices": [{ "device_id": "p_node-1", "node_id": "node-1", "product_id": "p" }],
                    "version": 3
                }
            }]
        }))
        .unwrap();

        let event = &events.services[0];
        assert_eq!(event.event_type, EVENT_ADD_SUB_DEVICE);
        let paras: SubDevicesParas = serde_json::from_value(event.paras.clone()).unwrap();
        assert_eq!(paras.version, 3);
        assert_eq!(paras.devices[0].node_id, "node-1");
    }

    #[test]
    fn event_time_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 45, 12).unwrap();
        assert_eq!(event_time(now), "20240309T074512Z");
    }
}
