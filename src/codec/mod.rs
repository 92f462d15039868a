//! Device wire codec
//!
//! Translates the device-facing text protocol into typed messages and back:
//!
//! ```text
//! <START><deviceId>,<flowNo>,<msgType>,<direction>,<body...><END>
//! ```
//!
//! Body parsing is dispatched by `msgType` through a lookup table built once
//! when the codec is created. A malformed line is a [`CodecError`], never a
//! panic, so the owning channel can log it and keep reading.

pub mod frame;

use std::collections::HashMap;

use thiserror::Error;

pub use frame::FrameDecoder;

/// Device login (up) and its result (down)
pub const MSG_DEVICE_LOGIN: &str = "DEVICE_LOGIN";

/// Periodic location report from the device
pub const MSG_REPORT_LOCATION_INFO: &str = "REPORT_LOCATION_INFO";

/// Report-period command (down) and the device acknowledgment (up)
pub const MSG_FREQUENCY_LOCATION_SET: &str = "FREQUENCY_LOCATION_SET";

/// Minimum number of header fields in a raw line
const HEADER_FIELDS: usize = 4;

/// Reasons a raw line is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Line does not begin with the start delimiter
    #[error("missing start delimiter")]
    MissingStart,

    /// Line does not finish with the end delimiter
    #[error("missing end delimiter")]
    MissingEnd,

    /// Fewer than four header fields
    #[error("expected at least 4 header fields, found {found}")]
    MissingHeaderFields {
        /// Number of fields present
        found: usize,
    },

    /// Direction field is neither `0` nor `1`
    #[error("unknown direction '{0}'")]
    UnknownDirection(String),

    /// No body parser registered for this message type
    #[error("unknown message type '{0}'")]
    UnknownMsgType(String),

    /// Body does not match the format of its message type
    #[error("invalid {msg_type} body: {reason}")]
    InvalidBody {
        /// Message type being parsed
        msg_type: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Traffic direction relative to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to edge
    Up,
    /// Edge to device
    Down,
}

impl Direction {
    /// Wire representation
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Up => "0",
            Self::Down => "1",
        }
    }

    /// Parse the wire representation
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "0" => Some(Self::Up),
            "1" => Some(Self::Down),
            _ => None,
        }
    }
}

/// Common header carried by every device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Device identifier (bridge) or node identifier (gateway)
    pub device_id: String,
    /// Flow number correlating a round trip within one session
    pub flow_no: String,
    /// Message type tag
    pub msg_type: String,
    /// Direction of travel
    pub direction: Direction,
}

impl Header {
    /// Build a header
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        flow_no: impl Into<String>,
        msg_type: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            flow_no: flow_no.into(),
            msg_type: msg_type.into(),
            direction,
        }
    }
}

/// A typed device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Device authenticates with its secret
    Login {
        /// Message header
        header: Header,
        /// Opaque device secret
        secret: String,
    },
    /// Device reports its position
    LocationReport {
        /// Message header
        header: Header,
        /// Longitude exactly as sent by the device
        longitude: String,
        /// Latitude exactly as sent by the device
        latitude: String,
    },
    /// Edge asks the device to change its report period
    FrequencySet {
        /// Message header
        header: Header,
        /// Report period in seconds
        period: u32,
    },
    /// Result code for a login or a command
    CommandResponse {
        /// Message header
        header: Header,
        /// Zero on success
        result_code: i32,
    },
}

impl Message {
    /// Message header
    #[must_use]
    pub const fn header(&self) -> &Header {
        match self {
            Self::Login { header, .. }
            | Self::LocationReport { header, .. }
            | Self::FrequencySet { header, .. }
            | Self::CommandResponse { header, .. } => header,
        }
    }

    /// Device login request
    #[must_use]
    pub fn login(device_id: &str, flow_no: &str, secret: &str) -> Self {
        Self::Login {
            header: Header::new(device_id, flow_no, MSG_DEVICE_LOGIN, Direction::Up),
            secret: secret.to_string(),
        }
    }

    /// Login result written back to the device
    #[must_use]
    pub fn login_response(device_id: &str, flow_no: &str, result_code: i32) -> Self {
        Self::CommandResponse {
            header: Header::new(device_id, flow_no, MSG_DEVICE_LOGIN, Direction::Down),
            result_code,
        }
    }

    /// Location report from the device
    #[must_use]
    pub fn location_report(device_id: &str, flow_no: &str, longitude: &str, latitude: &str) -> Self {
        Self::LocationReport {
            header: Header::new(device_id, flow_no, MSG_REPORT_LOCATION_INFO, Direction::Up),
            longitude: longitude.to_string(),
            latitude: latitude.to_string(),
        }
    }

    /// Report-period command sent to the device
    #[must_use]
    pub fn frequency_set(device_id: &str, flow_no: &str, period: u32) -> Self {
        Self::FrequencySet {
            header: Header::new(device_id, flow_no, MSG_FREQUENCY_LOCATION_SET, Direction::Down),
            period,
        }
    }

    /// Device acknowledgment of a report-period command
    #[must_use]
    pub fn frequency_set_ack(device_id: &str, flow_no: &str, result_code: i32) -> Self {
        Self::CommandResponse {
            header: Header::new(device_id, flow_no, MSG_FREQUENCY_LOCATION_SET, Direction::Up),
            result_code,
        }
    }
}

/// Frame delimiters, all single ASCII bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    /// Marks the start of a frame
    pub start: u8,
    /// Separates header and body fields
    pub separator: u8,
    /// Marks the end of a frame
    pub end: u8,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            start: b'#',
            separator: b',',
            end: b'|',
        }
    }
}

type BodyParser = fn(Header, &str, char) -> Result<Message, CodecError>;

/// Device wire codec
#[derive(Debug, Clone)]
pub struct Codec {
    delimiters: Delimiters,
    parsers: HashMap<&'static str, BodyParser>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Delimiters::default())
    }
}

impl Codec {
    /// Create a codec with the given delimiters
    #[must_use]
    pub fn new(delimiters: Delimiters) -> Self {
        let mut parsers: HashMap<&'static str, BodyParser> = HashMap::new();
        parsers.insert(MSG_DEVICE_LOGIN, parse_login);
        parsers.insert(MSG_REPORT_LOCATION_INFO, parse_location);
        parsers.insert(MSG_FREQUENCY_LOCATION_SET, parse_frequency);

        Self {
            delimiters,
            parsers,
        }
    }

    /// Delimiters in use
    #[must_use]
    pub const fn delimiters(&self) -> Delimiters {
        self.delimiters
    }

    /// Whether a body parser exists for `msg_type`
    #[must_use]
    pub fn knows(&self, msg_type: &str) -> bool {
        self.parsers.contains_key(msg_type)
    }

    /// Decode one raw line into a typed message
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing why the line was rejected
    pub fn decode(&self, raw: &str) -> Result<Message, CodecError> {
        let start = char::from(self.delimiters.start);
        let end = char::from(self.delimiters.end);
        let sep = char::from(self.delimiters.separator);

        let line = raw.strip_prefix(start).ok_or(CodecError::MissingStart)?;
        let line = line.strip_suffix(end).ok_or(CodecError::MissingEnd)?;

        let fields: Vec<&str> = line.splitn(HEADER_FIELDS + 1, sep).collect();
        if fields.len() < HEADER_FIELDS {
            return Err(CodecError::MissingHeaderFields {
                found: fields.len(),
            });
        }

        let direction = Direction::from_wire(fields[3])
            .ok_or_else(|| CodecError::UnknownDirection(fields[3].to_string()))?;
        let header = Header::new(fields[0], fields[1], fields[2], direction);
        let body = fields.get(HEADER_FIELDS).copied().unwrap_or_default();

        let parser = self
            .parsers
            .get(header.msg_type.as_str())
            .ok_or_else(|| CodecError::UnknownMsgType(header.msg_type.clone()))?;

        parser(header, body, sep)
    }

    /// Encode a message into a raw line, including both delimiters
    ///
    /// A message whose type has no registered parser is still written, with
    /// an empty body, so a bad outgoing message never stalls the channel.
    #[must_use]
    pub fn encode(&self, message: &Message) -> String {
        let sep = char::from(self.delimiters.separator);
        let header = message.header();

        let body = if self.knows(&header.msg_type) {
            match message {
                Message::Login { secret, .. } => secret.clone(),
                Message::LocationReport {
                    longitude,
                    latitude,
                    ..
                } => format!("{longitude}{sep}{latitude}"),
                Message::FrequencySet { period, .. } => period.to_string(),
                Message::CommandResponse { result_code, .. } => result_code.to_string(),
            }
        } else {
            tracing::warn!(
                msg_type = %header.msg_type,
                device_id = %header.device_id,
                "encoding message with unknown type, body left empty"
            );
            String::new()
        };

        format!(
            "{start}{device}{sep}{flow}{sep}{kind}{sep}{dir}{sep}{body}{end}",
            start = char::from(self.delimiters.start),
            device = header.device_id,
            flow = header.flow_no,
            kind = header.msg_type,
            dir = header.direction.as_wire(),
            end = char::from(self.delimiters.end),
        )
    }
}

fn invalid(header: &Header, reason: impl Into<String>) -> CodecError {
    CodecError::InvalidBody {
        msg_type: header.msg_type.clone(),
        reason: reason.into(),
    }
}

/// Parse an integer written the way `to_string` writes it
fn canonical<T>(body: &str) -> Option<T>
where
    T: std::str::FromStr + ToString,
{
    body.parse::<T>().ok().filter(|n| n.to_string() == body)
}

fn parse_result_code(header: Header, body: &str) -> Result<Message, CodecError> {
    let result_code = canonical(body)
        .ok_or_else(|| invalid(&header, format!("result code '{body}' is not an integer")))?;
    Ok(Message::CommandResponse {
        header,
        result_code,
    })
}

fn parse_login(header: Header, body: &str, _sep: char) -> Result<Message, CodecError> {
    match header.direction {
        Direction::Up if body.is_empty() => Err(invalid(&header, "empty secret")),
        Direction::Up => Ok(Message::Login {
            header,
            secret: body.to_string(),
        }),
        Direction::Down => parse_result_code(header, body),
    }
}

fn parse_location(header: Header, body: &str, sep: char) -> Result<Message, CodecError> {
    if header.direction == Direction::Down {
        return Err(invalid(&header, "location reports only travel up"));
    }

    let mut parts = body.split(sep);
    let (Some(longitude), Some(latitude), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid(&header, "expected <longitude>,<latitude>"));
    };

    for value in [longitude, latitude] {
        if !value.parse::<f64>().is_ok_and(f64::is_finite) {
            return Err(invalid(&header, format!("'{value}' is not a coordinate")));
        }
    }

    Ok(Message::LocationReport {
        longitude: longitude.to_string(),
        latitude: latitude.to_string(),
        header,
    })
}

fn parse_frequency(header: Header, body: &str, _sep: char) -> Result<Message, CodecError> {
    match header.direction {
        Direction::Down => {
            let period = canonical(body)
                .ok_or_else(|| invalid(&header, format!("period '{body}' is not a positive integer")))?;
            Ok(Message::FrequencySet { header, period })
        }
        Direction::Up => parse_result_code(header, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_login_line() {
        let codec = Codec::default();
        let msg = codec.decode("#dev1,1,DEVICE_LOGIN,0,secret123|").unwrap();

        assert_eq!(msg, Message::login("dev1", "1", "secret123"));
    }

    #[test]
    fn decodes_location_report_keeping_text() {
        let codec = Codec::default();
        let msg = codec
            .decode("#dev1,2,REPORT_LOCATION_INFO,0,12.34,56.78|")
            .unwrap();

        let Message::LocationReport {
            longitude,
            latitude,
            header,
        } = msg
        else {
            panic!("expected location report");
        };
        assert_eq!(header.flow_no, "2");
        assert_eq!(longitude, "12.34");
        assert_eq!(latitude, "56.78");
    }

    #[test]
    fn every_message_kind_survives_encoding() {
        let codec = Codec::default();
        let messages = [
            Message::login("dev1", "1", "s3cr3t"),
            Message::login_response("dev1", "1", 0),
            Message::location_report("dev1", "2", "-122.419", "37.7749"),
            Message::frequency_set("dev1", "7", 30),
            Message::frequency_set_ack("dev1", "7", 1),
        ];

        for msg in messages {
            let line = codec.encode(&msg);
            assert_eq!(codec.decode(&line).unwrap(), msg, "line: {line}");
        }
    }

    #[test]
    fn valid_lines_encode_back_verbatim() {
        let codec = Codec::default();
        for line in [
            "#dev1,1,DEVICE_LOGIN,0,secret123|",
            "#dev1,1,DEVICE_LOGIN,1,0|",
            "#dev1,2,REPORT_LOCATION_INFO,0,12.34,56.78|",
            "#node-9,15,FREQUENCY_LOCATION_SET,1,60|",
            "#node-9,15,FREQUENCY_LOCATION_SET,0,-1|",
        ] {
            let msg = codec.decode(line).unwrap();
            assert_eq!(codec.encode(&msg), line);
        }
    }

    #[test]
    fn too_few_header_fields_is_rejected() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode("#dev1,1,DEVICE_LOGIN|"),
            Err(CodecError::MissingHeaderFields { found: 3 })
        );
    }

    #[test]
    fn missing_start_is_rejected() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode("dev1,1,DEVICE_LOGIN,0,x|"),
            Err(CodecError::MissingStart)
        );
    }

    #[test]
    fn missing_end_is_rejected() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode("#dev1,1,DEVICE_LOGIN,0,secret"),
            Err(CodecError::MissingEnd)
        );
    }

    #[test]
    fn unknown_msg_type_is_rejected() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode("#dev1,1,REBOOT,0,now|"),
            Err(CodecError::UnknownMsgType("REBOOT".to_string()))
        );
    }

    #[test]
    fn unknown_direction_is_rejected() {
        let codec = Codec::default();
        assert!(matches!(
            codec.decode("#dev1,1,DEVICE_LOGIN,2,x|"),
            Err(CodecError::UnknownDirection(d)) if d == "2"
        ));
    }

    #[test]
    fn bad_bodies_are_rejected() {
        let codec = Codec::default();
        for line in [
            "#dev1,1,DEVICE_LOGIN,0|",
            "#dev1,2,REPORT_LOCATION_INFO,0,12.34|",
            "#dev1,2,REPORT_LOCATION_INFO,0,east,north|",
            "#dev1,2,REPORT_LOCATION_INFO,0,1,2,3|",
            "#dev1,3,FREQUENCY_LOCATION_SET,1,-5|",
            "#dev1,3,FREQUENCY_LOCATION_SET,0,ok|",
            "#dev1,3,FREQUENCY_LOCATION_SET,0,060|",
            "#dev1,3,FREQUENCY_LOCATION_SET,1,+0|",
            "#dev1,1,DEVICE_LOGIN,1,+0|",
            "#dev1,1,DEVICE_LOGIN,1,-0|",
            "#dev1,1,DEVICE_LOGIN,1,00|",
            "#dev1,2,REPORT_LOCATION_INFO,0,NaN,1.0|",
            "#dev1,2,REPORT_LOCATION_INFO,0,1.0,inf|",
        ] {
            assert!(
                matches!(codec.decode(line), Err(CodecError::InvalidBody { .. })),
                "line should be rejected: {line}"
            );
        }
    }

    #[test]
    fn unknown_outgoing_type_gets_empty_body() {
        let codec = Codec::default();
        let msg = Message::CommandResponse {
            header: Header::new("dev1", "4", "REBOOT", Direction::Down),
            result_code: 0,
        };

        assert_eq!(codec.encode(&msg), "#dev1,4,REBOOT,1,|");
    }

    #[test]
    fn custom_delimiters() {
        let codec = Codec::new(Delimiters {
            start: b'<',
            separator: b';',
            end: b'>',
        });
        let line = "<dev1;2;REPORT_LOCATION_INFO;0;1.5;2.5>";

        let msg = codec.decode(line).unwrap();
        assert_eq!(msg, Message::location_report("dev1", "2", "1.5", "2.5"));
        assert_eq!(codec.encode(&msg), line);
    }
}
