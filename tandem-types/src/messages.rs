//! Control protocol messages.
//!
//! Every message on the control channel is a JSON object with a `v`
//! (protocol version) and a `type` discriminator. The codec owns `v`; the
//! types here model everything else.

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Current control protocol version.
pub const PROTOCOL_VERSION: u64 = 1;

/// Names of all commands a device understands.
const KNOWN_COMMANDS: &[&str] = &[
    "query_capabilities",
    "time_sync",
    "start_recording",
    "stop_recording",
    "flash_sync",
    "transfer_files",
];

/// One message on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Hub to device request.
    #[serde(rename = "cmd")]
    Command(Command),
    /// Successful reply to a command.
    #[serde(rename = "ack")]
    Ack(Ack),
    /// Rejected command.
    #[serde(rename = "error")]
    Error(ErrorReply),
    /// Unsolicited device to hub notification.
    #[serde(rename = "event")]
    Event(Event),
}

impl ControlMessage {
    /// Short name of the message type, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Command(_) => "cmd",
            ControlMessage::Ack(_) => "ack",
            ControlMessage::Error(_) => "error",
            ControlMessage::Event(_) => "event",
        }
    }

    /// Build an error reply.
    pub fn error(ack_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        ControlMessage::Error(ErrorReply {
            ack_id,
            code,
            message: message.into(),
        })
    }
}

/// A command issued by the hub.
///
/// The command name is kept as a string so that unknown commands still
/// decode and can be answered with `E_BAD_PARAM`. Use [`Request`] for the
/// typed view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Hub-assigned request id, unique per connection.
    pub id: u64,
    /// Command name.
    pub command: String,
    /// Command-specific fields.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Typed view of the commands a hub can issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Ask the device to describe itself.
    QueryCapabilities,
    /// Clock probe; the device answers with `t1`/`t2`.
    TimeSync {
        /// Probe sequence number.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// Hub send instant in nanoseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        t0: Option<i64>,
    },
    /// Begin recording into the named session.
    StartRecording {
        /// Session the recording belongs to.
        session_id: String,
    },
    /// Stop the current recording.
    StopRecording,
    /// Trigger a synchronization flash; the device answers with `ts`.
    FlashSync,
    /// Stream the session directory to `host:port`.
    TransferFiles {
        /// Receiver host.
        host: String,
        /// Receiver port.
        port: u16,
        /// Session whose data should be sent.
        session_id: String,
    },
}

impl Request {
    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Request::QueryCapabilities => "query_capabilities",
            Request::TimeSync { .. } => "time_sync",
            Request::StartRecording { .. } => "start_recording",
            Request::StopRecording => "stop_recording",
            Request::FlashSync => "flash_sync",
            Request::TransferFiles { .. } => "transfer_files",
        }
    }

    /// Wrap this request in a [`Command`] with the given id.
    pub fn into_command(self, id: u64) -> Command {
        let command = self.name().to_string();
        let mut params = match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        params.remove("command");
        Command {
            id,
            command,
            params,
        }
    }
}

/// Why a [`Command`] could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The command name is not one this protocol defines.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A required field is missing or has the wrong type.
    #[error("invalid parameters for {command}: {reason}")]
    InvalidParams {
        /// Command name.
        command: String,
        /// Parser message.
        reason: String,
    },
}

impl RequestError {
    /// Error code to report back to the hub.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::BadParam
    }
}

impl TryFrom<&Command> for Request {
    type Error = RequestError;

    fn try_from(cmd: &Command) -> Result<Self, Self::Error> {
        if !KNOWN_COMMANDS.contains(&cmd.command.as_str()) {
            return Err(RequestError::UnknownCommand(cmd.command.clone()));
        }
        let mut fields = cmd.params.clone();
        fields.insert("command".into(), Value::String(cmd.command.clone()));
        serde_json::from_value(Value::Object(fields)).map_err(|e| RequestError::InvalidParams {
            command: cmd.command.clone(),
            reason: e.to_string(),
        })
    }
}

fn default_status() -> String {
    "ok".to_string()
}

/// Successful reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Id of the command being acknowledged.
    pub ack_id: u64,
    /// Status string, `"ok"` unless a command defines otherwise.
    #[serde(default = "default_status")]
    pub status: String,
    /// Command-specific result fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Ack {
    /// Plain `status: "ok"` acknowledgement.
    pub fn ok(ack_id: u64) -> Self {
        Self {
            ack_id,
            status: default_status(),
            fields: Map::new(),
        }
    }

    /// Add a result field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Read a result field as `T`. `None` if absent or of the wrong shape.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// A command rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Id of the rejected command.
    pub ack_id: u64,
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
}

/// Command-level error codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// Missing or invalid command field, or unknown command.
    BadParam,
    /// A recording is already in progress.
    RecordingActive,
    /// No recording is in progress.
    NotRecording,
    /// A capture resource failed.
    SensorError,
    /// Local storage failed or the data is missing.
    StorageError,
    /// Network operation failed on the device side.
    NetworkError,
    /// A code this version does not know.
    Unknown(String),
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::BadParam => "E_BAD_PARAM",
            ErrorCode::RecordingActive => "E_RECORDING_ACTIVE",
            ErrorCode::NotRecording => "E_NOT_RECORDING",
            ErrorCode::SensorError => "E_SENSOR_ERROR",
            ErrorCode::StorageError => "E_STORAGE_ERROR",
            ErrorCode::NetworkError => "E_NETWORK_ERROR",
            ErrorCode::Unknown(code) => code,
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "E_BAD_PARAM" => ErrorCode::BadParam,
            "E_RECORDING_ACTIVE" => ErrorCode::RecordingActive,
            "E_NOT_RECORDING" => ErrorCode::NotRecording,
            "E_SENSOR_ERROR" => ErrorCode::SensorError,
            "E_STORAGE_ERROR" => ErrorCode::StorageError,
            "E_NETWORK_ERROR" => ErrorCode::NetworkError,
            _ => ErrorCode::Unknown(code),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unsolicited notification from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. `preview_frame`.
    pub name: String,
    /// Event-specific fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an event from a typed payload that serializes to an object.
    pub fn new<T: Serialize>(name: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Ok(Self {
            name: name.into(),
            payload,
        })
    }

    /// Decode the payload as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

/// Payload of a `preview_frame` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewFrame {
    /// Device that captured the frame.
    pub device_id: String,
    /// JPEG image, standard base64.
    pub jpeg_base64: String,
    /// Capture instant in device nanoseconds.
    pub ts: i64,
}

impl PreviewFrame {
    /// Event name on the wire.
    pub const NAME: &'static str = "preview_frame";

    /// Encode raw JPEG bytes into a frame.
    pub fn from_jpeg(device_id: impl Into<String>, jpeg: &[u8], ts: i64) -> Self {
        Self {
            device_id: device_id.into(),
            jpeg_base64: base64::engine::general_purpose::STANDARD.encode(jpeg),
            ts,
        }
    }

    /// Decode the JPEG bytes.
    pub fn jpeg(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.jpeg_base64)
    }
}

/// Payload of a `heartbeat` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Device sending the heartbeat.
    pub device_id: String,
    /// Device instant in nanoseconds.
    pub ts: i64,
}

impl Heartbeat {
    /// Event name on the wire.
    pub const NAME: &'static str = "heartbeat";
}

/// Device self-description returned by `query_capabilities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Stable device identifier.
    pub device_id: String,
    /// Human-readable model string.
    pub device_model: String,
    /// Platform SDK level, if the device reports one.
    #[serde(default)]
    pub android_sdk: Option<u32>,
    /// Port the control service listens on.
    #[serde(default)]
    pub service_port: Option<u16>,
    /// Device has an RGB camera.
    #[serde(default)]
    pub has_rgb: bool,
    /// Device has a thermal imager.
    #[serde(default)]
    pub has_thermal: bool,
    /// Device has a GSR sensor.
    #[serde(default)]
    pub has_gsr: bool,
    /// Opaque camera descriptors.
    #[serde(default)]
    pub cameras: Vec<Value>,
}

fn unknown_device() -> String {
    "unknown_device".to_string()
}

/// Header line sent at the start of a file transfer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    /// Session the archive belongs to.
    pub session_id: String,
    /// Archive file name.
    pub filename: String,
    /// Sending device.
    #[serde(default = "unknown_device")]
    pub device_id: String,
    /// Archive size in bytes, when the sender knows it up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl TransferHeader {
    /// Serialize as a newline-terminated JSON line.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parse a header line (trailing newline optional).
    pub fn from_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        let trimmed = line
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(line);
        serde_json::from_slice(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ===== Requests =====

    #[test]
    fn request_into_command_and_back() {
        let req = Request::TransferFiles {
            host: "10.0.0.2".into(),
            port: 8082,
            session_id: "s1".into(),
        };
        let cmd = req.clone().into_command(7);
        assert_eq!(cmd.id, 7);
        assert_eq!(cmd.command, "transfer_files");
        assert_eq!(cmd.params.get("port"), Some(&json!(8082)));
        assert!(!cmd.params.contains_key("command"));
        assert_eq!(Request::try_from(&cmd).unwrap(), req);
    }

    #[test]
    fn time_sync_fields_are_optional() {
        let cmd = Command {
            id: 1,
            command: "time_sync".into(),
            params: Map::new(),
        };
        assert_eq!(
            Request::try_from(&cmd).unwrap(),
            Request::TimeSync { seq: None, t0: None }
        );
        let encoded = Request::TimeSync { seq: None, t0: None }.into_command(1);
        assert!(encoded.params.is_empty());
    }

    #[test]
    fn unknown_command_is_bad_param() {
        let cmd = Command {
            id: 3,
            command: "ping".into(),
            params: Map::new(),
        };
        let err = Request::try_from(&cmd).unwrap_err();
        assert_eq!(err, RequestError::UnknownCommand("ping".into()));
        assert_eq!(err.code(), ErrorCode::BadParam);
    }

    #[test]
    fn missing_field_is_bad_param() {
        let cmd = Command {
            id: 4,
            command: "transfer_files".into(),
            params: json!({"host": "h"}).as_object().unwrap().clone(),
        };
        assert!(matches!(
            Request::try_from(&cmd),
            Err(RequestError::InvalidParams { .. })
        ));
    }

    #[test]
    fn extra_params_are_ignored() {
        let cmd = Command {
            id: 5,
            command: "stop_recording".into(),
            params: json!({"reason": "operator"}).as_object().unwrap().clone(),
        };
        assert_eq!(Request::try_from(&cmd).unwrap(), Request::StopRecording);
    }

    // ===== Replies =====

    #[test]
    fn error_codes_round_trip_through_strings() {
        for code in [
            ErrorCode::BadParam,
            ErrorCode::RecordingActive,
            ErrorCode::NotRecording,
            ErrorCode::SensorError,
            ErrorCode::StorageError,
            ErrorCode::NetworkError,
        ] {
            let s: String = code.clone().into();
            assert_eq!(ErrorCode::from(s), code);
        }
    }

    #[test]
    fn unknown_error_code_is_preserved() {
        let reply: ErrorReply =
            serde_json::from_value(json!({"ack_id": 2, "code": "E_OVERHEATED", "message": "hot"}))
                .unwrap();
        assert_eq!(reply.code, ErrorCode::Unknown("E_OVERHEATED".into()));
        assert_eq!(reply.code.to_string(), "E_OVERHEATED");
    }

    #[test]
    fn ack_defaults_status_and_reads_fields() {
        let ack: Ack = serde_json::from_value(json!({"ack_id": 9, "t1": 100, "t2": 120})).unwrap();
        assert_eq!(ack.status, "ok");
        assert_eq!(ack.field::<i64>("t1"), Some(100));
        assert_eq!(ack.field::<i64>("t2"), Some(120));
        assert_eq!(ack.field::<i64>("ts"), None);
    }

    #[test]
    fn ack_with_field() {
        let ack = Ack::ok(1).with_field("ts", 42i64);
        assert_eq!(ack.field::<i64>("ts"), Some(42));
    }

    // ===== Events =====

    #[test]
    fn preview_frame_event() {
        let frame = PreviewFrame::from_jpeg("dev-1", &[0xff, 0xd8, 0xff], 55);
        let event = Event::new(PreviewFrame::NAME, &frame).unwrap();
        assert_eq!(event.name, "preview_frame");
        let back: PreviewFrame = event.payload_as().unwrap();
        assert_eq!(back.jpeg().unwrap(), vec![0xff, 0xd8, 0xff]);
        assert_eq!(back.ts, 55);
    }

    #[test]
    fn capabilities_tolerates_missing_optionals() {
        let caps: Capabilities = serde_json::from_value(json!({
            "device_id": "d1",
            "device_model": "Pixel 7",
            "has_gsr": true,
            "firmware": "x"
        }))
        .unwrap();
        assert!(caps.has_gsr);
        assert!(!caps.has_rgb);
        assert!(caps.cameras.is_empty());
        assert_eq!(caps.android_sdk, None);
    }

    // ===== Transfer header =====

    #[test]
    fn transfer_header_line() {
        let header = TransferHeader {
            session_id: "s1".into(),
            filename: "s1_dev.zip".into(),
            device_id: "dev".into(),
            size: None,
        };
        let line = header.to_line().unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');
        assert!(!String::from_utf8_lossy(&line).contains("size"));
        assert_eq!(TransferHeader::from_line(&line).unwrap(), header);
    }

    #[test]
    fn transfer_header_defaults_device_id() {
        let header = TransferHeader::from_line(b"{\"session_id\":\"s\",\"filename\":\"f.zip\"}\r\n")
            .unwrap();
        assert_eq!(header.device_id, "unknown_device");
    }
}
