//! The message abstraction (§3), its concrete payload catalogue, and the
//! typed message registry (§4.1).
//!
//! Wire format is CBOR of a flat object whose first field is `"MessageType"`
//! (and, when fixed for the type, `"MessageVersion"`); JSON is an equivalent
//! alternative form for human-facing tooling (`to_json`/`from_json`).
//! Concrete payload shapes beyond the wire contract are out of scope per
//! §1, but the shapes below are needed to exercise every socket primitive
//! and service end to end, so they are filled in from
//! `original_source/src/messageFormats` and `original_source/src/broadcasts`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding a message.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The wire bytes were not valid CBOR, or a required field was absent.
    #[error("failed to decode message: {0}")]
    DecodeFailure(String),

    /// The `"MessageType"` tag did not match the type being decoded into.
    #[error("expected MessageType {expected}, got {actual}")]
    TypeMismatch {
        /// The type name the caller expected.
        expected: &'static str,
        /// The type name actually present on the wire.
        actual: String,
    },

    /// `MessageRegistry::get` was asked for a type name it has no
    /// prototype for.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// `MessageRegistry::add` was asked to register a different concrete
    /// type under a name that already maps to another concrete type.
    #[error("type name {0} is already registered to a different message type")]
    ConflictingRegistration(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "MessageType")]
    message_type: String,
    #[serde(rename = "MessageVersion", skip_serializing_if = "Option::is_none")]
    message_version: Option<String>,
    #[serde(flatten)]
    payload: T,
}

#[derive(Deserialize)]
struct TypeTagOnly {
    #[serde(rename = "MessageType")]
    message_type: String,
}

/// Peek the `"MessageType"` tag out of an encoded frame without decoding the
/// rest of the payload. Used by subscribers/routers to look up the right
/// prototype in the [`MessageRegistry`] before committing to a concrete
/// decode.
///
/// # Errors
///
/// Returns an error if `bytes` is not valid CBOR or lacks the tag.
pub fn peek_type_name(bytes: &[u8]) -> Result<String, MessageError> {
    let tag: TypeTagOnly =
        ciborium::de::from_reader(bytes).map_err(|e| MessageError::DecodeFailure(e.to_string()))?;
    Ok(tag.message_type)
}

/// A typed, versioned application message with total encode/decode
/// operations (§3).
pub trait Message: Sized + Clone + Serialize + DeserializeOwned {
    /// Globally unique wire identifier, e.g.
    /// `"UMPS::Services::Command::CommandRequest"`.
    const TYPE_NAME: &'static str;

    /// Fixed semver string for this type, if the type carries one on the
    /// wire. Preserved on decode but never rejects a mismatch (design
    /// note, §9): a warning is logged instead.
    const VERSION: Option<&'static str> = None;

    /// Encode to the CBOR wire form, tagged with `MessageType` (and
    /// `MessageVersion`, if fixed) as the first field.
    ///
    /// # Errors
    ///
    /// Returns an error if CBOR encoding fails (should not happen for any
    /// type in this module).
    fn to_wire(&self) -> Result<Vec<u8>, MessageError> {
        let envelope = Envelope {
            message_type: Self::TYPE_NAME.to_string(),
            message_version: Self::VERSION.map(str::to_string),
            payload: self.clone(),
        };
        let mut out = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut out)
            .map_err(|e| MessageError::DecodeFailure(e.to_string()))?;
        Ok(out)
    }

    /// Decode from the CBOR wire form, verifying the `MessageType` tag
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::TypeMismatch`] if the tag does not match
    /// `Self::TYPE_NAME`, or [`MessageError::DecodeFailure`] if the bytes
    /// are malformed.
    fn from_wire(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Envelope<Self> =
            ciborium::de::from_reader(bytes).map_err(|e| MessageError::DecodeFailure(e.to_string()))?;
        if envelope.message_type != Self::TYPE_NAME {
            return Err(MessageError::TypeMismatch {
                expected: Self::TYPE_NAME,
                actual: envelope.message_type,
            });
        }
        if let (Some(expected), Some(actual)) = (Self::VERSION, envelope.message_version.as_deref())
        {
            if expected != actual {
                tracing::warn!(
                    type_name = Self::TYPE_NAME,
                    expected,
                    actual,
                    "MessageVersion mismatch; decoding anyway"
                );
            }
        }
        Ok(envelope.payload)
    }

    /// JSON alternative form, for human-facing tooling (§3). Uses the same
    /// envelope shape so `"MessageType"` still appears first.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    fn to_json(&self) -> Result<String, MessageError> {
        let envelope = Envelope {
            message_type: Self::TYPE_NAME.to_string(),
            message_version: Self::VERSION.map(str::to_string),
            payload: self.clone(),
        };
        serde_json::to_string(&envelope).map_err(|e| MessageError::DecodeFailure(e.to_string()))
    }
}

macro_rules! message_type {
    ($ty:ty, $name:literal) => {
        impl Message for $ty {
            const TYPE_NAME: &'static str = $name;
        }
    };
    ($ty:ty, $name:literal, $version:literal) => {
        impl Message for $ty {
            const TYPE_NAME: &'static str = $name;
            const VERSION: Option<&'static str> = Some($version);
        }
    };
}

/// Seismic phase polarity, as observed by a picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    /// First motion up.
    Up,
    /// First motion down.
    Down,
    /// Polarity not determined.
    Unknown,
}

/// A phase pick produced by a picker/detector module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    /// Seismic network code.
    pub network: String,
    /// Station code.
    pub station: String,
    /// Channel code.
    pub channel: String,
    /// Location code.
    pub location_code: String,
    /// Phase hint (e.g. "P", "S"), if known.
    pub phase_hint: Option<String>,
    /// Pick time.
    pub time: DateTime<Utc>,
    /// First-motion polarity.
    pub polarity: Polarity,
    /// Picking algorithm identifier, if known.
    pub algorithm: Option<String>,
}
message_type!(Pick, "UMPS::MessageFormats::Pick", "1.0.0");

/// A window of waveform samples from one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Seismic network code.
    pub network: String,
    /// Station code.
    pub station: String,
    /// Channel code.
    pub channel: String,
    /// Location code.
    pub location_code: String,
    /// Time of the first sample.
    pub start_time: DateTime<Utc>,
    /// Sampling rate in Hz.
    pub sampling_rate_hz: f64,
    /// Raw integer samples.
    pub samples: Vec<i32>,
}
message_type!(DataPacket, "UMPS::Broadcasts::DataPacket", "1.0.0");

impl DataPacket {
    /// The `(network, station, channel, location_code)` key used by the
    /// packet cache service (§4.9) to bucket replay windows.
    pub fn sensor_key(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.channel, self.location_code
        )
    }
}

/// Module liveness status carried on a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatStatus {
    /// Module is alive and operating normally.
    Alive,
    /// Module is alive but degraded.
    Degraded,
}

/// A periodic liveness announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Current status.
    pub status: HeartbeatStatus,
    /// Hostname that produced this heartbeat.
    pub host: String,
    /// Time the heartbeat was issued.
    pub issued_at: DateTime<Utc>,
}
message_type!(Heartbeat, "UMPS::Broadcasts::Heartbeat");

/// The universal error-reply payload (§7): a callback failure is caught and
/// turned into one of these rather than propagated past the worker task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable details of what went wrong.
    pub details: String,
}
message_type!(Failure, "UMPS::MessageFormats::Failure");

impl Failure {
    /// Build a failure payload from any displayable error.
    pub fn from_error(error: impl std::fmt::Display) -> Self {
        Self {
            details: error.to_string(),
        }
    }
}

/// Connection type a directory entry describes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// An xpub/xsub broadcast.
    Broadcast,
    /// A router/dealer service.
    Service,
    /// Neither (e.g. the operator's own directory endpoint).
    Other,
}

/// Return codes shared by the directory and module-command subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnCode {
    /// The operation completed successfully.
    Success,
    /// The request could not be parsed or failed validation.
    InvalidMessage,
    /// The request parsed but the operation itself failed.
    AlgorithmFailure,
}

/// A registration wire message sent by a broadcast/service to the operator
/// at startup (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// The details being registered.
    pub connection_details: crate::directory::ConnectionDetails,
}
message_type!(
    RegistrationRequest,
    "UMPS::Services::ConnectionInformation::RegistrationRequest"
);

/// Reply to a [`RegistrationRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    /// Whether the registration succeeded.
    pub return_code: ReturnCode,
}
message_type!(
    RegistrationResponse,
    "UMPS::Services::ConnectionInformation::RegistrationResponse"
);

/// Request the full connection catalogue from the operator (§4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableConnectionsRequest {}
message_type!(
    AvailableConnectionsRequest,
    "UMPS::Services::ConnectionInformation::AvailableConnectionsRequest"
);

/// Reply carrying the full connection catalogue (callers filter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableConnectionsResponse {
    /// Every registered connection.
    pub details: Vec<crate::directory::ConnectionDetails>,
    /// Whether the lookup succeeded.
    pub code: ReturnCode,
}
message_type!(
    AvailableConnectionsResponse,
    "UMPS::Services::ConnectionInformation::AvailableConnectionsResponse"
);

/// Request the process table's contents (module-command subsystem).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableModulesRequest {}
message_type!(
    AvailableModulesRequest,
    "UMPS::Services::Command::AvailableModulesRequest"
);

/// Reply carrying every row of the process table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableModulesResponse {
    /// Every module the process table currently has a row for.
    pub modules: Vec<crate::command::LocalModuleDetails>,
}
message_type!(
    AvailableModulesResponse,
    "UMPS::Services::Command::AvailableModulesResponse"
);

/// Ask a running `LocalService` for its static help text (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableCommandsRequest {}
message_type!(
    AvailableCommandsRequest,
    "UMPS::Services::Command::AvailableCommandsRequest"
);

/// Reply carrying the module's static help text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableCommandsResponse {
    /// Help text supplied at `LocalService` construction.
    pub help_text: String,
}
message_type!(
    AvailableCommandsResponse,
    "UMPS::Services::Command::AvailableCommandsResponse"
);

/// A module-specific command line, passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// The literal command text.
    pub command: String,
}
message_type!(CommandRequest, "UMPS::Services::Command::CommandRequest");

/// Reply to a [`CommandRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Module-specific response text.
    pub response: String,
    /// Outcome of processing the command.
    pub return_code: crate::command::CommandReturnCode,
}
message_type!(CommandResponse, "UMPS::Services::Command::CommandResponse");

/// Ask a `LocalService` to shut down after replying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminateRequest {}
message_type!(
    TerminateRequest,
    "UMPS::Services::Command::TerminateRequest"
);

/// Reply to a [`TerminateRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateResponse {
    /// Outcome of scheduling the shutdown.
    pub return_code: crate::command::CommandReturnCode,
}
message_type!(
    TerminateResponse,
    "UMPS::Services::Command::TerminateResponse"
);

/// A provisioned-user wire message, used when credentials are exchanged or
/// synced out of band (e.g. by an administrative tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    /// Username.
    pub name: String,
    /// Contact email.
    pub email: Option<String>,
    /// Argon2 PHC hash, if this user authenticates via PLAIN.
    pub hashed_password: Option<String>,
    /// Z85-encoded public key, if this user authenticates via CURVE.
    pub public_key: Option<String>,
    /// Minimum privilege level.
    pub privileges: crate::credentials::Privilege,
}
message_type!(
    UserMessage,
    "UMPS::Messaging::Authentication::User"
);

/// A request to the counter service (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterRequest {
    /// The counter item name.
    pub item: String,
    /// Increment to apply on first creation; ignored if the item exists.
    pub increment: Option<i32>,
    /// Initial value on first creation; ignored if the item exists.
    pub initial_value: Option<i64>,
}
message_type!(
    CounterRequest,
    "UMPS::ProxyServices::Incrementer::CounterRequest"
);

/// Reply to a [`CounterRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterResponse {
    /// The counter's new value after incrementing.
    pub value: i64,
}
message_type!(
    CounterResponse,
    "UMPS::ProxyServices::Incrementer::CounterResponse"
);

/// A request to the packet cache service (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequest {
    /// The `(network, station, channel, location_code)` key.
    pub sensor_key: String,
    /// Start of the requested window, inclusive.
    pub start_time: DateTime<Utc>,
    /// End of the requested window, inclusive.
    pub end_time: DateTime<Utc>,
}
message_type!(
    DataRequest,
    "UMPS::ProxyServices::PacketCache::DataRequest"
);

/// Reply to a [`DataRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResponse {
    /// Packets within the requested window, oldest first.
    pub packets: Vec<DataPacket>,
}
message_type!(
    DataResponse,
    "UMPS::ProxyServices::PacketCache::DataResponse"
);

/// The closed set of concrete messages this crate knows how to produce,
/// plus an `Opaque` escape hatch for wire types with no registered
/// prototype (design note, §9). The message registry is the single source
/// of truth for which variants a given socket can produce.
#[derive(Debug, Clone)]
pub enum AnyMessage {
    /// See [`Pick`].
    Pick(Pick),
    /// See [`DataPacket`].
    DataPacket(DataPacket),
    /// See [`Heartbeat`].
    Heartbeat(Heartbeat),
    /// See [`Failure`].
    Failure(Failure),
    /// See [`UserMessage`].
    User(UserMessage),
    /// See [`RegistrationRequest`].
    RegistrationRequest(RegistrationRequest),
    /// See [`RegistrationResponse`].
    RegistrationResponse(RegistrationResponse),
    /// See [`AvailableConnectionsRequest`].
    AvailableConnectionsRequest(AvailableConnectionsRequest),
    /// See [`AvailableConnectionsResponse`].
    AvailableConnectionsResponse(AvailableConnectionsResponse),
    /// See [`AvailableModulesRequest`].
    AvailableModulesRequest(AvailableModulesRequest),
    /// See [`AvailableModulesResponse`].
    AvailableModulesResponse(AvailableModulesResponse),
    /// See [`AvailableCommandsRequest`].
    AvailableCommandsRequest(AvailableCommandsRequest),
    /// See [`AvailableCommandsResponse`].
    AvailableCommandsResponse(AvailableCommandsResponse),
    /// See [`CommandRequest`].
    CommandRequest(CommandRequest),
    /// See [`CommandResponse`].
    CommandResponse(CommandResponse),
    /// See [`TerminateRequest`].
    TerminateRequest(TerminateRequest),
    /// See [`TerminateResponse`].
    TerminateResponse(TerminateResponse),
    /// See [`CounterRequest`].
    CounterRequest(CounterRequest),
    /// See [`CounterResponse`].
    CounterResponse(CounterResponse),
    /// See [`DataRequest`].
    DataRequest(DataRequest),
    /// See [`DataResponse`].
    DataResponse(DataResponse),
    /// A wire type with no registered prototype: the tag and raw payload
    /// are preserved unchanged.
    Opaque(String, Vec<u8>),
}

impl AnyMessage {
    /// The wire `MessageType` tag for this variant.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Pick(_) => Pick::TYPE_NAME,
            Self::DataPacket(_) => DataPacket::TYPE_NAME,
            Self::Heartbeat(_) => Heartbeat::TYPE_NAME,
            Self::Failure(_) => Failure::TYPE_NAME,
            Self::User(_) => UserMessage::TYPE_NAME,
            Self::RegistrationRequest(_) => RegistrationRequest::TYPE_NAME,
            Self::RegistrationResponse(_) => RegistrationResponse::TYPE_NAME,
            Self::AvailableConnectionsRequest(_) => AvailableConnectionsRequest::TYPE_NAME,
            Self::AvailableConnectionsResponse(_) => AvailableConnectionsResponse::TYPE_NAME,
            Self::AvailableModulesRequest(_) => AvailableModulesRequest::TYPE_NAME,
            Self::AvailableModulesResponse(_) => AvailableModulesResponse::TYPE_NAME,
            Self::AvailableCommandsRequest(_) => AvailableCommandsRequest::TYPE_NAME,
            Self::AvailableCommandsResponse(_) => AvailableCommandsResponse::TYPE_NAME,
            Self::CommandRequest(_) => CommandRequest::TYPE_NAME,
            Self::CommandResponse(_) => CommandResponse::TYPE_NAME,
            Self::TerminateRequest(_) => TerminateRequest::TYPE_NAME,
            Self::TerminateResponse(_) => TerminateResponse::TYPE_NAME,
            Self::CounterRequest(_) => CounterRequest::TYPE_NAME,
            Self::CounterResponse(_) => CounterResponse::TYPE_NAME,
            Self::DataRequest(_) => DataRequest::TYPE_NAME,
            Self::DataResponse(_) => DataResponse::TYPE_NAME,
            Self::Opaque(name, _) => name,
        }
    }

    /// Encode back to wire bytes, re-tagging concrete variants and passing
    /// `Opaque` bytes through untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding a concrete variant fails.
    pub fn to_wire(&self) -> Result<Vec<u8>, MessageError> {
        match self {
            Self::Pick(m) => m.to_wire(),
            Self::DataPacket(m) => m.to_wire(),
            Self::Heartbeat(m) => m.to_wire(),
            Self::Failure(m) => m.to_wire(),
            Self::User(m) => m.to_wire(),
            Self::RegistrationRequest(m) => m.to_wire(),
            Self::RegistrationResponse(m) => m.to_wire(),
            Self::AvailableConnectionsRequest(m) => m.to_wire(),
            Self::AvailableConnectionsResponse(m) => m.to_wire(),
            Self::AvailableModulesRequest(m) => m.to_wire(),
            Self::AvailableModulesResponse(m) => m.to_wire(),
            Self::AvailableCommandsRequest(m) => m.to_wire(),
            Self::AvailableCommandsResponse(m) => m.to_wire(),
            Self::CommandRequest(m) => m.to_wire(),
            Self::CommandResponse(m) => m.to_wire(),
            Self::TerminateRequest(m) => m.to_wire(),
            Self::TerminateResponse(m) => m.to_wire(),
            Self::CounterRequest(m) => m.to_wire(),
            Self::CounterResponse(m) => m.to_wire(),
            Self::DataRequest(m) => m.to_wire(),
            Self::DataResponse(m) => m.to_wire(),
            Self::Opaque(_, bytes) => Ok(bytes.clone()),
        }
    }
}

type Decoder = fn(&[u8]) -> Result<AnyMessage, MessageError>;

/// Ordered mapping from wire `type_name` to a decode function for that
/// concrete type (§4.1). Insertion order is preserved so diagnostic
/// enumeration (`type_names`) is deterministic.
pub struct MessageRegistry {
    order: Vec<String>,
    decoders: std::collections::HashMap<String, Decoder>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            decoders: std::collections::HashMap::new(),
        }
    }

    /// A registry pre-populated with every concrete type this crate ships.
    pub fn with_builtin_types() -> Self {
        let mut registry = Self::new();
        registry.add::<Pick>(|b| Pick::from_wire(b).map(AnyMessage::Pick));
        registry.add::<DataPacket>(|b| DataPacket::from_wire(b).map(AnyMessage::DataPacket));
        registry.add::<Heartbeat>(|b| Heartbeat::from_wire(b).map(AnyMessage::Heartbeat));
        registry.add::<Failure>(|b| Failure::from_wire(b).map(AnyMessage::Failure));
        registry.add::<UserMessage>(|b| UserMessage::from_wire(b).map(AnyMessage::User));
        registry.add::<RegistrationRequest>(|b| {
            RegistrationRequest::from_wire(b).map(AnyMessage::RegistrationRequest)
        });
        registry.add::<RegistrationResponse>(|b| {
            RegistrationResponse::from_wire(b).map(AnyMessage::RegistrationResponse)
        });
        registry.add::<AvailableConnectionsRequest>(|b| {
            AvailableConnectionsRequest::from_wire(b).map(AnyMessage::AvailableConnectionsRequest)
        });
        registry.add::<AvailableConnectionsResponse>(|b| {
            AvailableConnectionsResponse::from_wire(b)
                .map(AnyMessage::AvailableConnectionsResponse)
        });
        registry.add::<AvailableModulesRequest>(|b| {
            AvailableModulesRequest::from_wire(b).map(AnyMessage::AvailableModulesRequest)
        });
        registry.add::<AvailableModulesResponse>(|b| {
            AvailableModulesResponse::from_wire(b).map(AnyMessage::AvailableModulesResponse)
        });
        registry.add::<AvailableCommandsRequest>(|b| {
            AvailableCommandsRequest::from_wire(b).map(AnyMessage::AvailableCommandsRequest)
        });
        registry.add::<AvailableCommandsResponse>(|b| {
            AvailableCommandsResponse::from_wire(b).map(AnyMessage::AvailableCommandsResponse)
        });
        registry
            .add::<CommandRequest>(|b| CommandRequest::from_wire(b).map(AnyMessage::CommandRequest));
        registry.add::<CommandResponse>(|b| {
            CommandResponse::from_wire(b).map(AnyMessage::CommandResponse)
        });
        registry.add::<TerminateRequest>(|b| {
            TerminateRequest::from_wire(b).map(AnyMessage::TerminateRequest)
        });
        registry.add::<TerminateResponse>(|b| {
            TerminateResponse::from_wire(b).map(AnyMessage::TerminateResponse)
        });
        registry
            .add::<CounterRequest>(|b| CounterRequest::from_wire(b).map(AnyMessage::CounterRequest));
        registry.add::<CounterResponse>(|b| {
            CounterResponse::from_wire(b).map(AnyMessage::CounterResponse)
        });
        registry.add::<DataRequest>(|b| DataRequest::from_wire(b).map(AnyMessage::DataRequest));
        registry.add::<DataResponse>(|b| DataResponse::from_wire(b).map(AnyMessage::DataResponse));
        registry
    }

    /// Register a concrete type's decoder under `T::TYPE_NAME`. Re-adding
    /// the same type under the same name is a no-op (idempotent); adding a
    /// different decoder under a name already registered is a conflict.
    ///
    /// # Errors
    ///
    /// This inherent method cannot itself detect cross-type conflicts
    /// (decoders are opaque function pointers); use
    /// [`MessageRegistry::add_checked`] when that distinction matters.
    pub fn add<T: Message>(&mut self, decode: Decoder) {
        let name = T::TYPE_NAME.to_string();
        if !self.decoders.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.decoders.insert(name, decode);
    }

    /// Like [`MessageRegistry::add`], but errors instead of silently
    /// overwriting when `type_name` is already registered to a different
    /// decoder.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::ConflictingRegistration`] if `type_name` is
    /// already registered to a different function pointer.
    pub fn add_checked(&mut self, type_name: &str, decode: Decoder) -> Result<(), MessageError> {
        match self.decoders.get(type_name) {
            Some(existing) if std::ptr::fn_addr_eq(*existing, decode) => Ok(()),
            Some(_) => Err(MessageError::ConflictingRegistration(type_name.to_string())),
            None => {
                self.order.push(type_name.to_string());
                self.decoders.insert(type_name.to_string(), decode);
                Ok(())
            }
        }
    }

    /// Whether a prototype is registered under this name.
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Decode `bytes` using the prototype registered for its `MessageType`
    /// tag.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnknownMessageType`] if no prototype is
    /// registered for the tag on the wire.
    pub fn get(&self, bytes: &[u8]) -> Result<AnyMessage, MessageError> {
        let type_name = peek_type_name(bytes)?;
        let decode = self
            .decoders
            .get(&type_name)
            .ok_or(MessageError::UnknownMessageType(type_name))?;
        decode(bytes)
    }

    /// Type names in insertion order, for deterministic diagnostic
    /// enumeration.
    pub fn type_names(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn heartbeat_round_trips_through_cbor() {
        let hb = Heartbeat {
            status: HeartbeatStatus::Alive,
            host: "h1".to_string(),
            issued_at: Utc::now(),
        };
        let bytes = hb.to_wire().unwrap();
        let decoded = Heartbeat::from_wire(&bytes).unwrap();
        assert_eq!(hb, decoded);
    }

    #[test]
    fn decode_rejects_wrong_message_type() {
        let hb = Heartbeat {
            status: HeartbeatStatus::Alive,
            host: "h1".to_string(),
            issued_at: Utc::now(),
        };
        let bytes = hb.to_wire().unwrap();
        let err = Failure::from_wire(&bytes).unwrap_err();
        assert!(matches!(err, MessageError::TypeMismatch { .. }));
    }

    #[test]
    fn message_type_is_first_discoverable_field_in_json() {
        let failure = Failure {
            details: "boom".to_string(),
        };
        let json = failure.to_json().unwrap();
        let first_key_pos = json.find("MessageType").unwrap();
        let details_pos = json.find("details").unwrap();
        assert!(first_key_pos < details_pos);
    }

    #[test]
    fn registry_is_idempotent_for_same_type_and_deterministic_in_order() {
        let mut registry = MessageRegistry::new();
        registry.add::<Heartbeat>(|b| Heartbeat::from_wire(b).map(AnyMessage::Heartbeat));
        registry.add::<Failure>(|b| Failure::from_wire(b).map(AnyMessage::Failure));
        registry.add::<Heartbeat>(|b| Heartbeat::from_wire(b).map(AnyMessage::Heartbeat));

        assert_eq!(
            registry.type_names(),
            &[Heartbeat::TYPE_NAME.to_string(), Failure::TYPE_NAME.to_string()]
        );
    }

    #[test]
    fn registry_decodes_through_any_message() {
        let registry = MessageRegistry::with_builtin_types();
        let hb = Heartbeat {
            status: HeartbeatStatus::Degraded,
            host: "h2".to_string(),
            issued_at: Utc::now(),
        };
        let bytes = hb.to_wire().unwrap();
        let decoded = registry.get(&bytes).unwrap();
        assert!(matches!(decoded, AnyMessage::Heartbeat(inner) if inner == hb));
    }

    #[test]
    fn unregistered_type_fails_with_unknown_message_type() {
        let registry = MessageRegistry::new();
        let failure = Failure {
            details: "x".to_string(),
        };
        let bytes = failure.to_wire().unwrap();
        assert!(matches!(
            registry.get(&bytes),
            Err(MessageError::UnknownMessageType(_))
        ));
    }

    proptest! {
        #[test]
        fn heartbeat_round_trips_for_arbitrary_host_and_status(
            host in "[a-zA-Z0-9_.-]{1,32}",
            alive in any::<bool>(),
            timestamp_secs in 0i64..4_102_444_800,
        ) {
            let status = if alive { HeartbeatStatus::Alive } else { HeartbeatStatus::Degraded };
            let issued_at = Utc.timestamp_opt(timestamp_secs, 0).single().unwrap();
            let hb = Heartbeat { status, host, issued_at };

            let bytes = hb.to_wire().unwrap();
            let decoded = Heartbeat::from_wire(&bytes).unwrap();
            prop_assert_eq!(hb, decoded);
        }

        #[test]
        fn failure_round_trips_for_arbitrary_details(details in ".{0,200}") {
            let failure = Failure { details };

            let bytes = failure.to_wire().unwrap();
            let decoded = Failure::from_wire(&bytes).unwrap();
            prop_assert_eq!(failure, decoded);
        }
    }
}
