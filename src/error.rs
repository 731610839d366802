use std::time::Duration;

use derive_more::From;
use thiserror::Error;

use crate::protocol::TransportKind;

/// Errors raised by the physical links.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The interface or device could not be claimed.
    #[error("transport `{address}` is unavailable: {reason}")]
    Unavailable { address: String, reason: String },
    /// An I/O failure occurred mid-exchange.
    #[error("link I/O failed on `{address}`")]
    Link {
        address: String,
        #[source]
        source: std::io::Error,
    },
    /// The underlying HID library reported an error.
    #[error("HID operation failed on `{address}`: {message}")]
    Hid { address: String, message: String },
    /// Nothing arrived within the deadline.
    #[error("no data within {}", humantime::format_duration(*timeout))]
    TimedOut { timeout: Duration },
    /// Another node with a higher-priority NAME holds the tool's address.
    #[error("J1939 address 0x{address:02X} on `{interface}` was claimed by another node")]
    AddressClaimLost { interface: String, address: u8 },
    /// The remote end aborted a J1939 transport-protocol session.
    #[error("J1939 transport session aborted by 0x{peer:02X} (reason {reason})")]
    SessionAborted { peer: u8, reason: u8 },
    /// The message does not fit the link.
    #[error("message of {len} bytes exceeds the link limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    /// The link was closed.
    #[error("transport `{address}` is closed")]
    Closed { address: String },
}

impl TransportError {
    /// Returns whether the retry policy may resend after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TimedOut { .. } | Self::Link { .. } | Self::Hid { .. } | Self::SessionAborted { .. }
        )
    }
}

/// Errors raised while encoding or decoding codec frames.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CodecError {
    /// The frame sequence or a frame's structure is invalid.
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },
    /// The opcode is not part of the protocol.
    #[error("unknown opcode 0x{opcode:02X}")]
    UnknownOpcode { opcode: u8 },
    /// The payload length does not match the opcode's shape.
    #[error("opcode 0x{opcode:02X} expects {expected} payload bytes, got {actual}")]
    LengthMismatch {
        opcode: u8,
        expected: String,
        actual: usize,
    },
    /// A message would need more frames than the control byte can index.
    #[error("message of {len} bytes needs more than {max_frames} frames")]
    TooManyFrames { len: usize, max_frames: usize },
    /// The transport frame limit leaves no room for payload.
    #[error("frame limit of {max_frame_len} bytes cannot carry a payload")]
    FrameLimitTooSmall { max_frame_len: usize },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Errors raised when a command is rejected before any I/O.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ValidationError {
    /// Brightness outside `0..=100`.
    #[error("brightness {value} is out of range ({min}..={max})")]
    BrightnessOutOfRange { value: u8, min: u8, max: u8 },
    /// A variable set carried neither an integer nor a string value.
    #[error("a variable set needs either an integer or a string value")]
    MissingVariableValue,
    /// A variable set carried both value kinds.
    #[error("a variable set takes an integer or a string value, not both")]
    ConflictingVariableValue,
    /// String variable values cannot embed NUL bytes.
    #[error("string variable values cannot contain NUL bytes")]
    StringContainsNul,
    /// The command's target filter excludes the device.
    #[error("device on {kind} is excluded by target filter `{filter}`")]
    TargetMismatch { kind: TransportKind, filter: String },
    /// Update payloads must not be empty.
    #[error("update payload is empty")]
    EmptyPayload,
    /// Update payloads are limited by the 32-bit length field.
    #[error("update payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    /// The declared length disagrees with the byte source.
    #[error("update payload declares {declared} bytes but provides {actual}")]
    PayloadLengthMismatch { declared: usize, actual: usize },
    /// The update kind could not be determined.
    #[error("cannot infer the update kind of `{name}`; pass an explicit kind")]
    UnknownPayloadKind { name: String },
}

/// Errors raised by the command session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The retry budget was exhausted without a usable response.
    #[error("device {device} did not respond after {attempts} attempt(s)")]
    Unresponsive { device: String, attempts: u32 },
    /// The handle belongs to an earlier discovery run.
    #[error("device handle {device} is stale; run discovery again")]
    StaleHandle { device: String },
    /// The device negatively acknowledged the command.
    #[error("device {device} rejected opcode 0x{opcode:02X} ({code})")]
    Rejected {
        device: String,
        opcode: u8,
        code: crate::protocol::AckCode,
    },
    /// The device requires authentication for this command.
    #[error("device {device} denied access to opcode 0x{opcode:02X}")]
    AccessDenied { device: String, opcode: u8 },
    /// The authentication handshake did not complete.
    #[error("authentication with device {device} failed: {reason}")]
    AuthenticationFailed { device: String, reason: String },
    /// A decodable response of the wrong kind arrived.
    #[error("device {device} answered with an unexpected {response}")]
    UnexpectedResponse { device: String, response: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl SessionError {
    /// Returns whether the failure happened before any frame was sent.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Errors raised by the update transfer.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The acknowledged offset disagrees with what was sent, after the retransmission budget.
    #[error("update desynchronised: expected ack for offset {expected}, device reported {reported}")]
    Desync { expected: u64, reported: u64 },
    /// The device refused the update request.
    #[error("device {device} rejected the update request")]
    Rejected { device: String },
    /// The device is busy with another update.
    #[error("device {device} is busy")]
    Busy { device: String },
    /// The device reported an upload error.
    #[error("device {device} reported upload error {code}")]
    UploadFailed { device: String, code: u8 },
    /// The device finished the update with a failure status.
    #[error("device {device} finished the update with status {status}")]
    DeviceFailure { device: String, status: String },
    /// The transfer was interrupted and must be restarted from offset zero.
    #[error("update aborted after {acknowledged} of {total} bytes")]
    Aborted {
        acknowledged: u64,
        total: u64,
        #[source]
        source: Box<SessionError>,
    },
    /// The transfer already reached a terminal state.
    #[error("the update of {device} has already ended")]
    Ended { device: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors raised by device discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Not a single configured transport could be opened.
    #[error("no transport could be opened ({attempted} attempted)")]
    NoTransportAvailable {
        attempted: usize,
        #[source]
        last: Option<TransportError>,
    },
}

/// Errors returned when parsing fake device fixtures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FixtureError {
    #[error("the fake device fixture is empty")]
    EmptyFixture,
    #[error("fixture record `{record}` must look like `usb:<serial>` or `<iface>:<address>`")]
    InvalidRecord { record: String },
    #[error("fixture address `{value}` is not a valid J1939 address")]
    InvalidAddress { value: String },
    #[error("fixture option `{option}` is not recognised")]
    UnknownOption { option: String },
    #[error("fixture option `{option}` has an invalid value `{value}`")]
    InvalidOptionValue { option: String, value: String },
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing --fake-devices fixture while fake mode is enabled")]
    MissingFakeDevices,
    #[error("no device at index {index}; {available} device(s) discovered")]
    NoSuchDevice { index: usize, available: usize },
    #[error("no Touch Encoder devices were found")]
    NoDevices,
    #[error("failed to read update file `{path}`")]
    ReadPayload {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level errors wrapping component-specific error types.
#[derive(Debug, Error, From)]
pub enum TeError {
    #[error(transparent)]
    #[from(TransportError, Box<TransportError>)]
    Transport(Box<TransportError>),
    #[error(transparent)]
    #[from(CodecError, Box<CodecError>)]
    Codec(Box<CodecError>),
    #[error(transparent)]
    #[from(ValidationError, Box<ValidationError>)]
    Validation(Box<ValidationError>),
    #[error(transparent)]
    #[from(SessionError, Box<SessionError>)]
    Session(Box<SessionError>),
    #[error(transparent)]
    #[from(UpdateError, Box<UpdateError>)]
    Update(Box<UpdateError>),
    #[error(transparent)]
    #[from(DiscoveryError, Box<DiscoveryError>)]
    Discovery(Box<DiscoveryError>),
}
