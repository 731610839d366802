use std::fmt;

use derive_more::{Display, From, Into};
use serde::Serialize;

use crate::error::ValidationError;
use crate::protocol::{TransportKind, opcode};

use super::update::UpdatePayload;

const MIN_BRIGHTNESS: u8 = 0;
const MAX_BRIGHTNESS: u8 = 100;
const SERVICE_TOOL_SALT: u32 = 0x63F0_7B35;

/// Validated brightness value in the inclusive range `0..=100`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct Brightness(u8);

impl Brightness {
    /// Creates a validated brightness value.
    ///
    /// # Errors
    ///
    /// Returns an error when `value` is outside `0..=100`.
    ///
    /// ```
    /// use te::Brightness;
    ///
    /// let value = Brightness::new(42)?;
    /// assert_eq!(42, value.value());
    /// # Ok::<(), te::ValidationError>(())
    /// ```
    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if !(MIN_BRIGHTNESS..=MAX_BRIGHTNESS).contains(&value) {
            return Err(ValidationError::BrightnessOutOfRange {
                value,
                min: MIN_BRIGHTNESS,
                max: MAX_BRIGHTNESS,
            });
        }

        Ok(Self(value))
    }

    /// Returns the underlying brightness level.
    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

/// GUIDE screen identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, From, Into, Serialize)]
pub struct ScreenId(u16);

/// GUIDE variable identifier, scoped to a screen.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, From, Into, Serialize)]
pub struct VariableId(u16);

/// Value of a GUIDE variable.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VariableValue {
    Int(i32),
    Str(String),
}

impl VariableValue {
    /// Builds a value from optional CLI-style parts, exactly one of which must be set.
    ///
    /// ```
    /// use te::{ValidationError, VariableValue};
    ///
    /// assert_eq!(Ok(VariableValue::Int(20)), VariableValue::from_parts(Some(20), None));
    /// assert_eq!(
    ///     Err(ValidationError::MissingVariableValue),
    ///     VariableValue::from_parts(None, None),
    /// );
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error when neither or both parts are present, or the string embeds NUL.
    pub fn from_parts(int: Option<i32>, string: Option<String>) -> Result<Self, ValidationError> {
        match (int, string) {
            (Some(value), None) => Ok(Self::Int(value)),
            (None, Some(value)) => Self::string(value),
            (None, None) => Err(ValidationError::MissingVariableValue),
            (Some(_), Some(_)) => Err(ValidationError::ConflictingVariableValue),
        }
    }

    /// Builds a string value.
    ///
    /// # Errors
    ///
    /// Returns an error when the string embeds a NUL byte.
    pub fn string(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.contains('\0') {
            return Err(ValidationError::StringContainsNul);
        }
        Ok(Self::Str(value))
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Self::Int(value) => value.to_le_bytes().to_vec(),
            Self::Str(value) => {
                let mut bytes = Vec::with_capacity(value.len() + 1);
                bytes.extend_from_slice(value.as_bytes());
                bytes.push(0);
                bytes
            }
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

/// Which transports a fan-out command reaches.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize)]
pub enum TargetFilter {
    #[display("hid")]
    Hid,
    #[display("can")]
    Can,
    #[default]
    #[display("all")]
    All,
}

impl TargetFilter {
    /// Returns whether devices on `kind` are included.
    #[must_use]
    pub fn includes(self, kind: TransportKind) -> bool {
        match self {
            Self::Hid => kind == TransportKind::Hid,
            Self::Can => kind == TransportKind::Can,
            Self::All => true,
        }
    }

    pub(crate) fn check(self, kind: TransportKind) -> Result<(), ValidationError> {
        if self.includes(kind) {
            return Ok(());
        }
        Err(ValidationError::TargetMismatch {
            kind,
            filter: self.to_string(),
        })
    }
}

/// Flash region an update payload is routed to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize)]
pub enum PayloadKind {
    /// `.tepkg` bundle of bootloader, firmware and project.
    #[display("package")]
    Package,
    #[display("firmware")]
    Firmware,
    #[display("project")]
    Project,
}

impl PayloadKind {
    /// Infers the kind from a file name's extension.
    ///
    /// ```
    /// use te::PayloadKind;
    ///
    /// assert_eq!(Some(PayloadKind::Package), PayloadKind::from_file_name("v2.1.tepkg"));
    /// assert_eq!(Some(PayloadKind::Project), PayloadKind::from_file_name("demo.zip"));
    /// assert_eq!(None, PayloadKind::from_file_name("notes.txt"));
    /// ```
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_stem, extension) = name.rsplit_once('.')?;
        match extension.to_ascii_lowercase().as_str() {
            "tepkg" => Some(Self::Package),
            "zip" => Some(Self::Project),
            "bin" => Some(Self::Firmware),
            _ => None,
        }
    }

    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Package => 0x00,
            Self::Firmware => 0x02,
            Self::Project => 0x03,
        }
    }

    pub(crate) fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Package),
            0x02 => Some(Self::Firmware),
            0x03 => Some(Self::Project),
            _ => None,
        }
    }

    /// Opcode carrying this kind's data chunks.
    pub(crate) fn chunk_opcode(self) -> u8 {
        match self {
            Self::Package | Self::Firmware => opcode::UPDATE_FIRMWARE_CHUNK,
            Self::Project => opcode::UPDATE_PROJECT_CHUNK,
        }
    }
}

/// Operator-level operations against one device or a filtered set of devices.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Restart {
        target: TargetFilter,
        utility: bool,
    },
    Update {
        payload: UpdatePayload,
        target: TargetFilter,
    },
    ScreenGet,
    ScreenSet {
        screen: ScreenId,
    },
    VariableGet {
        screen: ScreenId,
        variable: VariableId,
    },
    VariableSet {
        screen: ScreenId,
        variable: VariableId,
        value: VariableValue,
    },
    BrightnessSet {
        level: Brightness,
        store: bool,
    },
    /// Re-reads versions, hardware id and project info.
    Identify,
}

impl Command {
    /// Short name used in logs and output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Restart { .. } => "restart",
            Self::Update { .. } => "update",
            Self::ScreenGet => "screen_get",
            Self::ScreenSet { .. } => "screen_set",
            Self::VariableGet { .. } => "variable_get",
            Self::VariableSet { .. } => "variable_set",
            Self::BrightnessSet { .. } => "brightness_set",
            Self::Identify => "identify",
        }
    }

    /// The single wire request for commands that are one exchange.
    pub(crate) fn request(&self) -> Option<Request> {
        match self {
            Self::Restart { utility, .. } => Some(Request::Restart { utility: *utility }),
            Self::ScreenGet => Some(Request::ScreenGet),
            Self::ScreenSet { screen } => Some(Request::ScreenSet { screen: *screen }),
            Self::VariableGet { screen, variable } => Some(Request::VariableGet {
                screen: *screen,
                variable: *variable,
            }),
            Self::VariableSet {
                screen,
                variable,
                value,
            } => Some(Request::VariableSet {
                screen: *screen,
                variable: *variable,
                value: value.clone(),
            }),
            Self::BrightnessSet { level, store } => Some(Request::BrightnessSet {
                level: *level,
                store: *store,
            }),
            Self::Update { .. } | Self::Identify => None,
        }
    }
}

/// Security clearance requested during authentication.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Clearance {
    ServiceTool,
}

impl Clearance {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::ServiceTool => 1,
        }
    }

    pub(crate) fn from_raw(value: u8) -> Option<Self> {
        (value == 1).then_some(Self::ServiceTool)
    }
}

/// Computes the service-tool answer to an authentication challenge.
///
/// ```
/// assert_eq!(0x63F0_7B35, te::service_tool_key(0, 0));
/// ```
#[must_use]
pub fn service_tool_key(secret: u32, challenge: u32) -> u32 {
    let mixed = secret
        .wrapping_add(SERVICE_TOOL_SALT)
        .wrapping_add(challenge.wrapping_shl(6))
        .wrapping_add(challenge >> 2);
    challenge ^ mixed
}

/// One wire-level request; every variant maps to exactly one opcode.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Request {
    Restart {
        utility: bool,
    },
    AuthRequest {
        clearance: Clearance,
    },
    AuthResponse {
        key: u32,
    },
    ScreenGet,
    ScreenSet {
        screen: ScreenId,
    },
    VariableGet {
        screen: ScreenId,
        variable: VariableId,
    },
    VariableSet {
        screen: ScreenId,
        variable: VariableId,
        value: VariableValue,
    },
    BrightnessSet {
        level: Brightness,
        store: bool,
    },
    GetVersion,
    GetHardwareId,
    GetProjectInfo,
    UpdateBegin {
        kind: PayloadKind,
        total: u32,
    },
    UpdateChunk {
        kind: PayloadKind,
        offset: u32,
        data: Vec<u8>,
    },
}

impl Request {
    /// Opcode of the request.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Restart { utility: false } => opcode::RESTART,
            Self::Restart { utility: true } => opcode::RESTART_UTILITY,
            Self::AuthRequest { .. } => opcode::AUTH_REQUEST,
            Self::AuthResponse { .. } => opcode::AUTH_RESPONSE,
            Self::ScreenGet | Self::VariableGet { .. } => opcode::GUIDE_GET,
            Self::ScreenSet { .. } | Self::VariableSet { .. } => opcode::GUIDE_SET,
            Self::BrightnessSet { .. } => opcode::BRIGHTNESS,
            Self::GetVersion => opcode::GET_VERSION,
            Self::GetHardwareId => opcode::GET_HARDWARE_ID,
            Self::GetProjectInfo => opcode::GET_PROJECT_INFO,
            Self::UpdateBegin { .. } => opcode::UPDATE_BEGIN,
            Self::UpdateChunk { kind, .. } => kind.chunk_opcode(),
        }
    }
}
