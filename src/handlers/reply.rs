use std::fmt;
use std::str::FromStr;

use derive_more::Display;
use serde::Serialize;
use serde_with::SerializeDisplay;

use crate::protocol::{AckCode, HardwareId, opcode};

use super::command::{Request, ScreenId, VariableId, VariableValue};

const ABSENT_VERSION_FIELD: u16 = u16::MAX;

/// A `major.minor.patch` version triple.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub(crate) fn is_absent_marker(self) -> bool {
        self.major == ABSENT_VERSION_FIELD
            && self.minor == ABSENT_VERSION_FIELD
            && self.patch == ABSENT_VERSION_FIELD
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    /// Parses `major.minor.patch`.
    ///
    /// ```
    /// use te::Version;
    ///
    /// assert_eq!(Ok(Version::new(2, 1, 7)), "2.1.7".parse());
    /// assert!("2.1".parse::<Version>().is_err());
    /// ```
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.split('.').map(str::parse::<u16>);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => {
                Ok(Self::new(major, minor, patch))
            }
            _ => Err(format!("`{value}` is not a major.minor.patch version")),
        }
    }
}

/// Versions reported by `GetVersion`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct VersionReport {
    pub firmware: Version,
    pub bootloader: Version,
    /// Absent until a project is loaded.
    pub project: Option<Version>,
}

/// Project flavour loaded on a device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize)]
pub enum ProjectType {
    #[display("UNKNOWN")]
    Unknown,
    #[display("GUIDE")]
    Guide,
    #[display("GIIB")]
    Giib,
    #[display("TYPE({_0})")]
    Other(i8),
}

impl ProjectType {
    pub(crate) fn raw(self) -> i8 {
        match self {
            Self::Unknown => -1,
            Self::Guide => 0,
            Self::Giib => 1,
            Self::Other(value) => value,
        }
    }
}

impl From<i8> for ProjectType {
    fn from(value: i8) -> Self {
        match value {
            -1 => Self::Unknown,
            0 => Self::Guide,
            1 => Self::Giib,
            other => Self::Other(other),
        }
    }
}

/// Project type and checksum reported by `GetProjectInfo`.
///
/// ```
/// use te::{ProjectInfo, ProjectType};
///
/// assert_eq!("UNKNOWN -1", ProjectInfo::default().to_string());
/// assert_eq!("GUIDE 4660", ProjectInfo::new(ProjectType::Guide, 0x1234).to_string());
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, SerializeDisplay)]
pub struct ProjectInfo {
    project_type: ProjectType,
    checksum: Option<u32>,
}

impl ProjectInfo {
    #[must_use]
    pub fn new(project_type: ProjectType, checksum: u32) -> Self {
        Self {
            project_type,
            checksum: Some(checksum),
        }
    }

    #[must_use]
    pub fn project_type(self) -> ProjectType {
        self.project_type
    }

    #[must_use]
    pub fn checksum(self) -> Option<u32> {
        self.checksum
    }
}

impl Default for ProjectInfo {
    fn default() -> Self {
        Self {
            project_type: ProjectType::Unknown,
            checksum: None,
        }
    }
}

impl fmt::Display for ProjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.checksum {
            Some(checksum) => write!(f, "{} {checksum}", self.project_type),
            None => write!(f, "{} -1", self.project_type),
        }
    }
}

/// Device answer to an update request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
pub enum UpdateAcceptance {
    #[display("accepted")]
    Accepted,
    #[display("rejected")]
    Rejected,
    #[display("busy")]
    Busy,
    #[display("unknown ({_0})")]
    Other(u8),
}

impl UpdateAcceptance {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Rejected => 2,
            Self::Busy => 3,
            Self::Other(value) => value,
        }
    }
}

impl From<u8> for UpdateAcceptance {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Accepted,
            2 => Self::Rejected,
            3 => Self::Busy,
            other => Self::Other(other),
        }
    }
}

/// Error byte carried by upload acknowledgements.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
pub enum UploadError {
    #[display("ok")]
    Ok,
    #[display("unknown")]
    Unknown,
    #[display("timeout")]
    Timeout,
    #[display("overflow")]
    Overflow,
    #[display("I/O error")]
    Io,
    #[display("code {_0}")]
    Other(u8),
}

impl UploadError {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Unknown => 1,
            Self::Timeout => 2,
            Self::Overflow => 3,
            Self::Io => 4,
            Self::Other(value) => value,
        }
    }
}

impl From<u8> for UploadError {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Unknown,
            2 => Self::Timeout,
            3 => Self::Overflow,
            4 => Self::Io,
            other => Self::Other(other),
        }
    }
}

/// Final status reported once the device has applied an update.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
pub enum UpdateStatus {
    #[display("FAILURE")]
    Failure,
    #[display("ERROR")]
    Error,
    #[display("ONGOING")]
    Ongoing,
    #[display("SUCCESS")]
    Success,
    #[display("SUCCESS_RESTART")]
    SuccessRestart,
    #[display("SUCCESS_UPTODATE")]
    SuccessUpToDate,
    #[display("TIMEOUT")]
    Timeout,
    #[display("STATUS({_0})")]
    Other(i8),
}

impl UpdateStatus {
    pub(crate) fn raw(self) -> i8 {
        match self {
            Self::Failure => -2,
            Self::Error => -1,
            Self::Ongoing => 0,
            Self::Success => 1,
            Self::SuccessRestart => 2,
            Self::SuccessUpToDate => 3,
            Self::Timeout => 4,
            Self::Other(value) => value,
        }
    }

    /// Returns whether the update was applied or already current.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Success | Self::SuccessRestart | Self::SuccessUpToDate
        )
    }

    /// Returns whether the device stopped without applying the update.
    #[must_use]
    pub fn is_failure(self) -> bool {
        self.raw() < 0 || self == Self::Timeout
    }
}

impl From<i8> for UpdateStatus {
    fn from(value: i8) -> Self {
        match value {
            -2 => Self::Failure,
            -1 => Self::Error,
            0 => Self::Ongoing,
            1 => Self::Success,
            2 => Self::SuccessRestart,
            3 => Self::SuccessUpToDate,
            4 => Self::Timeout,
            other => Self::Other(other),
        }
    }
}

/// Flash component named in progress reports.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
pub enum ComponentKind {
    #[display("package")]
    Package,
    #[display("bootloader")]
    Bootloader,
    #[display("firmware")]
    Firmware,
    #[display("project")]
    Project,
    #[display("component {_0}")]
    Other(u8),
}

impl ComponentKind {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Package => 0,
            Self::Bootloader => 1,
            Self::Firmware => 2,
            Self::Project => 3,
            Self::Other(value) => value,
        }
    }
}

impl From<u8> for ComponentKind {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Package,
            1 => Self::Bootloader,
            2 => Self::Firmware,
            3 => Self::Project,
            other => Self::Other(other),
        }
    }
}

/// Phase of one component update.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
pub enum ComponentStatus {
    #[display("busy")]
    Busy,
    #[display("in progress")]
    Progress,
    #[display("done")]
    End,
    #[display("status 0x{_0:02X}")]
    Other(u8),
}

impl ComponentStatus {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Busy => 0xB1,
            Self::Progress => 0x30,
            Self::End => 0xF1,
            Self::Other(value) => value,
        }
    }
}

impl From<u8> for ComponentStatus {
    fn from(value: u8) -> Self {
        match value {
            0xB1 => Self::Busy,
            0x30 => Self::Progress,
            0xF1 => Self::End,
            other => Self::Other(other),
        }
    }
}

/// Authentication handshake state reported by the device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum AuthState {
    #[display("challenge")]
    Challenge,
    #[display("complete")]
    Complete,
    #[display("state {_0}")]
    Other(u8),
}

impl AuthState {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Challenge => 0,
            Self::Complete => 0xFF,
            Self::Other(value) => value,
        }
    }
}

impl From<u8> for AuthState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Challenge,
            0xFF => Self::Complete,
            other => Self::Other(other),
        }
    }
}

/// One decoded device-to-tool message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reply {
    Ack {
        opcode: u8,
        code: AckCode,
    },
    Screen(ScreenId),
    Variable {
        screen: ScreenId,
        variable: VariableId,
        value: VariableValue,
    },
    Version(VersionReport),
    HardwareId(HardwareId),
    ProjectInfo(ProjectInfo),
    UpdateReply {
        acceptance: UpdateAcceptance,
        max_chunk: u16,
    },
    UploadProgress {
        error: UploadError,
        next_offset: u32,
    },
    UpdateFinished(UpdateStatus),
    ComponentProgress {
        component: ComponentKind,
        status: ComponentStatus,
        percent: u8,
    },
    Auth {
        state: AuthState,
        challenge: u32,
    },
}

impl Reply {
    /// Opcode the reply travels under.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Ack { .. } => opcode::ACK,
            Self::Screen(_) | Self::Variable { .. } => opcode::GUIDE_GET,
            Self::Version(_) => opcode::GET_VERSION,
            Self::HardwareId(_) => opcode::GET_HARDWARE_ID,
            Self::ProjectInfo(_) => opcode::GET_PROJECT_INFO,
            Self::UpdateReply { .. } => opcode::UPDATE_BEGIN,
            Self::UploadProgress { .. }
            | Self::UpdateFinished(_)
            | Self::ComponentProgress { .. } => opcode::UPDATE_STATUS,
            Self::Auth { .. } => opcode::AUTH_REQUEST,
        }
    }

    /// Short name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ack",
            Self::Screen(_) => "screen",
            Self::Variable { .. } => "variable",
            Self::Version(_) => "version",
            Self::HardwareId(_) => "hardware id",
            Self::ProjectInfo(_) => "project info",
            Self::UpdateReply { .. } => "update reply",
            Self::UploadProgress { .. } => "upload progress",
            Self::UpdateFinished(_) => "update status",
            Self::ComponentProgress { .. } => "component progress",
            Self::Auth { .. } => "auth state",
        }
    }

    /// Returns whether this reply answers `request`.
    ///
    /// Anything else arriving during an exchange is a leftover from an earlier one.
    #[must_use]
    pub fn answers(&self, request: &Request) -> bool {
        match (self, request) {
            (Self::Ack { opcode, .. }, request) => *opcode == request.opcode(),
            (Self::Screen(_), Request::ScreenGet)
            | (Self::Version(_), Request::GetVersion)
            | (Self::HardwareId(_), Request::GetHardwareId)
            | (Self::ProjectInfo(_), Request::GetProjectInfo)
            | (Self::UpdateReply { .. }, Request::UpdateBegin { .. })
            | (Self::UploadProgress { .. }, Request::UpdateChunk { .. })
            | (Self::Auth { .. }, Request::AuthRequest { .. } | Request::AuthResponse { .. }) => {
                true
            }
            (
                Self::Variable {
                    screen, variable, ..
                },
                Request::VariableGet {
                    screen: wanted_screen,
                    variable: wanted_variable,
                },
            ) => screen == wanted_screen && variable == wanted_variable,
            _ => false,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack { opcode, code } => write!(f, "ack 0x{opcode:02X} ({code})"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn absent_project_version_uses_all_ones() {
        assert!(Version::new(0xFFFF, 0xFFFF, 0xFFFF).is_absent_marker());
        assert!(!Version::new(0xFFFF, 0, 0xFFFF).is_absent_marker());
    }

    #[rstest]
    #[case(-2, UpdateStatus::Failure, false)]
    #[case(1, UpdateStatus::Success, true)]
    #[case(3, UpdateStatus::SuccessUpToDate, true)]
    #[case(4, UpdateStatus::Timeout, false)]
    fn update_status_classifies_outcomes(
        #[case] raw: i8,
        #[case] expected: UpdateStatus,
        #[case] success: bool,
    ) {
        let status = UpdateStatus::from(raw);
        assert_eq!(expected, status);
        assert_eq!(success, status.is_success());
        assert_eq!(raw, status.raw());
    }

    #[test]
    fn acks_answer_the_request_with_the_same_opcode() {
        let ack = Reply::Ack {
            opcode: opcode::BRIGHTNESS,
            code: AckCode::Ok,
        };
        assert!(ack.answers(&Request::BrightnessSet {
            level: crate::handlers::Brightness::new(10).expect("valid"),
            store: false,
        }));
        assert!(!ack.answers(&Request::ScreenGet));
    }

    #[test]
    fn variable_replies_must_match_the_requested_ids() {
        let reply = Reply::Variable {
            screen: ScreenId::from(6),
            variable: VariableId::from(2),
            value: VariableValue::Int(20),
        };
        assert!(reply.answers(&Request::VariableGet {
            screen: ScreenId::from(6),
            variable: VariableId::from(2),
        }));
        assert!(!reply.answers(&Request::VariableGet {
            screen: ScreenId::from(6),
            variable: VariableId::from(3),
        }));
    }

    #[test]
    fn component_status_renders_unknown_codes_in_hex() {
        assert_eq!("status 0x7F", ComponentStatus::from(0x7F).to_string());
        assert_eq!("in progress", ComponentStatus::from(0x30).to_string());
    }
}
