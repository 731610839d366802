use std::fmt;

use crate::error::CodecError;
use crate::protocol::{AckCode, HardwareId, guide, opcode};
use crate::utils::format_hex;

use super::command::{Brightness, Clearance, PayloadKind, Request, ScreenId, VariableId, VariableValue};
use super::reply::{
    AuthState, ComponentKind, ComponentStatus, ProjectInfo, ProjectType, Reply, UpdateAcceptance,
    UpdateStatus, UploadError, Version, VersionReport,
};

/// Opcode plus control byte.
pub const FRAME_HEADER_LEN: usize = 2;
const INDEX_MASK: u8 = 0x7F;
const MORE_FLAG: u8 = 0x80;
const MAX_FRAMES: usize = INDEX_MASK as usize + 1;
const BRIGHTNESS_STORE_FLAG: u8 = 0x80;
const AUTH_RESPONSE_STATE: u8 = 1;
const UPDATE_STATUS_UPLOAD: u8 = 1;
const UPDATE_STATUS_UPDATE: u8 = 2;
const UPDATE_STATUS_COMPONENT: u8 = 3;
const VERSION_FIELDS: usize = 9;

/// One wire unit: an opcode, its position in the message and a payload slice.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    opcode: u8,
    index: u8,
    more: bool,
    payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame.
    ///
    /// Indices wrap into the 7-bit control field.
    #[must_use]
    pub fn new(opcode: u8, index: u8, more: bool, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            index: index & INDEX_MASK,
            more,
            payload,
        }
    }

    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Position within the message, starting at zero.
    #[must_use]
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Whether further frames follow.
    #[must_use]
    pub fn more(&self) -> bool {
        self.more
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes the frame as `[opcode, control, payload...]`.
    ///
    /// ```
    /// use te::Frame;
    ///
    /// let frame = Frame::new(0x0A, 1, true, vec![0x01]);
    /// assert_eq!(vec![0x0A, 0x81, 0x01], frame.to_bytes());
    /// ```
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        bytes.push(self.opcode);
        bytes.push(self.control());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parses one frame from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] when the bytes cannot hold a frame header.
    ///
    /// ```
    /// use te::{CodecError, Frame};
    ///
    /// let frame = Frame::from_bytes(&[0xC2, 0x00, 0x11, 0x00, 0x00, 0x00])?;
    /// assert_eq!(0xC2, frame.opcode());
    /// assert!(!frame.more());
    /// assert!(matches!(Frame::from_bytes(&[0xC2]), Err(CodecError::Malformed { .. })));
    /// # Ok::<(), te::CodecError>(())
    /// ```
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let [opcode, control, payload @ ..] = bytes else {
            return Err(CodecError::malformed(format!(
                "frame of {} byte(s) is shorter than the {FRAME_HEADER_LEN} byte header",
                bytes.len()
            )));
        };

        Ok(Self {
            opcode: *opcode,
            index: control & INDEX_MASK,
            more: control & MORE_FLAG != 0,
            payload: payload.to_vec(),
        })
    }

    fn control(&self) -> u8 {
        let flag = if self.more { MORE_FLAG } else { 0 };
        (self.index & INDEX_MASK) | flag
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hex(&self.to_bytes()))
    }
}

/// Stateless encoder and decoder for request and reply messages.
pub struct FrameCodec;

impl FrameCodec {
    /// Encodes a request into frames no longer than `max_frame_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame limit cannot carry payload or the message
    /// needs more frames than the control byte can index.
    ///
    /// ```
    /// use te::{FrameCodec, Request};
    ///
    /// let frames = FrameCodec::encode_request(&Request::GetVersion, 62)?;
    /// assert_eq!(vec![0xC1, 0x00], frames[0].to_bytes());
    /// # Ok::<(), te::CodecError>(())
    /// ```
    pub fn encode_request(request: &Request, max_frame_len: usize) -> Result<Vec<Frame>, CodecError> {
        Self::split(request.opcode(), &request_payload(request), max_frame_len)
    }

    /// Encodes a device reply. Used by simulated devices.
    ///
    /// # Errors
    ///
    /// Same conditions as [`FrameCodec::encode_request`].
    pub fn encode_reply(reply: &Reply, max_frame_len: usize) -> Result<Vec<Frame>, CodecError> {
        Self::split(reply.opcode(), &reply_payload(reply), max_frame_len)
    }

    /// Decodes a complete frame sequence into a request.
    ///
    /// # Errors
    ///
    /// Returns an error when the sequence is malformed, the opcode is unknown or
    /// the payload does not match the opcode's shape.
    pub fn decode_request(frames: &[Frame]) -> Result<Request, CodecError> {
        let (message_opcode, payload) = Self::reassemble(frames)?;
        decode_request_payload(message_opcode, &payload)
    }

    /// Decodes a complete frame sequence into a reply.
    ///
    /// # Errors
    ///
    /// Returns an error when the sequence is malformed, the opcode is unknown or
    /// the payload does not match the opcode's shape.
    ///
    /// ```
    /// use te::{Frame, FrameCodec, Reply, ScreenId};
    ///
    /// let frames = [Frame::from_bytes(&[0x0A, 0x00, 0x01, 0x06, 0x00])?];
    /// assert_eq!(Reply::Screen(ScreenId::from(6)), FrameCodec::decode_reply(&frames)?);
    /// # Ok::<(), te::CodecError>(())
    /// ```
    pub fn decode_reply(frames: &[Frame]) -> Result<Reply, CodecError> {
        let (message_opcode, payload) = Self::reassemble(frames)?;
        decode_reply_payload(message_opcode, &payload)
    }

    /// Joins frame payloads after validating the sequence.
    ///
    /// Indices must run contiguously from zero, every frame but the last must
    /// announce a successor and all frames must share one opcode.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] for any violation.
    pub fn reassemble(frames: &[Frame]) -> Result<(u8, Vec<u8>), CodecError> {
        let Some(first) = frames.first() else {
            return Err(CodecError::malformed("empty frame sequence"));
        };
        if frames.len() > MAX_FRAMES {
            return Err(CodecError::malformed(format!(
                "{} frames exceed the {MAX_FRAMES} frame limit",
                frames.len()
            )));
        }

        let mut payload = Vec::new();
        for (expected, frame) in frames.iter().enumerate() {
            if frame.opcode != first.opcode {
                return Err(CodecError::malformed(format!(
                    "frame {expected} carries opcode 0x{:02X}, expected 0x{:02X}",
                    frame.opcode, first.opcode
                )));
            }
            if usize::from(frame.index) != expected {
                return Err(CodecError::malformed(format!(
                    "frame index {} where {expected} was expected",
                    frame.index
                )));
            }
            let last = expected + 1 == frames.len();
            if frame.more == last {
                let reason = if last {
                    "sequence ends before the terminal frame"
                } else {
                    "frames follow the terminal frame"
                };
                return Err(CodecError::malformed(reason));
            }
            payload.extend_from_slice(&frame.payload);
        }

        Ok((first.opcode, payload))
    }

    fn split(message_opcode: u8, payload: &[u8], max_frame_len: usize) -> Result<Vec<Frame>, CodecError> {
        let Some(capacity) = max_frame_len
            .checked_sub(FRAME_HEADER_LEN)
            .filter(|capacity| *capacity > 0)
        else {
            return Err(CodecError::FrameLimitTooSmall { max_frame_len });
        };

        if payload.is_empty() {
            return Ok(vec![Frame::new(message_opcode, 0, false, Vec::new())]);
        }

        let count = payload.len().div_ceil(capacity);
        if count > MAX_FRAMES {
            return Err(CodecError::TooManyFrames {
                len: payload.len(),
                max_frames: MAX_FRAMES,
            });
        }

        Ok(payload
            .chunks(capacity)
            .enumerate()
            .map(|(index, chunk)| {
                #[allow(clippy::cast_possible_truncation)]
                let index = index as u8;
                Frame::new(message_opcode, index, usize::from(index) + 1 < count, chunk.to_vec())
            })
            .collect())
    }
}

fn request_payload(request: &Request) -> Vec<u8> {
    match request {
        Request::Restart { .. }
        | Request::GetVersion
        | Request::GetHardwareId
        | Request::GetProjectInfo => Vec::new(),
        Request::AuthRequest { clearance } => vec![clearance.raw()],
        Request::AuthResponse { key } => {
            let mut bytes = vec![AUTH_RESPONSE_STATE];
            bytes.extend_from_slice(&key.to_le_bytes());
            bytes
        }
        Request::ScreenGet => vec![guide::SCREEN],
        Request::ScreenSet { screen } => {
            let mut bytes = vec![guide::SCREEN];
            bytes.extend_from_slice(&u16::from(*screen).to_le_bytes());
            bytes
        }
        Request::VariableGet { screen, variable } => {
            let mut bytes = vec![guide::VARIABLE];
            push_ids(&mut bytes, *screen, *variable);
            bytes
        }
        Request::VariableSet {
            screen,
            variable,
            value,
        } => variable_payload(*screen, *variable, value),
        Request::BrightnessSet { level, store } => {
            let flag = if *store { BRIGHTNESS_STORE_FLAG } else { 0 };
            vec![(level.value() & !BRIGHTNESS_STORE_FLAG) | flag]
        }
        Request::UpdateBegin { kind, total } => {
            let mut bytes = vec![kind.raw()];
            bytes.extend_from_slice(&total.to_le_bytes());
            bytes
        }
        Request::UpdateChunk { offset, data, .. } => {
            let mut bytes = Vec::with_capacity(4 + data.len());
            bytes.extend_from_slice(&offset.to_le_bytes());
            bytes.extend_from_slice(data);
            bytes
        }
    }
}

fn reply_payload(reply: &Reply) -> Vec<u8> {
    match reply {
        Reply::Ack { opcode, code } => vec![code.raw(), *opcode],
        Reply::Screen(screen) => {
            let mut bytes = vec![guide::SCREEN];
            bytes.extend_from_slice(&u16::from(*screen).to_le_bytes());
            bytes
        }
        Reply::Variable {
            screen,
            variable,
            value,
        } => variable_payload(*screen, *variable, value),
        Reply::Version(report) => {
            let absent = Version::new(u16::MAX, u16::MAX, u16::MAX);
            [report.firmware, report.bootloader, report.project.unwrap_or(absent)]
                .iter()
                .flat_map(|version| [version.major, version.minor, version.patch])
                .flat_map(u16::to_le_bytes)
                .collect()
        }
        Reply::HardwareId(id) => id.raw().to_le_bytes().to_vec(),
        Reply::ProjectInfo(info) => {
            let mut bytes = vec![info.project_type().raw().to_le_bytes()[0]];
            bytes.extend_from_slice(&info.checksum().unwrap_or(u32::MAX).to_le_bytes());
            bytes
        }
        Reply::UpdateReply {
            acceptance,
            max_chunk,
        } => {
            let mut bytes = vec![acceptance.raw()];
            bytes.extend_from_slice(&max_chunk.to_le_bytes());
            bytes
        }
        Reply::UploadProgress { error, next_offset } => {
            let mut bytes = vec![UPDATE_STATUS_UPLOAD, error.raw()];
            bytes.extend_from_slice(&next_offset.to_le_bytes());
            bytes
        }
        Reply::UpdateFinished(status) => vec![UPDATE_STATUS_UPDATE, status.raw().to_le_bytes()[0]],
        Reply::ComponentProgress {
            component,
            status,
            percent,
        } => vec![UPDATE_STATUS_COMPONENT, component.raw(), status.raw(), *percent],
        Reply::Auth { state, challenge } => {
            let mut bytes = vec![state.raw()];
            bytes.extend_from_slice(&challenge.to_le_bytes());
            bytes
        }
    }
}

fn push_ids(bytes: &mut Vec<u8>, screen: ScreenId, variable: VariableId) {
    bytes.extend_from_slice(&u16::from(screen).to_le_bytes());
    bytes.extend_from_slice(&u16::from(variable).to_le_bytes());
}

fn variable_payload(screen: ScreenId, variable: VariableId, value: &VariableValue) -> Vec<u8> {
    let sub = match value {
        VariableValue::Int(_) => guide::INT_VARIABLE,
        VariableValue::Str(_) => guide::STRING_VARIABLE,
    };
    let mut bytes = vec![sub];
    push_ids(&mut bytes, screen, variable);
    bytes.extend_from_slice(&value.encode());
    bytes
}

fn decode_request_payload(message_opcode: u8, payload: &[u8]) -> Result<Request, CodecError> {
    let mut reader = PayloadReader::new(message_opcode, payload);
    let request = match message_opcode {
        opcode::RESTART => Request::Restart { utility: false },
        opcode::RESTART_UTILITY => Request::Restart { utility: true },
        opcode::GET_VERSION => Request::GetVersion,
        opcode::GET_HARDWARE_ID => Request::GetHardwareId,
        opcode::GET_PROJECT_INFO => Request::GetProjectInfo,
        opcode::AUTH_REQUEST => {
            let raw = reader.u8()?;
            let clearance = Clearance::from_raw(raw)
                .ok_or_else(|| CodecError::malformed(format!("unknown clearance {raw}")))?;
            Request::AuthRequest { clearance }
        }
        opcode::AUTH_RESPONSE => {
            let state = reader.u8()?;
            if state != AUTH_RESPONSE_STATE {
                return Err(CodecError::malformed(format!(
                    "auth response state {state} is not {AUTH_RESPONSE_STATE}"
                )));
            }
            Request::AuthResponse { key: reader.u32()? }
        }
        opcode::GUIDE_GET => match reader.u8()? {
            guide::SCREEN => Request::ScreenGet,
            guide::VARIABLE => Request::VariableGet {
                screen: reader.screen()?,
                variable: reader.variable()?,
            },
            other => return Err(unknown_guide(other)),
        },
        opcode::GUIDE_SET => match reader.u8()? {
            guide::SCREEN => Request::ScreenSet {
                screen: reader.screen()?,
            },
            sub @ (guide::INT_VARIABLE | guide::STRING_VARIABLE) => {
                let screen = reader.screen()?;
                let variable = reader.variable()?;
                Request::VariableSet {
                    screen,
                    variable,
                    value: reader.variable_value(sub)?,
                }
            }
            other => return Err(unknown_guide(other)),
        },
        opcode::BRIGHTNESS => {
            let raw = reader.u8()?;
            let level = Brightness::new(raw & !BRIGHTNESS_STORE_FLAG)
                .map_err(|error| CodecError::malformed(error.to_string()))?;
            Request::BrightnessSet {
                level,
                store: raw & BRIGHTNESS_STORE_FLAG != 0,
            }
        }
        opcode::UPDATE_BEGIN => {
            let raw = reader.u8()?;
            let kind = PayloadKind::from_raw(raw)
                .ok_or_else(|| CodecError::malformed(format!("unknown update kind {raw}")))?;
            Request::UpdateBegin {
                kind,
                total: reader.u32()?,
            }
        }
        opcode::UPDATE_FIRMWARE_CHUNK | opcode::UPDATE_PROJECT_CHUNK => {
            let kind = if message_opcode == opcode::UPDATE_PROJECT_CHUNK {
                PayloadKind::Project
            } else {
                PayloadKind::Firmware
            };
            let offset = reader.u32()?;
            let data = reader.rest().to_vec();
            if data.is_empty() {
                return Err(reader.mismatch("at least 5"));
            }
            Request::UpdateChunk { kind, offset, data }
        }
        other => return Err(CodecError::UnknownOpcode { opcode: other }),
    };
    reader.finish()?;
    Ok(request)
}

fn decode_reply_payload(message_opcode: u8, payload: &[u8]) -> Result<Reply, CodecError> {
    let mut reader = PayloadReader::new(message_opcode, payload);
    let reply = match message_opcode {
        opcode::ACK => {
            let raw = reader.u8()?;
            let code = AckCode::from_raw(raw)
                .ok_or_else(|| CodecError::malformed(format!("unknown ack code {raw}")))?;
            Reply::Ack {
                code,
                opcode: reader.u8()?,
            }
        }
        opcode::GUIDE_GET => match reader.u8()? {
            guide::SCREEN => Reply::Screen(reader.screen()?),
            sub @ (guide::INT_VARIABLE | guide::STRING_VARIABLE) => {
                let screen = reader.screen()?;
                let variable = reader.variable()?;
                Reply::Variable {
                    screen,
                    variable,
                    value: reader.variable_value(sub)?,
                }
            }
            other => return Err(unknown_guide(other)),
        },
        opcode::GET_VERSION => {
            let mut fields = [0_u16; VERSION_FIELDS];
            for field in &mut fields {
                *field = reader.u16()?;
            }
            let [fw0, fw1, fw2, bl0, bl1, bl2, pj0, pj1, pj2] = fields;
            let project = Version::new(pj0, pj1, pj2);
            Reply::Version(VersionReport {
                firmware: Version::new(fw0, fw1, fw2),
                bootloader: Version::new(bl0, bl1, bl2),
                project: (!project.is_absent_marker()).then_some(project),
            })
        }
        opcode::GET_HARDWARE_ID => Reply::HardwareId(HardwareId::from(reader.u32()?)),
        opcode::GET_PROJECT_INFO => {
            let project_type = ProjectType::from(i8::from_le_bytes([reader.u8()?]));
            Reply::ProjectInfo(ProjectInfo::new(project_type, reader.u32()?))
        }
        opcode::UPDATE_BEGIN => Reply::UpdateReply {
            acceptance: UpdateAcceptance::from(reader.u8()?),
            max_chunk: reader.u16()?,
        },
        opcode::UPDATE_STATUS => match reader.u8()? {
            UPDATE_STATUS_UPLOAD => Reply::UploadProgress {
                error: UploadError::from(reader.u8()?),
                next_offset: reader.u32()?,
            },
            UPDATE_STATUS_UPDATE => {
                Reply::UpdateFinished(UpdateStatus::from(i8::from_le_bytes([reader.u8()?])))
            }
            UPDATE_STATUS_COMPONENT => Reply::ComponentProgress {
                component: ComponentKind::from(reader.u8()?),
                status: ComponentStatus::from(reader.u8()?),
                percent: reader.u8()?,
            },
            other => {
                return Err(CodecError::malformed(format!(
                    "unknown update status type {other}"
                )));
            }
        },
        opcode::AUTH_REQUEST => Reply::Auth {
            state: AuthState::from(reader.u8()?),
            challenge: reader.u32()?,
        },
        other => return Err(CodecError::UnknownOpcode { opcode: other }),
    };
    reader.finish()?;
    Ok(reply)
}

fn unknown_guide(sub: u8) -> CodecError {
    CodecError::malformed(format!("unknown GUIDE sub-command 0x{sub:02X}"))
}

/// Little-endian cursor over one message payload.
struct PayloadReader<'a> {
    opcode: u8,
    bytes: &'a [u8],
    position: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(opcode: u8, bytes: &'a [u8]) -> Self {
        Self {
            opcode,
            bytes,
            position: 0,
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.position + N;
        let slice = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| self.mismatch(format!("at least {end}")))?;
        self.position = end;
        let mut out = [0_u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        let [value] = self.take::<1>()?;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn screen(&mut self) -> Result<ScreenId, CodecError> {
        self.u16().map(ScreenId::from)
    }

    fn variable(&mut self) -> Result<VariableId, CodecError> {
        self.u16().map(VariableId::from)
    }

    fn variable_value(&mut self, sub: u8) -> Result<VariableValue, CodecError> {
        if sub == guide::INT_VARIABLE {
            return Ok(VariableValue::Int(i32::from_le_bytes(self.take()?)));
        }

        let rest = self.rest();
        let Some((0, text)) = rest.split_last() else {
            return Err(CodecError::malformed("string value is not NUL-terminated"));
        };
        let text = std::str::from_utf8(text)
            .map_err(|error| CodecError::malformed(format!("string value is not UTF-8: {error}")))?;
        VariableValue::string(text).map_err(|error| CodecError::malformed(error.to_string()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = self.bytes;
        self.position = self.position.min(bytes.len());
        let rest = &bytes[self.position..];
        self.position = bytes.len();
        rest
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.position == self.bytes.len() {
            return Ok(());
        }
        Err(self.mismatch(self.position.to_string()))
    }

    fn mismatch(&self, expected: impl Into<String>) -> CodecError {
        CodecError::LengthMismatch {
            opcode: self.opcode,
            expected: expected.into(),
            actual: self.bytes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn frames(raw: &[&[u8]]) -> Vec<Frame> {
        raw.iter()
            .map(|bytes| Frame::from_bytes(bytes).expect("test frames have headers"))
            .collect()
    }

    fn wire(request: &Request, max_frame_len: usize) -> Vec<Vec<u8>> {
        FrameCodec::encode_request(request, max_frame_len)
            .expect("request should encode")
            .iter()
            .map(Frame::to_bytes)
            .collect()
    }

    #[test]
    fn variable_set_int_matches_literal_bytes() {
        let request = Request::VariableSet {
            screen: ScreenId::from(6),
            variable: VariableId::from(2),
            value: VariableValue::Int(20),
        };

        assert_eq!(
            vec![vec![
                0x0B, 0x00, 0x03, 0x06, 0x00, 0x02, 0x00, 0x14, 0x00, 0x00, 0x00
            ]],
            wire(&request, 1785)
        );
    }

    #[rstest]
    #[case(Request::Restart { utility: false }, vec![0x44, 0x00])]
    #[case(Request::Restart { utility: true }, vec![0x45, 0x00])]
    #[case(Request::ScreenGet, vec![0x0A, 0x00, 0x01])]
    #[case(Request::ScreenSet { screen: ScreenId::from(0x0102) }, vec![0x0B, 0x00, 0x01, 0x02, 0x01])]
    #[case(
        Request::VariableGet { screen: ScreenId::from(6), variable: VariableId::from(2) },
        vec![0x0A, 0x00, 0x02, 0x06, 0x00, 0x02, 0x00]
    )]
    #[case(
        Request::BrightnessSet { level: Brightness::new(80).expect("valid"), store: true },
        vec![0x80, 0x00, 0xD0]
    )]
    #[case(
        Request::AuthResponse { key: 0x0403_0201 },
        vec![0x02, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04]
    )]
    #[case(
        Request::UpdateBegin { kind: PayloadKind::Project, total: 300 },
        vec![0x55, 0x00, 0x03, 0x2C, 0x01, 0x00, 0x00]
    )]
    fn requests_encode_to_fixed_bytes(#[case] request: Request, #[case] expected: Vec<u8>) {
        assert_eq!(vec![expected], wire(&request, 62));
    }

    #[test]
    fn string_variable_splits_across_frames() {
        let request = Request::VariableSet {
            screen: ScreenId::from(1),
            variable: VariableId::from(1),
            value: VariableValue::string("hello").expect("valid"),
        };

        assert_eq!(
            vec![
                vec![0x0B, 0x80, 0x04, 0x01, 0x00, 0x01, 0x00, b'h'],
                vec![0x0B, 0x81, b'e', b'l', b'l', b'o', 0x00],
            ],
            wire(&request, 8)
        );
    }

    #[test]
    fn requests_survive_a_loopback() {
        let requests = [
            Request::ScreenGet,
            Request::VariableSet {
                screen: ScreenId::from(3),
                variable: VariableId::from(9),
                value: VariableValue::string("a longer value than one frame").expect("valid"),
            },
            Request::UpdateChunk {
                kind: PayloadKind::Firmware,
                offset: 512,
                data: vec![0xAA; 40],
            },
            Request::AuthRequest {
                clearance: Clearance::ServiceTool,
            },
        ];

        for request in requests {
            let encoded = FrameCodec::encode_request(&request, 16).expect("request should encode");
            assert_eq!(Ok(request), FrameCodec::decode_request(&encoded));
        }
    }

    #[test]
    fn version_reply_without_project_decodes_absent() {
        let mut bytes = vec![0xC1, 0x00];
        for field in [2_u16, 1, 7, 1, 0, 3, 0xFFFF, 0xFFFF, 0xFFFF] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }

        let reply = FrameCodec::decode_reply(&frames(&[&bytes])).expect("version should decode");

        assert_eq!(
            Reply::Version(VersionReport {
                firmware: Version::new(2, 1, 7),
                bootloader: Version::new(1, 0, 3),
                project: None,
            }),
            reply
        );
    }

    #[rstest]
    #[case(&[0xE8, 0x00, 0x00, 0x0B], Reply::Ack { opcode: 0x0B, code: AckCode::Ok })]
    #[case(&[0xC2, 0x00, 0x00, 0x01, 0x00, 0x00], Reply::HardwareId(HardwareId::Mix))]
    #[case(&[0xC3, 0x00, 0xFF, 0x10, 0x00, 0x00, 0x00], Reply::ProjectInfo(ProjectInfo::new(ProjectType::Unknown, 16)))]
    #[case(&[0x55, 0x00, 0x00, 0x00, 0x01], Reply::UpdateReply { acceptance: UpdateAcceptance::Accepted, max_chunk: 256 })]
    #[case(
        &[0x5A, 0x00, 0x01, 0x00, 0x40, 0x00, 0x00, 0x00],
        Reply::UploadProgress { error: UploadError::Ok, next_offset: 64 }
    )]
    #[case(&[0x5A, 0x00, 0x02, 0xFE], Reply::UpdateFinished(UpdateStatus::Failure))]
    #[case(
        &[0x5A, 0x00, 0x03, 0x02, 0x30, 0x32],
        Reply::ComponentProgress { component: ComponentKind::Firmware, status: ComponentStatus::Progress, percent: 50 }
    )]
    #[case(
        &[0x0A, 0x00, 0x04, 0x06, 0x00, 0x02, 0x00, b'o', b'k', 0x00],
        Reply::Variable { screen: ScreenId::from(6), variable: VariableId::from(2), value: VariableValue::Str("ok".into()) }
    )]
    fn replies_decode_from_fixed_bytes(#[case] bytes: &[u8], #[case] expected: Reply) {
        let decoded = FrameCodec::decode_reply(&frames(&[bytes])).expect("reply should decode");
        assert_eq!(expected, decoded);
        assert_eq!(
            vec![bytes.to_vec()],
            FrameCodec::encode_reply(&expected, 62)
                .expect("reply should encode")
                .iter()
                .map(Frame::to_bytes)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn contiguous_sequences_reassemble_unchanged() {
        let sequence = frames(&[&[0x0A, 0x80, 0x04, 0x01], &[0x0A, 0x81, 0x00, 0x01], &[0x0A, 0x02, 0x00]]);

        let (message_opcode, payload) = FrameCodec::reassemble(&sequence).expect("contiguous");

        assert_eq!(0x0A, message_opcode);
        assert_eq!(vec![0x04, 0x01, 0x00, 0x01, 0x00], payload);
    }

    #[rstest]
    #[case::gap(vec![vec![0x0A, 0x80, 0x01], vec![0x0A, 0x02, 0x06, 0x00]])]
    #[case::duplicate(vec![vec![0x0A, 0x80, 0x01], vec![0x0A, 0x80, 0x06], vec![0x0A, 0x01, 0x00]])]
    #[case::late_start(vec![vec![0x0A, 0x01, 0x01, 0x06, 0x00]])]
    #[case::missing_terminal(vec![vec![0x0A, 0x80, 0x01, 0x06, 0x00]])]
    #[case::after_terminal(vec![vec![0x0A, 0x00, 0x01], vec![0x0A, 0x01, 0x06, 0x00]])]
    #[case::mixed_opcodes(vec![vec![0x0A, 0x80, 0x01], vec![0x0B, 0x01, 0x06, 0x00]])]
    fn broken_sequences_are_malformed(#[case] raw: Vec<Vec<u8>>) {
        let raw: Vec<&[u8]> = raw.iter().map(Vec::as_slice).collect();
        let result = FrameCodec::decode_reply(&frames(&raw));
        assert_matches!(result, Err(CodecError::Malformed { .. }));
    }

    #[test]
    fn empty_sequence_is_malformed() {
        assert_matches!(FrameCodec::decode_reply(&[]), Err(CodecError::Malformed { .. }));
    }

    #[test]
    fn wrong_payload_length_is_rejected() {
        let result = FrameCodec::decode_reply(&frames(&[&[0xC2, 0x00, 0x01, 0x00]]));
        assert_matches!(
            result,
            Err(CodecError::LengthMismatch {
                opcode: 0xC2,
                actual: 2,
                ..
            })
        );

        let trailing = FrameCodec::decode_reply(&frames(&[&[0xE8, 0x00, 0x00, 0x0B, 0x99]]));
        assert_matches!(trailing, Err(CodecError::LengthMismatch { opcode: 0xE8, .. }));
    }

    #[test]
    fn unknown_opcodes_are_reported() {
        let result = FrameCodec::decode_reply(&frames(&[&[0x77, 0x00]]));
        assert_eq!(Err(CodecError::UnknownOpcode { opcode: 0x77 }), result);
    }

    #[test]
    fn frame_limits_are_enforced() {
        assert_eq!(
            Err(CodecError::FrameLimitTooSmall { max_frame_len: 2 }),
            FrameCodec::encode_request(&Request::ScreenGet, 2)
        );

        let oversized = Request::UpdateChunk {
            kind: PayloadKind::Firmware,
            offset: 0,
            data: vec![0; 200],
        };
        assert_matches!(
            FrameCodec::encode_request(&oversized, 3),
            Err(CodecError::TooManyFrames { max_frames: 128, .. })
        );
    }
}
