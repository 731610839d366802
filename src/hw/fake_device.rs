use std::collections::HashMap;

use tracing::{debug, trace};

use crate::handlers::{
    Brightness, ComponentKind, ComponentStatus, Frame, FrameCodec, PayloadKind, ProjectInfo,
    ProjectType, Reply, Request, ScreenId, UpdateAcceptance, UpdateStatus, UploadError, VariableId,
    VariableValue, Version, VersionReport, service_tool_key,
};
use crate::protocol::{AckCode, HardwareId, TransportKind, opcode};

const DEFAULT_MAX_CHUNK: u16 = 256;
const DEFAULT_FIRMWARE: Version = Version::new(2, 1, 7);
const DEFAULT_BOOTLOADER: Version = Version::new(1, 0, 3);
const DEFAULT_PROJECT: Version = Version::new(1, 4, 0);
const DEFAULT_PROJECT_CHECKSUM: u32 = 0x00C0_FFEE;
const CHALLENGE_SEED: u32 = 0x5EED_0000;

/// Behaviour and injected faults of one simulated Touch Encoder.
#[derive(Debug, Clone, Eq, PartialEq, bon::Builder)]
pub struct DeviceBehaviour {
    /// Never answers commands. CAN devices still answer address claims.
    #[builder(default)]
    pub silent: bool,
    /// Drops the next N replies.
    #[builder(default)]
    pub drop_replies: u32,
    /// Corrupts the next N replies so they fail to decode.
    #[builder(default)]
    pub malformed_replies: u32,
    /// Swallows the acknowledgement of the chunk at this offset once.
    pub drop_ack_at: Option<u32>,
    /// Ignores the chunk at this offset and reports the old offset.
    pub stale_ack_at: Option<u32>,
    /// How many times the stale acknowledgement repeats.
    #[builder(default = 1)]
    pub stale_ack_repeats: u32,
    /// Reports an offset past the chunk at this offset.
    pub ahead_ack_at: Option<u32>,
    #[builder(default)]
    pub reject_update: bool,
    #[builder(default)]
    pub busy: bool,
    /// Refuses every authentication attempt.
    #[builder(default)]
    pub deny_auth: bool,
    pub hardware_id: Option<HardwareId>,
    #[builder(default = DEFAULT_FIRMWARE)]
    pub firmware: Version,
    /// Reports no loaded project.
    #[builder(default)]
    pub no_project: bool,
    #[builder(default = DEFAULT_MAX_CHUNK)]
    pub max_chunk: u16,
    #[builder(default = UpdateStatus::Success)]
    pub update_status: UpdateStatus,
}

impl Default for DeviceBehaviour {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One reply queued for the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Outbound {
    pub(crate) reply: Reply,
    /// Encode with a broken frame index.
    pub(crate) corrupt: bool,
}

impl Outbound {
    /// Codec frames for this reply, limited to `max_frame_len`.
    pub(crate) fn frames(&self, max_frame_len: usize) -> Vec<Vec<u8>> {
        let Ok(frames) = FrameCodec::encode_reply(&self.reply, max_frame_len) else {
            return Vec::new();
        };
        let mut encoded: Vec<Vec<u8>> = frames.iter().map(Frame::to_bytes).collect();
        if self.corrupt
            && let Some(first) = encoded.first_mut()
        {
            first[1] = 0x01;
        }
        encoded
    }
}

#[derive(Debug)]
struct UpdateState {
    kind: PayloadKind,
    total: u32,
    received: Vec<u8>,
    stale_acks_left: u32,
    drop_pending: bool,
    ahead_pending: bool,
}

/// Protocol state of one simulated device.
#[derive(Debug)]
pub(crate) struct SimulatedDevice {
    kind: TransportKind,
    behaviour: DeviceBehaviour,
    pending: Vec<Frame>,
    screen: ScreenId,
    variables: HashMap<(ScreenId, VariableId), VariableValue>,
    brightness: u8,
    stored_brightness: u8,
    challenge: Option<u32>,
    authenticated: bool,
    update: Option<UpdateState>,
    restarts: u32,
    firmware: Version,
    project: Option<Version>,
}

impl SimulatedDevice {
    pub(crate) fn new(kind: TransportKind, behaviour: DeviceBehaviour) -> Self {
        let project = (!behaviour.no_project).then_some(DEFAULT_PROJECT);
        Self {
            kind,
            firmware: behaviour.firmware,
            behaviour,
            pending: Vec::new(),
            screen: ScreenId::from(0),
            variables: HashMap::new(),
            brightness: 100,
            stored_brightness: 100,
            challenge: None,
            authenticated: false,
            update: None,
            restarts: 0,
            project,
        }
    }

    pub(crate) fn behaviour_mut(&mut self) -> &mut DeviceBehaviour {
        &mut self.behaviour
    }

    pub(crate) fn brightness(&self) -> u8 {
        self.brightness
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.restarts
    }

    pub(crate) fn received_update(&self) -> Option<&[u8]> {
        self.update.as_ref().map(|update| update.received.as_slice())
    }

    /// Feeds one codec frame from the tool; returns the replies it triggers.
    ///
    /// `secret` is the authentication secret of the link the frame came over.
    pub(crate) fn receive(&mut self, bytes: &[u8], secret: u32) -> Vec<Outbound> {
        let Ok(frame) = Frame::from_bytes(bytes) else {
            return Vec::new();
        };
        let terminal = !frame.more();
        self.pending.push(frame);
        if !terminal {
            return Vec::new();
        }

        let frames = std::mem::take(&mut self.pending);
        let request = match FrameCodec::decode_request(&frames) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "simulated device ignoring undecodable request");
                return Vec::new();
            }
        };
        trace!(?request, "simulated device handling request");
        if self.behaviour.silent {
            return Vec::new();
        }

        self.handle(request, secret)
            .into_iter()
            .filter_map(|reply| self.apply_faults(reply))
            .collect()
    }

    fn apply_faults(&mut self, reply: Reply) -> Option<Outbound> {
        if self.behaviour.drop_replies > 0 {
            self.behaviour.drop_replies -= 1;
            return None;
        }
        let corrupt = self.behaviour.malformed_replies > 0;
        if corrupt {
            self.behaviour.malformed_replies -= 1;
        }
        Some(Outbound { reply, corrupt })
    }

    fn handle(&mut self, request: Request, secret: u32) -> Vec<Reply> {
        let request_opcode = request.opcode();
        match request {
            Request::Restart { utility } => {
                if utility && !self.authenticated {
                    return vec![ack(request_opcode, AckCode::AccessDenied)];
                }
                self.restart();
                vec![ack(request_opcode, AckCode::Ok)]
            }
            Request::AuthRequest { .. } => {
                if self.authenticated {
                    return vec![Reply::Auth {
                        state: crate::handlers::AuthState::Complete,
                        challenge: 0,
                    }];
                }
                let challenge = CHALLENGE_SEED | (self.restarts & 0xFFFF);
                self.challenge = Some(challenge);
                vec![Reply::Auth {
                    state: crate::handlers::AuthState::Challenge,
                    challenge,
                }]
            }
            Request::AuthResponse { key } => {
                let expected = self
                    .challenge
                    .take()
                    .map(|challenge| service_tool_key(secret, challenge));
                if self.behaviour.deny_auth || expected != Some(key) {
                    return vec![ack(request_opcode, AckCode::AccessDenied)];
                }
                self.authenticated = true;
                vec![Reply::Auth {
                    state: crate::handlers::AuthState::Complete,
                    challenge: 0,
                }]
            }
            Request::ScreenGet => vec![Reply::Screen(self.screen)],
            Request::ScreenSet { screen } => {
                self.screen = screen;
                vec![ack(request_opcode, AckCode::Ok)]
            }
            Request::VariableGet { screen, variable } => {
                match self.variables.get(&(screen, variable)) {
                    Some(value) => vec![Reply::Variable {
                        screen,
                        variable,
                        value: value.clone(),
                    }],
                    None => vec![ack(request_opcode, AckCode::Nack)],
                }
            }
            Request::VariableSet {
                screen,
                variable,
                value,
            } => {
                self.variables.insert((screen, variable), value);
                vec![ack(request_opcode, AckCode::Ok)]
            }
            Request::BrightnessSet { level, store } => {
                self.set_brightness(level, store);
                vec![ack(request_opcode, AckCode::Ok)]
            }
            Request::GetVersion => vec![Reply::Version(VersionReport {
                firmware: self.firmware,
                bootloader: DEFAULT_BOOTLOADER,
                project: self.project,
            })],
            Request::GetHardwareId => vec![Reply::HardwareId(self.hardware_id())],
            Request::GetProjectInfo => {
                let info = match self.project {
                    Some(_) => ProjectInfo::new(ProjectType::Guide, DEFAULT_PROJECT_CHECKSUM),
                    None => ProjectInfo::default(),
                };
                vec![Reply::ProjectInfo(info)]
            }
            Request::UpdateBegin { kind, total } => self.begin_update(kind, total),
            Request::UpdateChunk { offset, data, .. } => self.accept_chunk(offset, &data),
        }
    }

    fn hardware_id(&self) -> HardwareId {
        self.behaviour.hardware_id.unwrap_or(match self.kind {
            TransportKind::Hid => HardwareId::RefreshUsb,
            TransportKind::Can => HardwareId::RefreshCan,
        })
    }

    fn set_brightness(&mut self, level: Brightness, store: bool) {
        self.brightness = level.value();
        if store {
            self.stored_brightness = level.value();
        }
    }

    fn restart(&mut self) {
        self.restarts += 1;
        self.screen = ScreenId::from(0);
        self.brightness = self.stored_brightness;
        self.authenticated = false;
        self.challenge = None;
        self.pending.clear();
    }

    fn begin_update(&mut self, kind: PayloadKind, total: u32) -> Vec<Reply> {
        let acceptance = if self.behaviour.busy {
            UpdateAcceptance::Busy
        } else if self.behaviour.reject_update {
            UpdateAcceptance::Rejected
        } else {
            UpdateAcceptance::Accepted
        };

        if acceptance == UpdateAcceptance::Accepted {
            self.update = Some(UpdateState {
                kind,
                total,
                received: Vec::new(),
                stale_acks_left: self.behaviour.stale_ack_repeats,
                drop_pending: self.behaviour.drop_ack_at.is_some(),
                ahead_pending: self.behaviour.ahead_ack_at.is_some(),
            });
        }
        vec![Reply::UpdateReply {
            acceptance,
            max_chunk: self.behaviour.max_chunk,
        }]
    }

    fn accept_chunk(&mut self, offset: u32, data: &[u8]) -> Vec<Reply> {
        let behaviour = &self.behaviour;
        let Some(update) = self.update.as_mut() else {
            return vec![ack(opcode::UPDATE_FIRMWARE_CHUNK, AckCode::Nack)];
        };
        let received = u32::try_from(update.received.len()).unwrap_or(u32::MAX);

        if behaviour.stale_ack_at == Some(offset) && update.stale_acks_left > 0 {
            update.stale_acks_left -= 1;
            return vec![Reply::UploadProgress {
                error: UploadError::Ok,
                next_offset: offset,
            }];
        }

        if offset == received {
            update.received.extend_from_slice(data);
        }
        let next_offset = u32::try_from(update.received.len()).unwrap_or(u32::MAX);

        if behaviour.drop_ack_at == Some(offset) && update.drop_pending {
            update.drop_pending = false;
            return Vec::new();
        }
        if behaviour.ahead_ack_at == Some(offset) && update.ahead_pending {
            update.ahead_pending = false;
            return vec![Reply::UploadProgress {
                error: UploadError::Ok,
                next_offset: next_offset.saturating_add(1),
            }];
        }

        let mut replies = vec![Reply::UploadProgress {
            error: UploadError::Ok,
            next_offset,
        }];
        if next_offset >= update.total {
            let component = match update.kind {
                PayloadKind::Project => ComponentKind::Project,
                PayloadKind::Firmware | PayloadKind::Package => ComponentKind::Firmware,
            };
            replies.extend([
                Reply::ComponentProgress {
                    component,
                    status: ComponentStatus::Progress,
                    percent: 50,
                },
                Reply::ComponentProgress {
                    component,
                    status: ComponentStatus::End,
                    percent: 100,
                },
                Reply::UpdateFinished(behaviour.update_status),
            ]);
        }
        replies
    }
}

fn ack(acked: u8, code: AckCode) -> Reply {
    Reply::Ack {
        opcode: acked,
        code,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    const SECRET: u32 = 0x11;

    fn send(device: &mut SimulatedDevice, request: &Request) -> Vec<Reply> {
        let frames = FrameCodec::encode_request(request, 62).expect("request should encode");
        frames
            .iter()
            .flat_map(|frame| device.receive(&frame.to_bytes(), SECRET))
            .map(|outbound| outbound.reply)
            .collect()
    }

    #[test]
    fn variables_round_trip_through_the_device() {
        let mut device = SimulatedDevice::new(TransportKind::Can, DeviceBehaviour::default());
        let screen = ScreenId::from(6);
        let variable = VariableId::from(2);

        send(
            &mut device,
            &Request::VariableSet {
                screen,
                variable,
                value: VariableValue::Int(20),
            },
        );
        let replies = send(&mut device, &Request::VariableGet { screen, variable });

        assert_eq!(
            vec![Reply::Variable {
                screen,
                variable,
                value: VariableValue::Int(20),
            }],
            replies
        );
    }

    #[test]
    fn utility_restart_needs_authentication() {
        let mut device = SimulatedDevice::new(TransportKind::Hid, DeviceBehaviour::default());

        let denied = send(&mut device, &Request::Restart { utility: true });
        assert_eq!(vec![ack(opcode::RESTART_UTILITY, AckCode::AccessDenied)], denied);

        let challenge = match send(
            &mut device,
            &Request::AuthRequest {
                clearance: crate::handlers::Clearance::ServiceTool,
            },
        )
        .as_slice()
        {
            [Reply::Auth { challenge, .. }] => *challenge,
            other => panic!("unexpected replies {other:?}"),
        };
        let key = service_tool_key(SECRET, challenge);
        let complete = send(&mut device, &Request::AuthResponse { key });
        assert_matches!(complete.as_slice(), [Reply::Auth { state: crate::handlers::AuthState::Complete, .. }]);

        let accepted = send(&mut device, &Request::Restart { utility: true });
        assert_eq!(vec![ack(opcode::RESTART_UTILITY, AckCode::Ok)], accepted);
        assert_eq!(1, device.restarts());
    }

    #[test]
    fn drop_fault_consumes_replies_in_order() {
        let behaviour = DeviceBehaviour::builder().drop_replies(1).build();
        let mut device = SimulatedDevice::new(TransportKind::Hid, behaviour);

        assert!(send(&mut device, &Request::ScreenGet).is_empty());
        assert_eq!(vec![Reply::Screen(ScreenId::from(0))], send(&mut device, &Request::ScreenGet));
    }

    #[test]
    fn final_chunk_reports_completion() {
        let mut device = SimulatedDevice::new(TransportKind::Hid, DeviceBehaviour::default());
        send(
            &mut device,
            &Request::UpdateBegin {
                kind: PayloadKind::Firmware,
                total: 4,
            },
        );

        let replies = send(
            &mut device,
            &Request::UpdateChunk {
                kind: PayloadKind::Firmware,
                offset: 0,
                data: vec![1, 2, 3, 4],
            },
        );

        assert_eq!(4, replies.len());
        assert_eq!(Some(Reply::UpdateFinished(UpdateStatus::Success)), replies.last().cloned());
        assert_eq!(Some(&[1, 2, 3, 4][..]), device.received_update());
    }

    #[test]
    fn corrupt_replies_break_the_frame_index() {
        let outbound = Outbound {
            reply: Reply::Screen(ScreenId::from(1)),
            corrupt: true,
        };
        assert_eq!(vec![vec![0x0A, 0x01, 0x01, 0x01, 0x00]], outbound.frames(62));
    }
}
