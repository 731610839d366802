//! J1939 building blocks: identifiers, NAMEs, and the transport protocol.
//!
//! Everything here is pure. The async link in `can_link` and the simulated
//! devices in `fake_backend` drive these state machines from opposite ends.

use std::fmt;

use crate::protocol::{J1939_DEFAULT_PRIORITY, J1939_GLOBAL_ADDRESS, J1939_MAX_MESSAGE_LEN, pgn};

const PDU2_THRESHOLD: u8 = 0xF0;
const TP_DT_DATA_LEN: usize = 7;
const TP_PADDING: u8 = 0xFF;

const CM_RTS: u8 = 0x10;
const CM_CTS: u8 = 0x11;
const CM_EOMA: u8 = 0x13;
const CM_BAM: u8 = 0x20;
const CM_ABORT: u8 = 0xFF;

/// Abort reason: a packet arrived out of sequence.
pub(crate) const ABORT_BAD_SEQUENCE: u8 = 7;
/// Abort reason: the receiver cannot accept a new session.
pub(crate) const ABORT_BUSY: u8 = 1;
/// Abort reason: the peer stopped answering within the session timeout.
pub(crate) const ABORT_TIMEOUT: u8 = 3;

/// A raw extended CAN frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CanFrame {
    id: u32,
    data: Vec<u8>,
}

impl CanFrame {
    /// Creates a frame from a 29-bit identifier and up to 8 data bytes.
    #[must_use]
    pub fn new(id: u32, data: &[u8]) -> Self {
        let len = data.len().min(8);
        Self {
            id: id & 0x1FFF_FFFF,
            data: data[..len].to_vec(),
        }
    }

    /// Returns the 29-bit identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the frame data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X} {}", self.id, crate::utils::format_hex(&self.data))
    }
}

/// Decoded fields of a 29-bit J1939 identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct J1939Id {
    pub priority: u8,
    pub pgn: u32,
    pub source: u8,
    pub destination: u8,
}

impl J1939Id {
    /// Creates an identifier with the default priority.
    #[must_use]
    pub fn new(pgn: u32, source: u8, destination: u8) -> Self {
        Self {
            priority: J1939_DEFAULT_PRIORITY,
            pgn,
            source,
            destination,
        }
    }

    /// Composes the raw identifier.
    ///
    /// ```
    /// use te::J1939Id;
    ///
    /// assert_eq!(0x18EC_F211, J1939Id::new(0xEC00, 0x11, 0xF2).to_raw());
    /// ```
    #[must_use]
    pub fn to_raw(self) -> u32 {
        let data_page = (self.pgn >> 16) & 0x03;
        let pdu_format = (self.pgn >> 8) & 0xFF;
        let pdu_specific = if is_pdu1(self.pgn) {
            u32::from(self.destination)
        } else {
            self.pgn & 0xFF
        };
        (u32::from(self.priority & 0x07) << 26)
            | (data_page << 24)
            | (pdu_format << 16)
            | (pdu_specific << 8)
            | u32::from(self.source)
    }

    /// Splits a raw identifier into its fields.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        let source = (raw & 0xFF) as u8;
        let pdu_specific = ((raw >> 8) & 0xFF) as u8;
        let pdu_format = ((raw >> 16) & 0xFF) as u8;
        let data_page = (raw >> 24) & 0x03;
        let priority = ((raw >> 26) & 0x07) as u8;
        if pdu_format < PDU2_THRESHOLD {
            Self {
                priority,
                pgn: (data_page << 16) | (u32::from(pdu_format) << 8),
                source,
                destination: pdu_specific,
            }
        } else {
            Self {
                priority,
                pgn: (data_page << 16) | (u32::from(pdu_format) << 8) | u32::from(pdu_specific),
                source,
                destination: J1939_GLOBAL_ADDRESS,
            }
        }
    }
}

fn is_pdu1(pgn: u32) -> bool {
    (((pgn >> 8) & 0xFF) as u8) < PDU2_THRESHOLD
}

/// A complete J1939 message, possibly reassembled from many frames.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct J1939Message {
    pub pgn: u32,
    pub source: u8,
    pub destination: u8,
    pub data: Vec<u8>,
}

impl J1939Message {
    /// Converts a single-frame message into its CAN frame.
    pub(crate) fn to_frame(&self) -> CanFrame {
        CanFrame::new(
            J1939Id::new(self.pgn, self.source, self.destination).to_raw(),
            &self.data,
        )
    }

    pub(crate) fn from_frame(frame: &CanFrame) -> Self {
        let id = J1939Id::from_raw(frame.id());
        Self {
            pgn: id.pgn,
            source: id.source,
            destination: id.destination,
            data: frame.data().to_vec(),
        }
    }
}

/// Packed 64-bit J1939 NAME. Lower values win address arbitration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct J1939Name(u64);

/// Field values of a J1939 NAME.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, bon::Builder)]
pub struct J1939NameFields {
    #[builder(default)]
    pub identity: u32,
    #[builder(default)]
    pub manufacturer: u16,
    #[builder(default)]
    pub ecu_instance: u8,
    #[builder(default)]
    pub function_instance: u8,
    #[builder(default)]
    pub function: u8,
    #[builder(default)]
    pub vehicle_system: u8,
    #[builder(default)]
    pub vehicle_system_instance: u8,
    #[builder(default)]
    pub industry_group: u8,
    #[builder(default)]
    pub arbitrary_address_capable: bool,
}

impl J1939Name {
    /// Wraps a raw NAME.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw NAME.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Packs NAME fields, truncating each to its bit width.
    ///
    /// ```
    /// use te::{J1939Name, J1939NameFields};
    ///
    /// let fields = J1939NameFields::builder().identity(7).manufacturer(0x2A).build();
    /// let name = J1939Name::from_fields(fields);
    /// assert_eq!(fields, name.fields());
    /// ```
    #[must_use]
    pub fn from_fields(fields: J1939NameFields) -> Self {
        let raw = u64::from(fields.identity & 0x1F_FFFF)
            | (u64::from(fields.manufacturer & 0x7FF) << 21)
            | (u64::from(fields.ecu_instance & 0x07) << 32)
            | (u64::from(fields.function_instance & 0x1F) << 35)
            | (u64::from(fields.function) << 40)
            | (u64::from(fields.vehicle_system & 0x7F) << 49)
            | (u64::from(fields.vehicle_system_instance & 0x0F) << 56)
            | (u64::from(fields.industry_group & 0x07) << 60)
            | (u64::from(fields.arbitrary_address_capable) << 63);
        Self(raw)
    }

    /// Unpacks the NAME fields.
    #[must_use]
    pub fn fields(self) -> J1939NameFields {
        let raw = self.0;
        J1939NameFields {
            identity: (raw & 0x1F_FFFF) as u32,
            manufacturer: ((raw >> 21) & 0x7FF) as u16,
            ecu_instance: ((raw >> 32) & 0x07) as u8,
            function_instance: ((raw >> 35) & 0x1F) as u8,
            function: ((raw >> 40) & 0xFF) as u8,
            vehicle_system: ((raw >> 49) & 0x7F) as u8,
            vehicle_system_instance: ((raw >> 56) & 0x0F) as u8,
            industry_group: ((raw >> 60) & 0x07) as u8,
            arbitrary_address_capable: (raw >> 63) & 0x01 == 1,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_le_bytes(bytes)))
    }
}

impl fmt::Display for J1939Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Transport-protocol connection management messages.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum TpControl {
    RequestToSend {
        size: u16,
        packets: u8,
        max_per_cts: u8,
        pgn: u32,
    },
    ClearToSend {
        packets: u8,
        next: u8,
        pgn: u32,
    },
    EndOfMessageAck {
        size: u16,
        packets: u8,
        pgn: u32,
    },
    Broadcast {
        size: u16,
        packets: u8,
        pgn: u32,
    },
    Abort {
        reason: u8,
        pgn: u32,
    },
}

impl TpControl {
    pub(crate) fn encode(self) -> [u8; 8] {
        let (head, pgn) = match self {
            Self::RequestToSend {
                size,
                packets,
                max_per_cts,
                pgn,
            } => {
                let [lo, hi] = size.to_le_bytes();
                ([CM_RTS, lo, hi, packets, max_per_cts], pgn)
            }
            Self::ClearToSend { packets, next, pgn } => {
                ([CM_CTS, packets, next, TP_PADDING, TP_PADDING], pgn)
            }
            Self::EndOfMessageAck { size, packets, pgn } => {
                let [lo, hi] = size.to_le_bytes();
                ([CM_EOMA, lo, hi, packets, TP_PADDING], pgn)
            }
            Self::Broadcast { size, packets, pgn } => {
                let [lo, hi] = size.to_le_bytes();
                ([CM_BAM, lo, hi, packets, TP_PADDING], pgn)
            }
            Self::Abort { reason, pgn } => {
                ([CM_ABORT, reason, TP_PADDING, TP_PADDING, TP_PADDING], pgn)
            }
        };
        let [p0, p1, p2, _] = pgn.to_le_bytes();
        [head[0], head[1], head[2], head[3], head[4], p0, p1, p2]
    }

    pub(crate) fn decode(data: &[u8]) -> Option<Self> {
        let bytes: &[u8; 8] = data.get(..8)?.try_into().ok()?;
        let pgn = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], 0]);
        let size = u16::from_le_bytes([bytes[1], bytes[2]]);
        match bytes[0] {
            CM_RTS => Some(Self::RequestToSend {
                size,
                packets: bytes[3],
                max_per_cts: bytes[4],
                pgn,
            }),
            CM_CTS => Some(Self::ClearToSend {
                packets: bytes[1],
                next: bytes[2],
                pgn,
            }),
            CM_EOMA => Some(Self::EndOfMessageAck {
                size,
                packets: bytes[3],
                pgn,
            }),
            CM_BAM => Some(Self::Broadcast {
                size,
                packets: bytes[3],
                pgn,
            }),
            CM_ABORT => Some(Self::Abort {
                reason: bytes[1],
                pgn,
            }),
            _ => None,
        }
    }
}

/// Number of TP.DT packets needed for `len` bytes.
pub(crate) fn packet_count(len: usize) -> usize {
    len.div_ceil(TP_DT_DATA_LEN)
}

/// Builds TP.DT packet `sequence` (1-based) of `data`, padded with `0xFF`.
fn data_packet(data: &[u8], sequence: u8) -> Option<[u8; 8]> {
    let start = usize::from(sequence.checked_sub(1)?) * TP_DT_DATA_LEN;
    let chunk = data.get(start..)?;
    if chunk.is_empty() {
        return None;
    }
    let chunk = &chunk[..chunk.len().min(TP_DT_DATA_LEN)];
    let mut packet = [TP_PADDING; 8];
    packet[0] = sequence;
    packet[1..=chunk.len()].copy_from_slice(chunk);
    Some(packet)
}

/// Sending side of one transport-protocol session.
#[derive(Debug)]
pub(crate) struct TpSender {
    source: u8,
    destination: u8,
    pgn: u32,
    data: Vec<u8>,
    packets: u8,
}

/// What the sender should do after a connection-management message.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum TpSenderStep {
    Send(Vec<CanFrame>),
    Wait,
    Done,
    Aborted { reason: u8 },
}

impl TpSender {
    /// Creates a sender; returns `None` when `data` does not need or fit the transport protocol.
    pub(crate) fn new(source: u8, destination: u8, pgn: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() <= 8 || data.len() > J1939_MAX_MESSAGE_LEN {
            return None;
        }
        let packets = u8::try_from(packet_count(data.len())).ok()?;
        Some(Self {
            source,
            destination,
            pgn,
            data,
            packets,
        })
    }

    pub(crate) fn is_broadcast(&self) -> bool {
        self.destination == J1939_GLOBAL_ADDRESS
    }

    fn size(&self) -> u16 {
        u16::try_from(self.data.len()).unwrap_or(u16::MAX)
    }

    /// Frames that open the session: an RTS, or a BAM followed by every data packet.
    pub(crate) fn open(&self) -> Vec<CanFrame> {
        if self.is_broadcast() {
            let bam = TpControl::Broadcast {
                size: self.size(),
                packets: self.packets,
                pgn: self.pgn,
            };
            let mut frames = vec![self.control_frame(bam)];
            frames.extend(self.data_frames(1, self.packets));
            return frames;
        }
        let rts = TpControl::RequestToSend {
            size: self.size(),
            packets: self.packets,
            max_per_cts: self.packets,
            pgn: self.pgn,
        };
        vec![self.control_frame(rts)]
    }

    /// Advances on a connection-management message from the receiver.
    pub(crate) fn on_control(&self, control: TpControl) -> TpSenderStep {
        match control {
            TpControl::ClearToSend { pgn, .. } | TpControl::EndOfMessageAck { pgn, .. }
                if pgn != self.pgn =>
            {
                TpSenderStep::Wait
            }
            TpControl::ClearToSend { packets: 0, .. } => TpSenderStep::Wait,
            TpControl::ClearToSend { packets, next, .. } => {
                let last = next.saturating_add(packets - 1).min(self.packets);
                TpSenderStep::Send(self.data_frames(next, last))
            }
            TpControl::EndOfMessageAck { .. } => TpSenderStep::Done,
            TpControl::Abort { reason, pgn } if pgn == self.pgn => {
                TpSenderStep::Aborted { reason }
            }
            _ => TpSenderStep::Wait,
        }
    }

    /// Builds the abort the sender emits when it gives up on the session.
    pub(crate) fn abort_frame(&self, reason: u8) -> CanFrame {
        self.control_frame(TpControl::Abort {
            reason,
            pgn: self.pgn,
        })
    }

    fn control_frame(&self, control: TpControl) -> CanFrame {
        CanFrame::new(
            J1939Id::new(pgn::TP_CM, self.source, self.destination).to_raw(),
            &control.encode(),
        )
    }

    fn data_frames(&self, first: u8, last: u8) -> Vec<CanFrame> {
        let id = J1939Id::new(pgn::TP_DT, self.source, self.destination).to_raw();
        (first.max(1)..=last)
            .filter_map(|sequence| data_packet(&self.data, sequence))
            .map(|packet| CanFrame::new(id, &packet))
            .collect()
    }
}

/// Errors raised while reassembling TP.DT packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ReassemblyError {
    /// A packet repeated or skipped a sequence number.
    OutOfSequence { expected: u8, received: u8 },
}

/// Receiving side of one transport-protocol session.
#[derive(Debug)]
pub(crate) struct Reassembler {
    source: u8,
    destination: u8,
    pgn: u32,
    size: usize,
    packets: u8,
    next_sequence: u8,
    buffer: Vec<u8>,
    broadcast: bool,
}

/// Output of feeding one packet to a [`Reassembler`].
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Reassembly {
    Pending,
    Complete {
        message: J1939Message,
        reply: Option<CanFrame>,
    },
}

impl Reassembler {
    /// Accepts an RTS or BAM from `source`; returns the reassembler and any immediate reply (a CTS).
    pub(crate) fn accept(
        control: TpControl,
        source: u8,
        destination: u8,
    ) -> Option<(Self, Option<CanFrame>)> {
        let (size, packets, pgn, broadcast) = match control {
            TpControl::RequestToSend {
                size, packets, pgn, ..
            } => (size, packets, pgn, false),
            TpControl::Broadcast { size, packets, pgn } => (size, packets, pgn, true),
            _ => return None,
        };
        if packets == 0 || packet_count(usize::from(size)) != usize::from(packets) {
            return None;
        }
        let reassembler = Self {
            source,
            destination,
            pgn,
            size: usize::from(size),
            packets,
            next_sequence: 1,
            buffer: Vec::with_capacity(usize::from(size)),
            broadcast,
        };
        let reply = (!broadcast).then(|| {
            reassembler.control_frame(TpControl::ClearToSend {
                packets,
                next: 1,
                pgn,
            })
        });
        Some((reassembler, reply))
    }

    pub(crate) fn source(&self) -> u8 {
        self.source
    }

    /// Feeds one TP.DT packet.
    pub(crate) fn feed(&mut self, packet: &[u8]) -> Result<Reassembly, ReassemblyError> {
        let Some((&sequence, body)) = packet.split_first() else {
            return Ok(Reassembly::Pending);
        };
        if sequence != self.next_sequence {
            return Err(ReassemblyError::OutOfSequence {
                expected: self.next_sequence,
                received: sequence,
            });
        }
        let remaining = self.size - self.buffer.len();
        self.buffer
            .extend_from_slice(&body[..body.len().min(remaining).min(TP_DT_DATA_LEN)]);
        self.next_sequence = self.next_sequence.wrapping_add(1);

        if sequence < self.packets {
            return Ok(Reassembly::Pending);
        }
        let reply = (!self.broadcast).then(|| {
            self.control_frame(TpControl::EndOfMessageAck {
                size: u16::try_from(self.size).unwrap_or(u16::MAX),
                packets: self.packets,
                pgn: self.pgn,
            })
        });
        Ok(Reassembly::Complete {
            message: J1939Message {
                pgn: self.pgn,
                source: self.source,
                destination: if self.broadcast {
                    J1939_GLOBAL_ADDRESS
                } else {
                    self.destination
                },
                data: std::mem::take(&mut self.buffer),
            },
            reply,
        })
    }

    /// Builds the abort the receiver sends after a sequence error.
    pub(crate) fn abort_frame(&self, reason: u8) -> Option<CanFrame> {
        (!self.broadcast).then(|| self.control_frame(TpControl::Abort { reason, pgn: self.pgn }))
    }

    fn control_frame(&self, control: TpControl) -> CanFrame {
        CanFrame::new(
            J1939Id::new(pgn::TP_CM, self.destination, self.source).to_raw(),
            &control.encode(),
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::proprietary_a(0xEF00, 0x11, 0xF2, 0x18EF_F211)]
    #[case::acknowledgement(0xE800, 0xF2, 0x00, 0x18E8_00F2)]
    #[case::address_claimed(0xEE00, 0xF3, 0xFF, 0x18EE_FFF3)]
    fn pdu1_identifiers_carry_destination(
        #[case] pgn: u32,
        #[case] source: u8,
        #[case] destination: u8,
        #[case] raw: u32,
    ) {
        let id = J1939Id::new(pgn, source, destination);
        assert_eq!(raw, id.to_raw());
        assert_eq!(id, J1939Id::from_raw(raw));
    }

    #[test]
    fn pdu2_identifiers_fold_group_extension_into_pgn() {
        let id = J1939Id::from_raw(0x18FE_DAF2);
        assert_eq!(0xFEDA, id.pgn);
        assert_eq!(0xF2, id.source);
        assert_eq!(J1939_GLOBAL_ADDRESS, id.destination);
        assert_eq!(0x18FE_DAF2, id.to_raw());
    }

    #[test]
    fn name_fields_occupy_documented_bits() {
        let fields = J1939NameFields::builder()
            .identity(0x1F_FFFF)
            .manufacturer(0x7FF)
            .ecu_instance(0x7)
            .function_instance(0x1F)
            .function(0xFF)
            .vehicle_system(0x7F)
            .vehicle_system_instance(0xF)
            .industry_group(0x7)
            .arbitrary_address_capable(true)
            .build();
        let name = J1939Name::from_fields(fields);

        assert_eq!(u64::MAX & !(1 << 48), name.raw());
        assert_eq!(fields, name.fields());
    }

    #[test]
    fn rts_matches_literal_bytes() {
        let control = TpControl::RequestToSend {
            size: 11,
            packets: 2,
            max_per_cts: 2,
            pgn: 0xEF00,
        };
        assert_eq!(
            [0x10, 0x0B, 0x00, 0x02, 0x02, 0x00, 0xEF, 0x00],
            control.encode()
        );
        assert_eq!(Some(control), TpControl::decode(&control.encode()));
    }

    #[test]
    fn sender_and_reassembler_complete_an_addressed_session() {
        let payload: Vec<u8> = (0..20).collect();
        let sender = TpSender::new(0x11, 0xF2, 0xEF00, payload.clone())
            .expect("20 bytes should need the transport protocol");
        let opening = sender.open();
        assert_eq!(1, opening.len());
        let rts = TpControl::decode(opening[0].data()).expect("opening frame should be an RTS");

        let (mut receiver, cts) =
            Reassembler::accept(rts, 0x11, 0xF2).expect("RTS should open a session");
        let cts = cts.expect("addressed sessions reply with CTS");
        assert_eq!(0x18EC_11F2, cts.id());

        let TpSenderStep::Send(packets) =
            sender.on_control(TpControl::decode(cts.data()).expect("CTS should decode"))
        else {
            panic!("CTS should release data packets");
        };
        assert_eq!(3, packets.len());
        assert_eq!(
            &[0x03, 14, 15, 16, 17, 18, 19, 0xFF],
            packets[2].data()
        );

        let mut outcome = Reassembly::Pending;
        for packet in &packets {
            outcome = receiver.feed(packet.data()).expect("packets arrive in order");
        }
        assert_matches!(
            outcome,
            Reassembly::Complete { message, reply: Some(eoma) } => {
                assert_eq!(payload, message.data);
                assert_eq!(0xF2, message.destination);
                assert_eq!(
                    TpSenderStep::Done,
                    sender.on_control(TpControl::decode(eoma.data()).expect("EOMA should decode"))
                );
            }
        );
    }

    #[test]
    fn reassembler_rejects_sequence_gaps() {
        let rts = TpControl::RequestToSend {
            size: 20,
            packets: 3,
            max_per_cts: 3,
            pgn: 0xEF00,
        };
        let (mut receiver, _cts) =
            Reassembler::accept(rts, 0xF2, 0x11).expect("RTS should open a session");

        receiver
            .feed(&[1, 0, 1, 2, 3, 4, 5, 6])
            .expect("first packet is in sequence");
        let result = receiver.feed(&[3, 0, 1, 2, 3, 4, 5, 6]);

        assert_eq!(
            Err(ReassemblyError::OutOfSequence {
                expected: 2,
                received: 3,
            }),
            result
        );
    }

    #[test]
    fn broadcast_sessions_send_every_packet_without_handshake() {
        let sender = TpSender::new(0x11, J1939_GLOBAL_ADDRESS, 0xEF00, vec![0xAA; 9])
            .expect("9 bytes should need the transport protocol");
        let frames = sender.open();

        assert_eq!(3, frames.len());
        assert_eq!(
            Some(TpControl::Broadcast {
                size: 9,
                packets: 2,
                pgn: 0xEF00,
            }),
            TpControl::decode(frames[0].data())
        );
    }

    #[test]
    fn short_messages_do_not_use_the_transport_protocol() {
        assert!(TpSender::new(0x11, 0xF2, 0xEF00, vec![0; 8]).is_none());
    }
}
