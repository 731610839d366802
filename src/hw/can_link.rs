use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::j1939::{
    ABORT_BAD_SEQUENCE, ABORT_BUSY, ABORT_TIMEOUT, CanFrame, J1939Message, J1939Name, J1939NameFields,
    Reassembler, Reassembly, TpControl, TpSender, TpSenderStep,
};
use crate::error::TransportError;
use crate::protocol::{J1939_GLOBAL_ADDRESS, J1939_MAX_MESSAGE_LEN, pgn};

/// Tool address used when none is configured.
pub const DEFAULT_TOOL_ADDRESS: u8 = 0x11;
/// Default window for address-claim replies during discovery.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_millis(300);

const CLAIM_CONTENTION_WINDOW: Duration = Duration::from_millis(250);
const ACK_UNADDRESSED_DESTINATION: u8 = 0x00;
/// J1939 T3: how long a sender waits for CTS or EOMA after its last packet.
const TP_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1250);

/// Raw frame access to one CAN interface.
#[async_trait]
pub trait CanBus: Send + Sync {
    /// Name of the interface, e.g. `can0`.
    fn interface(&self) -> &str;

    /// Writes one frame.
    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Reads one frame, failing with `TimedOut` once `timeout` elapses.
    async fn recv_frame(&self, timeout: Duration) -> Result<CanFrame, TransportError>;
}

/// Settings for one CAN interface.
#[derive(Debug, Clone, Builder)]
pub struct CanConfig {
    #[builder(into)]
    interface: String,
    #[builder(default = DEFAULT_TOOL_ADDRESS)]
    tool_address: u8,
    #[builder(default = default_tool_name())]
    tool_name: J1939Name,
}

impl CanConfig {
    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Source address the tool claims.
    #[must_use]
    pub fn tool_address(&self) -> u8 {
        self.tool_address
    }
}

/// NAME the tool claims with: a self-configurable service tool (function 129).
#[must_use]
pub fn default_tool_name() -> J1939Name {
    J1939Name::from_fields(
        J1939NameFields::builder()
            .identity(0x1_F11E)
            .function(129)
            .industry_group(0)
            .arbitrary_address_capable(true)
            .build(),
    )
}

/// One node answering an address-claim request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClaimedAddress {
    pub address: u8,
    pub name: J1939Name,
}

/// A J1939 controller application bound to one CAN interface.
///
/// Sends single-frame or segmented messages, reassembles inbound sessions,
/// and defends the tool's claimed address.
pub struct J1939Link {
    bus: Box<dyn CanBus>,
    address: u8,
    name: J1939Name,
    inbound: VecDeque<J1939Message>,
    sessions: HashMap<u8, Reassembler>,
    claims: Vec<ClaimedAddress>,
    claim_lost: bool,
}

impl std::fmt::Debug for J1939Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("J1939Link")
            .field("interface", &self.bus.interface())
            .field("address", &self.address)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl J1939Link {
    /// Wraps a bus and claims the configured address.
    ///
    /// # Errors
    ///
    /// Returns `AddressClaimLost` when a node with a lower NAME already holds
    /// the address, or a link error when the bus fails.
    #[instrument(skip(bus, config), level = "debug", fields(interface = bus.interface(), address = config.tool_address))]
    pub async fn open(bus: Box<dyn CanBus>, config: &CanConfig) -> Result<Self, TransportError> {
        let mut link = Self {
            bus,
            address: config.tool_address,
            name: config.tool_name,
            inbound: VecDeque::new(),
            sessions: HashMap::new(),
            claims: Vec::new(),
            claim_lost: false,
        };
        link.claim_address().await?;
        Ok(link)
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        self.bus.interface()
    }

    /// The tool's claimed source address.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    async fn claim_address(&mut self) -> Result<(), TransportError> {
        self.send_claim().await?;
        let deadline = Instant::now() + CLAIM_CONTENTION_WINDOW;
        loop {
            match self.pump(deadline).await {
                Ok(()) => {}
                Err(TransportError::TimedOut { .. }) => break,
                Err(error) => return Err(error),
            }
            self.inbound.clear();
        }
        self.check_claim()
    }

    async fn send_claim(&self) -> Result<(), TransportError> {
        let claim = J1939Message {
            pgn: pgn::ADDRESS_CLAIMED,
            source: self.address,
            destination: J1939_GLOBAL_ADDRESS,
            data: self.name.to_bytes().to_vec(),
        };
        self.bus.send_frame(&claim.to_frame()).await
    }

    fn check_claim(&self) -> Result<(), TransportError> {
        if self.claim_lost {
            return Err(TransportError::AddressClaimLost {
                interface: self.interface().to_string(),
                address: self.address,
            });
        }
        Ok(())
    }

    /// Requests address claims and collects every node that answers within `window`.
    ///
    /// # Errors
    ///
    /// Returns an error when the bus fails or the tool loses its own address.
    #[instrument(skip(self), level = "debug", fields(interface = self.interface()))]
    pub async fn scan(&mut self, window: Duration) -> Result<Vec<ClaimedAddress>, TransportError> {
        self.claims.clear();
        let request = J1939Message {
            pgn: pgn::REQUEST,
            source: self.address,
            destination: J1939_GLOBAL_ADDRESS,
            data: pgn_bytes(pgn::ADDRESS_CLAIMED).to_vec(),
        };
        self.bus.send_frame(&request.to_frame()).await?;

        let deadline = Instant::now() + window;
        loop {
            match self.pump(deadline).await {
                Ok(()) => {}
                Err(TransportError::TimedOut { .. }) => break,
                Err(error) => return Err(error),
            }
        }
        self.check_claim()?;

        let mut found: Vec<ClaimedAddress> = Vec::new();
        for claim in self.claims.drain(..) {
            if claim.address == self.address || found.iter().any(|c| c.address == claim.address)
            {
                continue;
            }
            found.push(claim);
        }
        found.sort_by_key(|claim| claim.address);
        debug!(count = found.len(), "address scan finished");
        Ok(found)
    }

    /// Sends one message, segmenting it when it exceeds a single frame.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` above the transport-protocol limit, `TimedOut`
    /// when the receiver stops answering a segmented session, or a link error.
    #[instrument(skip(self, data), level = "trace", fields(len = data.len()))]
    pub async fn send(
        &mut self,
        message_pgn: u32,
        destination: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if data.len() > J1939_MAX_MESSAGE_LEN {
            return Err(TransportError::FrameTooLarge {
                len: data.len(),
                max: J1939_MAX_MESSAGE_LEN,
            });
        }
        let message = J1939Message {
            pgn: message_pgn,
            source: self.address,
            destination,
            data: data.to_vec(),
        };
        let Some(sender) = TpSender::new(self.address, destination, message_pgn, data.to_vec()) else {
            return self.bus.send_frame(&message.to_frame()).await;
        };

        for frame in sender.open() {
            self.bus.send_frame(&frame).await?;
        }
        if sender.is_broadcast() {
            return Ok(());
        }

        // Unrelated traffic does not extend the deadline; only a CTS for this session does.
        let mut deadline = Instant::now() + TP_RESPONSE_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                return self.abandon(&sender).await;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self.bus.recv_frame(remaining).await {
                Ok(frame) => frame,
                Err(TransportError::TimedOut { .. }) => return self.abandon(&sender).await,
                Err(error) => return Err(error),
            };
            let received = J1939Message::from_frame(&frame);
            let is_reply = received.pgn == pgn::TP_CM
                && received.source == destination
                && received.destination == self.address;
            let control = is_reply.then(|| TpControl::decode(&received.data)).flatten();
            match control {
                Some(
                    control @ (TpControl::ClearToSend { .. }
                    | TpControl::EndOfMessageAck { .. }
                    | TpControl::Abort { .. }),
                ) => {
                    let clear_to_send = matches!(
                        control,
                        TpControl::ClearToSend { pgn: session_pgn, .. } if session_pgn == message_pgn
                    );
                    match sender.on_control(control) {
                        TpSenderStep::Send(frames) => {
                            for frame in frames {
                                self.bus.send_frame(&frame).await?;
                            }
                        }
                        TpSenderStep::Wait => {}
                        TpSenderStep::Done => return Ok(()),
                        TpSenderStep::Aborted { reason } => {
                            return Err(TransportError::SessionAborted {
                                peer: destination,
                                reason,
                            });
                        }
                    }
                    if clear_to_send {
                        deadline = Instant::now() + TP_RESPONSE_TIMEOUT;
                    }
                }
                _ => self.process(frame).await?,
            }
        }
    }

    async fn abandon(&self, sender: &TpSender) -> Result<(), TransportError> {
        warn!(interface = self.interface(), "receiver stopped answering; aborting transport session");
        self.bus.send_frame(&sender.abort_frame(ABORT_TIMEOUT)).await?;
        Err(TransportError::TimedOut {
            timeout: TP_RESPONSE_TIMEOUT,
        })
    }

    /// Receives the next complete message addressed to the tool or broadcast.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` when nothing completes before `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> Result<J1939Message, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.inbound.pop_front() {
                return Ok(message);
            }
            self.pump(deadline).await?;
        }
    }

    /// Discards queued messages and unfinished inbound sessions.
    pub async fn drain(&mut self) -> Result<usize, TransportError> {
        let mut dropped = self.inbound.len();
        self.inbound.clear();
        self.sessions.clear();
        loop {
            match self.bus.recv_frame(Duration::ZERO).await {
                Ok(frame) => {
                    self.process(frame).await?;
                    dropped += self.inbound.len();
                    self.inbound.clear();
                }
                Err(TransportError::TimedOut { .. }) => break,
                Err(error) => return Err(error),
            }
        }
        self.sessions.clear();
        Ok(dropped)
    }

    async fn pump(&mut self, deadline: Instant) -> Result<(), TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = self.bus.recv_frame(remaining).await?;
        self.process(frame).await
    }

    async fn process(&mut self, frame: CanFrame) -> Result<(), TransportError> {
        let message = J1939Message::from_frame(&frame);
        trace!(%frame, "frame received");
        // Touch Encoders address acknowledgements to 0x00 rather than the requester.
        let addressed = message.destination == self.address
            || message.destination == J1939_GLOBAL_ADDRESS
            || (message.pgn == pgn::ACKNOWLEDGEMENT
                && message.destination == ACK_UNADDRESSED_DESTINATION);
        if !addressed {
            trace!(destination = message.destination, "ignoring message for another node");
            return Ok(());
        }

        match message.pgn {
            pgn::ADDRESS_CLAIMED => self.on_address_claimed(&message).await,
            pgn::REQUEST if request_target(&message.data) == Some(pgn::ADDRESS_CLAIMED) => {
                self.send_claim().await
            }
            pgn::TP_CM => self.on_connection_management(&message).await,
            pgn::TP_DT => self.on_data_packet(&message).await,
            _ => {
                self.inbound.push_back(message);
                Ok(())
            }
        }
    }

    async fn on_address_claimed(&mut self, message: &J1939Message) -> Result<(), TransportError> {
        let Some(name) = J1939Name::from_bytes(&message.data) else {
            return Ok(());
        };
        if message.source == self.address {
            if name < self.name {
                warn!(contender = %name, "address claim lost");
                self.claim_lost = true;
            } else if name != self.name {
                self.send_claim().await?;
            }
            return Ok(());
        }
        self.claims.push(ClaimedAddress {
            address: message.source,
            name,
        });
        Ok(())
    }

    async fn on_connection_management(&mut self, message: &J1939Message) -> Result<(), TransportError> {
        let Some(control) = TpControl::decode(&message.data) else {
            return Ok(());
        };
        match control {
            TpControl::RequestToSend {
                pgn: session_pgn, ..
            }
            | TpControl::Broadcast {
                pgn: session_pgn, ..
            } => {
                if self.sessions.contains_key(&message.source)
                    && matches!(control, TpControl::RequestToSend { .. })
                {
                    let busy = TpControl::Abort {
                        reason: ABORT_BUSY,
                        pgn: session_pgn,
                    };
                    let reply = J1939Message {
                        pgn: pgn::TP_CM,
                        source: self.address,
                        destination: message.source,
                        data: busy.encode().to_vec(),
                    };
                    return self.bus.send_frame(&reply.to_frame()).await;
                }
                let Some((session, reply)) =
                    Reassembler::accept(control, message.source, message.destination)
                else {
                    return Ok(());
                };
                self.sessions.insert(session.source(), session);
                if let Some(reply) = reply {
                    self.bus.send_frame(&reply).await?;
                }
                Ok(())
            }
            TpControl::Abort { .. } => {
                self.sessions.remove(&message.source);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_data_packet(&mut self, message: &J1939Message) -> Result<(), TransportError> {
        let Some(session) = self.sessions.get_mut(&message.source) else {
            return Ok(());
        };
        match session.feed(&message.data) {
            Ok(Reassembly::Pending) => Ok(()),
            Ok(Reassembly::Complete { message, reply }) => {
                self.sessions.remove(&message.source);
                self.inbound.push_back(message);
                if let Some(reply) = reply {
                    self.bus.send_frame(&reply).await?;
                }
                Ok(())
            }
            Err(error) => {
                debug!(?error, source = message.source, "dropping transport session");
                let abort = session.abort_frame(ABORT_BAD_SEQUENCE);
                self.sessions.remove(&message.source);
                if let Some(abort) = abort {
                    self.bus.send_frame(&abort).await?;
                }
                Ok(())
            }
        }
    }
}

pub(crate) fn pgn_bytes(value: u32) -> [u8; 3] {
    let [b0, b1, b2, _] = value.to_le_bytes();
    [b0, b1, b2]
}

pub(crate) fn request_target(data: &[u8]) -> Option<u32> {
    let bytes = data.get(..3)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
}
