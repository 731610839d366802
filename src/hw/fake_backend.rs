use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::time::sleep;
use tracing::{debug, trace};

use super::can_link::{CanBus, pgn_bytes, request_target};
use super::fake_device::{DeviceBehaviour, Outbound, SimulatedDevice};
use super::hid_backend::{HidDeviceInfo, HidPort, decode_report, encode_report};
use super::j1939::{
    ABORT_BAD_SEQUENCE, CanFrame, J1939Message, J1939Name, J1939NameFields, Reassembler,
    Reassembly, TpControl, TpSender, TpSenderStep,
};
use super::transport::TransportAddress;
use crate::error::{FixtureError, TransportError};
use crate::handlers::{Reply, UpdateStatus, Version};
use crate::protocol::{
    HID_AUTH_SECRET, HID_REPORT_ID_IN, HID_REPORT_ID_OUT, HID_REPORT_LEN, HardwareId,
    J1939_GLOBAL_ADDRESS, J1939_MAX_MESSAGE_LEN, J1939_NULL_ADDRESS, TransportKind, pgn, transport_metadata,
};
use crate::utils::{format_hex, parse_number};

/// Address the simulated devices send J1939 acknowledgements to.
const ACK_DESTINATION: u8 = 0x00;
/// Touch Encoder manufacturer code placed in simulated NAMEs.
const SIMULATED_MANUFACTURER: u16 = 0x2A5;

/// One simulated device parsed from a fixture record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FakeDeviceSpec {
    address: TransportAddress,
    behaviour: DeviceBehaviour,
}

impl FakeDeviceSpec {
    #[must_use]
    pub fn new(address: TransportAddress, behaviour: DeviceBehaviour) -> Self {
        Self { address, behaviour }
    }

    #[must_use]
    pub fn address(&self) -> &TransportAddress {
        &self.address
    }
}

/// Parsed fake device fixture.
///
/// Records are separated by `;`. Each record is a device address followed by
/// comma-separated options:
///
/// ```
/// use te::FakeFixture;
///
/// let fixture: FakeFixture = "usb:1-1.2;can0:0xf2,drop=1;can0:0xf3,fw=2.2.0".parse()?;
/// assert_eq!(3, fixture.devices().len());
/// # Ok::<(), te::FixtureError>(())
/// ```
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Into)]
pub struct FakeFixture {
    devices: Vec<FakeDeviceSpec>,
}

impl FakeFixture {
    #[must_use]
    pub fn devices(&self) -> &[FakeDeviceSpec] {
        &self.devices
    }
}

impl FromStr for FakeFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let devices = parse_fixture(value)?;
        Ok(Self { devices })
    }
}

/// Settings for constructing a fake hardware backend.
#[derive(Debug, Builder)]
pub struct FakeBackendConfig {
    fixture: FakeFixture,
    /// Extra delay before enumeration returns.
    #[builder(default)]
    enumeration_delay: Duration,
}

/// Which way a recorded unit travelled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WireDirection {
    ToDevice,
    FromDevice,
}

impl fmt::Display for WireDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToDevice => f.write_str(">"),
            Self::FromDevice => f.write_str("<"),
        }
    }
}

/// One CAN frame or HID report seen by the fake backend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WireRecord {
    Can {
        interface: String,
        direction: WireDirection,
        frame: CanFrame,
    },
    Hid {
        path: String,
        direction: WireDirection,
        report: Vec<u8>,
    },
}

impl WireRecord {
    #[must_use]
    pub fn direction(&self) -> WireDirection {
        match self {
            Self::Can { direction, .. } | Self::Hid { direction, .. } => *direction,
        }
    }

    /// Codec frame carried by a HID report.
    #[must_use]
    pub fn hid_frame(&self) -> Option<&[u8]> {
        let Self::Hid {
            direction, report, ..
        } = self
        else {
            return None;
        };
        let report_id = match direction {
            WireDirection::ToDevice => HID_REPORT_ID_OUT,
            WireDirection::FromDevice => HID_REPORT_ID_IN,
        };
        decode_report(report, report_id)
    }
}

impl fmt::Display for WireRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Can {
                interface,
                direction,
                frame,
            } => write!(f, "{interface} {direction} {frame}"),
            Self::Hid {
                path,
                direction,
                report,
            } => {
                let frame = self.hid_frame().unwrap_or(report);
                write!(f, "usb:{path} {direction} {}", format_hex(frame))
            }
        }
    }
}

/// Shared record of every unit the fake backend carried, in order.
#[derive(Debug, Clone, Default)]
pub struct WireLog {
    records: Arc<Mutex<Vec<WireRecord>>>,
}

impl WireLog {
    fn push(&self, record: WireRecord) {
        trace!(%record, "fake wire");
        lock(&self.records).push(record);
    }

    #[must_use]
    pub fn records(&self) -> Vec<WireRecord> {
        lock(&self.records).clone()
    }

    pub fn clear(&self) {
        lock(&self.records).clear();
    }

    /// CAN frames the tool wrote on `interface`.
    #[must_use]
    pub fn sent_can_frames(&self, interface: &str) -> Vec<CanFrame> {
        lock(&self.records)
            .iter()
            .filter_map(|record| match record {
                WireRecord::Can {
                    interface: seen,
                    direction: WireDirection::ToDevice,
                    frame,
                } if seen == interface => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Codec frames exchanged with the HID device at `path`.
    #[must_use]
    pub fn hid_frames(&self, path: &str) -> Vec<(WireDirection, Vec<u8>)> {
        lock(&self.records)
            .iter()
            .filter(|record| matches!(record, WireRecord::Hid { path: seen, .. } if seen == path))
            .filter_map(|record| Some((record.direction(), record.hid_frame()?.to_vec())))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fake backend used in tests and non-hardware environments.
///
/// Clones share the same simulated devices and wire log.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    hid: Arc<BTreeMap<String, Arc<FakeHidDevice>>>,
    can: Arc<BTreeMap<String, Arc<FakeCanNetwork>>>,
    log: WireLog,
    enumeration_delay: Duration,
}

impl FakeBackend {
    /// Creates a fake backend from explicit settings.
    #[must_use]
    pub fn new(config: FakeBackendConfig) -> Self {
        let mut hid = BTreeMap::new();
        let mut ecus: BTreeMap<String, Vec<SimulatedEcu>> = BTreeMap::new();

        for spec in Vec::<FakeDeviceSpec>::from(config.fixture) {
            match spec.address {
                TransportAddress::Hid { path } => {
                    let device = SimulatedDevice::new(TransportKind::Hid, spec.behaviour);
                    hid.insert(path.clone(), Arc::new(FakeHidDevice::new(path, device)));
                }
                TransportAddress::Can { interface, address } => {
                    let device = SimulatedDevice::new(TransportKind::Can, spec.behaviour);
                    ecus.entry(interface)
                        .or_default()
                        .push(SimulatedEcu::new(address, device));
                }
            }
        }

        let can = ecus
            .into_iter()
            .map(|(interface, ecus)| {
                let network = FakeCanNetwork::new(interface.clone(), ecus);
                (interface, Arc::new(network))
            })
            .collect();

        Self {
            hid: Arc::new(hid),
            can: Arc::new(can),
            log: WireLog::default(),
            enumeration_delay: config.enumeration_delay,
        }
    }

    /// Handle on the record of everything sent and received.
    #[must_use]
    pub fn wire_log(&self) -> WireLog {
        self.log.clone()
    }

    /// Current brightness of the simulated device at `address`.
    #[must_use]
    pub fn brightness(&self, address: &TransportAddress) -> Option<u8> {
        self.with_device(address, |device| device.brightness())
    }

    /// How often the simulated device at `address` has restarted.
    #[must_use]
    pub fn restarts(&self, address: &TransportAddress) -> Option<u32> {
        self.with_device(address, |device| device.restarts())
    }

    /// Bytes the simulated device at `address` accepted during its last update.
    #[must_use]
    pub fn received_update(&self, address: &TransportAddress) -> Option<Vec<u8>> {
        self.with_device(address, |device| device.received_update().map(<[u8]>::to_vec))
            .flatten()
    }

    /// Changes the behaviour of the simulated device at `address` from now on.
    ///
    /// Returns `false` when no device lives at `address`.
    ///
    /// ```
    /// use te::{FakeBackend, FakeBackendConfig, TransportAddress};
    ///
    /// let backend = FakeBackend::new(FakeBackendConfig::builder().fixture("usb:1-1".parse()?).build());
    /// let address = TransportAddress::Hid { path: "1-1".into() };
    /// assert!(backend.inject(&address, |behaviour| behaviour.silent = true));
    /// # Ok::<(), te::FixtureError>(())
    /// ```
    pub fn inject(
        &self,
        address: &TransportAddress,
        fault: impl FnOnce(&mut DeviceBehaviour),
    ) -> bool {
        self.with_device(address, |device| fault(device.behaviour_mut()))
            .is_some()
    }

    fn with_device<T>(
        &self,
        address: &TransportAddress,
        inspect: impl FnOnce(&mut SimulatedDevice) -> T,
    ) -> Option<T> {
        match address {
            TransportAddress::Hid { path } => {
                let device = self.hid.get(path)?;
                let mut state = lock(&device.state);
                Some(inspect(&mut state.device))
            }
            TransportAddress::Can { interface, address } => {
                let network = self.can.get(interface)?;
                let mut state = lock(&network.state);
                let ecu = state.ecus.iter_mut().find(|ecu| ecu.address == *address)?;
                Some(inspect(&mut ecu.device))
            }
        }
    }

    pub(crate) async fn enumerate_hid(&self) -> Vec<HidDeviceInfo> {
        if !self.enumeration_delay.is_zero() {
            sleep(self.enumeration_delay).await;
        }
        self.hid
            .keys()
            .map(|path| HidDeviceInfo::new(path.clone(), Some(path.clone())))
            .collect()
    }

    pub(crate) fn open_hid(&self, path: &str) -> Result<FakeHidPort, TransportError> {
        let device = self.hid.get(path).ok_or_else(|| TransportError::Unavailable {
            address: format!("usb:{path}"),
            reason: "no simulated device at this path".to_owned(),
        })?;
        Ok(FakeHidPort {
            device: Arc::clone(device),
            log: self.log.clone(),
        })
    }

    pub(crate) fn list_can_interfaces(&self) -> Vec<String> {
        self.can.keys().cloned().collect()
    }

    pub(crate) fn open_can(&self, interface: &str) -> Result<FakeCanBus, TransportError> {
        let network = self
            .can
            .get(interface)
            .ok_or_else(|| TransportError::Unavailable {
                address: interface.to_owned(),
                reason: "no simulated network on this interface".to_owned(),
            })?;
        Ok(FakeCanBus {
            network: Arc::clone(network),
            log: self.log.clone(),
        })
    }
}

#[derive(Debug)]
struct HidState {
    device: SimulatedDevice,
    inbound: VecDeque<Vec<u8>>,
}

#[derive(Debug)]
struct FakeHidDevice {
    path: String,
    state: Mutex<HidState>,
}

impl FakeHidDevice {
    fn new(path: String, device: SimulatedDevice) -> Self {
        Self {
            path,
            state: Mutex::new(HidState {
                device,
                inbound: VecDeque::new(),
            }),
        }
    }
}

/// Tool-side port onto one simulated HID device.
#[derive(Debug)]
pub(crate) struct FakeHidPort {
    device: Arc<FakeHidDevice>,
    log: WireLog,
}

#[async_trait]
impl HidPort for FakeHidPort {
    fn path(&self) -> &str {
        &self.device.path
    }

    async fn write_report(&self, report: &[u8; HID_REPORT_LEN]) -> Result<(), TransportError> {
        self.log.push(WireRecord::Hid {
            path: self.device.path.clone(),
            direction: WireDirection::ToDevice,
            report: report.to_vec(),
        });
        let Some(frame) = decode_report(report, HID_REPORT_ID_OUT) else {
            return Ok(());
        };

        let mut state = lock(&self.device.state);
        let max_frame_len = transport_metadata(TransportKind::Hid).max_frame_len();
        for outbound in state.device.receive(frame, HID_AUTH_SECRET) {
            for frame in outbound.frames(max_frame_len) {
                if let Ok(report) = encode_report(&frame, HID_REPORT_ID_IN) {
                    state.inbound.push_back(report.to_vec());
                }
            }
        }
        Ok(())
    }

    async fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let report = lock(&self.device.state).inbound.pop_front();
        match report {
            Some(report) => {
                self.log.push(WireRecord::Hid {
                    path: self.device.path.clone(),
                    direction: WireDirection::FromDevice,
                    report: report.clone(),
                });
                Ok(report)
            }
            None => {
                sleep(timeout).await;
                Err(TransportError::TimedOut { timeout })
            }
        }
    }
}

#[derive(Debug)]
struct CanNetworkState {
    ecus: Vec<SimulatedEcu>,
    /// Frames waiting for the tool.
    inbox: VecDeque<CanFrame>,
}

/// One simulated CAN interface and the devices on it.
#[derive(Debug)]
struct FakeCanNetwork {
    interface: String,
    state: Mutex<CanNetworkState>,
}

impl FakeCanNetwork {
    fn new(interface: String, ecus: Vec<SimulatedEcu>) -> Self {
        Self {
            interface,
            state: Mutex::new(CanNetworkState {
                ecus,
                inbox: VecDeque::new(),
            }),
        }
    }
}

/// Tool-side bus onto one simulated CAN network.
#[derive(Debug)]
pub(crate) struct FakeCanBus {
    network: Arc<FakeCanNetwork>,
    log: WireLog,
}

#[async_trait]
impl CanBus for FakeCanBus {
    fn interface(&self) -> &str {
        &self.network.interface
    }

    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
        self.log.push(WireRecord::Can {
            interface: self.network.interface.clone(),
            direction: WireDirection::ToDevice,
            frame: frame.clone(),
        });

        let mut state = lock(&self.network.state);
        let CanNetworkState { ecus, inbox } = &mut *state;
        for ecu in ecus.iter_mut() {
            inbox.extend(ecu.on_frame(frame));
        }
        Ok(())
    }

    async fn recv_frame(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        let frame = lock(&self.network.state).inbox.pop_front();
        match frame {
            Some(frame) => {
                self.log.push(WireRecord::Can {
                    interface: self.network.interface.clone(),
                    direction: WireDirection::FromDevice,
                    frame: frame.clone(),
                });
                Ok(frame)
            }
            None => {
                sleep(timeout).await;
                Err(TransportError::TimedOut { timeout })
            }
        }
    }
}

/// J1939 node wrapped around one simulated device.
#[derive(Debug)]
struct SimulatedEcu {
    address: u8,
    name: J1939Name,
    device: SimulatedDevice,
    receiving: HashMap<u8, Reassembler>,
    sending: Option<TpSender>,
    outbox: VecDeque<J1939Message>,
}

impl SimulatedEcu {
    fn new(address: u8, device: SimulatedDevice) -> Self {
        let name = J1939Name::from_fields(
            J1939NameFields::builder()
                .identity(u32::from(address))
                .manufacturer(SIMULATED_MANUFACTURER)
                .function(0x3C)
                .industry_group(0)
                .arbitrary_address_capable(false)
                .build(),
        );
        Self {
            address,
            name,
            device,
            receiving: HashMap::new(),
            sending: None,
            outbox: VecDeque::new(),
        }
    }

    fn claim(&self) -> CanFrame {
        J1939Message {
            pgn: pgn::ADDRESS_CLAIMED,
            source: self.address,
            destination: J1939_GLOBAL_ADDRESS,
            data: self.name.to_bytes().to_vec(),
        }
        .to_frame()
    }

    /// Reacts to one frame on the bus; returns the frames this node sends back.
    fn on_frame(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        let message = J1939Message::from_frame(frame);
        if message.source == self.address {
            return self.on_contested_claim(&message);
        }
        if message.destination != self.address && message.destination != J1939_GLOBAL_ADDRESS {
            return Vec::new();
        }

        match message.pgn {
            pgn::REQUEST if request_target(&message.data) == Some(pgn::ADDRESS_CLAIMED) => {
                vec![self.claim()]
            }
            pgn::TP_CM => self.on_connection_management(&message),
            pgn::TP_DT => self.on_data_packet(&message),
            pgn::PROPRIETARY_A => self.on_request(message.source, &message.data),
            _ => Vec::new(),
        }
    }

    fn on_contested_claim(&self, message: &J1939Message) -> Vec<CanFrame> {
        if message.pgn != pgn::ADDRESS_CLAIMED {
            return Vec::new();
        }
        match J1939Name::from_bytes(&message.data) {
            Some(contender) if self.name < contender => {
                debug!(address = self.address, "simulated device defends its address");
                vec![self.claim()]
            }
            _ => Vec::new(),
        }
    }

    fn on_connection_management(&mut self, message: &J1939Message) -> Vec<CanFrame> {
        let Some(control) = TpControl::decode(&message.data) else {
            return Vec::new();
        };
        match control {
            TpControl::RequestToSend { .. } | TpControl::Broadcast { .. } => {
                let Some((session, reply)) =
                    Reassembler::accept(control, message.source, message.destination)
                else {
                    return Vec::new();
                };
                self.receiving.insert(message.source, session);
                reply.into_iter().collect()
            }
            TpControl::Abort { .. } if self.sending.is_none() => {
                self.receiving.remove(&message.source);
                Vec::new()
            }
            TpControl::ClearToSend { .. }
            | TpControl::EndOfMessageAck { .. }
            | TpControl::Abort { .. } => {
                let Some(sender) = self.sending.as_ref() else {
                    return Vec::new();
                };
                match sender.on_control(control) {
                    TpSenderStep::Send(frames) => frames,
                    TpSenderStep::Wait => Vec::new(),
                    TpSenderStep::Done | TpSenderStep::Aborted { .. } => {
                        self.sending = None;
                        self.flush()
                    }
                }
            }
        }
    }

    fn on_data_packet(&mut self, message: &J1939Message) -> Vec<CanFrame> {
        let Some(session) = self.receiving.get_mut(&message.source) else {
            return Vec::new();
        };
        match session.feed(&message.data) {
            Ok(Reassembly::Pending) => Vec::new(),
            Ok(Reassembly::Complete { message, reply }) => {
                self.receiving.remove(&message.source);
                let mut frames: Vec<CanFrame> = reply.into_iter().collect();
                if message.pgn == pgn::PROPRIETARY_A {
                    frames.extend(self.on_request(message.source, &message.data));
                }
                frames
            }
            Err(_) => {
                let abort = session.abort_frame(ABORT_BAD_SEQUENCE);
                self.receiving.remove(&message.source);
                abort.into_iter().collect()
            }
        }
    }

    fn on_request(&mut self, tool: u8, data: &[u8]) -> Vec<CanFrame> {
        for outbound in self.device.receive(data, u32::from(tool)) {
            self.queue_reply(tool, &outbound);
        }
        self.flush()
    }

    fn queue_reply(&mut self, tool: u8, outbound: &Outbound) {
        if let (Reply::Ack { opcode, code }, false) = (&outbound.reply, outbound.corrupt) {
            let mut data = vec![code.raw(), *opcode, 0xFF, 0xFF, 0xFF];
            data.extend_from_slice(&pgn_bytes(pgn::PROPRIETARY_A));
            self.outbox.push_back(J1939Message {
                pgn: pgn::ACKNOWLEDGEMENT,
                source: self.address,
                destination: ACK_DESTINATION,
                data,
            });
            return;
        }
        for frame in outbound.frames(J1939_MAX_MESSAGE_LEN) {
            self.outbox.push_back(J1939Message {
                pgn: pgn::PROPRIETARY_A,
                source: self.address,
                destination: tool,
                data: frame,
            });
        }
    }

    /// Sends queued messages until one needs a transport-protocol session.
    fn flush(&mut self) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        while self.sending.is_none() {
            let Some(message) = self.outbox.pop_front() else {
                break;
            };
            match TpSender::new(message.source, message.destination, message.pgn, message.data.clone()) {
                Some(sender) => {
                    frames.extend(sender.open());
                    self.sending = Some(sender);
                }
                None => frames.push(message.to_frame()),
            }
        }
        frames
    }
}

fn parse_fixture(raw_fixture: &str) -> Result<Vec<FakeDeviceSpec>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(str::trim)
        .filter(|record| !record.is_empty())
        .map(parse_record)
        .collect()
}

fn parse_record(raw_record: &str) -> Result<FakeDeviceSpec, FixtureError> {
    let mut fields = raw_record.split(',').map(str::trim);
    let location = fields.next().unwrap_or_default();
    let address = parse_address(location, raw_record)?;

    let mut behaviour = DeviceBehaviour::default();
    for option in fields {
        apply_option(&mut behaviour, option)?;
    }
    Ok(FakeDeviceSpec { address, behaviour })
}

fn parse_address(location: &str, raw_record: &str) -> Result<TransportAddress, FixtureError> {
    let invalid_record = || FixtureError::InvalidRecord {
        record: raw_record.to_owned(),
    };
    let (prefix, rest) = location.split_once(':').ok_or_else(invalid_record)?;
    if rest.is_empty() {
        return Err(invalid_record());
    }
    if prefix == "usb" {
        return Ok(TransportAddress::Hid {
            path: rest.to_owned(),
        });
    }
    if prefix.is_empty() {
        return Err(invalid_record());
    }

    let address = parse_number(rest)
        .and_then(|value| u8::try_from(value).ok())
        .filter(|address| *address < J1939_NULL_ADDRESS)
        .ok_or_else(|| FixtureError::InvalidAddress {
            value: rest.to_owned(),
        })?;
    Ok(TransportAddress::Can {
        interface: prefix.to_owned(),
        address,
    })
}

fn apply_option(behaviour: &mut DeviceBehaviour, option: &str) -> Result<(), FixtureError> {
    let (key, value) = match option.split_once('=') {
        Some((key, value)) => (key.trim(), Some(value.trim())),
        None => (option, None),
    };

    match (key, value) {
        ("silent", None) => behaviour.silent = true,
        ("reject-update", None) => behaviour.reject_update = true,
        ("busy", None) => behaviour.busy = true,
        ("deny-auth", None) => behaviour.deny_auth = true,
        ("no-project", None) => behaviour.no_project = true,
        ("drop", Some(value)) => behaviour.drop_replies = option_number(key, value)?,
        ("malformed", Some(value)) => behaviour.malformed_replies = option_number(key, value)?,
        ("drop-ack", Some(value)) => behaviour.drop_ack_at = Some(option_number(key, value)?),
        ("stale-ack", Some(value)) => behaviour.stale_ack_at = Some(option_number(key, value)?),
        ("stale-count", Some(value)) => behaviour.stale_ack_repeats = option_number(key, value)?,
        ("ahead-ack", Some(value)) => behaviour.ahead_ack_at = Some(option_number(key, value)?),
        ("hwid", Some(value)) => {
            behaviour.hardware_id = Some(HardwareId::from(option_number(key, value)?));
        }
        ("fw", Some(value)) => {
            behaviour.firmware = value
                .parse::<Version>()
                .map_err(|_| invalid_option_value(key, value))?;
        }
        ("max-chunk", Some(value)) => {
            behaviour.max_chunk = u16::try_from(option_number(key, value)?)
                .map_err(|_| invalid_option_value(key, value))?;
        }
        ("update-status", Some(value)) => {
            let raw = value
                .parse::<i8>()
                .map_err(|_| invalid_option_value(key, value))?;
            behaviour.update_status = UpdateStatus::from(raw);
        }
        _ => {
            return Err(FixtureError::UnknownOption {
                option: option.to_owned(),
            });
        }
    }
    Ok(())
}

fn option_number(key: &str, value: &str) -> Result<u32, FixtureError> {
    parse_number(value).ok_or_else(|| invalid_option_value(key, value))
}

fn invalid_option_value(key: &str, value: &str) -> FixtureError {
    FixtureError::InvalidOptionValue {
        option: key.to_owned(),
        value: value.to_owned(),
    }
}
