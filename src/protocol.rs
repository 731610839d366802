use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use serde::Serialize;
use serde_with::SerializeDisplay;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// USB vendor id of Touch Encoder devices.
pub const USB_VENDOR_ID: u16 = 0x1658;
/// USB product id of Touch Encoder devices.
pub const USB_PRODUCT_ID: u16 = 0x0060;
/// USB interface carrying the command reports.
pub const USB_COMMAND_INTERFACE: i32 = 0;

/// Command opcodes understood by the device.
pub(crate) mod opcode {
    pub(crate) const AUTH_REQUEST: u8 = 0x01;
    pub(crate) const AUTH_RESPONSE: u8 = 0x02;
    pub(crate) const GUIDE_GET: u8 = 0x0A;
    pub(crate) const GUIDE_SET: u8 = 0x0B;
    pub(crate) const RESTART: u8 = 0x44;
    pub(crate) const RESTART_UTILITY: u8 = 0x45;
    pub(crate) const UPDATE_BEGIN: u8 = 0x55;
    pub(crate) const UPDATE_FIRMWARE_CHUNK: u8 = 0x56;
    pub(crate) const UPDATE_PROJECT_CHUNK: u8 = 0x57;
    pub(crate) const UPDATE_STATUS: u8 = 0x5A;
    pub(crate) const BRIGHTNESS: u8 = 0x80;
    pub(crate) const GET_VERSION: u8 = 0xC1;
    pub(crate) const GET_HARDWARE_ID: u8 = 0xC2;
    pub(crate) const GET_PROJECT_INFO: u8 = 0xC3;
    pub(crate) const ACK: u8 = 0xE8;
}

/// GUIDE sub-commands carried in the first payload byte of `GUIDE_GET`/`GUIDE_SET`.
pub(crate) mod guide {
    pub(crate) const SCREEN: u8 = 0x01;
    pub(crate) const VARIABLE: u8 = 0x02;
    pub(crate) const INT_VARIABLE: u8 = 0x03;
    pub(crate) const STRING_VARIABLE: u8 = 0x04;
}

/// Parameter group numbers used on the J1939 side.
pub(crate) mod pgn {
    pub(crate) const ACKNOWLEDGEMENT: u32 = 0x0E800;
    pub(crate) const REQUEST: u32 = 0x0EA00;
    pub(crate) const TP_DT: u32 = 0x0EB00;
    pub(crate) const TP_CM: u32 = 0x0EC00;
    pub(crate) const ADDRESS_CLAIMED: u32 = 0x0EE00;
    pub(crate) const PROPRIETARY_A: u32 = 0x0EF00;
}

/// J1939 global (broadcast) destination address.
pub(crate) const J1939_GLOBAL_ADDRESS: u8 = 0xFF;
/// J1939 "cannot claim" null address.
pub(crate) const J1939_NULL_ADDRESS: u8 = 0xFE;
/// Default priority of every frame the tool sends.
pub(crate) const J1939_DEFAULT_PRIORITY: u8 = 6;
/// Largest payload carried by the J1939 transport protocol.
pub(crate) const J1939_MAX_MESSAGE_LEN: usize = 1785;

/// HID report geometry.
pub(crate) const HID_REPORT_LEN: usize = 64;
pub(crate) const HID_REPORT_ID_OUT: u8 = 0x02;
pub(crate) const HID_REPORT_ID_IN: u8 = 0x05;
pub(crate) const HID_REPORT_HEADER_LEN: usize = 2;

/// Secret mixed into HID authentication keys.
pub(crate) const HID_AUTH_SECRET: u32 = 0x1337;

/// Physical link a device is reachable through.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, EnumIter, EnumString, Display, Serialize,
)]
pub enum TransportKind {
    /// Direct USB human-interface-device connection.
    #[strum(to_string = "hid")]
    #[serde(rename = "hid")]
    Hid,
    /// CAN bus using the J1939 transport protocol.
    #[strum(to_string = "can")]
    #[serde(rename = "can")]
    Can,
}

/// Descriptive metadata for one transport kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct TransportMetadata {
    label: &'static str,
    max_frame_len: usize,
}

impl TransportMetadata {
    /// Human-readable transport label.
    pub(crate) fn label(self) -> &'static str {
        self.label
    }

    /// Largest codec frame one transport unit carries.
    pub(crate) fn max_frame_len(self) -> usize {
        self.max_frame_len
    }
}

static TRANSPORTS_BY_KIND: LazyLock<HashMap<TransportKind, TransportMetadata>> =
    LazyLock::new(|| {
        TransportKind::iter()
            .map(|kind| (kind, metadata_for(kind)))
            .collect()
    });

/// Returns metadata for one transport kind.
pub(crate) fn transport_metadata(kind: TransportKind) -> TransportMetadata {
    *TRANSPORTS_BY_KIND
        .get(&kind)
        .unwrap_or(&metadata_for(kind))
}

fn metadata_for(kind: TransportKind) -> TransportMetadata {
    match kind {
        TransportKind::Hid => TransportMetadata {
            label: "USB HID",
            max_frame_len: HID_REPORT_LEN - HID_REPORT_HEADER_LEN,
        },
        TransportKind::Can => TransportMetadata {
            label: "CAN J1939",
            max_frame_len: J1939_MAX_MESSAGE_LEN,
        },
    }
}

/// Hardware variants reported by `GetHardwareId`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, SerializeDisplay)]
pub enum HardwareId {
    RefreshUsb,
    RefreshCan,
    FlushMountUsb,
    FlushMountCan,
    Mix,
    Unknown(u32),
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefreshUsb => f.write_str("TE_RF_USB"),
            Self::RefreshCan => f.write_str("TE_RF_CAN"),
            Self::FlushMountUsb => f.write_str("TE_FX_USB"),
            Self::FlushMountCan => f.write_str("TE_FX_CAN"),
            Self::Mix => f.write_str("TE_MX"),
            Self::Unknown(value) => write!(f, "UNKNOWN(0x{value:X})"),
        }
    }
}

impl HardwareId {
    /// Returns the raw wire value.
    ///
    /// ```
    /// use te::HardwareId;
    ///
    /// assert_eq!(0x11, HardwareId::FlushMountCan.raw());
    /// assert_eq!(HardwareId::Mix, HardwareId::from(0x100));
    /// ```
    #[must_use]
    pub fn raw(self) -> u32 {
        match self {
            Self::RefreshUsb => 0x00,
            Self::RefreshCan => 0x01,
            Self::FlushMountUsb => 0x10,
            Self::FlushMountCan => 0x11,
            Self::Mix => 0x100,
            Self::Unknown(value) => value,
        }
    }
}

impl From<u32> for HardwareId {
    fn from(value: u32) -> Self {
        match value {
            0x00 => Self::RefreshUsb,
            0x01 => Self::RefreshCan,
            0x10 => Self::FlushMountUsb,
            0x11 => Self::FlushMountCan,
            0x100 => Self::Mix,
            other => Self::Unknown(other),
        }
    }
}

/// Acknowledgement codes carried by `Ack` responses.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize)]
pub enum AckCode {
    #[strum(to_string = "ok")]
    Ok,
    #[strum(to_string = "nack")]
    Nack,
    #[strum(to_string = "access denied")]
    AccessDenied,
    #[strum(to_string = "cannot respond")]
    CannotRespond,
}

impl AckCode {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Nack => 1,
            Self::AccessDenied => 2,
            Self::CannotRespond => 3,
        }
    }

    pub(crate) fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Nack),
            2 => Some(Self::AccessDenied),
            3 => Some(Self::CannotRespond),
            _ => None,
        }
    }
}
