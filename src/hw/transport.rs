use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_with::SerializeDisplay;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::trace;

use crate::error::TransportError;
use crate::protocol::{TransportKind, opcode, pgn, transport_metadata};
use crate::utils::format_hex;

use super::can_link::{J1939Link, pgn_bytes};
use super::hid_backend::HidLink;
use super::j1939::J1939Message;

const ACK_DATA_LEN: usize = 8;

/// Where a device is reached.
///
/// ```
/// use te::TransportAddress;
///
/// let address = TransportAddress::Can { interface: "can0".into(), address: 0xF2 };
/// assert_eq!("can0:0xf2", address.to_string());
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay)]
pub enum TransportAddress {
    /// USB device path.
    Hid { path: String },
    /// CAN interface plus the device's J1939 source address.
    Can { interface: String, address: u8 },
}

impl TransportAddress {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Hid { .. } => TransportKind::Hid,
            Self::Can { .. } => TransportKind::Can,
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hid { path } => write!(f, "usb:{path}"),
            Self::Can { interface, address } => write!(f, "{interface}:0x{address:02x}"),
        }
    }
}

/// A CAN interface shared by every device on it.
pub type SharedCanLink = Arc<Mutex<J1939Link>>;

/// One device's link: either its own HID port or a J1939 peer on a shared bus.
#[derive(Debug)]
pub enum Transport {
    Hid(HidLink),
    Can { link: SharedCanLink, address: u8 },
}

impl Transport {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Hid(_) => TransportKind::Hid,
            Self::Can { .. } => TransportKind::Can,
        }
    }

    /// Largest codec frame one send carries.
    #[must_use]
    pub fn max_frame_len(&self) -> usize {
        transport_metadata(self.kind()).max_frame_len()
    }

    /// Secret mixed into this link's authentication keys.
    pub(crate) async fn auth_secret(&self) -> u32 {
        match self {
            Self::Hid(_) => crate::protocol::HID_AUTH_SECRET,
            Self::Can { link, .. } => u32::from(link.lock().await.address()),
        }
    }

    /// Takes exclusive use of the link for one exchange.
    ///
    /// On CAN this holds the interface lock, so segmented sessions of
    /// different devices never interleave.
    pub async fn lock(&self) -> LinkGuard<'_> {
        match self {
            Self::Hid(link) => LinkGuard::Hid(link),
            Self::Can { link, address } => LinkGuard::Can {
                link: link.lock().await,
                address: *address,
            },
        }
    }

    /// Releases the link.
    ///
    /// CAN interfaces stay open while other devices use them.
    pub fn close(self) {
        if let Self::Hid(link) = self {
            trace!(path = link.path(), "closing HID link");
        }
    }
}

/// Exclusive access to a [`Transport`] for the length of one exchange.
pub enum LinkGuard<'a> {
    Hid(&'a HidLink),
    Can {
        link: MutexGuard<'a, J1939Link>,
        address: u8,
    },
}

impl LinkGuard<'_> {
    /// Sends one codec frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame does not fit the link or I/O fails.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        match self {
            Self::Hid(link) => link.send(frame).await,
            Self::Can { link, address } => {
                trace!(destination = *address, frame = %format_hex(frame), "can send");
                link.send(pgn::PROPRIETARY_A, *address, frame).await
            }
        }
    }

    /// Receives the next codec frame from the device.
    ///
    /// J1939 acknowledgements arrive as codec ack frames.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TimedOut`] when nothing arrives before `timeout`.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::Hid(link) => link.recv(timeout).await,
            Self::Can { link, address } => {
                let deadline = Instant::now() + timeout;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransportError::TimedOut { timeout });
                    }
                    let message = match link.recv(remaining).await {
                        Err(TransportError::TimedOut { .. }) => {
                            return Err(TransportError::TimedOut { timeout });
                        }
                        other => other?,
                    };
                    if let Some(frame) = device_frame(&message, *address) {
                        return Ok(frame);
                    }
                    trace!(source = message.source, pgn = message.pgn, "ignoring foreign message");
                }
            }
        }
    }

    /// Discards anything left over from an earlier exchange.
    ///
    /// # Errors
    ///
    /// Returns an error when the link fails while draining.
    pub async fn drain(&mut self) -> Result<usize, TransportError> {
        match self {
            Self::Hid(link) => link.drain().await,
            Self::Can { link, .. } => link.drain().await,
        }
    }
}

/// Extracts the codec frame carried by a message from `device`.
fn device_frame(message: &J1939Message, device: u8) -> Option<Vec<u8>> {
    if message.source != device {
        return None;
    }
    match message.pgn {
        pgn::PROPRIETARY_A => Some(message.data.clone()),
        pgn::ACKNOWLEDGEMENT
            if message.data.len() == ACK_DATA_LEN
                && message.data[5..] == pgn_bytes(pgn::PROPRIETARY_A) =>
        {
            let code = message.data[0];
            let acked = message.data[1];
            Some(vec![opcode::ACK, 0x00, code, acked])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn message(pgn: u32, source: u8, data: &[u8]) -> J1939Message {
        J1939Message {
            pgn,
            source,
            destination: 0x00,
            data: data.to_vec(),
        }
    }

    #[test]
    fn acknowledgements_become_codec_ack_frames() {
        let ack = message(0xE800, 0xF2, &[0x01, 0x0B, 0xFF, 0xFF, 0xFF, 0x00, 0xEF, 0x00]);

        assert_eq!(Some(vec![0xE8, 0x00, 0x01, 0x0B]), device_frame(&ack, 0xF2));
    }

    #[rstest]
    #[case::other_device(message(0xEF00, 0xF3, &[0x0A, 0x00]))]
    #[case::other_pgn(message(0xFEDA, 0xF2, &[0x00; 8]))]
    #[case::short_ack(message(0xE800, 0xF2, &[0x00, 0x0B]))]
    #[case::ack_of_other_pgn(message(0xE800, 0xF2, &[0x00, 0x0B, 0xFF, 0xFF, 0xFF, 0x00, 0xEA, 0x00]))]
    fn unrelated_messages_are_skipped(#[case] message: J1939Message) {
        assert_eq!(None, device_frame(&message, 0xF2));
    }

    #[test]
    fn addresses_render_by_kind() {
        let hid = TransportAddress::Hid {
            path: "/dev/hidraw3".into(),
        };
        assert_eq!("usb:/dev/hidraw3", hid.to_string());
        assert_eq!(TransportKind::Hid, hid.kind());
    }
}
