use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};
use tracing::{debug, trace};

use crate::error::TransportError;

use super::can_link::CanBus;
use super::j1939::CanFrame;

const SYSFS_NET: &str = "/sys/class/net";
/// `ARPHRD_CAN` link type.
const CAN_LINK_TYPE: &str = "280";
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Lists SocketCAN interfaces known to the kernel.
pub(crate) fn list_can_interfaces() -> Vec<String> {
    let entries = match std::fs::read_dir(SYSFS_NET) {
        Ok(entries) => entries,
        Err(error) => {
            debug!(%error, "cannot enumerate network interfaces");
            return Vec::new();
        }
    };

    let mut interfaces: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| is_can_interface(&entry.path()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    interfaces.sort();
    interfaces
}

fn is_can_interface(path: &Path) -> bool {
    std::fs::read_to_string(path.join("type")).is_ok_and(|kind| kind.trim() == CAN_LINK_TYPE)
}

/// Raw CAN socket bound to one interface.
#[derive(Debug)]
pub struct SocketCanBus {
    interface: String,
    socket: Arc<CanSocket>,
}

impl SocketCanBus {
    /// Opens a raw socket on `interface`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] when the interface cannot be bound.
    pub fn open(interface: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface).map_err(|error| TransportError::Unavailable {
            address: interface.to_owned(),
            reason: error.to_string(),
        })?;

        Ok(Self {
            interface: interface.to_owned(),
            socket: Arc::new(socket),
        })
    }

    fn link_error(&self, source: io::Error) -> TransportError {
        TransportError::Link {
            address: self.interface.clone(),
            source,
        }
    }
}

#[async_trait]
impl CanBus for SocketCanBus {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let id = ExtendedId::new(frame.id()).ok_or_else(|| {
            self.link_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("identifier 0x{:08X} exceeds 29 bits", frame.id()),
            ))
        })?;
        let raw = <socketcan::CanFrame as EmbeddedFrame>::new(id, frame.data()).ok_or_else(|| {
            self.link_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "CAN frames carry at most 8 data bytes",
            ))
        })?;

        let socket = Arc::clone(&self.socket);
        tokio::task::spawn_blocking(move || socket.write_frame(&raw))
            .await
            .map_err(|error| self.link_error(io::Error::other(error)))?
            .map_err(|error| self.link_error(error))
    }

    async fn recv_frame(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::TimedOut { timeout });
            }

            let socket = Arc::clone(&self.socket);
            let wait = remaining.max(MIN_READ_TIMEOUT);
            let read = tokio::task::spawn_blocking(move || socket.read_frame_timeout(wait))
                .await
                .map_err(|error| self.link_error(io::Error::other(error)))?;

            let raw = match read {
                Ok(raw) => raw,
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(TransportError::TimedOut { timeout });
                }
                Err(error) => return Err(self.link_error(error)),
            };

            let socketcan::CanFrame::Data(data) = raw else {
                trace!(interface = %self.interface, "ignoring non-data CAN frame");
                continue;
            };
            let Id::Extended(id) = EmbeddedFrame::id(&data) else {
                trace!(interface = %self.interface, "ignoring standard-id CAN frame");
                continue;
            };
            return Ok(CanFrame::new(id.as_raw(), EmbeddedFrame::data(&data)));
        }
    }
}
