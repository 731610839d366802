use async_trait::async_trait;
use tracing::info;

use super::can_link::CanBus;
use super::fake_backend::{FakeBackend, FakeBackendConfig};
use super::hid_backend::{self, HidDeviceInfo, HidPort};
use crate::error::TransportError;

/// Runtime hardware backend selection.
#[derive(Debug)]
pub(crate) enum HardwareBackend {
    Real,
    Fake(FakeBackendConfig),
}

/// Builds an injected hardware client for the selected runtime backend.
pub(crate) fn hardware_client_from_backend(backend: HardwareBackend) -> Box<dyn HardwareClient> {
    match backend {
        HardwareBackend::Real => Box::new(RealHardwareClient),
        HardwareBackend::Fake(config) => {
            info!("using fake Touch Encoder backend");
            FakeBackend::new(config).client()
        }
    }
}

/// Enumerates and opens the physical links devices are reached through.
#[async_trait]
pub trait HardwareClient: Send + Sync {
    /// Lists Touch Encoder HID interfaces currently attached.
    async fn enumerate_hid(&self) -> Result<Vec<HidDeviceInfo>, TransportError>;

    /// Opens the HID device at `path`.
    async fn open_hid(&self, path: &str) -> Result<Box<dyn HidPort>, TransportError>;

    /// Lists CAN interfaces present on the host.
    async fn list_can_interfaces(&self) -> Vec<String>;

    /// Opens a raw CAN socket on `interface`.
    async fn open_can(&self, interface: &str) -> Result<Box<dyn CanBus>, TransportError>;
}

#[derive(Debug)]
struct RealHardwareClient;

#[async_trait]
impl HardwareClient for RealHardwareClient {
    async fn enumerate_hid(&self) -> Result<Vec<HidDeviceInfo>, TransportError> {
        tokio::task::spawn_blocking(hid_backend::enumerate_hid)
            .await
            .map_err(|error| TransportError::Unavailable {
                address: "usb".to_owned(),
                reason: error.to_string(),
            })?
    }

    async fn open_hid(&self, path: &str) -> Result<Box<dyn HidPort>, TransportError> {
        Ok(Box::new(hid_backend::open_hid(path)?))
    }

    async fn list_can_interfaces(&self) -> Vec<String> {
        #[cfg(target_os = "linux")]
        {
            super::socketcan_backend::list_can_interfaces()
        }
        #[cfg(not(target_os = "linux"))]
        {
            Vec::new()
        }
    }

    async fn open_can(&self, interface: &str) -> Result<Box<dyn CanBus>, TransportError> {
        #[cfg(target_os = "linux")]
        {
            Ok(Box::new(super::socketcan_backend::SocketCanBus::open(interface)?))
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(TransportError::Unavailable {
                address: interface.to_owned(),
                reason: "SocketCAN is only available on Linux".to_owned(),
            })
        }
    }
}

#[derive(Debug)]
struct FakeHardwareClient {
    backend: FakeBackend,
}

impl FakeBackend {
    /// Hardware client backed by this fake backend's simulated devices.
    #[must_use]
    pub fn client(&self) -> Box<dyn HardwareClient> {
        Box::new(FakeHardwareClient {
            backend: self.clone(),
        })
    }
}

#[async_trait]
impl HardwareClient for FakeHardwareClient {
    async fn enumerate_hid(&self) -> Result<Vec<HidDeviceInfo>, TransportError> {
        Ok(self.backend.enumerate_hid().await)
    }

    async fn open_hid(&self, path: &str) -> Result<Box<dyn HidPort>, TransportError> {
        Ok(Box::new(self.backend.open_hid(path)?))
    }

    async fn list_can_interfaces(&self) -> Vec<String> {
        self.backend.list_can_interfaces()
    }

    async fn open_can(&self, interface: &str) -> Result<Box<dyn CanBus>, TransportError> {
        Ok(Box::new(self.backend.open_can(interface)?))
    }
}

/// Builds a hardware client over simulated devices.
#[must_use]
pub(crate) fn fake_hardware_client(config: FakeBackendConfig) -> Box<dyn HardwareClient> {
    hardware_client_from_backend(HardwareBackend::Fake(config))
}

/// Builds a hardware client over the host's HID and SocketCAN devices.
#[must_use]
pub(crate) fn real_hardware_client() -> Box<dyn HardwareClient> {
    hardware_client_from_backend(HardwareBackend::Real)
}
