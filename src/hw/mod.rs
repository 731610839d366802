mod can_link;
mod fake_backend;
mod fake_device;
mod hardware;
mod hid_backend;
mod j1939;
#[cfg(target_os = "linux")]
mod socketcan_backend;
mod transport;

pub use self::can_link::{
    CanBus, CanConfig, ClaimedAddress, DEFAULT_SCAN_WINDOW, DEFAULT_TOOL_ADDRESS, J1939Link,
    default_tool_name,
};
pub use self::fake_backend::{
    FakeBackend, FakeBackendConfig, FakeDeviceSpec, FakeFixture, WireDirection, WireLog,
    WireRecord,
};
pub use self::fake_device::DeviceBehaviour;
pub use self::hardware::HardwareClient;
pub(crate) use self::hardware::{fake_hardware_client, real_hardware_client};
pub use self::hid_backend::{HidDeviceInfo, HidLink, HidPort};
pub use self::j1939::{CanFrame, J1939Id, J1939Message, J1939Name, J1939NameFields};
#[cfg(target_os = "linux")]
pub use self::socketcan_backend::SocketCanBus;
pub use self::transport::{LinkGuard, SharedCanLink, Transport, TransportAddress};
