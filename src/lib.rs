mod app;
mod cli;
mod error;
mod handlers;
mod hw;
mod protocol;
mod registry;
mod telemetry;
mod terminal;
mod utils;

pub use app::{fake_hardware_client, real_hardware_client, run, run_with_clients};
pub use cli::{
    Args, BrightnessArgs, Command, FakeArgs, InfoArgs, KindArg, LogLevel, OutputFormat, RestartArgs,
    RunOptions, ScreenAction, ScreenArgs, TargetArg, UpdateArgs, VariableAction, VariableArgs,
};
pub use error::{
    CodecError, DiscoveryError, FixtureError, SessionError, TeError, TransportError,
    UpdateError, ValidationError,
};
pub use handlers::{
    AuthState, Brightness, Clearance, Command as DeviceCommand, CommandSession, ComponentKind,
    ComponentStatus, FRAME_HEADER_LEN, FailureReason, Frame, FrameCodec, PayloadKind, ProjectInfo,
    ProjectType, Reply, Request, Response, RetryPolicy, ScreenId, Status, TargetFilter,
    UpdateAcceptance, UpdateEvent, UpdateOptions, UpdatePayload, UpdateReport, UpdateSession,
    UpdateState, UpdateStatus, UpdateStep, UpdateTransfer, UploadError, VariableId, VariableValue,
    Version, VersionReport, service_tool_key,
};
pub use hw::{
    CanBus, CanConfig, CanFrame, ClaimedAddress, DEFAULT_SCAN_WINDOW, DEFAULT_TOOL_ADDRESS,
    DeviceBehaviour, FakeBackend, FakeBackendConfig, FakeDeviceSpec, FakeFixture, HardwareClient,
    HidDeviceInfo, HidLink, HidPort, J1939Id, J1939Link, J1939Message, J1939Name,
    J1939NameFields, LinkGuard, SharedCanLink, Transport, TransportAddress, WireDirection,
    WireLog, WireRecord, default_tool_name,
};
#[cfg(target_os = "linux")]
pub use hw::SocketCanBus;
pub use protocol::{AckCode, HardwareId, TransportKind};
pub use registry::{DeviceHandle, DeviceIdentity, DiscoveredDevice, DiscoveryConfig, Registry};
pub use terminal::TerminalClient;
