mod command;
mod frame_codec;
mod reply;
mod session;
mod update;

pub use self::command::{
    Brightness, Clearance, Command, PayloadKind, Request, ScreenId, TargetFilter, VariableId,
    VariableValue, service_tool_key,
};
pub use self::frame_codec::{FRAME_HEADER_LEN, Frame, FrameCodec};
pub use self::reply::{
    AuthState, ComponentKind, ComponentStatus, ProjectInfo, ProjectType, Reply, UpdateAcceptance,
    UpdateStatus, UploadError, Version, VersionReport,
};
pub use self::session::{CommandSession, FailureReason, Response, RetryPolicy, Status};
pub(crate) use self::session::query_identity;
pub use self::update::{
    UpdateEvent, UpdateOptions, UpdatePayload, UpdateReport, UpdateSession, UpdateState,
    UpdateStep, UpdateTransfer,
};
