use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use derive_more::Display;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{Span, debug, info, instrument, trace, warn};

use crate::error::{SessionError, TeError, TransportError, UpdateError};
use crate::hw::{LinkGuard, Transport};
use crate::protocol::AckCode;
use crate::registry::{DeviceEntry, DeviceHandle, DeviceIdentity, Registry};

use super::command::{
    Brightness, Clearance, Command, Request, ScreenId, TargetFilter, VariableId, VariableValue,
    service_tool_key,
};
use super::frame_codec::{Frame, FrameCodec};
use super::reply::{AuthState, Reply};
use super::update::{UpdateEvent, UpdateOptions, UpdatePayload, UpdateReport, UpdateTransfer};

const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);
const DEFAULT_MALFORMED_RETRIES: u32 = 1;
const IDENTITY_RETRIES: u32 = 1;
const IDENTITY_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded retry policy applied to every exchange.
///
/// A single call never sends its request more than `retries + 1` times.
///
/// ```
/// use std::time::Duration;
/// use te::RetryPolicy;
///
/// let policy = RetryPolicy::builder().retries(4).timeout(Duration::from_secs(1)).build();
/// assert_eq!(5, policy.max_attempts());
/// assert_eq!(3, RetryPolicy::default().max_attempts());
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder)]
pub struct RetryPolicy {
    #[builder(default = DEFAULT_RETRIES)]
    retries: u32,
    /// Deadline for one attempt, from the last frame sent to the complete reply.
    #[builder(default = DEFAULT_TIMEOUT)]
    timeout: Duration,
    /// How many of the retries may be spent on undecodable replies.
    #[builder(default = DEFAULT_MALFORMED_RETRIES)]
    malformed_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Short policy used for identity queries during discovery.
    #[must_use]
    pub fn identity() -> Self {
        Self::builder()
            .retries(IDENTITY_RETRIES)
            .timeout(IDENTITY_TIMEOUT)
            .build()
    }

    #[must_use]
    pub fn retries(self) -> u32 {
        self.retries
    }

    #[must_use]
    pub fn timeout(self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn malformed_retries(self) -> u32 {
        self.malformed_retries
    }

    /// Total sends allowed for one request.
    #[must_use]
    pub fn max_attempts(self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Why a device declined a fire-and-forget command.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[display("not acknowledged")]
    Nack,
    #[display("cannot respond")]
    CannotRespond,
}

/// Result of a restart or set command.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum Status {
    #[display("success")]
    Success,
    #[display("failure ({_0})")]
    Failure(FailureReason),
}

impl Status {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Typed result of [`CommandSession::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Status(Status),
    Screen(ScreenId),
    Variable {
        screen: ScreenId,
        variable: VariableId,
        value: VariableValue,
    },
    Identity(DeviceIdentity),
    Update(UpdateReport),
}

/// Sends `request` and waits for the reply that answers it, retrying per `policy`.
///
/// Holds the link for the whole exchange. Leftovers from earlier exchanges are
/// drained before every attempt.
#[instrument(
    skip(transport, request, policy),
    level = "debug",
    fields(opcode = request.opcode(), attempts)
)]
pub(crate) async fn exchange(
    transport: &Transport,
    device: &str,
    request: &Request,
    policy: &RetryPolicy,
) -> Result<Reply, SessionError> {
    let frames: Vec<Vec<u8>> = FrameCodec::encode_request(request, transport.max_frame_len())?
        .iter()
        .map(Frame::to_bytes)
        .collect();
    let mut link = transport.lock().await;
    let mut malformed = 0;
    let mut attempts = 0;

    loop {
        attempts += 1;
        Span::current().record("attempts", attempts);

        let drained = link.drain().await?;
        if drained > 0 {
            debug!(device, drained, "discarded stale frames");
        }
        let outcome = match send_frames(&mut link, &frames).await {
            Ok(()) => receive_reply(&mut link, request, policy.timeout()).await,
            Err(error) => Err(error.into()),
        };

        match outcome {
            Ok(reply) => {
                trace!(device, reply = %reply, attempts, "exchange complete");
                return Ok(reply);
            }
            Err(SessionError::Codec(error))
                if malformed < policy.malformed_retries() && attempts < policy.max_attempts() =>
            {
                malformed += 1;
                warn!(device, %error, attempt = attempts, "malformed reply, resending");
            }
            Err(SessionError::Transport(error)) if error.is_retryable() => {
                if attempts >= policy.max_attempts() {
                    return Err(SessionError::Unresponsive {
                        device: device.to_owned(),
                        attempts,
                    });
                }
                warn!(device, %error, attempt = attempts, "no reply, resending");
            }
            Err(error) => return Err(error),
        }
    }
}

pub(crate) async fn send_frames(
    link: &mut LinkGuard<'_>,
    frames: &[Vec<u8>],
) -> Result<(), TransportError> {
    for frame in frames {
        link.send(frame).await?;
    }
    Ok(())
}

/// Reads replies until one answers `request`, discarding stale ones.
pub(crate) async fn receive_reply(
    link: &mut LinkGuard<'_>,
    request: &Request,
    timeout: Duration,
) -> Result<Reply, SessionError> {
    let deadline = Instant::now() + timeout;
    loop {
        let reply = read_reply(link, deadline, timeout).await?;
        if reply.answers(request) {
            return Ok(reply);
        }
        debug!(reply = %reply, "discarding reply that does not answer the request");
    }
}

/// Reads frames until one complete reply decodes.
pub(crate) async fn read_reply(
    link: &mut LinkGuard<'_>,
    deadline: Instant,
    timeout: Duration,
) -> Result<Reply, SessionError> {
    let mut pending = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::TimedOut { timeout }.into());
        }
        let bytes = match link.receive(remaining).await {
            Err(TransportError::TimedOut { .. }) => {
                return Err(TransportError::TimedOut { timeout }.into());
            }
            other => other?,
        };
        let frame = Frame::from_bytes(&bytes)?;
        if frame.index() == 0 {
            pending.clear();
        }
        let terminal = !frame.more();
        pending.push(frame);
        if terminal {
            return Ok(FrameCodec::decode_reply(&pending)?);
        }
    }
}

/// Reads versions, hardware id and project info.
pub(crate) async fn query_identity(
    transport: &Transport,
    device: &str,
    policy: &RetryPolicy,
) -> Result<DeviceIdentity, SessionError> {
    let versions = match exchange(transport, device, &Request::GetVersion, policy).await? {
        Reply::Version(versions) => versions,
        other => return Err(refusal(device, other)),
    };
    let hardware_id = match exchange(transport, device, &Request::GetHardwareId, policy).await? {
        Reply::HardwareId(id) => id,
        other => return Err(refusal(device, other)),
    };
    let project_info = match exchange(transport, device, &Request::GetProjectInfo, policy).await? {
        Reply::ProjectInfo(info) => info,
        other => return Err(refusal(device, other)),
    };
    Ok(DeviceIdentity {
        hardware_id,
        versions,
        project_info,
    })
}

/// Maps the acknowledgement of a set or restart command to its status.
fn ack_status(device: &str, reply: Reply) -> Result<Status, SessionError> {
    match reply {
        Reply::Ack {
            code: AckCode::Ok, ..
        } => Ok(Status::Success),
        Reply::Ack {
            code: AckCode::Nack,
            ..
        } => Ok(Status::Failure(FailureReason::Nack)),
        Reply::Ack {
            code: AckCode::CannotRespond,
            ..
        } => Ok(Status::Failure(FailureReason::CannotRespond)),
        other => Err(refusal(device, other)),
    }
}

/// Error for a reply that is not the payload a get command expects.
fn refusal(device: &str, reply: Reply) -> SessionError {
    match reply {
        Reply::Ack {
            opcode,
            code: AckCode::AccessDenied,
        } => SessionError::AccessDenied {
            device: device.to_owned(),
            opcode,
        },
        Reply::Ack { opcode, code } => SessionError::Rejected {
            device: device.to_owned(),
            opcode,
            code,
        },
        other => SessionError::UnexpectedResponse {
            device: device.to_owned(),
            response: other.to_string(),
        },
    }
}

/// Issues commands to registered devices, one in flight per device.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use te::{
///     CommandSession, DiscoveryConfig, FakeBackend, FakeBackendConfig, Registry, ScreenId,
///     Status,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = FakeBackend::new(
///     FakeBackendConfig::builder().fixture("usb:1-1".parse()?).build(),
/// );
/// let registry = Arc::new(Registry::new(backend.client()));
/// let devices = registry.discover(&DiscoveryConfig::default()).await?;
/// let session = CommandSession::new(registry);
///
/// let handle = &devices[0].handle;
/// assert_eq!(Status::Success, session.screen_set(handle, ScreenId::from(3)).await?);
/// assert_eq!(ScreenId::from(3), session.screen_get(handle).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CommandSession {
    registry: Arc<Registry>,
    policy: RetryPolicy,
}

impl CommandSession {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_policy(registry, RetryPolicy::default())
    }

    #[must_use]
    pub fn with_policy(registry: Arc<Registry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs one command against `handle`.
    ///
    /// # Errors
    ///
    /// Validation failures are returned before any frame is sent. Otherwise the
    /// error of the typed operation the command maps to is returned.
    #[instrument(skip(self, command), level = "info", fields(device = %handle, command = command.name()))]
    pub async fn execute(
        &self,
        handle: &DeviceHandle,
        command: Command,
    ) -> Result<Response, TeError> {
        let response = match command {
            Command::Restart { target, utility } => {
                target.check(handle.kind())?;
                Response::Status(self.restart(handle, utility).await?)
            }
            Command::Update { payload, target } => Response::Update(
                self.update(handle, payload, target, UpdateOptions::default())
                    .await?,
            ),
            Command::ScreenGet => Response::Screen(self.screen_get(handle).await?),
            Command::ScreenSet { screen } => Response::Status(self.screen_set(handle, screen).await?),
            Command::VariableGet { screen, variable } => Response::Variable {
                screen,
                variable,
                value: self.variable_get(handle, screen, variable).await?,
            },
            Command::VariableSet {
                screen,
                variable,
                value,
            } => Response::Status(self.variable_set(handle, screen, variable, value).await?),
            Command::BrightnessSet { level, store } => {
                Response::Status(self.set_brightness(handle, level, store).await?)
            }
            Command::Identify => Response::Identity(self.identify(handle).await?),
        };
        Ok(response)
    }

    /// Runs one command with `policy` in place of the session's own retry
    /// count and per-attempt deadline.
    ///
    /// # Errors
    ///
    /// Same as [`CommandSession::execute`].
    pub async fn execute_with(
        &self,
        handle: &DeviceHandle,
        command: Command,
        policy: RetryPolicy,
    ) -> Result<Response, TeError> {
        Self::with_policy(Arc::clone(&self.registry), policy)
            .execute(handle, command)
            .await
    }

    /// Takes the device's single-flight lock and refreshes a stale identity.
    async fn enter(
        &self,
        handle: &DeviceHandle,
    ) -> Result<(Arc<DeviceEntry>, OwnedMutexGuard<()>), SessionError> {
        let entry = self.registry.entry(handle).await?;
        let guard = entry.begin().await;
        if entry.is_stale() {
            debug!(device = %handle, "refreshing stale identity");
            let identity = query_identity(entry.transport(), &entry.label(), &self.policy).await?;
            entry.set_identity(identity).await;
        }
        Ok((entry, guard))
    }

    async fn request(&self, entry: &DeviceEntry, request: &Request) -> Result<Reply, SessionError> {
        exchange(entry.transport(), &entry.label(), request, &self.policy).await
    }

    async fn set(&self, handle: &DeviceHandle, request: Request) -> Result<Status, SessionError> {
        let (entry, _flight) = self.enter(handle).await?;
        let reply = self.request(&entry, &request).await?;
        ack_status(&entry.label(), reply)
    }

    /// Restarts the device, into the utility app when `utility` is set.
    ///
    /// The utility restart authenticates first. A successful restart marks the
    /// cached identity stale.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AccessDenied`] or
    /// [`SessionError::AuthenticationFailed`] when the device refuses the tool.
    #[instrument(skip(self), level = "info", fields(device = %handle))]
    pub async fn restart(&self, handle: &DeviceHandle, utility: bool) -> Result<Status, SessionError> {
        let (entry, _flight) = self.enter(handle).await?;
        if utility {
            self.authenticate_entry(&entry).await?;
        }
        let reply = self.request(&entry, &Request::Restart { utility }).await?;
        let status = ack_status(&entry.label(), reply)?;
        if status.is_success() {
            entry.mark_stale();
            info!(device = %handle, utility, "device restarting");
        }
        Ok(status)
    }

    /// Restarts every registered device the filter selects, one after another.
    pub async fn restart_all(
        &self,
        filter: TargetFilter,
        utility: bool,
    ) -> Vec<(DeviceHandle, Result<Status, SessionError>)> {
        let mut results = Vec::new();
        for handle in self.registry.handles(filter).await {
            let result = self.restart(&handle, utility).await;
            results.push((handle, result));
        }
        results
    }

    /// Reads the active GUIDE screen.
    ///
    /// # Errors
    ///
    /// Returns a session error when the device does not answer with a screen id.
    pub async fn screen_get(&self, handle: &DeviceHandle) -> Result<ScreenId, SessionError> {
        let (entry, _flight) = self.enter(handle).await?;
        match self.request(&entry, &Request::ScreenGet).await? {
            Reply::Screen(screen) => Ok(screen),
            other => Err(refusal(&entry.label(), other)),
        }
    }

    /// Switches the active GUIDE screen.
    ///
    /// # Errors
    ///
    /// Returns a session error when the exchange fails.
    pub async fn screen_set(
        &self,
        handle: &DeviceHandle,
        screen: ScreenId,
    ) -> Result<Status, SessionError> {
        self.set(handle, Request::ScreenSet { screen }).await
    }

    /// Reads a GUIDE variable.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Rejected`] when the device does not know the variable.
    pub async fn variable_get(
        &self,
        handle: &DeviceHandle,
        screen: ScreenId,
        variable: VariableId,
    ) -> Result<VariableValue, SessionError> {
        let (entry, _flight) = self.enter(handle).await?;
        match self
            .request(&entry, &Request::VariableGet { screen, variable })
            .await?
        {
            Reply::Variable { value, .. } => Ok(value),
            other => Err(refusal(&entry.label(), other)),
        }
    }

    /// Writes a GUIDE variable.
    ///
    /// # Errors
    ///
    /// Returns a session error when the exchange fails.
    pub async fn variable_set(
        &self,
        handle: &DeviceHandle,
        screen: ScreenId,
        variable: VariableId,
        value: VariableValue,
    ) -> Result<Status, SessionError> {
        self.set(
            handle,
            Request::VariableSet {
                screen,
                variable,
                value,
            },
        )
        .await
    }

    /// Sets the backlight level, persisting it across restarts when `store` is set.
    ///
    /// # Errors
    ///
    /// Returns a session error when the exchange fails.
    pub async fn set_brightness(
        &self,
        handle: &DeviceHandle,
        level: Brightness,
        store: bool,
    ) -> Result<Status, SessionError> {
        self.set(handle, Request::BrightnessSet { level, store }).await
    }

    /// Re-reads the device identity and caches it.
    ///
    /// # Errors
    ///
    /// Returns a session error when any of the three identity queries fails.
    pub async fn identify(&self, handle: &DeviceHandle) -> Result<DeviceIdentity, SessionError> {
        let entry = self.registry.entry(handle).await?;
        let _flight = entry.begin().await;
        let identity = query_identity(entry.transport(), &entry.label(), &self.policy).await?;
        entry.set_identity(identity).await;
        Ok(identity)
    }

    /// Cached identity, re-queried first when a restart or update made it stale.
    ///
    /// # Errors
    ///
    /// Returns a session error when the handle is stale or the refresh fails.
    pub async fn identity(&self, handle: &DeviceHandle) -> Result<DeviceIdentity, SessionError> {
        let (entry, _flight) = self.enter(handle).await?;
        Ok(entry.identity().await)
    }

    /// Obtains service-tool clearance.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthenticationFailed`] when the key is refused.
    pub async fn authenticate(&self, handle: &DeviceHandle) -> Result<(), SessionError> {
        let (entry, _flight) = self.enter(handle).await?;
        self.authenticate_entry(&entry).await
    }

    async fn authenticate_entry(&self, entry: &DeviceEntry) -> Result<(), SessionError> {
        let device = entry.label();
        let request = Request::AuthRequest {
            clearance: Clearance::ServiceTool,
        };
        let challenge = match self.request(entry, &request).await? {
            Reply::Auth {
                state: AuthState::Complete,
                ..
            } => return Ok(()),
            Reply::Auth {
                state: AuthState::Challenge,
                challenge,
            } => challenge,
            Reply::Auth { state, .. } => {
                return Err(SessionError::AuthenticationFailed {
                    device,
                    reason: format!("device reported {state}"),
                });
            }
            other => return Err(refusal(&device, other)),
        };

        let key = service_tool_key(entry.transport().auth_secret().await, challenge);
        match self.request(entry, &Request::AuthResponse { key }).await? {
            Reply::Auth {
                state: AuthState::Complete,
                ..
            } => {
                debug!(device, "authenticated");
                Ok(())
            }
            Reply::Ack {
                code: AckCode::AccessDenied,
                ..
            } => Err(SessionError::AuthenticationFailed {
                device,
                reason: "key refused".to_owned(),
            }),
            other => Err(SessionError::AuthenticationFailed {
                device,
                reason: format!("unexpected {other}"),
            }),
        }
    }

    /// Transfers `payload` to one device and waits for it to apply it.
    ///
    /// # Errors
    ///
    /// Returns an [`UpdateError`]; any interruption aborts the whole transfer.
    pub async fn update(
        &self,
        handle: &DeviceHandle,
        payload: UpdatePayload,
        target: TargetFilter,
        options: UpdateOptions,
    ) -> Result<UpdateReport, UpdateError> {
        self.begin_update(handle, payload, target, options)
            .await?
            .run(|_| {})
            .await
    }

    /// Starts an update and returns the transfer for the caller to drive.
    ///
    /// The device stays locked to this transfer until it is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Rejected`] or [`UpdateError::Busy`] when the device
    /// refuses the update, or a validation error when `target` excludes the device.
    pub async fn begin_update(
        &self,
        handle: &DeviceHandle,
        payload: UpdatePayload,
        target: TargetFilter,
        options: UpdateOptions,
    ) -> Result<UpdateTransfer, UpdateError> {
        target.check(handle.kind())?;
        let (entry, flight) = self.enter(handle).await?;
        UpdateTransfer::begin(entry, flight, payload, self.policy, options).await
    }

    /// Updates every registered device the filter selects, one after another.
    pub async fn update_all(
        &self,
        filter: TargetFilter,
        payload: &UpdatePayload,
        options: UpdateOptions,
        mut on_event: impl FnMut(&DeviceHandle, &UpdateEvent),
    ) -> Vec<(DeviceHandle, Result<UpdateReport, UpdateError>)> {
        let mut results = Vec::new();
        for handle in self.registry.handles(filter).await {
            let result = match self
                .begin_update(&handle, payload.clone(), filter, options)
                .await
            {
                Ok(transfer) => transfer.run(|event| on_event(&handle, event)).await,
                Err(error) => Err(error),
            };
            if let Err(error) = &result {
                warn!(device = %handle, %error, "update failed");
            }
            results.push((handle, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::hw::{FakeBackend, FakeBackendConfig, HidLink, WireDirection};
    use crate::registry::DiscoveryConfig;

    async fn session(fixture: &str) -> (FakeBackend, CommandSession, Vec<DeviceHandle>) {
        let backend = FakeBackend::new(
            FakeBackendConfig::builder()
                .fixture(fixture.parse().expect("fixture should parse"))
                .build(),
        );
        let registry = Arc::new(Registry::new(backend.client()));
        let devices = registry
            .discover(&DiscoveryConfig::default())
            .await
            .expect("discovery should succeed");
        let handles = devices.into_iter().map(|device| device.handle).collect();
        (backend, CommandSession::new(registry), handles)
    }

    #[rstest]
    #[case::ok(AckCode::Ok, Status::Success)]
    #[case::nack(AckCode::Nack, Status::Failure(FailureReason::Nack))]
    #[case::cannot_respond(AckCode::CannotRespond, Status::Failure(FailureReason::CannotRespond))]
    fn acks_map_to_status(#[case] code: AckCode, #[case] expected: Status) {
        let reply = Reply::Ack { opcode: 0x0B, code };
        assert_eq!(expected, ack_status("dev", reply).expect("ack should map"));
    }

    #[test]
    fn access_denied_is_an_error() {
        let reply = Reply::Ack {
            opcode: 0x45,
            code: AckCode::AccessDenied,
        };
        assert_matches!(
            ack_status("dev", reply),
            Err(SessionError::AccessDenied { opcode: 0x45, .. })
        );
    }

    #[test]
    fn status_serialises_with_reason() {
        let json = serde_json::to_value(Status::Failure(FailureReason::Nack))
            .expect("status should serialise");
        assert_eq!(serde_json::json!({"status": "failure", "reason": "nack"}), json);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_variable_is_rejected() {
        let (_backend, session, handles) = session("usb:1-1").await;

        let result = session
            .variable_get(&handles[0], ScreenId::from(1), VariableId::from(9))
            .await;

        assert_matches!(
            result,
            Err(SessionError::Rejected {
                code: AckCode::Nack,
                ..
            })
        );
    }

    fn hid_transport(fixture: &str) -> (FakeBackend, Transport) {
        let backend = FakeBackend::new(
            FakeBackendConfig::builder()
                .fixture(fixture.parse().expect("fixture should parse"))
                .build(),
        );
        let port = backend.open_hid("1-1").expect("fake port should open");
        (backend, Transport::Hid(HidLink::new(Box::new(port))))
    }

    fn sends(backend: &FakeBackend) -> usize {
        backend
            .wire_log()
            .hid_frames("1-1")
            .iter()
            .filter(|(direction, _)| *direction == WireDirection::ToDevice)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_is_resent_once() -> Result<(), SessionError> {
        let (backend, transport) = hid_transport("usb:1-1,malformed=1");

        let reply = exchange(&transport, "dev", &Request::ScreenGet, &RetryPolicy::default()).await?;

        assert_eq!(Reply::Screen(ScreenId::from(0)), reply);
        assert_eq!(2, sends(&backend));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn second_malformed_reply_surfaces_codec_error() {
        let (backend, transport) = hid_transport("usb:1-1,malformed=2");

        let result = exchange(&transport, "dev", &Request::ScreenGet, &RetryPolicy::default()).await;

        assert_matches!(result, Err(SessionError::Codec(_)));
        assert_eq!(2, sends(&backend));
    }

    #[rstest]
    #[case::no_retries(0, 1)]
    #[case::default_retries(2, 3)]
    #[tokio::test(start_paused = true)]
    async fn silent_device_exhausts_the_retry_budget(#[case] retries: u32, #[case] expected: u32) {
        let (backend, transport) = hid_transport("usb:1-1,silent");
        let policy = RetryPolicy::builder().retries(retries).build();

        let result = exchange(&transport, "dev", &Request::GetVersion, &policy).await;

        assert_matches!(
            result,
            Err(SessionError::Unresponsive { attempts, .. }) if attempts == expected
        );
        assert_eq!(expected as usize, sends(&backend));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_reply_is_recovered_by_resending() -> Result<(), SessionError> {
        let (backend, transport) = hid_transport("usb:1-1,drop=1");

        let reply = exchange(&transport, "dev", &Request::GetHardwareId, &RetryPolicy::default()).await?;

        assert_matches!(reply, Reply::HardwareId(_));
        assert_eq!(2, sends(&backend));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn utility_restart_authenticates_first() -> Result<(), SessionError> {
        let (backend, session, handles) = session("can0:0xf2").await;

        let status = session.restart(&handles[0], true).await?;

        assert_eq!(Status::Success, status);
        assert_eq!(Some(1), backend.restarts(handles[0].address()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn denied_authentication_fails_the_restart() {
        let (backend, session, handles) = session("usb:1-1,deny-auth").await;

        let result = session.restart(&handles[0], true).await;

        assert_matches!(result, Err(SessionError::AuthenticationFailed { .. }));
        assert_eq!(Some(0), backend.restarts(handles[0].address()));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_marks_identity_stale_until_requeried() -> Result<(), SessionError> {
        let (_backend, session, handles) = session("usb:1-1").await;
        session.restart(&handles[0], false).await?;

        let entry = session.registry().entry(&handles[0]).await?;
        assert!(entry.is_stale());

        session.identity(&handles[0]).await?;
        assert!(!entry.is_stale());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn execute_rejects_target_mismatch_before_sending() {
        let (backend, session, handles) = session("usb:1-1").await;
        backend.wire_log().clear();

        let result = session
            .execute(
                &handles[0],
                Command::Restart {
                    target: TargetFilter::Can,
                    utility: false,
                },
            )
            .await;

        assert_matches!(result, Err(TeError::Validation(_)));
        assert!(backend.wire_log().records().is_empty());
    }
}
