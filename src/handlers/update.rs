use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use indicatif::ProgressStyle;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{Span, debug, info, instrument, trace, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{SessionError, UpdateError, ValidationError};
use crate::protocol::AckCode;
use crate::registry::{DeviceEntry, DeviceHandle};

use super::command::{PayloadKind, Request};
use super::frame_codec::{FRAME_HEADER_LEN, Frame, FrameCodec};
use super::reply::{ComponentKind, ComponentStatus, Reply, UpdateAcceptance, UpdateStatus, UploadError};
use super::session::{RetryPolicy, exchange, read_reply, receive_reply, send_frames};

const CHUNK_OFFSET_LEN: usize = 4;
const MAX_PAYLOAD_LEN: u64 = u32::MAX as u64;
const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes to transfer and the flash region they go to.
///
/// The bytes are shared, so cloning a payload for several devices is cheap.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpdatePayload {
    kind: PayloadKind,
    bytes: Arc<[u8]>,
}

impl UpdatePayload {
    /// Wraps a non-empty payload.
    ///
    /// ```
    /// use te::{PayloadKind, UpdatePayload, ValidationError};
    ///
    /// let payload = UpdatePayload::new(PayloadKind::Project, vec![1, 2, 3])?;
    /// assert_eq!(3, payload.len());
    /// assert_eq!(
    ///     Err(ValidationError::EmptyPayload),
    ///     UpdatePayload::new(PayloadKind::Firmware, Vec::new()),
    /// );
    /// # Ok::<(), ValidationError>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is empty or too large for the 32-bit
    /// length field.
    pub fn new(kind: PayloadKind, bytes: impl Into<Vec<u8>>) -> Result<Self, ValidationError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        if u64::try_from(bytes.len()).map_or(true, |len| len > MAX_PAYLOAD_LEN) {
            return Err(ValidationError::PayloadTooLarge {
                len: bytes.len(),
                max: usize::try_from(MAX_PAYLOAD_LEN).unwrap_or(usize::MAX),
            });
        }
        Ok(Self {
            kind,
            bytes: bytes.into(),
        })
    }

    /// Wraps a payload whose length was declared by its source.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::PayloadLengthMismatch`] when the bytes fall short
    /// of or exceed `declared`.
    pub fn with_declared_len(
        kind: PayloadKind,
        bytes: impl Into<Vec<u8>>,
        declared: usize,
    ) -> Result<Self, ValidationError> {
        let bytes = bytes.into();
        if bytes.len() != declared {
            return Err(ValidationError::PayloadLengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        Self::new(kind, bytes)
    }

    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// CRC-32 of the payload, for matching against a package manifest.
    #[must_use]
    pub fn crc32(&self) -> u32 {
        crc32fast::hash(&self.bytes)
    }
}

/// Where an [`UpdateSession`] is.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// Chunks remain unacknowledged.
    Transferring,
    /// Every byte is acknowledged; waiting for the device to apply them.
    AwaitingStatus,
    Completed,
    Aborted,
}

/// What the driver does after feeding an event to the [`UpdateSession`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpdateStep {
    /// Send the next chunk.
    Advance,
    /// Send the same chunk again.
    Retransmit,
    /// The last chunk is acknowledged.
    Transferred,
    /// The retransmission budget is spent.
    Abort,
}

/// Sequencing of one chunked transfer.
///
/// Acknowledged bytes never decrease, and the next chunk index is always
/// `acknowledged / chunk_size`. Each chunk may be sent twice at most.
///
/// ```
/// use te::{UpdateSession, UpdateStep};
///
/// let mut session = UpdateSession::new(10, 4);
/// assert_eq!(Some(0..4), session.next_chunk());
/// assert_eq!(Some(UpdateStep::Advance), session.on_ack(4).ok());
/// assert_eq!(Some(UpdateStep::Retransmit), session.on_ack(4).ok());
/// assert_eq!(Some(UpdateStep::Advance), session.on_ack(8).ok());
/// assert_eq!(Some(8..10), session.next_chunk());
/// assert_eq!(Some(UpdateStep::Transferred), session.on_ack(10).ok());
/// assert_eq!(None, session.next_chunk());
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpdateSession {
    total: u64,
    chunk_size: u64,
    acknowledged: u64,
    retransmitted: bool,
    retransmissions: u32,
    state: UpdateState,
}

impl UpdateSession {
    /// Starts a transfer of `total` bytes in chunks of `chunk_size`.
    #[must_use]
    pub fn new(total: u64, chunk_size: usize) -> Self {
        let chunk_size = u64::try_from(chunk_size).unwrap_or(u64::MAX).max(1);
        Self {
            total,
            chunk_size,
            acknowledged: 0,
            retransmitted: false,
            retransmissions: 0,
            state: UpdateState::Transferring,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    #[must_use]
    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    #[must_use]
    pub fn state(&self) -> UpdateState {
        self.state
    }

    #[must_use]
    pub fn next_chunk_index(&self) -> u64 {
        self.acknowledged / self.chunk_size
    }

    /// Times the current chunk has been sent, counting a pending retransmission.
    #[must_use]
    pub fn chunk_attempts(&self) -> u32 {
        1 + u32::from(self.retransmitted)
    }

    /// Whether the chunk about to be sent is a retransmission.
    #[must_use]
    pub fn is_retransmitting(&self) -> bool {
        self.retransmitted
    }

    /// Byte range of the chunk to send, or `None` once nothing is left to send.
    #[must_use]
    pub fn next_chunk(&self) -> Option<Range<u64>> {
        if self.state != UpdateState::Transferring {
            return None;
        }
        Some(self.acknowledged..self.chunk_end())
    }

    fn chunk_end(&self) -> u64 {
        self.acknowledged
            .saturating_add(self.chunk_size)
            .min(self.total)
    }

    /// Applies an acknowledgement carrying the device's next expected offset.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Desync`] when the offset is past the chunk just sent,
    /// or still behind it after the one retransmission.
    pub fn on_ack(&mut self, reported: u64) -> Result<UpdateStep, UpdateError> {
        let expected = self.chunk_end();
        if self.state != UpdateState::Transferring || reported > expected {
            return Err(self.desync(expected, reported));
        }
        if reported < expected {
            return self
                .retransmit()
                .map(|()| UpdateStep::Retransmit)
                .ok_or_else(|| self.desync(expected, reported));
        }

        self.acknowledged = expected;
        self.retransmitted = false;
        if self.acknowledged == self.total {
            self.state = UpdateState::AwaitingStatus;
            return Ok(UpdateStep::Transferred);
        }
        Ok(UpdateStep::Advance)
    }

    /// Applies a missing acknowledgement.
    pub fn on_timeout(&mut self) -> UpdateStep {
        if self.retransmit().is_some() {
            return UpdateStep::Retransmit;
        }
        self.state = UpdateState::Aborted;
        UpdateStep::Abort
    }

    /// Marks the transfer finished once the device reported its status.
    pub fn complete(&mut self) {
        self.state = UpdateState::Completed;
    }

    pub fn abort(&mut self) {
        self.state = UpdateState::Aborted;
    }

    fn retransmit(&mut self) -> Option<()> {
        if self.retransmitted || self.state != UpdateState::Transferring {
            return None;
        }
        self.retransmitted = true;
        self.retransmissions += 1;
        Some(())
    }

    fn desync(&mut self, expected: u64, reported: u64) -> UpdateError {
        self.state = UpdateState::Aborted;
        UpdateError::Desync { expected, reported }
    }
}

/// Tuning of the completion phase.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder)]
pub struct UpdateOptions {
    /// How long the device may take to apply the payload after the last chunk.
    #[builder(default = DEFAULT_COMPLETION_TIMEOUT)]
    completion_timeout: Duration,
    /// Restart the device after a successful update.
    #[builder(default = true)]
    restart_after: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl UpdateOptions {
    #[must_use]
    pub fn completion_timeout(self) -> Duration {
        self.completion_timeout
    }

    #[must_use]
    pub fn restart_after(self) -> bool {
        self.restart_after
    }
}

/// Progress of one transfer, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Started {
        total: u64,
        chunk_size: u64,
    },
    Progress {
        acknowledged: u64,
        total: u64,
    },
    /// The chunk at `offset` is being sent again.
    Retransmit {
        offset: u64,
    },
    Component {
        component: ComponentKind,
        status: ComponentStatus,
        percent: u8,
    },
    Finished(UpdateReport),
}

/// Summary of a completed update.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct UpdateReport {
    pub device: DeviceHandle,
    pub kind: PayloadKind,
    pub total: u64,
    pub chunk_size: u64,
    #[serde(serialize_with = "serialize_crc")]
    pub crc32: u32,
    pub status: UpdateStatus,
    pub retransmissions: u32,
    pub restarted: bool,
}

fn transfer_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.cyan.bold} {msg} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes}",
    )
    .unwrap_or_else(|_error| ProgressStyle::default_bar())
}

fn serialize_crc<S: serde::Serializer>(crc: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{crc:08x}"))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Phase {
    Starting,
    Chunks,
    Completion { deadline: Instant },
    Done,
}

/// A running update, driven one event at a time.
///
/// Holds the device's single-flight lock until dropped, so no other command
/// reaches the device mid-transfer.
pub struct UpdateTransfer {
    entry: Arc<DeviceEntry>,
    _flight: OwnedMutexGuard<()>,
    device: String,
    payload: UpdatePayload,
    session: UpdateSession,
    policy: RetryPolicy,
    options: UpdateOptions,
    phase: Phase,
}

impl std::fmt::Debug for UpdateTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateTransfer")
            .field("device", &self.device)
            .field("session", &self.session)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl UpdateTransfer {
    /// Asks the device to accept `payload` and negotiates the chunk size.
    pub(crate) async fn begin(
        entry: Arc<DeviceEntry>,
        flight: OwnedMutexGuard<()>,
        payload: UpdatePayload,
        policy: RetryPolicy,
        options: UpdateOptions,
    ) -> Result<Self, UpdateError> {
        let device = entry.label();
        let total = u32::try_from(payload.len()).map_err(|_| ValidationError::PayloadTooLarge {
            len: payload.len(),
            max: usize::try_from(MAX_PAYLOAD_LEN).unwrap_or(usize::MAX),
        })?;
        let request = Request::UpdateBegin {
            kind: payload.kind(),
            total,
        };

        let max_chunk = match exchange(entry.transport(), &device, &request, &policy).await? {
            Reply::UpdateReply {
                acceptance: UpdateAcceptance::Accepted,
                max_chunk,
            } => max_chunk,
            Reply::UpdateReply {
                acceptance: UpdateAcceptance::Busy,
                ..
            } => return Err(UpdateError::Busy { device }),
            Reply::UpdateReply { acceptance, .. } => {
                debug!(device, %acceptance, "update refused");
                return Err(UpdateError::Rejected { device });
            }
            Reply::Ack {
                code: AckCode::AccessDenied,
                opcode,
            } => return Err(SessionError::AccessDenied { device, opcode }.into()),
            Reply::Ack { .. } => return Err(UpdateError::Rejected { device }),
            other => {
                return Err(SessionError::UnexpectedResponse {
                    device,
                    response: other.to_string(),
                }
                .into());
            }
        };

        let frame_room = entry
            .transport()
            .max_frame_len()
            .saturating_sub(FRAME_HEADER_LEN + CHUNK_OFFSET_LEN);
        let chunk_size = usize::from(max_chunk).min(frame_room);
        info!(
            device,
            kind = %payload.kind(),
            total,
            chunk_size,
            crc32 = format_args!("{:08x}", payload.crc32()),
            "update accepted"
        );

        Ok(Self {
            session: UpdateSession::new(u64::from(total), chunk_size),
            entry,
            _flight: flight,
            device,
            payload,
            policy,
            options,
            phase: Phase::Starting,
        })
    }

    #[must_use]
    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    /// Drives the transfer to its next event.
    ///
    /// Returns `None` after [`UpdateEvent::Finished`] or an error. An error ends
    /// the transfer; a new one must start from offset zero.
    pub async fn next_event(&mut self) -> Option<Result<UpdateEvent, UpdateError>> {
        let result = match self.phase {
            Phase::Starting => {
                self.phase = Phase::Chunks;
                Ok(UpdateEvent::Started {
                    total: self.session.total(),
                    chunk_size: self.session.chunk_size(),
                })
            }
            Phase::Chunks => self.send_chunk().await,
            Phase::Completion { deadline } => self.await_status(deadline).await,
            Phase::Done => return None,
        };
        if result.is_err() {
            self.session.abort();
            self.phase = Phase::Done;
        }
        Some(result)
    }

    /// Drives the transfer to completion, handing every event to `on_event`.
    ///
    /// # Errors
    ///
    /// Returns the first error; the transfer is aborted.
    #[instrument(skip_all, level = "info", fields(device = %self.device, kind = %self.payload.kind()))]
    pub async fn run(
        mut self,
        mut on_event: impl FnMut(&UpdateEvent),
    ) -> Result<UpdateReport, UpdateError> {
        let span = Span::current();
        while let Some(event) = self.next_event().await {
            let event = event?;
            match &event {
                UpdateEvent::Started { total, .. } => {
                    span.pb_set_style(&transfer_style());
                    span.pb_set_length(*total);
                    span.pb_set_message(&format!("Updating {}", self.device));
                }
                UpdateEvent::Progress { acknowledged, .. } => span.pb_set_position(*acknowledged),
                UpdateEvent::Component {
                    component, percent, ..
                } => span.pb_set_message(&format!(
                    "{}: applying {component} {percent}%",
                    self.device
                )),
                _ => {}
            }
            on_event(&event);
            if let UpdateEvent::Finished(report) = event {
                return Ok(report);
            }
        }
        Err(UpdateError::Ended {
            device: self.device,
        })
    }

    async fn send_chunk(&mut self) -> Result<UpdateEvent, UpdateError> {
        let Some(range) = self.session.next_chunk() else {
            return Err(UpdateError::Ended {
                device: self.device.clone(),
            });
        };
        let offset = range.start;
        let request = self.chunk_request(range)?;
        let frames: Vec<Vec<u8>> =
            FrameCodec::encode_request(&request, self.entry.transport().max_frame_len())
                .map_err(SessionError::from)?
                .iter()
                .map(Frame::to_bytes)
                .collect();

        let outcome = {
            let mut link = self.entry.transport().lock().await;
            if self.session.is_retransmitting() {
                link.drain().await.map_err(SessionError::from)?;
            }
            match send_frames(&mut link, &frames).await {
                Ok(()) => receive_reply(&mut link, &request, self.policy.timeout()).await,
                Err(error) => Err(error.into()),
            }
        };

        let step = match outcome {
            Ok(Reply::UploadProgress {
                error: UploadError::Ok,
                next_offset,
            }) => self.session.on_ack(u64::from(next_offset))?,
            Ok(Reply::UploadProgress { error, .. }) => {
                return Err(UpdateError::UploadFailed {
                    device: self.device.clone(),
                    code: error.raw(),
                });
            }
            Ok(Reply::Ack { opcode, code }) => {
                return Err(SessionError::Rejected {
                    device: self.device.clone(),
                    opcode,
                    code,
                }
                .into());
            }
            Ok(other) => {
                return Err(SessionError::UnexpectedResponse {
                    device: self.device.clone(),
                    response: other.to_string(),
                }
                .into());
            }
            Err(SessionError::Transport(error)) if error.is_retryable() => {
                warn!(device = %self.device, offset, %error, "chunk not acknowledged");
                self.session.on_timeout()
            }
            Err(SessionError::Codec(error)) => {
                warn!(device = %self.device, offset, %error, "undecodable chunk acknowledgement");
                self.session.on_timeout()
            }
            Err(error) => return Err(error.into()),
        };

        match step {
            UpdateStep::Advance => Ok(self.progress()),
            UpdateStep::Retransmit => Ok(UpdateEvent::Retransmit { offset }),
            UpdateStep::Transferred => {
                debug!(device = %self.device, "all bytes acknowledged");
                self.phase = Phase::Completion {
                    deadline: Instant::now() + self.options.completion_timeout(),
                };
                Ok(self.progress())
            }
            UpdateStep::Abort => Err(UpdateError::Aborted {
                acknowledged: self.session.acknowledged(),
                total: self.session.total(),
                source: Box::new(SessionError::Unresponsive {
                    device: self.device.clone(),
                    attempts: self.session.chunk_attempts(),
                }),
            }),
        }
    }

    fn chunk_request(&self, range: Range<u64>) -> Result<Request, UpdateError> {
        let start = usize::try_from(range.start).map_err(|_| self.too_large())?;
        let end = usize::try_from(range.end).map_err(|_| self.too_large())?;
        let offset = u32::try_from(range.start).map_err(|_| self.too_large())?;
        Ok(Request::UpdateChunk {
            kind: self.payload.kind(),
            offset,
            data: self.payload.bytes()[start..end].to_vec(),
        })
    }

    fn too_large(&self) -> UpdateError {
        ValidationError::PayloadTooLarge {
            len: self.payload.len(),
            max: usize::try_from(MAX_PAYLOAD_LEN).unwrap_or(usize::MAX),
        }
        .into()
    }

    fn progress(&self) -> UpdateEvent {
        UpdateEvent::Progress {
            acknowledged: self.session.acknowledged(),
            total: self.session.total(),
        }
    }

    /// Waits for component reports and the final status.
    ///
    /// The link is held while waiting, so other devices on a shared CAN
    /// interface cannot consume the status frames.
    async fn await_status(&mut self, deadline: Instant) -> Result<UpdateEvent, UpdateError> {
        let timeout = self.options.completion_timeout();
        loop {
            let reply = {
                let mut link = self.entry.transport().lock().await;
                read_reply(&mut link, deadline, timeout).await
            };
            match reply {
                Ok(Reply::ComponentProgress {
                    component,
                    status,
                    percent,
                }) => {
                    return Ok(UpdateEvent::Component {
                        component,
                        status,
                        percent,
                    });
                }
                Ok(Reply::UpdateFinished(UpdateStatus::Ongoing)) => {
                    trace!(device = %self.device, "update still ongoing");
                }
                Ok(Reply::UpdateFinished(status)) => return self.finish(status).await,
                Ok(other) => debug!(device = %self.device, reply = %other, "ignoring reply while awaiting status"),
                Err(SessionError::Codec(error)) => {
                    warn!(device = %self.device, %error, "undecodable status report");
                }
                Err(error) => {
                    return Err(UpdateError::Aborted {
                        acknowledged: self.session.acknowledged(),
                        total: self.session.total(),
                        source: Box::new(error),
                    });
                }
            }
        }
    }

    async fn finish(&mut self, status: UpdateStatus) -> Result<UpdateEvent, UpdateError> {
        self.entry.mark_stale();
        if !status.is_success() {
            return Err(UpdateError::DeviceFailure {
                device: self.device.clone(),
                status: status.to_string(),
            });
        }

        let mut restarted = false;
        if self.options.restart_after() && status != UpdateStatus::SuccessUpToDate {
            let request = Request::Restart { utility: false };
            match exchange(self.entry.transport(), &self.device, &request, &self.policy).await {
                Ok(Reply::Ack {
                    code: AckCode::Ok, ..
                }) => restarted = true,
                Ok(reply) => warn!(device = %self.device, %reply, "restart after update refused"),
                Err(error) => warn!(device = %self.device, %error, "restart after update failed"),
            }
        }

        self.session.complete();
        self.phase = Phase::Done;
        info!(device = %self.device, %status, restarted, "update finished");
        Ok(UpdateEvent::Finished(UpdateReport {
            device: self.entry.handle().clone(),
            kind: self.payload.kind(),
            total: self.session.total(),
            chunk_size: self.session.chunk_size(),
            crc32: self.payload.crc32(),
            status,
            retransmissions: self.session.retransmissions(),
            restarted,
        }))
    }
}
