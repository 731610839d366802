use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::protocol::{
    HID_REPORT_HEADER_LEN, HID_REPORT_ID_IN, HID_REPORT_ID_OUT, HID_REPORT_LEN, USB_COMMAND_INTERFACE,
    USB_PRODUCT_ID, USB_VENDOR_ID,
};
use crate::utils::format_hex;

const MAX_REPORT_PAYLOAD: usize = HID_REPORT_LEN - HID_REPORT_HEADER_LEN;

/// A Touch Encoder visible on the USB bus.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct HidDeviceInfo {
    path: String,
    serial: Option<String>,
}

impl HidDeviceInfo {
    #[must_use]
    pub fn new(path: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            path: path.into(),
            serial,
        }
    }

    /// Platform device path used to open the port.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }
}

/// Raw report I/O against one opened HID device.
#[async_trait]
pub trait HidPort: Send + Sync {
    /// Device path the port was opened from.
    fn path(&self) -> &str;

    /// Writes one full output report.
    async fn write_report(&self, report: &[u8; HID_REPORT_LEN]) -> Result<(), TransportError>;

    /// Reads one input report, or times out.
    async fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// Wraps one codec frame in a report with the given id.
///
/// # Errors
///
/// Returns [`TransportError::FrameTooLarge`] when the frame does not fit one report.
pub(crate) fn encode_report(
    frame: &[u8],
    report_id: u8,
) -> Result<[u8; HID_REPORT_LEN], TransportError> {
    let Ok(len) = u8::try_from(frame.len()) else {
        return Err(too_large(frame.len()));
    };
    if frame.len() > MAX_REPORT_PAYLOAD {
        return Err(too_large(frame.len()));
    }

    let mut report = [0_u8; HID_REPORT_LEN];
    report[0] = report_id;
    report[1] = len;
    report[HID_REPORT_HEADER_LEN..HID_REPORT_HEADER_LEN + frame.len()].copy_from_slice(frame);
    Ok(report)
}

/// Extracts the frame carried by an input report.
///
/// Returns `None` for reports that do not carry a frame: a foreign report id, a
/// zero or oversized length, or a truncated buffer.
pub(crate) fn decode_report(report: &[u8], report_id: u8) -> Option<&[u8]> {
    let [id, len, body @ ..] = report else {
        return None;
    };
    let len = usize::from(*len);
    if *id != report_id || len == 0 || len > MAX_REPORT_PAYLOAD {
        return None;
    }
    body.get(..len)
}

fn too_large(len: usize) -> TransportError {
    TransportError::FrameTooLarge {
        len,
        max: MAX_REPORT_PAYLOAD,
    }
}

/// Frame-level link over one HID port.
pub struct HidLink {
    port: Box<dyn HidPort>,
}

impl std::fmt::Debug for HidLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidLink")
            .field("path", &self.port.path())
            .finish_non_exhaustive()
    }
}

impl HidLink {
    #[must_use]
    pub fn new(port: Box<dyn HidPort>) -> Self {
        Self { port }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.port.path()
    }

    /// Sends one codec frame as one report.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame is oversized or the write fails.
    pub async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let report = encode_report(frame, HID_REPORT_ID_OUT)?;
        trace!(path = self.path(), report = %format_hex(&report[..HID_REPORT_HEADER_LEN + frame.len()]), "hid write");
        self.port.write_report(&report).await
    }

    /// Receives the next codec frame, skipping reports that carry none.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TimedOut`] when no frame arrives before `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::TimedOut { timeout });
            }

            let report = match self.port.read_report(remaining).await {
                Err(TransportError::TimedOut { .. }) => {
                    return Err(TransportError::TimedOut { timeout });
                }
                other => other?,
            };
            match decode_report(&report, HID_REPORT_ID_IN) {
                Some(frame) => return Ok(frame.to_vec()),
                None => trace!(path = self.path(), report = %format_hex(&report), "ignoring foreign report"),
            }
        }
    }

    /// Discards reports already queued on the port.
    ///
    /// # Errors
    ///
    /// Returns the link error when the port fails instead of running dry.
    pub async fn drain(&self) -> Result<usize, TransportError> {
        let mut discarded = 0;
        loop {
            match self.port.read_report(Duration::ZERO).await {
                Ok(_) => discarded += 1,
                Err(TransportError::TimedOut { .. }) => break,
                Err(error) => return Err(error),
            }
        }
        if discarded > 0 {
            debug!(path = self.path(), discarded, "drained stale HID reports");
        }
        Ok(discarded)
    }
}

/// Lists Touch Encoder command interfaces currently attached.
///
/// # Errors
///
/// Returns [`TransportError::Unavailable`] when the HID subsystem cannot be initialised.
pub(crate) fn enumerate_hid() -> Result<Vec<HidDeviceInfo>, TransportError> {
    let api = HidApi::new().map_err(|error| hid_unavailable("usb", &error))?;

    let mut devices: Vec<HidDeviceInfo> = api
        .device_list()
        .filter(|info| info.vendor_id() == USB_VENDOR_ID && info.product_id() == USB_PRODUCT_ID)
        .filter(|info| info.interface_number() == USB_COMMAND_INTERFACE)
        .map(|info| {
            HidDeviceInfo::new(
                info.path().to_string_lossy().into_owned(),
                info.serial_number().map(str::to_owned),
            )
        })
        .collect();
    devices.sort();
    devices.dedup();
    Ok(devices)
}

/// Opens the device at `path`.
///
/// # Errors
///
/// Returns [`TransportError::Unavailable`] when the device cannot be opened.
pub(crate) fn open_hid(path: &str) -> Result<HidApiPort, TransportError> {
    let api = HidApi::new().map_err(|error| hid_unavailable(path, &error))?;
    let c_path = CString::new(path).map_err(|_| TransportError::Unavailable {
        address: path.to_owned(),
        reason: "device path contains a NUL byte".to_owned(),
    })?;
    let device = api
        .open_path(&c_path)
        .map_err(|error| hid_unavailable(path, &error))?;

    Ok(HidApiPort {
        path: path.to_owned(),
        device: Arc::new(Mutex::new(device)),
    })
}

fn hid_unavailable(address: &str, error: &hidapi::HidError) -> TransportError {
    TransportError::Unavailable {
        address: address.to_owned(),
        reason: error.to_string(),
    }
}

/// `hidapi`-backed port. Blocking calls run on the blocking thread pool.
pub struct HidApiPort {
    path: String,
    device: Arc<Mutex<HidDevice>>,
}

impl HidApiPort {
    async fn with_device<T, F>(&self, operation: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&HidDevice) -> Result<T, hidapi::HidError> + Send + 'static,
    {
        let device = Arc::clone(&self.device);
        let path = self.path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let guard = device.lock().map_err(|_| "HID device lock poisoned".to_owned())?;
            operation(&guard).map_err(|error| error.to_string())
        })
        .await;

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(TransportError::Hid {
                address: path,
                message,
            }),
            Err(error) => Err(TransportError::Hid {
                address: path,
                message: error.to_string(),
            }),
        }
    }
}

#[async_trait]
impl HidPort for HidApiPort {
    fn path(&self) -> &str {
        &self.path
    }

    async fn write_report(&self, report: &[u8; HID_REPORT_LEN]) -> Result<(), TransportError> {
        let report = *report;
        self.with_device(move |device| device.write(&report).map(|_| ()))
            .await
    }

    async fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let report = self
            .with_device(move |device| {
                let mut buffer = [0_u8; HID_REPORT_LEN];
                let len = device.read_timeout(&mut buffer, millis)?;
                Ok(buffer[..len].to_vec())
            })
            .await?;

        if report.is_empty() {
            return Err(TransportError::TimedOut { timeout });
        }
        Ok(report)
    }
}
