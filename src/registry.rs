use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bon::Builder;
use serde::Serialize;
use serde_with::SerializeDisplay;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{Span, debug, info, instrument, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{DiscoveryError, SessionError, TransportError};
use crate::handlers::{ProjectInfo, RetryPolicy, TargetFilter, VersionReport};
use crate::hw::{
    CanConfig, DEFAULT_SCAN_WINDOW, DEFAULT_TOOL_ADDRESS, HardwareClient, HidLink, J1939Link,
    Transport, TransportAddress,
};
use crate::protocol::{HardwareId, TransportKind};

/// A device found by one discovery run.
///
/// Handles from an earlier run are rejected with [`SessionError::StaleHandle`].
#[derive(Debug, Clone, Eq, PartialEq, Hash, SerializeDisplay)]
pub struct DeviceHandle {
    generation: u64,
    index: usize,
    address: TransportAddress,
}

impl DeviceHandle {
    /// Position in the discovery result.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.address.kind()
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index, self.address)
    }
}

/// What a device reports about itself.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct DeviceIdentity {
    pub hardware_id: HardwareId,
    pub versions: VersionReport,
    pub project_info: ProjectInfo,
}

/// One discovery result.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    pub handle: DeviceHandle,
    pub identity: DeviceIdentity,
}

/// Which transports discovery opens and how long it listens.
#[derive(Debug, Clone, Builder)]
pub struct DiscoveryConfig {
    /// Enumerate USB HID devices.
    #[builder(default = true)]
    hid: bool,
    /// CAN interfaces to scan. Every interface the host lists when unset.
    can_interfaces: Option<Vec<String>>,
    #[builder(default = DEFAULT_TOOL_ADDRESS)]
    tool_address: u8,
    #[builder(default = DEFAULT_SCAN_WINDOW)]
    scan_window: Duration,
    #[builder(default = RetryPolicy::identity())]
    identity_policy: RetryPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub fn hid(&self) -> bool {
        self.hid
    }

    #[must_use]
    pub fn can_interfaces(&self) -> Option<&[String]> {
        self.can_interfaces.as_deref()
    }

    #[must_use]
    pub fn tool_address(&self) -> u8 {
        self.tool_address
    }

    #[must_use]
    pub fn scan_window(&self) -> Duration {
        self.scan_window
    }
}

/// A registered device: its link, its single-flight lock and its cached identity.
#[derive(Debug)]
pub(crate) struct DeviceEntry {
    handle: DeviceHandle,
    transport: Transport,
    flight: Arc<Mutex<()>>,
    identity: RwLock<DeviceIdentity>,
    stale: AtomicBool,
}

impl DeviceEntry {
    fn new(handle: DeviceHandle, transport: Transport, identity: DeviceIdentity) -> Self {
        Self {
            handle,
            transport,
            flight: Arc::new(Mutex::new(())),
            identity: RwLock::new(identity),
            stale: AtomicBool::new(false),
        }
    }

    pub(crate) fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn label(&self) -> String {
        self.handle.to_string()
    }

    /// Waits until no other operation runs against this device.
    pub(crate) async fn begin(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.flight).lock_owned().await
    }

    pub(crate) async fn identity(&self) -> DeviceIdentity {
        *self.identity.read().await
    }

    pub(crate) async fn set_identity(&self, identity: DeviceIdentity) {
        *self.identity.write().await = identity;
        self.stale.store(false, Ordering::Release);
    }

    /// Marks the cached identity as outdated, e.g. after a restart.
    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    generation: u64,
    entries: Vec<Arc<DeviceEntry>>,
}

/// Discovers devices across every configured transport and hands out handles.
pub struct Registry {
    hardware: Box<dyn HardwareClient>,
    state: RwLock<RegistryState>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    #[must_use]
    pub fn new(hardware: Box<dyn HardwareClient>) -> Self {
        Self {
            hardware,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Finds every responding Touch Encoder, ordered by transport kind then address.
    ///
    /// Invalidates all handles from earlier runs. Addresses that do not answer
    /// the identity query are left out.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoTransportAvailable`] when not a single
    /// transport could be opened.
    #[instrument(skip(self, config), level = "info", fields(generation))]
    pub async fn discover(
        &self,
        config: &DiscoveryConfig,
    ) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let mut state = self.state.write().await;
        state.generation += 1;
        let generation = state.generation;
        Span::current().record("generation", generation);
        Span::current().pb_set_message("Discovering Touch Encoders");
        for entry in state.entries.drain(..) {
            if let Ok(entry) = Arc::try_unwrap(entry) {
                entry.transport.close();
            }
        }

        let mut attempted = 0;
        let mut opened = 0;
        let mut last_error = None;
        let mut candidates: Vec<(TransportAddress, Transport)> = Vec::new();

        if config.hid {
            attempted += 1;
            match self.open_hid_transports().await {
                Ok(found) => {
                    opened += 1;
                    candidates.extend(found);
                }
                Err(error) => {
                    warn!(%error, "HID transport unavailable");
                    last_error = Some(error);
                }
            }
        }

        let interfaces = match &config.can_interfaces {
            Some(interfaces) => interfaces.clone(),
            None => self.hardware.list_can_interfaces().await,
        };
        for interface in interfaces {
            attempted += 1;
            match self.open_can_transports(&interface, config).await {
                Ok(found) => {
                    opened += 1;
                    candidates.extend(found);
                }
                Err(error) => {
                    warn!(%interface, %error, "CAN transport unavailable");
                    last_error = Some(error);
                }
            }
        }

        if opened == 0 {
            return Err(DiscoveryError::NoTransportAvailable {
                attempted,
                last: last_error,
            });
        }

        candidates.sort_by(|(left, _), (right, _)| left.cmp(right));
        let mut entries = Vec::with_capacity(candidates.len());
        for (address, transport) in candidates {
            let handle = DeviceHandle {
                generation,
                index: entries.len(),
                address,
            };
            let label = handle.to_string();
            match crate::handlers::query_identity(&transport, &label, &config.identity_policy).await
            {
                Ok(identity) => entries.push(Arc::new(DeviceEntry::new(handle, transport, identity))),
                Err(error) => {
                    debug!(address = %handle.address, %error, "dropping non-responding address");
                    transport.close();
                }
            }
        }

        info!(count = entries.len(), "discovery finished");
        state.entries = entries;
        Ok(snapshot(&state.entries).await)
    }

    async fn open_hid_transports(
        &self,
    ) -> Result<Vec<(TransportAddress, Transport)>, TransportError> {
        let mut found = Vec::new();
        for info in self.hardware.enumerate_hid().await? {
            match self.hardware.open_hid(info.path()).await {
                Ok(port) => found.push((
                    TransportAddress::Hid {
                        path: info.path().to_owned(),
                    },
                    Transport::Hid(HidLink::new(port)),
                )),
                Err(error) => debug!(path = info.path(), %error, "skipping HID device"),
            }
        }
        Ok(found)
    }

    async fn open_can_transports(
        &self,
        interface: &str,
        config: &DiscoveryConfig,
    ) -> Result<Vec<(TransportAddress, Transport)>, TransportError> {
        let bus = self.hardware.open_can(interface).await?;
        let can_config = CanConfig::builder()
            .interface(interface)
            .tool_address(config.tool_address)
            .build();
        let mut link = J1939Link::open(bus, &can_config).await?;
        let claims = link.scan(config.scan_window).await?;
        let shared = Arc::new(Mutex::new(link));

        Ok(claims
            .into_iter()
            .map(|claim| {
                (
                    TransportAddress::Can {
                        interface: interface.to_owned(),
                        address: claim.address,
                    },
                    Transport::Can {
                        link: Arc::clone(&shared),
                        address: claim.address,
                    },
                )
            })
            .collect())
    }

    /// Devices from the latest discovery run with their cached identities.
    pub async fn devices(&self) -> Vec<DiscoveredDevice> {
        snapshot(&self.state.read().await.entries).await
    }

    /// Handle at `index` in the latest discovery result.
    pub async fn handle(&self, index: usize) -> Option<DeviceHandle> {
        let state = self.state.read().await;
        state.entries.get(index).map(|entry| entry.handle.clone())
    }

    /// Handles of every registered device the filter selects, in discovery order.
    pub async fn handles(&self, filter: TargetFilter) -> Vec<DeviceHandle> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|entry| filter.includes(entry.handle.kind()))
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub(crate) async fn entry(&self, handle: &DeviceHandle) -> Result<Arc<DeviceEntry>, SessionError> {
        let state = self.state.read().await;
        state
            .entries
            .get(handle.index)
            .filter(|entry| handle.generation == state.generation && entry.handle == *handle)
            .cloned()
            .ok_or_else(|| SessionError::StaleHandle {
                device: handle.to_string(),
            })
    }
}

async fn snapshot(entries: &[Arc<DeviceEntry>]) -> Vec<DiscoveredDevice> {
    let mut devices = Vec::with_capacity(entries.len());
    for entry in entries {
        devices.push(DiscoveredDevice {
            handle: entry.handle.clone(),
            identity: entry.identity().await,
        });
    }
    devices
}
