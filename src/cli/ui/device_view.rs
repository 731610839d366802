use std::fmt::{self, Display, Formatter};

use crate::protocol::transport_metadata;
use crate::registry::{DeviceIdentity, DiscoveredDevice};

use super::painter::Painter;
use super::table::Table;

/// Renders a discovery result as one row per device.
pub(crate) struct DeviceListView<'a> {
    devices: &'a [DiscoveredDevice],
    painter: &'a Painter,
}

impl<'a> DeviceListView<'a> {
    pub(crate) fn new(devices: &'a [DiscoveredDevice], painter: &'a Painter) -> Self {
        Self { devices, painter }
    }
}

impl Display for DeviceListView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.devices.is_empty() {
            return write!(f, "{}", self.painter.warning("No Touch Encoders found."));
        }

        let mut table = Table::grid(["#", "address", "hardware", "firmware", "bootloader", "project"]);
        for device in self.devices {
            let versions = device.identity.versions;
            table.push_row([
                self.painter.value(device.handle.index().to_string()),
                self.painter.value(device.handle.address().to_string()),
                device.identity.hardware_id.to_string(),
                versions.firmware.to_string(),
                versions.bootloader.to_string(),
                project_version(&device.identity, self.painter),
            ]);
        }

        write!(f, "{table}")
    }
}

/// Renders everything known about one device.
pub(crate) struct DeviceInfoView<'a> {
    device: &'a DiscoveredDevice,
    painter: &'a Painter,
}

impl<'a> DeviceInfoView<'a> {
    pub(crate) fn new(device: &'a DiscoveredDevice, painter: &'a Painter) -> Self {
        Self { device, painter }
    }
}

impl Display for DeviceInfoView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let handle = &self.device.handle;
        let identity = &self.device.identity;
        let table = Table::key_value(
            self.painter,
            [
                ("address", self.painter.value(handle.address().to_string())),
                (
                    "transport",
                    self.painter.value(transport_metadata(handle.kind()).label()),
                ),
                ("hardware", self.painter.value(identity.hardware_id.to_string())),
                (
                    "firmware",
                    self.painter.value(identity.versions.firmware.to_string()),
                ),
                (
                    "bootloader",
                    self.painter.value(identity.versions.bootloader.to_string()),
                ),
                ("project", project_version(identity, self.painter)),
                (
                    "project_info",
                    self.painter.value(identity.project_info.to_string()),
                ),
            ],
        )
        .titled(self.painter.heading(format!("Device #{}:", handle.index())));

        write!(f, "{table}")
    }
}

fn project_version(identity: &DeviceIdentity, painter: &Painter) -> String {
    match identity.versions.project {
        Some(version) => painter.value(version.to_string()),
        None => painter.warning("<none>"),
    }
}
