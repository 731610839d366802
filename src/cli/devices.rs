use std::io;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tracing::instrument;

use crate::cli::{OutputFormat, RunOptions};
use crate::error::CliConfigError;
use crate::hw::TransportAddress;
use crate::protocol::TransportKind;
use crate::registry::{DeviceIdentity, DiscoveredDevice, Registry};
use crate::terminal::TerminalClient;

use super::output::write_json;
use super::ui::{DeviceInfoView, DeviceListView, Painter};

/// Arguments for the `info` command.
#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Device index as listed by `te ls`.
    index: usize,
}

impl InfoArgs {
    /// Creates info arguments for the device at `index`.
    ///
    /// ```
    /// use te::InfoArgs;
    ///
    /// let args = InfoArgs::new(1);
    /// assert_eq!(1, args.index());
    /// ```
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// JSON shape of one discovered device.
#[derive(Serialize)]
struct DeviceRow<'a> {
    index: usize,
    address: &'a TransportAddress,
    transport: TransportKind,
    #[serde(flatten)]
    identity: &'a DeviceIdentity,
}

impl<'a> From<&'a DiscoveredDevice> for DeviceRow<'a> {
    fn from(device: &'a DiscoveredDevice) -> Self {
        Self {
            index: device.handle.index(),
            address: device.handle.address(),
            transport: device.handle.kind(),
            identity: &device.identity,
        }
    }
}

/// Runs discovery with the configured transports.
pub(crate) async fn discover(
    registry: &Registry,
    options: &RunOptions,
) -> Result<Vec<DiscoveredDevice>> {
    Ok(registry.discover(options.discovery()).await?)
}

/// Picks the device at `index`, failing with the number of devices found.
pub(crate) fn select(devices: &[DiscoveredDevice], index: usize) -> Result<&DiscoveredDevice> {
    if devices.is_empty() {
        return Err(CliConfigError::NoDevices.into());
    }
    devices.get(index).ok_or_else(|| {
        CliConfigError::NoSuchDevice {
            index,
            available: devices.len(),
        }
        .into()
    })
}

/// Executes the `ls` command.
#[instrument(skip_all, level = "info", fields(?output_format))]
pub(crate) async fn run_ls<W>(
    registry: &Registry,
    options: &RunOptions,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let devices = discover(registry, options).await?;

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", DeviceListView::new(&devices, &painter))?;
        }
        OutputFormat::Json => {
            let rows: Vec<DeviceRow<'_>> = devices.iter().map(DeviceRow::from).collect();
            write_json(out, &rows)?;
        }
    }

    Ok(())
}

/// Executes the `info` command.
#[instrument(skip(registry, options, out, terminal_client), level = "info", fields(index = args.index))]
pub(crate) async fn run_info<W>(
    registry: &Registry,
    options: &RunOptions,
    args: &InfoArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let devices = discover(registry, options).await?;
    let device = select(&devices, args.index)?;

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", DeviceInfoView::new(device, &painter))?;
        }
        OutputFormat::Json => write_json(out, &DeviceRow::from(device))?,
    }

    Ok(())
}
