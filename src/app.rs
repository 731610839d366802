use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing::instrument;

use crate::cli::{Command, FakeArgs, OutputFormat, RunOptions};
use crate::hw::{
    HardwareClient, fake_hardware_client as build_fake_hardware_client,
    real_hardware_client as build_real_hardware_client,
};
use crate::registry::Registry;
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Creates a hardware client backed by the host's HID devices and SocketCAN interfaces.
#[must_use]
pub fn real_hardware_client() -> Box<dyn HardwareClient> {
    build_real_hardware_client()
}

/// Creates a hardware client backed by simulated devices.
#[must_use]
pub fn fake_hardware_client(fake_args: FakeArgs) -> Box<dyn HardwareClient> {
    build_fake_hardware_client(fake_args.into_backend_config())
}

/// Runs the CLI command against the process terminal.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = te::Args::try_parse_from([
///     "te",
///     "--fake",
///     "--fake-devices",
///     "usb:1-1;can0:0xf2",
///     "ls",
/// ])?;
/// let options = args.run_options();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let hardware_client = match maybe_fake_args {
///     Some(fake_args) => te::fake_hardware_client(fake_args),
///     None => te::real_hardware_client(),
/// };
/// let mut out = Vec::new();
/// te::run(command, &options, &mut out, hardware_client, te::OutputFormat::Json).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, discovery or the device
/// command fails, or output writing fails.
pub async fn run<W>(
    command: Command,
    options: &RunOptions,
    out: &mut W,
    hardware_client: Box<dyn HardwareClient>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(
        command,
        options,
        out,
        &SystemTerminalClient,
        hardware_client,
        output_format,
    )
    .await
}

/// Runs the CLI command with injected clients.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl te::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = te::Args::try_parse_from([
///     "te",
///     "--log-level",
///     "debug",
///     "--fake",
///     "--fake-devices",
///     "can0:0xf2",
///     "brightness",
///     "0",
///     "80",
/// ])?;
/// let options = args.run_options();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let hardware_client = match maybe_fake_args {
///     Some(fake_args) => te::fake_hardware_client(fake_args),
///     None => te::real_hardware_client(),
/// };
/// let mut out = Vec::new();
/// te::run_with_clients(
///     command,
///     &options,
///     &mut out,
///     &FakeTerminal,
///     hardware_client,
///     te::OutputFormat::Pretty,
/// ).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, discovery or the device
/// command fails, or output writing fails.
#[instrument(
    skip(options, out, terminal_client, hardware_client),
    level = "info",
    fields(command = command.name(), log_level = ?options.log_level())
)]
pub async fn run_with_clients<W>(
    command: Command,
    options: &RunOptions,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    hardware_client: Box<dyn HardwareClient>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "te",
        terminal_client.stderr_is_terminal(),
        options.log_level().map(|level| level.as_level_filter()),
    )?;

    let registry = Arc::new(Registry::new(hardware_client));
    match command {
        Command::Ls => {
            crate::cli::devices::run_ls(&registry, options, out, terminal_client, output_format)
                .await
        }
        Command::Info(args) => {
            crate::cli::devices::run_info(
                &registry,
                options,
                &args,
                out,
                terminal_client,
                output_format,
            )
            .await
        }
        Command::Restart(args) => {
            crate::cli::control::run_restart(
                registry,
                options,
                &args,
                out,
                terminal_client,
                output_format,
            )
            .await
        }
        Command::Update(args) => {
            crate::cli::update::run(registry, options, &args, out, terminal_client, output_format)
                .await
        }
        Command::Screen(args) => {
            crate::cli::control::run_screen(
                registry,
                options,
                &args,
                out,
                terminal_client,
                output_format,
            )
            .await
        }
        Command::Variable(args) => {
            crate::cli::control::run_variable(
                registry,
                options,
                &args,
                out,
                terminal_client,
                output_format,
            )
            .await
        }
        Command::Brightness(args) => {
            crate::cli::control::run_brightness(
                registry,
                options,
                &args,
                out,
                terminal_client,
                output_format,
            )
            .await
        }
    }
}
