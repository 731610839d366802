use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand};

use crate::cli::control::{BrightnessArgs, RestartArgs, ScreenArgs, VariableArgs};
use crate::cli::devices::InfoArgs;
use crate::cli::update::UpdateArgs;
use crate::cli::{LogLevel, OutputFormat};
use crate::error::{CliConfigError, FixtureError};
use crate::handlers::RetryPolicy;
use crate::hw::{FakeBackendConfig, FakeFixture};
use crate::registry::DiscoveryConfig;
use crate::utils::parse_number;

/// Command-line options for the Touch Encoder tool.
#[derive(Debug, Parser)]
#[command(
    name = "te",
    about = "Discover, query and command Touch Encoder devices over USB HID and CAN J1939."
)]
pub struct Args {
    /// Output format. Defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Log level for `te` events. Overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Skips USB HID enumeration.
    #[arg(long, global = true)]
    no_hid: bool,
    /// CAN interface to scan. Repeat for several; every host interface is scanned when omitted.
    #[arg(long = "can", global = true, value_name = "IFACE")]
    can_interfaces: Vec<String>,
    /// J1939 source address claimed by the tool (e.g. `0x11`).
    #[arg(long, global = true, value_parser = parse_address)]
    can_address: Option<u8>,
    /// Per-attempt reply deadline (e.g. `1500ms`, `2s`).
    #[arg(long, global = true, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// Resends allowed after the first attempt.
    #[arg(long, global = true)]
    retries: Option<u32>,
    /// How long CAN discovery listens for address claims.
    #[arg(long, global = true, value_parser = parse_duration)]
    scan_window: Option<Duration>,
    /// Uses simulated devices instead of real hardware.
    #[arg(long, global = true)]
    fake: bool,
    /// Simulated devices, e.g. `usb:1-1;can0:0xf2,fw=2.2.0;can0:0xf3,silent`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_devices: Option<FakeFixture>,
    /// Artificial fake enumeration delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use te::{Args, Command};
    ///
    /// let args = Args::new(Command::Ls);
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            output: None,
            log_level: None,
            no_hid: false,
            can_interfaces: Vec::new(),
            can_address: None,
            timeout: None,
            retries: None,
            scan_window: None,
            fake: false,
            fake_devices: None,
            fake_discovery_delay: None,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            fixture,
            discovery_delay,
        } = fake;

        self.fake = true;
        self.fake_devices = Some(fixture);
        self.fake_discovery_delay = Some(discovery_delay);
        self
    }

    /// Output format requested with `--output`, if any.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Discovery and retry settings assembled from the global flags.
    ///
    /// ```
    /// use clap::Parser;
    ///
    /// let args = te::Args::try_parse_from(["te", "--no-hid", "--can", "can1", "--retries", "4", "ls"])?;
    /// let options = args.run_options();
    /// assert_eq!(5, options.policy().max_attempts());
    /// # Ok::<(), clap::Error>(())
    /// ```
    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        let can_interfaces =
            (!self.can_interfaces.is_empty()).then(|| self.can_interfaces.clone());
        let discovery = DiscoveryConfig::builder()
            .hid(!self.no_hid)
            .maybe_can_interfaces(can_interfaces)
            .maybe_tool_address(self.can_address)
            .maybe_scan_window(self.scan_window)
            .build();
        let policy = RetryPolicy::builder()
            .maybe_retries(self.retries)
            .maybe_timeout(self.timeout)
            .build();

        RunOptions::builder()
            .discovery(discovery)
            .policy(policy)
            .maybe_log_level(self.log_level)
            .build()
    }

    /// Splits parsed CLI arguments into command and optional fake-client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_devices,
            fake_discovery_delay,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(fixture) = fake_devices else {
                return Err(CliConfigError::MissingFakeDevices.into());
            };
            Some(FakeArgs {
                fixture,
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Settings shared by every command: how to discover and how hard to retry.
#[derive(Debug, Clone, Default, Builder)]
pub struct RunOptions {
    #[builder(default)]
    discovery: DiscoveryConfig,
    #[builder(default)]
    policy: RetryPolicy,
    log_level: Option<LogLevel>,
}

impl RunOptions {
    #[must_use]
    pub fn discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    fixture: FakeFixture,
    #[builder(default)]
    discovery_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_backend_config(self) -> FakeBackendConfig {
        let Self {
            fixture,
            discovery_delay,
        } = self;

        FakeBackendConfig::builder()
            .fixture(fixture)
            .enumeration_delay(discovery_delay)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover devices on every configured transport and list them.
    Ls,
    /// Show versions, hardware id and project of one device.
    Info(InfoArgs),
    /// Restart one device, or every device the target selects.
    Restart(RestartArgs),
    /// Transfer a firmware, project or package update.
    Update(UpdateArgs),
    /// Read or change the active screen.
    Screen(ScreenArgs),
    /// Read or write a project variable.
    Variable(VariableArgs),
    /// Set the display brightness (0..=100).
    Brightness(BrightnessArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Ls => "ls",
            Self::Info(_args) => "info",
            Self::Restart(_args) => "restart",
            Self::Update(_args) => "update",
            Self::Screen(_args) => "screen",
            Self::Variable(_args) => "variable",
            Self::Brightness(_args) => "brightness",
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

fn parse_address(value: &str) -> Result<u8, String> {
    let address = parse_number(value)
        .and_then(|number| u8::try_from(number).ok())
        .ok_or_else(|| format!("`{value}` is not a J1939 address"))?;
    if address >= 0xFE {
        return Err(format!("0x{address:02X} is reserved and cannot be claimed"));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn fake_mode_requires_device_fixture() {
        let result = Args::try_parse_from(["te", "--fake", "ls"]);

        let error = result.expect_err("missing --fake-devices should fail argument parsing");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_devices_require_fake_mode() {
        let result = Args::try_parse_from(["te", "--fake-devices", "usb:1-1", "ls"]);

        let error = result.expect_err("--fake-devices should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn invalid_fixture_fails_parsing() {
        let result = Args::try_parse_from(["te", "--fake", "--fake-devices", "bogus", "ls"]);

        let error = result.expect_err("malformed fixture should fail argument parsing");
        assert_eq!(ErrorKind::ValueValidation, error.kind());
    }

    #[test]
    fn fake_mode_builds_fake_settings() {
        let cli = Args::try_parse_from([
            "te",
            "--fake",
            "--fake-devices",
            "usb:1-1;can0:0xf2",
            "ls",
        ])
        .expect("valid fake arguments should parse");

        let (command, fake_args) = cli
            .into_command_and_fake_args()
            .expect("valid fake arguments should resolve fake settings");
        assert_matches!(command, Command::Ls);
        assert_matches!(fake_args, Some(_));
    }

    #[test]
    fn global_flags_shape_run_options() {
        let cli = Args::try_parse_from([
            "te",
            "--no-hid",
            "--can",
            "can0",
            "--can",
            "can1",
            "--timeout",
            "250ms",
            "--retries",
            "0",
            "ls",
        ])
        .expect("flags should parse");

        let options = cli.run_options();
        assert_eq!(1, options.policy().max_attempts());
        assert_eq!(Duration::from_millis(250), options.policy().timeout());
        assert!(!options.discovery().hid());
        assert_eq!(
            Some(&["can0".to_owned(), "can1".to_owned()][..]),
            options.discovery().can_interfaces()
        );
        assert_eq!(crate::hw::DEFAULT_TOOL_ADDRESS, options.discovery().tool_address());
    }

    #[rstest]
    #[case::hex("0x11", Ok(0x11))]
    #[case::decimal("17", Ok(0x11))]
    #[case::null_address("0xFE", Err(()))]
    #[case::global("255", Err(()))]
    #[case::garbage("zz", Err(()))]
    fn parses_tool_address(#[case] input: &str, #[case] expected: Result<u8, ()>) {
        assert_eq!(expected, parse_address(input).map_err(|_error| ()));
    }
}
