use std::io;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing::instrument;

use crate::cli::{OutputFormat, RunOptions, TargetArg};
use crate::handlers::{
    Brightness, Command as DeviceCommand, CommandSession, ScreenId, TargetFilter, VariableId,
    VariableValue,
};
use crate::registry::Registry;
use crate::terminal::TerminalClient;

use super::devices::{discover, select};
use super::output::{CommandRecord, write_records};

/// Arguments for the `restart` command.
#[derive(Debug, Args)]
pub struct RestartArgs {
    /// Device index. Every device the target selects is restarted when omitted.
    index: Option<usize>,
    /// Restarts into the utility (bootloader) image. Authenticates first.
    #[arg(long)]
    utility: bool,
    /// Transports the restart reaches.
    #[arg(long, value_enum, default_value_t)]
    target: TargetArg,
}

impl RestartArgs {
    /// Creates restart arguments.
    ///
    /// ```
    /// use te::RestartArgs;
    ///
    /// let one = RestartArgs::new(Some(0), false);
    /// let all = RestartArgs::new(None, true);
    /// let _ = (one, all);
    /// ```
    #[must_use]
    pub fn new(index: Option<usize>, utility: bool) -> Self {
        Self {
            index,
            utility,
            target: TargetArg::All,
        }
    }
}

/// Arguments for the `screen` command.
#[derive(Debug, Args)]
pub struct ScreenArgs {
    /// Device index as listed by `te ls`.
    index: usize,
    #[command(subcommand)]
    action: ScreenAction,
}

impl ScreenArgs {
    #[must_use]
    pub fn new(index: usize, action: ScreenAction) -> Self {
        Self { index, action }
    }
}

/// Action performed by the `screen` command.
#[derive(Debug, Clone, Subcommand)]
pub enum ScreenAction {
    /// Print the active screen.
    Get,
    /// Switch to another screen.
    Set {
        /// Screen id from the loaded project.
        screen: u16,
    },
}

/// Arguments for the `variable` command.
#[derive(Debug, Args)]
pub struct VariableArgs {
    /// Device index as listed by `te ls`.
    index: usize,
    #[command(subcommand)]
    action: VariableAction,
}

impl VariableArgs {
    #[must_use]
    pub fn new(index: usize, action: VariableAction) -> Self {
        Self { index, action }
    }
}

/// Action performed by the `variable` command.
#[derive(Debug, Clone, Subcommand)]
pub enum VariableAction {
    /// Read a variable.
    Get {
        #[arg(long)]
        screen_id: u16,
        #[arg(long)]
        variable_id: u16,
    },
    /// Write a variable. Exactly one of `--int` and `--string` is required.
    Set {
        #[arg(long)]
        screen_id: u16,
        #[arg(long)]
        variable_id: u16,
        #[arg(long, allow_negative_numbers = true)]
        int: Option<i32>,
        #[arg(long)]
        string: Option<String>,
    },
}

/// Arguments for the `brightness` command.
#[derive(Debug, Args)]
pub struct BrightnessArgs {
    /// Device index as listed by `te ls`.
    index: usize,
    #[arg(value_parser = parse_brightness)]
    level: Brightness,
    /// Persists the level across restarts.
    #[arg(long)]
    store: bool,
}

impl BrightnessArgs {
    /// Creates brightness-control arguments.
    ///
    /// # Errors
    ///
    /// Returns an error when `level` is outside `0..=100`.
    ///
    /// ```
    /// use te::BrightnessArgs;
    ///
    /// let args = BrightnessArgs::new(0, 75, false)?;
    /// assert_eq!(75, args.level());
    /// assert!(BrightnessArgs::new(0, 101, false).is_err());
    /// # Ok::<(), te::ValidationError>(())
    /// ```
    pub fn new(index: usize, level: u8, store: bool) -> Result<Self, crate::ValidationError> {
        Ok(Self {
            index,
            level: Brightness::new(level)?,
            store,
        })
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.level.value()
    }
}

fn parse_brightness(value: &str) -> Result<Brightness, String> {
    let parsed = value.parse::<u8>().map_err(|error| error.to_string())?;
    Brightness::new(parsed).map_err(|error| error.to_string())
}

impl ScreenAction {
    fn to_command(&self) -> DeviceCommand {
        match self {
            Self::Get => DeviceCommand::ScreenGet,
            Self::Set { screen } => DeviceCommand::ScreenSet {
                screen: ScreenId::from(*screen),
            },
        }
    }
}

impl VariableAction {
    fn to_command(&self) -> Result<DeviceCommand, crate::ValidationError> {
        match self {
            Self::Get {
                screen_id,
                variable_id,
            } => Ok(DeviceCommand::VariableGet {
                screen: ScreenId::from(*screen_id),
                variable: VariableId::from(*variable_id),
            }),
            Self::Set {
                screen_id,
                variable_id,
                int,
                string,
            } => Ok(DeviceCommand::VariableSet {
                screen: ScreenId::from(*screen_id),
                variable: VariableId::from(*variable_id),
                value: VariableValue::from_parts(*int, string.clone())?,
            }),
        }
    }
}

/// Executes `restart`, on one device or as a fan-out.
#[instrument(skip(registry, options, out, terminal_client), level = "info", fields(?output_format))]
pub(crate) async fn run_restart<W>(
    registry: Arc<Registry>,
    options: &RunOptions,
    args: &RestartArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let devices = discover(&registry, options).await?;
    let session = CommandSession::with_policy(registry, options.policy());
    let target = TargetFilter::from(args.target);

    let records = match args.index {
        Some(index) => {
            let handle = select(&devices, index)?.handle.clone();
            let response = session
                .execute(
                    &handle,
                    DeviceCommand::Restart {
                        target,
                        utility: args.utility,
                    },
                )
                .await?;
            vec![CommandRecord::new::<crate::TeError>(handle, Ok(response))]
        }
        None => session
            .restart_all(target, args.utility)
            .await
            .into_iter()
            .map(|(handle, result)| {
                CommandRecord::new(handle, result.map(crate::handlers::Response::Status))
            })
            .collect(),
    };

    write_records(out, &records, terminal_client, output_format)
}

/// Executes one single-exchange command against the device at `index`.
#[instrument(skip(registry, options, out, terminal_client), level = "info", fields(command = command.name()))]
async fn run_single<W>(
    registry: Arc<Registry>,
    options: &RunOptions,
    index: usize,
    command: DeviceCommand,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let devices = discover(&registry, options).await?;
    let handle = select(&devices, index)?.handle.clone();
    let session = CommandSession::with_policy(registry, options.policy());
    let response = session.execute(&handle, command).await?;
    let records = [CommandRecord::new::<crate::TeError>(handle, Ok(response))];

    write_records(out, &records, terminal_client, output_format)
}

/// Executes the `screen` command.
pub(crate) async fn run_screen<W>(
    registry: Arc<Registry>,
    options: &RunOptions,
    args: &ScreenArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let command = args.action.to_command();
    run_single(registry, options, args.index, command, out, terminal_client, output_format).await
}

/// Executes the `variable` command.
pub(crate) async fn run_variable<W>(
    registry: Arc<Registry>,
    options: &RunOptions,
    args: &VariableArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let command = args.action.to_command()?;
    run_single(registry, options, args.index, command, out, terminal_client, output_format).await
}

/// Executes the `brightness` command.
pub(crate) async fn run_brightness<W>(
    registry: Arc<Registry>,
    options: &RunOptions,
    args: &BrightnessArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let command = DeviceCommand::BrightnessSet {
        level: args.level,
        store: args.store,
    };
    run_single(registry, options, args.index, command, out, terminal_client, output_format).await
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ValidationError;

    #[test]
    fn variable_set_needs_exactly_one_value() {
        let neither = VariableAction::Set {
            screen_id: 2,
            variable_id: 239,
            int: None,
            string: None,
        };
        assert_eq!(
            Err(ValidationError::MissingVariableValue),
            neither.to_command()
        );

        let both = VariableAction::Set {
            screen_id: 2,
            variable_id: 239,
            int: Some(20),
            string: Some("twenty".into()),
        };
        assert_eq!(
            Err(ValidationError::ConflictingVariableValue),
            both.to_command()
        );
    }

    #[test]
    fn screen_set_maps_to_device_command() {
        let command = ScreenAction::Set { screen: 4 }.to_command();
        assert_matches!(command, DeviceCommand::ScreenSet { screen } if screen == ScreenId::from(4));
    }
}
