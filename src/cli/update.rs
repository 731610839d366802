use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, ValueEnum};
use tracing::{debug, instrument, warn};

use crate::cli::{OutputFormat, RunOptions, TargetArg};
use crate::error::{CliConfigError, ValidationError};
use crate::handlers::{
    CommandSession, ComponentStatus, PayloadKind, Response, TargetFilter, UpdateEvent,
    UpdateOptions, UpdatePayload,
};
use crate::registry::{DeviceHandle, Registry};
use crate::terminal::TerminalClient;

use super::devices::{discover, select};
use super::output::{CommandRecord, write_records};
use super::ui::Painter;

/// Flash region selected on the command line.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Package,
    Firmware,
    Project,
}

impl From<KindArg> for PayloadKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Package => Self::Package,
            KindArg::Firmware => Self::Firmware,
            KindArg::Project => Self::Project,
        }
    }
}

/// Arguments for the `update` command.
#[derive(Debug, Args)]
pub struct UpdateArgs {
    /// Update file: `.tepkg` package, `.bin` firmware or `.zip` project.
    file: PathBuf,
    /// Device index. Every device the target selects is updated when omitted.
    index: Option<usize>,
    /// Payload kind. Inferred from the file extension when omitted.
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    /// Transports the update reaches.
    #[arg(long, value_enum, default_value_t)]
    target: TargetArg,
    /// Leaves the device running the old image until its next restart.
    #[arg(long)]
    no_restart: bool,
    /// How long the device may take to apply the payload (e.g. `30s`).
    #[arg(long, value_parser = parse_duration)]
    completion_timeout: Option<Duration>,
}

impl UpdateArgs {
    /// Creates update arguments for `file`.
    ///
    /// ```
    /// use te::UpdateArgs;
    ///
    /// let args = UpdateArgs::new("firmware-2.2.0.bin", Some(0));
    /// assert_eq!(std::path::Path::new("firmware-2.2.0.bin"), args.file());
    /// ```
    #[must_use]
    pub fn new(file: impl Into<PathBuf>, index: Option<usize>) -> Self {
        Self {
            file: file.into(),
            index,
            kind: None,
            target: TargetArg::All,
            no_restart: false,
            completion_timeout: None,
        }
    }

    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    fn options(&self) -> UpdateOptions {
        UpdateOptions::builder()
            .restart_after(!self.no_restart)
            .maybe_completion_timeout(self.completion_timeout)
            .build()
    }

    fn payload_kind(&self) -> Result<PayloadKind, ValidationError> {
        if let Some(kind) = self.kind {
            return Ok(kind.into());
        }
        let name = self
            .file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        PayloadKind::from_file_name(&name).ok_or(ValidationError::UnknownPayloadKind { name })
    }

    fn load_payload(&self) -> Result<UpdatePayload> {
        let kind = self.payload_kind()?;
        let bytes = std::fs::read(&self.file).map_err(|source| CliConfigError::ReadPayload {
            path: self.file.display().to_string(),
            source,
        })?;
        Ok(UpdatePayload::new(kind, bytes)?)
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

/// Executes the `update` command.
#[instrument(skip(registry, options, out, terminal_client), level = "info", fields(?output_format))]
pub(crate) async fn run<W>(
    registry: Arc<Registry>,
    options: &RunOptions,
    args: &UpdateArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let payload = args.load_payload()?;
    let devices = discover(&registry, options).await?;
    let session = CommandSession::with_policy(registry, options.policy());
    let target = TargetFilter::from(args.target);
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let mut write_error: Option<io::Error> = None;

    let mut on_event = |handle: &DeviceHandle, event: &UpdateEvent| {
        debug!(device = %handle, ?event, "update event");
        if output_format != OutputFormat::Pretty || write_error.is_some() {
            return;
        }
        let line = match event {
            UpdateEvent::Retransmit { offset } => Some(format!(
                "{handle}: {}",
                painter.warning(format!("resending chunk at offset {offset}"))
            )),
            UpdateEvent::Component {
                component,
                status: ComponentStatus::End,
                ..
            } => Some(format!("{handle}: {component} {}", painter.success("applied"))),
            _ => None,
        };
        if let Some(line) = line
            && let Err(error) = writeln!(out, "{line}")
        {
            write_error = Some(error);
        }
    };

    let records = match args.index {
        Some(index) => {
            let handle = select(&devices, index)?.handle.clone();
            let transfer = session
                .begin_update(&handle, payload, target, args.options())
                .await?;
            let outcome = tokio::select! {
                outcome = transfer.run(|event| on_event(&handle, event)) => outcome,
                _ = tokio::signal::ctrl_c() => {
                    warn!(device = %handle, "update interrupted; restart it from the beginning");
                    anyhow::bail!("update of {handle} interrupted");
                }
            };
            vec![CommandRecord::new(handle, Ok::<_, crate::UpdateError>(Response::Update(outcome?)))]
        }
        None => session
            .update_all(target, &payload, args.options(), &mut on_event)
            .await
            .into_iter()
            .map(|(handle, result)| CommandRecord::new(handle, result.map(Response::Update)))
            .collect(),
    };

    if let Some(error) = write_error {
        return Err(error.into());
    }
    write_records(out, &records, terminal_client, output_format)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::package("bundle-2.2.0.tepkg", PayloadKind::Package)]
    #[case::firmware("fw.BIN", PayloadKind::Firmware)]
    #[case::project("demo.zip", PayloadKind::Project)]
    fn kind_is_inferred_from_extension(#[case] file: &str, #[case] expected: PayloadKind) {
        assert_eq!(Ok(expected), UpdateArgs::new(file, None).payload_kind());
    }

    #[test]
    fn explicit_kind_wins_over_extension() {
        let mut args = UpdateArgs::new("demo.zip", None);
        args.kind = Some(KindArg::Firmware);
        assert_eq!(Ok(PayloadKind::Firmware), args.payload_kind());
    }

    #[test]
    fn unknown_extension_needs_explicit_kind() {
        assert_matches!(
            UpdateArgs::new("notes.txt", None).payload_kind(),
            Err(ValidationError::UnknownPayloadKind { name }) if name == "notes.txt"
        );
    }

    #[test]
    fn missing_file_reports_path() {
        let error = UpdateArgs::new("/nonexistent/te-update.bin", None)
            .load_payload()
            .expect_err("missing file should fail");
        assert_matches!(
            error.downcast_ref::<CliConfigError>(),
            Some(CliConfigError::ReadPayload { path, .. }) if path == "/nonexistent/te-update.bin"
        );
    }

    #[test]
    fn no_restart_flag_shapes_options() {
        let mut args = UpdateArgs::new("fw.bin", Some(0));
        args.no_restart = true;
        assert!(!args.options().restart_after());
    }
}
