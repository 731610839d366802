use std::io;

use anyhow::Result;
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::handlers::Response;
use crate::hw::TransportAddress;
use crate::registry::DeviceHandle;
use crate::terminal::TerminalClient;

use super::ui::{Painter, ResponseView};

/// Outcome of one command against one device, as written to stdout.
#[derive(Debug, Serialize)]
pub(crate) struct CommandRecord {
    index: usize,
    address: TransportAddress,
    #[serde(skip)]
    handle: DeviceHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Response>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CommandRecord {
    pub(crate) fn new<E: std::error::Error>(
        handle: DeviceHandle,
        outcome: Result<Response, E>,
    ) -> Self {
        let (response, error) = match outcome {
            Ok(response) => (Some(response), None),
            Err(error) => (None, Some(error.to_string())),
        };
        Self {
            index: handle.index(),
            address: handle.address().clone(),
            handle,
            response,
            error,
        }
    }

    pub(crate) fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Writes every record, then fails if any device failed.
pub(crate) fn write_records<W>(
    out: &mut W,
    records: &[CommandRecord],
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            for record in records {
                match (&record.response, &record.error) {
                    (Some(response), _) => {
                        writeln!(out, "{}", ResponseView::new(&record.handle, response, &painter))?;
                    }
                    (None, Some(error)) => writeln!(
                        out,
                        "{}: {}",
                        painter.value(record.handle.to_string()),
                        painter.failure(error)
                    )?,
                    (None, None) => {}
                }
            }
        }
        OutputFormat::Json => write_json(out, &records)?,
    }

    let failed = records.iter().filter(|record| record.is_failure()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} device(s) failed", records.len());
    }
    Ok(())
}

pub(crate) fn write_json(out: &mut impl io::Write, value: &impl Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
