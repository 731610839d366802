use std::fmt::{self, Display, Formatter};

use crate::handlers::{Response, UpdateReport};
use crate::registry::DeviceHandle;

use super::painter::Painter;
use super::table::Table;

/// Renders one device's command response on a single line, or a table for updates.
pub(crate) struct ResponseView<'a> {
    device: &'a DeviceHandle,
    response: &'a Response,
    painter: &'a Painter,
}

impl<'a> ResponseView<'a> {
    pub(crate) fn new(device: &'a DeviceHandle, response: &'a Response, painter: &'a Painter) -> Self {
        Self {
            device,
            response,
            painter,
        }
    }
}

impl Display for ResponseView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let device = self.painter.value(self.device.to_string());
        match self.response {
            Response::Status(status) => write!(f, "{device}: {}", self.painter.status(*status)),
            Response::Screen(screen) => write!(f, "{device}: screen {}", self.painter.value(screen.to_string())),
            Response::Variable {
                screen,
                variable,
                value,
            } => write!(
                f,
                "{device}: screen {screen} variable {variable} = {}",
                self.painter.value(value.to_string())
            ),
            Response::Identity(identity) => write!(
                f,
                "{device}: {} firmware {} project {}",
                identity.hardware_id, identity.versions.firmware, identity.project_info
            ),
            Response::Update(report) => {
                write!(f, "{}", UpdateReportView::new(report, self.painter))
            }
        }
    }
}

/// Renders the summary of a finished update.
pub(crate) struct UpdateReportView<'a> {
    report: &'a UpdateReport,
    painter: &'a Painter,
}

impl<'a> UpdateReportView<'a> {
    pub(crate) fn new(report: &'a UpdateReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for UpdateReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let report = self.report;
        let retransmissions = if report.retransmissions == 0 {
            self.painter.value("0")
        } else {
            self.painter.warning(report.retransmissions.to_string())
        };
        let table = Table::key_value(
            self.painter,
            [
                ("kind", self.painter.value(report.kind.to_string())),
                ("bytes", self.painter.value(report.total.to_string())),
                ("chunk_size", self.painter.value(report.chunk_size.to_string())),
                ("crc32", self.painter.value(format!("{:08x}", report.crc32))),
                ("status", self.painter.success(report.status.to_string())),
                ("retransmissions", retransmissions),
                ("restarted", self.painter.value(if report.restarted { "yes" } else { "no" })),
            ],
        )
        .titled(self.painter.heading(format!("Updated {}:", report.device)));

        write!(f, "{table}")
    }
}
