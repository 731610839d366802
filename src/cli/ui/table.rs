use std::fmt::{self, Display, Formatter};

use tabled::builder::Builder;
use tabled::settings::Style;

use super::painter::Painter;

/// Rounded table with an optional heading line, rendered via `Display`.
#[derive(Debug)]
pub(crate) struct Table {
    title: Option<String>,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Creates an empty table with the given column headers.
    pub(crate) fn grid<H: Into<String>>(headers: impl IntoIterator<Item = H>) -> Self {
        Self {
            title: None,
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Creates a field/value table with muted field names.
    pub(crate) fn key_value<'a>(
        painter: &Painter,
        fields: impl IntoIterator<Item = (&'a str, String)>,
    ) -> Self {
        let mut table = Self::grid(["field", "value"]);
        for (field, value) in fields {
            table.push_row([painter.muted(field), value]);
        }
        table
    }

    pub(crate) fn push_row(&mut self, cells: impl IntoIterator<Item = String>) {
        self.rows.push(cells.into_iter().collect());
    }

    /// Writes `title` on its own line above the table.
    pub(crate) fn titled(mut self, title: String) -> Self {
        self.title = Some(title);
        self
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(title) = &self.title {
            writeln!(f, "{title}")?;
        }
        let mut builder = Builder::with_capacity(self.rows.len() + 1, self.headers.len());
        builder.push_record(self.headers.iter().map(String::as_str));
        for row in &self.rows {
            builder.push_record(row.iter().map(String::as_str));
        }
        let mut table = builder.build();
        table.with(Style::rounded());
        write!(f, "{table}")
    }
}
