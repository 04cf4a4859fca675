//! Table data/rendering decoupling: a `TableViewRow` describes one
//! row's header and cell values without committing to a rendering
//! format; `TableView` is the dyn-compatible variant over a whole
//! table. Rendering (terminal, TSV, or an external HTML template)
//! consumes this data model, per spec §4.10 "Rendering uses external
//! templates; the generator only builds the data model and is
//! format-agnostic."

use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    None,
    DimensionLess,
    Count,
    ViewType(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Highlight {
    Spacer,
    Neutral,
    Red,
    Green,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnFormatting {
    Spacer,
    Number,
    String { width_chars: Option<f64> },
}

/// A single row's shape: header cells (title, unit, formatting) plus
/// a method producing the row's own cell values with a highlight per
/// cell.
pub trait TableViewRow {
    fn table_view_header() -> Vec<(Cow<'static, str>, Unit, ColumnFormatting)>;
    fn table_view_row(&self, out: &mut Vec<(Cow<'_, str>, Highlight)>);
}

/// Dyn-compatible view over an entire table, used where the concrete
/// row type cannot be named (e.g. the table generator's merged rows,
/// which mix rows from different tool plug-ins).
pub trait TableView {
    fn table_name(&self) -> Cow<'_, str>;
    fn table_view_header(&self) -> Vec<(Cow<'static, str>, Unit, ColumnFormatting)>;
    fn table_view_body(&self) -> Vec<Vec<(Cow<'_, str>, Highlight)>>;
}
