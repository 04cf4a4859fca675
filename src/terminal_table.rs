//! Prints to a terminal in nice human-readable format (with spaces
//! for padding, and ANSI sequences for formatting), as well as in TSV
//! format. Grounds the output handler's plain-text aligned-column log
//! (spec §4.9).
//!
//! Does not currently escape anything in the fields, just uses
//! `Display` and prints that directly. Thus is not safe if the type
//! can print tabs or newlines (or on the terminal even spaces could
//! make it ambiguous).

use std::{
    fmt::Display,
    io::{BufWriter, IsTerminal, Write},
};

use anyhow::{anyhow, bail, Result};
use itertools::Itertools;
use strum_macros::EnumString;
use yansi::{Color, Paint, Style};

use crate::table_view::{ColumnFormatting, Highlight, TableView};

#[derive(Debug, EnumString, PartialEq, Clone, Copy)]
#[strum(serialize_all = "kebab_case")]
pub enum ColorOpt {
    Auto,
    Always,
    Never,
}

impl Default for ColorOpt {
    fn default() -> Self {
        ColorOpt::Auto
    }
}

impl ColorOpt {
    pub fn want_color(self, detected_terminal: bool) -> bool {
        match self {
            ColorOpt::Auto => detected_terminal,
            ColorOpt::Always => true,
            ColorOpt::Never => false,
        }
    }
}

#[derive(Debug, clap::Args, Clone, Default)]
pub struct TerminalTableOpts {
    /// Whether to show the table as TSV (with '\t' as separator)
    /// instead of human-readable
    #[clap(long)]
    tsv: bool,

    /// Whether to use ANSI codes to format human-readable output on
    /// terminals (auto, always, never)
    #[clap(long, default_value = "auto")]
    color: ColorOpt,
}

impl TerminalTableOpts {
    /// For callers that need a TSV dump regardless of what the
    /// interactive rendering used (e.g. `--dump` alongside a
    /// colored terminal table).
    pub fn force_tsv() -> Self {
        Self {
            tsv: true,
            color: ColorOpt::Never,
        }
    }

    pub fn want_color(&self, detected_terminal: bool) -> bool {
        let Self { tsv, color } = self;
        if *tsv {
            false
        } else {
            color.want_color(detected_terminal)
        }
    }
}

struct TerminalTableSettings {
    widths: Vec<usize>,
    titles: Vec<String>,
    padding: String,
    is_terminal: bool,
}

/// Capable of streaming, which requires defining the column widths
/// beforehand. If a value is wider than the defined column width for
/// that value, a single space is still printed between the value and
/// the next. The last column does not need a width, and no padding is
/// printed.
pub struct TerminalTable<O: Write + IsTerminal> {
    pub opts: TerminalTableOpts,
    settings: TerminalTableSettings,
    out: BufWriter<O>,
}

impl<O: Write + IsTerminal> TerminalTable<O> {
    /// The length of `widths` must be one less than that of `titles`
    /// (the last column does not need a width). Appends a space to
    /// each title, to make sure italic text is not clipped on
    /// terminals. That will be fine as you'll want your widths to be
    /// at least 1 longer than the text itself, anyway.
    pub fn start<S: Display>(
        widths: &[usize],
        titles: &[S],
        opts: TerminalTableOpts,
        out: O,
    ) -> Result<Self> {
        let titles = titles.iter().map(|title| format!("{title} ")).collect();
        let max_width = widths.iter().max().copied().unwrap_or(0);
        let padding = " ".repeat(max_width);
        let is_terminal = out.is_terminal();
        let mut slf = Self {
            settings: TerminalTableSettings {
                widths: widths.to_owned(),
                titles,
                padding,
                is_terminal,
            },
            opts,
            out: BufWriter::new(out),
        };
        slf.write_title_row()?;
        Ok(slf)
    }

    // Not making this an instance method so that we can give mut vs
    // non-mut parts independently
    fn write_row<V: Display>(
        opts: &TerminalTableOpts,
        settings: &TerminalTableSettings,
        out: &mut BufWriter<O>,
        row: &[V],
        line_style: Option<&Style>,
    ) -> Result<()> {
        let lens = (settings.widths.len(), row.len());
        let (l1, l2) = lens;
        if l1
            != l2
                .checked_sub(1)
                .ok_or_else(|| anyhow!("need at least 1 column"))?
        {
            bail!("widths.len != data.len - 1: {lens:?}")
        }

        let mut is_first = true;
        for either_or_both in settings.widths.iter().zip_longest(row) {
            if opts.tsv && !is_first {
                out.write_all("\t".as_bytes())?;
            }

            let val = either_or_both
                .as_ref()
                .right()
                .expect("value there because row len checked above");
            let s = val.to_string();
            let s_len = s.len();
            {
                let s: String = if let Some(style) = line_style {
                    let s = s.paint(*style);
                    s.to_string()
                } else {
                    s
                };
                out.write_all(s.as_bytes())?;
            }

            if let Some(width) = either_or_both.left() {
                if !opts.tsv {
                    if *width > s_len {
                        let needed_padding = width - s_len;
                        let padding = &settings.padding[0..needed_padding];
                        out.write_all(padding.as_bytes())?;
                    } else {
                        // write out at least 1 space anyway
                        out.write_all(b" ")?;
                    }
                }
            }

            is_first = false;
        }
        out.write_all(&[b'\n'])?;
        Ok(())
    }

    pub fn write_title_row(&mut self) -> Result<()> {
        const STYLE: Style = Style::new().bold().italic();
        Self::write_row(
            &self.opts,
            &self.settings,
            &mut self.out,
            &self.settings.titles,
            if self.opts.want_color(self.settings.is_terminal) {
                Some(&STYLE)
            } else {
                None
            },
        )
    }

    pub fn write_data_row<V: Display>(&mut self, data: &[V]) -> Result<()> {
        Self::write_row(&self.opts, &self.settings, &mut self.out, data, None)
    }

    pub fn write_highlighted_row<V: Display>(
        &mut self,
        data: &[V],
        style: &Style,
    ) -> Result<()> {
        Self::write_row(&self.opts, &self.settings, &mut self.out, data, Some(style))
    }

    pub fn finish(self) -> Result<O> {
        self.out
            .into_inner()
            .map_err(|e| anyhow!("flushing the buffer: {}", e.error()))
    }
}

/// Renders any [`TableView`] to a [`TerminalTable`], the only place
/// that turns the table generator's format-agnostic data model (spec
/// §4.10) into actual bytes. A row is printed in red if any of its
/// cells carry [`Highlight::Red`] (at least one wrong result).
pub fn render_table_view<O: Write + IsTerminal>(
    view: &dyn TableView,
    opts: TerminalTableOpts,
    out: O,
) -> Result<O> {
    let header = view.table_view_header();
    anyhow::ensure!(!header.is_empty(), "table view has no columns");
    let titles: Vec<String> = header.iter().map(|(title, _, _)| title.to_string()).collect();
    let widths: Vec<usize> = header[..header.len() - 1]
        .iter()
        .map(|(title, _, formatting)| match formatting {
            ColumnFormatting::String {
                width_chars: Some(w),
            } => *w as usize,
            ColumnFormatting::Number => 12,
            _ => (title.len() + 2).max(10),
        })
        .collect();

    const RED: Style = Style::new().fg(Color::Red);
    let mut table = TerminalTable::start(&widths, &titles, opts, out)?;
    for row in view.table_view_body() {
        let has_red = row.iter().any(|(_, h)| *h == Highlight::Red);
        let values: Vec<String> = row.into_iter().map(|(v, _)| v.into_owned()).collect();
        if has_red {
            table.write_highlighted_row(&values, &RED)?;
        } else {
            table.write_data_row(&values)?;
        }
    }
    table.finish()
}
