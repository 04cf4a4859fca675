//! The table generator's CLI (spec §6.4, second surface): merges one
//! or more result XML files produced by `bencheck`, prints the merged
//! table plus a difference/regression summary to the terminal, and
//! optionally dumps a TSV copy to disk.

use std::{
    borrow::Cow,
    collections::HashMap,
    io::stdout,
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;

use bencheck::{
    ctx,
    model::ResultCategory,
    output::XmlResultDocument,
    table_gen::{
        count_regressions, cputime_stats, diff_rows, merge_results, status_column_stats, walltime_stats,
        MergedRow, MergedTable, RegressionOptions,
    },
    table_view::{ColumnFormatting, Highlight, TableView, Unit},
    terminal_table::{render_table_view, TerminalTableOpts},
};

const PROGRAM_NAME: &str = "bencheck-table";

#[derive(clap::Parser, Debug)]
#[clap(name = PROGRAM_NAME, version)]
struct Opts {
    /// Result XML files to merge (most recent last).
    #[clap(required = true)]
    result_files: Vec<PathBuf>,

    #[clap(flatten)]
    table_opts: TerminalTableOpts,

    /// Directory to write the merged table's TSV dump into; defaults
    /// to the current directory.
    #[clap(short = 'o', long = "outputpath")]
    output_path: Option<PathBuf>,

    /// Base name for the TSV dump file; defaults to "bencheck-table".
    #[clap(short = 'n', long)]
    name: Option<String>,

    /// Skips the difference/regression section.
    #[clap(long = "no-diff")]
    no_diff: bool,

    /// Only show rows whose most recent result is `correct`.
    #[clap(long = "correct-only")]
    correct_only: bool,

    /// Also shows each run's tool-defined columns (only meaningful
    /// with exactly one input file).
    #[clap(long = "all-columns")]
    all_columns: bool,

    /// Drops any input whose every run is `error`, instead of letting
    /// one broken benchmark invocation poison the whole comparison.
    #[clap(long = "ignore-erroneous-benchmarks")]
    ignore_erroneous_benchmarks: bool,

    /// Don't count a row as regressed on its first TIMEOUT if an
    /// earlier input already showed one (spec §4.10 regression
    /// counting).
    #[clap(long = "ignore-flapping-timeout-regressions")]
    ignore_flapping_timeout_regressions: bool,

    /// Writes the TSV dump even when also printing to the terminal.
    #[clap(long)]
    dump: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let mut documents = Vec::with_capacity(opts.result_files.len());
    for path in &opts.result_files {
        let xml = std::fs::read_to_string(path).map_err(ctx!("reading result file {path:?}"))?;
        let doc = XmlResultDocument::from_xml_str(&xml).with_context(|| format!("parsing result XML {path:?}"))?;
        if opts.ignore_erroneous_benchmarks && all_erroneous(&doc) {
            bencheck::info!("ignoring {path:?}: every run in it is `error`");
            continue;
        }
        documents.push(doc);
    }
    anyhow::ensure!(!documents.is_empty(), "no usable result files (after filtering)");

    let mut table = merge_results(&documents);
    if opts.correct_only {
        let last = table.input_labels.len().saturating_sub(1);
        table.rows.retain(|row| {
            row.per_input
                .get(last)
                .and_then(|e| e.as_ref())
                .and_then(|e| e.category.as_deref())
                .and_then(|c| c.parse::<ResultCategory>().ok())
                == Some(ResultCategory::Correct)
        });
    }

    let out = stdout();
    if opts.all_columns && documents.len() == 1 {
        let view = AllColumnsView(&table);
        render_table_view(&view, opts.table_opts.clone(), out)?;
    } else {
        render_table_view(&table, opts.table_opts.clone(), out)?;
    }

    if !opts.no_diff {
        print_diff_and_stats(&table, &opts);
    }

    if opts.dump {
        write_tsv_dump(&table, &opts)?;
    }

    Ok(())
}

fn all_erroneous(doc: &XmlResultDocument) -> bool {
    !doc.runs.is_empty() && doc.runs.iter().all(|r| r.category.as_deref() == Some("error"))
}

fn print_diff_and_stats(table: &MergedTable, opts: &Opts) {
    let diffs = diff_rows(table);
    println!("\n{} of {} rows differ between inputs:", diffs.len(), table.rows.len());
    for row in &diffs {
        println!("  {}", row.source_file);
    }

    for (index, label) in table.input_labels.iter().enumerate() {
        let stats = status_column_stats(table, index, &HashMap::new());
        println!(
            "\n{label}: total {} correct {} (+property {}) wrong-true {} wrong-false {} (+property {}) unknown {} error {} missing {} score {}",
            stats.total,
            stats.correct,
            stats.correct_property,
            stats.wrong_true,
            stats.wrong_false,
            stats.wrong_property,
            stats.unknown,
            stats.error,
            stats.missing,
            stats.score,
        );
        if let Some(cpu) = cputime_stats(table, index).total {
            println!("  cputime: {cpu}");
        }
        if let Some(wall) = walltime_stats(table, index).total {
            println!("  walltime: {wall}");
        }
    }

    let regressions = count_regressions(
        table,
        RegressionOptions {
            ignore_flapping_timeouts: opts.ignore_flapping_timeout_regressions,
            ignore_timeout_oom_pair: true,
        },
    );
    println!("\n{regressions} regression(s) between the last two inputs");
}

fn write_tsv_dump(table: &MergedTable, opts: &Opts) -> Result<()> {
    let dir = opts.output_path.clone().unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).map_err(ctx!("creating output directory {dir:?}"))?;
    let name = opts.name.clone().unwrap_or_else(|| PROGRAM_NAME.to_string());
    let path = dir.join(format!("{name}.tsv"));
    let file = std::fs::File::create(&path).map_err(ctx!("creating TSV dump {path:?}"))?;
    render_table_view(table, TerminalTableOpts::force_tsv(), file)?;
    println!("wrote {path:?}");
    Ok(())
}

/// Wraps a [`MergedTable`] to additionally expose each run's
/// tool-defined columns, for the single-input `--all-columns` case.
struct AllColumnsView<'a>(&'a MergedTable);

impl<'a> TableView for AllColumnsView<'a> {
    fn table_name(&self) -> Cow<'_, str> {
        self.0.table_name()
    }

    fn table_view_header(&self) -> Vec<(Cow<'static, str>, Unit, ColumnFormatting)> {
        let mut header = self.0.table_view_header();
        for title in column_titles(self.0) {
            header.push((title.into(), Unit::None, ColumnFormatting::String { width_chars: None }));
        }
        header
    }

    fn table_view_body(&self) -> Vec<Vec<(Cow<'_, str>, Highlight)>> {
        let titles = column_titles(self.0);
        self.0
            .rows
            .iter()
            .zip(self.0.table_view_body())
            .map(|(row, mut cells)| {
                for title in &titles {
                    cells.push((value_for_column(row, title).into(), Highlight::Neutral));
                }
                cells
            })
            .collect()
    }
}

fn column_titles(table: &MergedTable) -> Vec<String> {
    let mut titles = Vec::new();
    for row in &table.rows {
        for entry in row.per_input.iter().flatten() {
            for column in &entry.columns {
                if !titles.contains(&column.title) {
                    titles.push(column.title.clone());
                }
            }
        }
    }
    titles
}

fn value_for_column(row: &MergedRow, title: &str) -> String {
    row.per_input
        .iter()
        .flatten()
        .find_map(|entry| entry.columns.iter().find(|c| c.title == title).map(|c| c.value.clone()))
        .unwrap_or_default()
}
