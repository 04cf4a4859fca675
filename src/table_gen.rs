//! The table generator (spec §4.10): merges one or more result XML
//! documents (produced by [`crate::output::OutputHandler`]) into a
//! single table keyed by source file, computes a difference table and
//! per-column statistics, and optionally counts regressions between
//! the last two inputs. Builds only the data model -- rendering to
//! HTML/CSV/terminal is a separate concern left to
//! [`crate::table_view::TableView`] consumers, per spec §4.10
//! "Rendering uses external templates; the generator only builds the
//! data model and is format-agnostic."
//!
//! Grounded in `table-generator.py`'s `mergeBenchmarkSets` (source-file
//! union, first-seen order) and `getStatsOfRunSet` (per-category
//! counters). `getStatsOfRunSet` (examples/original_source/scripts/
//! table-generator.py lines ~739-806) tracks three correct/wrong
//! variants each -- `correctTrue`/`correctFalse`/`correctProperty` and
//! `wrongTrue`/`wrongFalse`/`wrongProperty` -- where the "Property"
//! variant counts runs against a property file that names more than
//! one property kind at once (e.g. a combined memsafety property),
//! for which a true/false split is meaningless because the kinds can
//! disagree with each other. Since this crate's `ResultCategory` has
//! no such third bucket, `wrong_property`/`correct_property` here
//! count wrong/correct results whose property file yielded more than
//! one `PropertyKind` (see `classify::kinds_of_property_file_content`).

use std::collections::{HashMap, HashSet};

use crate::{
    classify::{calculate_score, kinds_of_property_file_content},
    model::ResultCategory,
    output::{XmlResultDocument, XmlRunResult},
    stats::{parse_numeric_with_unit, Stats},
    table_view::{ColumnFormatting, Highlight, TableView, Unit},
};

/// One source file's entries across every merged input, in the same
/// order as [`MergedTable::input_labels`]. A `None` slot means that
/// input's result XML had no entry for this source file (spec §4.10
/// "files missing from an input get a placeholder row, not a dropped
/// row").
#[derive(Debug, Clone)]
pub struct MergedRow {
    pub source_file: String,
    pub per_input: Vec<Option<XmlRunResult>>,
}

#[derive(Debug, Clone)]
pub struct MergedTable {
    pub input_labels: Vec<String>,
    pub rows: Vec<MergedRow>,
}

/// Merges `documents` by source file, preserving first-seen order
/// across all inputs (spec §4.10, grounded in `mergeBenchmarkSets`'s
/// `union` of source file lists).
pub fn merge_results(documents: &[XmlResultDocument]) -> MergedTable {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    for doc in documents {
        for run in &doc.runs {
            if seen.insert(run.name.clone()) {
                order.push(run.name.clone());
            }
        }
    }

    let rows = order
        .into_iter()
        .map(|name| {
            let per_input = documents
                .iter()
                .map(|doc| doc.runs.iter().find(|r| r.name == name).cloned())
                .collect();
            MergedRow {
                source_file: name,
                per_input,
            }
        })
        .collect();

    let input_labels = documents
        .iter()
        .map(|d| format!("{} ({})", d.tool, d.date))
        .collect();

    MergedTable {
        input_labels,
        rows,
    }
}

/// Rows where at least two distinct status values appear across
/// inputs (spec §4.10 "Difference tables": "every row whose status
/// differs between at least two of the selected inputs").
pub fn diff_rows(table: &MergedTable) -> Vec<&MergedRow> {
    table
        .rows
        .iter()
        .filter(|row| {
            let statuses: HashSet<&str> = row
                .per_input
                .iter()
                .filter_map(|r| r.as_ref().and_then(|r| r.status.as_deref()))
                .collect();
            statuses.len() >= 2
        })
        .collect()
}

fn category_of(entry: &XmlRunResult) -> Option<ResultCategory> {
    entry.category.as_deref().and_then(|c| c.parse().ok())
}

/// A result counts against the "property" buckets when its property
/// file names more than one [`crate::model::PropertyKind`] at once;
/// see the module doc comment.
fn is_multi_property(entry: &XmlRunResult, property_file_content: Option<&str>) -> bool {
    let _ = entry;
    property_file_content
        .map(|content| kinds_of_property_file_content(content).len() > 1)
        .unwrap_or(false)
}

/// Status-column statistics for one input (spec §4.10: "For the
/// status column: total, correct, wrong-true, wrong-false,
/// wrong-property, and score").
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusColumnStats {
    pub total: u32,
    pub correct: u32,
    pub correct_property: u32,
    pub wrong_true: u32,
    pub wrong_false: u32,
    pub wrong_property: u32,
    pub unknown: u32,
    pub error: u32,
    pub missing: u32,
    pub score: i64,
}

/// `property_file_contents` maps a row's source file name to the
/// property file text used for that task, when available -- the
/// merged table itself does not carry it, since it is rebuilt from
/// already-finished XML and not every caller has the property files
/// on disk.
pub fn status_column_stats(
    table: &MergedTable,
    input_index: usize,
    property_file_contents: &HashMap<String, String>,
) -> StatusColumnStats {
    let mut stats = StatusColumnStats::default();
    for row in &table.rows {
        let Some(Some(entry)) = row.per_input.get(input_index) else {
            continue;
        };
        let Some(category) = category_of(entry) else {
            continue;
        };
        stats.total += 1;
        let is_true = entry.status.as_deref() == Some("true");
        let multi_property = is_multi_property(
            entry,
            property_file_contents.get(&row.source_file).map(String::as_str),
        );

        match category {
            ResultCategory::Correct if multi_property => stats.correct_property += 1,
            ResultCategory::Correct => stats.correct += 1,
            ResultCategory::Wrong if multi_property => stats.wrong_property += 1,
            ResultCategory::Wrong if is_true => stats.wrong_true += 1,
            ResultCategory::Wrong => stats.wrong_false += 1,
            ResultCategory::Unknown => stats.unknown += 1,
            ResultCategory::Error => stats.error += 1,
            ResultCategory::Missing => stats.missing += 1,
        }

        if let Some(status) = &entry.status {
            stats.score += i64::from(calculate_score(category, status));
        }
    }
    stats
}

/// Sum/min/max/mean/median over one numeric column (cputime, walltime,
/// or a tool-defined column), partitioned by category into totals,
/// correct, wrong-true, and wrong-false subtotals (spec §4.10
/// "Numeric columns get the same partitioned breakdown").
#[derive(Debug, Clone, Default)]
pub struct NumericColumnStats {
    pub total: Option<Stats>,
    pub correct: Option<Stats>,
    pub wrong_true: Option<Stats>,
    pub wrong_false: Option<Stats>,
}

pub fn numeric_column_stats<'a>(
    table: &'a MergedTable,
    input_index: usize,
    extract: impl Fn(&'a XmlRunResult) -> Option<f64>,
) -> NumericColumnStats {
    let mut total = Vec::new();
    let mut correct = Vec::new();
    let mut wrong_true = Vec::new();
    let mut wrong_false = Vec::new();

    for row in &table.rows {
        let Some(Some(entry)) = row.per_input.get(input_index) else {
            continue;
        };
        let Some(value) = extract(entry) else {
            continue;
        };
        total.push(value);
        match category_of(entry) {
            Some(ResultCategory::Correct) => correct.push(value),
            Some(ResultCategory::Wrong) if entry.status.as_deref() == Some("true") => {
                wrong_true.push(value)
            }
            Some(ResultCategory::Wrong) => wrong_false.push(value),
            _ => {}
        }
    }

    NumericColumnStats {
        total: Stats::from_values(total).ok(),
        correct: Stats::from_values(correct).ok(),
        wrong_true: Stats::from_values(wrong_true).ok(),
        wrong_false: Stats::from_values(wrong_false).ok(),
    }
}

pub fn cputime_stats(table: &MergedTable, input_index: usize) -> NumericColumnStats {
    numeric_column_stats(table, input_index, |e| {
        e.cputime.as_deref().and_then(parse_numeric_with_unit)
    })
}

pub fn walltime_stats(table: &MergedTable, input_index: usize) -> NumericColumnStats {
    numeric_column_stats(table, input_index, |e| {
        e.walltime.as_deref().and_then(parse_numeric_with_unit)
    })
}

pub fn column_stats(table: &MergedTable, input_index: usize, column_title: &str) -> NumericColumnStats {
    numeric_column_stats(table, input_index, |e| {
        e.columns
            .iter()
            .find(|c| c.title == column_title)
            .and_then(|c| parse_numeric_with_unit(&c.value))
    })
}

/// Flags controlling which status changes between the last two inputs
/// count as a regression (spec §4.10 "Regression counting").
#[derive(Debug, Clone, Copy, Default)]
pub struct RegressionOptions {
    /// Don't count a row as regressed if it ever showed TIMEOUT in any
    /// earlier input too -- a run that flips between TIMEOUT and a
    /// wrong/unknown answer across inputs is "flapping", not a fresh
    /// regression.
    pub ignore_flapping_timeouts: bool,
    /// Don't count TIMEOUT <-> OUT OF MEMORY swaps as regressions:
    /// both are resource exhaustion, just against different limits.
    pub ignore_timeout_oom_pair: bool,
}

fn is_timeout_oom_pair(a: Option<&str>, b: Option<&str>) -> bool {
    matches!(
        (a, b),
        (Some("TIMEOUT"), Some("OUT OF MEMORY")) | (Some("OUT OF MEMORY"), Some("TIMEOUT"))
    )
}

/// Counts rows whose status changed between the second-to-last and
/// last inputs, where the new status is not `correct` -- i.e. the run
/// got worse, not just different (spec §4.10).
pub fn count_regressions(table: &MergedTable, options: RegressionOptions) -> u32 {
    if table.input_labels.len() < 2 {
        return 0;
    }
    let last = table.input_labels.len() - 1;
    let prev = last - 1;
    let mut count = 0;

    for row in &table.rows {
        let Some(Some(new_entry)) = row.per_input.get(last) else {
            continue;
        };
        let Some(Some(old_entry)) = row.per_input.get(prev) else {
            continue;
        };
        let new_status = new_entry.status.as_deref();
        let old_status = old_entry.status.as_deref();
        if new_status == old_status {
            continue;
        }
        if category_of(new_entry) == Some(ResultCategory::Correct) {
            continue;
        }
        if options.ignore_timeout_oom_pair && is_timeout_oom_pair(old_status, new_status) {
            continue;
        }
        if options.ignore_flapping_timeouts && new_status == Some("TIMEOUT") {
            let was_ever_timeout = row.per_input[..=prev]
                .iter()
                .any(|e| e.as_ref().and_then(|e| e.status.as_deref()) == Some("TIMEOUT"));
            if was_ever_timeout {
                continue;
            }
        }
        count += 1;
    }
    count
}

impl TableView for MergedTable {
    fn table_name(&self) -> std::borrow::Cow<'_, str> {
        "results".into()
    }

    fn table_view_header(&self) -> Vec<(std::borrow::Cow<'static, str>, Unit, ColumnFormatting)> {
        let mut header = vec![(
            "sourcefile".into(),
            Unit::None,
            ColumnFormatting::String { width_chars: None },
        )];
        for label in &self.input_labels {
            header.push((
                format!("{label} status").into(),
                Unit::None,
                ColumnFormatting::String { width_chars: None },
            ));
            header.push((format!("{label} cputime").into(), Unit::ViewType("s"), ColumnFormatting::Number));
            header.push((format!("{label} walltime").into(), Unit::ViewType("s"), ColumnFormatting::Number));
        }
        header
    }

    fn table_view_body(&self) -> Vec<Vec<(std::borrow::Cow<'_, str>, Highlight)>> {
        self.rows
            .iter()
            .map(|row| {
                let mut cells = vec![(row.source_file.as_str().into(), Highlight::Neutral)];
                for entry in &row.per_input {
                    match entry {
                        Some(entry) => {
                            let highlight = match category_of(entry) {
                                Some(ResultCategory::Correct) => Highlight::Green,
                                Some(ResultCategory::Wrong) => Highlight::Red,
                                _ => Highlight::Neutral,
                            };
                            cells.push((
                                entry.status.clone().unwrap_or_default().into(),
                                highlight,
                            ));
                            cells.push((entry.cputime.clone().unwrap_or_default().into(), Highlight::Neutral));
                            cells.push((entry.walltime.clone().unwrap_or_default().into(), Highlight::Neutral));
                        }
                        None => {
                            cells.push(("--".into(), Highlight::Spacer));
                            cells.push(("".into(), Highlight::Spacer));
                            cells.push(("".into(), Highlight::Spacer));
                        }
                    }
                }
                cells
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(tool: &str, date: &str, entries: Vec<(&str, &str, &str)>) -> XmlResultDocument {
        XmlResultDocument {
            benchmark_name: "b".into(),
            date: date.into(),
            tool: tool.into(),
            version: None,
            runs: entries
                .into_iter()
                .map(|(name, status, category)| XmlRunResult {
                    name: name.into(),
                    status: Some(status.into()),
                    category: Some(category.into()),
                    cputime: Some("1.00s".into()),
                    walltime: Some("1.50s".into()),
                    host: None,
                    columns: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn t_merge_preserves_first_seen_order_and_fills_placeholders() {
        let a = doc("t", "d1", vec![("a.c", "true", "correct"), ("b.c", "true", "correct")]);
        let b = doc("t", "d2", vec![("b.c", "false(reach)", "wrong"), ("c.c", "true", "correct")]);
        let merged = merge_results(&[a, b]);
        let names: Vec<_> = merged.rows.iter().map(|r| r.source_file.clone()).collect();
        assert_eq!(names, vec!["a.c", "b.c", "c.c"]);
        assert!(merged.rows[0].per_input[1].is_none());
        assert!(merged.rows[2].per_input[0].is_none());
    }

    #[test]
    fn t_diff_rows_only_include_differing_status() {
        let a = doc("t", "d1", vec![("a.c", "true", "correct"), ("b.c", "true", "correct")]);
        let b = doc("t", "d2", vec![("a.c", "true", "correct"), ("b.c", "false(reach)", "wrong")]);
        let merged = merge_results(&[a, b]);
        let diff = diff_rows(&merged);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].source_file, "b.c");
    }

    #[test]
    fn t_status_column_stats_counts_correct_and_wrong() {
        let a = doc(
            "t",
            "d1",
            vec![
                ("a.c", "true", "correct"),
                ("b.c", "false(reach)", "wrong"),
                ("c.c", "true", "wrong"),
            ],
        );
        let merged = merge_results(&[a]);
        let stats = status_column_stats(&merged, 0, &HashMap::new());
        assert_eq!(stats.total, 3);
        assert_eq!(stats.correct, 1);
        assert_eq!(stats.wrong_false, 1);
        assert_eq!(stats.wrong_true, 1);
    }

    #[test]
    fn t_cputime_stats_partitions_by_category() {
        let a = doc("t", "d1", vec![("a.c", "true", "correct"), ("b.c", "false(reach)", "wrong")]);
        let merged = merge_results(&[a]);
        let stats = cputime_stats(&merged, 0);
        assert_eq!(stats.total.unwrap().count, 2);
        assert_eq!(stats.correct.unwrap().count, 1);
        assert_eq!(stats.wrong_false.unwrap().count, 1);
    }

    #[test]
    fn t_count_regressions_ignores_correct_and_timeout_oom_pair() {
        let a = doc("t", "d1", vec![("a.c", "TIMEOUT", "error"), ("b.c", "true", "correct")]);
        let b = doc(
            "t",
            "d2",
            vec![("a.c", "OUT OF MEMORY", "error"), ("b.c", "false(reach)", "wrong")],
        );
        let merged = merge_results(&[a, b]);

        let no_ignore = count_regressions(&merged, RegressionOptions::default());
        assert_eq!(no_ignore, 2);

        let ignore_pair = count_regressions(
            &merged,
            RegressionOptions {
                ignore_timeout_oom_pair: true,
                ..Default::default()
            },
        );
        assert_eq!(ignore_pair, 1);
    }
}
