//! Output handler / aggregator (spec §4.9): the single place that
//! turns a run set's progress into the three persisted artifacts
//! (§6.5) -- a per-run-set result XML, an aligned-column text log, and
//! the end-of-benchmark statistics summary -- plus the in-memory state
//! machine driving them (`pending` -> `running` -> `done`). Grounded in
//! `benchmark.py`'s `OutputHandler` (periodic XML flush, aligned
//! console table) and this crate's own `terminal_table.rs` for the
//! column alignment.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    ctx,
    model::{Column, ResultCategory, Run},
    serde::date_and_time::DateTimeWithOffset,
    terminal_table::{TerminalTable, TerminalTableOpts},
};

/// Spec §4.9 "throttled to at most one every ~10s plus one final
/// flush".
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlColumnValue {
    #[serde(rename = "@title")]
    pub title: String,
    #[serde(rename = "@value")]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlRunResult {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "@category", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "@cputime", skip_serializing_if = "Option::is_none")]
    pub cputime: Option<String>,
    #[serde(rename = "@walltime", skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,
    #[serde(rename = "@host", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "column", default)]
    pub columns: Vec<XmlColumnValue>,
}

impl XmlRunResult {
    /// The `pending` state: a dummy entry with no measurements, as
    /// soon as a run is dequeued (spec §4.9 state machine).
    fn pending(run: &Run) -> Self {
        Self {
            name: run.identifier.clone(),
            status: None,
            category: None,
            cputime: None,
            walltime: None,
            host: None,
            columns: run
                .columns
                .iter()
                .map(|c| XmlColumnValue {
                    title: c.title.clone(),
                    value: String::new(),
                })
                .collect(),
        }
    }

    /// The `done` state: every field filled from the finished run.
    fn done(run: &Run) -> Self {
        Self {
            name: run.identifier.clone(),
            status: run.status.clone(),
            category: run.category.map(|c| c.to_string()),
            cputime: run.cpu_time_s.map(|t| format!("{t:.2}")),
            walltime: run.wall_time_s.map(|t| format!("{t:.2}")),
            host: run.host.clone(),
            columns: run
                .columns
                .iter()
                .map(|c| XmlColumnValue {
                    title: c.title.clone(),
                    value: c.value.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "result")]
pub struct XmlResultDocument {
    #[serde(rename = "@benchmarkname")]
    pub benchmark_name: String,
    #[serde(rename = "@date")]
    pub date: String,
    #[serde(rename = "@tool")]
    pub tool: String,
    #[serde(rename = "@version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "run", default)]
    pub runs: Vec<XmlRunResult>,
}

impl XmlResultDocument {
    pub fn to_xml_string(&self) -> Result<String> {
        quick_xml::se::to_string(self).map_err(|e| anyhow::anyhow!("serializing result XML: {e}"))
    }

    /// Reads back a result XML produced by [`OutputHandler`], for the
    /// table generator (spec §4.10) to merge across multiple runs.
    pub fn from_xml_str(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml).map_err(|e| anyhow::anyhow!("parsing result XML: {e}"))
    }
}

/// Category/status counters for the end-of-benchmark summary block
/// (spec §4.9: "total, correct-true, correct-false, wrong-true,
/// wrong-false, unknown").
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub total: u32,
    pub correct_true: u32,
    pub correct_false: u32,
    pub wrong_true: u32,
    pub wrong_false: u32,
    pub unknown: u32,
    pub error: u32,
    pub missing: u32,
}

impl Statistics {
    pub fn record(&mut self, run: &Run) {
        self.total += 1;
        let is_true_status = run.status.as_deref() == Some("true");
        match run.category {
            Some(ResultCategory::Correct) if is_true_status => self.correct_true += 1,
            Some(ResultCategory::Correct) => self.correct_false += 1,
            Some(ResultCategory::Wrong) if is_true_status => self.wrong_true += 1,
            Some(ResultCategory::Wrong) => self.wrong_false += 1,
            Some(ResultCategory::Unknown) => self.unknown += 1,
            Some(ResultCategory::Error) => self.error += 1,
            Some(ResultCategory::Missing) => self.missing += 1,
            None => {}
        }
    }

    pub fn summary_block(&self, table_generator_hint: &str) -> String {
        format!(
            "total: {}   correct (true): {}   correct (false): {}   wrong (true): {}   wrong (false): {}   unknown: {}   error: {}   missing: {}\n{table_generator_hint}",
            self.total,
            self.correct_true,
            self.correct_false,
            self.wrong_true,
            self.wrong_false,
            self.unknown,
            self.error,
            self.missing,
        )
    }
}

struct HandlerState {
    entries: Vec<XmlRunResult>,
    index_by_name: std::collections::HashMap<String, usize>,
    stats: Statistics,
    last_flush: Instant,
    table: TerminalTable<File>,
}

/// Owns one run set's worth of output artifacts end to end: XML
/// document, aligned text log, and running statistics. `&self`
/// methods take an internal mutex so the same handler can be shared
/// across worker threads (spec §5 "Output-file writes are serialized
/// under a single mutex").
pub struct OutputHandler {
    xml_path: PathBuf,
    benchmark_name: String,
    tool_name: String,
    tool_version: Option<String>,
    timestamp: DateTimeWithOffset,
    state: Mutex<HandlerState>,
}

impl OutputHandler {
    pub fn new(
        xml_path: PathBuf,
        text_path: &Path,
        benchmark_name: String,
        tool_name: String,
        tool_version: Option<String>,
        timestamp: DateTimeWithOffset,
        columns: &[Column],
        table_opts: TerminalTableOpts,
    ) -> Result<Self> {
        let mut titles = vec!["sourcefile".to_string(), "status".to_string(), "cputime".to_string(), "walltime".to_string()];
        titles.extend(columns.iter().map(|c| c.title.clone()));
        // One width per title except the last (TerminalTable's
        // convention): base widths for sourcefile/status/cputime/
        // walltime, then a fixed width per user column, dropping
        // whichever ends up last.
        let widths = vec![50usize, 14, 10, 10]
            .into_iter()
            .chain(std::iter::repeat(14).take(columns.len()))
            .take(titles.len() - 1)
            .collect::<Vec<_>>();

        let file = File::create(text_path).map_err(ctx!("creating text log {text_path:?}"))?;
        let table = TerminalTable::start(&widths, &titles, table_opts, file)
            .with_context(|| format!("starting text log table at {text_path:?}"))?;

        Ok(Self {
            xml_path,
            benchmark_name,
            tool_name,
            tool_version,
            timestamp,
            state: Mutex::new(HandlerState {
                entries: Vec::new(),
                index_by_name: std::collections::HashMap::new(),
                stats: Statistics::default(),
                last_flush: Instant::now(),
                table,
            }),
        })
    }

    /// `pending` -> `running`: a run has been dequeued by a worker.
    /// Writes the "starting" console line and a placeholder XML entry.
    pub fn start_run(&self, run: &Run) -> Result<()> {
        let mut state = self.state.lock().expect("no poisoning");
        let index = state.entries.len();
        state.entries.push(XmlRunResult::pending(run));
        state.index_by_name.insert(run.identifier.clone(), index);
        let mut values = vec![run.identifier.as_str(), "starting", "", ""];
        values.extend(std::iter::repeat("").take(run.columns.len()));
        state.table.write_data_row(&values).context("writing starting row")?;
        Ok(())
    }

    /// `running` -> `done`: replaces the placeholder XML entry, writes
    /// the final aligned row, updates statistics, and flushes if the
    /// throttle interval has elapsed.
    pub fn finish_run(&self, run: &Run) -> Result<()> {
        let mut state = self.state.lock().expect("no poisoning");
        let done = XmlRunResult::done(run);

        let values: Vec<String> = {
            let mut v = vec![
                run.identifier.clone(),
                run.status.clone().unwrap_or_else(|| "unknown".to_string()),
                run.cpu_time_s.map(|t| format!("{t:.2}")).unwrap_or_default(),
                run.wall_time_s.map(|t| format!("{t:.2}")).unwrap_or_default(),
            ];
            v.extend(run.columns.iter().map(|c| c.value.clone().unwrap_or_default()));
            v
        };
        state.table.write_data_row(&values).context("writing done row")?;

        if let Some(&index) = state.index_by_name.get(&run.identifier) {
            state.entries[index] = done;
        } else {
            state.index_by_name.insert(run.identifier.clone(), state.entries.len());
            state.entries.push(done);
        }
        state.stats.record(run);

        let should_flush = state.last_flush.elapsed() >= FLUSH_INTERVAL;
        if should_flush {
            self.flush_xml_locked(&state)?;
        }
        Ok(())
    }

    fn flush_xml_locked(&self, state: &HandlerState) -> Result<()> {
        let doc = XmlResultDocument {
            benchmark_name: self.benchmark_name.clone(),
            date: self.timestamp.to_string(),
            tool: self.tool_name.clone(),
            version: self.tool_version.clone(),
            runs: state.entries.clone(),
        };
        let xml = doc.to_xml_string()?;
        std::fs::write(&self.xml_path, xml).map_err(ctx!("writing result XML {0:?}", self.xml_path))?;
        Ok(())
    }

    /// Forces one final flush and returns the end-of-benchmark
    /// statistics (spec §4.9: "prints a summary block... and a
    /// reminder of the table generator command").
    pub fn finish(self) -> Result<Statistics> {
        let mut state = self.state.lock().expect("no poisoning");
        state.last_flush = Instant::now();
        self.flush_xml_locked(&state)?;
        Ok(state.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Run;

    fn tmp_paths() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("bencheck-output-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        (dir.join("result.xml"), dir.join("result.txt"))
    }

    #[test]
    fn t_start_then_finish_updates_stats_and_flushes() {
        let (xml_path, text_path) = tmp_paths();
        let handler = OutputHandler::new(
            xml_path.clone(),
            &text_path,
            "bench".into(),
            "generic-exitcode".into(),
            None,
            DateTimeWithOffset::now(),
            &[],
            TerminalTableOpts::default(),
        )
        .unwrap();

        let mut run = Run::new("a.c", PathBuf::from("/tmp/a.log"), vec![]);
        handler.start_run(&run).unwrap();
        run.status = Some("true".to_string());
        run.category = Some(ResultCategory::Correct);
        run.cpu_time_s = Some(1.23);
        run.wall_time_s = Some(1.5);
        handler.finish_run(&run).unwrap();

        let stats = handler.finish().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.correct_true, 1);
        let xml = std::fs::read_to_string(&xml_path).unwrap();
        assert!(xml.contains("a.c"));
    }

    #[test]
    fn t_start_run_with_user_columns_matches_table_widths() {
        // Regression: start_run used to write a fixed 4-cell row
        // regardless of how many user columns were declared, which
        // TerminalTable::write_row rejects once widths.len() != 3.
        let (xml_path, text_path) = tmp_paths();
        let columns = vec![Column::new("memUsage", "memUsage", None)];
        let handler = OutputHandler::new(
            xml_path,
            &text_path,
            "bench".into(),
            "generic-exitcode".into(),
            None,
            DateTimeWithOffset::now(),
            &columns,
            TerminalTableOpts::default(),
        )
        .unwrap();

        let mut run = Run::new("a.c", PathBuf::from("/tmp/a.log"), vec![]);
        run.columns = columns.clone();
        handler.start_run(&run).unwrap();
        run.status = Some("true".to_string());
        run.category = Some(ResultCategory::Correct);
        run.columns[0].value = Some("1234".to_string());
        handler.finish_run(&run).unwrap();
        handler.finish().unwrap();
    }
}
