//! The data model (spec §3): immutable data carriers for benchmarks,
//! run sets, runs, columns, and requirements. Runs are mutated exactly
//! once, by the executor, after construction.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::serde::date_and_time::DateTimeWithOffset;

/// Closed set `{correct, wrong, unknown, error, missing}` (spec §3
/// ResultCategory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResultCategory {
    Correct,
    Wrong,
    Unknown,
    Error,
    Missing,
}

/// Closed set of recognized property kinds, extensible (spec §3
/// PropertyKind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "kebab_case")]
pub enum PropertyKind {
    Reach,
    Termination,
    ValidDeref,
    ValidFree,
    ValidMemtrack,
}

/// A named, numeric or textual field extracted from a tool's output
/// (spec §3 Column / §4.3). `value` starts empty and is filled by the
/// tool plug-in's `addColumnValues` during post-processing of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub pattern: String,
    pub title: String,
    pub number_of_digits: Option<u8>,
    pub value: Option<String>,
}

impl Column {
    pub fn new(pattern: impl Into<String>, title: impl Into<String>, number_of_digits: Option<u8>) -> Self {
        Self {
            pattern: pattern.into(),
            title: title.into(),
            number_of_digits,
            value: None,
        }
    }
}

/// Machine-level prerequisites for remote dispatch (spec §3
/// Requirements).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements {
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u64>,
}

/// Resolved CPU/wall/memory/core limits for a benchmark or a single
/// run, after CLI overrides and the "-1 removes a limit" sentinel
/// have been applied (spec §3 invariant: if both hard and soft time
/// limits are set, hard >= soft; otherwise hard is used as soft).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub memlimit_mb: Option<u64>,
    pub hardtimelimit_s: Option<u64>,
    pub softtimelimit_s: Option<u64>,
    pub cpu_cores: Option<u32>,
}

impl Limits {
    /// Applies the §3 hard/soft invariant, returning a warning string
    /// if the soft limit had to be dropped.
    pub fn normalized(mut self) -> (Self, Option<String>) {
        let mut warning = None;
        match (self.hardtimelimit_s, self.softtimelimit_s) {
            (Some(hard), Some(soft)) if soft > hard => {
                warning = Some(format!(
                    "softtimelimit ({soft}s) >= hardtimelimit ({hard}s); dropping soft limit"
                ));
                self.softtimelimit_s = None;
            }
            (Some(hard), None) => {
                self.softtimelimit_s = Some(hard);
            }
            _ => {}
        }
        (self, warning)
    }
}

/// The unit of execution (spec §3 Run).
#[derive(Debug, Clone)]
pub struct Run {
    /// Primary source file, used for logging, result category,
    /// substitutions.
    pub identifier: String,
    /// Ordered: primary plus any `append`-tagged files.
    pub sourcefiles: Vec<PathBuf>,
    /// Fully resolved (all substitutions applied).
    pub options: Vec<String>,
    pub property_file: Option<PathBuf>,
    pub required_files: Vec<PathBuf>,
    pub log_file: PathBuf,
    pub columns: Vec<Column>,

    // Result slots, mutated exactly once by the executor.
    pub status: Option<String>,
    pub category: Option<ResultCategory>,
    pub cpu_time_s: Option<f64>,
    pub wall_time_s: Option<f64>,
    pub mem_usage_bytes: Option<u64>,
    pub host: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Run {
    pub fn new(identifier: impl Into<String>, log_file: PathBuf, columns: Vec<Column>) -> Self {
        Self {
            identifier: identifier.into(),
            sourcefiles: Vec::new(),
            options: Vec::new(),
            property_file: None,
            required_files: Vec::new(),
            log_file,
            columns,
            status: None,
            category: None,
            cpu_time_s: None,
            wall_time_s: None,
            mem_usage_bytes: None,
            host: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.category.is_some()
    }
}

/// A named, ordered group of runs sharing a `<sourcefiles>` tag (spec
/// §3 SourceFileSet).
#[derive(Debug, Clone, Default)]
pub struct SourceFileSet {
    pub name: Option<String>,
    pub sourcefiles: Vec<PathBuf>,
    pub options: Vec<String>,
    pub property_file: Option<PathBuf>,
    pub required_files: Vec<PathBuf>,
}

/// A benchmark subdivision selectable by name or index (spec §3
/// RunSet).
#[derive(Debug, Clone)]
pub struct RunSet {
    pub display_name: String,
    /// 1-based.
    pub index: u32,
    pub options: Vec<String>,
    pub property_files: Vec<PathBuf>,
    pub source_file_sets: Vec<SourceFileSet>,
    pub runs: Vec<Run>,
    pub log_folder: PathBuf,
}

impl RunSet {
    /// Invariant: within a run set, no two runs may share a log-file
    /// basename. Returns the duplicated basenames, if any (a warning,
    /// not a hard error).
    pub fn duplicate_log_basenames(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut dups = Vec::new();
        for run in &self.runs {
            if let Some(base) = run.log_file.file_name().and_then(|s| s.to_str()) {
                if !seen.insert(base.to_string()) {
                    dups.push(base.to_string());
                }
            }
        }
        dups
    }
}

/// One invocation unit (spec §3 Benchmark).
#[derive(Debug, Clone)]
pub struct Benchmark {
    pub name: String,
    pub timestamp: DateTimeWithOffset,
    pub output_base: PathBuf,
    pub tool_name: String,
    pub tool_version: Option<String>,
    pub tool_executable: Option<PathBuf>,
    pub limits: Limits,
    pub num_threads: u32,
    pub options: Vec<String>,
    pub property_files: Vec<PathBuf>,
    pub required_files: Vec<PathBuf>,
    pub columns: Vec<Column>,
    pub run_sets: Vec<RunSet>,
    pub requirements: Requirements,
}

impl Benchmark {
    /// Output base path plus the run instance, per spec §6.5:
    /// `<base>.<instance>/`.
    pub fn instance_dir(&self) -> PathBuf {
        let mut s = self.output_base.as_os_str().to_owned();
        s.push(".");
        s.push(self.timestamp.to_filename_safe_string());
        PathBuf::from(s)
    }

    pub fn add_required_file(&mut self, path: PathBuf) {
        if !self.required_files.contains(&path) {
            self.required_files.push(path);
        }
    }
}

pub fn source_file_basename(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_limits_soft_dropped_when_above_hard() {
        let (limits, warning) = Limits {
            hardtimelimit_s: Some(100),
            softtimelimit_s: Some(200),
            ..Default::default()
        }
        .normalized();
        assert_eq!(limits.softtimelimit_s, None);
        assert!(warning.is_some());
    }

    #[test]
    fn t_limits_hard_used_as_soft_when_soft_unset() {
        let (limits, warning) = Limits {
            hardtimelimit_s: Some(100),
            softtimelimit_s: None,
            ..Default::default()
        }
        .normalized();
        assert_eq!(limits.softtimelimit_s, Some(100));
        assert!(warning.is_none());
    }

    #[test]
    fn t_duplicate_log_basenames() {
        let mut rs = RunSet {
            display_name: "rs".into(),
            index: 1,
            options: vec![],
            property_files: vec![],
            source_file_sets: vec![],
            runs: vec![],
            log_folder: PathBuf::from("/tmp/logs"),
        };
        rs.runs.push(Run::new("a", PathBuf::from("/tmp/logs/a.log"), vec![]));
        rs.runs.push(Run::new("b", PathBuf::from("/tmp/logs/a.log"), vec![]));
        assert_eq!(rs.duplicate_log_basenames(), vec!["a.log".to_string()]);
    }
}
