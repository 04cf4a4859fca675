//! Variable substitution & file expansion (spec §4.2, variable table
//! in §6.2). A single pass replaces a fixed set of `${...}`
//! placeholders in every string drawn from the XML; textual
//! replacement, no recursion. Any surviving `${...}` after
//! substitution emits a warning but the string is kept verbatim.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::serde::date_and_time::DateTimeWithOffset;

/// Benchmark-scope substitution context, available for every string
/// in the XML (spec §6.2, the variables not requiring a source file
/// in scope).
#[derive(Debug, Clone)]
pub struct BenchmarkContext {
    pub benchmark_name: String,
    pub benchmark_date: DateTimeWithOffset,
    pub benchmark_instance: String,
    pub benchmark_path: PathBuf,
    pub benchmark_path_abs: PathBuf,
    pub benchmark_file: PathBuf,
    pub benchmark_file_abs: PathBuf,
    pub logfile_path: PathBuf,
    pub logfile_path_abs: PathBuf,
    pub rundefinition_name: String,
}

/// Additional variables available only once a concrete source file is
/// in scope (spec §6.2).
#[derive(Debug, Clone)]
pub struct SourceFileContext<'b> {
    pub benchmark: &'b BenchmarkContext,
    pub sourcefile_name: String,
    pub sourcefile_path: PathBuf,
    pub sourcefile_path_abs: PathBuf,
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

impl BenchmarkContext {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("${benchmark_name}", self.benchmark_name.clone()),
            ("${benchmark_date}", self.benchmark_date.to_string()),
            ("${benchmark_instance}", self.benchmark_instance.clone()),
            ("${benchmark_path}", path_str(&self.benchmark_path)),
            ("${benchmark_path_abs}", path_str(&self.benchmark_path_abs)),
            ("${benchmark_file}", path_str(&self.benchmark_file)),
            ("${benchmark_file_abs}", path_str(&self.benchmark_file_abs)),
            ("${logfile_path}", path_str(&self.logfile_path)),
            ("${logfile_path_abs}", path_str(&self.logfile_path_abs)),
            ("${rundefinition_name}", self.rundefinition_name.clone()),
            // legacy alias
            ("${test_name}", self.rundefinition_name.clone()),
        ]
    }
}

impl<'b> SourceFileContext<'b> {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut v = self.benchmark.pairs();
        v.push(("${sourcefile_name}", self.sourcefile_name.clone()));
        v.push(("${sourcefile_path}", path_str(&self.sourcefile_path)));
        v.push(("${sourcefile_path_abs}", path_str(&self.sourcefile_path_abs)));
        v
    }
}

/// Result of substituting variables into one string: the substituted
/// text, plus a warning if an unrecognized `${...}` marker survived.
#[derive(Debug, Clone, PartialEq)]
pub struct Substituted {
    pub text: String,
    pub warning: Option<String>,
}

fn substitute(input: &str, pairs: &[(&'static str, String)]) -> Substituted {
    let mut text = input.to_string();
    for (key, value) in pairs {
        text = text.replace(key, value);
    }
    let warning = leftover_marker_regex()
        .find(&text)
        .map(|m| format!("unrecognized substitution variable {:?} left unexpanded", m.as_str()));
    Substituted { text, warning }
}

fn leftover_marker_regex() -> &'static Regex {
    lazy_static::lazy_static! {
        static ref RE: Regex = Regex::new(r"\$\{[^}]*\}").expect("valid regex");
    }
    &RE
}

pub fn substitute_benchmark(input: &str, ctx: &BenchmarkContext) -> Substituted {
    substitute(input, &ctx.pairs())
}

pub fn substitute_sourcefile(input: &str, ctx: &SourceFileContext) -> Substituted {
    substitute(input, &ctx.pairs())
}

/// Glob-expand a pattern relative to `base_dir` when it is not
/// absolute. Results are sorted lexicographically for deterministic
/// ordering. A pattern matching nothing returns an empty vector (the
/// caller emits the "missing pattern" warning, this function does
/// not abort).
pub fn glob_expand(pattern: &str, base_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let full_pattern = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        base_dir.join(pattern).to_string_lossy().into_owned()
    };
    let mut results: Vec<PathBuf> = glob::glob(&full_pattern)?
        .filter_map(|r| r.ok())
        .collect();
    results.sort();
    Ok(results)
}

/// Parse an `<includesfile>`'s lines: skip blank lines and `#`/`//`
/// comments, trim whitespace. Reject any non-comment line that looks
/// like code: contains `{` that is not part of a `${...}`
/// substitution (spec §4.1 step 4).
pub fn parse_includesfile(content: &str) -> anyhow::Result<Vec<String>> {
    let mut lines = Vec::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if looks_like_code(line) {
            anyhow::bail!("includesfile line looks like code, not a file pattern: {line:?}");
        }
        lines.push(line.to_string());
    }
    Ok(lines)
}

fn looks_like_code(line: &str) -> bool {
    let mut chars = line.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '{' {
            // Allowed only as part of "${...}".
            if i == 0 || !line.as_bytes()[i - 1..i].eq(b"$") {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BenchmarkContext {
        BenchmarkContext {
            benchmark_name: "mybench".into(),
            benchmark_date: DateTimeWithOffset::now(),
            benchmark_instance: "2026-07-28".into(),
            benchmark_path: PathBuf::from("/tasks"),
            benchmark_path_abs: PathBuf::from("/tasks"),
            benchmark_file: PathBuf::from("bench.xml"),
            benchmark_file_abs: PathBuf::from("/tasks/bench.xml"),
            logfile_path: PathBuf::from("logs"),
            logfile_path_abs: PathBuf::from("/tasks/logs"),
            rundefinition_name: "rundef1".into(),
        }
    }

    #[test]
    fn t_substitute_known() {
        let out = substitute_benchmark("--name=${benchmark_name}", &ctx());
        assert_eq!(out.text, "--name=mybench");
        assert!(out.warning.is_none());
    }

    #[test]
    fn t_substitute_unknown_warns_but_keeps() {
        let out = substitute_benchmark("--x=${nonexistent}", &ctx());
        assert_eq!(out.text, "--x=${nonexistent}");
        assert!(out.warning.is_some());
    }

    #[test]
    fn t_parse_includesfile_skips_comments() {
        let lines = parse_includesfile("# comment\n\n// also comment\nfoo/*.c\n").unwrap();
        assert_eq!(lines, vec!["foo/*.c".to_string()]);
    }

    #[test]
    fn t_parse_includesfile_rejects_code() {
        assert!(parse_includesfile("if (x) { foo(); }\n").is_err());
    }

    #[test]
    fn t_parse_includesfile_allows_substitution_braces() {
        let lines = parse_includesfile("${sourcefile_path}/*.c\n").unwrap();
        assert_eq!(lines, vec!["${sourcefile_path}/*.c".to_string()]);
    }
}
