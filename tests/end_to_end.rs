//! Integration tests wiring several modules together per scenario,
//! rather than re-checking what each module's own unit tests already
//! cover in isolation. Each test follows a benchmark definition
//! through expansion, (synthetic) execution, classification, and
//! output, the way `bencheck` itself does end to end.

use std::path::PathBuf;

use bencheck::{
    executor::ExecutionOutcome,
    expand::{expand_benchmark, ExpandOverrides},
    local_engine::classify_and_record,
    model::{Column, ResultCategory},
    output::{OutputHandler, XmlResultDocument, XmlRunResult},
    serde::date_and_time::DateTimeWithOffset,
    table_gen::merge_results,
    terminal_table::TerminalTableOpts,
    toolinfo::{EnvironmentMutations, GenericExitCodeTool, RLimits, ToolInfo},
    xml_model::XmlBenchmark,
};

/// A minimal SV-COMP-style plug-in that reads its verdict from the
/// "Verification result: ..." line instead of the exit code, the way
/// a real verifier's `determine_result` would (spec §4.4); used where
/// a test needs a `true`/`false(<kind>)` verdict that
/// [`GenericExitCodeTool`] (exit-code only) can't produce.
struct SvCompStyleTool;

impl ToolInfo for SvCompStyleTool {
    fn executable(&self) -> anyhow::Result<PathBuf> {
        Ok(PathBuf::from("/bin/true"))
    }

    fn name(&self) -> &str {
        "sv-comp-style"
    }

    fn cmdline(
        &self,
        executable: &std::path::Path,
        _options: &[String],
        _sourcefiles: &[PathBuf],
        _property_file: Option<&std::path::Path>,
        _rlimits: RLimits,
    ) -> Vec<String> {
        vec![executable.to_string_lossy().into_owned()]
    }

    fn environments(&self, _executable: &std::path::Path) -> EnvironmentMutations {
        EnvironmentMutations::default()
    }

    fn determine_result(&self, _returncode: Option<i32>, _signal: Option<i32>, output_lines: &[String], is_timeout: bool) -> String {
        if is_timeout {
            return "TIMEOUT".to_string();
        }
        output_lines
            .iter()
            .find_map(|line| line.strip_prefix("Verification result: "))
            .map(|verdict| {
                let verdict = verdict.trim_end_matches('.');
                if verdict == "TRUE" {
                    "true".to_string()
                } else if let Some(kind) = verdict.strip_prefix("FALSE(").and_then(|s| s.strip_suffix(')')) {
                    format!("false({kind})")
                } else {
                    "unknown".to_string()
                }
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn add_column_values(&self, _output_lines: &[String], _columns: &mut [Column]) {}
}

fn run_result(name: &str, status: &str, category: &str) -> XmlRunResult {
    XmlRunResult {
        name: name.into(),
        status: Some(status.into()),
        category: Some(category.into()),
        cputime: Some("1.00s".into()),
        walltime: Some("1.50s".into()),
        host: None,
        columns: vec![],
    }
}

fn tempdir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bencheck-e2e-{label}-{}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write(dir: &std::path::Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn exit_code_tool() -> GenericExitCodeTool {
    GenericExitCodeTool {
        name: "generic-exitcode".into(),
        executable_name: "true".into(),
    }
}

fn outcome_with_output(lines: &[&str]) -> ExecutionOutcome {
    ExecutionOutcome {
        wall_time_s: 0.1,
        cpu_time_s: Some(0.1),
        mem_usage_bytes: None,
        returncode: Some(0),
        signal: None,
        killed_by_watchdog: false,
        output_lines: lines.iter().map(|s| s.to_string()).collect(),
        warnings: vec![],
    }
}

/// Scenario 1 (spec §8): single safe file, one worker, tool reports
/// `true` against a reach property. Exercises expansion, classifier,
/// and XML output together.
#[test]
fn scenario_1_single_safe_file_one_worker() {
    let dir = tempdir("s1");
    write(&dir, "a_true-unreach-call.c", "int main() {}");
    write(
        &dir,
        "prop.prp",
        "CHECK( init(main()), LTL(G ! call(__VERIFIER_error())) )",
    );
    let xml_text = r#"
        <benchmark tool="generic-exitcode" threads="1">
            <rundefinition name="main">
                <sourcefiles>
                    <include>*.c</include>
                    <propertyfile>prop.prp</propertyfile>
                </sourcefiles>
            </rundefinition>
        </benchmark>
    "#;
    let xml_path = write(&dir, "bench.xml", xml_text);
    let xml = XmlBenchmark::from_str(xml_text).unwrap();
    let tool = SvCompStyleTool;
    let expanded = expand_benchmark(&xml_path, &xml, &tool, true, &ExpandOverrides::default()).unwrap();
    assert_eq!(expanded.benchmark.run_sets.len(), 1);
    let mut run_set = expanded.benchmark.run_sets.into_iter().next().unwrap();
    assert_eq!(run_set.runs.len(), 1);

    let run = &mut run_set.runs[0];
    let rlimits = RLimits::default();
    classify_and_record(run, &tool, rlimits, &outcome_with_output(&["Verification result: TRUE."]));
    assert_eq!(run.category, Some(ResultCategory::Correct));
    assert_eq!(run.extra.get("score").map(String::as_str), Some("2"));

    let handler = OutputHandler::new(
        dir.join("result.xml"),
        &dir.join("result.txt"),
        expanded.benchmark.name.clone(),
        "generic-exitcode".into(),
        None,
        DateTimeWithOffset::now(),
        &[],
        TerminalTableOpts::default(),
    )
    .unwrap();
    handler.start_run(run).unwrap();
    handler.finish_run(run).unwrap();
    let stats = handler.finish().unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.correct_true, 1);

    let xml = std::fs::read_to_string(dir.join("result.xml")).unwrap();
    let doc = XmlResultDocument::from_xml_str(&xml).unwrap();
    assert_eq!(doc.runs.len(), 1);
    assert_eq!(doc.runs[0].category.as_deref(), Some("correct"));
}

/// Scenario 2 (spec §8): same setup, tool reports a wrong `false(reach)`.
#[test]
fn scenario_2_wrong_answer_on_reach() {
    let dir = tempdir("s2");
    write(&dir, "a_true-unreach-call.c", "int main() {}");
    write(
        &dir,
        "prop.prp",
        "CHECK( init(main()), LTL(G ! call(__VERIFIER_error())) )",
    );
    let xml_text = r#"
        <benchmark tool="generic-exitcode">
            <rundefinition name="main">
                <sourcefiles>
                    <include>*.c</include>
                    <propertyfile>prop.prp</propertyfile>
                </sourcefiles>
            </rundefinition>
        </benchmark>
    "#;
    let xml_path = write(&dir, "bench.xml", xml_text);
    let xml = XmlBenchmark::from_str(xml_text).unwrap();
    let tool = SvCompStyleTool;
    let expanded = expand_benchmark(&xml_path, &xml, &tool, true, &ExpandOverrides::default()).unwrap();
    let mut run_set = expanded.benchmark.run_sets.into_iter().next().unwrap();
    let run = &mut run_set.runs[0];

    classify_and_record(run, &tool, RLimits::default(), &outcome_with_output(&["Verification result: FALSE(reach)."]));
    assert_eq!(run.category, Some(ResultCategory::Wrong));
    assert_eq!(run.extra.get("score").map(String::as_str), Some("-4"));
}

/// Scenario 3 (spec §8): killed by signal 9 with memory usage at the
/// configured limit gets rewritten to `OUT OF MEMORY` / `error`.
#[test]
fn scenario_3_oom_reclassification() {
    let tool = exit_code_tool();
    let mut run = bencheck::model::Run::new("task", PathBuf::from("/tmp/does-not-matter.log"), vec![]);
    let rlimits = RLimits {
        memlimit_mb: Some(3000),
        ..Default::default()
    };
    let outcome = ExecutionOutcome {
        wall_time_s: 12.0,
        cpu_time_s: Some(5.0),
        mem_usage_bytes: Some(3_000_000_000),
        returncode: None,
        signal: Some(9),
        killed_by_watchdog: false,
        output_lines: vec![],
        warnings: vec![],
    };
    classify_and_record(&mut run, &tool, rlimits, &outcome);
    assert_eq!(run.status.as_deref(), Some("OUT OF MEMORY"));
    assert_eq!(run.category, Some(ResultCategory::Error));
}

/// Scenario 4 (spec §8): CPU time right at the soft limit overrides a
/// late `TRUE` verdict with `TIMEOUT` / `error`.
#[test]
fn scenario_4_timeout_with_late_true() {
    let tool = exit_code_tool();
    let mut run = bencheck::model::Run::new("task", PathBuf::from("/tmp/does-not-matter.log"), vec![]);
    let rlimits = RLimits {
        softtimelimit_s: Some(100),
        ..Default::default()
    };
    let outcome = ExecutionOutcome {
        wall_time_s: 101.0,
        cpu_time_s: Some(100.5),
        mem_usage_bytes: None,
        returncode: Some(0),
        signal: None,
        killed_by_watchdog: false,
        output_lines: vec!["Verification result: TRUE.".to_string()],
        warnings: vec![],
    };
    classify_and_record(&mut run, &tool, rlimits, &outcome);
    assert_eq!(run.status.as_deref(), Some("TIMEOUT"));
    assert_eq!(run.category, Some(ResultCategory::Error));
}

/// Scenario 5 (spec §8): four run sets, `--moduloAndRest 2 0` selects
/// only the 2nd and 4th (1-based indices satisfying `index % 2 == 0`).
#[test]
fn scenario_5_run_set_selection_via_modulo_and_rest() {
    let dir = tempdir("s5");
    write(&dir, "a.c", "");
    let xml_text = r#"
        <benchmark tool="generic-exitcode">
            <rundefinition name="r1"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
            <rundefinition name="r2"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
            <rundefinition name="r3"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
            <rundefinition name="r4"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
        </benchmark>
    "#;
    let xml_path = write(&dir, "bench.xml", xml_text);
    let xml = XmlBenchmark::from_str(xml_text).unwrap();
    let tool = exit_code_tool();
    let overrides = ExpandOverrides {
        modulo_and_rest: Some((2, 0)),
        ..Default::default()
    };
    let expanded = expand_benchmark(&xml_path, &xml, &tool, true, &overrides).unwrap();
    let names: Vec<&str> = expanded.benchmark.run_sets.iter().map(|rs| rs.display_name.as_str()).collect();
    assert_eq!(names, vec!["r2", "r4"]);
}

/// Scenario 6 (spec §8): merging two result XMLs where the second is
/// missing a source file yields a placeholder row, not a crash.
#[test]
fn scenario_6_table_merge_with_missing_file() {
    let doc_a = XmlResultDocument {
        benchmark_name: "b".into(),
        date: "2026-01-01".into(),
        tool: "generic-exitcode".into(),
        version: None,
        runs: vec![run_result("a.c", "true", "correct"), run_result("b.c", "true", "correct")],
    };
    let doc_b = XmlResultDocument {
        benchmark_name: "b".into(),
        date: "2026-01-02".into(),
        tool: "generic-exitcode".into(),
        version: None,
        runs: vec![run_result("a.c", "true", "correct")],
    };

    let merged = merge_results(&[doc_a, doc_b]);
    let names: Vec<_> = merged.rows.iter().map(|r| r.source_file.clone()).collect();
    assert_eq!(names, vec!["a.c", "b.c"]);
    let b_row = &merged.rows[1];
    assert!(b_row.per_input[0].is_some());
    assert!(b_row.per_input[1].is_none());
}
