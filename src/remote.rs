//! Remote/cluster dispatch adapter (spec §4.7, wire layout §6.3):
//! serializes every run of a batch into one text dispatch file,
//! invokes the (opaque, external) cluster-client subprocess, then
//! reconstructs per-run results from the artifacts it leaves on disk.
//! Grounded in `benchmark.py`'s `CloudExecutor`
//! (`examples/original_source/scripts/benchmark.py`): tab-separated
//! header lines, one `argRecord` line per run, `.stdOut` sidecars, and
//! `hostInformation.txt`.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use thiserror::Error;

use crate::{
    ctx,
    io_utils::capture::{CaptureOpts, OutFile},
    model::{Requirements, Run},
    toolinfo::{EnvironmentMutations, RLimits},
};

#[derive(Debug, Error)]
pub enum DispatchParseError {
    #[error("argRecord has no environment/debug-flag trailer: {0:?}")]
    MissingTrailer(String),
    #[error("hostInformation.txt has no blank-line separator between host blocks and the run mapping")]
    MissingHostMappingSeparator,
}

/// One run as it travels across the wire: the plug-in's already
/// resolved argv, the environment mutations it asked for, and the
/// debug flag the remote-side executor honors for `*.killed` naming
/// (spec §4.6 Cancellation, mirrored on the remote side).
#[derive(Debug, Clone)]
pub struct DispatchRun<'a> {
    pub run: &'a Run,
    pub argv: Vec<String>,
    pub environment: EnvironmentMutations,
    pub relative_log_path: PathBuf,
}

/// `argRecord`: a single-line, tab-free encoding of (argv, environment,
/// debug flag) the remote executor re-parses. Spec §4.7 only
/// constrains the *wire* shape ("tab is the field separator so argv
/// strings must not contain tabs"); this crate's grammar is a strict,
/// unambiguous one replacing the original's `eval()`-based parsing
/// (see DESIGN.md Open Question resolution): `argc \x1f arg0 \x1f arg1
/// ... \x1f envset_count \x1f k=v ... \x1f envprepend_count \x1f k=v
/// ... \x1f envappend_count \x1f k=v ... \x1f debug(0|1)`, `\x1f` (ASCII
/// unit separator) joining fields so that neither argv strings nor env
/// values can collide with the outer tab-separated line format.
pub fn encode_arg_record(argv: &[String], env: &EnvironmentMutations, debug: bool) -> Result<String> {
    for a in argv {
        anyhow::ensure!(!a.contains('\t'), "argv entry {a:?} contains a tab");
    }
    let mut out = String::new();
    write!(out, "{}", argv.len())?;
    for a in argv {
        out.push('\u{1f}');
        out.push_str(a);
    }
    for group in [&env.set, &env.prepend, &env.append] {
        out.push('\u{1f}');
        write!(out, "{}", group.len())?;
        for (k, v) in group {
            out.push('\u{1f}');
            write!(out, "{k}={v}")?;
        }
    }
    out.push('\u{1f}');
    out.push(if debug { '1' } else { '0' });
    Ok(out)
}

pub fn decode_arg_record(record: &str) -> Result<(Vec<String>, EnvironmentMutations, bool)> {
    let mut fields = record.split('\u{1f}');
    let argc: usize = fields
        .next()
        .ok_or_else(|| DispatchParseError::MissingTrailer(record.to_string()))?
        .parse()
        .context("argRecord argc")?;
    let argv: Vec<String> = (0..argc)
        .map(|_| fields.next().map(str::to_string))
        .collect::<Option<_>>()
        .ok_or_else(|| DispatchParseError::MissingTrailer(record.to_string()))?;

    let mut groups = Vec::new();
    for _ in 0..3 {
        let count: usize = fields
            .next()
            .ok_or_else(|| DispatchParseError::MissingTrailer(record.to_string()))?
            .parse()
            .context("argRecord env group count")?;
        let mut pairs = Vec::new();
        for _ in 0..count {
            let kv = fields
                .next()
                .ok_or_else(|| DispatchParseError::MissingTrailer(record.to_string()))?;
            let (k, v) = kv
                .split_once('=')
                .ok_or_else(|| DispatchParseError::MissingTrailer(record.to_string()))?;
            pairs.push((k.to_string(), v.to_string()));
        }
        groups.push(pairs);
    }
    let debug = fields
        .next()
        .ok_or_else(|| DispatchParseError::MissingTrailer(record.to_string()))?
        == "1";

    let mut groups = groups.into_iter();
    let env = EnvironmentMutations {
        set: groups.next().unwrap(),
        prepend: groups.next().unwrap(),
        append: groups.next().unwrap(),
    };
    Ok((argv, env, debug))
}

#[derive(Debug, Clone, Default)]
pub struct DispatchHeader {
    pub tool_paths: Vec<String>,
    pub remote_runner_dir: String,
    pub base_dir: String,
    pub output_dir: String,
    pub working_dir: String,
    pub requirements: Requirements,
    pub result_files_pattern: Option<String>,
    pub num_runs_plus_one: u32,
    pub priority: Option<String>,
    pub num_runs: u32,
    pub rlimits: RLimits,
}

/// Builds the dispatch file's full text (spec §6.3): a fixed header of
/// tab-joined lines, then one `argRecord \t sourcefile \t
/// relativeLogPath` line per run.
pub fn build_dispatch_file(header: &DispatchHeader, runs: &[DispatchRun], debug: bool) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "{}", header.tool_paths.join("\t"))?;
    writeln!(out, "{}", header.remote_runner_dir)?;
    writeln!(out, "{}\t{}\t{}", header.base_dir, header.output_dir, header.working_dir)?;
    writeln!(
        out,
        "{}\t{}\t{}",
        header.requirements.memory_mb.map(|m| m.to_string()).unwrap_or_default(),
        header.requirements.cpu_cores.map(|c| c.to_string()).unwrap_or_default(),
        header.requirements.cpu_model.clone().unwrap_or_default(),
    )?;
    writeln!(out, "{}", header.result_files_pattern.clone().unwrap_or_default())?;
    writeln!(
        out,
        "{}\t{}",
        header.num_runs_plus_one,
        header.priority.clone().unwrap_or_default()
    )?;
    write!(out, "{}\t{}\t{}", header.num_runs, rlimit_field(header.rlimits.hardtimelimit_s), rlimit_field(header.rlimits.memlimit_mb))?;
    if let Some(cores) = header.rlimits.cpu_cores {
        write!(out, "\t{cores}")?;
    }
    out.push('\n');

    for dispatch in runs {
        let record = encode_arg_record(&dispatch.argv, &dispatch.environment, debug)?;
        let sourcefile = dispatch
            .run
            .sourcefiles
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        writeln!(out, "{record}\t{sourcefile}\t{}", dispatch.relative_log_path.display())?;
    }
    Ok(out)
}

fn rlimit_field(v: Option<u64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// Resource usage recovered from a `<logFile>.stdOut` sidecar. Lenient
/// per spec §4.7: a malformed or absent value is `None`, never an
/// error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StdOutSidecar {
    pub walltime_s: Option<f64>,
    pub cputime_s: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub returnvalue: Option<i32>,
}

pub fn parse_stdout_sidecar(content: &str) -> StdOutSidecar {
    let mut out = StdOutSidecar::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "Walltime" => out.walltime_s = strip_unit_suffix(value, 's').and_then(|v| v.parse().ok()),
            "CpuTime" => out.cputime_s = strip_unit_suffix(value, 's').and_then(|v| v.parse().ok()),
            "MemoryUsage" => out.memory_bytes = value.parse().ok(),
            "Returnvalue" => out.returnvalue = value.parse().ok(),
            _ => {}
        }
    }
    out
}

fn strip_unit_suffix(s: &str, suffix: char) -> Option<&str> {
    Some(s.strip_suffix(suffix).unwrap_or(s))
}

/// One reporting host from `hostInformation.txt`'s first block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub name: String,
    pub os: Option<String>,
    pub memory: Option<String>,
    pub cpu: Option<String>,
    pub frequency: Option<String>,
    pub cores: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HostInformation {
    pub hosts: Vec<HostInfo>,
    /// run-identifier (the sourcefile column from the dispatch file) ->
    /// host name.
    pub run_to_host: BTreeMap<String, String>,
}

/// Parses `hostInformation.txt` (spec §6.3): blank-separated
/// `key=value` blocks (one per host), a blank line, then `host\trun`
/// lines.
pub fn parse_host_information(content: &str) -> Result<HostInformation, DispatchParseError> {
    let blocks: Vec<&str> = content.split("\n\n").collect();
    if blocks.len() < 2 {
        return Err(DispatchParseError::MissingHostMappingSeparator);
    }

    // Every block up to (but not including) the first one carrying a
    // `host\trun` line is a host's `key=value` block; there may be any
    // number of hosts, not just one.
    let split_at = blocks
        .iter()
        .position(|block| block.lines().any(|line| line.contains('\t')))
        .ok_or(DispatchParseError::MissingHostMappingSeparator)?;

    let mut hosts = Vec::new();
    for block in &blocks[..split_at] {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for line in block.lines() {
            if let Some((k, v)) = line.split_once('=') {
                fields.insert(k.trim(), v.trim());
            }
        }
        let Some(name) = fields.get("name") else { continue };
        hosts.push(HostInfo {
            name: name.to_string(),
            os: fields.get("os").map(|s| s.to_string()),
            memory: fields.get("memory").map(|s| s.to_string()),
            cpu: fields.get("cpu").map(|s| s.to_string()),
            frequency: fields.get("frequency").map(|s| s.to_string()),
            cores: fields.get("cores").map(|s| s.to_string()),
        });
    }

    let rest = blocks[split_at..].join("\n\n");
    let mut run_to_host = BTreeMap::new();
    for line in rest.lines() {
        if let Some((host, run)) = line.split_once('\t') {
            run_to_host.insert(run.to_string(), host.to_string());
        }
    }

    Ok(HostInformation { hosts, run_to_host })
}

/// Outcome of ingesting one run's remote artifacts: either it was
/// executed (with whatever the sidecar + log file gave us) or its
/// `.stdOut` sidecar never appeared, in which case spec §4.7 says the
/// run is marked "not executed" without aborting the benchmark.
#[derive(Debug, Clone)]
pub enum RemoteRunOutcome {
    Executed {
        sidecar: StdOutSidecar,
        output_lines: Vec<String>,
        host: Option<String>,
    },
    NotExecuted,
}

/// Reads back one run's artifacts: `<logFile>.stdOut` and the log file
/// itself at `log_file`. Never errors: a missing sidecar yields
/// `NotExecuted`, a missing log file yields empty output lines.
pub fn ingest_run_artifacts(log_file: &Path, run_identifier: &str, hosts: &HostInformation) -> RemoteRunOutcome {
    let sidecar_path = sidecar_path_for(log_file);
    let Ok(sidecar_content) = std::fs::read_to_string(&sidecar_path) else {
        return RemoteRunOutcome::NotExecuted;
    };
    let sidecar = parse_stdout_sidecar(&sidecar_content);
    let output_lines = std::fs::read_to_string(log_file)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default();
    let host = hosts.run_to_host.get(run_identifier).cloned();
    RemoteRunOutcome::Executed {
        sidecar,
        output_lines,
        host,
    }
}

pub fn sidecar_path_for(log_file: &Path) -> PathBuf {
    let mut s = log_file.as_os_str().to_owned();
    s.push(".stdOut");
    PathBuf::from(s)
}

/// Writes the dispatch file, invokes the cluster-client subprocess
/// (its own stdout/stderr merged into `client_log`, spec §4.7's "cluster
/// client non-zero exit is a warning, not fatal"), and returns whether
/// it exited non-zero (the caller still attempts to ingest whatever
/// artifacts exist).
pub fn invoke_cluster_client(
    cluster_client: &Path,
    dispatch_file: &Path,
    extra_args: &[String],
    client_log: &Path,
) -> Result<bool> {
    let mut cmd = Command::new(cluster_client);
    cmd.arg(dispatch_file);
    cmd.args(extra_args);
    let out_file = OutFile::create(client_log).map_err(ctx!("opening cluster client log {client_log:?}"))?;
    let status = out_file
        .run_with_capture(cmd, CaptureOpts::default())
        .with_context(|| format!("invoking cluster client {cluster_client:?}"))?;
    Ok(!status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_arg_record_roundtrip() {
        let argv = vec!["tool".to_string(), "--flag".to_string(), "value with spaces".to_string()];
        let env = EnvironmentMutations {
            set: vec![("FOO".into(), "bar".into())],
            prepend: vec![],
            append: vec![("PATH".into(), "/extra/bin".into())],
        };
        let record = encode_arg_record(&argv, &env, true).unwrap();
        assert!(!record.contains('\t'));
        let (decoded_argv, decoded_env, decoded_debug) = decode_arg_record(&record).unwrap();
        assert_eq!(decoded_argv, argv);
        assert_eq!(decoded_env.set, env.set);
        assert_eq!(decoded_env.append, env.append);
        assert!(decoded_debug);
    }

    #[test]
    fn t_parse_stdout_sidecar_lenient() {
        let content = "Walltime: 12.5s\nCpuTime: 11.9s\nMemoryUsage: 104857600\nReturnvalue: 0\n";
        let sidecar = parse_stdout_sidecar(content);
        assert_eq!(sidecar.walltime_s, Some(12.5));
        assert_eq!(sidecar.cputime_s, Some(11.9));
        assert_eq!(sidecar.memory_bytes, Some(104857600));
        assert_eq!(sidecar.returnvalue, Some(0));
    }

    #[test]
    fn t_parse_stdout_sidecar_malformed_is_none_not_error() {
        let content = "Walltime: not-a-number\nsomething else entirely\n";
        let sidecar = parse_stdout_sidecar(content);
        assert_eq!(sidecar.walltime_s, None);
        assert_eq!(sidecar.cputime_s, None);
    }

    #[test]
    fn t_parse_host_information() {
        let content = "name=host1\nos=linux\ncores=4\n\nname=host2\nos=linux\ncores=8\n\nhost1\ttask_a.c\nhost2\ttask_b.c\n";
        let parsed = parse_host_information(content).unwrap();
        assert_eq!(parsed.hosts.len(), 2);
        assert_eq!(parsed.hosts[0].name, "host1");
        assert_eq!(parsed.run_to_host.get("task_a.c"), Some(&"host1".to_string()));
        assert_eq!(parsed.run_to_host.get("task_b.c"), Some(&"host2".to_string()));
    }

    #[test]
    fn t_missing_sidecar_is_not_executed() {
        let dir = std::env::temp_dir().join(format!("bencheck-remote-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let log_file = dir.join("a.log");
        let hosts = HostInformation::default();
        let outcome = ingest_run_artifacts(&log_file, "a.c", &hosts);
        assert!(matches!(outcome, RemoteRunOutcome::NotExecuted));
    }

    #[test]
    fn t_build_dispatch_file_header_shape() {
        let header = DispatchHeader {
            tool_paths: vec!["/usr/bin/tool".into()],
            remote_runner_dir: "/remote".into(),
            base_dir: "/base".into(),
            output_dir: "/out".into(),
            working_dir: "/work".into(),
            requirements: Requirements {
                cpu_model: Some("Intel".into()),
                cpu_cores: Some(4),
                memory_mb: Some(8000),
            },
            result_files_pattern: None,
            num_runs_plus_one: 2,
            priority: Some("HIGH".into()),
            num_runs: 1,
            rlimits: RLimits {
                memlimit_mb: Some(2000),
                hardtimelimit_s: Some(900),
                softtimelimit_s: Some(900),
                cpu_cores: Some(2),
            },
        };
        let run = Run::new("a", PathBuf::from("/out/a.log"), vec![]);
        let dispatch = DispatchRun {
            run: &run,
            argv: vec!["tool".into(), "a.c".into()],
            environment: EnvironmentMutations::default(),
            relative_log_path: PathBuf::from("a.log"),
        };
        let text = build_dispatch_file(&header, &[dispatch], false).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "/usr/bin/tool");
        assert_eq!(lines[1], "/remote");
        assert_eq!(lines[2], "/base\t/out\t/work");
        assert!(lines[6].contains("a.log"));
    }
}
