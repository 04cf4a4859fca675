//! The driver: reads one or more benchmark-definition XML files,
//! expands each into runs, executes them (locally or via `--cloud`
//! dispatch to an external cluster client), and writes the result
//! XML/text-log/statistics artifacts (spec §6.4, first CLI surface).

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};
use strum_macros::{Display, EnumString};

use bencheck::{
    cgroup::CgroupMounts,
    config_file::{BencheckConfig, LoadConfigFile},
    ctx,
    expand::{expand_benchmark, ExpandOverrides, ExpanderError},
    local_engine::{classify_and_record, limits_to_rlimits, run_run_set, CancelHandle, LocalEngineConfig},
    lockable_file::LockableFile,
    model::{Benchmark, ResultCategory, Run, RunSet},
    output::OutputHandler,
    remote::{self, DispatchHeader, DispatchRun},
    terminal_table::TerminalTableOpts,
    toolinfo::{ToolInfo, ToolRegistry},
    utillib::logging::{LogLevel, LogLevelOpt},
    xml_model::XmlBenchmark,
};

const PROGRAM_NAME: &str = "bencheck";

#[derive(Debug, Clone, Copy, EnumString, Display, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
enum CloudPriority {
    Idle,
    Low,
    High,
    Urgent,
}

#[derive(clap::Parser, Debug)]
#[clap(name = PROGRAM_NAME, version)]
struct Opts {
    /// One or more benchmark-definition XML files to process.
    #[clap(required = true)]
    benchmark_files: Vec<PathBuf>,

    #[clap(flatten)]
    log_level: LogLevelOpt,

    #[clap(flatten)]
    table_opts: TerminalTableOpts,

    /// Restrict execution to the named <rundefinition> blocks
    /// (repeatable; default is all of them).
    #[clap(short = 'r', long = "rundefinition")]
    rundefinition: Vec<String>,

    /// Restrict execution to the named <sourcefiles> blocks
    /// (repeatable; default is all of them).
    #[clap(short = 's', long = "sourcefiles")]
    sourcefiles: Vec<String>,

    /// Overrides the benchmark's name (and thus its output directory).
    #[clap(short = 'n', long)]
    name: Option<String>,

    /// Overrides the output base path.
    #[clap(short = 'o', long = "outputpath")]
    output_path: Option<PathBuf>,

    /// Overrides the soft (wall) time limit in seconds; -1 removes it.
    #[clap(short = 'T', long = "timelimit")]
    timelimit: Option<i64>,

    /// Overrides the memory limit in MB; -1 removes it.
    #[clap(short = 'M', long = "memorylimit")]
    memorylimit: Option<i64>,

    /// Overrides the number of parallel worker threads.
    #[clap(short = 'N', long = "numOfThreads")]
    num_of_threads: Option<u32>,

    /// Only run every `modulo`th run set, at `rest` (spec §8 run-set
    /// selection).
    #[clap(short = 'x', long = "moduloAndRest", number_of_values = 2)]
    modulo_and_rest: Option<Vec<u32>>,

    /// Overrides the number of CPU cores pinned per run.
    #[clap(short = 'c', long = "limitCores")]
    limit_cores: Option<u32>,

    /// Allows re-using an output directory that already exists
    /// (normally refused, spec §4.1 step 1).
    #[clap(long)]
    commit: bool,

    /// Free-text note recorded alongside the commit override; has no
    /// effect without --commit.
    #[clap(long, requires = "commit")]
    message: Option<String>,

    /// Dispatch runs to the cluster client instead of running locally.
    #[clap(long)]
    cloud: bool,

    /// Path to the cluster-client executable; falls back to the
    /// config file's `cloud_master`.
    #[clap(long = "cloudMaster")]
    cloud_master: Option<String>,

    #[clap(long = "cloudPriority")]
    cloud_priority: Option<CloudPriority>,

    /// Requests a specific CPU model from the cluster (spec §3
    /// Requirements), overriding any `<require cpuModel=.../>`.
    #[clap(long = "cloudCPUModel")]
    cloud_cpu_model: Option<String>,

    /// Path to a JSON5 config file; defaults to ~/.bencheck.json5.
    #[clap(long)]
    config: Option<PathBuf>,
}

/// Counts SIGINTs received so far (spec §5: first one requests
/// cooperative shutdown, a second lets the default handler act). Only
/// ever incremented from the signal handler, so plain relaxed atomics
/// are enough.
static SIGINT_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn handle_sigint(_signum: i32) {
    SIGINT_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Ignores SIGTERM (spec §5 "SIGTERM to the driver is ignored") and
/// installs the SIGINT counter above. The actual cancellation is
/// driven by a polling thread, not the handler itself, since taking
/// locks or doing I/O from a signal handler is not safe.
fn install_signal_handlers() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_sigint))
            .map_err(ctx!("installing SIGINT handler"))?;
        signal::signal(Signal::SIGTERM, SigHandler::SigIgn).map_err(ctx!("ignoring SIGTERM"))?;
    }
    Ok(())
}

/// Polls `SIGINT_COUNT` and cooperatively cancels `cancel` the first
/// time it sees a SIGINT; a second SIGINT re-installs the default
/// handler and re-raises, so the process terminates immediately.
fn spawn_sigint_watcher(cancel: Arc<CancelHandle>) {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(100));
        let count = SIGINT_COUNT.load(Ordering::Relaxed);
        if count == 1 && !cancel.is_cancelled() {
            bencheck::info!("received SIGINT, cancelling remaining runs (press again to force quit)");
            cancel.cancel();
        } else if count >= 2 {
            unsafe {
                let _ = signal::signal(Signal::SIGINT, SigHandler::SigDfl);
                libc::raise(Signal::SIGINT as i32);
            }
        }
    });
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let debug_mode = LogLevel::from(opts.log_level.clone()) == LogLevel::Debug;
    opts.log_level.clone().apply();

    let config = BencheckConfig::load_config(opts.config.clone())?;
    let registry = ToolRegistry::default();
    let cancel = Arc::new(CancelHandle::new());
    install_signal_handlers()?;
    spawn_sigint_watcher(cancel.clone());

    let mut any_failed = false;
    for benchmark_file in &opts.benchmark_files {
        if let Err(e) = run_one_benchmark(benchmark_file, &opts, &config, &registry, &cancel, debug_mode) {
            bencheck::info!("benchmark {benchmark_file:?} failed: {e:#}");
            any_failed = true;
        }
        if cancel.is_cancelled() {
            break;
        }
    }

    if any_failed {
        std::process::exit(1);
    }
    Ok(())
}

fn run_one_benchmark(
    benchmark_file: &PathBuf,
    opts: &Opts,
    config: &BencheckConfig,
    registry: &ToolRegistry,
    cancel: &Arc<CancelHandle>,
    debug_mode: bool,
) -> Result<()> {
    let xml_text = std::fs::read_to_string(benchmark_file).map_err(ctx!("reading {benchmark_file:?}"))?;
    let xml = XmlBenchmark::from_str(&xml_text)?;
    let tool = registry.lookup(&xml.tool)?;

    let modulo_and_rest = match &opts.modulo_and_rest {
        Some(v) if v.len() == 2 => Some((v[0], v[1])),
        Some(_) => anyhow::bail!("--moduloAndRest takes exactly two values"),
        None => None,
    };
    let overrides = ExpandOverrides {
        name: opts.name.clone(),
        output_path: opts.output_path.clone(),
        timelimit_s: opts.timelimit,
        memorylimit_mb: opts.memorylimit,
        num_threads: opts.num_of_threads.or(config.default_num_threads),
        limit_cores: opts.limit_cores,
        restrict_rundefinitions: opts.rundefinition.clone(),
        restrict_sourcefiles: opts.sourcefiles.clone(),
        modulo_and_rest,
        cloud_cpu_model: opts.cloud_cpu_model.clone(),
        allow_reprocessing: opts.commit,
    };

    let result = match expand_benchmark(benchmark_file, &xml, tool.as_ref(), opts.cloud, &overrides) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ExpanderError::OutputDirectoryExists(name, dir)) = e.downcast_ref::<ExpanderError>() {
                anyhow::bail!("benchmark {name:?} output directory {dir:?} already exists; pass --commit to reuse it");
            }
            return Err(e);
        }
    };
    for warning in &result.warnings {
        bencheck::info!("{warning}");
    }
    if let Some(message) = &opts.message {
        bencheck::info!("commit message: {message}");
    }

    let mut benchmark = result.benchmark;
    std::fs::create_dir_all(benchmark.instance_dir()).map_err(ctx!("creating output directory"))?;

    let lock_path = benchmark.instance_dir().join(".bencheck.lock");
    std::fs::File::create(&lock_path).map_err(ctx!("creating lock file {lock_path:?}"))?;
    let lockable = LockableFile::open(&lock_path).map_err(ctx!("opening lock file {lock_path:?}"))?;
    let _guard = lockable
        .try_lock_exclusive()
        .map_err(ctx!("locking output directory"))?
        .ok_or_else(|| anyhow::anyhow!("another bencheck invocation already holds {lock_path:?}"))?;

    if opts.cloud {
        run_cloud(&mut benchmark, tool.as_ref(), opts, config, cancel)?;
    } else {
        run_local(&mut benchmark, tool.as_ref(), opts, cancel, debug_mode)?;
    }
    Ok(())
}

fn run_local(
    benchmark: &mut Benchmark,
    tool: &dyn ToolInfo,
    opts: &Opts,
    cancel: &Arc<CancelHandle>,
    debug_mode: bool,
) -> Result<()> {
    let cgroup_mounts = CgroupMounts::discover();
    let engine_config = LocalEngineConfig {
        num_threads: benchmark.num_threads,
        core_limit: opts.limit_cores.or(benchmark.requirements.cpu_cores),
        max_log_size_bytes: None,
    };

    let mut run_sets = std::mem::take(&mut benchmark.run_sets);
    for run_set in &mut run_sets {
        let handler = open_output_handler(benchmark, run_set, opts.table_opts.clone())?;
        for run in &run_set.runs {
            handler.start_run(run)?;
        }
        run_run_set(run_set, benchmark, tool, &cgroup_mounts, &engine_config, cancel, &|run| {
            if let Err(e) = handler.finish_run(run) {
                bencheck::info!("writing result for {:?}: {e:#}", run.identifier);
            }
        })?;

        for run in &mut run_set.runs {
            if !run.is_done() {
                mark_cancelled(run, debug_mode);
            }
        }

        let stats = handler.finish()?;
        println!(
            "{}",
            stats.summary_block(&format!(
                "run `bencheck-table {}` to analyze these results",
                benchmark
                    .instance_dir()
                    .join(format!("{}.{}.xml", benchmark.name, run_set.display_name))
                    .display()
            ))
        );
    }
    benchmark.run_sets = run_sets;
    Ok(())
}

/// Renames (debug mode) or deletes the log file of a run that was
/// cancelled before completing, per spec §5's shutdown semantics --
/// debug mode trades disk space for being able to inspect what a
/// killed run had written so far.
fn mark_cancelled(run: &mut Run, debug_mode: bool) {
    run.status = Some("CANCELLED".to_string());
    run.category = Some(ResultCategory::Missing);
    if debug_mode {
        let mut killed_path = run.log_file.as_os_str().to_owned();
        killed_path.push(".killed");
        let _ = std::fs::rename(&run.log_file, PathBuf::from(killed_path));
    } else {
        let _ = std::fs::remove_file(&run.log_file);
    }
}

fn run_cloud(
    benchmark: &mut Benchmark,
    tool: &dyn ToolInfo,
    opts: &Opts,
    config: &BencheckConfig,
    cancel: &Arc<CancelHandle>,
) -> Result<()> {
    let cloud_master = opts
        .cloud_master
        .clone()
        .or_else(|| config.cloud_master.clone())
        .ok_or_else(|| anyhow::anyhow!("--cloud requires --cloudMaster or a config file `cloud_master`"))?;
    let cluster_client = PathBuf::from(cloud_master);
    let placeholder_executable = PathBuf::from(tool.name());
    let rlimits = limits_to_rlimits(benchmark.limits, opts.limit_cores);

    let mut run_sets = std::mem::take(&mut benchmark.run_sets);
    for run_set in &mut run_sets {
        if cancel.is_cancelled() {
            break;
        }
        let handler = open_output_handler(benchmark, run_set, opts.table_opts.clone())?;
        for run in &run_set.runs {
            handler.start_run(run)?;
        }

        let dispatch_runs: Vec<DispatchRun> = run_set
            .runs
            .iter()
            .map(|run| {
                let argv = tool.cmdline(
                    &placeholder_executable,
                    &run.options,
                    &run.sourcefiles,
                    run.property_file.as_deref(),
                    rlimits,
                );
                DispatchRun {
                    run,
                    argv,
                    environment: tool.environments(&placeholder_executable),
                    relative_log_path: run
                        .log_file
                        .strip_prefix(&run_set.log_folder)
                        .unwrap_or(run.log_file.as_path())
                        .to_path_buf(),
                }
            })
            .collect();

        let header = DispatchHeader {
            tool_paths: tool
                .program_files(&placeholder_executable)
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            remote_runner_dir: run_set.log_folder.to_string_lossy().into_owned(),
            base_dir: benchmark.instance_dir().to_string_lossy().into_owned(),
            output_dir: run_set.log_folder.to_string_lossy().into_owned(),
            working_dir: run_set.log_folder.to_string_lossy().into_owned(),
            requirements: benchmark.requirements.clone(),
            result_files_pattern: None,
            num_runs_plus_one: run_set.runs.len() as u32 + 1,
            priority: opts.cloud_priority.map(|p| p.to_string()),
            num_runs: run_set.runs.len() as u32,
            rlimits,
        };

        let dispatch_file_text = remote::build_dispatch_file(&header, &dispatch_runs, false)?;
        let dispatch_file = benchmark
            .instance_dir()
            .join(format!("{}.{}.dispatch", benchmark.name, run_set.display_name));
        std::fs::write(&dispatch_file, &dispatch_file_text).map_err(ctx!("writing dispatch file {dispatch_file:?}"))?;

        let client_log = benchmark
            .instance_dir()
            .join(format!("{}.{}.cloud-client.log", benchmark.name, run_set.display_name));
        let client_failed = remote::invoke_cluster_client(&cluster_client, &dispatch_file, &[], &client_log)?;
        if client_failed {
            bencheck::info!("cluster client exited non-zero; attempting to ingest whatever artifacts it left behind");
        }

        let host_info_path = run_set.log_folder.join("hostInformation.txt");
        let hosts = match std::fs::read_to_string(&host_info_path) {
            Ok(content) => remote::parse_host_information(&content)?,
            Err(_) => Default::default(),
        };

        for run in &mut run_set.runs {
            match remote::ingest_run_artifacts(&run.log_file, &run.identifier, &hosts) {
                remote::RemoteRunOutcome::Executed {
                    sidecar,
                    output_lines,
                    host,
                } => {
                    run.host = host;
                    let outcome = bencheck::executor::ExecutionOutcome {
                        wall_time_s: sidecar.walltime_s.unwrap_or(0.0),
                        cpu_time_s: sidecar.cputime_s,
                        mem_usage_bytes: sidecar.memory_bytes,
                        returncode: sidecar.returnvalue,
                        signal: None,
                        killed_by_watchdog: false,
                        output_lines,
                        warnings: Vec::new(),
                    };
                    classify_and_record(run, tool, rlimits, &outcome);
                }
                remote::RemoteRunOutcome::NotExecuted => {
                    run.status = Some("not executed".to_string());
                    run.category = Some(ResultCategory::Error);
                    run.extra.insert("cloud_error".to_string(), "no .stdOut sidecar produced by cluster client".to_string());
                }
            }
            handler.finish_run(run)?;
        }

        let stats = handler.finish()?;
        println!("{}", stats.summary_block("run `bencheck-table` on the result XML to analyze these results"));
    }
    benchmark.run_sets = run_sets;
    Ok(())
}

fn open_output_handler(benchmark: &Benchmark, run_set: &RunSet, table_opts: TerminalTableOpts) -> Result<OutputHandler> {
    let xml_path = benchmark
        .instance_dir()
        .join(format!("{}.{}.xml", benchmark.name, run_set.display_name));
    let text_path = benchmark
        .instance_dir()
        .join(format!("{}.{}.txt", benchmark.name, run_set.display_name));
    OutputHandler::new(
        xml_path,
        &text_path,
        benchmark.name.clone(),
        benchmark.tool_name.clone(),
        benchmark.tool_version.clone(),
        benchmark.timestamp.clone(),
        &benchmark.columns,
        table_opts,
    )
    .with_context(|| format!("opening output handler for run set {:?}", run_set.display_name))
}
