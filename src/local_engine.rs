//! The local execution engine (spec §4.6): a bounded worker pool
//! pulling runs off a FIFO queue, one resource group and one executor
//! invocation per run, classifying the result as each run finishes.
//! Grounded in `benchmark/localexecution.py`'s thread-pool pattern
//! (see SPEC_FULL.md §12), generalized from its Python
//! `ThreadPoolExecutor` to a `std::thread::scope` worker pool pinned
//! to hardware threads via `core_assignment::Topology`.

use std::{
    collections::VecDeque,
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Instant,
};

use anyhow::Result;

use crate::{
    cgroup::CgroupMounts,
    classify::{calculate_score, get_result_category},
    core_assignment::Topology,
    executor::{execute_run, is_oom, is_timeout, ExecutionOutcome, RunningProcessSlot},
    model::{source_file_basename, Benchmark, Limits, Run, RunSet},
    toolinfo::{RLimits, ToolInfo},
};

#[derive(Debug, Clone, Copy)]
pub struct LocalEngineConfig {
    pub num_threads: u32,
    /// `None` disables core pinning entirely: runs are left to the
    /// scheduler, matching a machine where `<require cpuCores=.../>`
    /// was never set (spec §4.6 is opt-in, not mandatory).
    pub core_limit: Option<u32>,
    pub max_log_size_bytes: Option<u64>,
}

/// Per-run-set timing (spec §4.9 "RunSet": "wall time for the whole
/// run set is tracked separately from any individual run's wall
/// time").
#[derive(Debug, Clone, Copy)]
pub struct RunSetTiming {
    pub wall_time_s: f64,
    pub runs_completed: usize,
    pub runs_cancelled: usize,
}

/// Shared with the remote adapter (spec §2: local and cloud dispatch
/// agree on one resource-limit view).
pub fn limits_to_rlimits(limits: Limits, core_limit_override: Option<u32>) -> RLimits {
    RLimits {
        memlimit_mb: limits.memlimit_mb,
        hardtimelimit_s: limits.hardtimelimit_s,
        softtimelimit_s: limits.softtimelimit_s,
        cpu_cores: core_limit_override.or(limits.cpu_cores),
    }
}

/// Shared cancellation handle: `cancel()` stops workers from picking
/// up new runs and kills whatever each worker currently has running
/// (spec §4.6 "Cancellation": "an external kill() on the executor is
/// asynchronous: it fires signals into the child group; the blocked
/// wait must wake and return").
#[derive(Default)]
pub struct CancelHandle {
    flag: AtomicBool,
    slots: Mutex<Vec<std::sync::Arc<RunningProcessSlot>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        for slot in self.slots.lock().expect("no poisoning").iter() {
            slot.kill_current();
        }
    }

    fn register(&self, slot: std::sync::Arc<RunningProcessSlot>) {
        self.slots.lock().expect("no poisoning").push(slot);
    }
}

/// Runs every run in `run_set` locally, calling `on_complete` once per
/// finished run (including ones ended by cancellation, whose category
/// is left `None`/`is_done() == false`). Mutates `run_set.runs` in
/// place with the results; order is preserved.
pub fn run_run_set(
    run_set: &mut RunSet,
    benchmark: &Benchmark,
    tool: &dyn ToolInfo,
    cgroup_mounts: &CgroupMounts,
    config: &LocalEngineConfig,
    cancel: &CancelHandle,
    on_complete: &(dyn Fn(&Run) + Sync),
) -> Result<RunSetTiming> {
    let executable = benchmark
        .tool_executable
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("no local tool executable resolved; cannot run locally"))?;

    let num_workers = config.num_threads.max(1);
    let topology = Topology::discover();
    let core_assignments: Vec<Option<Vec<u32>>> = match config.core_limit {
        Some(core_limit) => topology
            .assign(core_limit, num_workers)?
            .into_iter()
            .map(Some)
            .collect(),
        None => (0..num_workers).map(|_| None).collect(),
    };

    let runs = std::mem::take(&mut run_set.runs);
    let total = runs.len();
    let queue: Mutex<VecDeque<(usize, Run)>> =
        Mutex::new(runs.into_iter().enumerate().collect());
    let results: Mutex<Vec<(usize, Run)>> = Mutex::new(Vec::with_capacity(total));

    let base_rlimits = limits_to_rlimits(benchmark.limits, config.core_limit);
    let start = Instant::now();

    std::thread::scope(|scope| {
        for worker_cores in core_assignments.iter() {
            let queue = &queue;
            let results = &results;
            let worker_cores = worker_cores.clone();
            std::thread::Builder::new()
                .name("bencheck worker".into())
                .spawn_scoped(scope, move || {
                    let slot = std::sync::Arc::new(RunningProcessSlot::new());
                    cancel.register(slot.clone());
                    loop {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let Some((index, mut run)) = queue.lock().expect("no poisoning").pop_front()
                        else {
                            return;
                        };
                        execute_one_run(
                            &mut run,
                            executable,
                            tool,
                            base_rlimits,
                            cgroup_mounts,
                            worker_cores.as_deref(),
                            config.max_log_size_bytes,
                            &slot,
                        );
                        on_complete(&run);
                        results.lock().expect("no poisoning").push((index, run));
                    }
                })
                .expect("spawning worker thread");
        }
    });

    let wall_time_s = start.elapsed().as_secs_f64();
    let mut results = results.into_inner().expect("no poisoning");
    results.sort_by_key(|(index, _)| *index);
    let runs_completed = results.iter().filter(|(_, r)| r.is_done()).count();
    let runs_cancelled = total - runs_completed;
    run_set.runs = results.into_iter().map(|(_, r)| r).collect();

    Ok(RunSetTiming {
        wall_time_s,
        runs_completed,
        runs_cancelled,
    })
}

fn execute_one_run(
    run: &mut Run,
    executable: &std::path::Path,
    tool: &dyn ToolInfo,
    base_rlimits: RLimits,
    cgroup_mounts: &CgroupMounts,
    assigned_cores: Option<&[u32]>,
    max_log_size_bytes: Option<u64>,
    slot: &RunningProcessSlot,
) {
    let outcome = match execute_run(
        run,
        executable,
        tool,
        base_rlimits,
        cgroup_mounts,
        assigned_cores,
        max_log_size_bytes,
        slot,
    ) {
        Ok(outcome) => outcome,
        Err(e) => {
            run.status = Some("error (could not start)".to_string());
            run.category = Some(crate::model::ResultCategory::Error);
            run.extra.insert("executor_error".to_string(), e.to_string());
            return;
        }
    };

    classify_and_record(run, tool, base_rlimits, &outcome);
}

/// Turns one finished execution's raw outcome into the `Run`'s result
/// fields: timing, classified status/category, column values, score.
/// Shared between the local engine and the cloud ingestion path (spec
/// §2 "In both modes, completion of each run invokes the same
/// post-execution classifier and aggregator").
pub fn classify_and_record(run: &mut Run, tool: &dyn ToolInfo, rlimits: RLimits, outcome: &ExecutionOutcome) {
    run.wall_time_s = Some(outcome.wall_time_s);
    run.cpu_time_s = outcome.cpu_time_s;
    run.mem_usage_bytes = outcome.mem_usage_bytes;
    if !outcome.warnings.is_empty() {
        run.extra.insert("executor_warnings".to_string(), outcome.warnings.join("; "));
    }

    let timeout = is_timeout(outcome, rlimits);
    let oom = is_oom(outcome, rlimits);

    let mut status = tool.determine_result(
        outcome.returncode,
        outcome.signal,
        &outcome.output_lines,
        timeout,
    );
    if timeout {
        status = "TIMEOUT".to_string();
    } else if oom {
        status = "OUT OF MEMORY".to_string();
    }

    tool.add_column_values(&outcome.output_lines, &mut run.columns);

    let task_file_name = run
        .sourcefiles
        .first()
        .map(|p| source_file_basename(p))
        .unwrap_or_else(|| run.identifier.clone());
    let property_content = run
        .property_file
        .as_ref()
        .and_then(|p| fs::read_to_string(p).ok());

    let category = get_result_category(&status, &task_file_name, property_content.as_deref());
    let score = calculate_score(category, &status);

    run.extra.insert("score".to_string(), score.to_string());
    run.status = Some(status);
    run.category = Some(category);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Limits;
    use crate::toolinfo::GenericExitCodeTool;
    use std::path::PathBuf;

    fn tmp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bencheck-local-engine-test-{}", rand::random::<u64>()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn t_runs_all_runs_and_preserves_order() {
        let dir = tmp_dir();
        let mut run_set = RunSet {
            display_name: "rs".into(),
            index: 1,
            options: vec![],
            property_files: vec![],
            source_file_sets: vec![],
            runs: (0..4)
                .map(|i| Run::new(format!("r{i}"), dir.join(format!("r{i}.log")), vec![]))
                .collect(),
            log_folder: dir.clone(),
        };

        let benchmark = Benchmark {
            name: "b".into(),
            timestamp: crate::serde::date_and_time::DateTimeWithOffset::now(),
            output_base: dir.join("out"),
            tool_name: "generic-exitcode".into(),
            tool_version: None,
            tool_executable: Some(PathBuf::from("/bin/true")),
            limits: Limits::default(),
            num_threads: 2,
            options: vec![],
            property_files: vec![],
            required_files: vec![],
            columns: vec![],
            run_sets: vec![],
            requirements: Default::default(),
        };
        let tool = GenericExitCodeTool {
            name: "generic-exitcode".into(),
            executable_name: "true".into(),
        };
        let cgroup_mounts = CgroupMounts::discover();
        let config = LocalEngineConfig {
            num_threads: 2,
            core_limit: None,
            max_log_size_bytes: None,
        };
        let cancel = CancelHandle::new();
        let completed = Mutex::new(0usize);
        let timing = run_run_set(&mut run_set, &benchmark, &tool, &cgroup_mounts, &config, &cancel, &|_run| {
            *completed.lock().unwrap() += 1;
        })
        .unwrap();

        assert_eq!(timing.runs_completed, 4);
        assert_eq!(*completed.lock().unwrap(), 4);
        let identifiers: Vec<_> = run_set.runs.iter().map(|r| r.identifier.clone()).collect();
        assert_eq!(identifiers, vec!["r0", "r1", "r2", "r3"]);
        for run in &run_set.runs {
            assert!(run.is_done());
        }
    }
}
