//! The run-definition expander (spec §4.1): turns one parsed
//! `XmlBenchmark` into a fully populated `model::Benchmark` with every
//! `RunSet` and `Run` materialized. Pure with respect to the
//! filesystem except for the glob/`<includesfile>`/directory-expansion
//! reads spec §4.1-§4.2 call for.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    model::{Benchmark, Column, Limits, Requirements, Run, RunSet, SourceFileSet},
    serde::date_and_time::DateTimeWithOffset,
    substitution::{self, BenchmarkContext, SourceFileContext},
    toolinfo::ToolInfo,
    xml_model::{XmlBenchmark, XmlOption, XmlRunDefinition, XmlSourcefiles},
};

#[derive(Debug, Error)]
pub enum ExpanderError {
    #[error("benchmark {0:?} requested re-processing is disabled and its output directory already exists: {1:?}")]
    OutputDirectoryExists(String, PathBuf),
    #[error("<require> may be specified at most once, found {0}")]
    DuplicateRequire(usize),
    #[error("includesfile {0:?}: {1}")]
    Includesfile(PathBuf, anyhow::Error),
    #[error("tool resolution failed: {0}")]
    Tool(anyhow::Error),
    #[error("invalid limit value {0:?}")]
    InvalidLimit(String),
}

/// CLI-level overrides applied during expansion (spec §6.4). Every
/// field mirrors one driver flag; `None` means "use the XML value or
/// the built-in default".
#[derive(Debug, Clone, Default)]
pub struct ExpandOverrides {
    pub name: Option<String>,
    pub output_path: Option<PathBuf>,
    pub timelimit_s: Option<i64>,
    pub memorylimit_mb: Option<i64>,
    pub num_threads: Option<u32>,
    pub limit_cores: Option<u32>,
    pub restrict_rundefinitions: Vec<String>,
    pub restrict_sourcefiles: Vec<String>,
    pub modulo_and_rest: Option<(u32, u32)>,
    pub cloud_cpu_model: Option<String>,
    pub allow_reprocessing: bool,
}

/// Applies a `-1`-removes-limit sentinel (spec §8 boundary behavior).
fn apply_sentinel(value: i64) -> Option<u64> {
    if value < 0 {
        None
    } else {
        Some(value as u64)
    }
}

fn parse_xml_limit(raw: &str) -> Result<Option<u64>, ExpanderError> {
    let n: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ExpanderError::InvalidLimit(raw.to_string()))?;
    Ok(apply_sentinel(n))
}

pub struct ExpandResult {
    pub benchmark: Benchmark,
    pub warnings: Vec<String>,
}

pub fn expand_benchmark(
    xml_path: &Path,
    xml: &XmlBenchmark,
    tool: &dyn ToolInfo,
    no_local_executable: bool,
    overrides: &ExpandOverrides,
) -> Result<ExpandResult, anyhow::Error> {
    let mut warnings = Vec::new();
    let benchmark_dir = xml_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let name = overrides
        .name
        .clone()
        .or_else(|| xml.name.clone())
        .unwrap_or_else(|| {
            xml_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "benchmark".to_string())
        });
    let timestamp = DateTimeWithOffset::now();
    let output_base = overrides
        .output_path
        .clone()
        .unwrap_or_else(|| benchmark_dir.join(format!("{name}.results")));

    // Limit resolution (spec §4.1 step 3).
    let memlimit_mb = match overrides.memorylimit_mb {
        Some(v) => apply_sentinel(v),
        None => match &xml.memlimit {
            Some(raw) => parse_xml_limit(raw)?,
            None => None,
        },
    };
    let hardtimelimit_s = match &xml.hardtimelimit {
        Some(raw) => parse_xml_limit(raw)?,
        None => None,
    };
    let softtimelimit_from_xml = match &xml.timelimit {
        Some(raw) => parse_xml_limit(raw)?,
        None => None,
    };
    let softtimelimit_s = match overrides.timelimit_s {
        Some(v) => apply_sentinel(v),
        None => softtimelimit_from_xml,
    };
    let cpu_cores = overrides.limit_cores.or(xml.cpu_cores);
    let (limits, soft_warning) = Limits {
        memlimit_mb,
        hardtimelimit_s,
        softtimelimit_s,
        cpu_cores,
    }
    .normalized();
    warnings.extend(soft_warning);

    // Requirements (spec §3 Requirements).
    if xml.require.len() > 1 {
        return Err(ExpanderError::DuplicateRequire(xml.require.len()).into());
    }
    let xml_require = xml.require.first();
    let requirements = Requirements {
        cpu_model: overrides
            .cloud_cpu_model
            .clone()
            .or_else(|| xml_require.and_then(|r| r.cpu_model.clone())),
        cpu_cores: xml_require
            .and_then(|r| r.cpu_cores)
            .or(limits.cpu_cores),
        memory_mb: xml_require
            .and_then(|r| r.memory)
            .or(limits.memlimit_mb),
    };

    let num_threads = overrides.num_threads.or(xml.threads).unwrap_or(1).max(1);

    // Tool resolution (spec §4.1 step 2).
    let (tool_executable, tool_version) = if no_local_executable {
        (None, None)
    } else {
        let exe = tool.executable().map_err(ExpanderError::Tool)?;
        let version = tool.version(&exe);
        (Some(exe), version)
    };

    let global_options: Vec<String> = flatten_options(&xml.options);
    let global_property_files: Vec<PathBuf> =
        xml.property_files.iter().map(|p| benchmark_dir.join(p)).collect();
    let mut global_required_files = expand_required_files(&xml.required_files, &benchmark_dir, &mut warnings);

    let columns: Vec<Column> = xml
        .columns
        .column
        .iter()
        .map(|c| {
            let pattern = c.pattern.clone().unwrap_or_default();
            let title = c.title.clone().unwrap_or_else(|| pattern.clone());
            Column::new(pattern, title, c.number_of_digits)
        })
        .collect();

    let instance_dir_hint = {
        let mut s = output_base.as_os_str().to_owned();
        s.push(".");
        s.push(timestamp.to_filename_safe_string());
        PathBuf::from(s)
    };

    let benchmark_ctx = BenchmarkContext {
        benchmark_name: name.clone(),
        benchmark_date: timestamp.clone(),
        benchmark_instance: timestamp.to_filename_safe_string(),
        benchmark_path: benchmark_dir.clone(),
        benchmark_path_abs: absolutize(&benchmark_dir),
        benchmark_file: xml_path.to_path_buf(),
        benchmark_file_abs: absolutize(xml_path),
        logfile_path: instance_dir_hint.join(format!("{}.logfiles", name)),
        logfile_path_abs: absolutize(&instance_dir_hint.join(format!("{}.logfiles", name))),
        rundefinition_name: String::new(),
    };

    let mut benchmark = Benchmark {
        name: name.clone(),
        timestamp: timestamp.clone(),
        output_base: output_base.clone(),
        tool_name: tool.name().to_string(),
        tool_version,
        tool_executable,
        limits,
        num_threads,
        options: global_options.clone(),
        property_files: global_property_files.clone(),
        required_files: Vec::new(),
        columns,
        run_sets: Vec::new(),
        requirements,
    };

    if benchmark.instance_dir().exists() && !overrides.allow_reprocessing {
        return Err(ExpanderError::OutputDirectoryExists(name, benchmark.instance_dir()).into());
    }

    let rundefinitions = xml.all_rundefinitions();
    for (zero_based, rundef) in rundefinitions.iter().enumerate() {
        let index = (zero_based + 1) as u32;
        let display_name = rundef
            .name
            .clone()
            .unwrap_or_else(|| format!("rundefinition-{index}"));

        if !overrides.restrict_rundefinitions.is_empty()
            && !overrides.restrict_rundefinitions.contains(&display_name)
        {
            continue;
        }
        if let Some((modulo, rest)) = overrides.modulo_and_rest {
            if index % modulo != rest {
                crate::info!("skipping run set {display_name:?} (index {index} does not satisfy modulo filter)");
                continue;
            }
        }

        let mut rundef_ctx = benchmark_ctx.clone();
        rundef_ctx.rundefinition_name = display_name.clone();

        let rundef_options = flatten_options(&rundef.options);
        let rundef_property_files: Vec<PathBuf> =
            rundef.property_files.iter().map(|p| benchmark_dir.join(p)).collect();
        let rundef_required_files =
            expand_required_files(&rundef.required_files, &benchmark_dir, &mut warnings);

        let log_folder = benchmark.instance_dir().join(format!("{name}.{display_name}.logfiles"));

        let mut source_file_sets = Vec::new();
        let mut runs = Vec::new();

        let all_blocks: Vec<&XmlSourcefiles> = xml.sourcefiles.iter().chain(rundef.sourcefiles.iter()).collect();
        for block in all_blocks {
            if !overrides.restrict_sourcefiles.is_empty() {
                if let Some(block_name) = &block.name {
                    if !overrides.restrict_sourcefiles.contains(block_name) {
                        continue;
                    }
                } else {
                    continue;
                }
            }

            let (set, set_runs) = expand_sourcefiles_block(
                block,
                &benchmark_dir,
                &rundef_ctx,
                &global_options,
                &rundef_options,
                &global_property_files,
                &rundef_property_files,
                &global_required_files,
                &rundef_required_files,
                &benchmark.columns,
                &log_folder,
                &mut warnings,
            )?;
            runs.extend(set_runs);
            source_file_sets.push(set);
        }

        if runs.is_empty() {
            warnings.push(format!("run set {display_name:?} produced no runs, skipping"));
            continue;
        }

        let run_set = RunSet {
            display_name: display_name.clone(),
            index,
            options: [global_options.clone(), rundef_options].concat(),
            property_files: [global_property_files.clone(), rundef_property_files].concat(),
            source_file_sets,
            runs,
            log_folder,
        };

        let dups = run_set.duplicate_log_basenames();
        if !dups.is_empty() {
            warnings.push(format!(
                "run set {display_name:?} has duplicate log file basenames: {dups:?}"
            ));
        }

        for run in &run_set.runs {
            if let Some(p) = &run.property_file {
                if p.is_file() && !global_required_files.contains(p) {
                    global_required_files.push(p.clone());
                }
            }
        }

        benchmark.run_sets.push(run_set);
    }

    benchmark.required_files = global_required_files;

    Ok(ExpandResult { benchmark, warnings })
}

fn absolutize(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(p)).unwrap_or_else(|_| p.to_path_buf())
    }
}

/// `<option name="…">value</option>`: both name and body become
/// separate argv items, nulls skipped (spec §6.1).
fn flatten_options(options: &[XmlOption]) -> Vec<String> {
    let mut out = Vec::new();
    for opt in options {
        if let Some(name) = &opt.name {
            out.push(name.clone());
        }
        if let Some(value) = &opt.value {
            let trimmed = value.trim();
            if !trimmed.is_empty() && trimmed != "null" {
                out.push(trimmed.to_string());
            }
        }
    }
    out
}

fn expand_required_files(patterns: &[String], base_dir: &Path, warnings: &mut Vec<String>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for pattern in patterns {
        match substitution::glob_expand(pattern, base_dir) {
            Ok(paths) => {
                if paths.is_empty() {
                    warnings.push(format!("requiredfiles pattern {pattern:?} matched nothing"));
                }
                for p in paths {
                    if !out.contains(&p) {
                        out.push(p);
                    }
                }
            }
            Err(e) => warnings.push(format!("requiredfiles pattern {pattern:?}: {e}")),
        }
    }
    out
}

/// Expands one `<sourcefiles>` block's include/exclude/withoutfile/
/// append entries into concrete runs (spec §4.1 step 4-5).
#[allow(clippy::too_many_arguments)]
fn expand_sourcefiles_block(
    block: &XmlSourcefiles,
    benchmark_dir: &Path,
    rundef_ctx: &BenchmarkContext,
    global_options: &[String],
    rundef_options: &[String],
    global_property_files: &[PathBuf],
    rundef_property_files: &[PathBuf],
    global_required_files: &[PathBuf],
    rundef_required_files: &[PathBuf],
    benchmark_columns: &[Column],
    log_folder: &Path,
    warnings: &mut Vec<String>,
) -> Result<(SourceFileSet, Vec<Run>), anyhow::Error> {
    let mut include_patterns: Vec<String> = block.include.clone();
    for file in &block.includesfile {
        let path = benchmark_dir.join(file);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ExpanderError::Includesfile(path.clone(), e.into()))?;
        let lines = substitution::parse_includesfile(&content)
            .map_err(|e| ExpanderError::Includesfile(path.clone(), e))?;
        include_patterns.extend(lines);
    }

    let mut included = Vec::new();
    for pattern in &include_patterns {
        let substituted = substitution::substitute_benchmark(pattern, rundef_ctx);
        if let Some(w) = substituted.warning {
            warnings.push(w);
        }
        let matches = substitution::glob_expand(&substituted.text, benchmark_dir)?;
        if matches.is_empty() {
            warnings.push(format!("include pattern {pattern:?} matched nothing"));
        }
        for m in matches {
            included.push(m);
        }
    }

    let mut exclude_patterns: Vec<String> = block.exclude.clone();
    for file in &block.excludesfile {
        let path = benchmark_dir.join(file);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ExpanderError::Includesfile(path.clone(), e.into()))?;
        exclude_patterns.extend(substitution::parse_includesfile(&content).map_err(|e| ExpanderError::Includesfile(path.clone(), e))?);
    }
    let mut excluded: HashSet<PathBuf> = HashSet::new();
    for pattern in &exclude_patterns {
        let substituted = substitution::substitute_benchmark(pattern, rundef_ctx);
        for m in substitution::glob_expand(&substituted.text, benchmark_dir)? {
            excluded.insert(m);
        }
    }
    let mut seen_files = HashSet::new();
    let mut informational_dupes = Vec::new();
    let primary_files: Vec<PathBuf> = included
        .into_iter()
        .filter(|p| !excluded.contains(p))
        .filter(|p| {
            if !seen_files.insert(p.clone()) {
                informational_dupes.push(p.clone());
                false
            } else {
                true
            }
        })
        .collect();
    for dup in &informational_dupes {
        crate::info!("duplicate source file {dup:?} in sourcefiles block, keeping first occurrence");
    }

    let block_options = flatten_options(&block.options);
    let block_property_files: Vec<PathBuf> = block.property_files.iter().map(|p| benchmark_dir.join(p)).collect();
    let block_required_files = expand_required_files(&block.required_files, benchmark_dir, warnings);

    let set_property_file = last_wins(&[&block_property_files, rundef_property_files, global_property_files]);

    let set = SourceFileSet {
        name: block.name.clone(),
        sourcefiles: primary_files.clone(),
        options: block_options.clone(),
        property_file: set_property_file.clone(),
        required_files: block_required_files.clone(),
    };

    let mut runs = Vec::new();

    // Synthetic `<withoutfile>` runs: no concrete primary file.
    for literal in &block.withoutfile {
        let run = build_run(
            literal.clone(),
            None,
            &[],
            rundef_ctx,
            global_options,
            rundef_options,
            &block_options,
            &set_property_file,
            global_required_files,
            rundef_required_files,
            &block_required_files,
            benchmark_columns,
            log_folder,
            block.name.as_deref(),
        )?;
        runs.push(run);
    }

    for primary in &primary_files {
        let identifier = primary.to_string_lossy().into_owned();
        let sourcefile_ctx = SourceFileContext {
            benchmark: rundef_ctx,
            sourcefile_name: crate::model::source_file_basename(primary),
            sourcefile_path: primary.clone(),
            sourcefile_path_abs: absolutize(primary),
        };

        let mut appended = Vec::new();
        for pattern in &block.append {
            let substituted = substitution::substitute_sourcefile(pattern, &sourcefile_ctx);
            if let Some(w) = substituted.warning {
                warnings.push(w);
            }
            for m in substitution::glob_expand(&substituted.text, benchmark_dir)? {
                appended.push(m);
            }
        }

        let mut all_sourcefiles = vec![primary.clone()];
        all_sourcefiles.extend(expand_directories(&appended));

        let run = build_run(
            identifier,
            Some(primary.clone()),
            &all_sourcefiles,
            rundef_ctx,
            global_options,
            rundef_options,
            &block_options,
            &set_property_file,
            global_required_files,
            rundef_required_files,
            &block_required_files,
            benchmark_columns,
            log_folder,
            block.name.as_deref(),
        )?;
        runs.push(run);
    }

    Ok((set, runs))
}

/// Recursively expands any directory entries into the files they
/// contain, excluding dotfiles (spec §3 Run.sourcefiles).
fn expand_directories(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for p in paths {
        if p.is_dir() {
            for entry in walkdir::WalkDir::new(p)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if entry
                    .file_name()
                    .to_str()
                    .map(|s| s.starts_with('.'))
                    .unwrap_or(false)
                {
                    continue;
                }
                out.push(entry.into_path());
            }
        } else {
            out.push(p.clone());
        }
    }
    out
}

fn last_wins(scopes: &[&[PathBuf]]) -> Option<PathBuf> {
    for scope in scopes {
        if let Some(last) = scope.last() {
            return Some(last.clone());
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn build_run(
    identifier: String,
    primary: Option<PathBuf>,
    sourcefiles: &[PathBuf],
    ctx: &BenchmarkContext,
    global_options: &[String],
    rundef_options: &[String],
    block_options: &[String],
    property_file: &Option<PathBuf>,
    global_required_files: &[PathBuf],
    rundef_required_files: &[PathBuf],
    block_required_files: &[PathBuf],
    benchmark_columns: &[Column],
    log_folder: &Path,
    set_name: Option<&str>,
) -> Result<Run, anyhow::Error> {
    let raw_options: Vec<String> = [global_options, rundef_options, block_options].concat();
    let mut resolved_options = Vec::with_capacity(raw_options.len());
    if let Some(primary) = &primary {
        let sourcefile_ctx = SourceFileContext {
            benchmark: ctx,
            sourcefile_name: crate::model::source_file_basename(primary),
            sourcefile_path: primary.clone(),
            sourcefile_path_abs: absolutize(primary),
        };
        for raw in raw_options {
            resolved_options.push(substitution::substitute_sourcefile(&raw, &sourcefile_ctx).text);
        }
    } else {
        for raw in raw_options {
            resolved_options.push(substitution::substitute_benchmark(&raw, ctx).text);
        }
    }

    let mut required_files: Vec<PathBuf> = Vec::new();
    for scope in [global_required_files, rundef_required_files, block_required_files] {
        for f in scope {
            if !required_files.contains(f) {
                required_files.push(f.clone());
            }
        }
    }
    if let Some(p) = property_file {
        if !required_files.contains(p) {
            required_files.push(p.clone());
        }
    }

    let log_basename = crate::model::source_file_basename(Path::new(&identifier));
    let log_file_name = match set_name {
        Some(name) => format!("{name}.{log_basename}.log"),
        None => format!("{log_basename}.log"),
    };
    let log_file = log_folder.join(log_file_name);

    let mut run = Run::new(identifier, log_file, benchmark_columns.to_vec());
    run.sourcefiles = sourcefiles.to_vec();
    run.options = resolved_options;
    run.property_file = property_file.clone();
    run.required_files = required_files;
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolinfo::GenericExitCodeTool;
    use std::io::Write;

    fn write_tmp(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn t_scenario_1_single_safe_file_expands_to_one_run() {
        let dir = tempdir();
        write_tmp(&dir, "a_true-unreach-call.c", "int main() {}");
        write_tmp(
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
        let xml_path = write_tmp(&dir, "bench.xml", xml_text);
        let xml = XmlBenchmark::from_str(xml_text).unwrap();
        let tool = GenericExitCodeTool {
            name: "generic-exitcode".into(),
            executable_name: "true".into(),
        };
        let overrides = ExpandOverrides::default();
        let result = expand_benchmark(&xml_path, &xml, &tool, true, &overrides).unwrap();
        assert_eq!(result.benchmark.run_sets.len(), 1);
        assert_eq!(result.benchmark.run_sets[0].runs.len(), 1);
        let run = &result.benchmark.run_sets[0].runs[0];
        assert!(run.identifier.ends_with("a_true-unreach-call.c"));
        assert!(run.property_file.is_some());
    }

    #[test]
    fn t_moduloandrest_selects_subset() {
        let dir = tempdir();
        write_tmp(&dir, "a.c", "");
        let xml_text = r#"
            <benchmark tool="generic-exitcode">
                <rundefinition name="r1"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
                <rundefinition name="r2"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
                <rundefinition name="r3"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
                <rundefinition name="r4"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
            </benchmark>
        "#;
        let xml_path = write_tmp(&dir, "bench.xml", xml_text);
        let xml = XmlBenchmark::from_str(xml_text).unwrap();
        let tool = GenericExitCodeTool {
            name: "generic-exitcode".into(),
            executable_name: "true".into(),
        };
        let overrides = ExpandOverrides {
            modulo_and_rest: Some((2, 0)),
            ..Default::default()
        };
        let result = expand_benchmark(&xml_path, &xml, &tool, true, &overrides).unwrap();
        let names: Vec<&str> = result
            .benchmark
            .run_sets
            .iter()
            .map(|rs| rs.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["r2", "r4"]);
    }

    #[test]
    fn t_refuses_existing_output_dir_without_reprocessing() {
        let dir = tempdir();
        write_tmp(&dir, "a.c", "");
        let xml_text = r#"
            <benchmark tool="generic-exitcode">
                <rundefinition name="r1"><sourcefiles><include>a.c</include></sourcefiles></rundefinition>
            </benchmark>
        "#;
        let xml_path = write_tmp(&dir, "bench.xml", xml_text);
        let xml = XmlBenchmark::from_str(xml_text).unwrap();
        let tool = GenericExitCodeTool {
            name: "generic-exitcode".into(),
            executable_name: "true".into(),
        };
        let overrides = ExpandOverrides::default();
        let result = expand_benchmark(&xml_path, &xml, &tool, true, &overrides).unwrap();
        std::fs::create_dir_all(result.benchmark.instance_dir()).unwrap();

        let again = expand_benchmark(&xml_path, &xml, &tool, true, &overrides);
        assert!(again.is_err());
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bencheck-expand-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
