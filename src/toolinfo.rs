//! Tool plug-in interface (spec §4.4): every verifier is a pluggable
//! implementation of this capability set. The driver treats unknown
//! status strings from `determine_result` as category `error` (this
//! is enforced by the classifier, not here -- the plug-in is free to
//! return any string).

use std::path::{Path, PathBuf};

use crate::model::{Column, Requirements};

/// Environment mutations a plug-in wants applied to the child process
/// only: variables to set outright, to prepend to, and to append to.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentMutations {
    pub set: Vec<(String, String)>,
    pub prepend: Vec<(String, String)>,
    pub append: Vec<(String, String)>,
}

/// rlimits/requirements known at command-line-construction time; the
/// plug-in may need them to build the right invocation (e.g. a
/// `--timeout` flag mirroring the hard limit).
#[derive(Debug, Clone, Copy, Default)]
pub struct RLimits {
    pub memlimit_mb: Option<u64>,
    pub hardtimelimit_s: Option<u64>,
    pub softtimelimit_s: Option<u64>,
    pub cpu_cores: Option<u32>,
}

pub trait ToolInfo: Send + Sync {
    /// Locate the binary, searching PATH plus a plug-in-chosen
    /// fallback. Must error clearly if missing, unless
    /// `no_local_executable` mode is in effect (remote-only; the
    /// caller skips this call entirely in that mode).
    fn executable(&self) -> anyhow::Result<PathBuf>;

    /// Optional; `None` if the tool has no easily queryable version.
    fn version(&self, _executable: &Path) -> Option<String> {
        None
    }

    fn name(&self) -> &str;

    /// Pure, deterministic; no I/O.
    fn cmdline(
        &self,
        executable: &Path,
        options: &[String],
        sourcefiles: &[PathBuf],
        property_file: Option<&Path>,
        rlimits: RLimits,
    ) -> Vec<String>;

    fn working_directory(&self, _executable: &Path) -> Option<PathBuf> {
        None
    }

    fn environments(&self, _executable: &Path) -> EnvironmentMutations {
        EnvironmentMutations::default()
    }

    fn program_files(&self, _executable: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Parses the recorded log; must be a pure function of its
    /// arguments. `is_timeout` reflects whether the executor already
    /// classified the run as a timeout (see §4.5's timeout
    /// reclassification, applied by the caller after this call).
    fn determine_result(
        &self,
        returncode: Option<i32>,
        signal: Option<i32>,
        output_lines: &[String],
        is_timeout: bool,
    ) -> String;

    /// Fills column `value` fields by pattern matching. Default: first
    /// line containing the pattern, extract the trailing `: value`
    /// part.
    fn add_column_values(&self, output_lines: &[String], columns: &mut [Column]) {
        for column in columns.iter_mut() {
            if let Some(line) = output_lines.iter().find(|l| l.contains(&column.pattern)) {
                column.value = extract_trailing_value(line, &column.pattern);
            }
        }
    }

    /// Resource requirements the remote adapter should request for
    /// this tool beyond the benchmark's own limits; most tools leave
    /// this at the default (derived entirely from the benchmark's
    /// resource limits, per spec §3 Requirements "missing values
    /// default to the corresponding resource limit").
    fn requirements(&self) -> Requirements {
        Requirements::default()
    }
}

fn extract_trailing_value(line: &str, pattern: &str) -> Option<String> {
    let after_pattern = line.split_once(pattern)?.1;
    let value = after_pattern.split_once(':').map(|(_, v)| v).unwrap_or(after_pattern);
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// A minimal, generic plug-in suitable for any tool whose result is
/// just its exit status: "true" for code 0, "false" for non-zero and
/// no signal, "unknown" if killed by a signal other than timeout/OOM.
/// Used as the default/fallback and in tests; real deployments
/// register specific plug-ins for their verifiers.
pub struct GenericExitCodeTool {
    pub name: String,
    pub executable_name: String,
}

impl ToolInfo for GenericExitCodeTool {
    fn executable(&self) -> anyhow::Result<PathBuf> {
        which(&self.executable_name)
            .ok_or_else(|| anyhow::anyhow!("executable {:?} not found on PATH", self.executable_name))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cmdline(
        &self,
        executable: &Path,
        options: &[String],
        sourcefiles: &[PathBuf],
        property_file: Option<&Path>,
        _rlimits: RLimits,
    ) -> Vec<String> {
        let mut argv = vec![executable.to_string_lossy().into_owned()];
        argv.extend(options.iter().cloned());
        if let Some(p) = property_file {
            argv.push("--property".into());
            argv.push(p.to_string_lossy().into_owned());
        }
        argv.extend(sourcefiles.iter().map(|p| p.to_string_lossy().into_owned()));
        argv
    }

    fn determine_result(
        &self,
        returncode: Option<i32>,
        signal: Option<i32>,
        _output_lines: &[String],
        is_timeout: bool,
    ) -> String {
        if is_timeout {
            return "TIMEOUT".to_string();
        }
        if signal.is_some() {
            return "unknown".to_string();
        }
        match returncode {
            Some(0) => "true".to_string(),
            Some(_) => "false".to_string(),
            None => "unknown".to_string(),
        }
    }
}

/// Looks a binary up on `PATH`, mirroring what a plug-in's
/// `executable()` implementation typically does.
pub fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(name);
        candidate.is_file().then_some(candidate)
    })
}

/// Registry mapping tool-name string to a constructor, replacing
/// spec §9's "dynamic module lookup" design note: new tools are
/// registered at compile time rather than discovered via a plug-in
/// loader.
pub struct ToolRegistry {
    tools: Vec<(&'static str, fn() -> Box<dyn ToolInfo>)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, name: &'static str, constructor: fn() -> Box<dyn ToolInfo>) {
        self.tools.push((name, constructor));
    }

    pub fn lookup(&self, name: &str) -> anyhow::Result<Box<dyn ToolInfo>> {
        self.tools
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, constructor)| constructor())
            .ok_or_else(|| anyhow::anyhow!("unknown tool {name:?}"))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        let mut reg = Self::new();
        reg.register("generic-exitcode", || {
            Box::new(GenericExitCodeTool {
                name: "generic-exitcode".into(),
                executable_name: "true".into(),
            })
        });
        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_extract_trailing_value() {
        assert_eq!(
            extract_trailing_value("Memory usage: 12345", "Memory usage"),
            Some("12345".to_string())
        );
        assert_eq!(extract_trailing_value("no match here", "Memory usage"), None);
    }

    #[test]
    fn t_generic_tool_determine_result() {
        let tool = GenericExitCodeTool {
            name: "t".into(),
            executable_name: "true".into(),
        };
        assert_eq!(tool.determine_result(Some(0), None, &[], false), "true");
        assert_eq!(tool.determine_result(Some(1), None, &[], false), "false");
        assert_eq!(tool.determine_result(None, Some(9), &[], false), "unknown");
        assert_eq!(tool.determine_result(None, Some(9), &[], true), "TIMEOUT");
    }
}
