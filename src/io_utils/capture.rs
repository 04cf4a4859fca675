//! Merging a child process's stdout and stderr into a single log
//! file, one proxy thread per stream, with an optional source
//! indicator and timestamp per line. Grounds the run executor's
//! "stdout and stderr are merged into a single log file" contract.

use std::{
    borrow::Cow,
    ffi::OsStr,
    fs::File,
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread::{Scope, ScopedJoinHandle},
};

use anyhow::{anyhow, Result};

use crate::{ctx, serde::date_and_time::DateTimeWithOffset};

use super::bash::cmd_as_bash_string;

pub fn get_cmd_and_args(cmd: &Command) -> Vec<Cow<str>> {
    let prog_name = cmd.get_program().to_string_lossy();
    let mut args: Vec<_> = cmd
        .get_args()
        .map(|s: &OsStr| s.to_string_lossy())
        .collect();
    let mut cmd_and_args = vec![prog_name];
    cmd_and_args.append(&mut args);
    cmd_and_args
}

pub fn get_cmd_and_args_as_bash_string(cmd: &Command) -> String {
    cmd_as_bash_string(get_cmd_and_args(cmd))
}

pub fn new_proxy_thread<'scope, 'file, F: Read + Send + 'static>(
    scope: &'scope Scope<'scope, 'file>,
    child_output: F,
    main_file: Arc<Mutex<File>>,
    source_indicator: Option<&'file str>,
    add_timestamp: bool,
) -> Result<ScopedJoinHandle<'scope, Result<()>>>
where
    'file: 'scope,
{
    let mut child_output = BufReader::new(child_output);
    std::thread::Builder::new()
        .name("output proxy".into())
        .spawn_scoped(scope, move || -> Result<()> {
            // Two buffers because the timestamp can't be prepared
            // ahead of the blocking read_line call.
            let mut input_line = String::new();
            let mut line = String::new();
            while child_output.read_line(&mut input_line)? > 0 {
                {
                    line.clear();
                    if let Some(source_indicator) = source_indicator.as_ref() {
                        line.push_str(source_indicator);
                        line.push('\t');
                    }
                    if add_timestamp {
                        line.push_str(&DateTimeWithOffset::now().to_string());
                        line.push('\t');
                    }
                    line.push_str(&input_line);
                    input_line.clear();
                }
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                let mut output = main_file.lock().expect("no panics in proxy threads");
                output.write_all(line.as_bytes())?;
            }
            Ok(())
        })
        .map_err(move |e| anyhow!("{e}"))
}

#[derive(Clone, Debug, Default)]
pub struct CaptureOpts {
    pub add_source_indicator: bool,
    pub add_timestamp: bool,
}

/// A single log file that a subprocess's merged stdout/stderr is
/// captured into, plus helpers for truncated tail reads (used when
/// moving the file into place with a configured maximum size).
#[derive(Debug)]
pub struct OutFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl OutFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(ctx!("opening OutFile {path:?} for writing"))?;
        let path = path.to_owned();

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A clone of the underlying shared handle, for callers (e.g. the
    /// run executor) that drive their own proxy threads instead of
    /// going through `run_with_capture`.
    pub fn file_handle(&self) -> Arc<Mutex<File>> {
        self.file.clone()
    }

    /// The last `len` bytes, decoded as utf8 lossily, with "...\n"
    /// prepended if that is not the whole output in the file.
    pub fn last_part(&self, len: u64) -> Result<String> {
        let mut v = Vec::new();
        let have_all;
        {
            let mut file =
                File::open(&self.path).map_err(ctx!("re-opening {:?} for reading", self.path))?;
            let meta = file.metadata().map_err(ctx!("metadata"))?;
            let existing_len = meta.len();
            let offset = if let Some(offset) = existing_len.checked_sub(len) {
                have_all = false;
                offset
            } else {
                have_all = true;
                0
            };
            file.seek(SeekFrom::Start(offset)).map_err(ctx!("seek"))?;
            file.read_to_end(&mut v)
                .map_err(ctx!("reading {:?}", self.path))?;
        }
        let s = String::from_utf8_lossy(&v);
        if have_all {
            Ok(s.into())
        } else {
            Ok(format!("...\n{s}"))
        }
    }

    /// Truncate the file on disk to at most `max_bytes`, keeping the
    /// tail. No-op if the file is already within the limit.
    pub fn truncate_to_tail(&self, max_bytes: u64) -> Result<()> {
        let kept = self.last_part(max_bytes)?;
        let mut file = File::create(&self.path).map_err(ctx!("truncating {:?}", self.path))?;
        file.write_all(kept.as_bytes())
            .map_err(ctx!("writing truncated {:?}", self.path))
    }

    pub fn write_str(&self, s: &str) -> Result<()> {
        self.file
            .lock()
            .expect("no panics")
            .write_all(s.as_bytes())
            .map_err(ctx!("writing to {:?}", self.path))
    }

    /// Spawn `cmd` with stdout and stderr piped, proxy both into this
    /// file (interleaved, each line tagged with `O`/`E` and optionally
    /// a timestamp), and wait for completion.
    pub fn run_with_capture(&self, mut cmd: Command, opts: CaptureOpts) -> Result<ExitStatus> {
        let CaptureOpts {
            add_source_indicator,
            add_timestamp,
        } = opts;

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ctx!("running {}", get_cmd_and_args_as_bash_string(&cmd)))?;

        std::thread::scope(move |scope| -> Result<ExitStatus> {
            let stdout_thread = new_proxy_thread(
                scope,
                child.stdout.take().expect("configured above"),
                self.file.clone(),
                if add_source_indicator {
                    Some("O")
                } else {
                    None
                },
                add_timestamp,
            )?;
            let stderr_thread = new_proxy_thread(
                scope,
                child.stderr.take().expect("configured above"),
                self.file.clone(),
                if add_source_indicator {
                    Some("E")
                } else {
                    None
                },
                add_timestamp,
            )?;

            let status = child.wait()?;

            stdout_thread
                .join()
                .map_err(|e| anyhow!("stdout proxy thread panicked: {e:?}"))?
                .map_err(ctx!("stdout proxy thread"))?;
            stderr_thread
                .join()
                .map_err(|e| anyhow!("stderr proxy thread panicked: {e:?}"))?
                .map_err(ctx!("stderr proxy thread"))?;

            Ok(status)
        })
    }
}
