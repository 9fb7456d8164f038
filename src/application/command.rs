//! Renderer that shells out to an external program.
//!
//! The program is invoked as `<program> --job <job.json> --output <out.<format>>`
//! inside a scratch directory that is removed once the call returns.

use std::{
    fs,
    io::{self, ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use depthcast_api_types::JobConfig;
use tracing::{info, warn};

use super::renderer::{RenderError, Renderer};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_LIMIT: usize = 4096;
/// How long to wait for the stderr pipe to close once the program is gone.
/// Anything it left running may still hold the pipe open.
const STDERR_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: PathBuf,
    work_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)?;
        Ok(Self {
            program: program.into(),
            work_dir,
            timeout: None,
        })
    }

    /// Kill the program if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn spawn(&self, job_path: &Path, output_path: &Path) -> Result<Child, RenderError> {
        let mut command = Command::new(&self.program);
        // Own process group, so a timeout takes down whatever the program started.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
            .arg("--job")
            .arg(job_path)
            .arg("--output")
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                warn!(
                    target = "application::command",
                    op = "command::spawn",
                    result = "error",
                    program = %self.program.display(),
                    error = %err,
                    "Failed to spawn renderer"
                );
                if err.kind() == ErrorKind::NotFound {
                    RenderError::NotFound(err)
                } else {
                    RenderError::Io(err)
                }
            })
    }
}

impl Renderer for CommandRenderer {
    fn render(&self, job: &JobConfig) -> Result<Bytes, RenderError> {
        let started_at = Instant::now();
        let scratch = tempfile::Builder::new()
            .prefix("render-")
            .tempdir_in(&self.work_dir)?;

        let job_path = scratch.path().join("job.json");
        let encoded = serde_json::to_vec_pretty(job).map_err(io::Error::other)?;
        fs::write(&job_path, encoded)?;
        let output_path = scratch
            .path()
            .join(format!("output.{}", job.render.format.as_str()));

        let mut child = self.spawn(&job_path, &output_path)?;
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let mut captured = Vec::new();
                let _ = pipe.read_to_end(&mut captured);
                let _ = tx.send(captured);
            });
            rx
        });

        let status = match self.timeout {
            Some(limit) => wait_with_deadline(&mut child, limit)?,
            None => Some(child.wait()?),
        };
        // The reader thread is left behind if the pipe is still held open.
        let stderr = stderr_reader
            .and_then(|reader| reader.recv_timeout(STDERR_GRACE).ok())
            .map(|captured| tail_lossy(&captured))
            .unwrap_or_default();

        let Some(status) = status else {
            let limit = self.timeout.unwrap_or_default();
            warn!(
                target = "application::command",
                op = "command::render",
                result = "timed_out",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                timeout_ms = limit.as_millis() as u64,
                "Renderer exceeded its time limit and was killed"
            );
            return Err(RenderError::TimedOut(limit));
        };

        if !status.success() {
            let exit_code = status.code();
            warn!(
                target = "application::command",
                op = "command::render",
                result = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                stderr = %stderr,
                "Renderer exited unsuccessfully"
            );
            return Err(RenderError::Command { exit_code, stderr });
        }

        let bytes = match fs::read(&output_path) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return Err(RenderError::EmptyOutput),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(RenderError::EmptyOutput),
            Err(err) => return Err(RenderError::Io(err)),
        };

        info!(
            target = "application::command",
            op = "command::render",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            output_bytes = bytes.len(),
            format = %job.render.format,
            "Renderer finished"
        );
        Ok(Bytes::from(bytes))
    }
}

/// Wait for `child`, killing it once `limit` has passed. `None` means killed.
fn wait_with_deadline(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            kill_process_group(child)?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
    }
}

/// SIGKILL the process group the child leads (spawned with `process_group(0)`).
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return child.kill();
    };
    // Safety: killpg takes plain integers and touches no memory of ours.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // The whole group exited between the poll and the kill.
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        // Exited between the poll and the kill.
        Err(err) if err.kind() == ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err),
    }
}

fn tail_lossy(captured: &[u8]) -> String {
    let start = captured.len().saturating_sub(STDERR_LIMIT);
    String::from_utf8_lossy(&captured[start..]).trim().to_string()
}
