use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use judge_contracts::SANDBOX_PROTOCOL_VERSION;

use crate::capture::{
    spawn_capture, spawn_frame_reader, spawn_frame_writer, CapturedStream, Frame,
};
use crate::limits::{self, ChildLimits};
use crate::workdir::WorkDir;
use crate::{CancelToken, SandboxConfig, SourceUnit};

const DRIVER_PY: &str = include_str!("driver.py");

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const EXIT_GRACE: Duration = Duration::from_millis(100);

const CHILD_ENV: &[(&str, &str)] = &[
    ("PYTHONHASHSEED", "0"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("LC_ALL", "C.UTF-8"),
];

pub(crate) enum Wait {
    Frame(Frame),
    Closed,
    TimedOut,
    Cancelled,
}

/// How a context's process ended.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Exit {
    Code(i32),
    Signal(i32),
    /// Still running when we gave up waiting and killed it.
    Killed,
    Unknown,
}

impl Exit {
    fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt as _;
        match (status.code(), status.signal()) {
            (Some(code), _) => Exit::Code(code),
            (None, Some(sig)) => Exit::Signal(sig),
            (None, None) => Exit::Unknown,
        }
    }

    pub(crate) fn is_resource_kill(self) -> bool {
        matches!(self, Exit::Signal(sig) if limits::is_resource_signal(sig))
    }

    pub(crate) fn describe(self) -> String {
        match self {
            Exit::Code(code) => format!("sandbox process exited with status {code}"),
            Exit::Signal(sig) if sig == libc::SIGXCPU => "cpu time limit exceeded".to_string(),
            Exit::Signal(sig) if sig == libc::SIGKILL => {
                "sandbox process was killed (memory limit exceeded)".to_string()
            }
            Exit::Signal(sig) => format!("sandbox process terminated by signal {sig}"),
            Exit::Killed => {
                "sandbox process closed its protocol stream but did not exit; killed".to_string()
            }
            Exit::Unknown => "sandbox process exited".to_string(),
        }
    }
}

/// One live child process running the driver with a loaded submission.
pub(crate) struct Context {
    child: Child,
    requests: Option<Sender<String>>,
    frames: Receiver<Frame>,
    stderr: Arc<CapturedStream>,
    stderr_thread: Option<JoinHandle<()>>,
    reaped: Option<ExitStatus>,
    _workdir: WorkDir,
}

impl Context {
    pub(crate) fn spawn(source: &SourceUnit, config: &SandboxConfig) -> Result<Self> {
        config.validate()?;
        let interpreter = resolve_program(&config.interpreter)?;

        let workdir = WorkDir::new("judge_ctx").context("create sandbox work dir")?;
        let driver = workdir.write_file("driver.py", DRIVER_PY.as_bytes())?;
        let solution = workdir.write_file("solution.py", source.as_str().as_bytes())?;
        workdir.seal()?;

        let mut cmd = Command::new(&interpreter);
        cmd.arg("-s")
            .arg("-B")
            .arg(&driver)
            .arg(SANDBOX_PROTOCOL_VERSION)
            .arg(&config.entry_point)
            .arg(&solution);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env_clear();
        cmd.envs(CHILD_ENV.iter().copied());
        cmd.current_dir(workdir.path());

        {
            use std::os::unix::process::CommandExt as _;
            let child_limits = ChildLimits {
                cpu_seconds: config.cpu_time_limit_seconds,
                address_space_bytes: config.max_memory_bytes,
                open_files: config.max_open_files,
                max_processes: config.max_processes,
                isolate_namespaces: config.backend.unshares_namespaces(),
            };
            unsafe {
                cmd.pre_exec(move || limits::apply_child_limits(&child_limits));
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn interpreter: {}", interpreter.display()))?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            abandon(&mut child);
            anyhow::bail!("sandbox child is missing a stdio pipe");
        };
        let requests = match spawn_frame_writer(stdin) {
            Ok(tx) => tx,
            Err(err) => {
                abandon(&mut child);
                return Err(err).context("spawn protocol writer thread");
            }
        };
        let frames = match spawn_frame_reader(stdout, config.max_output_bytes) {
            Ok(rx) => rx,
            Err(err) => {
                abandon(&mut child);
                return Err(err).context("spawn protocol reader thread");
            }
        };
        let (stderr, stderr_thread) = match spawn_capture(stderr, config.max_output_bytes) {
            Ok(capture) => capture,
            Err(err) => {
                abandon(&mut child);
                return Err(err).context("spawn stderr capture thread");
            }
        };

        tracing::debug!(
            pid = child.id(),
            backend = %config.backend,
            "sandbox context started"
        );
        Ok(Self {
            child,
            requests: Some(requests),
            frames,
            stderr,
            stderr_thread: Some(stderr_thread),
            reaped: None,
            _workdir: workdir,
        })
    }

    /// Queues one request frame. Never blocks: the write happens on the writer thread
    /// and the caller's deadline covers it.
    pub(crate) fn send(&self, line: String) -> std::io::Result<()> {
        let sent = self.requests.as_ref().map(|tx| tx.send(line));
        match sent {
            Some(Ok(())) => Ok(()),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sandbox stdin already closed",
            )),
        }
    }

    /// A frame that arrived while no request was outstanding.
    pub(crate) fn unsolicited_frame(&self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    /// Blocks until the next frame, the deadline, cancellation, or end of stream.
    pub(crate) fn wait_frame(&self, deadline: Instant, cancel: &CancelToken) -> Wait {
        loop {
            if cancel.is_cancelled() {
                return Wait::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wait::TimedOut;
            }
            match self.frames.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(frame) => return Wait::Frame(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Wait::Closed,
            }
        }
    }

    pub(crate) fn output_exceeded(&self) -> bool {
        self.stderr.exceeded()
    }

    /// The protocol stream ended: give the child a moment to finish exiting so its
    /// own status is reported, then kill whatever is left.
    pub(crate) fn reap_after_close(&mut self) -> Exit {
        let grace = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    // Descendants may outlive the group leader.
                    limits::kill_process_group(&mut self.child);
                    self.requests = None;
                    self.reaped = Some(status);
                    return Exit::from_status(status);
                }
                Ok(None) if Instant::now() < grace => std::thread::sleep(POLL_INTERVAL),
                Ok(None) | Err(_) => {
                    self.kill();
                    return Exit::Killed;
                }
            }
        }
    }

    /// Kills the process group and reaps the child; returns everything it printed.
    pub(crate) fn terminate(mut self) -> (Vec<u8>, bool) {
        self.kill();
        self.settle_capture();
        (self.stderr.snapshot(), self.stderr.exceeded())
    }

    /// Lets the capture thread drain what is left in the pipe. Bounded, since an
    /// escaped descendant may still hold the write end open.
    fn settle_capture(&mut self) {
        let Some(thread) = self.stderr_thread.take() else {
            return;
        };
        let grace = Instant::now() + EXIT_GRACE;
        while !thread.is_finished() && Instant::now() < grace {
            std::thread::sleep(POLL_INTERVAL);
        }
        if thread.is_finished() {
            let _ = thread.join();
        }
    }

    fn kill(&mut self) {
        self.requests = None;
        if self.reaped.is_some() {
            return;
        }
        limits::kill_process_group(&mut self.child);
        match self.child.wait() {
            Ok(status) => self.reaped = Some(status),
            Err(err) => tracing::warn!(error = %err, "failed to reap sandbox child"),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.kill();
        tracing::debug!(pid = self.child.id(), "sandbox context torn down");
    }
}

fn abandon(child: &mut Child) {
    limits::kill_process_group(child);
    let _ = child.wait();
}

/// Looks bare program names up on the harness's own `PATH`; the child's environment
/// is cleared, so the lookup cannot be left to `exec`.
pub(crate) fn resolve_program(program: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        if program.is_file() {
            return Ok(program.to_path_buf());
        }
        anyhow::bail!("interpreter not found: {}", program.display());
    }
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    anyhow::bail!(
        "interpreter {:?} not found on PATH",
        program.as_os_str().to_string_lossy()
    )
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::metadata(path)
        .map(|md| md.is_file() && md.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
