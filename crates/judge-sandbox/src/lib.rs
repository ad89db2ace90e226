//! Process-isolated execution of untrusted submissions.
//!
//! [`load`] starts a fresh child process for one [`SourceUnit`], runs the submission's
//! top level under a load timeout, and hands back an [`ExecutionHandle`] once the
//! entry point is known to exist. [`ExecutionHandle::invoke`] marshals one argument
//! list into the child and the return value back out, under a per-call wall-clock
//! limit. Ceilings (address space, CPU, open files, processes, file writes, captured
//! output) are enforced by the host OS on the child, never by the submission
//! cooperating. How far side effects are contained depends on the
//! [`EffectiveSandboxBackend`].
//!
//! Contexts are never shared between submissions. A context that had to be killed is
//! replaced on the next call, so a timeout in one case does not poison the rest of
//! the suite.

#[cfg(not(unix))]
compile_error!("judge-sandbox requires a unix host");

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use judge_contracts::DEFAULT_ENTRY_POINT;
use sha2::{Digest, Sha256};

mod backend;
mod capture;
mod context;
mod handle;
mod limits;
mod workdir;

pub use backend::{
    namespaces_available, parse_bool_env, resolve_sandbox_backend, EffectiveSandboxBackend,
    SandboxBackend, SandboxBackendParseError,
};
pub use handle::{load, ExecutionHandle, Teardown};

/// Submission text. Immutable once created; cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    text: Arc<str>,
}

impl SourceUnit {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Arc::from(text.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Lowercase hex SHA-256 of the text; identifies a submission in logs.
    pub fn sha256_hex(&self) -> String {
        hex_lower(&Sha256::digest(self.text.as_bytes()))
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0F) as usize] as char);
    }
    out
}

/// Cancels an in-flight `load` or `invoke` from another thread. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Python 3 interpreter; bare names are looked up on the harness's `PATH`.
    pub interpreter: PathBuf,
    pub entry_point: String,
    pub backend: EffectiveSandboxBackend,
    pub load_timeout: Duration,
    /// `RLIMIT_AS` for the child.
    pub max_memory_bytes: u64,
    /// Cap on captured stderr/print output and on a single encoded return value.
    pub max_output_bytes: usize,
    /// `RLIMIT_CPU` backstop for the whole context; wall-clock limits fire first.
    pub cpu_time_limit_seconds: u64,
    pub max_open_files: u64,
    /// `RLIMIT_NPROC`. Counted per user, so under the rlimits backend it includes the
    /// harness user's other processes, and root ignores it.
    pub max_processes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            backend: EffectiveSandboxBackend::Rlimits,
            load_timeout: Duration::from_secs(5),
            max_memory_bytes: 512 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            cpu_time_limit_seconds: 60,
            max_open_files: 64,
            max_processes: 64,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_identifier(&self.entry_point) {
            anyhow::bail!(
                "entry point {:?} is not a valid identifier",
                self.entry_point
            );
        }
        if self.load_timeout.is_zero() {
            anyhow::bail!("load timeout must be positive");
        }
        if self.max_memory_bytes < 16 * 1024 * 1024 {
            anyhow::bail!(
                "max_memory_bytes={} is below the 16 MiB the interpreter needs to start",
                self.max_memory_bytes
            );
        }
        if self.max_output_bytes == 0 || self.cpu_time_limit_seconds == 0 {
            anyhow::bail!("max_output_bytes and cpu_time_limit_seconds must be positive");
        }
        if self.max_open_files < 8 {
            anyhow::bail!("max_open_files must be at least 8");
        }
        if self.max_processes == 0 || self.max_processes > 4096 {
            anyhow::bail!(
                "max_processes must be 1..4096 (got {})",
                self.max_processes
            );
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadErrorKind {
    /// The submission raised (or failed to compile) while its top level ran.
    Exception,
    /// No callable with the configured entry point name after a clean load.
    MissingEntryPoint,
    Timeout,
    ResourceExceeded,
    Cancelled,
    /// The isolated context could not be created at all.
    Sandbox,
}

impl LoadErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadErrorKind::Exception => "exception",
            LoadErrorKind::MissingEntryPoint => "missing_entry_point",
            LoadErrorKind::Timeout => "timeout",
            LoadErrorKind::ResourceExceeded => "resource_exceeded",
            LoadErrorKind::Cancelled => "cancelled",
            LoadErrorKind::Sandbox => "sandbox",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
    /// Whatever the submission wrote to stdout/stderr before failing.
    pub stderr: String,
}

impl LoadError {
    pub(crate) fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: String::new(),
        }
    }

    pub(crate) fn with_stderr(mut self, stderr: &[u8]) -> Self {
        self.stderr = String::from_utf8_lossy(stderr).into_owned();
        self
    }

    pub(crate) fn sandbox(err: anyhow::Error) -> Self {
        Self::new(
            LoadErrorKind::Sandbox,
            format!("could not start sandbox: {err:#}"),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("time limit exceeded ({} ms)", .limit.as_millis())]
    Timeout { limit: Duration },
    #[error("{0}")]
    ResourceExceeded(String),
    #[error("{0}")]
    RuntimeFault(String),
    #[error("submission cancelled")]
    Cancelled,
    #[error("sandbox failure: {0:#}")]
    Sandbox(anyhow::Error),
}
