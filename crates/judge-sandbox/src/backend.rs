use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::Context;
use judge_contracts::{ENV_ACCEPT_WEAKER_ISOLATION, ENV_SANDBOX_BACKEND};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SandboxBackend {
    #[default]
    Auto,
    Namespaces,
    Rlimits,
}

impl SandboxBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxBackend::Auto => "auto",
            SandboxBackend::Namespaces => "namespaces",
            SandboxBackend::Rlimits => "rlimits",
        }
    }
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SandboxBackendParseError {
    value: String,
}

impl fmt::Display for SandboxBackendParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid sandbox backend {:?} (expected one of: auto, namespaces, rlimits)",
            self.value
        )
    }
}

impl std::error::Error for SandboxBackendParseError {}

impl FromStr for SandboxBackend {
    type Err = SandboxBackendParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "auto" => Ok(SandboxBackend::Auto),
            "namespaces" | "ns" => Ok(SandboxBackend::Namespaces),
            "rlimits" | "rlimit" => Ok(SandboxBackend::Rlimits),
            _ => Err(SandboxBackendParseError { value: s }),
        }
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for SandboxBackend {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [SandboxBackend; 3] = [
            SandboxBackend::Auto,
            SandboxBackend::Namespaces,
            SandboxBackend::Rlimits,
        ];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            SandboxBackend::Auto => Some(clap::builder::PossibleValue::new("auto")),
            SandboxBackend::Namespaces => {
                Some(clap::builder::PossibleValue::new("namespaces").alias("ns"))
            }
            SandboxBackend::Rlimits => {
                Some(clap::builder::PossibleValue::new("rlimits").alias("rlimit"))
            }
        }
    }
}

/// The isolation actually applied to spawned contexts.
///
/// Both variants run the submission in its own process group under rlimits.
///
/// `Rlimits` stops there. The child keeps the harness's uid and the host's mounts, so
/// it can delete or truncate any file the harness user owns, reach the network, and
/// leave processes behind by calling `setsid`.
///
/// `Namespaces` also gives the child fresh user, mount, PID, network and IPC
/// namespaces: every mount is read-only, no network interface is up, and killing the
/// context kills everything it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EffectiveSandboxBackend {
    Namespaces,
    #[default]
    Rlimits,
}

impl EffectiveSandboxBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectiveSandboxBackend::Namespaces => "namespaces",
            EffectiveSandboxBackend::Rlimits => "rlimits",
        }
    }

    pub fn unshares_namespaces(self) -> bool {
        matches!(self, EffectiveSandboxBackend::Namespaces)
    }
}

impl fmt::Display for EffectiveSandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_bool_env(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}

fn read_sandbox_backend_env() -> anyhow::Result<Option<SandboxBackend>> {
    let Ok(raw) = std::env::var(ENV_SANDBOX_BACKEND) else {
        return Ok(None);
    };
    let backend = SandboxBackend::from_str(&raw)
        .with_context(|| format!("invalid environment variable {ENV_SANDBOX_BACKEND}={raw:?}"))?;
    Ok(Some(backend))
}

fn read_accept_weaker_isolation_env() -> anyhow::Result<Option<bool>> {
    let Ok(raw) = std::env::var(ENV_ACCEPT_WEAKER_ISOLATION) else {
        return Ok(None);
    };
    Ok(Some(parse_bool_env(ENV_ACCEPT_WEAKER_ISOLATION, &raw)?))
}

const RLIMITS_ONLY_WARNING: &str = "rlimits backend: submissions run as the harness user with no filesystem, network or process-tree containment";

fn resolve_sandbox_backend_with_env(
    requested: Option<SandboxBackend>,
    accept_weaker_isolation: bool,
    env_backend: Option<SandboxBackend>,
    env_accept_weaker_isolation: Option<bool>,
    namespaces_available: impl FnOnce() -> bool,
) -> anyhow::Result<EffectiveSandboxBackend> {
    let accept_weaker_isolation =
        accept_weaker_isolation || env_accept_weaker_isolation.unwrap_or(false);

    let requested = match requested {
        Some(v) => v,
        None => env_backend.unwrap_or(SandboxBackend::Auto),
    };

    match requested {
        SandboxBackend::Rlimits => {
            tracing::warn!("{RLIMITS_ONLY_WARNING}");
            Ok(EffectiveSandboxBackend::Rlimits)
        }
        SandboxBackend::Auto => {
            if namespaces_available() {
                Ok(EffectiveSandboxBackend::Namespaces)
            } else {
                tracing::warn!(
                    "unprivileged namespaces unavailable; sandbox falls back to rlimits only. {RLIMITS_ONLY_WARNING}"
                );
                Ok(EffectiveSandboxBackend::Rlimits)
            }
        }
        SandboxBackend::Namespaces => {
            if namespaces_available() {
                return Ok(EffectiveSandboxBackend::Namespaces);
            }
            if !accept_weaker_isolation {
                anyhow::bail!(
                    "sandbox_backend=namespaces was requested but unprivileged user namespaces are unavailable; failing closed\n\n\
fix:\n  - enable unprivileged user namespaces on this host, or\n  - explicitly accept weaker isolation: --i-accept-weaker-isolation (or set {ENV_ACCEPT_WEAKER_ISOLATION}=1)"
                );
            }
            tracing::warn!(
                "namespaces unavailable; weaker isolation accepted, using rlimits only. {RLIMITS_ONLY_WARNING}"
            );
            Ok(EffectiveSandboxBackend::Rlimits)
        }
    }
}

/// Resolves the requested backend against the environment and the host's capabilities.
///
/// Explicit arguments win over `JUDGE_SANDBOX_BACKEND` / `JUDGE_I_ACCEPT_WEAKER_ISOLATION`.
pub fn resolve_sandbox_backend(
    requested: Option<SandboxBackend>,
    accept_weaker_isolation: bool,
    interpreter: &Path,
) -> anyhow::Result<EffectiveSandboxBackend> {
    let env_backend = read_sandbox_backend_env()?;
    let env_accept_weaker_isolation = read_accept_weaker_isolation_env()?;
    resolve_sandbox_backend_with_env(
        requested,
        accept_weaker_isolation,
        env_backend,
        env_accept_weaker_isolation,
        || namespaces_available(interpreter),
    )
}

/// Spawns the interpreter once inside the same namespaces and read-only mounts a
/// context gets; the answer is cached for the life of the process.
pub fn namespaces_available(interpreter: &Path) -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| probe_namespaces(interpreter))
}

#[cfg(target_os = "linux")]
fn probe_namespaces(interpreter: &Path) -> bool {
    use std::os::unix::process::CommandExt as _;
    use std::process::{Command, Stdio};

    let Ok(program) = crate::context::resolve_program(interpreter) else {
        return false;
    };
    let mut cmd = Command::new(program);
    cmd.args(["-I", "-c", ""]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd.env_clear();
    unsafe {
        cmd.pre_exec(crate::limits::enter_namespaces);
    }
    let ok = cmd.status().map(|s| s.success()).unwrap_or(false);
    tracing::debug!(available = ok, "probed unprivileged namespaces");
    ok
}

#[cfg(not(target_os = "linux"))]
fn probe_namespaces(_interpreter: &Path) -> bool {
    false
}
