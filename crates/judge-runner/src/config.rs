use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use judge_contracts::{
    DEFAULT_ENTRY_POINT, ENV_ACCEPT_WEAKER_ISOLATION, ENV_PYTHON, ENV_SANDBOX_BACKEND,
    JUDGE_CONFIG_SCHEMA_VERSION,
};
use judge_sandbox::{
    parse_bool_env, resolve_sandbox_backend, EffectiveSandboxBackend, SandboxBackend,
    SandboxConfig,
};
use judge_value::Comparison;
use serde::{Deserialize, Serialize};

use crate::runner::RunOptions;
use crate::GradeOptions;

fn default_schema_version() -> String {
    JUDGE_CONFIG_SCHEMA_VERSION.to_string()
}

fn default_load_timeout_ms() -> u64 {
    5_000
}

fn default_case_time_limit_ms() -> u64 {
    2_000
}

fn default_memory_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_output_bytes() -> u64 {
    1024 * 1024
}

fn default_cpu_seconds() -> u64 {
    60
}

fn default_open_files() -> u64 {
    64
}

fn default_processes() -> u64 {
    64
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("python3")
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

/// Judge settings file (`judge.config@0.1.0`). Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub comparison: Comparison,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    #[serde(default = "default_case_time_limit_ms")]
    pub case_time_limit_ms: u64,
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    #[serde(default = "default_output_bytes")]
    pub output_bytes: u64,
    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: u64,
    #[serde(default = "default_open_files")]
    pub open_files: u64,
    #[serde(default = "default_processes")]
    pub processes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout_ms(),
            case_time_limit_ms: default_case_time_limit_ms(),
            memory_bytes: default_memory_bytes(),
            output_bytes: default_output_bytes(),
            cpu_seconds: default_cpu_seconds(),
            open_files: default_open_files(),
            processes: default_processes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Runtime {
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// `auto`, `namespaces` or `rlimits`; unset means auto.
    #[serde(default)]
    pub sandbox_backend: Option<String>,
    #[serde(default)]
    pub accept_weaker_isolation: bool,
    #[serde(default)]
    pub fresh_context_per_case: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            entry_point: default_entry_point(),
            sandbox_backend: None,
            accept_weaker_isolation: false,
            fresh_context_per_case: false,
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            limits: Limits::default(),
            runtime: Runtime::default(),
            comparison: Comparison::Exact,
        }
    }
}

impl JudgeConfig {
    /// Reads `path` (or starts from defaults), then applies `JUDGE_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let bytes =
                    std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
                Self::from_json_bytes(&bytes)
                    .with_context(|| format!("load judge config: {}", path.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let cfg: JudgeConfig = serde_json::from_slice(bytes).context("parse judge config JSON")?;
        cfg.validate_basic().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(python) = lookup(ENV_PYTHON).filter(|v| !v.trim().is_empty()) {
            self.runtime.interpreter = PathBuf::from(python);
        }
        if let Some(raw) = lookup(ENV_SANDBOX_BACKEND) {
            SandboxBackend::from_str(&raw).with_context(|| {
                format!("invalid environment variable {ENV_SANDBOX_BACKEND}={raw:?}")
            })?;
            self.runtime.sandbox_backend = Some(raw);
        }
        if let Some(raw) = lookup(ENV_ACCEPT_WEAKER_ISOLATION) {
            self.runtime.accept_weaker_isolation =
                parse_bool_env(ENV_ACCEPT_WEAKER_ISOLATION, &raw)?;
        }
        Ok(())
    }

    pub fn validate_basic(&self) -> Result<(), String> {
        if self.schema_version.trim() != JUDGE_CONFIG_SCHEMA_VERSION {
            return Err(format!(
                "config.schema_version mismatch: expected {} got {:?}",
                JUDGE_CONFIG_SCHEMA_VERSION, self.schema_version
            ));
        }
        let l = &self.limits;
        if l.case_time_limit_ms == 0 || l.case_time_limit_ms > 600_000 {
            return Err(format!(
                "config.limits.case_time_limit_ms must be 1..600000 (got {})",
                l.case_time_limit_ms
            ));
        }
        if l.load_timeout_ms == 0 || l.load_timeout_ms > 600_000 {
            return Err(format!(
                "config.limits.load_timeout_ms must be 1..600000 (got {})",
                l.load_timeout_ms
            ));
        }
        if l.output_bytes == 0 || usize::try_from(l.output_bytes).is_err() {
            return Err(format!(
                "config.limits.output_bytes out of range (got {})",
                l.output_bytes
            ));
        }
        if l.processes == 0 || l.processes > 4096 {
            return Err(format!(
                "config.limits.processes must be 1..4096 (got {})",
                l.processes
            ));
        }
        if let Some(raw) = &self.runtime.sandbox_backend {
            SandboxBackend::from_str(raw).map_err(|e| format!("config.runtime: {e}"))?;
        }
        if let Comparison::Approx { abs_tol, rel_tol } = self.comparison {
            if !(abs_tol >= 0.0 && rel_tol >= 0.0) {
                return Err("config.comparison tolerances must be non-negative".to_string());
            }
        }
        Ok(())
    }

    pub fn sandbox_backend(&self) -> Result<Option<SandboxBackend>> {
        self.runtime
            .sandbox_backend
            .as_deref()
            .map(SandboxBackend::from_str)
            .transpose()
            .map_err(anyhow::Error::from)
    }

    /// Settings for one submission under an already-resolved backend.
    pub fn grade_options(&self, backend: EffectiveSandboxBackend) -> GradeOptions {
        let l = &self.limits;
        GradeOptions {
            sandbox: SandboxConfig {
                interpreter: self.runtime.interpreter.clone(),
                entry_point: self.runtime.entry_point.clone(),
                backend,
                load_timeout: Duration::from_millis(l.load_timeout_ms),
                max_memory_bytes: l.memory_bytes,
                max_output_bytes: usize::try_from(l.output_bytes).unwrap_or(usize::MAX),
                cpu_time_limit_seconds: l.cpu_seconds,
                max_open_files: l.open_files,
                max_processes: l.processes,
            },
            run: RunOptions {
                time_limit: Duration::from_millis(l.case_time_limit_ms),
                comparison: self.comparison,
                fresh_context_per_case: self.runtime.fresh_context_per_case,
            },
        }
    }

    /// Resolves the sandbox backend against this host, then builds [`GradeOptions`].
    pub fn resolve_grade_options(&self) -> Result<GradeOptions> {
        let backend = resolve_sandbox_backend(
            self.sandbox_backend()?,
            self.runtime.accept_weaker_isolation,
            &self.runtime.interpreter,
        )?;
        let opts = self.grade_options(backend);
        opts.sandbox.validate()?;
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn empty_object_takes_defaults() {
        let cfg = JudgeConfig::from_json_bytes(b"{}").unwrap();
        assert_eq!(cfg, JudgeConfig::default());
        assert_eq!(cfg.limits.case_time_limit_ms, 2_000);
        assert_eq!(cfg.runtime.entry_point, "solve");
    }

    #[test]
    fn partial_sections_fill_in() {
        let cfg = JudgeConfig::from_json_bytes(
            br#"{"schema_version":"judge.config@0.1.0",
                 "limits":{"case_time_limit_ms":250},
                 "runtime":{"sandbox_backend":"rlimits","fresh_context_per_case":true},
                 "comparison":{"mode":"approx"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.limits.case_time_limit_ms, 250);
        assert_eq!(cfg.limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.limits.processes, 64);
        assert_eq!(cfg.sandbox_backend().unwrap(), Some(SandboxBackend::Rlimits));
        assert_eq!(cfg.comparison, Comparison::approx());

        let opts = cfg.grade_options(EffectiveSandboxBackend::Rlimits);
        assert_eq!(opts.run.time_limit, Duration::from_millis(250));
        assert!(opts.run.fresh_context_per_case);
        assert_eq!(opts.sandbox.load_timeout, Duration::from_secs(5));
        opts.sandbox.validate().unwrap();
    }

    #[test]
    fn rejects_bad_files() {
        let err = JudgeConfig::from_json_bytes(br#"{"schema_version":"judge.config@2"}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("schema_version mismatch"));

        let err =
            JudgeConfig::from_json_bytes(br#"{"limits":{"case_time_limit_ms":0}}"#).unwrap_err();
        assert!(format!("{err:#}").contains("case_time_limit_ms"));

        let err = JudgeConfig::from_json_bytes(br#"{"limits":{"processes":0}}"#).unwrap_err();
        assert!(format!("{err:#}").contains("limits.processes"));

        let err = JudgeConfig::from_json_bytes(br#"{"runtime":{"sandbox_backend":"docker"}}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid sandbox backend"));

        assert!(JudgeConfig::from_json_bytes(br#"{"limit":{}}"#).is_err());
    }

    #[test]
    fn environment_overrides() {
        let env: BTreeMap<&str, &str> = [
            (ENV_PYTHON, "/opt/python3.12/bin/python3"),
            (ENV_SANDBOX_BACKEND, "ns"),
            (ENV_ACCEPT_WEAKER_ISOLATION, "yes"),
        ]
        .into_iter()
        .collect();
        let mut cfg = JudgeConfig::default();
        cfg.apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(
            cfg.runtime.interpreter,
            PathBuf::from("/opt/python3.12/bin/python3")
        );
        assert_eq!(cfg.sandbox_backend().unwrap(), Some(SandboxBackend::Namespaces));
        assert!(cfg.runtime.accept_weaker_isolation);

        let mut cfg = JudgeConfig::default();
        let err = cfg
            .apply_env_with(|k| (k == ENV_ACCEPT_WEAKER_ISOLATION).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(format!("{err:#}").contains(ENV_ACCEPT_WEAKER_ISOLATION));
    }
}
