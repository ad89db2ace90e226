use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use judge_contracts::{
    PROBLEM_DESCRIPTION_FILE, PROBLEM_MANIFEST_FILE, PROBLEM_MANIFEST_SCHEMA_VERSION,
    PROBLEM_SUBMIT_TESTS_FILE, PROBLEM_TESTS_FILE,
};
use judge_value::Comparison;
use serde::Deserialize;

use crate::case::TestCase;

/// Which of a problem's suites to grade against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TestSet {
    /// Iterative feedback while a solution is written.
    #[default]
    Evaluate,
    /// Final grading; falls back to the evaluate suite when a problem has none.
    Submit,
}

/// Optional per-problem settings layered over the global config.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProblemManifest {
    pub schema_version: String,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub comparison: Option<Comparison>,
}

impl ProblemManifest {
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.schema_version.trim() != PROBLEM_MANIFEST_SCHEMA_VERSION {
            return Err(format!(
                "problem.schema_version mismatch: expected {} got {:?}",
                PROBLEM_MANIFEST_SCHEMA_VERSION, self.schema_version
            ));
        }
        if let Some(ms) = self.time_limit_ms {
            if ms == 0 || ms > 600_000 {
                return Err(format!(
                    "problem.time_limit_ms must be 1..600000 (got {ms})"
                ));
            }
        }
        if let Some(Comparison::Approx { abs_tol, rel_tol }) = self.comparison {
            if !(abs_tol >= 0.0 && rel_tol >= 0.0) {
                return Err("problem.comparison tolerances must be non-negative".to_string());
            }
        }
        Ok(())
    }
}

/// Where problem definitions come from.
pub trait ProblemSource {
    fn problem_ids(&self) -> Result<Vec<String>>;

    fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.problem_ids()?.iter().any(|known| known == id))
    }

    fn manifest(&self, id: &str) -> Result<ProblemManifest>;

    fn description(&self, id: &str) -> Result<Option<String>>;

    fn test_cases(&self, id: &str, set: TestSet) -> Result<Vec<TestCase>>;
}

/// Problems laid out as `<root>/<id>/test_cases.json`, with optional
/// `submit_tests.json`, `problem.json` and `description.md` beside it.
#[derive(Debug, Clone)]
pub struct ProblemDir {
    root: PathBuf,
}

impl ProblemDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn problem_path(&self, id: &str) -> Result<PathBuf> {
        if !is_plain_name(id) {
            anyhow::bail!("invalid problem id {id:?}");
        }
        Ok(self.root.join(id))
    }
}

fn is_plain_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

impl ProblemSource for ProblemDir {
    fn problem_ids(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("read problems dir: {}", self.root.display()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("read problems dir: {}", self.root.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn contains(&self, id: &str) -> Result<bool> {
        Ok(is_plain_name(id) && self.root.join(id).is_dir())
    }

    fn manifest(&self, id: &str) -> Result<ProblemManifest> {
        let path = self.problem_path(id)?.join(PROBLEM_MANIFEST_FILE);
        if !path.is_file() {
            return Ok(ProblemManifest {
                schema_version: PROBLEM_MANIFEST_SCHEMA_VERSION.to_string(),
                ..ProblemManifest::default()
            });
        }
        let bytes = std::fs::read(&path).with_context(|| format!("read: {}", path.display()))?;
        let manifest: ProblemManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse problem manifest: {}", path.display()))?;
        manifest
            .validate_basic()
            .map_err(|msg| anyhow::anyhow!("{}: {msg}", path.display()))?;
        Ok(manifest)
    }

    fn description(&self, id: &str) -> Result<Option<String>> {
        let path = self.problem_path(id)?.join(PROBLEM_DESCRIPTION_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let text =
            std::fs::read_to_string(&path).with_context(|| format!("read: {}", path.display()))?;
        Ok(Some(text))
    }

    fn test_cases(&self, id: &str, set: TestSet) -> Result<Vec<TestCase>> {
        let dir = self.problem_path(id)?;
        if set == TestSet::Submit {
            let submit = dir.join(PROBLEM_SUBMIT_TESTS_FILE);
            if submit.is_file() {
                return load_test_cases(&submit);
            }
        }
        load_test_cases(&dir.join(PROBLEM_TESTS_FILE))
    }
}

/// Reads a JSON array of test cases.
pub fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parse test cases: {}", path.display()))
}
