use std::time::Duration;

use judge_sandbox::InvokeError;
use judge_value::Value;
use serde::{Deserialize, Deserializer, Serialize};

/// One input/expected-output pair.
///
/// On disk: `{"input": [...], "output": X}`; `expected` is accepted for `output`. A
/// missing `input` means no arguments and a non-array `input` is a single argument.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default, deserialize_with = "positional_args")]
    pub input: Vec<Value>,
    #[serde(default, alias = "output")]
    pub expected: Value,
}

impl TestCase {
    pub fn new(input: Vec<Value>, expected: impl Into<Value>) -> Self {
        Self {
            input,
            expected: expected.into(),
        }
    }
}

fn positional_args<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Seq(items) => items,
        single => vec![single],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ResourceExceeded,
    RuntimeFault,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceExceeded => "resource_exceeded",
            FailureKind::RuntimeFault => "runtime_fault",
        }
    }

    /// Per-case kind for an invocation error; `None` for errors that abort the run.
    pub fn of(err: &InvokeError) -> Option<Self> {
        match err {
            InvokeError::Timeout { .. } => Some(FailureKind::Timeout),
            InvokeError::ResourceExceeded(_) => Some(FailureKind::ResourceExceeded),
            InvokeError::RuntimeFault(_) => Some(FailureKind::RuntimeFault),
            InvokeError::Cancelled | InvokeError::Sandbox(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of one test case. `passed` holds iff `result` is present and matched
/// `expected`; a value mismatch has no `failure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseOutcome {
    /// Zero-based position in the suite.
    pub index: usize,
    pub result: Option<Value>,
    pub expected: Value,
    pub passed: bool,
    pub duration: Duration,
    pub failure: Option<CaseFailure>,
}

impl CaseOutcome {
    pub(crate) fn returned(
        index: usize,
        result: Value,
        expected: Value,
        passed: bool,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            result: Some(result),
            expected,
            passed,
            duration,
            failure: None,
        }
    }

    pub(crate) fn failed(
        index: usize,
        expected: Value,
        kind: FailureKind,
        message: String,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            result: None,
            expected,
            passed: false,
            duration,
            failure: Some(CaseFailure { kind, message }),
        }
    }
}
