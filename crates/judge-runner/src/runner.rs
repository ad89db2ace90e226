use std::time::Duration;

use judge_sandbox::{ExecutionHandle, InvokeError};
use judge_value::Comparison;

use crate::case::{CaseOutcome, FailureKind, TestCase};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub time_limit: Duration,
    pub comparison: Comparison,
    /// Reload the submission before every case instead of sharing one context.
    pub fresh_context_per_case: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(2),
            comparison: Comparison::Exact,
            fresh_context_per_case: false,
        }
    }
}

/// Conditions that stop a run before every case has an outcome.
#[derive(Debug, thiserror::Error)]
pub enum RunAborted {
    #[error("submission cancelled after {completed} of {total} cases")]
    Cancelled { completed: usize, total: usize },
    #[error("sandbox failure on case {}: {error:#}", .index + 1)]
    Sandbox { index: usize, error: anyhow::Error },
}

/// Runs every case in order against `handle`.
///
/// Per-case failures become outcomes; only cancellation and sandbox infrastructure
/// failures end the run early.
pub fn run(
    handle: &mut ExecutionHandle,
    tests: &[TestCase],
    options: &RunOptions,
) -> Result<Vec<CaseOutcome>, RunAborted> {
    let mut outcomes = Vec::with_capacity(tests.len());
    for (index, case) in tests.iter().enumerate() {
        if options.fresh_context_per_case && index > 0 {
            handle.reset();
        }

        let (invoked, duration) = handle.invoke_timed(&case.input, options.time_limit);

        let outcome = match invoked {
            Ok(result) => {
                let passed = options.comparison.values_equal(&result, &case.expected);
                CaseOutcome::returned(index, result, case.expected.clone(), passed, duration)
            }
            Err(err) => match FailureKind::of(&err) {
                Some(kind) => CaseOutcome::failed(
                    index,
                    case.expected.clone(),
                    kind,
                    err.to_string(),
                    duration,
                ),
                None => return Err(abort(err, index, outcomes.len(), tests.len())),
            },
        };

        tracing::debug!(
            case = index + 1,
            passed = outcome.passed,
            failure = outcome.failure.as_ref().map(|f| f.kind.as_str()),
            elapsed_ms = duration.as_millis() as u64,
            "case finished"
        );
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn abort(err: InvokeError, index: usize, completed: usize, total: usize) -> RunAborted {
    match err {
        InvokeError::Sandbox(error) => RunAborted::Sandbox { index, error },
        _ => RunAborted::Cancelled { completed, total },
    }
}
