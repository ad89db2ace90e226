//! Grades a submission against a test suite.
//!
//! [`grade`] is the whole pipeline for one submission: load it into a fresh sandboxed
//! context, run every case in order, aggregate the outcomes and tear the context down.
//! [`grade_batch`] does the same for many independent submissions on a bounded pool of
//! worker threads. [`Judge`] sits on top and answers problem-id + code requests with
//! the JSON documents in [`wire`].

use judge_sandbox::{CancelToken, SandboxConfig, SourceUnit};

mod batch;
mod case;
mod config;
mod problem;
mod report;
mod runner;
mod service;
pub mod wire;

pub use batch::{grade_batch, GradeJob};
pub use case::{CaseFailure, CaseOutcome, FailureKind, TestCase};
pub use config::{JudgeConfig, Limits, Runtime};
pub use problem::{load_test_cases, ProblemDir, ProblemManifest, ProblemSource, TestSet};
pub use report::{aggregate, HarnessFailure, HarnessFailureKind, Submission, SubmissionReport};
pub use runner::{run, RunAborted, RunOptions};
pub use service::{Judge, JudgeRequest};

#[derive(Debug, Clone, Default)]
pub struct GradeOptions {
    pub sandbox: SandboxConfig,
    pub run: RunOptions,
}

/// Loads `source`, runs `tests` against it, and always tears the context down.
///
/// A submission that cannot load never reaches its cases: the result is a
/// [`Submission::Failure`] with no outcomes.
pub fn grade(
    source: SourceUnit,
    tests: &[TestCase],
    options: &GradeOptions,
    cancel: &CancelToken,
) -> Submission {
    let span = tracing::info_span!(
        "submission",
        source = %source.sha256_hex(),
        entry_point = %options.sandbox.entry_point,
        cases = tests.len(),
        backend = %options.sandbox.backend,
    );
    let _enter = span.enter();

    let mut handle = match judge_sandbox::load(source, &options.sandbox, cancel) {
        Ok(handle) => handle,
        Err(err) => {
            tracing::debug!(kind = err.kind.as_str(), message = %err.message, "load failed");
            return Submission::Failure(err.into());
        }
    };

    let ran = run(&mut handle, tests, &options.run);
    let teardown = handle.teardown();
    if teardown.restarts > 0 {
        tracing::debug!(restarts = teardown.restarts, "context was reloaded during the run");
    }

    match ran {
        Ok(outcomes) => {
            let report = aggregate(outcomes);
            tracing::debug!(passed = report.passed, total = report.total, "graded");
            Submission::Report {
                report,
                stderr: teardown.stderr,
            }
        }
        Err(aborted) => {
            tracing::warn!(error = %aborted, "run aborted");
            let mut failure = HarnessFailure::from(aborted);
            failure.stderr = teardown.stderr;
            Submission::Failure(failure)
        }
    }
}
