use judge_sandbox::{LoadError, LoadErrorKind};
use serde::Serialize;

use crate::case::CaseOutcome;
use crate::runner::RunAborted;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReport {
    pub passed: usize,
    pub total: usize,
    pub outcomes: Vec<CaseOutcome>,
}

impl SubmissionReport {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

pub fn aggregate(outcomes: Vec<CaseOutcome>) -> SubmissionReport {
    SubmissionReport {
        passed: outcomes.iter().filter(|o| o.passed).count(),
        total: outcomes.len(),
        outcomes,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessFailureKind {
    /// The submission did not load or has no usable entry point.
    Load,
    Cancelled,
    /// The harness could not create or drive an isolated context.
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarnessFailure {
    pub kind: HarnessFailureKind,
    pub message: String,
    pub stderr: String,
}

impl HarnessFailure {
    pub fn new(kind: HarnessFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: String::new(),
        }
    }
}

impl From<LoadError> for HarnessFailure {
    fn from(err: LoadError) -> Self {
        let kind = match err.kind {
            LoadErrorKind::Cancelled => HarnessFailureKind::Cancelled,
            LoadErrorKind::Sandbox => HarnessFailureKind::Sandbox,
            LoadErrorKind::Exception
            | LoadErrorKind::MissingEntryPoint
            | LoadErrorKind::Timeout
            | LoadErrorKind::ResourceExceeded => HarnessFailureKind::Load,
        };
        Self {
            kind,
            message: err.message,
            stderr: err.stderr,
        }
    }
}

impl From<RunAborted> for HarnessFailure {
    fn from(err: RunAborted) -> Self {
        let kind = match err {
            RunAborted::Cancelled { .. } => HarnessFailureKind::Cancelled,
            RunAborted::Sandbox { .. } => HarnessFailureKind::Sandbox,
        };
        Self::new(kind, err.to_string())
    }
}

/// Terminal result of grading one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Report {
        report: SubmissionReport,
        /// Output the submission printed while it ran.
        stderr: String,
    },
    Failure(HarnessFailure),
}

impl Submission {
    pub fn report(&self) -> Option<&SubmissionReport> {
        match self {
            Submission::Report { report, .. } => Some(report),
            Submission::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&HarnessFailure> {
        match self {
            Submission::Report { .. } => None,
            Submission::Failure(failure) => Some(failure),
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            Submission::Report { stderr, .. } => stderr,
            Submission::Failure(failure) => &failure.stderr,
        }
    }
}
