//! JSON shapes returned at the request boundary.
//!
//! A graded submission serializes as `{"passed", "total", "results": [...]}` with
//! one entry per case, in order, numbered from 1. A submission that never reached
//! its cases serializes as `{"error": "..."}`.

use judge_value::Value;
use serde::{Deserialize, Serialize};

use crate::case::CaseOutcome;
use crate::report::{Submission, SubmissionReport};

pub const INVALID_PROBLEM: &str = "Invalid problem";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireResponse {
    Report(WireReport),
    Error { error: String },
}

impl WireResponse {
    pub fn error(message: impl Into<String>) -> Self {
        WireResponse::Error {
            error: message.into(),
        }
    }

    pub fn invalid_problem() -> Self {
        Self::error(INVALID_PROBLEM)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, WireResponse::Error { .. })
    }
}

impl From<&Submission> for WireResponse {
    fn from(submission: &Submission) -> Self {
        match submission {
            Submission::Report { report, .. } => WireResponse::Report(report.into()),
            Submission::Failure(failure) => WireResponse::error(failure.message.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReport {
    pub passed: usize,
    pub total: usize,
    pub results: Vec<WireCase>,
}

impl From<&SubmissionReport> for WireReport {
    fn from(report: &SubmissionReport) -> Self {
        Self {
            passed: report.passed,
            total: report.total,
            results: report.outcomes.iter().map(WireCase::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireCase {
    Returned {
        test: usize,
        result: Value,
        expected: Value,
        pass: bool,
        /// Seconds.
        time: f64,
    },
    Error {
        test: usize,
        error: String,
    },
}

impl WireCase {
    pub fn test(&self) -> usize {
        match self {
            WireCase::Returned { test, .. } | WireCase::Error { test, .. } => *test,
        }
    }
}

impl From<&CaseOutcome> for WireCase {
    fn from(outcome: &CaseOutcome) -> Self {
        let test = outcome.index + 1;
        match (&outcome.result, &outcome.failure) {
            (Some(result), None) => WireCase::Returned {
                test,
                result: result.clone(),
                expected: outcome.expected.clone(),
                pass: outcome.passed,
                time: outcome.duration.as_secs_f64(),
            },
            (_, Some(failure)) => WireCase::Error {
                test,
                error: failure.message.clone(),
            },
            (None, None) => WireCase::Error {
                test,
                error: "no result".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::case::FailureKind;
    use crate::report::{aggregate, HarnessFailure, HarnessFailureKind};

    #[test]
    fn report_shape() {
        let report = aggregate(vec![
            CaseOutcome::returned(
                0,
                Value::Int(5),
                Value::Int(5),
                true,
                Duration::from_millis(500),
            ),
            CaseOutcome::failed(
                1,
                Value::Int(7),
                FailureKind::RuntimeFault,
                "ZeroDivisionError: division by zero".into(),
                Duration::from_millis(3),
            ),
        ]);
        let submission = Submission::Report {
            report,
            stderr: String::new(),
        };
        let wire = serde_json::to_value(WireResponse::from(&submission)).unwrap();
        assert_eq!(
            wire,
            json!({
                "passed": 1,
                "total": 2,
                "results": [
                    {"test": 1, "result": 5, "expected": 5, "pass": true, "time": 0.5},
                    {"test": 2, "error": "ZeroDivisionError: division by zero"},
                ],
            })
        );
    }

    #[test]
    fn failure_shape() {
        let submission = Submission::Failure(HarnessFailure::new(
            HarnessFailureKind::Load,
            "Define a callable 'solve' function",
        ));
        let wire = serde_json::to_value(WireResponse::from(&submission)).unwrap();
        assert_eq!(wire, json!({"error": "Define a callable 'solve' function"}));

        let wire = serde_json::to_value(WireResponse::invalid_problem()).unwrap();
        assert_eq!(wire, json!({"error": "Invalid problem"}));
    }

    #[test]
    fn reads_back_both_shapes() {
        let parsed: WireResponse =
            serde_json::from_str(r#"{"passed":0,"total":1,"results":[{"test":1,"error":"x"}]}"#)
                .unwrap();
        let WireResponse::Report(report) = parsed else {
            panic!("expected a report");
        };
        assert_eq!(report.results[0].test(), 1);

        let parsed: WireResponse = serde_json::from_str(r#"{"error":"Invalid problem"}"#).unwrap();
        assert!(parsed.is_error());
    }
}
