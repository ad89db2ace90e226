use std::time::Duration;

use anyhow::Result;
use judge_sandbox::{CancelToken, SourceUnit};

use crate::batch::{grade_batch, GradeJob};
use crate::problem::{ProblemSource, TestSet};
use crate::wire::WireResponse;
use crate::{grade, GradeOptions};

/// A problem id plus submission text, as received at the request boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    pub problem: String,
    pub code: String,
    pub set: TestSet,
}

/// Answers [`JudgeRequest`]s from a [`ProblemSource`].
///
/// Unknown problem ids and load failures come back as `{"error": ...}` documents.
/// `Err` is reserved for problem definitions the judge itself cannot read.
pub struct Judge<P> {
    problems: P,
    options: GradeOptions,
}

impl<P: ProblemSource> Judge<P> {
    pub fn new(problems: P, options: GradeOptions) -> Self {
        Self { problems, options }
    }

    pub fn problems(&self) -> &P {
        &self.problems
    }

    /// Global options with the problem's own manifest layered on top.
    pub fn options_for(&self, problem: &str) -> Result<GradeOptions> {
        let manifest = self.problems.manifest(problem)?;
        let mut options = self.options.clone();
        if let Some(entry_point) = manifest.entry_point {
            options.sandbox.entry_point = entry_point;
        }
        if let Some(ms) = manifest.time_limit_ms {
            options.run.time_limit = Duration::from_millis(ms);
        }
        if let Some(comparison) = manifest.comparison {
            options.run.comparison = comparison;
        }
        Ok(options)
    }

    fn job(&self, request: &JudgeRequest) -> Result<Option<GradeJob>> {
        if request.problem.is_empty() || !self.problems.contains(&request.problem)? {
            tracing::debug!(problem = %request.problem, "rejected unknown problem");
            return Ok(None);
        }
        Ok(Some(GradeJob {
            source: SourceUnit::new(request.code.as_str()),
            tests: self.problems.test_cases(&request.problem, request.set)?,
            options: self.options_for(&request.problem)?,
        }))
    }

    pub fn handle(&self, request: &JudgeRequest, cancel: &CancelToken) -> Result<WireResponse> {
        let Some(job) = self.job(request)? else {
            return Ok(WireResponse::invalid_problem());
        };
        let submission = grade(job.source, &job.tests, &job.options, cancel);
        Ok(WireResponse::from(&submission))
    }

    /// Grades independent requests concurrently; responses are in request order.
    pub fn handle_batch(
        &self,
        requests: &[JudgeRequest],
        workers: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<WireResponse>> {
        let mut slots = Vec::with_capacity(requests.len());
        let mut jobs = Vec::new();
        for request in requests {
            match self.job(request)? {
                Some(job) => {
                    slots.push(Some(jobs.len()));
                    jobs.push(job);
                }
                None => slots.push(None),
            }
        }

        let graded = grade_batch(&jobs, workers, cancel);
        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Some(i) => WireResponse::from(&graded[i]),
                None => WireResponse::invalid_problem(),
            })
            .collect())
    }
}
