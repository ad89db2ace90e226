use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use judge_sandbox::{CancelToken, SourceUnit};

use crate::case::TestCase;
use crate::report::Submission;
use crate::{grade, GradeOptions};

/// One independent submission to grade.
#[derive(Debug, Clone)]
pub struct GradeJob {
    pub source: SourceUnit,
    pub tests: Vec<TestCase>,
    pub options: GradeOptions,
}

/// Grades `jobs` on up to `workers` scoped threads; results are in job order.
///
/// Each job gets its own sandboxed context. Cancelling `cancel` stops every job that
/// is still loading or running.
pub fn grade_batch(jobs: &[GradeJob], workers: usize, cancel: &CancelToken) -> Vec<Submission> {
    let workers = workers.clamp(1, jobs.len().max(1));
    if workers == 1 {
        return jobs
            .iter()
            .map(|job| grade(job.source.clone(), &job.tests, &job.options, cancel))
            .collect();
    }

    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, Submission)>> = Mutex::new(Vec::with_capacity(jobs.len()));
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= jobs.len() {
                    return;
                }
                let job = &jobs[idx];
                let span = tracing::debug_span!("job", index = idx);
                let submission =
                    span.in_scope(|| grade(job.source.clone(), &job.tests, &job.options, cancel));
                results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((idx, submission));
            });
        }
    });

    let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, submission)| submission).collect()
}
