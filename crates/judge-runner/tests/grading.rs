use std::process::Command;
use std::time::{Duration, Instant};

use judge_runner::{
    grade, grade_batch, FailureKind, GradeJob, GradeOptions, HarnessFailureKind, RunOptions,
    Submission, TestCase,
};
use judge_sandbox::{CancelToken, SandboxConfig, SourceUnit};
use judge_value::{Comparison, Value};

fn python_available() -> bool {
    Command::new("python3")
        .arg("-c")
        .arg("")
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

macro_rules! require_python {
    () => {
        if !python_available() {
            eprintln!("skipping: python3 not found on PATH");
            return;
        }
    };
}

fn options(time_limit_ms: u64) -> GradeOptions {
    GradeOptions {
        sandbox: SandboxConfig::default(),
        run: RunOptions {
            time_limit: Duration::from_millis(time_limit_ms),
            ..RunOptions::default()
        },
    }
}

fn ints(xs: &[i64]) -> Vec<Value> {
    xs.iter().copied().map(Value::Int).collect()
}

fn grade_code(code: &str, tests: &[TestCase], opts: &GradeOptions) -> Submission {
    grade(SourceUnit::new(code), tests, opts, &CancelToken::new())
}

const ADD: &str = "def solve(a, b):\n    return a + b\n";

#[test]
fn add_scenario() {
    require_python!();
    let tests = vec![TestCase::new(ints(&[2, 3]), 5)];
    let submission = grade_code(ADD, &tests, &options(2_000));
    let report = submission.report().expect("report");
    assert_eq!((report.passed, report.total), (1, 1));
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.result, Some(Value::Int(5)));
    assert_eq!(outcome.expected, Value::Int(5));
    assert!(outcome.passed);
    assert!(outcome.failure.is_none());
}

#[test]
fn exception_on_second_of_three_cases() {
    require_python!();
    let code = "def solve(x):\n    if x == 2:\n        raise ValueError('two is not allowed')\n    return x * 10\n";
    let tests = vec![
        TestCase::new(ints(&[1]), 10),
        TestCase::new(ints(&[2]), 20),
        TestCase::new(ints(&[3]), 30),
    ];
    let submission = grade_code(code, &tests, &options(2_000));
    let report = submission.report().expect("report");
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.total, 3);
    assert_eq!(report.passed, 2);

    let second = &report.outcomes[1];
    assert!(!second.passed);
    assert!(second.result.is_none());
    let failure = second.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::RuntimeFault);
    assert_eq!(failure.message, "ValueError: two is not allowed");

    assert!(report.outcomes[0].passed);
    assert!(report.outcomes[2].passed);
    assert_eq!(
        report.outcomes.iter().map(|o| o.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
}

#[test]
fn mismatch_is_not_a_failure() {
    require_python!();
    let tests = vec![TestCase::new(ints(&[2, 2]), 5)];
    let submission = grade_code(ADD, &tests, &options(2_000));
    let outcome = &submission.report().expect("report").outcomes[0];
    assert!(!outcome.passed);
    assert_eq!(outcome.result, Some(Value::Int(4)));
    assert!(outcome.failure.is_none());
}

#[test]
fn numeric_promotion_decides_pass() {
    require_python!();
    let code = "def solve(kind):\n    return {'float': 1.0, 'bool': True, 'frac': 1.5}[kind]\n";
    let tests = vec![
        TestCase::new(vec!["float".into()], 1),
        TestCase::new(vec!["bool".into()], 1),
        TestCase::new(vec!["frac".into()], 1),
    ];
    let submission = grade_code(code, &tests, &options(2_000));
    let passed: Vec<bool> = submission
        .report()
        .expect("report")
        .outcomes
        .iter()
        .map(|o| o.passed)
        .collect();
    assert_eq!(passed, vec![true, false, false]);
}

#[test]
fn approx_comparison_is_opt_in() {
    require_python!();
    let code = "def solve():\n    return 0.1 + 0.2\n";
    let tests = vec![TestCase::new(vec![], 0.3)];

    let exact = grade_code(code, &tests, &options(2_000));
    assert_eq!(exact.report().expect("report").passed, 0);

    let mut opts = options(2_000);
    opts.run.comparison = Comparison::approx();
    let approx = grade_code(code, &tests, &opts);
    assert_eq!(approx.report().expect("report").passed, 1);
}

#[test]
fn timeout_is_bounded_and_later_cases_still_run() {
    require_python!();
    let code = "def solve(n):\n    while n < 0:\n        pass\n    return n\n";
    let tests = vec![
        TestCase::new(ints(&[1]), 1),
        TestCase::new(ints(&[-1]), -1),
        TestCase::new(ints(&[3]), 3),
    ];
    let limit_ms = 300;
    let started = Instant::now();
    let submission = grade_code(code, &tests, &options(limit_ms));
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(limit_ms) + Duration::from_secs(5),
        "took {elapsed:?}"
    );

    let report = submission.report().expect("report");
    assert_eq!((report.passed, report.total), (2, 3));
    let failure = report.outcomes[1].failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(report.outcomes[2].passed);
}

#[test]
fn reload_after_timeout_is_not_charged_to_the_next_case() {
    require_python!();
    let code = "import time\ntime.sleep(0.8)\n\ndef solve(n):\n    while n < 0:\n        pass\n    return n\n";
    let tests = vec![
        TestCase::new(ints(&[-1]), -1),
        TestCase::new(ints(&[2]), 2),
    ];
    let submission = grade_code(code, &tests, &options(300));
    let report = submission.report().expect("report");
    assert_eq!(
        report.outcomes[0].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Timeout)
    );
    let second = &report.outcomes[1];
    assert!(second.passed);
    assert!(
        second.duration < Duration::from_millis(500),
        "reload time leaked into the case: {:?}",
        second.duration
    );
}

#[test]
fn memory_error_is_resource_exceeded() {
    require_python!();
    let code = "def solve(n):\n    return len(bytearray(n))\n";
    let tests = vec![
        TestCase::new(ints(&[16 * 1024 * 1024 * 1024]), 0),
        TestCase::new(ints(&[4]), 4),
    ];
    let mut opts = options(5_000);
    opts.sandbox.max_memory_bytes = 256 * 1024 * 1024;
    let submission = grade_code(code, &tests, &opts);
    let report = submission.report().expect("report");
    assert_eq!(
        report.outcomes[0].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::ResourceExceeded)
    );
    assert!(report.outcomes[1].passed);
}

#[test]
fn missing_entry_point_is_a_load_failure() {
    require_python!();
    let code = "def add(a, b):\n    return a + b\n";
    let tests = vec![TestCase::new(ints(&[2, 3]), 5)];
    let submission = grade_code(code, &tests, &options(2_000));
    let failure = submission.failure().expect("harness failure");
    assert_eq!(failure.kind, HarnessFailureKind::Load);
    assert_eq!(failure.message, "Define a callable 'solve' function");
    assert!(submission.report().is_none());
}

#[test]
fn load_exception_is_a_load_failure() {
    require_python!();
    let submission = grade_code(
        "import nonexistent_module_xyz\n",
        &[TestCase::new(vec![], Value::Null)],
        &options(2_000),
    );
    let failure = submission.failure().expect("harness failure");
    assert_eq!(failure.kind, HarnessFailureKind::Load);
    assert!(
        failure
            .message
            .starts_with("Failed to execute code: ModuleNotFoundError"),
        "{}",
        failure.message
    );
}

#[test]
fn grading_is_idempotent() {
    require_python!();
    let code = "import random\ndef solve(xs):\n    return sorted(xs)\n";
    let tests = vec![
        TestCase::new(vec![Value::Seq(ints(&[3, 1, 2]))], Value::Seq(ints(&[1, 2, 3]))),
        TestCase::new(vec![Value::Seq(ints(&[]))], Value::Seq(vec![])),
        TestCase::new(vec![Value::Seq(ints(&[2, 1]))], Value::Seq(ints(&[2, 1]))),
    ];
    let opts = options(2_000);
    let first = grade_code(code, &tests, &opts);
    let second = grade_code(code, &tests, &opts);
    let counts = |s: &Submission| {
        let r = s.report().expect("report");
        (r.passed, r.total)
    };
    assert_eq!(counts(&first), (2, 3));
    assert_eq!(counts(&first), counts(&second));
    let passes = |s: &Submission| {
        s.report()
            .expect("report")
            .outcomes
            .iter()
            .map(|o| o.passed)
            .collect::<Vec<_>>()
    };
    assert_eq!(passes(&first), passes(&second));
}

#[test]
fn global_mutation_does_not_leak_between_submissions() {
    require_python!();
    let vandal = "import builtins, threading, time\nbuiltins.sorted = lambda xs: [42]\nthreading.Thread(target=lambda: time.sleep(60), daemon=True).start()\ndef solve(xs):\n    return sorted(xs)\n";
    let honest = "def solve(xs):\n    return [len(xs)] + sorted(xs)\n";
    let tests = vec![TestCase::new(
        vec![Value::Seq(ints(&[2, 1]))],
        Value::Seq(ints(&[2, 1, 2])),
    )];
    let opts = options(2_000);

    let vandal_result = grade_code(vandal, &tests, &opts);
    assert_eq!(vandal_result.report().expect("report").passed, 0);

    let honest_result = grade_code(honest, &tests, &opts);
    assert_eq!(honest_result.report().expect("report").passed, 1);
}

#[test]
fn state_persists_across_cases_unless_fresh_per_case() {
    require_python!();
    let code = "seen = []\ndef solve():\n    seen.append(1)\n    return len(seen)\n";
    let tests = vec![TestCase::new(vec![], 1), TestCase::new(vec![], 1)];

    let shared = grade_code(code, &tests, &options(2_000));
    let shared = shared.report().expect("report");
    assert_eq!(shared.outcomes[1].result, Some(Value::Int(2)));
    assert_eq!(shared.passed, 1);

    let mut opts = options(2_000);
    opts.run.fresh_context_per_case = true;
    let fresh = grade_code(code, &tests, &opts);
    assert_eq!(fresh.report().expect("report").passed, 2);
}

#[test]
fn printed_output_is_reported() {
    require_python!();
    let code = "def solve(x):\n    print('debug', x)\n    return x\n";
    let tests = vec![TestCase::new(ints(&[7]), 7)];
    let submission = grade_code(code, &tests, &options(2_000));
    assert!(submission.stderr().contains("debug 7"), "{:?}", submission.stderr());
}

#[test]
fn cancelled_submission_is_a_harness_failure() {
    require_python!();
    let code = "def solve():\n    while True:\n        pass\n";
    let tests = vec![TestCase::new(vec![], 0), TestCase::new(vec![], 0)];
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });
    let started = Instant::now();
    let submission = grade(SourceUnit::new(code), &tests, &options(30_000), &cancel);
    canceller.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    let failure = submission.failure().expect("harness failure");
    assert_eq!(failure.kind, HarnessFailureKind::Cancelled);
}

#[test]
fn batch_results_follow_job_order() {
    require_python!();
    let tests = vec![TestCase::new(ints(&[2, 3]), 5)];
    let opts = options(2_000);
    let codes = [
        ADD,
        "def solve(a, b):\n    return a - b\n",
        "def nope(a, b):\n    return 0\n",
        ADD,
        "def solve(a, b):\n    import time\n    time.sleep(0.05)\n    return a + b\n",
    ];
    let jobs: Vec<GradeJob> = codes
        .iter()
        .map(|code| GradeJob {
            source: SourceUnit::new(*code),
            tests: tests.clone(),
            options: opts.clone(),
        })
        .collect();

    let results = grade_batch(&jobs, 3, &CancelToken::new());
    assert_eq!(results.len(), jobs.len());
    let summary: Vec<Option<usize>> = results
        .iter()
        .map(|s| s.report().map(|r| r.passed))
        .collect();
    assert_eq!(summary, vec![Some(1), Some(0), None, Some(1), Some(1)]);
}

#[test]
fn batch_of_nothing() {
    assert!(grade_batch(&[], 4, &CancelToken::new()).is_empty());
}
