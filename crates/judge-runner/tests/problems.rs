use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use judge_runner::wire::{WireCase, WireResponse};
use judge_runner::{
    load_test_cases, GradeOptions, Judge, JudgeRequest, ProblemDir, ProblemSource, TestSet,
};
use judge_sandbox::CancelToken;
use judge_value::{Comparison, Value};

fn create_temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

fn rm_rf(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

fn python_available() -> bool {
    Command::new("python3")
        .arg("-c")
        .arg("")
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(path, contents).expect("write fixture");
}

/// `add` has distinct submit tests; `palindrome` has a manifest and only the
/// evaluate suite.
fn fixture() -> PathBuf {
    let root = create_temp_dir("judge_problems");
    write(
        &root.join("add/test_cases.json"),
        r#"[{"input": [2, 3], "output": 5}, {"input": [-1, 1], "output": 0}]"#,
    );
    write(
        &root.join("add/submit_tests.json"),
        r#"[{"input": [2, 3], "output": 5}, {"input": [10, 20], "output": 30},
            {"input": [0, 0], "expected": 0}]"#,
    );
    write(&root.join("add/description.md"), "# Add\n\nReturn a + b.\n");
    write(
        &root.join("palindrome/test_cases.json"),
        r#"[{"input": 121, "output": true}, {"input": [10], "output": false}]"#,
    );
    write(
        &root.join("palindrome/problem.json"),
        r#"{"schema_version": "judge.problem@0.1.0", "entry_point": "is_palindrome",
            "time_limit_ms": 1500, "comparison": {"mode": "approx"}}"#,
    );
    write(&root.join("README.md"), "not a problem\n");
    root
}

fn judge(root: &Path) -> Judge<ProblemDir> {
    Judge::new(ProblemDir::new(root), GradeOptions::default())
}

fn request(problem: &str, code: &str, set: TestSet) -> JudgeRequest {
    JudgeRequest {
        problem: problem.to_string(),
        code: code.to_string(),
        set,
    }
}

#[test]
fn lists_problem_directories_sorted() {
    let root = fixture();
    let problems = ProblemDir::new(&root);
    assert_eq!(
        problems.problem_ids().unwrap(),
        vec!["add".to_string(), "palindrome".to_string()]
    );
    assert!(problems.contains("add").unwrap());
    assert!(!problems.contains("README.md").unwrap());
    assert!(!problems.contains("../etc").unwrap());
    rm_rf(&root);
}

#[test]
fn submit_set_falls_back_to_evaluate_set() {
    let root = fixture();
    let problems = ProblemDir::new(&root);
    assert_eq!(problems.test_cases("add", TestSet::Evaluate).unwrap().len(), 2);
    assert_eq!(problems.test_cases("add", TestSet::Submit).unwrap().len(), 3);
    assert_eq!(
        problems.test_cases("palindrome", TestSet::Submit).unwrap(),
        problems.test_cases("palindrome", TestSet::Evaluate).unwrap()
    );

    let cases = problems.test_cases("palindrome", TestSet::Evaluate).unwrap();
    assert_eq!(cases[0].input, vec![Value::Int(121)]);
    assert_eq!(cases[1].input, vec![Value::Int(10)]);
    rm_rf(&root);
}

#[test]
fn manifests_and_descriptions() {
    let root = fixture();
    let problems = ProblemDir::new(&root);
    let manifest = problems.manifest("palindrome").unwrap();
    assert_eq!(manifest.entry_point.as_deref(), Some("is_palindrome"));

    let defaults = problems.manifest("add").unwrap();
    assert_eq!(defaults.entry_point, None);
    assert_eq!(defaults.time_limit_ms, None);

    assert!(problems
        .description("add")
        .unwrap()
        .unwrap()
        .starts_with("# Add"));
    assert_eq!(problems.description("palindrome").unwrap(), None);

    let j = judge(&root);
    let opts = j.options_for("palindrome").unwrap();
    assert_eq!(opts.sandbox.entry_point, "is_palindrome");
    assert_eq!(opts.run.time_limit, Duration::from_millis(1500));
    assert_eq!(opts.run.comparison, Comparison::approx());
    let opts = j.options_for("add").unwrap();
    assert_eq!(opts.sandbox.entry_point, "solve");
    rm_rf(&root);
}

#[test]
fn broken_definitions_are_errors() {
    let root = fixture();
    write(&root.join("bad/test_cases.json"), "{not json");
    write(
        &root.join("bad/problem.json"),
        r#"{"schema_version": "judge.problem@0.0.1"}"#,
    );
    let problems = ProblemDir::new(&root);
    let err = problems.test_cases("bad", TestSet::Evaluate).unwrap_err();
    assert!(format!("{err:#}").contains("parse test cases"));
    let err = problems.manifest("bad").unwrap_err();
    assert!(format!("{err:#}").contains("schema_version mismatch"));

    let err = load_test_cases(&root.join("missing.json")).unwrap_err();
    assert!(format!("{err:#}").contains("missing.json"));
    rm_rf(&root);
}

#[test]
fn unknown_problem_is_invalid() {
    let root = fixture();
    let j = judge(&root);
    let cancel = CancelToken::new();
    for id in ["", "nope", "../add", "README.md"] {
        let response = j
            .handle(&request(id, "def solve(): pass\n", TestSet::Evaluate), &cancel)
            .unwrap();
        assert_eq!(response, WireResponse::invalid_problem(), "id={id:?}");
    }
    rm_rf(&root);
}

#[test]
fn evaluate_and_submit_requests() {
    if !python_available() {
        eprintln!("skipping: python3 not found on PATH");
        return;
    }
    let root = fixture();
    let j = judge(&root);
    let cancel = CancelToken::new();
    let code = "def solve(a, b):\n    return a + b\n";

    let WireResponse::Report(report) = j
        .handle(&request("add", code, TestSet::Evaluate), &cancel)
        .unwrap()
    else {
        panic!("expected a report");
    };
    assert_eq!((report.passed, report.total), (2, 2));

    let WireResponse::Report(report) = j
        .handle(&request("add", code, TestSet::Submit), &cancel)
        .unwrap()
    else {
        panic!("expected a report");
    };
    assert_eq!((report.passed, report.total), (3, 3));
    assert_eq!(
        report.results.iter().map(WireCase::test).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let response = j
        .handle(&request("add", "x = 1\n", TestSet::Evaluate), &cancel)
        .unwrap();
    assert_eq!(
        response,
        WireResponse::error("Define a callable 'solve' function")
    );

    let palindrome = "def is_palindrome(n):\n    return str(n) == str(n)[::-1]\n";
    let WireResponse::Report(report) = j
        .handle(&request("palindrome", palindrome, TestSet::Evaluate), &cancel)
        .unwrap()
    else {
        panic!("expected a report");
    };
    assert_eq!(report.passed, 2);
    rm_rf(&root);
}

#[test]
fn batch_requests_keep_order() {
    if !python_available() {
        eprintln!("skipping: python3 not found on PATH");
        return;
    }
    let root = fixture();
    let j = judge(&root);
    let requests = vec![
        request("add", "def solve(a, b):\n    return a + b\n", TestSet::Evaluate),
        request("missing", "def solve(a, b):\n    return a + b\n", TestSet::Evaluate),
        request("add", "def solve(a, b):\n    raise RuntimeError('no')\n", TestSet::Evaluate),
    ];
    let responses = j.handle_batch(&requests, 2, &CancelToken::new()).unwrap();
    assert_eq!(responses.len(), 3);

    let WireResponse::Report(first) = &responses[0] else {
        panic!("expected a report");
    };
    assert_eq!(first.passed, 2);
    assert_eq!(responses[1], WireResponse::invalid_problem());
    let WireResponse::Report(third) = &responses[2] else {
        panic!("expected a report");
    };
    assert_eq!(third.passed, 0);
    assert!(matches!(
        &third.results[0],
        WireCase::Error { test: 1, error } if error == "RuntimeError: no"
    ));
    rm_rf(&root);
}
