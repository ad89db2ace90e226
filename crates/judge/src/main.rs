use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use judge_contracts::ENV_LOG;
use judge_runner::{
    grade, load_test_cases, GradeOptions, Judge, JudgeConfig, JudgeRequest, ProblemDir,
    ProblemSource, Submission, SubmissionReport, TestSet,
};
use judge_sandbox::{CancelToken, SandboxBackend, SourceUnit};

#[derive(Parser)]
#[command(name = "judge")]
#[command(about = "Grades Python submissions against JSON test cases in a sandbox.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one solution file against one test-case file and print a line per case.
    Eval(EvalArgs),
    /// Grade submission files against a problem and print one JSON report per file.
    Grade(GradeArgs),
    /// List the problems in a problems directory as JSON.
    Problems(ProblemsArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Judge config JSON (judge.config@0.1.0).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "MS")]
    time_limit_ms: Option<u64>,

    #[arg(long, value_name = "BYTES")]
    memory_bytes: Option<u64>,

    #[arg(long, value_name = "NAME")]
    entry_point: Option<String>,

    /// Python 3 interpreter (default: python3, or $JUDGE_PYTHON).
    #[arg(long, value_name = "PATH")]
    python: Option<PathBuf>,

    #[arg(long, value_enum)]
    sandbox_backend: Option<SandboxBackend>,

    #[arg(long)]
    i_accept_weaker_isolation: bool,
}

#[derive(Args)]
struct EvalArgs {
    solution: PathBuf,
    tests: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
struct GradeArgs {
    #[arg(long, value_name = "DIR")]
    problems: PathBuf,

    #[arg(long, value_name = "ID")]
    problem: String,

    /// Grade against the submit suite (falls back to the evaluate suite).
    #[arg(long)]
    submit: bool,

    #[arg(long, value_name = "N", default_value_t = 1)]
    jobs: usize,

    #[arg(required = true, value_name = "CODE")]
    code: Vec<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
struct ProblemsArgs {
    #[arg(long, value_name = "DIR")]
    problems: PathBuf,
}

fn main() -> ExitCode {
    init_tracing();
    run()
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Eval(args) => cmd_eval(args),
        Command::Grade(args) => cmd_grade(args),
        Command::Problems(args) => cmd_problems(args),
    }
}

fn grade_options(args: &ConfigArgs) -> Result<GradeOptions> {
    let mut cfg = JudgeConfig::load(args.config.as_deref())?;
    if let Some(ms) = args.time_limit_ms {
        cfg.limits.case_time_limit_ms = ms;
    }
    if let Some(bytes) = args.memory_bytes {
        cfg.limits.memory_bytes = bytes;
    }
    if let Some(entry_point) = &args.entry_point {
        cfg.runtime.entry_point = entry_point.clone();
    }
    if let Some(python) = &args.python {
        cfg.runtime.interpreter = python.clone();
    }
    if let Some(backend) = args.sandbox_backend {
        cfg.runtime.sandbox_backend = Some(backend.as_str().to_string());
    }
    if args.i_accept_weaker_isolation {
        cfg.runtime.accept_weaker_isolation = true;
    }
    cfg.validate_basic().map_err(anyhow::Error::msg)?;
    let options = cfg.resolve_grade_options()?;
    tracing::debug!(
        backend = %options.sandbox.backend,
        interpreter = %options.sandbox.interpreter.display(),
        "sandbox configured"
    );
    Ok(options)
}

fn cmd_eval(args: EvalArgs) -> Result<ExitCode> {
    if !args.solution.is_file() {
        println!("Solution file not found: {}", args.solution.display());
        return Ok(ExitCode::from(1));
    }
    if !args.tests.is_file() {
        println!("Test cases file not found: {}", args.tests.display());
        return Ok(ExitCode::from(1));
    }

    let code = std::fs::read_to_string(&args.solution)
        .with_context(|| format!("read: {}", args.solution.display()))?;
    let tests = load_test_cases(&args.tests)?;
    let options = grade_options(&args.config)?;

    let submission = grade(SourceUnit::new(code), &tests, &options, &CancelToken::new());
    if !submission.stderr().is_empty() {
        eprint!("{}", submission.stderr());
    }
    match &submission {
        Submission::Report { report, .. } => {
            print_case_lines(report);
            Ok(ExitCode::SUCCESS)
        }
        Submission::Failure(failure) => {
            eprintln!("{}", failure.message);
            Ok(ExitCode::from(2))
        }
    }
}

fn print_case_lines(report: &SubmissionReport) {
    for outcome in &report.outcomes {
        let i = outcome.index + 1;
        match (&outcome.result, &outcome.failure) {
            (_, Some(failure)) => println!("Test {i}: Exception occurred: {}", failure.message),
            (Some(result), None) => {
                let status = if outcome.passed { "PASSED" } else { "FAILED" };
                println!(
                    "Test {i}: {status} (expected {}, got {result})",
                    outcome.expected
                );
            }
            (None, None) => println!("Test {i}: FAILED (expected {}, got nothing)", outcome.expected),
        }
    }
    println!("Passed {}/{} tests.", report.passed, report.total);
}

fn cmd_grade(args: GradeArgs) -> Result<ExitCode> {
    let set = if args.submit {
        TestSet::Submit
    } else {
        TestSet::Evaluate
    };
    let mut requests = Vec::with_capacity(args.code.len());
    for path in &args.code {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("read: {}", path.display()))?;
        requests.push(JudgeRequest {
            problem: args.problem.clone(),
            code,
            set,
        });
    }

    let options = grade_options(&args.config)?;
    let judge = Judge::new(ProblemDir::new(args.problems), options);
    let responses = judge.handle_batch(&requests, args.jobs, &CancelToken::new())?;
    for response in &responses {
        println!("{}", serde_json::to_string(response)?);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_problems(args: ProblemsArgs) -> Result<ExitCode> {
    let ids = ProblemDir::new(args.problems).problem_ids()?;
    println!("{}", serde_json::to_string(&ids)?);
    Ok(ExitCode::SUCCESS)
}
