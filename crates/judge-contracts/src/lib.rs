//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings and
//! fixed names that appear in machine-readable I/O, both on the wire between the
//! harness and its sandboxed children and in the files a caller hands the judge.

pub const JUDGE_CONFIG_SCHEMA_VERSION: &str = "judge.config@0.1.0";
pub const PROBLEM_MANIFEST_SCHEMA_VERSION: &str = "judge.problem@0.1.0";

/// Version tag sent by the in-sandbox driver in its `ready` handshake.
pub const SANDBOX_PROTOCOL_VERSION: &str = "judge.sandbox-proto@0.2.0";

pub const DEFAULT_ENTRY_POINT: &str = "solve";

pub const PROBLEM_TESTS_FILE: &str = "test_cases.json";
pub const PROBLEM_SUBMIT_TESTS_FILE: &str = "submit_tests.json";
pub const PROBLEM_MANIFEST_FILE: &str = "problem.json";
pub const PROBLEM_DESCRIPTION_FILE: &str = "description.md";

pub const ENV_PYTHON: &str = "JUDGE_PYTHON";
pub const ENV_SANDBOX_BACKEND: &str = "JUDGE_SANDBOX_BACKEND";
pub const ENV_ACCEPT_WEAKER_ISOLATION: &str = "JUDGE_I_ACCEPT_WEAKER_ISOLATION";
pub const ENV_LOG: &str = "JUDGE_LOG";
