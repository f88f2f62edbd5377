//! Server-side coding-question evaluation.
//!
//! The candidate's code runs against the question's stored test cases, one
//! subprocess per test with a hard 1 s timeout. Before anything executes, a
//! banned-token screen rejects code that reaches for imports, process
//! control, or the filesystem; inside the subprocess the harness exposes a
//! short allow-list of builtins and nothing else.
//!
//! The interpreter is dispatched behind [`CodeEvaluator`] so environments
//! without one (and unit tests) degrade to per-test `evaluator_unavailable`
//! results instead of failing the endpoint.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Hard cap per test case.
pub const PER_TEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum accepted code size in bytes.
pub const MAX_CODE_LEN: usize = 64 * 1024;

/// Maximum test cases per evaluation.
pub const MAX_TESTS: usize = 32;

/// Tokens that reject code before anything executes.
const BANNED_TOKENS: &[&str] = &[
    "import ",
    "__import__",
    "open(",
    "exec(",
    "eval(",
    "os.",
    "sys.",
    "subprocess",
    "socket",
    "thread",
    "fork",
    "spawn",
];

/// The in-process harness: reads `{code, functionName, input, expected}` on
/// stdin, executes under a builtin allow-list, prints one JSON result line.
const PYTHON_HARNESS: &str = r#"
import json, sys

ALLOWED = {
    "len": len, "range": range, "list": list, "dict": dict, "set": set,
    "sum": sum, "min": min, "max": max, "sorted": sorted,
    "enumerate": enumerate, "abs": abs, "all": all, "any": any,
}

def main():
    payload = json.load(sys.stdin)
    g = {"__builtins__": ALLOWED}
    l = {}
    try:
        exec(payload["code"], g, l)
        fn = l.get(payload["functionName"]) or g.get(payload["functionName"])
        if not callable(fn):
            print(json.dumps({"error": "function_not_found"}))
            return
        inp = payload.get("input", [])
        actual = fn(*inp) if isinstance(inp, list) else fn(inp)
        ok = actual == payload.get("expected")
        try:
            print(json.dumps({"actual": actual, "pass": ok}))
        except Exception:
            print(json.dumps({"actual": repr(actual), "pass": ok}))
    except Exception as e:
        print(json.dumps({"error": str(e)}))

main()
"#;

/// One test case from the question metadata or request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeTest {
    /// Arguments; a JSON array spreads into positional args.
    #[serde(default)]
    pub input: Value,
    /// Expected return value.
    #[serde(default)]
    pub expected: Value,
}

/// Outcome of one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// The test's input, echoed.
    pub input: Value,
    /// The test's expected value, echoed.
    pub expected: Value,
    /// The actual return value, when the call completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    /// Whether actual equals expected.
    pub pass: bool,
    /// Failure description: `timeout`, `function_not_found`,
    /// `evaluator_unavailable`, or the raised error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pre-execution rejections, surfaced as `validation_failed`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeEvalError {
    /// The code contains a banned token.
    #[error("code contains disallowed construct")]
    DisallowedCode,

    /// The code exceeds [`MAX_CODE_LEN`].
    #[error("code too large: {len} bytes (max {max})")]
    CodeTooLarge {
        /// Submitted size.
        len: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// Too many test cases.
    #[error("too many tests: {len} (max {max})")]
    TooManyTests {
        /// Submitted count.
        len: usize,
        /// Maximum accepted count.
        max: usize,
    },
}

/// Screens code before execution.
///
/// # Errors
///
/// Rejects oversized code and code carrying any banned token.
pub fn screen(code: &str, tests: &[CodeTest]) -> Result<(), CodeEvalError> {
    if code.len() > MAX_CODE_LEN {
        return Err(CodeEvalError::CodeTooLarge {
            len: code.len(),
            max: MAX_CODE_LEN,
        });
    }
    if tests.len() > MAX_TESTS {
        return Err(CodeEvalError::TooManyTests {
            len: tests.len(),
            max: MAX_TESTS,
        });
    }
    let lowered = code.to_lowercase();
    if BANNED_TOKENS.iter().any(|t| lowered.contains(t)) {
        return Err(CodeEvalError::DisallowedCode);
    }
    Ok(())
}

/// Dispatch over available evaluation backends.
pub enum CodeEvaluator {
    /// Shell out to a Python interpreter.
    Python(PythonSubprocessEvaluator),
    /// No interpreter available; every test reports `evaluator_unavailable`.
    Unavailable,
}

impl CodeEvaluator {
    /// Picks the subprocess evaluator with the default interpreter name.
    #[must_use]
    pub fn detect() -> Self {
        Self::Python(PythonSubprocessEvaluator::new("python3"))
    }

    /// Runs all tests after screening.
    ///
    /// # Errors
    ///
    /// [`CodeEvalError`] from the pre-execution screen only; individual test
    /// failures land in their [`TestResult`].
    pub async fn evaluate(
        &self,
        code: &str,
        function_name: &str,
        tests: &[CodeTest],
    ) -> Result<Vec<TestResult>, CodeEvalError> {
        screen(code, tests)?;
        match self {
            Self::Python(evaluator) => Ok(evaluator.run_all(code, function_name, tests).await),
            Self::Unavailable => Ok(tests
                .iter()
                .map(|t| TestResult {
                    input: t.input.clone(),
                    expected: t.expected.clone(),
                    actual: None,
                    pass: false,
                    error: Some("evaluator_unavailable".to_string()),
                })
                .collect()),
        }
    }
}

/// Runs each test in its own short-lived interpreter process.
pub struct PythonSubprocessEvaluator {
    interpreter: String,
}

impl PythonSubprocessEvaluator {
    /// Creates an evaluator using the named interpreter binary.
    #[must_use]
    pub fn new(interpreter: &str) -> Self {
        Self {
            interpreter: interpreter.to_string(),
        }
    }

    async fn run_all(&self, code: &str, function_name: &str, tests: &[CodeTest]) -> Vec<TestResult> {
        let mut results = Vec::with_capacity(tests.len());
        for test in tests {
            results.push(self.run_one(code, function_name, test).await);
        }
        results
    }

    async fn run_one(&self, code: &str, function_name: &str, test: &CodeTest) -> TestResult {
        let payload = serde_json::json!({
            "code": code,
            "functionName": function_name,
            "input": test.input,
            "expected": test.expected,
        });

        let failed = |error: &str| TestResult {
            input: test.input.clone(),
            expected: test.expected.clone(),
            actual: None,
            pass: false,
            error: Some(error.to_string()),
        };

        let spawned = Command::new(&self.interpreter)
            .arg("-c")
            .arg(PYTHON_HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(_) => return failed("evaluator_unavailable"),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(payload.to_string().as_bytes()).await.is_err() {
                return failed("evaluator_unavailable");
            }
        }

        let output = match tokio::time::timeout(PER_TEST_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(_)) => return failed("evaluator_unavailable"),
            // kill_on_drop reaps the interpreter when the future is dropped.
            Err(_) => return failed("timeout"),
        };

        let Ok(parsed) = serde_json::from_slice::<Value>(&output.stdout) else {
            return failed("no_result");
        };
        if let Some(error) = parsed.get("error").and_then(Value::as_str) {
            return failed(error);
        }
        TestResult {
            input: test.input.clone(),
            expected: test.expected.clone(),
            actual: parsed.get("actual").cloned(),
            pass: parsed.get("pass").and_then(Value::as_bool).unwrap_or(false),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tests_of(n: usize) -> Vec<CodeTest> {
        (0..n)
            .map(|i| CodeTest {
                input: serde_json::json!([i]),
                expected: serde_json::json!(i),
            })
            .collect()
    }

    #[test]
    fn test_screen_rejects_banned_tokens() {
        for code in [
            "import os",
            "__import__('os')",
            "open('/etc/passwd')",
            "exec('x')",
            "os.system('ls')",
        ] {
            assert_eq!(
                screen(code, &[]).unwrap_err(),
                CodeEvalError::DisallowedCode
            );
        }
    }

    #[test]
    fn test_screen_accepts_plain_code() {
        assert!(screen("def f(x):\n    return x + 1", &tests_of(3)).is_ok());
    }

    #[test]
    fn test_screen_bounds() {
        let big = "x".repeat(MAX_CODE_LEN + 1);
        assert!(matches!(
            screen(&big, &[]).unwrap_err(),
            CodeEvalError::CodeTooLarge { .. }
        ));
        assert!(matches!(
            screen("def f(): pass", &tests_of(MAX_TESTS + 1)).unwrap_err(),
            CodeEvalError::TooManyTests { .. }
        ));
    }

    #[tokio::test]
    async fn test_unavailable_evaluator_degrades_per_test() {
        let evaluator = CodeEvaluator::Unavailable;
        let results = evaluator
            .evaluate("def f(x):\n    return x", "f", &tests_of(2))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        for result in results {
            assert!(!result.pass);
            assert_eq!(result.error.as_deref(), Some("evaluator_unavailable"));
        }
    }

    #[tokio::test]
    async fn test_banned_code_never_reaches_evaluator() {
        let evaluator = CodeEvaluator::Unavailable;
        let err = evaluator
            .evaluate("import os", "f", &tests_of(1))
            .await
            .unwrap_err();
        assert_eq!(err, CodeEvalError::DisallowedCode);
    }
}
