//! Common backend trait and execution types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Maximum characters of stdout retained in a result
pub const STDOUT_LIMIT: usize = 50_000;

/// Maximum characters of stderr retained in a result
pub const STDERR_LIMIT: usize = 20_000;

/// Supported payload languages
///
/// `Shell` is a raw command line handed to the shell as-is; `Bash` is a
/// script body materialized to a file and run under `bash -e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Bash,
    Shell,
}

impl Language {
    /// File suffix for the temporary payload script
    pub fn script_suffix(&self) -> &'static str {
        match self {
            Language::Python => ".py",
            Language::JavaScript => ".js",
            Language::Bash | Language::Shell => ".sh",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "javascript" | "js" => Ok(Language::JavaScript),
            "bash" => Ok(Language::Bash),
            "shell" | "sh" | "shell-raw" => Ok(Language::Shell),
            _ => Err(crate::Error::InvalidInput(format!(
                "Unsupported language: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
            Language::Bash => write!(f, "bash"),
            Language::Shell => write!(f, "shell"),
        }
    }
}

/// Request to execute a payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source text or shell command line
    pub payload: String,
    /// Payload language
    pub language: Language,
    /// Execution timeout; the engine applies its configured default when
    /// absent and clamps to the configured maximum either way
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Absolute working directory; must resolve inside the approved root
    pub working_dir: PathBuf,
    /// Virtual-environment-like prefix whose binaries are preferred over
    /// system-wide ones
    #[serde(default)]
    pub interpreter_root: Option<PathBuf>,
    /// Extra environment variables layered over the filtered environment
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
}

impl ExecutionRequest {
    /// Create a new execution request
    pub fn new(
        payload: impl Into<String>,
        language: Language,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        ExecutionRequest {
            payload: payload.into(),
            language,
            timeout: None,
            working_dir: working_dir.into(),
            interpreter_root: None,
            extra_env: HashMap::new(),
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the interpreter root (e.g. a virtualenv prefix)
    pub fn with_interpreter_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.interpreter_root = Some(root.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }
}

/// Result of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the payload ran to completion with exit code zero
    pub succeeded: bool,
    /// Process exit code; -1 when nothing ran
    pub exit_code: i32,
    /// Captured standard output, bounded
    pub stdout: String,
    /// Captured standard error, bounded
    pub stderr: String,
    /// Trailing interpreter traceback pulled from stderr, if any
    pub extracted_traceback: String,
    /// Absolute paths of genuine output files, sorted
    pub artifact_paths: Vec<String>,
    /// Whether the run was forcibly terminated at its deadline
    pub timed_out: bool,
    /// Packages installed by the auto-recovery loop during this call
    pub auto_installed_packages: Vec<String>,
}

impl ExecutionResult {
    /// Result for a payload refused before anything was spawned
    pub fn blocked(reason: impl Into<String>) -> Self {
        ExecutionResult {
            succeeded: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.into(),
            extracted_traceback: String::new(),
            artifact_paths: Vec::new(),
            timed_out: false,
            auto_installed_packages: Vec::new(),
        }
    }

    /// Result for a run that died on infrastructure error rather than its
    /// own exit code
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecutionResult::blocked(reason)
    }

    /// Result for a run killed at its deadline
    pub fn timeout(timeout: Duration) -> Self {
        ExecutionResult {
            succeeded: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("Execution timed out after {}s", timeout.as_secs()),
            extracted_traceback: String::new(),
            artifact_paths: Vec::new(),
            timed_out: true,
            auto_installed_packages: Vec::new(),
        }
    }
}

/// Trait for execution backends
///
/// Both implementations follow the same sequence: validate the working
/// directory, snapshot it, materialize the payload, run to completion under
/// the deadline, re-scan for artifacts, and always clean up the temporary
/// script.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Execute the request with an already-resolved timeout
    async fn execute(&self, request: &ExecutionRequest, timeout: Duration)
        -> Result<ExecutionResult>;
}

/// Truncate to at most `max` characters, on a character boundary
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Extract the last Python traceback block from stderr
///
/// Scans forward keeping the final `Traceback (most recent call last):`
/// marker so chained exceptions report the failure the interpreter died on.
pub(crate) fn extract_traceback(stderr: &str) -> String {
    if stderr.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let mut start = None;
    for (i, line) in lines.iter().enumerate() {
        if line.contains("Traceback (most recent call last):") {
            start = Some(i);
        }
    }
    match start {
        Some(i) => lines[i..].join("\n"),
        None => String::new(),
    }
}
