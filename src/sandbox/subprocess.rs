//! Direct subprocess execution
//!
//! Runs the payload as a child of the host in a fresh process group so a
//! timeout can kill the whole tree, with a redacted environment and stdin
//! bound to the null device (the caller may live inside a daemon with no
//! usable controlling terminal).

use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::sandbox::executor::{
    extract_traceback, truncate_chars, ExecutionBackend, ExecutionRequest, ExecutionResult,
    Language, STDERR_LIMIT, STDOUT_LIMIT,
};
use crate::sandbox::{artifacts, env, safety, workspace};

/// Host subprocess executor
pub struct SubprocessBackend {
    config: Arc<EngineConfig>,
}

impl SubprocessBackend {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        SubprocessBackend { config }
    }

    /// Payload screening for this backend. The container backend skips the
    /// source scan because filesystem isolation is the boundary there.
    fn classify(&self, request: &ExecutionRequest) -> Option<String> {
        let verdict = match request.language {
            Language::Python => safety::classify_code(&request.payload),
            Language::Shell => safety::classify_command(&request.payload),
            _ => return None,
        };
        if verdict.allowed {
            None
        } else {
            Some(verdict.reason)
        }
    }

    /// Script body to materialize. Raw shell commands get a venv
    /// activation prefix when an interpreter root is supplied.
    fn script_body(&self, request: &ExecutionRequest) -> String {
        if request.language == Language::Shell {
            if let Some(root) = &request.interpreter_root {
                let activate = root.join("bin").join("activate");
                if activate.exists() {
                    return format!("source '{}' && {}", activate.display(), request.payload);
                }
                warn!("Venv activate not found: {}", activate.display());
            }
        }
        request.payload.clone()
    }

    /// Interpreter invocation for a materialized script
    fn interpreter(&self, request: &ExecutionRequest) -> (PathBuf, Vec<String>) {
        match request.language {
            Language::Python => {
                let python = request
                    .interpreter_root
                    .as_ref()
                    .map(|root| root.join("bin").join("python3"))
                    .unwrap_or_else(|| PathBuf::from("python3"));
                (python, vec!["-u".to_string()])
            }
            Language::JavaScript => (PathBuf::from("node"), Vec::new()),
            Language::Bash => (PathBuf::from("bash"), vec!["-e".to_string()]),
            Language::Shell => (PathBuf::from("bash"), Vec::new()),
        }
    }
}

#[async_trait]
impl ExecutionBackend for SubprocessBackend {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        if let Err(reason) =
            workspace::validate_working_dir(&request.working_dir, &self.config.approved_root)
        {
            warn!("Working directory rejected: {}", reason);
            return Ok(ExecutionResult::blocked(reason));
        }
        tokio::fs::create_dir_all(&request.working_dir).await?;

        let before = artifacts::snapshot(&request.working_dir);

        if let Some(reason) = self.classify(request) {
            warn!("Payload blocked: {}", reason);
            return Ok(ExecutionResult::blocked(reason));
        }

        // Randomized name avoids collisions across concurrent requests in
        // one directory; the file is removed on drop, error paths included.
        let script = tempfile::Builder::new()
            .prefix(".exec-")
            .suffix(request.language.script_suffix())
            .tempfile_in(&request.working_dir)?;
        script
            .as_file()
            .write_all(self.script_body(request).as_bytes())?;
        script.as_file().sync_all()?;

        let (program, mut args) = self.interpreter(request);
        args.push(script.path().display().to_string());

        info!(
            "Executing {} payload (timeout={}s, cwd={})",
            request.language,
            timeout.as_secs(),
            request.working_dir.display()
        );

        let filtered = env::filtered_environment(&self.config.env);
        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&request.working_dir)
            .env_clear()
            .envs(&filtered)
            .envs(&request.extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // The child becomes its own group leader so the timeout path can
        // take out grandchildren too.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(set_process_group);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn {}: {}", program.display(), e);
                return Ok(ExecutionResult::failed(format!(
                    "Failed to start {}: {}",
                    program.display(),
                    e
                )));
            }
        };

        let stdout_task = tokio::spawn(read_to_end(child.stdout.take()));
        let stderr_task = tokio::spawn(read_to_end(child.stderr.take()));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!("Process wait error: {}", e);
                terminate_tree(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(ExecutionResult::failed(format!("Process error: {}", e)));
            }
            Err(_) => {
                warn!(
                    "Execution timed out after {}s, killing process group",
                    timeout.as_secs()
                );
                terminate_tree(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(ExecutionResult::timeout(timeout));
            }
        };

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
        let stderr = String::from_utf8_lossy(&stderr_bytes).to_string();
        let exit_code = status.code().unwrap_or(-1);

        let mut artifact_paths = artifacts::diff(
            &before,
            &request.working_dir,
            &[script.path()],
            self.config.artifacts.sanity_threshold,
        );
        if artifact_paths.is_empty() && status.success() && !stdout.is_empty() {
            artifact_paths = artifacts::scan_stdout_for_outputs(&stdout, &request.working_dir);
        }

        let extracted_traceback = if exit_code != 0 {
            extract_traceback(&stderr)
        } else {
            String::new()
        };

        Ok(ExecutionResult {
            succeeded: status.success(),
            exit_code,
            stdout: truncate_chars(&stdout, STDOUT_LIMIT),
            stderr: truncate_chars(&stderr, STDERR_LIMIT),
            extracted_traceback,
            artifact_paths: artifact_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            timed_out: false,
            auto_installed_packages: Vec::new(),
        })
    }
}

async fn read_to_end(stream: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

/// Kill the child's whole process group and wait for the kill to land, so
/// nothing outlives the call that spawned it.
async fn terminate_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            kill_process_group(pid);
            let _ = child.wait().await;
            return;
        }
    }
    let _ = child.kill().await;
}

/// Put the calling process into its own process group; runs in `pre_exec`.
#[cfg(unix)]
fn set_process_group() -> std::io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// SIGKILL the process group led by `pid`, best-effort
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let pid = pid as libc::pid_t;
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid == -1 {
        return;
    }
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn backend_in(root: &std::path::Path) -> SubprocessBackend {
        SubprocessBackend::new(Arc::new(EngineConfig::for_root(root)))
    }

    #[tokio::test]
    async fn test_bash_script_captures_stdout() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);

        let request = ExecutionRequest::new("echo hello world", Language::Bash, root.join("run"));
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello world"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_shell_command_produces_artifact() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);
        let work = root.join("case1");

        let request = ExecutionRequest::new("echo hi > out.txt", Language::Shell, work.clone());
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(
            result.artifact_paths,
            vec![work.join("out.txt").display().to_string()]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_failure() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);

        let request = ExecutionRequest::new(
            "echo broken >&2\nexit 3",
            Language::Shell,
            root.join("run"),
        );
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("broken"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);

        let request = ExecutionRequest::new("sleep 30", Language::Bash, root.join("run"));
        let started = Instant::now();
        let result = backend
            .execute(&request, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.succeeded);
        // The kill is acknowledged before return; we never wait out the sleep
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_blocked_command_short_circuits() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);
        let work = root.join("run");

        let request = ExecutionRequest::new("rm -rf ~/", Language::Shell, work.clone());
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert!(result.stderr.contains("BLOCKED"));
        assert!(result.artifact_paths.is_empty());
        // Nothing ran, so the payload script never hit the directory
        assert!(std::fs::read_dir(&work).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_blocked_code_short_circuits() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);

        let request = ExecutionRequest::new(
            "print(open('/etc/passwd').read())",
            Language::Python,
            root.join("run"),
        );
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert!(result.stderr.contains("BLOCKED"));
    }

    #[tokio::test]
    async fn test_working_dir_outside_root_is_rejected() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);

        let request = ExecutionRequest::new("echo hi", Language::Shell, "/etc/agentbox-test");
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert!(result.stderr.contains("outside the approved root"));
    }

    #[tokio::test]
    async fn test_extra_env_reaches_child() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);

        let request = ExecutionRequest::new("echo value=$PLOT_STYLE", Language::Shell, root.join("run"))
            .with_env("PLOT_STYLE", "dark");
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result.succeeded);
        assert!(result.stdout.contains("value=dark"));
    }

    #[tokio::test]
    async fn test_credential_vars_are_stripped() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);
        std::env::set_var("AGENTBOX_TEST_TOKEN", "sekret");

        let request = ExecutionRequest::new(
            "echo value=${AGENTBOX_TEST_TOKEN:-redacted}",
            Language::Shell,
            root.join("run"),
        );
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        std::env::remove_var("AGENTBOX_TEST_TOKEN");
        assert!(result.succeeded);
        assert!(result.stdout.contains("value=redacted"));
    }

    #[tokio::test]
    async fn test_temp_script_is_cleaned_up() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = backend_in(&root);
        let work = root.join("run");

        let request = ExecutionRequest::new("echo done", Language::Bash, work.clone());
        let result = backend
            .execute(&request, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result.succeeded);
        let leftovers: Vec<_> = std::fs::read_dir(&work)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    }
}
