//! Sandbox module - sandboxed execution engine
//!
//! Receives a code/command payload plus execution parameters, screens it,
//! runs it on one of two backends, and reports what the run actually
//! produced:
//! - Subprocess: direct host process in its own process group
//! - Container: ephemeral Docker container with restricted mounts
//!
//! The container backend is preferred whenever it is enabled and the
//! runtime is reachable; otherwise execution silently falls back to the
//! subprocess backend.

pub mod artifacts;
pub mod availability;
pub mod container;
pub mod env;
pub mod executor;
pub mod resolver;
pub mod safety;
pub mod subprocess;
pub mod workspace;

pub use executor::{ExecutionBackend, ExecutionRequest, ExecutionResult, Language};
pub use resolver::MissingModule;
pub use safety::SafetyVerdict;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use availability::AvailabilityCache;
use container::ContainerBackend;
use executor::truncate_chars;
use subprocess::SubprocessBackend;

/// Timeout for a single host-side package install
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// The execution engine
///
/// All mutable shared state lives here — the runtime availability cache
/// and the install serialization lock — constructed once at process start
/// and passed by handle into every call. There are no package-level
/// globals to monkey-patch around in tests.
pub struct Engine {
    config: Arc<EngineConfig>,
    availability: AvailabilityCache,
    /// Serializes package installs into the shared cache volume;
    /// concurrent writers corrupt it.
    install_lock: Mutex<()>,
}

impl Engine {
    /// Create an engine from configuration
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config: Arc::new(config),
            availability: AvailabilityCache::new(),
            install_lock: Mutex::new(()),
        }
    }

    /// The engine's configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a single request on the appropriate backend
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let timeout = self.resolve_timeout(request);
        let backend = self.select_backend(request.language).await;
        debug!("Dispatching to {} backend", backend.name());
        backend.execute(request, timeout).await
    }

    /// Execute with bounded install-and-retry recovery for missing
    /// Python packages.
    ///
    /// On a failure carrying a module-not-found signature, the mapped
    /// package is installed (inside the container against the shared
    /// cache, or via the interpreter root's pip on the host) and the same
    /// request is re-executed from scratch. Successfully installed
    /// packages are recorded on the final result; a failed install
    /// returns the failing result unmodified.
    pub async fn execute_with_auto_install(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let max_retries = self.config.max_install_retries;
        let mut installed: Vec<String> = Vec::new();
        let mut attempt = 0u32;

        loop {
            let mut result = self.execute(request).await?;

            if result.succeeded {
                if !installed.is_empty() {
                    result
                        .stdout
                        .push_str(&format!("\n[auto-installed: {}]", installed.join(", ")));
                }
                result.auto_installed_packages = installed;
                return Ok(result);
            }

            let failure_text = if result.extracted_traceback.is_empty() {
                &result.stderr
            } else {
                &result.extracted_traceback
            };
            let missing = match resolver::detect_missing_module(failure_text) {
                Some(missing) if attempt < max_retries => missing,
                _ => {
                    result.auto_installed_packages = installed;
                    return Ok(result);
                }
            };

            info!(
                "Auto-installing missing module {} as {} (attempt {})",
                missing.module,
                missing.package,
                attempt + 1
            );
            if !self.install_package(&missing.package, request).await {
                warn!("Auto-install failed for {}", missing.package);
                result.auto_installed_packages = installed;
                return Ok(result);
            }
            installed.push(missing.package);
            attempt += 1;
        }
    }

    /// Pick the backend for this call. Raw shell commands always run on
    /// the host; script languages go to the container when it is enabled
    /// and reachable.
    async fn select_backend(&self, language: Language) -> Box<dyn ExecutionBackend> {
        if self.container_active(language).await {
            match ContainerBackend::connect(self.config.clone()).await {
                Ok(backend) => return Box::new(backend),
                Err(e) => {
                    warn!(
                        "Container runtime unreachable ({}), falling back to subprocess",
                        e
                    );
                }
            }
        }
        Box::new(SubprocessBackend::new(self.config.clone()))
    }

    async fn container_active(&self, language: Language) -> bool {
        language != Language::Shell
            && self.config.container.enabled
            && self
                .availability
                .container_available(&self.config.container)
                .await
    }

    async fn install_package(&self, package: &str, request: &ExecutionRequest) -> bool {
        if self.container_active(request.language).await {
            match ContainerBackend::connect(self.config.clone()).await {
                Ok(backend) => {
                    let _guard = self.install_lock.lock().await;
                    return backend.install_package(package).await;
                }
                Err(e) => {
                    warn!("Container install unavailable: {}", e);
                    return false;
                }
            }
        }

        let pip = resolver::pip_binary(request.interpreter_root.as_deref());
        let command = format!("{} install {}", pip.display(), package);
        let install_request =
            ExecutionRequest::new(command, Language::Shell, request.working_dir.clone());
        let backend = SubprocessBackend::new(self.config.clone());
        match backend.execute(&install_request, INSTALL_TIMEOUT).await {
            Ok(result) if result.succeeded => true,
            Ok(result) => {
                warn!(
                    "pip install {} failed: {}",
                    package,
                    truncate_chars(&result.stderr, 200)
                );
                false
            }
            Err(e) => {
                warn!("pip install {} errored: {}", package, e);
                false
            }
        }
    }

    fn resolve_timeout(&self, request: &ExecutionRequest) -> Duration {
        request
            .timeout
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs))
            .min(Duration::from_secs(self.config.max_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine_in(root: &std::path::Path) -> Engine {
        Engine::new(EngineConfig::for_root(root))
    }

    #[cfg(unix)]
    fn fake_venv(root: &std::path::Path, pip_script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let venv = root.join("venv-fixture");
        let bin = venv.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let pip = bin.join("pip");
        std::fs::write(&pip, pip_script).unwrap();
        std::fs::set_permissions(&pip, std::fs::Permissions::from_mode(0o755)).unwrap();
        venv
    }

    #[tokio::test]
    async fn test_end_to_end_shell_artifact() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let engine = engine_in(&root);
        let work = root.join("case1");

        let request = ExecutionRequest::new("echo hi > out.txt", Language::Shell, work.clone())
            .with_timeout(Duration::from_secs(10));
        let result = engine.execute(&request).await.unwrap();

        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        assert_eq!(
            result.artifact_paths,
            vec![work.join("out.txt").display().to_string()]
        );
    }

    #[tokio::test]
    async fn test_end_to_end_blocked_shell() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let engine = engine_in(&root);

        let request = ExecutionRequest::new("rm -rf ~/", Language::Shell, root.join("case2"));
        let result = engine.execute(&request).await.unwrap();

        assert!(!result.succeeded);
        assert!(result.stderr.contains("BLOCKED"));
        assert!(result.stderr.contains("rm"));
    }

    #[tokio::test]
    async fn test_timeout_is_clamped_to_configured_maximum() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path());

        let request = ExecutionRequest::new("echo hi", Language::Shell, dir.path())
            .with_timeout(Duration::from_secs(86_400));
        assert_eq!(engine.resolve_timeout(&request), Duration::from_secs(600));

        let request = ExecutionRequest::new("echo hi", Language::Shell, dir.path());
        assert_eq!(engine.resolve_timeout(&request), Duration::from_secs(120));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auto_install_retries_and_records_package() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let engine = engine_in(&root);
        let venv = fake_venv(&root, "#!/bin/bash\nexit 0\n");
        let work = root.join("retry-case");

        // Fails with a module-not-found signature on the first run only
        let payload = "\
if [ ! -f marker ]; then\n\
  touch marker\n\
  echo \"ModuleNotFoundError: No module named 'PIL'\" >&2\n\
  exit 1\n\
fi\n\
echo ok\n";
        let request = ExecutionRequest::new(payload, Language::Bash, work)
            .with_interpreter_root(&venv)
            .with_timeout(Duration::from_secs(10));
        let result = engine.execute_with_auto_install(&request).await.unwrap();

        assert!(result.succeeded);
        assert_eq!(result.auto_installed_packages, vec!["Pillow".to_string()]);
        assert!(result.stdout.contains("[auto-installed: Pillow]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_install_returns_original_failure() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let engine = engine_in(&root);
        let venv = fake_venv(
            &root,
            "#!/bin/bash\necho invoked >> \"$PWD/pip-calls.log\"\nexit 1\n",
        );
        let work = root.join("fail-case");

        let payload = "echo \"ModuleNotFoundError: No module named 'cv2'\" >&2\nexit 1\n";
        let request = ExecutionRequest::new(payload, Language::Bash, work.clone())
            .with_interpreter_root(&venv)
            .with_timeout(Duration::from_secs(10));
        let result = engine.execute_with_auto_install(&request).await.unwrap();

        assert!(!result.succeeded);
        assert!(result.auto_installed_packages.is_empty());
        assert!(result.stderr.contains("ModuleNotFoundError"));
        // Exactly one install attempt for the mapped package
        let calls = std::fs::read_to_string(work.join("pip-calls.log")).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_skips_install() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let engine = engine_in(&root);

        let request = ExecutionRequest::new(
            "echo 'SyntaxError: invalid syntax' >&2\nexit 1",
            Language::Bash,
            root.join("syntax-case"),
        )
        .with_timeout(Duration::from_secs(10));
        let result = engine.execute_with_auto_install(&request).await.unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 1);
        assert!(result.auto_installed_packages.is_empty());
    }
}
