//! Docker container execution
//!
//! Isolated execution in ephemeral containers. Exactly three paths are
//! mounted: the working directory (read-write, at the same path inside and
//! outside, which keeps artifact bookkeeping trivial), the uploads
//! directory (read-only), and the shared package cache (read-write, so
//! auto-installed packages persist across runs). Containers run as the
//! invoking user's uid:gid so produced files are host-owned.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::sandbox::executor::{
    extract_traceback, truncate_chars, ExecutionBackend, ExecutionRequest, ExecutionResult,
    Language, STDERR_LIMIT, STDOUT_LIMIT,
};
use crate::sandbox::{artifacts, workspace};

/// Timeout for a single in-container package install
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Docker container executor
pub struct ContainerBackend {
    docker: Docker,
    config: Arc<EngineConfig>,
}

impl ContainerBackend {
    /// Connect to the Docker daemon and verify it responds
    pub async fn connect(config: Arc<EngineConfig>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| Error::Container(format!("Docker ping failed: {}", e)))?;

        tokio::fs::create_dir_all(&config.uploads_dir).await?;
        tokio::fs::create_dir_all(&config.container.pip_cache_dir).await?;

        Ok(ContainerBackend { docker, config })
    }

    /// Volume binds for an execution container
    fn execution_binds(&self, working_dir: &Path) -> Vec<String> {
        vec![
            format!("{}:{}", working_dir.display(), working_dir.display()),
            format!(
                "{}:{}:ro",
                self.config.uploads_dir.display(),
                self.config.uploads_dir.display()
            ),
            format!(
                "{}:/pip-cache",
                self.config.container.pip_cache_dir.display()
            ),
        ]
    }

    /// Interpreter command for a script at `script_path` (same path inside
    /// the container as outside)
    fn interpreter_cmd(language: Language, script_path: &Path) -> Vec<String> {
        let script = script_path.display().to_string();
        match language {
            Language::Python => vec!["python3".to_string(), "-u".to_string(), script],
            Language::JavaScript => vec!["node".to_string(), script],
            Language::Bash | Language::Shell => {
                vec!["bash".to_string(), "-e".to_string(), script]
            }
        }
    }

    fn host_config(&self, binds: Vec<String>) -> bollard::service::HostConfig {
        bollard::service::HostConfig {
            binds: Some(binds),
            memory: parse_memory_limit(&self.config.container.memory_limit),
            nano_cpus: Some((self.config.container.cpu_limit * 1_000_000_000.0) as i64),
            network_mode: Some(self.config.container.network.clone()),
            auto_remove: Some(false),
            ..Default::default()
        }
    }

    /// uid:gid of the invoking host user
    fn host_user() -> Option<String> {
        #[cfg(unix)]
        {
            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };
            Some(format!("{}:{}", uid, gid))
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    async fn wait_for_container(&self, name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));
        if let Some(result) = stream.next().await {
            match result {
                Ok(response) => Ok(response.status_code),
                Err(e) => Err(Error::Container(format!("Wait failed: {}", e))),
            }
        } else {
            Err(Error::Container("Container wait stream ended".to_string()))
        }
    }

    async fn collect_logs(&self, name: &str) -> (String, String) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Err(e) => {
                    warn!("Error reading container logs: {}", e);
                }
                _ => {}
            }
        }
        (stdout, stderr)
    }

    /// Force-remove a container, logging rather than propagating failures
    async fn force_remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            warn!("Failed to remove container {}: {}", name, e);
        } else {
            debug!("Removed container: {}", name);
        }
    }

    /// Containers have no killable host process group; timeout teardown is
    /// an explicit kill acknowledged by the daemon, then removal.
    async fn kill_and_remove(&self, name: &str) {
        if let Err(e) = self
            .docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
        {
            warn!("Failed to kill container {}: {}", name, e);
        }
        self.force_remove(name).await;
    }

    /// Install a package into the shared cache volume via a short-lived
    /// container. Callers serialize these through the engine's install
    /// lock; concurrent writers corrupt the cache.
    pub async fn install_package(&self, package: &str) -> bool {
        let name = container_name("agentbox-pip");
        let container_config = Config {
            image: Some(self.config.container.image.clone()),
            cmd: Some(vec![
                "pip".to_string(),
                "install".to_string(),
                package.to_string(),
            ]),
            env: Some(vec!["PIP_TARGET=/pip-cache".to_string()]),
            host_config: Some(self.host_config(vec![format!(
                "{}:/pip-cache",
                self.config.container.pip_cache_dir.display()
            )])),
            ..Default::default()
        };

        let create = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        if let Err(e) = self
            .docker
            .create_container(Some(create), container_config)
            .await
        {
            warn!("Failed to create install container: {}", e);
            return false;
        }
        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            warn!("Failed to start install container: {}", e);
            self.force_remove(&name).await;
            return false;
        }

        let outcome = tokio::time::timeout(INSTALL_TIMEOUT, self.wait_for_container(&name)).await;
        match outcome {
            Ok(Ok(0)) => {
                self.force_remove(&name).await;
                true
            }
            Ok(Ok(code)) => {
                let (_, stderr) = self.collect_logs(&name).await;
                warn!(
                    "pip install {} exited {}: {}",
                    package,
                    code,
                    truncate_chars(&stderr, 200)
                );
                self.force_remove(&name).await;
                false
            }
            Ok(Err(e)) => {
                warn!("pip install {} wait failed: {}", package, e);
                self.force_remove(&name).await;
                false
            }
            Err(_) => {
                warn!("pip install {} timed out", package);
                self.kill_and_remove(&name).await;
                false
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        // The working directory is mounted read-write, so it gets the same
        // boundary check as host execution.
        if let Err(reason) =
            workspace::validate_working_dir(&request.working_dir, &self.config.approved_root)
        {
            warn!("Working directory rejected: {}", reason);
            return Ok(ExecutionResult::blocked(reason));
        }
        tokio::fs::create_dir_all(&request.working_dir).await?;

        let before = artifacts::snapshot(&request.working_dir);

        let script = tempfile::Builder::new()
            .prefix(".exec-")
            .suffix(request.language.script_suffix())
            .tempfile_in(&request.working_dir)?;
        script.as_file().write_all(request.payload.as_bytes())?;
        script.as_file().sync_all()?;

        let name = container_name("agentbox");
        let mut env = vec![
            "PIP_TARGET=/pip-cache".to_string(),
            "PYTHONPATH=/pip-cache".to_string(),
        ];
        env.extend(request.extra_env.iter().map(|(k, v)| format!("{}={}", k, v)));

        let container_config = Config {
            image: Some(self.config.container.image.clone()),
            cmd: Some(Self::interpreter_cmd(request.language, script.path())),
            env: Some(env),
            user: Self::host_user(),
            working_dir: Some(request.working_dir.display().to_string()),
            network_disabled: Some(self.config.container.network == "none"),
            host_config: Some(self.host_config(self.execution_binds(&request.working_dir))),
            ..Default::default()
        };

        info!(
            "Container exec: {} payload (timeout={}s, cwd={}, container={}, network={})",
            request.language,
            timeout.as_secs(),
            request.working_dir.display(),
            name,
            self.config.container.network
        );

        let create = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        if let Err(e) = self
            .docker
            .create_container(Some(create), container_config)
            .await
        {
            return Ok(ExecutionResult::failed(format!(
                "Container error: {}",
                e
            )));
        }
        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            self.force_remove(&name).await;
            return Ok(ExecutionResult::failed(format!("Container error: {}", e)));
        }

        let exit_code = match tokio::time::timeout(timeout, self.wait_for_container(&name)).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                warn!("Container wait error: {}", e);
                self.force_remove(&name).await;
                return Ok(ExecutionResult::failed(format!("Container error: {}", e)));
            }
            Err(_) => {
                warn!(
                    "Container execution timed out after {}s, killing {}",
                    timeout.as_secs(),
                    name
                );
                self.kill_and_remove(&name).await;
                return Ok(ExecutionResult::timeout(timeout));
            }
        };

        let (stdout, stderr) = self.collect_logs(&name).await;
        self.force_remove(&name).await;

        let exit_code = exit_code as i32;
        let mut artifact_paths = artifacts::diff(
            &before,
            &request.working_dir,
            &[script.path()],
            self.config.artifacts.sanity_threshold,
        );
        if artifact_paths.is_empty() && exit_code == 0 && !stdout.is_empty() {
            artifact_paths = artifacts::scan_stdout_for_outputs(&stdout, &request.working_dir);
        }

        let extracted_traceback = if exit_code != 0 {
            extract_traceback(&stderr)
        } else {
            String::new()
        };

        Ok(ExecutionResult {
            succeeded: exit_code == 0,
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

/// Unique per-run container name
fn container_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..12])
}

/// Parse a memory limit string (e.g., "512m", "2g") to bytes
fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.to_lowercase();
    let (num_str, unit) = if limit.ends_with('g') || limit.ends_with("gb") {
        (limit.trim_end_matches(|c| c == 'g' || c == 'b'), "g")
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        (limit.trim_end_matches(|c| c == 'm' || c == 'b'), "m")
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        (limit.trim_end_matches(|c| c == 'k' || c == 'b'), "k")
    } else {
        (limit.as_str(), "b")
    };

    let num: i64 = num_str.parse().ok()?;

    Some(match unit {
        "g" => num * 1024 * 1024 * 1024,
        "m" => num * 1024 * 1024,
        "k" => num * 1024,
        _ => num,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1024k"), Some(1024 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("junk"), None);
    }

    #[test]
    fn test_container_name_is_unique_and_prefixed() {
        let a = container_name("agentbox");
        let b = container_name("agentbox");
        assert!(a.starts_with("agentbox-"));
        assert_ne!(a, b);
        assert_eq!(a.len(), "agentbox-".len() + 12);
    }

    #[test]
    fn test_interpreter_cmd_shapes() {
        let script = Path::new("/work/.exec-ab.py");
        assert_eq!(
            ContainerBackend::interpreter_cmd(Language::Python, script),
            vec!["python3", "-u", "/work/.exec-ab.py"]
        );
        assert_eq!(
            ContainerBackend::interpreter_cmd(Language::JavaScript, Path::new("/w/s.js")),
            vec!["node", "/w/s.js"]
        );
        assert_eq!(
            ContainerBackend::interpreter_cmd(Language::Bash, Path::new("/w/s.sh")),
            vec!["bash", "-e", "/w/s.sh"]
        );
    }

    #[test]
    fn test_execution_binds_cover_exactly_three_mounts() {
        let config = Arc::new(EngineConfig::for_root("/home/op"));
        let backend = ContainerBackend {
            docker: Docker::connect_with_local_defaults().unwrap_or_else(|_| {
                // Bind construction never talks to the daemon; an offline
                // handle is fine for this test.
                Docker::connect_with_http("http://localhost:1", 1, bollard::API_DEFAULT_VERSION)
                    .expect("offline docker handle")
            }),
            config: config.clone(),
        };

        let binds = backend.execution_binds(Path::new("/home/op/outputs/case1"));
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0], "/home/op/outputs/case1:/home/op/outputs/case1");
        assert_eq!(binds[1], "/home/op/uploads:/home/op/uploads:ro");
        assert_eq!(binds[2], "/home/op/.pip-cache:/pip-cache");
    }
}
