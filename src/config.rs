//! Configuration management for AgentBox
//!
//! Loads configuration from environment variables and an optional .env file.

use crate::{Error, Result};
use std::path::PathBuf;

/// Docker/container configuration
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Whether container isolation is enabled at all
    pub enabled: bool,
    /// Docker image to use
    pub image: String,
    /// Network mode (none, bridge, host)
    pub network: String,
    /// Memory limit (e.g. "2g")
    pub memory_limit: String,
    /// CPU limit (number of CPUs)
    pub cpu_limit: f64,
    /// Shared package-cache volume, mounted at /pip-cache inside containers
    pub pip_cache_dir: PathBuf,
}

/// Credential redaction rules for child-process environments
#[derive(Debug, Clone)]
pub struct EnvFilterConfig {
    /// Variable names stripped by exact match (the orchestrator's own keys)
    pub protected_keys: Vec<String>,
    /// Case-insensitive substrings; any variable whose name contains one is stripped
    pub protected_substrings: Vec<String>,
}

impl Default for EnvFilterConfig {
    fn default() -> Self {
        EnvFilterConfig {
            protected_keys: vec![
                "ANTHROPIC_API_KEY".to_string(),
                "TELEGRAM_BOT_TOKEN".to_string(),
            ],
            protected_substrings: vec![
                "KEY".to_string(),
                "TOKEN".to_string(),
                "SECRET".to_string(),
                "PASSWORD".to_string(),
                "CREDENTIAL".to_string(),
            ],
        }
    }
}

/// Artifact detection tuning
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    /// Candidate count above which a dependency-install leak is assumed and
    /// the list is re-filtered to known output extensions
    pub sanity_threshold: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        ArtifactConfig {
            sanity_threshold: 20,
        }
    }
}

/// Main engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory; every working directory must resolve inside it
    pub approved_root: PathBuf,
    /// Read-only uploads directory mounted into containers
    pub uploads_dir: PathBuf,
    /// Default execution timeout in seconds
    pub default_timeout_secs: u64,
    /// Hard cap on any single execution
    pub max_timeout_secs: u64,
    /// Container settings
    pub container: ContainerConfig,
    /// Environment redaction settings
    pub env: EnvFilterConfig,
    /// Artifact detection settings
    pub artifacts: ArtifactConfig,
    /// Maximum install-and-retry attempts for missing packages
    pub max_install_retries: u32,
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        let workspace = std::env::var("AGENTBOX_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".agentbox").join("workspace"));

        Ok(EngineConfig {
            approved_root: std::env::var("APPROVED_ROOT")
                .map(PathBuf::from)
                .unwrap_or(home),
            uploads_dir: std::env::var("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace.join("uploads")),
            default_timeout_secs: std::env::var("EXECUTION_TIMEOUT")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
            max_timeout_secs: std::env::var("MAX_EXECUTION_TIMEOUT")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .unwrap_or(600),
            container: ContainerConfig {
                enabled: std::env::var("DOCKER_ENABLED")
                    .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                    .unwrap_or(false),
                image: std::env::var("DOCKER_IMAGE")
                    .unwrap_or_else(|_| "agentbox-sandbox".to_string()),
                network: std::env::var("DOCKER_NETWORK")
                    .unwrap_or_else(|_| "bridge".to_string()),
                memory_limit: std::env::var("DOCKER_MEMORY_LIMIT")
                    .unwrap_or_else(|_| "2g".to_string()),
                cpu_limit: std::env::var("DOCKER_CPU_LIMIT")
                    .unwrap_or_else(|_| "2.0".to_string())
                    .parse()
                    .unwrap_or(2.0),
                pip_cache_dir: std::env::var("DOCKER_PIP_CACHE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| workspace.join(".pip-cache")),
            },
            env: EnvFilterConfig::default(),
            artifacts: ArtifactConfig::default(),
            max_install_retries: std::env::var("MAX_INSTALL_RETRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
        })
    }

    /// Create a config rooted at a specific directory, for tests or embedders
    /// that manage their own workspace layout
    pub fn for_root(approved_root: impl Into<PathBuf>) -> Self {
        let approved_root = approved_root.into();
        EngineConfig {
            uploads_dir: approved_root.join("uploads"),
            default_timeout_secs: 120,
            max_timeout_secs: 600,
            container: ContainerConfig {
                enabled: false,
                image: "agentbox-sandbox".to_string(),
                network: "bridge".to_string(),
                memory_limit: "2g".to_string(),
                cpu_limit: 2.0,
                pip_cache_dir: approved_root.join(".pip-cache"),
            },
            env: EnvFilterConfig::default(),
            artifacts: ArtifactConfig::default(),
            max_install_retries: 2,
            approved_root,
        }
    }

    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if !self.approved_root.is_absolute() {
            return Err(Error::Config(format!(
                "Approved root must be an absolute path, got {}",
                self.approved_root.display()
            )));
        }
        if self.default_timeout_secs == 0 {
            return Err(Error::Config(
                "EXECUTION_TIMEOUT must be greater than zero".to_string(),
            ));
        }
        if self.max_timeout_secs < self.default_timeout_secs {
            return Err(Error::Config(format!(
                "MAX_EXECUTION_TIMEOUT ({}) is below the default timeout ({})",
                self.max_timeout_secs, self.default_timeout_secs
            )));
        }
        Ok(())
    }
}
