//! Container runtime availability cache
//!
//! Probing Docker costs a daemon round-trip, so the answer is cached with a
//! short TTL. A missing runtime is an expected condition that triggers
//! subprocess fallback; nothing here ever errors to the caller.

use bollard::Docker;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ContainerConfig;

const CACHE_TTL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct CacheState {
    available: bool,
    checked_at: Option<Instant>,
}

/// Lazily refreshed availability state, one per engine.
/// A stale read for up to the TTL window is acceptable; rare writer
/// refresh under the lock, concurrent readers otherwise.
#[derive(Debug, Default)]
pub struct AvailabilityCache {
    state: Mutex<CacheState>,
}

impl AvailabilityCache {
    pub fn new() -> Self {
        AvailabilityCache::default()
    }

    /// Whether the container runtime and the configured image are usable
    pub async fn container_available(&self, config: &ContainerConfig) -> bool {
        let mut state = self.state.lock().await;
        if let Some(checked_at) = state.checked_at {
            if checked_at.elapsed() < CACHE_TTL {
                return state.available;
            }
        }
        let available = probe(config).await;
        state.available = available;
        state.checked_at = Some(Instant::now());
        debug!("Docker availability refreshed: {}", available);
        available
    }
}

async fn probe(config: &ContainerConfig) -> bool {
    // Fast-fail when the control socket is absent, skipping the daemon
    // round-trip entirely. DOCKER_HOST means a remote daemon over TCP/SSH
    // with no local socket, so the check only applies without it.
    if std::env::var("DOCKER_HOST").is_err() && !socket_present() {
        warn!("Docker socket not found. Falling back to subprocess execution.");
        return false;
    }

    let docker = match Docker::connect_with_local_defaults() {
        Ok(docker) => docker,
        Err(e) => {
            warn!(
                "Docker client unavailable ({}). Falling back to subprocess execution.",
                e
            );
            return false;
        }
    };

    match tokio::time::timeout(PROBE_TIMEOUT, docker.ping()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!(
                "Docker daemon not running ({}). Falling back to subprocess execution.",
                e
            );
            return false;
        }
        Err(_) => {
            warn!("Docker check timed out. Falling back to subprocess execution.");
            return false;
        }
    }

    match tokio::time::timeout(PROBE_TIMEOUT, docker.inspect_image(&config.image)).await {
        Ok(Ok(_)) => true,
        Ok(Err(_)) => {
            warn!(
                "Docker is running but '{}' image not found. Build the sandbox image first.",
                config.image
            );
            false
        }
        Err(_) => {
            warn!("Docker image check timed out. Falling back to subprocess execution.");
            false
        }
    }
}

fn socket_present() -> bool {
    if Path::new("/var/run/docker.sock").exists() {
        return true;
    }
    dirs::home_dir()
        .map(|home| home.join(".docker").join("run").join("docker.sock").exists())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn test_result_is_cached_within_ttl() {
        let cache = AvailabilityCache::new();
        let config = EngineConfig::for_root("/tmp/agentbox-test").container;

        let first = cache.container_available(&config).await;
        {
            let state = cache.state.lock().await;
            assert!(state.checked_at.is_some());
        }
        let second = cache.container_available(&config).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stale_entry_triggers_reprobe() {
        let cache = AvailabilityCache::new();
        let config = EngineConfig::for_root("/tmp/agentbox-test").container;
        {
            let mut state = cache.state.lock().await;
            state.available = true;
            state.checked_at = Some(Instant::now() - CACHE_TTL * 2);
        }

        // Stale entry must be replaced by a fresh probe with a new stamp
        let _ = cache.container_available(&config).await;
        let state = cache.state.lock().await;
        let age = state.checked_at.map(|t| t.elapsed()).unwrap_or(CACHE_TTL);
        assert!(age < CACHE_TTL);
    }
}
