//! # AgentBox
//!
//! Sandboxed execution engine for LLM-generated code and shell commands.
//!
//! ## Features
//!
//! - **Layered Safety:** Pattern-based command and code screening before anything runs
//! - **Two Backends:** Direct subprocess with process-group control, or an
//!   isolated Docker container with restricted mounts and resource caps
//! - **Artifact Detection:** Before/after directory diffing that separates real
//!   outputs from interpreter and packaging noise
//! - **Auto-Recovery:** Bounded install-and-retry for missing Python packages

pub mod config;
pub mod error;
pub mod sandbox;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use sandbox::{Engine, ExecutionRequest, ExecutionResult, Language};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
