//! # Worker Pool Configuration
//!
//! Loaded once at startup, typically from a TOML file:
//!
//! ```toml
//! thread_name_prefix = "verifier"
//! keep_alive_ms = 60000
//! stack_size = 262144
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{VerifyError, VerifyResult};

/// Configuration for a [`WorkerPool`](crate::WorkerPool).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker threads are named `"{prefix}-{n}"`.
    pub thread_name_prefix: String,
    /// How long an idle worker waits for work before exiting (ms).
    pub keep_alive_ms: u64,
    /// Stack size for worker threads, platform default if unset.
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "verifier".to_string(),
            keep_alive_ms: 60_000,
            stack_size: None,
        }
    }
}

impl PoolConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> VerifyResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| VerifyError::Pool(format!("invalid pool config: {e}")))?;
        if config.thread_name_prefix.is_empty() {
            return Err(VerifyError::Pool("thread_name_prefix must not be empty".to_string()));
        }
        Ok(config)
    }
}
