//! Director configuration (`director.toml`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Knobs shared by the assembler, the agent-state collector and the
/// release lock. Passed explicitly; there is no process-wide copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectorConfig {
    /// Upper bound on concurrent agent queries.
    pub max_threads: usize,
    /// Per-call agent timeout in milliseconds.
    pub agent_timeout_ms: u64,
    /// How long release binding waits for a held release lock.
    pub lock_timeout_secs: u64,
    /// Delay between lock acquisition attempts.
    pub lock_retry_ms: u64,
    /// Suffix appended to every instance DNS record.
    pub dns_domain: String,
    /// Director working directory (state database lives here).
    pub base_dir: PathBuf,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            max_threads: 32,
            agent_timeout_ms: 10_000,
            lock_timeout_secs: 30,
            lock_retry_ms: 250,
            dns_domain: "stratus".to_string(),
            base_dir: PathBuf::from("/var/lib/stratus"),
        }
    }
}

impl DirectorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DirectorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    /// Path of the redb state database under `base_dir`.
    pub fn state_db_path(&self) -> PathBuf {
        self.base_dir.join("director.redb")
    }
}
