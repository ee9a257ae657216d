use serde::Deserialize;
use serde::Serialize;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default)]
pub struct BackoffPolicy {
    /// Maximum number of attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single attempt timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Divide strategies by business domain
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    // Whole-transition strategy (generation conflict races and
    // transient backend faults)
    #[serde(default)]
    pub transition: BackoffPolicy,

    // Helper spawn strategy (the command never started)
    #[serde(default)]
    pub backend: BackoffPolicy,
}

// Default value implementation
impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            transition: BackoffPolicy {
                max_retries: 5,
                timeout_ms: 60_000,
                base_delay_ms: 20,
                max_delay_ms: 1000,
            },
            backend: BackoffPolicy {
                max_retries: 3,
                timeout_ms: 35_000,
                base_delay_ms: 200,
                max_delay_ms: 5000,
            },
        }
    }
}
fn default_max_retries() -> usize {
    3
}
fn default_op_timeout_ms() -> u64 {
    35_000
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1000
}
