// Engine-wide limits, read from the environment

use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_SANDBOXES: usize = 4;
pub const MAX_SANDBOXES: usize = 256;
pub const DEFAULT_QUEUE_WAIT_MS: u64 = 30_000;
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Wall-clock limit for each sandboxed process
    pub timeout: Duration,
    /// Upper bound on sandboxes running at the same time
    pub max_concurrent_sandboxes: usize,
    /// How long a request may wait for a free sandbox slot
    pub queue_wait: Duration,
    pub max_source_bytes: usize,
    /// Per-stream capture limit for stdout and stderr
    pub max_output_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_concurrent_sandboxes: DEFAULT_MAX_SANDBOXES,
            queue_wait: Duration::from_millis(DEFAULT_QUEUE_WAIT_MS),
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl EngineConfig {
    /// Build from `PROCTOR_*` environment variables, falling back to defaults.
    /// Out-of-range values are clamped rather than rejected.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = Self::default();

        let timeout_secs = parse_u64("PROCTOR_TIMEOUT_SECS").unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_concurrent_sandboxes: parse_u64("PROCTOR_MAX_SANDBOXES")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_concurrent_sandboxes),
            queue_wait: parse_u64("PROCTOR_QUEUE_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_wait),
            max_source_bytes: parse_u64("PROCTOR_MAX_SOURCE_BYTES")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_source_bytes),
            max_output_bytes: parse_u64("PROCTOR_MAX_OUTPUT_BYTES")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_output_bytes),
        }
        .bounded()
    }

    /// Clamp every limit into its accepted range
    pub fn bounded(mut self) -> Self {
        let secs = self
            .timeout
            .as_secs()
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        self.timeout = Duration::from_secs(secs);
        self.max_concurrent_sandboxes = self.max_concurrent_sandboxes.clamp(1, MAX_SANDBOXES);
        self.max_source_bytes = self.max_source_bytes.max(1);
        self.max_output_bytes = self.max_output_bytes.max(1024);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.bounded()
    }

    pub fn with_max_concurrent_sandboxes(mut self, max: usize) -> Self {
        self.max_concurrent_sandboxes = max;
        self.bounded()
    }

    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }
}
