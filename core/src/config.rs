use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

const MIN_BACKOFF_START_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 60_000;
const MIN_BACKOFF_MULTIPLIER: u32 = 1;
const MAX_BACKOFF_MULTIPLIER: u32 = 10;
const MIN_QUEUE_ITEMS: usize = 1;
const MAX_QUEUE_ITEMS: usize = 10_000;
const MIN_QUEUE_BYTES: usize = 1_024;
const MIN_CHUNK_SIZE_BYTES: usize = 16;
const MIN_VERIFY_WINDOW_MS: u64 = 50;
const MAX_VERIFY_ATTEMPTS: u32 = 10;
const MIN_SAFETY_CEILING_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {error}")]
    Read {
        #[source]
        error: std::io::Error,
    },
    #[error("failed to parse config: {error}")]
    Parse {
        #[source]
        error: toml::de::Error,
    },
}

/// Tuning knobs for the delivery engine. Every field has a default so an
/// empty TOML document is a valid configuration; out-of-range values are
/// clamped on load rather than rejected.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub gates: GateConfig,
    #[serde(default)]
    pub write: WriteConfig,
    #[serde(default)]
    pub settle: SettleConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default = "default_safety_ceiling_ms")]
    pub safety_ceiling_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_start_ms")]
    pub start_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Tighter re-poll interval for `immediate` items waiting only on the
    /// global injection lock.
    #[serde(default = "default_immediate_poll_ms")]
    pub immediate_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GateConfig {
    /// Upper bound on how long a confirmed compaction indicator may keep a
    /// session blocked before it is force-cleared.
    #[serde(default = "default_compaction_max_defer_ms")]
    pub compaction_max_defer_ms: u64,
    #[serde(default = "default_typing_guard_window_ms")]
    pub typing_guard_window_ms: u64,
    /// Output younger than this counts as "pane actively printing".
    #[serde(default = "default_active_output_window_ms")]
    pub active_output_window_ms: u64,
    #[serde(default = "default_active_defer_max_wait_ms")]
    pub active_defer_max_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WriteConfig {
    /// Payloads at or below this size go out as one atomic write.
    #[serde(default = "default_chunk_threshold_bytes")]
    pub chunk_threshold_bytes: usize,
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    #[serde(default = "default_yield_every_chunks")]
    pub yield_every_chunks: usize,
}

/// Inter-step settle delay scaling: bigger payloads get proportionally more
/// settle time before submission, capped.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SettleConfig {
    #[serde(default = "default_scale_start_bytes")]
    pub scale_start_bytes: usize,
    #[serde(default = "default_bytes_per_ms")]
    pub bytes_per_ms: usize,
    #[serde(default = "default_max_extra_ms")]
    pub max_extra_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FocusConfig {
    #[serde(default = "default_focus_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_focus_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VerifyConfig {
    #[serde(default = "default_verify_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_verify_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_verify_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_verify_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// When true, exhausting verification resolves as unverified success
    /// instead of a `submit_not_accepted` failure.
    #[serde(default)]
    pub unverified_is_success: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            backoff: BackoffConfig::default(),
            gates: GateConfig::default(),
            write: WriteConfig::default(),
            settle: SettleConfig::default(),
            focus: FocusConfig::default(),
            verify: VerifyConfig::default(),
            safety_ceiling_ms: default_safety_ceiling_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            start_ms: default_backoff_start_ms(),
            multiplier: default_backoff_multiplier(),
            max_ms: default_backoff_max_ms(),
            immediate_poll_ms: default_immediate_poll_ms(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            compaction_max_defer_ms: default_compaction_max_defer_ms(),
            typing_guard_window_ms: default_typing_guard_window_ms(),
            active_output_window_ms: default_active_output_window_ms(),
            active_defer_max_wait_ms: default_active_defer_max_wait_ms(),
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_bytes: default_chunk_threshold_bytes(),
            chunk_size_bytes: default_chunk_size_bytes(),
            yield_every_chunks: default_yield_every_chunks(),
        }
    }
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            scale_start_bytes: default_scale_start_bytes(),
            bytes_per_ms: default_bytes_per_ms(),
            max_extra_ms: default_max_extra_ms(),
        }
    }
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_focus_retry_attempts(),
            retry_delay_ms: default_focus_retry_delay_ms(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            window_ms: default_verify_window_ms(),
            poll_interval_ms: default_verify_poll_interval_ms(),
            max_attempts: default_verify_max_attempts(),
            retry_backoff_ms: default_verify_retry_backoff_ms(),
            unverified_is_success: false,
        }
    }
}

fn default_max_items() -> usize {
    50
}

fn default_max_bytes() -> usize {
    256 * 1024
}

fn default_backoff_start_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_immediate_poll_ms() -> u64 {
    25
}

fn default_compaction_max_defer_ms() -> u64 {
    30_000
}

fn default_typing_guard_window_ms() -> u64 {
    1_500
}

fn default_active_output_window_ms() -> u64 {
    400
}

fn default_active_defer_max_wait_ms() -> u64 {
    5_000
}

fn default_chunk_threshold_bytes() -> usize {
    2_048
}

fn default_chunk_size_bytes() -> usize {
    512
}

fn default_yield_every_chunks() -> usize {
    4
}

fn default_scale_start_bytes() -> usize {
    1_024
}

fn default_bytes_per_ms() -> usize {
    64
}

fn default_max_extra_ms() -> u64 {
    1_500
}

fn default_focus_retry_attempts() -> u32 {
    3
}

fn default_focus_retry_delay_ms() -> u64 {
    120
}

fn default_verify_window_ms() -> u64 {
    2_000
}

fn default_verify_poll_interval_ms() -> u64 {
    100
}

fn default_verify_max_attempts() -> u32 {
    3
}

fn default_verify_retry_backoff_ms() -> u64 {
    500
}

fn default_safety_ceiling_ms() -> u64 {
    45_000
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|error| ConfigError::Parse { error })?;
        Ok(config.clamped())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Read { error })?;
        Self::from_toml_str(&raw)
    }

    /// Pull every knob back into its supported range.
    fn clamped(mut self) -> Self {
        self.queue.max_items = self.queue.max_items.clamp(MIN_QUEUE_ITEMS, MAX_QUEUE_ITEMS);
        self.queue.max_bytes = self.queue.max_bytes.max(MIN_QUEUE_BYTES);
        self.backoff.start_ms = self.backoff.start_ms.clamp(MIN_BACKOFF_START_MS, MAX_BACKOFF_MS);
        self.backoff.max_ms = self.backoff.max_ms.clamp(self.backoff.start_ms, MAX_BACKOFF_MS);
        self.backoff.multiplier = self
            .backoff
            .multiplier
            .clamp(MIN_BACKOFF_MULTIPLIER, MAX_BACKOFF_MULTIPLIER);
        self.write.chunk_size_bytes = self.write.chunk_size_bytes.max(MIN_CHUNK_SIZE_BYTES);
        self.verify.window_ms = self.verify.window_ms.max(MIN_VERIFY_WINDOW_MS);
        self.verify.poll_interval_ms = self
            .verify
            .poll_interval_ms
            .clamp(1, self.verify.window_ms);
        self.verify.max_attempts = self.verify.max_attempts.clamp(1, MAX_VERIFY_ATTEMPTS);
        self.safety_ceiling_ms = self.safety_ceiling_ms.max(MIN_SAFETY_CEILING_MS);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = EngineConfig::from_toml_str("queue = 3").expect_err("type mismatch rejected");
        assert_matches!(err, ConfigError::Parse { .. });
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").expect("parse empty config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.backoff.start_ms, 100);
        assert_eq!(config.backoff.max_ms, 2_000);
    }

    #[test]
    fn partial_toml_overrides_and_clamps() {
        let config = EngineConfig::from_toml_str(
            r#"
[queue]
max_items = 2

[backoff]
start_ms = 1
multiplier = 99

[verify]
max_attempts = 0
"#,
        )
        .expect("parse config");
        assert_eq!(config.queue.max_items, 2);
        assert_eq!(config.backoff.start_ms, MIN_BACKOFF_START_MS);
        assert_eq!(config.backoff.multiplier, MAX_BACKOFF_MULTIPLIER);
        assert_eq!(config.verify.max_attempts, 1);
        assert_eq!(config.queue.max_bytes, default_max_bytes());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().expect("config tempdir");
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "safety_ceiling_ms = 500\n").expect("write config");
        let config = EngineConfig::load(&path).expect("load config");
        assert_eq!(config.safety_ceiling_ms, MIN_SAFETY_CEILING_MS);
    }
}
