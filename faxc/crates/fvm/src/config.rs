//! Configuration Module - Coordinator and Monitor Tuning Parameters
//!
//! Manages all configuration parameters for FVM.
//! The interval and timeout knobs trade pause latency against the risk of
//! hanging on an unresponsive mutator; the monitor knobs trade memory against
//! allocation contention.

/// What the engine does when it hits a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalPolicy {
    /// Log a thread-state dump and abort the process
    Abort,
    /// Log a thread-state dump, latch the runtime as failed and return
    /// `FvmError::FatalProtocolViolation` to the caller
    Intercept,
}

/// Main configuration for the Fax VM synchronization engine
///
/// # Examples
///
/// ```rust
/// use fvm::VmConfig;
///
/// // Use default configuration
/// let config = VmConfig::default();
///
/// // Aggressive deflation for a monitor-heavy workload
/// let config = VmConfig {
///     guaranteed_safepoint_interval_ms: 100,
///     monitor_usage_deflation_threshold_pct: 50,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum time without a safepoint before the coordinator forces a
    /// maintenance safepoint (only if cleanup is needed)
    ///
    /// 0 disables forced safepoints.
    /// Default: 1000ms
    pub guaranteed_safepoint_interval_ms: u64,

    /// Deadline for all mutators to reach a safe state once a safepoint is armed
    ///
    /// Exceeding it is fatal. 0 disables the check.
    /// Default: 10000ms
    pub safepoint_timeout_ms: u64,

    /// Deadline for a handshake to be processed by every target
    ///
    /// Exceeding it is fatal. 0 disables the check.
    /// Default: 10000ms
    pub handshake_timeout_ms: u64,

    /// Percentage of the monitor population that must be in use before a
    /// guaranteed-interval safepoint is forced for deflation
    ///
    /// 0 disables usage-triggered safepoints.
    /// Default: 90
    pub monitor_usage_deflation_threshold_pct: u8,

    /// Number of slots carved per monitor block, including the link slot
    ///
    /// Default: 128
    pub monitor_block_size: usize,

    /// First batch size moved from the global free list into a thread's list
    ///
    /// Default: 32
    pub monitor_initial_provision: usize,

    /// Upper bound for the per-thread batch size
    ///
    /// Default: 1024
    pub monitor_max_provision: usize,

    /// Consecutive safepoint-class dequeues before an ordinary operation is
    /// preferred once
    ///
    /// Default: 10
    pub queue_fairness_ratio: u32,

    /// Audit every monitor list after each deflation pass
    ///
    /// Mismatches are fatal.
    /// Default: true in debug builds
    pub verify_monitors: bool,

    /// Fatal error behavior
    ///
    /// Default: Abort
    pub fatal_policy: FatalPolicy,

    /// Enable verbose event logging to the console
    ///
    /// Default: false
    pub verbose: bool,

    /// Enable statistics collection
    ///
    /// Default: true
    pub stats_enabled: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            // Coordinator
            guaranteed_safepoint_interval_ms: 1000,
            safepoint_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            queue_fairness_ratio: 10,

            // Monitors
            monitor_usage_deflation_threshold_pct: 90,
            monitor_block_size: 128,
            monitor_initial_provision: 32,
            monitor_max_provision: 1024,
            verify_monitors: cfg!(debug_assertions),

            // Debug
            fatal_policy: FatalPolicy::Abort,
            verbose: false,
            stats_enabled: true,
        }
    }
}

impl VmConfig {
    /// Validate configuration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fvm::VmConfig;
    ///
    /// let config = VmConfig {
    ///     monitor_block_size: 1, // no room for a real monitor
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor_usage_deflation_threshold_pct > 100 {
            return Err(ConfigError::InvalidThreshold(format!(
                "monitor_usage_deflation_threshold_pct must be 0..=100, got {}",
                self.monitor_usage_deflation_threshold_pct
            )));
        }

        if self.monitor_block_size < 2 {
            return Err(ConfigError::InvalidBlockSize(
                "monitor_block_size must be >= 2 (one slot is the block link)".to_string(),
            ));
        }

        if self.monitor_initial_provision == 0 {
            return Err(ConfigError::InvalidProvision(
                "monitor_initial_provision must be > 0".to_string(),
            ));
        }

        if self.monitor_max_provision < self.monitor_initial_provision {
            return Err(ConfigError::InvalidProvision(
                "monitor_max_provision must be >= monitor_initial_provision".to_string(),
            ));
        }

        if self.queue_fairness_ratio == 0 {
            return Err(ConfigError::InvalidFairness(
                "queue_fairness_ratio must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - FVM_GUARANTEED_SAFEPOINT_INTERVAL_MS
    /// - FVM_SAFEPOINT_TIMEOUT_MS
    /// - FVM_HANDSHAKE_TIMEOUT_MS
    /// - FVM_MONITOR_DEFLATION_THRESHOLD
    /// - FVM_VERIFY_MONITORS
    /// - FVM_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export FVM_SAFEPOINT_TIMEOUT_MS=0       # never time out
    /// export FVM_MONITOR_DEFLATION_THRESHOLD=50
    /// export FVM_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("FVM_GUARANTEED_SAFEPOINT_INTERVAL_MS") {
            config.guaranteed_safepoint_interval_ms = ms;
        }

        if let Some(ms) = env_parse::<u64>("FVM_SAFEPOINT_TIMEOUT_MS") {
            config.safepoint_timeout_ms = ms;
        }

        if let Some(ms) = env_parse::<u64>("FVM_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout_ms = ms;
        }

        if let Some(pct) = env_parse::<u8>("FVM_MONITOR_DEFLATION_THRESHOLD") {
            config.monitor_usage_deflation_threshold_pct = pct;
        }

        if let Ok(val) = std::env::var("FVM_VERIFY_MONITORS") {
            config.verify_monitors = env_flag(&val);
        }

        if let Ok(val) = std::env::var("FVM_VERBOSE") {
            config.verbose = env_flag(&val);
        }

        config
    }

    /// Safepoint deadline, `None` when disabled
    pub fn safepoint_timeout(&self) -> Option<std::time::Duration> {
        non_zero_ms(self.safepoint_timeout_ms)
    }

    /// Handshake deadline, `None` when disabled
    pub fn handshake_timeout(&self) -> Option<std::time::Duration> {
        non_zero_ms(self.handshake_timeout_ms)
    }

    /// Guaranteed safepoint interval, `None` when disabled
    pub fn guaranteed_safepoint_interval(&self) -> Option<std::time::Duration> {
        non_zero_ms(self.guaranteed_safepoint_interval_ms)
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid monitor block size: {0}")]
    InvalidBlockSize(String),

    #[error("Invalid monitor provision: {0}")]
    InvalidProvision(String),

    #[error("Invalid queue fairness: {0}")]
    InvalidFairness(String),
}

// ============================================================================
// HELPERS
// ============================================================================

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn env_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

fn non_zero_ms(ms: u64) -> Option<std::time::Duration> {
    (ms > 0).then(|| std::time::Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_fairness_ratio, 10);
        assert_eq!(config.fatal_policy, FatalPolicy::Abort);
    }

    #[test]
    fn test_invalid_threshold() {
        let config = VmConfig {
            monitor_usage_deflation_threshold_pct: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_provision() {
        let config = VmConfig {
            monitor_initial_provision: 64,
            monitor_max_provision: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProvision(_))
        ));
    }

    #[test]
    fn test_zero_timeouts_disable() {
        let config = VmConfig {
            safepoint_timeout_ms: 0,
            guaranteed_safepoint_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.safepoint_timeout().is_none());
        assert!(config.guaranteed_safepoint_interval().is_none());
        assert_eq!(
            config.handshake_timeout(),
            Some(std::time::Duration::from_millis(10_000))
        );
    }
}
