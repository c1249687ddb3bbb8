use crate::error::{Result, TesseraError};
use crate::policy::ExceptionPolicies;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How shard ownership is decided across processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonMode {
    /// This is the only process; everything runs here without locking
    Solo,
    /// Processes compete for advisory locks; losers stay cold
    HotCold,
}

/// Configuration for the projection daemon and its coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Default: solo
    #[serde(default = "default_mode")]
    pub mode: DaemonMode,

    /// Advisory lock key used for the projection set of each database
    /// Default: 4444
    #[serde(default = "default_daemon_lock_id")]
    pub daemon_lock_id: i64,

    /// Cadence of the coordinator loop (milliseconds)
    /// Default: 5000
    #[serde(default = "default_leadership_polling_ms")]
    pub leadership_polling_ms: u64,

    /// Minimum time a shard stays paused before the coordinator resumes it
    /// Default: 5000
    #[serde(default = "default_health_check_polling_ms")]
    pub health_check_polling_ms: u64,

    /// Coordinator sleep while any shard is paused (milliseconds)
    /// Default: 1000
    #[serde(default = "default_agent_pause_ms")]
    pub agent_pause_ms: u64,

    /// Upper bound of the random delay before the first distribution
    /// Default: 1000
    #[serde(default = "default_max_startup_jitter_ms")]
    pub max_startup_jitter_ms: u64,

    /// Maximum number of log positions covered by one fetch
    /// Default: 500
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Agent sleep when caught up with the high-water mark (milliseconds)
    /// Default: 250
    #[serde(default = "default_idle_polling_ms")]
    pub idle_polling_ms: u64,

    /// How often the daemon refreshes the high-water mark (milliseconds)
    /// Default: 500
    #[serde(default = "default_high_water_polling_ms")]
    pub high_water_polling_ms: u64,

    /// Error handling rules; configured in code, never serialized
    #[serde(skip)]
    pub policies: ExceptionPolicies,
}

fn default_mode() -> DaemonMode {
    DaemonMode::Solo
}

fn default_daemon_lock_id() -> i64 {
    4444
}

fn default_leadership_polling_ms() -> u64 {
    5000
}

fn default_health_check_polling_ms() -> u64 {
    5000
}

fn default_agent_pause_ms() -> u64 {
    1000
}

fn default_max_startup_jitter_ms() -> u64 {
    1000
}

fn default_batch_size() -> u64 {
    500
}

fn default_idle_polling_ms() -> u64 {
    250
}

fn default_high_water_polling_ms() -> u64 {
    500
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            daemon_lock_id: default_daemon_lock_id(),
            leadership_polling_ms: default_leadership_polling_ms(),
            health_check_polling_ms: default_health_check_polling_ms(),
            agent_pause_ms: default_agent_pause_ms(),
            max_startup_jitter_ms: default_max_startup_jitter_ms(),
            batch_size: default_batch_size(),
            idle_polling_ms: default_idle_polling_ms(),
            high_water_polling_ms: default_high_water_polling_ms(),
            policies: ExceptionPolicies::default(),
        }
    }
}

impl DaemonSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: DaemonMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_daemon_lock_id(mut self, lock_id: i64) -> Self {
        self.daemon_lock_id = lock_id;
        self
    }

    pub fn with_leadership_polling_ms(mut self, ms: u64) -> Self {
        self.leadership_polling_ms = ms;
        self
    }

    pub fn with_health_check_polling_ms(mut self, ms: u64) -> Self {
        self.health_check_polling_ms = ms;
        self
    }

    pub fn with_agent_pause_ms(mut self, ms: u64) -> Self {
        self.agent_pause_ms = ms;
        self
    }

    pub fn with_max_startup_jitter_ms(mut self, ms: u64) -> Self {
        self.max_startup_jitter_ms = ms;
        self
    }

    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_idle_polling_ms(mut self, ms: u64) -> Self {
        self.idle_polling_ms = ms;
        self
    }

    pub fn with_high_water_polling_ms(mut self, ms: u64) -> Self {
        self.high_water_polling_ms = ms;
        self
    }

    pub fn with_policies(mut self, policies: ExceptionPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn leadership_polling_time(&self) -> Duration {
        Duration::from_millis(self.leadership_polling_ms)
    }

    pub fn health_check_polling_time(&self) -> Duration {
        Duration::from_millis(self.health_check_polling_ms)
    }

    pub fn agent_pause_time(&self) -> Duration {
        Duration::from_millis(self.agent_pause_ms)
    }

    pub fn max_startup_jitter(&self) -> Duration {
        Duration::from_millis(self.max_startup_jitter_ms)
    }

    pub fn idle_polling_time(&self) -> Duration {
        Duration::from_millis(self.idle_polling_ms)
    }

    pub fn high_water_polling_time(&self) -> Duration {
        Duration::from_millis(self.high_water_polling_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("leadership_polling_ms", self.leadership_polling_ms),
            ("health_check_polling_ms", self.health_check_polling_ms),
            ("agent_pause_ms", self.agent_pause_ms),
            ("idle_polling_ms", self.idle_polling_ms),
            ("high_water_polling_ms", self.high_water_polling_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(TesseraError::Config(format!("{} must be positive", name)));
            }
        }
        if self.batch_size == 0 {
            return Err(TesseraError::Config("batch_size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: DaemonSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.mode, DaemonMode::Solo);
        assert_eq!(settings.daemon_lock_id, 4444);
        assert_eq!(settings.leadership_polling_time(), Duration::from_secs(5));
        assert_eq!(settings.batch_size, 500);
        assert!(settings.policies.is_empty());
    }

    #[test]
    fn test_partial_json_overrides() {
        let settings: DaemonSettings =
            serde_json::from_str(r#"{"mode":"hot_cold","agent_pause_ms":20}"#).unwrap();
        assert_eq!(settings.mode, DaemonMode::HotCold);
        assert_eq!(settings.agent_pause_time(), Duration::from_millis(20));
        assert_eq!(settings.health_check_polling_ms, 5000);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let settings = DaemonSettings::new().with_batch_size(0);
        assert!(matches!(settings.validate(), Err(TesseraError::Config(_))));
        assert!(DaemonSettings::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_health_check() {
        let err = DaemonSettings::new()
            .with_health_check_polling_ms(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("health_check_polling_ms"));
    }
}
