use std::time::Duration;

/// Timing and retry knobs of the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Time a session may stay `CONNECTED` before it is force-restarted.
    pub maintenance_interval: Duration,
    /// When the maintenance timer fires the session is always closed; with
    /// this set (the default) it is initialized again right after.
    pub restart_on_maintenance: bool,
    pub retry_delay: Duration,
    /// Consecutive startup failures after which a session is left
    /// `DISCONNECTED` for good.
    pub max_startup_failures: u32,
    pub teardown_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            restart_on_maintenance: true,
            retry_delay: Duration::from_secs(10),
            max_startup_failures: 2,
            teardown_timeout: Duration::from_secs(30),
        }
    }
}

impl LifecyclePolicy {
    /// Whether a handle that has now failed `failures` times in a row should
    /// get another attempt.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_startup_failures
    }
}
