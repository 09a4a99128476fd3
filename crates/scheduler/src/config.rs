//! Scheduler configuration.

use std::time::Duration;

/// The environment variable overriding the deduplication disconnection
/// timeout, in whole seconds.
pub const DISCONNECT_TIMEOUT_ENV: &str = "KILN_DEDUP_DISCONNECT_SECS";

const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`Scheduler`].
///
/// There is deliberately little here: the scheduler has a single deadline,
/// the deduplication disconnection timeout. Everything else is either a
/// caller-supplied collaborator or derived from the request.
///
/// [`Scheduler`]: crate::Scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a deduplicated client waits without observing any event from
    /// the producing compilation before it disconnects and re-dispatches.
    pub disconnect_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT }
    }
}

impl SchedulerConfig {
    /// Builds a configuration from the process environment.
    ///
    /// Reads [`DISCONNECT_TIMEOUT_ENV`]; an unset variable keeps the 60s
    /// default, and an unparsable one is logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(DISCONNECT_TIMEOUT_ENV) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => config.disconnect_timeout = Duration::from_secs(secs),
                _ => warn!(
                    target: "scheduler",
                    value = %raw,
                    "Ignoring unparsable {DISCONNECT_TIMEOUT_ENV}"
                ),
            }
        }
        config
    }

    /// Overrides the disconnection timeout.
    #[must_use]
    pub const fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}
