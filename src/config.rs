use std::time::Duration;

use bon::Builder;

use crate::catalog::ProfileCandidate;

/// Options recognised at session creation.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// Per-command timeout applied when `send` is called without one.
    #[builder(default = Duration::from_millis(4_000))]
    default_command_timeout: Duration,
    /// Inactivity window after which the watchdog stops streaming.
    #[builder(default = Duration::from_millis(4_000))]
    streaming_inactivity: Duration,
    /// Period of the streaming watchdog tick.
    #[builder(default = Duration::from_millis(1_000))]
    watchdog_tick: Duration,
    /// Replacement for the built-in profile catalog.
    catalog: Option<Vec<ProfileCandidate>>,
}

impl SessionConfig {
    /// Returns the default per-command timeout.
    #[must_use]
    pub fn default_command_timeout(&self) -> Duration {
        self.default_command_timeout
    }

    /// Returns the streaming inactivity window.
    #[must_use]
    pub fn streaming_inactivity(&self) -> Duration {
        self.streaming_inactivity
    }

    /// Returns the watchdog tick period.
    #[must_use]
    pub fn watchdog_tick(&self) -> Duration {
        self.watchdog_tick
    }

    /// Returns the catalog override, if any.
    #[must_use]
    pub fn catalog(&self) -> Option<&[ProfileCandidate]> {
        self.catalog.as_deref()
    }

    pub(crate) fn take_catalog(&mut self) -> Option<Vec<ProfileCandidate>> {
        self.catalog.take()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
