//! Workflow configuration.

use std::time::Duration;

/// Tunables for a Wi-Fi setup [`Workflow`][crate::driver::Workflow].
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on every outbound D-Bus call.
    ///
    /// A call exceeding this is reported like any other failed call.
    pub call_timeout: Duration,
    /// Prefix written in front of every line shown to the operator.
    pub prompt: String,
}

impl Config {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_PROMPT: &'static str = "wifi> ";

    /// Returns a copy of this [`Config`] with a different call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            prompt: Self::DEFAULT_PROMPT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.call_timeout, Duration::from_secs(120));
        assert_eq!(config.prompt, "wifi> ");

        let config = config.with_call_timeout(Duration::from_secs(5));
        assert_eq!(config.call_timeout, Duration::from_secs(5));
    }
}
