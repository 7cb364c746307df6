//! Runtime configuration for a session engine.
//!
//! These are the resolved values; file/env layering lives in the binary.

use std::time::Duration;

/// Default message length limit, in characters.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 500;

/// How the engine treats its own messages coming back from the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EchoPolicy {
    /// Append locally as soon as the send succeeds, and swallow the first
    /// server echo of the same message.
    #[default]
    Optimistic,
    /// Never append locally; the server's broadcast is the only copy.
    ServerEcho,
}

/// Backoff schedule for automatic reconnection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt after a connection drops.
    pub initial_delay: Duration,
    /// Ceiling for the doubling delay.
    pub max_delay: Duration,
    /// Give up after this many failed attempts (None = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Whether `attempt` failed attempts exhaust the budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub reconnect: ReconnectPolicy,
    /// Bound on opening the socket and sending the username announce.
    pub connect_timeout: Duration,
    pub echo: EchoPolicy,
    pub max_content_chars: usize,
    /// Also pass the username as a `?username=` query parameter.
    pub username_in_url: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            echo: EchoPolicy::default(),
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            username_in_url: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_thirty_second_timeout() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.max_attempts, Some(10));
    }

    #[test]
    fn delay_doubles_up_to_ceiling() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for(4), Duration::from_secs(240));
        assert_eq!(policy.delay_for(5), Duration::from_secs(300));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn attempt_zero_uses_initial_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
    }

    #[test]
    fn exhaustion() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));

        let unlimited = ReconnectPolicy {
            max_attempts: None,
            ..Default::default()
        };
        assert!(!unlimited.exhausted(u32::MAX));
    }

    #[test]
    fn session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_content_chars, 500);
        assert_eq!(config.echo, EchoPolicy::Optimistic);
        assert!(!config.username_in_url);
    }
}
