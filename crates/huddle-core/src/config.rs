use std::env;
use std::time::Duration;

use crate::registry::DEFAULT_MAX_PARKED_CANDIDATES;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8000/ws/chat/global/";

/// Call-level tuning knobs.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Relay endpoint the WebSocket channel connects to.
    pub signaling_url: String,
    /// Delay before re-offering to a peer whose connection failed or closed.
    pub reconnect_delay: Duration,
    /// Delay before recreating a session whose ICE restart could not be sent.
    pub ice_failure_delay: Duration,
    /// `None` keeps retrying for as long as the call is active.
    pub max_reconnect_attempts: Option<u32>,
    pub max_parked_candidates: usize,
    /// Delay between relay reconnect attempts.
    pub channel_retry_delay: Duration,
}

impl CallConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            signaling_url: env::var("HUDDLE_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            reconnect_delay: env_millis("HUDDLE_RECONNECT_DELAY_MS")
                .unwrap_or(defaults.reconnect_delay),
            ice_failure_delay: env_millis("HUDDLE_ICE_FAILURE_DELAY_MS")
                .unwrap_or(defaults.ice_failure_delay),
            max_reconnect_attempts: env::var("HUDDLE_MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|val| val.parse().ok()),
            max_parked_candidates: env::var("HUDDLE_MAX_PARKED_CANDIDATES")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.max_parked_candidates),
            channel_retry_delay: env_millis("HUDDLE_CHANNEL_RETRY_MS")
                .unwrap_or(defaults.channel_retry_delay),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            reconnect_delay: Duration::from_millis(2000),
            ice_failure_delay: Duration::from_millis(1000),
            max_reconnect_attempts: None,
            max_parked_candidates: DEFAULT_MAX_PARKED_CANDIDATES,
            channel_retry_delay: Duration::from_millis(3000),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_millis)
}
