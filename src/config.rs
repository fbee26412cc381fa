//! Engine tuning knobs, overridable from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineOptions {
    /// Node-hop cap per inbound message; guards authoring cycles.
    pub max_hops: usize,
    /// Invalid replies tolerated at a prompt before the session errors.
    pub max_input_retries: u32,
    /// Joins the messages accumulated in one interpreter pass.
    pub message_separator: String,
    /// Sent when a session hits an infrastructure failure.
    pub fallback_message: String,
    /// Prepended when re-prompting after an unrecognized reply.
    pub invalid_input_message: String,
    pub ai_timeout_secs: u64,
    pub constants_ttl_secs: u64,
    pub session_ttl_secs: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_hops: 25,
            max_input_retries: 3,
            message_separator: "\n\n".to_string(),
            fallback_message: "Something went wrong. Please try again later.".to_string(),
            invalid_input_message: "Sorry, that's not one of the options.".to_string(),
            ai_timeout_secs: 8,
            constants_ttl_secs: 300,
            session_ttl_secs: 86_400,
        }
    }
}

impl EngineOptions {
    /// Defaults overridden by `CONVOFLOW_*` environment variables, with a
    /// `.env` file honored if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            max_hops: env_parse("CONVOFLOW_MAX_HOPS", defaults.max_hops),
            max_input_retries: env_parse("CONVOFLOW_MAX_INPUT_RETRIES", defaults.max_input_retries),
            message_separator: env::var("CONVOFLOW_MESSAGE_SEPARATOR")
                .unwrap_or(defaults.message_separator),
            fallback_message: env::var("CONVOFLOW_FALLBACK_MESSAGE")
                .unwrap_or(defaults.fallback_message),
            invalid_input_message: env::var("CONVOFLOW_INVALID_INPUT_MESSAGE")
                .unwrap_or(defaults.invalid_input_message),
            ai_timeout_secs: env_parse("CONVOFLOW_AI_TIMEOUT_SECS", defaults.ai_timeout_secs),
            constants_ttl_secs: env_parse(
                "CONVOFLOW_CONSTANTS_TTL_SECS",
                defaults.constants_ttl_secs,
            ),
            session_ttl_secs: env_parse("CONVOFLOW_SESSION_TTL_SECS", defaults.session_ttl_secs),
        }
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn constants_ttl(&self) -> Duration {
        Duration::from_secs(self.constants_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring unparsable {key}={raw}");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = EngineOptions::default();
        assert_eq!(opts.max_hops, 25);
        assert_eq!(opts.max_input_retries, 3);
        assert_eq!(opts.ai_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn env_overrides_and_bad_values_fall_back() {
        unsafe {
            env::set_var("CONVOFLOW_MAX_HOPS", "7");
            env::set_var("CONVOFLOW_AI_TIMEOUT_SECS", "not-a-number");
        }
        let opts = EngineOptions::from_env();
        assert_eq!(opts.max_hops, 7);
        assert_eq!(opts.ai_timeout_secs, EngineOptions::default().ai_timeout_secs);
        unsafe {
            env::remove_var("CONVOFLOW_MAX_HOPS");
            env::remove_var("CONVOFLOW_AI_TIMEOUT_SECS");
        }
    }
}
