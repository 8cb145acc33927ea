//! Environment variable utilities
//!
//! Every tunable in baton has a compiled-in default that an environment
//! variable may override. These helpers never fail: a missing or unparsable
//! value falls back to the default.
//!
//! # Usage
//!
//! ```ignore
//! use baton_core::env::{env_get, env_get_bool, env_get_list};
//!
//! let ceiling_ms: u64 = env_get("BATON_POLL_CEILING_MS", 10_000);
//! let signals = env_get_bool("BATON_SIGNALS", true);
//! let debug = env_get_list("BATON_DEBUG"); // "scheduler,io" -> ["scheduler", "io"]
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" are false
/// (case-insensitive). Anything else, including unset, returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a millisecond count as a `Duration`
#[inline]
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(env_get(key, default_ms))
}

/// Get a comma-separated list; items are trimmed, lowercased, empties dropped
pub fn env_get_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| parse_list(&v))
        .unwrap_or_default()
}

pub(crate) fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
