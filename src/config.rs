//! String-keyed runtime options.
//!
//! Deployments drive the runtime through a small table of string options,
//! usually lifted straight from the process environment of the job launcher.
//! The [`Builder`](crate::Builder) merges this table under its own setters.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;

pub const BATCH_EVENTS: &str = "EDAT_BATCH_EVENTS";
pub const MAX_BATCHED_EVENTS: &str = "EDAT_MAX_BATCHED_EVENTS";
pub const BATCHING_EVENTS_TIMEOUT: &str = "EDAT_BATCHING_EVENTS_TIMEOUT";
pub const ENABLE_BRIDGE: &str = "EDAT_ENABLE_BRIDGE";
pub const RESILIENCE: &str = "EDAT_RESILIENCE";
pub const MAIN_THREAD_WORKER: &str = "EDAT_MAIN_THREAD_WORKER";
pub const NUM_THREADS: &str = "EDAT_NUM_THREADS";
pub const PROGRESS_THREAD: &str = "EDAT_PROGRESS_THREAD";

const KNOWN_KEYS: &[&str] = &[
    BATCH_EVENTS,
    MAX_BATCHED_EVENTS,
    BATCHING_EVENTS_TIMEOUT,
    ENABLE_BRIDGE,
    RESILIENCE,
    MAIN_THREAD_WORKER,
    NUM_THREADS,
    PROGRESS_THREAD,
];

/// An immutable bag of string options with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Collect every recognised key present in the process environment.
    pub fn from_env() -> Config {
        let mut cfg = Config::new();
        for key in KNOWN_KEYS {
            if let Ok(value) = std::env::var(key) {
                cfg.entries.insert((*key).to_string(), value);
            }
        }
        cfg
    }

    /// Build from explicit (key, value) pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Config
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut cfg = Config::new();
        for (k, v) in pairs {
            cfg.entries.insert(k.into(), v.into());
        }
        cfg
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Config {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Booleans parse from the literal strings `true` / `false`.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.entries.get(key).map(String::as_str) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => bail!("option {} expects true or false, got {:?}", key, other),
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        match self.entries.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<i64>()
                .with_context(|| format!("option {} expects an integer, got {:?}", key, raw)),
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> Result<f64> {
        match self.entries.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("option {} expects a number, got {:?}", key, raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = Config::new();
        assert!(!cfg.get_bool(BATCH_EVENTS, false).unwrap());
        assert_eq!(cfg.get_int(MAX_BATCHED_EVENTS, 1000).unwrap(), 1000);
        assert!((cfg.get_float(BATCHING_EVENTS_TIMEOUT, 0.1).unwrap() - 0.1).abs() < 1e-12);
    }

    #[rstest]
    #[case("true", true)]
    #[case("false", false)]
    fn bools_parse_from_literals(#[case] raw: &str, #[case] expected: bool) {
        let cfg = Config::from_pairs([(BATCH_EVENTS, raw)]);
        assert_eq!(cfg.get_bool(BATCH_EVENTS, !expected).unwrap(), expected);
    }

    #[test]
    fn malformed_values_error() {
        let cfg = Config::from_pairs([(BATCH_EVENTS, "yes"), (NUM_THREADS, "many")]);
        assert!(cfg.get_bool(BATCH_EVENTS, false).is_err());
        assert!(cfg.get_int(NUM_THREADS, 4).is_err());
    }

    #[test]
    fn explicit_pairs_override_defaults() {
        let cfg = Config::from_pairs([(RESILIENCE, "2"), (BATCHING_EVENTS_TIMEOUT, "0.5")]);
        assert_eq!(cfg.get_int(RESILIENCE, 0).unwrap(), 2);
        assert!((cfg.get_float(BATCHING_EVENTS_TIMEOUT, 0.1).unwrap() - 0.5).abs() < 1e-12);
    }
}
