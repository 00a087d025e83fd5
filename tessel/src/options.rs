//! Per-call configuration.
//!
//! Options are a set of name = value pairs. Only `target` is interpreted; anything else is kept
//! but ignored so that callers can share one option set between routines.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::Target;

pub const TARGET: &str = "target";

#[derive(Debug, Clone, Default)]
pub struct Options {
    entries: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `name = value` pairs, names are case-insensitive.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut options = Self::new();
        for (key, value) in pairs {
            options.set(key, value);
        }
        options
    }

    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> &mut Self {
        self.entries
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.set(TARGET, target.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The execution target, `HostTask` when unset.
    pub fn target(&self) -> Result<Target> {
        match self.get(TARGET) {
            Some(value) => value.parse(),
            None => Ok(Target::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_ignored() {
        let opts = Options::from_pairs([("Lookahead", "2"), ("Target", "hostbatch")]);
        assert_eq!(opts.target().unwrap(), Target::HostBatch);
        assert_eq!(opts.get("lookahead"), Some("2"));
    }

    #[test]
    fn default_target_is_host_task() {
        assert_eq!(Options::new().target().unwrap(), Target::HostTask);
    }

    #[test]
    fn bad_target_value_is_rejected() {
        let opts = Options::from_pairs([("target", "quantum")]);
        assert!(opts.target().is_err());
    }
}
