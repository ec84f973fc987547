//! Environment handling for child processes.

use crate::RESERVED_VARS;
use std::collections::BTreeMap;
use std::env;

/// Ordered so the environment handed to a child is deterministic.
pub type EnvMap = BTreeMap<String, String>;

/// Splits `KEY=VALUE`. Everything after the first `=` is the value.
pub fn split_var(s: &str) -> Option<(&str, &str)> {
    let (k, v) = s.split_once('=')?;
    if k.is_empty() {
        return None;
    }
    Some((k, v))
}

pub fn join_var(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

pub fn is_reserved(key: &str) -> bool {
    RESERVED_VARS.contains(&key)
}

/// The current process environment, minus variables shepherd consumes itself.
/// Entries that are not valid UTF-8 are skipped.
pub fn inherited() -> EnvMap {
    env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .filter(|(k, _)| !is_reserved(k))
        .collect()
}

/// Later layers override earlier ones.
pub fn merge<'a, I>(layers: I) -> EnvMap
where
    I: IntoIterator<Item = &'a EnvMap>,
{
    let mut merged = EnvMap::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Parses a list of `KEY=VALUE` strings. Malformed entries are logged and skipped.
pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> EnvMap {
    let mut map = EnvMap::new();
    for pair in pairs {
        match split_var(pair.as_ref()) {
            Some((k, v)) => {
                map.insert(k.to_string(), v.to_string());
            }
            None => log::warn!("Ignoring malformed environment entry {:?}", pair.as_ref()),
        }
    }
    map
}

/// Non-empty means true, like most shell flags.
pub fn flag(key: &str) -> bool {
    env::var_os(key).is_some_and(|v| !v.is_empty())
}
