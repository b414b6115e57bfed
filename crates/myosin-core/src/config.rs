//! Engine configuration.
//!
//! Uncached operation is the default: with no cache base path every
//! `cache()` call fails with [`CacheError::NullCachePath`](crate::CacheError)
//! while loads simply keep constructor defaults.
//!
//! Settings can be deserialized from any serde source or read from the
//! environment:
//! - `MYOSIN_CACHE_BASE_PATH`: directory holding one JSON document per model type
//! - `MYOSIN_DISPATCH_WORKERS`: worker threads of an engine-owned dispatch runtime

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable selecting the cache base directory.
pub const CACHE_BASE_PATH_ENV: &str = "MYOSIN_CACHE_BASE_PATH";

/// Environment variable overriding the dispatch worker count.
pub const DISPATCH_WORKERS_ENV: &str = "MYOSIN_DISPATCH_WORKERS";

const DEFAULT_DISPATCH_WORKERS: usize = 2;

/// State engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Base directory for cached model documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_base_path: Option<PathBuf>,

    /// Worker threads for the engine-owned dispatch runtime. Ignored when
    /// the engine is constructed inside an existing tokio runtime.
    pub dispatch_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_base_path: None,
            dispatch_workers: DEFAULT_DISPATCH_WORKERS,
        }
    }
}

impl EngineConfig {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    ///
    /// Empty values count as unset; an unparsable worker count falls back to
    /// the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_base_path = lookup(CACHE_BASE_PATH_ENV)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let dispatch_workers = lookup(DISPATCH_WORKERS_ENV)
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_DISPATCH_WORKERS);

        Self {
            cache_base_path,
            dispatch_workers,
        }
    }

    pub fn with_cache_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_base_path = Some(path.into());
        self
    }

    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    /// Worker count clamped to at least one thread.
    pub fn effective_dispatch_workers(&self) -> usize {
        self.dispatch_workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_uncached() {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(config, EngineConfig::default());
        assert!(config.cache_base_path.is_none());
        assert_eq!(config.dispatch_workers, 2);
    }

    #[test]
    fn test_lookup_values() {
        let config = EngineConfig::from_lookup(lookup(&[
            (CACHE_BASE_PATH_ENV, "/var/lib/myosin"),
            (DISPATCH_WORKERS_ENV, "4"),
        ]));
        assert_eq!(config.cache_base_path, Some(PathBuf::from("/var/lib/myosin")));
        assert_eq!(config.dispatch_workers, 4);
    }

    #[test]
    fn test_empty_and_invalid_values() {
        let config = EngineConfig::from_lookup(lookup(&[
            (CACHE_BASE_PATH_ENV, "  "),
            (DISPATCH_WORKERS_ENV, "many"),
        ]));
        assert!(config.cache_base_path.is_none());
        assert_eq!(config.dispatch_workers, 2);
    }

    #[test]
    fn test_worker_clamp() {
        let config = EngineConfig::default().with_dispatch_workers(0);
        assert_eq!(config.effective_dispatch_workers(), 1);
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{"cacheBasePath": "/tmp/cache"}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache_base_path, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(config.dispatch_workers, 2);
    }
}
