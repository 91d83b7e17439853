// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration from `PRICEWATCH_*` environment variables.
//!
//! Every knob has a default; unparsable values fall back to it. The catalog
//! of targets and rules lives in a separate file (see [`crate::targets`]).

use crate::fetcher::PageFetcher;
use crate::monitor::backoff::BackoffPolicy;
use crate::monitor::state::SuspendPolicy;
use crate::renderer::ContextProfile;
use crate::session::SessionConfig;
use crate::store::SqliteStore;
use crate::targets::CatalogDefaults;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MAX_CONTEXTS: usize = 4;
const DEFAULT_NAV_TIMEOUT_SECS: u64 = 20;
const DEFAULT_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
const DEFAULT_BACKOFF_CAP_SECS: u64 = 600;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_MAX_EXTRACTION_RETRIES: u32 = 3;
const DEFAULT_JITTER: f64 = 0.1;
const DEFAULT_DB_POOL: usize = 4;
const DEFAULT_HEALTH_SECS: u64 = 30;
const DEFAULT_ACCEPT_LANGUAGE: &str = "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7";

/// All engine settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Concurrent pipeline runs.
    pub workers: usize,
    pub max_contexts: usize,
    pub acquire_timeout: Duration,
    pub launch_retries: u32,
    pub nav_timeout: Duration,
    /// Interval for targets that do not set their own.
    pub default_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Relative spread applied to regular intervals (0.1 = ±10%).
    pub jitter: f64,
    pub suspend_policy: SuspendPolicy,
    /// Scheduler resolution.
    pub tick: Duration,
    pub db_path: PathBuf,
    pub db_pool_size: usize,
    pub db_timeout: Duration,
    pub health_every: Duration,
    pub health_dir: PathBuf,
    /// Where challenge pages are saved, if anywhere.
    pub debug_dump_dir: Option<PathBuf>,
    /// Context settings for targets without their own profile.
    pub profile: ContextProfile,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl MonitorConfig {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = EnvReader { lookup: &lookup };
        Self {
            workers: env.usize("PRICEWATCH_WORKERS", DEFAULT_WORKERS).max(1),
            max_contexts: env.usize("PRICEWATCH_MAX_CONTEXTS", DEFAULT_MAX_CONTEXTS).max(1),
            acquire_timeout: Duration::from_secs(env.u64("PRICEWATCH_ACQUIRE_TIMEOUT_SECS", 60)),
            launch_retries: env.u32("PRICEWATCH_LAUNCH_RETRIES", 3),
            nav_timeout: Duration::from_secs(
                env.u64("PRICEWATCH_NAV_TIMEOUT_SECS", DEFAULT_NAV_TIMEOUT_SECS).max(1),
            ),
            default_interval: Duration::from_secs(
                env.u64("PRICEWATCH_INTERVAL_SECS", DEFAULT_INTERVAL_SECS).max(1),
            ),
            backoff: BackoffPolicy {
                base: Duration::from_secs(env.u64("PRICEWATCH_BACKOFF_BASE_SECS", DEFAULT_BACKOFF_BASE_SECS)),
                cap: Duration::from_secs(env.u64("PRICEWATCH_BACKOFF_CAP_SECS", DEFAULT_BACKOFF_CAP_SECS)),
                max_retries: env.u32("PRICEWATCH_MAX_RETRIES", DEFAULT_MAX_RETRIES).max(1),
                max_extraction_retries: env
                    .u32("PRICEWATCH_MAX_EXTRACTION_RETRIES", DEFAULT_MAX_EXTRACTION_RETRIES)
                    .max(1),
            },
            jitter: Some(env.f64("PRICEWATCH_JITTER", DEFAULT_JITTER))
                .filter(|j| j.is_finite())
                .map_or(DEFAULT_JITTER, |j| j.clamp(0.0, 0.5)),
            suspend_policy: match env.string("PRICEWATCH_SUSPEND_POLICY").as_deref() {
                Some("retry") | Some("retry_after_interval") => SuspendPolicy::RetryAfterInterval,
                _ => SuspendPolicy::ManualReset,
            },
            tick: Duration::from_millis(env.u64("PRICEWATCH_TICK_MS", 250).max(1)),
            db_path: env
                .string("PRICEWATCH_DB")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(SqliteStore::default_path),
            db_pool_size: env.usize("PRICEWATCH_DB_POOL", DEFAULT_DB_POOL).max(1),
            db_timeout: Duration::from_secs(env.u64("PRICEWATCH_DB_TIMEOUT_SECS", 10).max(1)),
            health_every: Duration::from_secs(env.u64("PRICEWATCH_HEALTH_SECS", DEFAULT_HEALTH_SECS).max(5)),
            health_dir: env
                .string("PRICEWATCH_HEALTH_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_health_dir),
            debug_dump_dir: env
                .string("PRICEWATCH_DEBUG_DUMP_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            profile: ContextProfile {
                user_agent: env.string("PRICEWATCH_USER_AGENT").filter(|v| !v.is_empty()),
                accept_language: Some(
                    env.string("PRICEWATCH_ACCEPT_LANGUAGE")
                        .filter(|v| !v.is_empty())
                        .unwrap_or_else(|| DEFAULT_ACCEPT_LANGUAGE.to_string()),
                ),
            },
        }
    }

    /// Interval and browser profile for targets that set neither.
    pub fn catalog_defaults(&self) -> CatalogDefaults {
        CatalogDefaults {
            interval: self.default_interval,
            profile: self.profile.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_contexts: self.max_contexts,
            acquire_timeout: self.acquire_timeout,
            launch_retries: self.launch_retries,
            ..SessionConfig::default()
        }
    }

    pub fn fetcher(&self) -> PageFetcher {
        let fetcher = PageFetcher::new(self.nav_timeout);
        match &self.debug_dump_dir {
            Some(dir) => fetcher.with_dump_dir(dir),
            None => fetcher,
        }
    }
}

fn default_health_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pricewatch")
        .join("health")
}

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|v| v.trim().to_string())
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default_value: T) -> T {
        self.string(name)
            .and_then(|v| v.parse::<T>().ok())
            .unwrap_or(default_value)
    }

    fn u64(&self, name: &str, default_value: u64) -> u64 {
        self.parsed(name, default_value)
    }

    fn u32(&self, name: &str, default_value: u32) -> u32 {
        self.parsed(name, default_value)
    }

    fn usize(&self, name: &str, default_value: usize) -> usize {
        self.parsed(name, default_value)
    }

    fn f64(&self, name: &str, default_value: f64) -> f64 {
        self.parsed(name, default_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.nav_timeout, Duration::from_secs(20));
        assert_eq!(cfg.default_interval, Duration::from_secs(900));
        assert_eq!(cfg.backoff.max_retries, 5);
        assert_eq!(cfg.suspend_policy, SuspendPolicy::ManualReset);
        assert!(cfg.debug_dump_dir.is_none());
        assert!(cfg.profile.accept_language.is_some());
        assert_eq!(cfg.catalog_defaults().profile, cfg.profile);
        assert_eq!(cfg.catalog_defaults().interval, cfg.default_interval);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PRICEWATCH_WORKERS", "8"),
            ("PRICEWATCH_NAV_TIMEOUT_SECS", "not-a-number"),
            ("PRICEWATCH_JITTER", "3.0"),
            ("PRICEWATCH_SUSPEND_POLICY", "retry"),
            ("PRICEWATCH_DB", "/var/lib/pricewatch/p.db"),
            ("PRICEWATCH_HEALTH_SECS", "1"),
        ]);
        let cfg = MonitorConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.nav_timeout, Duration::from_secs(20));
        assert_eq!(cfg.jitter, 0.5);
        assert_eq!(cfg.suspend_policy, SuspendPolicy::RetryAfterInterval);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/pricewatch/p.db"));
        assert_eq!(cfg.health_every, Duration::from_secs(5));
        assert_eq!(cfg.session_config().max_contexts, 4);
    }

    #[test]
    fn test_non_finite_jitter_falls_back() {
        for value in ["NaN", "inf", "-infinity"] {
            let cfg = MonitorConfig::from_lookup(|name| {
                (name == "PRICEWATCH_JITTER").then(|| value.to_string())
            });
            assert_eq!(cfg.jitter, DEFAULT_JITTER, "{value}");
        }
    }
}
