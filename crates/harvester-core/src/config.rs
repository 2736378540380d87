use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::error::AppError;
use crate::export::ExportConfig;
use crate::gate::GateConfig;
use crate::worker::WorkerConfig;

/// Runtime settings for the worker fleet and the services around it.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub workers: usize,
    pub dispatch_interval: Duration,
    pub fetch_timeout: Duration,
    pub export_dir: PathBuf,
    pub export_sync_threshold: u64,
    pub export_stall_timeout: Duration,
    pub analytics_refresh: Duration,
    pub proxy_failure_threshold: u32,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dispatch_interval: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(30),
            export_dir: PathBuf::from("exports"),
            export_sync_threshold: 1000,
            export_stall_timeout: Duration::from_secs(900),
            analytics_refresh: Duration::from_secs(60),
            proxy_failure_threshold: 3,
        }
    }
}

impl HarvesterConfig {
    /// Read configuration from environment variables.
    ///
    /// - `HARVESTER_WORKERS` (defaults to 4)
    /// - `HARVESTER_DISPATCH_INTERVAL_MS` (defaults to 500)
    /// - `HARVESTER_FETCH_TIMEOUT_SECS` (defaults to 30)
    /// - `HARVESTER_EXPORT_DIR` (defaults to `exports`)
    /// - `HARVESTER_EXPORT_SYNC_THRESHOLD` (defaults to 1000)
    /// - `HARVESTER_EXPORT_STALL_SECS` (defaults to 900)
    /// - `HARVESTER_ANALYTICS_REFRESH_SECS` (defaults to 60)
    /// - `HARVESTER_PROXY_FAILURE_THRESHOLD` (defaults to 3)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let workers = positive(&lookup, "HARVESTER_WORKERS", defaults.workers)?;
        let dispatch_ms = positive(&lookup, "HARVESTER_DISPATCH_INTERVAL_MS", 500u64)?;
        let fetch_secs = positive(&lookup, "HARVESTER_FETCH_TIMEOUT_SECS", 30u64)?;
        let export_dir = lookup("HARVESTER_EXPORT_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.export_dir);
        let export_sync_threshold = parse_or(
            &lookup,
            "HARVESTER_EXPORT_SYNC_THRESHOLD",
            defaults.export_sync_threshold,
        )?;
        let stall_secs = positive(&lookup, "HARVESTER_EXPORT_STALL_SECS", 900u64)?;
        let refresh_secs = positive(&lookup, "HARVESTER_ANALYTICS_REFRESH_SECS", 60u64)?;
        let proxy_failure_threshold = positive(
            &lookup,
            "HARVESTER_PROXY_FAILURE_THRESHOLD",
            defaults.proxy_failure_threshold,
        )?;

        Ok(Self {
            workers,
            dispatch_interval: Duration::from_millis(dispatch_ms),
            fetch_timeout: Duration::from_secs(fetch_secs),
            export_dir,
            export_sync_threshold,
            export_stall_timeout: Duration::from_secs(stall_secs),
            analytics_refresh: Duration::from_secs(refresh_secs),
            proxy_failure_threshold,
        })
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            proxy_failure_threshold: self.proxy_failure_threshold,
        }
    }

    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            sync_threshold: self.export_sync_threshold,
            stall_timeout: self.export_stall_timeout,
            ..ExportConfig::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
    }

    /// Worker settings for the `index`-th worker of this process.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig {
            worker_id: format!("worker-{index}"),
            fetch_timeout: self.fetch_timeout,
            ..WorkerConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
        }),
    }
}

fn positive<T: FromStr + PartialEq + Default>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    let value = parse_or(lookup, key, default)?;
    if value == T::default() {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<HarvesterConfig, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HarvesterConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.export_sync_threshold, 1000);
        assert_eq!(config.analytics_refresh, Duration::from_secs(60));
        assert_eq!(config.export_dir, PathBuf::from("exports"));
    }

    #[test]
    fn test_reads_overrides() {
        let config = config_from(&[
            ("HARVESTER_WORKERS", "12"),
            ("HARVESTER_DISPATCH_INTERVAL_MS", "250"),
            ("HARVESTER_EXPORT_DIR", "/var/lib/harvester"),
            ("HARVESTER_EXPORT_SYNC_THRESHOLD", "0"),
            ("HARVESTER_PROXY_FAILURE_THRESHOLD", "5"),
            ("HARVESTER_EXPORT_STALL_SECS", "120"),
        ])
        .unwrap();
        assert_eq!(config.workers, 12);
        assert_eq!(config.dispatch_interval, Duration::from_millis(250));
        assert_eq!(config.export_dir, PathBuf::from("/var/lib/harvester"));
        assert_eq!(config.export_config().sync_threshold, 0);
        assert_eq!(config.export_config().stall_timeout, Duration::from_secs(120));
        assert_eq!(config.gate_config().proxy_failure_threshold, 5);
        assert_eq!(config.worker_config(3).worker_id, "worker-3");
    }

    #[test]
    fn test_rejects_garbage_and_zero() {
        let err = config_from(&[("HARVESTER_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(msg) if msg.contains("HARVESTER_WORKERS")));

        let err = config_from(&[("HARVESTER_FETCH_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
