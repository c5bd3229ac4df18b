// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration related types used by the patch dispatcher

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub log: ConfigLogging,
    #[serde(flatten)]
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// This config object can be used to create a [`crate::PatchDispatcher`].
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
}

/// Everything the dispatcher needs apart from logging.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub master_lock: MasterLockConfig,
    pub monitor: MonitorConfig,
    pub dispatch: DispatchConfig,
    pub artifacts: ArtifactsConfig,
    pub log_area: LogAreaConfig,
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterLockConfig {
    /// Registry entry whose presence marks a running master job.
    pub registry_key: String,
    pub max_retries: u32,
    /// Lower bound of every randomized wait.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "min_wait_secs")]
    pub min_wait: Duration,
    /// Exclusive upper bound of the wait for the first `widen_after`
    /// attempts.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "max_wait_secs")]
    pub max_wait: Duration,
    /// Exclusive upper bound once contention has lasted longer.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "wide_max_wait_secs")]
    pub wide_max_wait: Duration,
    pub widen_after: u32,
}

impl Default for MasterLockConfig {
    fn default() -> Self {
        MasterLockConfig {
            registry_key: "patch_monitor_cmd".to_string(),
            max_retries: 30,
            min_wait: Duration::from_secs(10),
            max_wait: Duration::from_secs(30),
            wide_max_wait: Duration::from_secs(60),
            widen_after: 10,
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "tick_interval_secs")]
    pub tick_interval: Duration,
    pub status_log_every_ticks: u32,
    /// Budget of one worker operation, before any scaling.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "operation_timeout_secs")]
    pub operation_timeout: Duration,
    /// Added on top of the scaled budget so the worker times out first.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_margin_secs")]
    pub timeout_margin: Duration,
    /// Storage node count from which the medium multiplier applies.
    pub cell_medium_threshold: usize,
    /// Storage node count from which the large multiplier applies.
    pub cell_large_threshold: usize,
    pub cell_medium_multiplier: u32,
    pub cell_large_multiplier: u32,
    pub stuck_cluster_retries: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "stuck_cluster_retry_delay_secs")]
    pub stuck_cluster_retry_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            tick_interval: Duration::from_secs(30),
            status_log_every_ticks: 5,
            operation_timeout: Duration::from_secs(6 * 60 * 60),
            timeout_margin: Duration::from_secs(60 * 60),
            cell_medium_threshold: 6,
            cell_large_threshold: 10,
            cell_medium_multiplier: 2,
            cell_large_multiplier: 3,
            stuck_cluster_retries: 3,
            stuck_cluster_retry_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Serialize switch and non-switch work on each shared fabric. When off,
    /// the whole request goes out as one coarse unit.
    pub fabric_locking: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig { fabric_locking: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Root of the versioned artifact store.
    pub root: Utf8PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        ArtifactsConfig { root: Utf8PathBuf::from("PatchPayloads") }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogAreaConfig {
    /// Per-job log directories are created below this.
    pub root: Utf8PathBuf,
    /// Workers keep their own logs below this, one directory per child
    /// request.
    pub worker_log_root: Utf8PathBuf,
    /// Free space each cluster's logs may need.
    pub working_space_mb: u64,
}

impl Default for LogAreaConfig {
    fn default() -> Self {
        LogAreaConfig {
            root: Utf8PathBuf::from("log/patch"),
            worker_log_root: Utf8PathBuf::from("log/requests"),
            working_space_mb: 1024,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn parses_partial_config() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [master_lock]
            max_retries = 4

            [monitor]
            tick_interval_secs = 5
            cell_large_multiplier = 5

            [dispatch]
            fabric_locking = false
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        let dispatcher = config.dispatcher;
        assert_eq!(dispatcher.master_lock.max_retries, 4);
        assert_eq!(dispatcher.master_lock.registry_key, "patch_monitor_cmd");
        assert_eq!(dispatcher.monitor.tick_interval, Duration::from_secs(5));
        assert_eq!(dispatcher.monitor.cell_large_multiplier, 5);
        assert_eq!(dispatcher.monitor.cell_medium_multiplier, 2);
        assert!(!dispatcher.dispatch.fabric_locking);
        assert_eq!(dispatcher.artifacts.root, "PatchPayloads");
    }

    #[test]
    fn reports_path_on_error() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let error = Config::from_file(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
        assert!(error.to_string().contains("missing.toml"));

        std::fs::write(&path, "log = 3").unwrap();
        let error = Config::from_file(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
    }
}
