// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The process-wide TOML config file (§1.3): everything that isn't a
//! per-stream catalog row. Per-stream settings (§3 Stream) live in the
//! catalog and are reached through `cmds::config`, not this file.

use std::path::PathBuf;

use base::{err, Error};
use serde::Deserialize;

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_retention_sweep_secs() -> i64 {
    3600
}

fn default_health_probe_secs() -> i64 {
    30
}

fn default_health_restart_cooldown_secs() -> i64 {
    60
}

fn default_health_max_restart_attempts() -> u32 {
    5
}

fn default_detection_api_base() -> String {
    "http://127.0.0.1:8555/".to_owned()
}

/// Deserialized straight from TOML (§1.3). Every field has a sensible
/// default except `storage_root`, which must be set explicitly: there's no
/// safe guess for where gigabytes of video should land.
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigFile {
    pub storage_root: PathBuf,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: i64,

    #[serde(default = "default_health_probe_secs")]
    pub health_probe_secs: i64,

    #[serde(default = "default_health_restart_cooldown_secs")]
    pub health_restart_cooldown_secs: i64,

    #[serde(default = "default_health_max_restart_attempts")]
    pub health_max_restart_attempts: u32,

    /// Base URL the `api-detection` sentinel resolves against (§4.4); an
    /// embedded model path set on a stream row bypasses this entirely.
    #[serde(default = "default_detection_api_base")]
    pub detection_api_base: String,

    /// Worker threads for the tokio runtime backing RTSP I/O and the HTTP
    /// surface. `0` asks tokio for its own default (one per core).
    #[serde(default)]
    pub worker_threads: usize,
}

impl ConfigFile {
    /// Loads and parses the config file at `path`. Any I/O or parse failure
    /// is a §7 "Configuration" error: the caller should abort startup, never
    /// fall back to defaults for a file that was supposed to exist.
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err!(FailedPrecondition, msg("reading config file {}", path.display()), source(e)))?;
        toml::from_str(&text)
            .map_err(|e| err!(FailedPrecondition, msg("parsing config file {}", path.display()), source(e)))
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_root.join("database").join("nvr.db")
    }

    pub fn health_url(&self) -> Result<url::Url, Error> {
        format!("http://{}/api/health", self.bind_address)
            .parse()
            .map_err(|e| err!(FailedPrecondition, msg("bind address {:?} isn't a usable URL host", self.bind_address), source(e)))
    }

    pub fn detection_api_base(&self) -> Result<url::Url, Error> {
        self.detection_api_base
            .parse()
            .map_err(|e| err!(FailedPrecondition, msg("invalid detection_api_base {:?}", self.detection_api_base), source(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "storage_root = \"/var/lib/camwatch\"\n").unwrap();
        let cfg = ConfigFile::load(&path).unwrap();
        assert_eq!(cfg.storage_root, PathBuf::from("/var/lib/camwatch"));
        assert_eq!(cfg.bind_address, "127.0.0.1:8080");
        assert_eq!(cfg.retention_sweep_secs, 3600);
        assert_eq!(cfg.health_max_restart_attempts, 5);
    }

    #[test]
    fn missing_storage_root_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind_address = \"0.0.0.0:9000\"\n").unwrap();
        let err = ConfigFile::load(&path).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = ConfigFile::load(std::path::Path::new("/nonexistent/config.toml")).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn database_path_is_under_storage_root() {
        let cfg = ConfigFile {
            storage_root: PathBuf::from("/srv/nvr"),
            bind_address: default_bind_address(),
            retention_sweep_secs: default_retention_sweep_secs(),
            health_probe_secs: default_health_probe_secs(),
            health_restart_cooldown_secs: default_health_restart_cooldown_secs(),
            health_max_restart_attempts: default_health_max_restart_attempts(),
            detection_api_base: default_detection_api_base(),
            worker_threads: 0,
        };
        assert_eq!(cfg.database_path(), PathBuf::from("/srv/nvr/database/nvr.db"));
    }
}
