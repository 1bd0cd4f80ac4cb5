use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::persist::write_atomic;

pub const DEFAULT_PUBLIC_PORT: u16 = 8080;
pub const DEFAULT_PRIVATE_PORT: u16 = 8443;
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 10;
pub const DEFAULT_MAX_REPORT_LENGTH: i64 = 100_000;
pub const DEFAULT_MAX_COMMENT_LENGTH: i64 = 10_000;

const CONFIGURATION_FILE: &str = "configuration.json";
const USERS_FILE: &str = "users.json";
const ACTIONS_FILE: &str = "actions.json";
const PROCESSES_FILE: &str = "processes.json";
const LOG_FILE: &str = "cirrus.log";

/// Effective server configuration: defaults relative to the cloud directory,
/// overlaid with `etc/configuration.json` when present, then with
/// command-line overrides. Negative size limits mean "unlimited".
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(skip)]
    pub cloud_dir: PathBuf,

    pub public_port: u16,
    pub private_port: u16,
    pub rate_limit_per_second: u32,

    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub ca_certificate_path: PathBuf,

    pub file_store_path: PathBuf,
    pub file_store_max_size: i64,
    pub file_store_max_file_size: i64,

    pub max_report_length: i64,
    pub max_comment_length: i64,

    pub sender_email_address: String,

    pub ca_dir: PathBuf,
}

/// On-disk form of the configuration: every field optional so a partial file
/// only overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigurationOverlay {
    public_port: Option<u16>,
    private_port: Option<u16>,
    rate_limit_per_second: Option<u32>,
    certificate_path: Option<PathBuf>,
    private_key_path: Option<PathBuf>,
    ca_certificate_path: Option<PathBuf>,
    file_store_path: Option<PathBuf>,
    file_store_max_size: Option<i64>,
    file_store_max_file_size: Option<i64>,
    max_report_length: Option<i64>,
    max_comment_length: Option<i64>,
    sender_email_address: Option<String>,
    ca_dir: Option<PathBuf>,
}

impl Configuration {
    pub fn with_cloud_dir(cloud_dir: PathBuf) -> Self {
        let server_cert_dir = cloud_dir.join("cert").join("server");
        let ca_cert_dir = cloud_dir.join("cert").join("ca");
        Self {
            public_port: DEFAULT_PUBLIC_PORT,
            private_port: DEFAULT_PRIVATE_PORT,
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            certificate_path: server_cert_dir.join("server.cert.pem"),
            private_key_path: server_cert_dir.join("server.key.pem"),
            ca_certificate_path: ca_cert_dir.join("ca-chain.cert.pem"),
            file_store_path: cloud_dir.join("store"),
            file_store_max_size: -1,
            file_store_max_file_size: -1,
            max_report_length: DEFAULT_MAX_REPORT_LENGTH,
            max_comment_length: DEFAULT_MAX_COMMENT_LENGTH,
            sender_email_address: String::new(),
            ca_dir: cloud_dir.join("range-ca"),
            cloud_dir,
        }
    }

    /// Defaults for `cloud_dir`, merged with `etc/configuration.json` when it
    /// exists.
    pub fn load(cloud_dir: &Path) -> Result<Self> {
        let mut config = Self::with_cloud_dir(cloud_dir.to_path_buf());
        let file = config.configuration_file();
        if !file.exists() {
            warn!(
                "configuration file {} does not exist, using defaults",
                file.display()
            );
            return Ok(config);
        }

        info!("reading configuration file {}", file.display());
        let bytes = fs::read(&file).with_context(|| format!("read {}", file.display()))?;
        let overlay: ConfigurationOverlay =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", file.display()))?;
        config.apply(overlay);
        Ok(config)
    }

    fn apply(&mut self, overlay: ConfigurationOverlay) {
        let Self {
            cloud_dir: _,
            public_port,
            private_port,
            rate_limit_per_second,
            certificate_path,
            private_key_path,
            ca_certificate_path,
            file_store_path,
            file_store_max_size,
            file_store_max_file_size,
            max_report_length,
            max_comment_length,
            sender_email_address,
            ca_dir,
        } = self;
        *public_port = overlay.public_port.unwrap_or(*public_port);
        *private_port = overlay.private_port.unwrap_or(*private_port);
        *rate_limit_per_second = overlay
            .rate_limit_per_second
            .unwrap_or(*rate_limit_per_second);
        if let Some(path) = overlay.certificate_path {
            *certificate_path = path;
        }
        if let Some(path) = overlay.private_key_path {
            *private_key_path = path;
        }
        if let Some(path) = overlay.ca_certificate_path {
            *ca_certificate_path = path;
        }
        if let Some(path) = overlay.file_store_path {
            *file_store_path = path;
        }
        *file_store_max_size = overlay.file_store_max_size.unwrap_or(*file_store_max_size);
        *file_store_max_file_size = overlay
            .file_store_max_file_size
            .unwrap_or(*file_store_max_file_size);
        *max_report_length = overlay.max_report_length.unwrap_or(*max_report_length);
        *max_comment_length = overlay.max_comment_length.unwrap_or(*max_comment_length);
        if let Some(address) = overlay.sender_email_address {
            *sender_email_address = address;
        }
        if let Some(path) = overlay.ca_dir {
            *ca_dir = path;
        }
    }

    /// Rewrite `etc/configuration.json` from the effective settings.
    pub fn sync(&self) -> Result<()> {
        let file = self.configuration_file();
        info!("writing configuration file {}", file.display());
        let bytes = serde_json::to_vec_pretty(self).context("serialize configuration")?;
        write_atomic(&file, &bytes)
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.cloud_dir.join("etc")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.cloud_dir.join("log")
    }

    pub fn var_dir(&self) -> PathBuf {
        self.cloud_dir.join("var")
    }

    pub fn processes_dir(&self) -> PathBuf {
        self.cloud_dir.join("processes")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.cloud_dir.join("reports")
    }

    pub fn server_cert_dir(&self) -> PathBuf {
        self.cloud_dir.join("cert").join("server")
    }

    pub fn ca_cert_dir(&self) -> PathBuf {
        self.cloud_dir.join("cert").join("ca")
    }

    pub fn configuration_file(&self) -> PathBuf {
        self.etc_dir().join(CONFIGURATION_FILE)
    }

    pub fn users_file(&self) -> PathBuf {
        self.etc_dir().join(USERS_FILE)
    }

    pub fn actions_file(&self) -> PathBuf {
        self.etc_dir().join(ACTIONS_FILE)
    }

    pub fn processes_file(&self) -> PathBuf {
        self.etc_dir().join(PROCESSES_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(LOG_FILE)
    }

    /// Create the on-disk layout under the cloud directory.
    pub fn create_directories(&self) -> Result<()> {
        for dir in [
            self.etc_dir(),
            self.log_dir(),
            self.var_dir(),
            self.processes_dir(),
            self.reports_dir(),
            self.server_cert_dir(),
            self.ca_cert_dir(),
            self.file_store_path.clone(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_cloud_dir() {
        let config = Configuration::with_cloud_dir(PathBuf::from("/srv/cloud"));
        assert_eq!(config.public_port, DEFAULT_PUBLIC_PORT);
        assert_eq!(config.private_port, DEFAULT_PRIVATE_PORT);
        assert_eq!(config.file_store_path, PathBuf::from("/srv/cloud/store"));
        assert_eq!(
            config.users_file(),
            PathBuf::from("/srv/cloud/etc/users.json")
        );
        assert_eq!(config.file_store_max_size, -1);
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::with_cloud_dir(dir.path().to_path_buf());
        config.create_directories().unwrap();
        fs::write(
            config.configuration_file(),
            r#"{"publicPort": 9999, "fileStoreMaxSize": 100}"#,
        )
        .unwrap();

        let loaded = Configuration::load(dir.path()).unwrap();
        assert_eq!(loaded.public_port, 9999);
        assert_eq!(loaded.file_store_max_size, 100);
        // Untouched fields keep their cloud-dir-relative defaults.
        assert_eq!(loaded.private_port, DEFAULT_PRIVATE_PORT);
        assert_eq!(loaded.file_store_path, dir.path().join("store"));
    }

    #[test]
    fn sync_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Configuration::with_cloud_dir(dir.path().to_path_buf());
        config.create_directories().unwrap();
        config.rate_limit_per_second = 42;
        config.sync().unwrap();

        let loaded = Configuration::load(dir.path()).unwrap();
        assert_eq!(loaded.rate_limit_per_second, 42);
    }
}
