//! Daemon configuration: TOML file merged with command-line overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::protocol::{MAX_FRAME_SIZE, VERSION};
use crate::session::{SessionOptions, SessionRole};

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Maximum accepted frame size in bytes
    pub max_frame_size: usize,
    /// Drop cleartext frames once a session cipher is established
    pub require_encryption: bool,
    /// Close sessions idle longer than this many seconds (0 = never)
    pub idle_timeout_secs: u64,
    /// Directory receiving uploaded files
    pub file_store: PathBuf,
    /// Accounts accepted by the sample login handler
    pub users: Vec<UserConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    pub user_id: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            bind: "0.0.0.0:4701".to_string(),
            max_frame_size: MAX_FRAME_SIZE,
            require_encryption: false,
            idle_timeout_secs: 900,
            file_store: PathBuf::from("files"),
            users: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            role: SessionRole::Server,
            max_frame_size: self.max_frame_size,
            require_encryption: self.require_encryption,
            idle_timeout: match self.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            queue_depth: 64,
            protocol_version: VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.bind, "0.0.0.0:4701");
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert!(!config.require_encryption);
        assert!(config.users.is_empty());
        assert!(config.session_options().idle_timeout.is_some());
    }

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            bind = "127.0.0.1:9900"
            max_frame_size = 1048576
            require_encryption = true
            idle_timeout_secs = 0
            file_store = "/var/lib/gridmon/files"

            [[users]]
            name = "operator"
            password = "secret"
            user_id = 7
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9900");
        assert!(config.require_encryption);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].user_id, 7);
        let opts = config.session_options();
        assert_eq!(opts.max_frame_size, 1048576);
        assert!(opts.idle_timeout.is_none());
        assert!(opts.require_encryption);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<DaemonConfig>("frobnicate = true").is_err());
    }
}
