//! Sender configuration (`tsync.toml`).
//!
//! Loading never fails: a missing, unreadable or malformed file is logged and
//! the defaults are used instead.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name looked up when no explicit path is given
pub const CONFIG_FILE: &str = "tsync.toml";

/// Name the schema log is announced under on the receiver
pub const SCHEMA_LOG_NAME: &str = "mlog.txt";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Receiver host
    pub server_ip: String,
    /// Receiver port
    pub server_port: u16,
    /// Delay between the end of one cycle and the start of the next
    pub sync_period_in_second: u64,
    /// Interval of the status monitor
    pub monitor_period_in_second: u64,

    /// Data directories; each sub-directory is a storage group
    pub data_dirs: Vec<PathBuf>,
    /// Append-only schema definition log
    pub schema_log: PathBuf,
    /// Directory holding the schema position and the lock file
    pub sender_dir: PathBuf,
    /// Per data directory state folder name
    pub state_dir_name: String,
    /// Overrides `<sender_dir>/sync.lock`
    pub lock_file: Option<PathBuf>,

    /// Bytes per `sendChunk` call
    pub chunk_size: usize,
    /// Schema lines per `sendChunk` call
    pub schema_batch_lines: usize,
    /// Full attempts per file or schema region
    pub max_attempts: u32,
    /// Per remote call timeout
    pub call_timeout_secs: u64,
    /// Suffixes of files still being written
    pub open_file_suffixes: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            server_port: 5555,
            sync_period_in_second: 600,
            monitor_period_in_second: 10,
            data_dirs: vec![PathBuf::from("data/data")],
            schema_log: PathBuf::from("data/system/schema").join(SCHEMA_LOG_NAME),
            sender_dir: PathBuf::from("data/sync-sender"),
            state_dir_name: "sync-sender".to_string(),
            lock_file: None,
            chunk_size: 64 * 1024,
            schema_batch_lines: 1000,
            max_attempts: 5,
            call_timeout_secs: 30,
            open_file_suffixes: vec![".tmp".to_string()],
        }
    }
}

impl AgentConfig {
    /// Load config from `path`, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Config file {} not found, using default configuration",
                    path.display()
                );
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(
                    "Cannot read config file {}: {}, using default configuration",
                    path.display(),
                    e
                );
                return Self::default();
            }
        };

        tracing::info!("Loading sync config file {}", path.display());
        match Self::parse(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Malformed config file {}: {}, using default configuration",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Parse TOML content; unknown keys are ignored, missing keys get defaults.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_paths();
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.data_dirs = self.data_dirs.iter().map(|p| expand_tilde(p)).collect();
        self.schema_log = expand_tilde(&self.schema_log);
        self.sender_dir = expand_tilde(&self.sender_dir);
        self.lock_file = self.lock_file.as_deref().map(expand_tilde);
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.sender_dir.join("sync.lock"))
    }

    pub fn schema_pos_path(&self) -> PathBuf {
        self.sender_dir.join("sync_schema.pos")
    }

    /// State folder of one data directory
    pub fn state_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.state_dir_name)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_in_second.max(1))
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_secs(self.monitor_period_in_second.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn is_open_file(&self, name: &str) -> bool {
        self.open_file_suffixes
            .iter()
            .any(|suffix| !suffix.is_empty() && name.ends_with(suffix.as_str()))
    }
}

/// Expand tilde (~) in paths to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_keys() {
        let config = AgentConfig::parse(
            r#"
server_ip = "192.168.1.20"
server_port = 6667
sync_period_in_second = 30
"#,
        )
        .unwrap();
        assert_eq!(config.server_addr(), "192.168.1.20:6667");
        assert_eq!(config.sync_period(), Duration::from_secs(30));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.schema_batch_lines, 1000);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = AgentConfig::parse("").unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = AgentConfig::parse("receiver_name = \"old\"\nserver_port = 7000").unwrap();
        assert_eq!(config.server_port, 7000);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "server_port = \"not a number\"").unwrap();
        assert_eq!(AgentConfig::load(&path), AgentConfig::default());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_derived_paths() {
        let config = AgentConfig {
            sender_dir: PathBuf::from("/var/tsync"),
            ..Default::default()
        };
        assert_eq!(config.lock_path(), PathBuf::from("/var/tsync/sync.lock"));
        assert_eq!(
            config.schema_pos_path(),
            PathBuf::from("/var/tsync/sync_schema.pos")
        );
        assert_eq!(
            config.state_dir(Path::new("/data/d1")),
            PathBuf::from("/data/d1/sync-sender")
        );
    }

    #[test]
    fn test_open_file_suffix() {
        let config = AgentConfig::default();
        assert!(config.is_open_file("1700000000-1.tsfile.tmp"));
        assert!(!config.is_open_file("1700000000-1.tsfile"));
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/state")), home.join("state"));
        }
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
