use anyhow::{Context, Result};
use clap::Parser;
use ipm_core::Config;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "config.yml";
pub const DEFAULT_DATA_PATH: &str = ".";
pub const DEFAULT_LISTEN: &str = ":1234";

#[derive(Parser, Debug)]
#[command(name = "iptmgr")]
#[command(version, about = "Clustered iptables rule-set manager", long_about = None)]
pub struct Cli {
    /// Path to configuration file [default: config.yml]
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<String>,

    /// Path to persistent data storage [default: .]
    #[arg(long, env = "DATA_PATH")]
    pub data_path: Option<String>,

    /// Append logs to this file as well as stdout
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<String>,

    /// Listen address of the API [default: :1234]
    #[arg(long, env = "LISTEN")]
    pub listen: Option<String>,

    /// Comma separated list of cluster peers
    #[arg(long, env = "PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Purge all custom chains on exit
    #[arg(long, env = "PURGE_ON_EXIT")]
    pub purge_on_exit: bool,

    /// Priority used to pick the active node
    #[arg(long, env = "PRIORITY")]
    pub priority: Option<u32>,
}

/// Effective options after merging flags, environment and config file
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config_file: String,
    pub data_path: PathBuf,
    pub log_file: Option<String>,
    pub listen: String,
    pub peers: Vec<String>,
    pub purge_on_exit: bool,
    pub priority: u32,
}

impl Cli {
    /// Read the configuration file. A missing file is only an error when it
    /// was asked for explicitly.
    pub fn load_config(&self) -> Result<Config> {
        match &self.config_file {
            Some(path) => Config::from_file(Path::new(path))
                .with_context(|| format!("Failed to load configuration file {}", path)),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if !path.exists() {
                    return Ok(Config::default());
                }
                Config::from_file(path)
                    .with_context(|| format!("Failed to load configuration file {}", DEFAULT_CONFIG_FILE))
            }
        }
    }

    /// Flag or environment first, then the config file, then the default
    pub fn resolve(&self, config: &Config) -> Settings {
        let options = &config.options;
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());

        let mut peers: Vec<String> = if self.peers.is_empty() {
            options.peers.clone()
        } else {
            self.peers.clone()
        };
        peers.retain(|p| !p.trim().is_empty());
        peers.iter_mut().for_each(|p| *p = p.trim().to_string());

        Settings {
            config_file: self
                .config_file
                .clone()
                .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string()),
            data_path: PathBuf::from(
                non_empty(&self.data_path)
                    .or_else(|| non_empty(&options.data_path))
                    .unwrap_or_else(|| DEFAULT_DATA_PATH.to_string()),
            ),
            log_file: non_empty(&self.log_file).or_else(|| non_empty(&options.log_file)),
            listen: non_empty(&self.listen)
                .or_else(|| non_empty(&options.listen))
                .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            peers,
            purge_on_exit: self.purge_on_exit || options.purge_on_exit,
            priority: self.priority.unwrap_or(options.priority),
        }
    }
}

/// `:port` listens on every interface
pub fn bind_address(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_yaml(
            r#"
options:
  listen: "127.0.0.1:9000"
  data-path: /var/lib/iptmgr
  log-file: /var/log/iptmgr.log
  peers: [10.0.0.2:1234, 10.0.0.3:1234]
  priority: 3
"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_without_flags_or_config() {
        let cli = Cli::try_parse_from(["iptmgr"]).unwrap();
        let settings = cli.resolve(&Config::default());
        assert_eq!(settings.config_file, "config.yml");
        assert_eq!(settings.data_path, PathBuf::from("."));
        assert_eq!(settings.listen, ":1234");
        assert!(settings.log_file.is_none());
        assert!(settings.peers.is_empty());
        assert!(!settings.purge_on_exit);
        assert_eq!(settings.priority, 0);
    }

    #[test]
    fn config_file_fills_unset_flags() {
        let cli = Cli::try_parse_from(["iptmgr"]).unwrap();
        let settings = cli.resolve(&config());
        assert_eq!(settings.listen, "127.0.0.1:9000");
        assert_eq!(settings.data_path, PathBuf::from("/var/lib/iptmgr"));
        assert_eq!(settings.log_file.as_deref(), Some("/var/log/iptmgr.log"));
        assert_eq!(settings.peers, vec!["10.0.0.2:1234", "10.0.0.3:1234"]);
        assert_eq!(settings.priority, 3);
    }

    #[test]
    fn flags_override_config_file() {
        let cli = Cli::try_parse_from([
            "iptmgr",
            "--listen",
            ":8080",
            "--data-path",
            "/tmp/ipm",
            "--peers",
            "a:1, b:2,",
            "--priority",
            "9",
            "--purge-on-exit",
        ])
        .unwrap();
        let settings = cli.resolve(&config());
        assert_eq!(settings.listen, ":8080");
        assert_eq!(settings.data_path, PathBuf::from("/tmp/ipm"));
        assert_eq!(settings.peers, vec!["a:1", "b:2"]);
        assert_eq!(settings.priority, 9);
        assert!(settings.purge_on_exit);
    }

    #[test]
    fn explicit_missing_config_file_fails() {
        let cli = Cli::try_parse_from(["iptmgr", "--config-file", "/nonexistent/iptmgr.yml"]).unwrap();
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn bind_address_fills_in_any_host() {
        assert_eq!(bind_address(":1234"), "0.0.0.0:1234");
        assert_eq!(bind_address("127.0.0.1:80"), "127.0.0.1:80");
    }
}
