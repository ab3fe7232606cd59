use crate::error::{Error, Result};
use crate::model::{Chain, TableName};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of `config.yml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub chains: ChainConfig,
}

/// Daemon options; command-line flags and environment take precedence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Options {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub purge_on_exit: bool,
    #[serde(default)]
    pub priority: u32,
}

/// Custom chains created at startup, per table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub filter: Vec<Chain>,
    #[serde(default)]
    pub nat: Vec<Chain>,
}

impl ChainConfig {
    /// Chains in creation order: filter first, then nat
    pub fn iter(&self) -> impl Iterator<Item = (TableName, &Chain)> {
        self.filter
            .iter()
            .map(|c| (TableName::Filter, c))
            .chain(self.nat.iter().map(|c| (TableName::Nat, c)))
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty() && self.nat.is_empty()
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
options:
  listen: ":8080"
  data-path: /var/lib/iptmgr
  peers:
    - 10.0.0.2:8080
    - 10.0.0.3:8080
  purge-on-exit: true
  priority: 10
chains:
  filter:
    - name: iptmgr-input
      parent: input
      insert: true
      default: true
    - name: iptmgr-forward
      parent: forward
  nat:
    - name: iptmgr-prerouting
      parent: prerouting
      default: true
"#;

    #[test]
    fn parses_options_and_chains() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.options.listen.as_deref(), Some(":8080"));
        assert_eq!(config.options.data_path.as_deref(), Some("/var/lib/iptmgr"));
        assert_eq!(config.options.peers.len(), 2);
        assert!(config.options.purge_on_exit);
        assert_eq!(config.options.priority, 10);
        assert!(config.options.log_file.is_none());

        let chains: Vec<_> = config.chains.iter().collect();
        assert_eq!(chains.len(), 3);
        assert_eq!(chains[0].0, TableName::Filter);
        assert!(chains[0].1.insert && chains[0].1.default);
        assert!(!chains[1].1.insert);
        assert_eq!(chains[2].0, TableName::Nat);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.chains.is_empty());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::from_file(Path::new("/nonexistent/iptmgr.yml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/iptmgr.yml"));
    }
}
