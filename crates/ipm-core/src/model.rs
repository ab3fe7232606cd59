use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// iptables tables managed by iptmgr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableName {
    Filter,
    Nat,
}

impl TableName {
    pub const ALL: [TableName; 2] = [TableName::Filter, TableName::Nat];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Filter => "filter",
            TableName::Nat => "nat",
        }
    }

    /// Root chains iptables provides for this table
    pub fn root_chains(&self) -> &'static [&'static str] {
        match self {
            TableName::Filter => &["input", "output", "forward"],
            TableName::Nat => &["input", "output", "prerouting", "postrouting"],
        }
    }
}

impl FromStr for TableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "filter" => Ok(TableName::Filter),
            "nat" => Ok(TableName::Nat),
            _ => Err(Error::invalid(format!("invalid table name ({})", s))),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured rule as accepted by the HTTP API.
///
/// Every field is a plain string and is validated when the rule is built
/// into an iptables command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    pub table: String,
    pub chain: String,
    pub action: String,
    pub protocol: String,
    pub source_interface: String,
    pub destination_interface: String,
    pub source_subnet: String,
    pub destination_subnet: String,
    pub source_ports: String,
    pub destination_ports: String,
    pub nat_destination: String,
}

/// Custom chain linked into a root chain or another custom chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    pub parent: String,
    #[serde(default)]
    pub insert: bool,
    #[serde(default)]
    pub default: bool,
}

impl Chain {
    pub fn new(name: &str, parent: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.to_string(),
            insert: false,
            default: false,
        }
    }

    pub fn inserted(mut self) -> Self {
        self.insert = true;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    /// Root suffix of a chain name: `iptmgr-input` -> `input`, `input` -> `input`
    pub fn root_of(name: &str) -> &str {
        match name.split_once('-') {
            Some((_, suffix)) => suffix,
            None => name,
        }
    }

    pub fn is_root(name: &str) -> bool {
        !name.contains('-')
    }
}
