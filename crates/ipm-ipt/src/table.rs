use crate::patterns;
use ipm_core::{Chain, Error, Result, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Custom chains and default-chain links of one iptables table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub custom_chains: Vec<Chain>,
    /// root name (`input`) -> chain that receives rules addressed to that root
    pub default_chains: BTreeMap<String, String>,
}

impl Table {
    fn new(table: TableName) -> Self {
        Self {
            custom_chains: vec![],
            default_chains: table
                .root_chains()
                .iter()
                .map(|root| (root.to_string(), root.to_uppercase()))
                .collect(),
        }
    }
}

/// In-process model of the chains iptmgr has created.
///
/// Owned by the [`Engine`](crate::Engine) and only mutated after the
/// corresponding firewall commands succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tables {
    pub filter: Table,
    pub nat: Table,
}

impl Tables {
    pub fn new() -> Self {
        Self {
            filter: Table::new(TableName::Filter),
            nat: Table::new(TableName::Nat),
        }
    }

    pub fn table(&self, table: TableName) -> &Table {
        match table {
            TableName::Filter => &self.filter,
            TableName::Nat => &self.nat,
        }
    }

    fn table_mut(&mut self, table: TableName) -> &mut Table {
        match table {
            TableName::Filter => &mut self.filter,
            TableName::Nat => &mut self.nat,
        }
    }

    pub fn find_chain(&self, table: TableName, name: &str) -> Option<&Chain> {
        self.table(table)
            .custom_chains
            .iter()
            .find(|c| c.name == name)
    }

    /// Check table and chain syntax, and chain existence.
    ///
    /// Root chains (no `-`) always exist and are only accepted with
    /// `allow_root`. With `must_exist` a missing custom chain is `NotFound`;
    /// without it an existing chain is `Conflict`.
    pub fn validate_chain(
        &self,
        table: &str,
        chain: &str,
        must_exist: bool,
        allow_root: bool,
    ) -> Result<TableName> {
        let table: TableName = table.parse()?;
        let pattern = match table {
            TableName::Filter => &patterns::FILTER_CHAIN,
            TableName::Nat => &patterns::NAT_CHAIN,
        };
        patterns::check(pattern, chain, "chain")?;

        let exists = if Chain::is_root(chain) {
            if !allow_root {
                return Err(Error::invalid(format!(
                    "chain ({}) is a root chain in table ({})",
                    chain, table
                )));
            }
            true
        } else {
            self.find_chain(table, chain).is_some()
        };

        match (must_exist, exists) {
            (true, false) => Err(Error::not_found(format!(
                "unable to find chain ({}) in table ({})",
                chain, table
            ))),
            (false, true) => Err(Error::conflict(format!(
                "chain ({}) already exists in table ({})",
                chain, table
            ))),
            _ => Ok(table),
        }
    }

    /// Physical chain for a logical one: custom names map to themselves,
    /// root names to the chain currently marked default for that root
    pub fn default_chain(&self, table: TableName, chain: &str) -> String {
        if !Chain::is_root(chain) {
            return chain.to_string();
        }
        self.table(table)
            .default_chains
            .get(chain)
            .cloned()
            .unwrap_or_else(|| chain.to_uppercase())
    }

    /// Custom chain currently marked default for `root`, if any
    pub fn default_custom_chain(&self, table: TableName, root: &str) -> Option<&str> {
        self.table(table)
            .default_chains
            .get(root)
            .map(String::as_str)
            .filter(|c| !Chain::is_root(c))
    }

    pub(crate) fn register(&mut self, table: TableName, chain: Chain) {
        let t = self.table_mut(table);
        if chain.default {
            t.default_chains
                .insert(Chain::root_of(&chain.name).to_string(), chain.name.clone());
        }
        t.custom_chains.push(chain);
    }

    pub(crate) fn unregister(&mut self, table: TableName, name: &str) -> Option<Chain> {
        let t = self.table_mut(table);
        let idx = t.custom_chains.iter().position(|c| c.name == name)?;
        let chain = t.custom_chains.remove(idx);

        let root = Chain::root_of(name);
        if t.default_chains.get(root).map(String::as_str) == Some(name) {
            t.default_chains.insert(root.to_string(), root.to_uppercase());
        }
        Some(chain)
    }

    pub(crate) fn reset_defaults(&mut self) {
        for table in TableName::ALL {
            for (root, linked) in self.table_mut(table).default_chains.iter_mut() {
                *linked = root.to_uppercase();
            }
        }
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}
