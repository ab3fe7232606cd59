use crate::executor::{split_args, FirewallExecutor};
use crate::rule::{self, rule_lines};
use crate::table::Tables;
use ipm_core::{Chain, Error, Result, Rule, TableName};
use ipm_metrics::Metrics;
use ipm_registry::{validate_id, Registry};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Applies chains and rule sets to the firewall and keeps the registry in step.
///
/// Every firewall mutation happens while holding the `tables` lock. iptables
/// has no transactions, so the check-then-act sequences below are only safe
/// because nothing else runs between the check and the act.
pub struct Engine {
    executor: Arc<dyn FirewallExecutor>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    tables: Mutex<Tables>,
}

/// A stored rule line split into arguments, with the position of its verb
struct RuleCommand {
    args: Vec<String>,
    verb: usize,
}

impl RuleCommand {
    fn parse(line: &str) -> Result<Self> {
        let args = split_args(line);
        let verb = args
            .iter()
            .position(|a| a == "-A" || a == "-I")
            .ok_or_else(|| Error::invalid(format!("rule has no -A/-I chain: {}", line)))?;
        if verb + 1 >= args.len() {
            return Err(Error::invalid(format!("rule has no chain: {}", line)));
        }
        Ok(Self { args, verb })
    }

    /// Same rule with the verb replaced, e.g. `-C` to check or `-D` to delete
    fn with_verb(&self, verb: &str) -> Vec<String> {
        let mut args = self.args.clone();
        // `-I <chain> <pos>` carries a position only the insert understands
        if args[self.verb] == "-I"
            && verb != "-I"
            && args
                .get(self.verb + 2)
                .is_some_and(|p| p.parse::<u32>().is_ok())
        {
            args.remove(self.verb + 2);
        }
        args[self.verb] = verb.to_string();
        args
    }
}

fn table_args(table: TableName, rest: &[&str]) -> Vec<String> {
    let mut args = vec!["-t".to_string(), table.to_string()];
    args.extend(rest.iter().map(|a| a.to_string()));
    args
}

/// Chain a custom chain is linked from: root parents by their iptables name
fn physical_parent(parent: &str) -> String {
    if Chain::is_root(parent) {
        parent.to_uppercase()
    } else {
        parent.to_string()
    }
}

impl Engine {
    pub fn new(
        executor: Arc<dyn FirewallExecutor>,
        registry: Arc<Registry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.set_rule_sets(registry.len());
        metrics.set_epoch(registry.epoch());
        Self {
            executor,
            registry,
            metrics,
            tables: Mutex::new(Tables::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Snapshot of the chain model
    pub async fn tables(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    pub async fn validate_chain(
        &self,
        table: &str,
        chain: &str,
        must_exist: bool,
        allow_root: bool,
    ) -> Result<TableName> {
        self.tables
            .lock()
            .await
            .validate_chain(table, chain, must_exist, allow_root)
    }

    pub async fn default_chain(&self, table: TableName, chain: &str) -> String {
        self.tables.lock().await.default_chain(table, chain)
    }

    async fn succeeds(&self, args: Vec<String>) -> Result<bool> {
        Ok(self.executor.run(&args).await?.success)
    }

    async fn must(&self, args: Vec<String>) -> Result<()> {
        let output = self.executor.run(&args).await?;
        if output.success {
            Ok(())
        } else {
            Err(Error::command(format!(
                "iptables {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )))
        }
    }

    /// Create a custom chain and link it from its parent.
    ///
    /// Both steps are skipped when already present on the host, so a restart
    /// over an existing firewall state succeeds.
    pub async fn create_chain(&self, table: TableName, chain: &Chain) -> Result<()> {
        let mut tables = self.tables.lock().await;

        let parent = chain.parent.to_lowercase();
        tables.validate_chain(table.as_str(), &parent, true, true)?;
        tables.validate_chain(table.as_str(), &chain.name, false, false)?;

        let root = Chain::root_of(&chain.name);
        if root != Chain::root_of(&parent) {
            return Err(Error::invalid(format!(
                "chain ({}) cannot be linked from parent ({})",
                chain.name, chain.parent
            )));
        }

        if chain.default {
            if let Some(existing) = tables.default_custom_chain(table, root) {
                return Err(Error::conflict(format!(
                    "chain ({}) is already the default for ({}) in table ({})",
                    existing, root, table
                )));
            }
        }

        let link = physical_parent(&parent);

        if !self.succeeds(table_args(table, &["-L", &chain.name])).await? {
            self.must(table_args(table, &["-N", &chain.name])).await?;
        }

        if !self
            .succeeds(table_args(table, &["-C", &link, "-j", &chain.name]))
            .await?
        {
            let verb = if chain.insert { "-I" } else { "-A" };
            self.must(table_args(table, &[verb, &link, "-j", &chain.name]))
                .await?;
        }

        tables.register(
            table,
            Chain {
                name: chain.name.clone(),
                parent,
                insert: chain.insert,
                default: chain.default,
            },
        );

        info!(
            "Created chain {} in table {} (parent {}, default {})",
            chain.name, table, link, chain.default
        );
        Ok(())
    }

    /// Unlink, flush and delete a custom chain. Chains linked from it are
    /// left in place.
    pub async fn delete_chain(&self, table: TableName, name: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.delete_chain_locked(&mut tables, table, name).await
    }

    async fn delete_chain_locked(
        &self,
        tables: &mut Tables,
        table: TableName,
        name: &str,
    ) -> Result<()> {
        let chain = tables.find_chain(table, name).cloned().ok_or_else(|| {
            Error::not_found(format!("unable to find chain ({}) in table ({})", name, table))
        })?;
        let link = physical_parent(&chain.parent);

        if self
            .succeeds(table_args(table, &["-C", &link, "-j", name]))
            .await?
        {
            self.must(table_args(table, &["-D", &link, "-j", name]))
                .await?;
        }

        if self.succeeds(table_args(table, &["-L", name])).await? {
            self.must(table_args(table, &["-F", name])).await?;
            self.must(table_args(table, &["-X", name])).await?;
        }

        tables.unregister(table, name);
        info!("Deleted chain {} from table {}", name, table);
        Ok(())
    }

    /// Delete every managed chain, children before parents
    pub async fn purge_chains(&self) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let mut first_error = None;

        for table in TableName::ALL {
            let names: Vec<String> = tables
                .table(table)
                .custom_chains
                .iter()
                .rev()
                .map(|c| c.name.clone())
                .collect();

            for name in names {
                if let Err(e) = self.delete_chain_locked(&mut tables, table, &name).await {
                    warn!("Failed to purge chain {} from table {}: {}", name, table, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        tables.reset_defaults();
        first_error.map_or(Ok(()), Err)
    }

    pub async fn build_rule(&self, rule: &Rule, comment: &str) -> Result<String> {
        rule::build_rule(&*self.tables.lock().await, rule, comment)
    }

    pub async fn sanitize_rules(&self, text: &str, rewrite: bool) -> Result<Vec<String>> {
        rule::sanitize_rules(&*self.tables.lock().await, text, rewrite)
    }

    /// Apply one line unless already present; true if the firewall changed
    async fn add_line(&self, line: &str) -> Result<bool> {
        let cmd = RuleCommand::parse(line)?;
        if self.succeeds(cmd.with_verb("-C")).await? {
            return Ok(false);
        }
        self.must(cmd.args.clone()).await?;
        Ok(true)
    }

    /// Remove one line if present; true if the firewall changed
    async fn remove_line(&self, line: &str) -> Result<bool> {
        let cmd = RuleCommand::parse(line)?;
        if !self.succeeds(cmd.with_verb("-C")).await? {
            return Ok(false);
        }
        self.must(cmd.with_verb("-D")).await?;
        Ok(true)
    }

    /// Apply (`add`) or remove every line. On failure the lines changed by
    /// this call are reverted before the error is returned. Returns the
    /// changed lines.
    async fn apply_all(&self, lines: &[String], add: bool, op: &str) -> Result<Vec<String>> {
        let mut changed = Vec::new();

        for line in lines {
            let result = if add {
                self.add_line(line).await
            } else {
                self.remove_line(line).await
            };

            match result {
                Ok(true) => changed.push(line.clone()),
                Ok(false) => {}
                Err(e) => {
                    self.revert(&changed, add, op).await;
                    return Err(e);
                }
            }
        }

        Ok(changed)
    }

    async fn revert(&self, changed: &[String], added: bool, op: &str) {
        if changed.is_empty() {
            return;
        }
        self.metrics.record_rollback(op);
        warn!("Rolling back {} rule(s) after failed {}", changed.len(), op);

        if added {
            for line in changed.iter().rev() {
                if let Err(e) = self.remove_line(line).await {
                    error!("Rollback failed to remove rule '{}': {}", line, e);
                }
            }
        } else {
            // restore in original order
            for line in changed {
                if let Err(e) = self.add_line(line).await {
                    error!("Rollback failed to restore rule '{}': {}", line, e);
                }
            }
        }
    }

    /// Apply rule lines, skipping any already present. No registry record.
    pub async fn create_rules(&self, lines: &[String]) -> Result<()> {
        let _tables = self.tables.lock().await;
        for line in lines {
            self.add_line(line).await?;
        }
        Ok(())
    }

    /// Remove rule lines, skipping any not present. No registry record.
    pub async fn delete_rules(&self, lines: &[String]) -> Result<()> {
        let _tables = self.tables.lock().await;
        for line in lines {
            self.remove_line(line).await?;
        }
        Ok(())
    }

    fn record(&self, op: &str, success: bool) {
        self.metrics.record_rule_set_op(op, success);
        self.metrics.set_rule_sets(self.registry.len());
        self.metrics.set_epoch(self.registry.epoch());
    }

    /// Build and apply a rule set under a freshly generated id
    pub async fn submit_rule_set(&self, rules: &[Rule]) -> Result<(String, i64)> {
        if rules.is_empty() {
            return Err(Error::invalid("rule set contains no rules"));
        }

        let tables = self.tables.lock().await;
        let (id, epoch) = self.registry.generate_name();

        let result: Result<()> = async {
            let lines = rules
                .iter()
                .map(|r| rule::build_rule(&tables, r, &id))
                .collect::<Result<Vec<_>>>()?;
            self.create_rule_set_locked(&tables, &id, &lines.join("\n"), epoch)
                .await
        }
        .await;

        self.record("create", result.is_ok());
        result.map(|_| (id, epoch))
    }

    /// Apply a rule set under a given id and epoch and record it.
    ///
    /// An id that is already registered is left untouched.
    pub async fn create_rule_set(&self, id: &str, text: &str, epoch: i64) -> Result<()> {
        let tables = self.tables.lock().await;
        let result = self.create_rule_set_locked(&tables, id, text, epoch).await;
        self.record("create", result.is_ok());
        result
    }

    async fn create_rule_set_locked(
        &self,
        tables: &Tables,
        id: &str,
        text: &str,
        epoch: i64,
    ) -> Result<()> {
        validate_id(id)?;
        if self.registry.contains(id) {
            info!("Rule set {} already present", id);
            return Ok(());
        }

        let lines = rule::sanitize_rules(tables, text, false)?;
        let applied = self.apply_all(&lines, true, "create").await?;

        if let Err(e) = self.registry.append(id, text, epoch) {
            self.revert(&applied, true, "create").await;
            return Err(e);
        }

        info!("Created rule set {} ({} rules, epoch {})", id, lines.len(), epoch);
        Ok(())
    }

    /// Remove a rule set's rules and its registry record.
    ///
    /// Returns false when the id is not registered.
    pub async fn delete_rule_set(&self, id: &str, epoch: i64) -> Result<bool> {
        validate_id(id)?;
        let _tables = self.tables.lock().await;

        let Some(entry) = self.registry.get(id) else {
            return Ok(false);
        };

        let result: Result<()> = async {
            let lines: Vec<String> = rule_lines(&entry.rule).map(String::from).collect();
            let removed = self.apply_all(&lines, false, "delete").await?;

            if let Err(e) = self.registry.delete(id, epoch) {
                self.revert(&removed, false, "delete").await;
                return Err(e);
            }
            Ok(())
        }
        .await;

        self.record("delete", result.is_ok());
        result?;

        info!("Deleted rule set {} (epoch {})", id, self.registry.epoch());
        Ok(true)
    }

    /// Delete a rule set under a fresh local epoch; returns that epoch when
    /// something was deleted
    pub async fn remove_rule_set(&self, id: &str) -> Result<Option<i64>> {
        let epoch = self.registry.tick();
        Ok(self.delete_rule_set(id, epoch).await?.then_some(epoch))
    }

    /// Re-apply every registered rule set; returns how many applied cleanly
    pub async fn restore_registry(&self) -> Result<usize> {
        let tables = self.tables.lock().await;
        let mut restored = 0;

        for id in self.registry.list() {
            let Some(entry) = self.registry.get(&id) else {
                continue;
            };

            let result = match rule::sanitize_rules(&tables, &entry.rule, false) {
                Ok(lines) => self.apply_all(&lines, true, "restore").await,
                Err(e) => Err(e),
            };

            match result {
                Ok(_) => restored += 1,
                Err(e) => warn!("Failed to restore rule set {}: {}", id, e),
            }
        }

        self.metrics.set_rule_sets(self.registry.len());
        self.metrics.set_epoch(self.registry.epoch());
        info!("Restored {} of {} rule set(s)", restored, self.registry.len());
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFirewall;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        fw: Arc<MemoryFirewall>,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let fw = Arc::new(MemoryFirewall::new());
        let registry = Arc::new(Registry::open(dir.path()).unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        let engine = Engine::new(fw.clone(), registry, metrics);
        Fixture {
            _dir: dir,
            fw,
            engine,
        }
    }

    fn accept_port(port: &str) -> Rule {
        Rule {
            table: "filter".into(),
            chain: "input".into(),
            action: "accept".into(),
            protocol: "tcp".into(),
            destination_ports: port.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_applies_and_records() {
        let f = fixture();
        let (id, epoch) = f
            .engine
            .submit_rule_set(&[accept_port("22"), accept_port("80")])
            .await
            .unwrap();

        assert_eq!(f.fw.rule_count(), 2);
        let entry = f.engine.registry().get(&id).unwrap();
        assert_eq!(entry.epoch, epoch);
        assert_eq!(entry.rule.lines().count(), 2);
        assert!(f.fw.rules("filter", "INPUT")[0].contains(&id));
    }

    #[tokio::test]
    async fn empty_rule_set_is_invalid() {
        let f = fixture();
        assert!(matches!(
            f.engine.submit_rule_set(&[]).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(f.fw.commands().is_empty());
    }

    #[tokio::test]
    async fn invalid_rule_never_touches_the_firewall() {
        let f = fixture();
        let mut bad = accept_port("22");
        bad.source_interface = "eth0;reboot".into();

        assert!(f.engine.submit_rule_set(&[accept_port("80"), bad]).await.is_err());
        assert!(f.fw.commands().is_empty());
        assert!(f.engine.registry().is_empty());
    }

    #[tokio::test]
    async fn failed_rule_rolls_back_earlier_rules() {
        let f = fixture();
        f.fw.fail_when("--dport 443");

        let err = f
            .engine
            .submit_rule_set(&[accept_port("22"), accept_port("80"), accept_port("443")])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExternalCommandFailed(_)));
        assert_eq!(f.fw.rule_count(), 0);
        assert!(f.engine.registry().is_empty());
    }

    #[tokio::test]
    async fn rollback_keeps_rules_that_were_already_present() {
        let f = fixture();
        let keep = "-t filter -A INPUT -p tcp --dport 22 -j ACCEPT".to_string();
        f.engine.create_rules(&[keep.clone()]).await.unwrap();
        f.fw.fail_when("--dport 25");

        let text = format!("{}\n-t filter -A INPUT -p tcp --dport 25 -j ACCEPT", keep);
        assert!(f.engine.create_rule_set("5+abc", &text, 5).await.is_err());

        assert_eq!(f.fw.rules("filter", "INPUT"), vec!["-p tcp --dport 22 -j ACCEPT"]);
        assert!(!f.engine.registry().contains("5+abc"));
    }

    #[tokio::test]
    async fn create_rules_is_idempotent() {
        let f = fixture();
        let lines = vec![
            "-t filter -A INPUT -p tcp --dport 22 -j ACCEPT".to_string(),
            "-t nat -A POSTROUTING -o eth0 -j MASQUERADE".to_string(),
        ];

        f.engine.create_rules(&lines).await.unwrap();
        f.engine.create_rules(&lines).await.unwrap();
        assert_eq!(f.fw.rule_count(), 2);

        f.engine.delete_rules(&lines).await.unwrap();
        f.engine.delete_rules(&lines).await.unwrap();
        assert_eq!(f.fw.rule_count(), 0);
    }

    #[tokio::test]
    async fn create_rule_set_with_known_id_is_a_noop() {
        let f = fixture();
        let text = "-t filter -A INPUT -p udp --dport 53 -j ACCEPT";
        f.engine.create_rule_set("100+aaaa", text, 100).await.unwrap();
        let before = f.fw.commands().len();

        f.engine.create_rule_set("100+aaaa", text, 200).await.unwrap();
        assert_eq!(f.fw.commands().len(), before);
        assert_eq!(f.engine.registry().epoch(), 100);
    }

    #[tokio::test]
    async fn create_rule_set_rejects_bad_ids_and_chains() {
        let f = fixture();
        assert!(matches!(
            f.engine.create_rule_set("../etc", "-A INPUT -j DROP", 1).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            f.engine
                .create_rule_set("1+abc", "-t filter -A ghost-input -j DROP", 1)
                .await,
            Err(Error::NotFound(_))
        ));
        assert!(f.fw.commands().is_empty());
    }

    #[tokio::test]
    async fn delete_rule_set_removes_rules_and_entry() {
        let f = fixture();
        let (id, _) = f.engine.submit_rule_set(&[accept_port("22")]).await.unwrap();

        let epoch = f.engine.remove_rule_set(&id).await.unwrap();
        assert!(epoch.is_some());
        assert_eq!(f.fw.rule_count(), 0);
        assert!(!f.engine.registry().contains(&id));
        assert_eq!(f.engine.registry().epoch(), epoch.unwrap());
    }

    #[tokio::test]
    async fn deleting_unknown_rule_set_is_a_noop() {
        let f = fixture();
        f.engine.create_rule_set("10+abc", "-A INPUT -j DROP", 10).await.unwrap();
        let epoch = f.engine.registry().epoch();

        assert!(!f.engine.delete_rule_set("999+zzz", 5000).await.unwrap());
        assert_eq!(f.engine.remove_rule_set("999+zzz").await.unwrap(), None);
        assert_eq!(f.engine.registry().epoch(), epoch);
        assert_eq!(f.fw.rule_count(), 1);
    }

    #[tokio::test]
    async fn failed_delete_restores_removed_rules() {
        let f = fixture();
        let text = "-t filter -A INPUT -p tcp --dport 22 -j ACCEPT\n-t filter -A INPUT -p tcp --dport 80 -j ACCEPT";
        f.engine.create_rule_set("7+abc", text, 7).await.unwrap();

        f.fw.fail_when("-D INPUT -p tcp --dport 80");
        assert!(f.engine.delete_rule_set("7+abc", 8).await.is_err());
        assert_eq!(f.fw.rule_count(), 2);
        assert!(f.engine.registry().contains("7+abc"));
    }

    #[tokio::test]
    async fn chain_hierarchy() {
        let f = fixture();
        let t = TableName::Filter;
        f.engine
            .create_chain(t, &Chain::new("iptmgr-input", "INPUT").as_default())
            .await
            .unwrap();
        f.engine
            .create_chain(t, &Chain::new("web-input", "iptmgr-input").inserted())
            .await
            .unwrap();

        assert!(f.fw.has_chain("filter", "web-input"));
        assert_eq!(f.fw.rules("filter", "INPUT"), vec!["-j iptmgr-input"]);
        assert_eq!(f.fw.rules("filter", "iptmgr-input"), vec!["-j web-input"]);
        assert_eq!(f.engine.default_chain(t, "input").await, "iptmgr-input");

        // suffix must match the parent's root
        assert!(matches!(
            f.engine
                .create_chain(t, &Chain::new("web-output", "iptmgr-input"))
                .await,
            Err(Error::InvalidArgument(_))
        ));
        // parent must exist
        assert!(matches!(
            f.engine.create_chain(t, &Chain::new("x-input", "y-input")).await,
            Err(Error::NotFound(_))
        ));
        // one default per root
        assert!(matches!(
            f.engine
                .create_chain(t, &Chain::new("other-input", "INPUT").as_default())
                .await,
            Err(Error::Conflict(_))
        ));
        assert!(!f.fw.has_chain("filter", "other-input"));
    }

    #[tokio::test]
    async fn failed_link_leaves_chain_unregistered() {
        let f = fixture();
        f.fw.fail_when("-A FORWARD -j iptmgr-forward");
        assert!(f
            .engine
            .create_chain(TableName::Filter, &Chain::new("iptmgr-forward", "forward").as_default())
            .await
            .is_err());
        assert!(f.engine.tables().await.filter.custom_chains.is_empty());
        assert_eq!(f.engine.default_chain(TableName::Filter, "forward").await, "FORWARD");
    }

    #[tokio::test]
    async fn rules_follow_the_default_chain() {
        let f = fixture();
        f.engine
            .create_chain(TableName::Filter, &Chain::new("iptmgr-input", "input").as_default())
            .await
            .unwrap();
        f.engine.submit_rule_set(&[accept_port("22")]).await.unwrap();
        assert_eq!(f.fw.rules("filter", "iptmgr-input").len(), 1);
        assert!(f.fw.rules("filter", "INPUT").iter().all(|r| r == "-j iptmgr-input"));
    }

    #[tokio::test]
    async fn delete_and_purge_chains() {
        let f = fixture();
        f.engine
            .create_chain(TableName::Filter, &Chain::new("iptmgr-input", "INPUT").as_default())
            .await
            .unwrap();
        f.engine
            .create_chain(TableName::Filter, &Chain::new("web-input", "iptmgr-input"))
            .await
            .unwrap();
        f.engine
            .create_chain(TableName::Nat, &Chain::new("iptmgr-postrouting", "POSTROUTING").as_default())
            .await
            .unwrap();

        f.engine.delete_chain(TableName::Nat, "iptmgr-postrouting").await.unwrap();
        assert!(!f.fw.has_chain("nat", "iptmgr-postrouting"));
        assert_eq!(f.engine.default_chain(TableName::Nat, "postrouting").await, "POSTROUTING");
        assert!(matches!(
            f.engine.delete_chain(TableName::Nat, "iptmgr-postrouting").await,
            Err(Error::NotFound(_))
        ));

        f.engine.purge_chains().await.unwrap();
        assert!(!f.fw.has_chain("filter", "web-input"));
        assert!(!f.fw.has_chain("filter", "iptmgr-input"));
        assert!(f.fw.rules("filter", "INPUT").is_empty());
        assert_eq!(f.engine.default_chain(TableName::Filter, "input").await, "INPUT");
    }

    #[tokio::test]
    async fn restore_reapplies_registered_sets() {
        let dir = TempDir::new().unwrap();
        {
            let registry = Registry::open(dir.path()).unwrap();
            registry
                .append("42+abc", "-t filter -A INPUT -p tcp --dport 22 -j ACCEPT", 42)
                .unwrap();
            registry
                .append("43+abc", "-t filter -A ghost-input -j DROP", 43)
                .unwrap();
        }

        let fw = Arc::new(MemoryFirewall::new());
        let registry = Arc::new(Registry::open(dir.path()).unwrap());
        let engine = Engine::new(fw.clone(), registry, Arc::new(Metrics::new().unwrap()));

        assert_eq!(engine.restore_registry().await.unwrap(), 1);
        assert_eq!(fw.rules("filter", "INPUT"), vec!["-p tcp --dport 22 -j ACCEPT"]);
        assert_eq!(engine.restore_registry().await.unwrap(), 1);
        assert_eq!(fw.rule_count(), 1);
    }
}
