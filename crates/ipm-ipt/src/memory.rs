use crate::executor::{CommandOutput, FirewallExecutor};
use async_trait::async_trait;
use ipm_core::Result;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

const BUILTIN_TARGETS: &[&str] = &[
    "ACCEPT",
    "DROP",
    "REJECT",
    "RETURN",
    "LOG",
    "SNAT",
    "DNAT",
    "MASQUERADE",
];

/// In-memory stand-in for iptables.
///
/// Understands `-t <table>` with `-L`, `-N`, `-X`, `-F`, `-C`, `-A`, `-I`
/// and `-D`, and refuses the same things iptables refuses (duplicate chain,
/// deleting a referenced or non-empty chain, deleting a missing rule).
pub struct MemoryFirewall {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    // table -> chain -> rule specs in order
    tables: HashMap<String, Vec<(String, Vec<String>)>>,
    commands: Vec<String>,
    fail_when: Vec<String>,
}

struct Parsed {
    table: String,
    command: String,
    chain: String,
    spec: String,
}

impl State {
    fn chains(&mut self, table: &str) -> &mut Vec<(String, Vec<String>)> {
        self.tables.entry(table.to_string()).or_default()
    }

    fn chain_rules(&mut self, table: &str, chain: &str) -> Option<&mut Vec<String>> {
        self.chains(table)
            .iter_mut()
            .find(|(name, _)| name == chain)
            .map(|(_, rules)| rules)
    }

    fn is_referenced(&self, table: &str, chain: &str) -> bool {
        self.tables.get(table).is_some_and(|chains| {
            chains
                .iter()
                .flat_map(|(_, rules)| rules.iter())
                .any(|r| jump_target(r) == Some(chain))
        })
    }
}

fn parse(args: &[String]) -> Option<Parsed> {
    let mut table = "filter".to_string();
    let mut command = None;
    let mut chain = None;
    let mut spec = Vec::new();

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-w" => {}
            "-t" => table = iter.next()?.clone(),
            "-L" | "-N" | "-X" | "-F" | "-C" | "-A" | "-I" | "-D" if command.is_none() => {
                command = Some(arg.clone());
                chain = Some(iter.next()?.clone());
                if arg == "-I" {
                    // optional rule position
                    if iter.peek().is_some_and(|p| p.parse::<u32>().is_ok()) {
                        iter.next();
                    }
                }
            }
            _ => spec.push(arg.clone()),
        }
    }

    Some(Parsed {
        table,
        command: command?,
        chain: chain?,
        spec: spec.join(" "),
    })
}

impl MemoryFirewall {
    /// Firewall with the builtin chains of the filter and nat tables
    pub fn new() -> Self {
        let mut state = State::default();
        for chain in ["INPUT", "OUTPUT", "FORWARD"] {
            state.chains("filter").push((chain.to_string(), vec![]));
        }
        for chain in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
            state.chains("nat").push((chain.to_string(), vec![]));
        }
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every mutating command containing `pattern` fail
    pub fn fail_when(&self, pattern: &str) {
        self.lock().fail_when.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().fail_when.clear();
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.lock().chain_rules(table, chain).is_some()
    }

    /// Rule specs of a chain, without the `-t`/`-A` prefix
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.lock()
            .chain_rules(table, chain)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Total number of rules across all tables and chains
    pub fn rule_count(&self) -> usize {
        self.lock()
            .tables
            .values()
            .flat_map(|chains| chains.iter())
            .map(|(_, rules)| rules.len())
            .sum()
    }

    /// Every command received, joined by spaces
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    fn execute(&self, args: &[String]) -> CommandOutput {
        let mut state = self.lock();
        let line = args.join(" ");
        state.commands.push(line.clone());

        let Some(p) = parse(args) else {
            return CommandOutput::failed(format!("bad command: {}", line));
        };

        let mutating = !matches!(p.command.as_str(), "-L" | "-C");
        if mutating && state.fail_when.iter().any(|f| line.contains(f.as_str())) {
            return CommandOutput::failed(format!("injected failure: {}", line));
        }

        match p.command.as_str() {
            "-L" => match state.chain_rules(&p.table, &p.chain) {
                Some(rules) => CommandOutput {
                    success: true,
                    stdout: rules.join("\n"),
                    stderr: String::new(),
                },
                None => CommandOutput::failed("No chain/target/match by that name."),
            },
            "-N" => {
                if state.chain_rules(&p.table, &p.chain).is_some() {
                    return CommandOutput::failed("Chain already exists.");
                }
                state.chains(&p.table).push((p.chain, vec![]));
                CommandOutput::ok()
            }
            "-X" => {
                let Some(rules) = state.chain_rules(&p.table, &p.chain) else {
                    return CommandOutput::failed("No chain/target/match by that name.");
                };
                if !rules.is_empty() {
                    return CommandOutput::failed("Directory not empty.");
                }
                if state.is_referenced(&p.table, &p.chain) {
                    return CommandOutput::failed("Too many links.");
                }
                state.chains(&p.table).retain(|(name, _)| *name != p.chain);
                CommandOutput::ok()
            }
            "-F" => match state.chain_rules(&p.table, &p.chain) {
                Some(rules) => {
                    rules.clear();
                    CommandOutput::ok()
                }
                None => CommandOutput::failed("No chain/target/match by that name."),
            },
            "-C" => match state.chain_rules(&p.table, &p.chain) {
                Some(rules) if rules.contains(&p.spec) => CommandOutput::ok(),
                Some(_) => CommandOutput::failed("Bad rule (does a matching rule exist in that chain?)."),
                None => CommandOutput::failed("No chain/target/match by that name."),
            },
            "-A" | "-I" => {
                if let Some(target) = jump_target(&p.spec) {
                    if !BUILTIN_TARGETS.contains(&target)
                        && state.chain_rules(&p.table, target).is_none()
                    {
                        return CommandOutput::failed("Couldn't load target.");
                    }
                }
                let insert = p.command == "-I";
                match state.chain_rules(&p.table, &p.chain) {
                    Some(rules) if insert => {
                        rules.insert(0, p.spec);
                        CommandOutput::ok()
                    }
                    Some(rules) => {
                        rules.push(p.spec);
                        CommandOutput::ok()
                    }
                    None => CommandOutput::failed("No chain/target/match by that name."),
                }
            }
            "-D" => match state.chain_rules(&p.table, &p.chain) {
                Some(rules) => match rules.iter().position(|r| *r == p.spec) {
                    Some(idx) => {
                        rules.remove(idx);
                        CommandOutput::ok()
                    }
                    None => CommandOutput::failed("Bad rule (does a matching rule exist in that chain?)."),
                },
                None => CommandOutput::failed("No chain/target/match by that name."),
            },
            _ => CommandOutput::failed(format!("unsupported command: {}", line)),
        }
    }
}

fn jump_target(spec: &str) -> Option<&str> {
    let mut words = spec.split_whitespace();
    while let Some(w) = words.next() {
        if w == "-j" {
            return words.next();
        }
    }
    None
}

impl Default for MemoryFirewall {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirewallExecutor for MemoryFirewall {
    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        Ok(self.execute(args))
    }
}
