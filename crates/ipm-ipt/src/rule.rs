use crate::patterns;
use crate::table::Tables;
use ipm_core::{Chain, Error, Result, Rule, TableName};
use ipnet::Ipv4Net;
use std::fmt::Write;
use std::net::Ipv4Addr;
use std::ops::Range;

/// Turn a structured rule into a single iptables command line.
///
/// Every field is checked against a whitelist pattern before it is embedded.
/// The logical chain is resolved through the table's default chains, so
/// `input` lands in whichever chain is currently marked default for it.
pub fn build_rule(tables: &Tables, rule: &Rule, comment: &str) -> Result<String> {
    let mut cmd = String::new();

    // Table
    let table = rule.table.to_lowercase();
    patterns::check(&patterns::TABLE, &table, "table")?;

    // Chain
    let logical = rule.chain.to_lowercase();
    let table = tables.validate_chain(&table, &logical, true, true)?;
    let chain = tables.default_chain(table, &logical);
    let _ = write!(cmd, "-t {} -A {}", table, chain);

    if !rule.source_interface.is_empty() {
        patterns::check(&patterns::INTERFACE, &rule.source_interface, "sourceInterface")?;
        let _ = write!(cmd, " -i {}", rule.source_interface);
    }

    if !rule.destination_interface.is_empty() {
        patterns::check(
            &patterns::INTERFACE,
            &rule.destination_interface,
            "destinationInterface",
        )?;
        let _ = write!(cmd, " -o {}", rule.destination_interface);
    }

    if !rule.source_subnet.is_empty() {
        check_subnet(&rule.source_subnet, "sourceSubnet")?;
        let _ = write!(cmd, " -s {}", rule.source_subnet);
    }

    if !rule.destination_subnet.is_empty() {
        check_subnet(&rule.destination_subnet, "destinationSubnet")?;
        let _ = write!(cmd, " -d {}", rule.destination_subnet);
    }

    // Ports
    let sports = port_selector(&rule.source_ports, "sourcePorts", "--sport")?;
    let dports = port_selector(&rule.destination_ports, "destinationPorts", "--dport")?;
    let multiport = [&rule.source_ports, &rule.destination_ports]
        .iter()
        .any(|p| p.contains(','));

    // Protocol
    let protocol = rule.protocol.to_lowercase();
    if !protocol.is_empty() {
        patterns::check(&patterns::PROTOCOL, &protocol, "protocol")?;
        let _ = write!(cmd, " -p {}", protocol);
        if multiport {
            cmd.push_str(" -m multiport");
        }
        if let Some(dports) = &dports {
            let _ = write!(cmd, " {}", dports);
        }
        if let Some(sports) = &sports {
            let _ = write!(cmd, " {}", sports);
        }
    } else if sports.is_some() || dports.is_some() {
        return Err(Error::invalid(
            "protocol must be specified when using port selectors",
        ));
    }

    if !comment.is_empty() {
        patterns::check(&patterns::COMMENT, comment, "comment")?;
        let _ = write!(cmd, " -m comment --comment \"{}\"", comment);
    }

    // Action, legal set depends on where the logical chain hooks in
    let action = rule.action.to_lowercase();
    let allowed = match Chain::root_of(&logical) {
        "prerouting" => &patterns::PREROUTING_ACTION,
        "postrouting" => &patterns::POSTROUTING_ACTION,
        _ => &patterns::FILTER_ACTION,
    };
    patterns::check(allowed, &action, "action")?;
    let _ = write!(cmd, " -j {}", action.to_uppercase());

    let nat = patterns::NAT_ACTION.is_match(&action);
    if !rule.nat_destination.is_empty() {
        if !nat {
            return Err(Error::invalid(format!(
                "action ({}) does not support use of nat destination",
                action
            )));
        }
        check_destination(&rule.nat_destination)?;
        let flag = if action == "snat" {
            "--to-source"
        } else {
            "--to-destination"
        };
        let _ = write!(cmd, " {} {}", flag, rule.nat_destination);
    } else if nat {
        return Err(Error::invalid(format!(
            "action ({}) requires use of nat destination",
            action
        )));
    }

    Ok(cmd)
}

fn invalid_value(value: &str, name: &str) -> Error {
    Error::invalid(format!("invalid value ({}) for argument ({})", value, name))
}

fn check_subnet(value: &str, name: &str) -> Result<()> {
    patterns::check(&patterns::SUBNET, value, name)?;
    value
        .parse::<Ipv4Net>()
        .map(|_| ())
        .map_err(|_| invalid_value(value, name))
}

fn check_destination(value: &str) -> Result<()> {
    let name = "natDestination";
    patterns::check(&patterns::DESTINATION, value, name)?;

    let (addr, port) = match value.split_once(':') {
        Some((addr, port)) => (addr, Some(port)),
        None => (value, None),
    };
    addr.parse::<Ipv4Addr>()
        .map_err(|_| invalid_value(value, name))?;
    if let Some(port) = port {
        port.parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| invalid_value(value, name))?;
    }
    Ok(())
}

/// `--dport 22` / `--dports 80,443`, or `None` when no ports are given
fn port_selector(value: &str, name: &str, flag: &str) -> Result<Option<String>> {
    if value.is_empty() {
        return Ok(None);
    }
    patterns::check(&patterns::PORTS, value, name)?;

    let in_range = value
        .split([',', ':'])
        .all(|p| p.parse::<u16>().is_ok());
    if !in_range {
        return Err(invalid_value(value, name));
    }

    if value.contains(',') {
        Ok(Some(format!("{}s {}", flag, value)))
    } else {
        Ok(Some(format!("{} {}", flag, value)))
    }
}

/// Non-empty, non-comment lines of a rule text
pub fn rule_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Table and chain addressed by a stored rule line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTarget {
    pub table: TableName,
    pub chain: String,
    /// byte range of the chain name within the line
    pub span: Range<usize>,
}

pub fn rule_target(line: &str) -> Result<RuleTarget> {
    let mut tables = patterns::RULE_TABLE
        .captures_iter(line)
        .filter_map(|c| c.get(1));
    let table = match (tables.next(), tables.next()) {
        (None, _) => TableName::Filter,
        (Some(table), None) => {
            patterns::check(&patterns::TABLE, table.as_str(), "table")?;
            table.as_str().parse::<TableName>()?
        }
        (Some(_), Some(_)) => {
            return Err(Error::invalid(format!("more than one table given: {}", line)));
        }
    };

    let chain = patterns::RULE_CHAIN
        .captures(line)
        .and_then(|c| c.get(1))
        .ok_or_else(|| Error::invalid(format!("unable to determine chain: {}", line)))?;

    Ok(RuleTarget {
        table,
        chain: chain.as_str().to_string(),
        span: chain.range(),
    })
}

/// Check that every line targets a known chain; with `rewrite`, replace root
/// chain names by the chain currently marked default for them.
pub fn sanitize_rules(tables: &Tables, text: &str, rewrite: bool) -> Result<Vec<String>> {
    let mut out = Vec::new();

    for line in rule_lines(text) {
        let target = rule_target(line)?;
        let chain = target.chain.to_lowercase();
        tables.validate_chain(target.table.as_str(), &chain, true, true)?;

        if rewrite {
            let physical = tables.default_chain(target.table, &chain);
            let mut rewritten = String::with_capacity(line.len() + physical.len());
            rewritten.push_str(&line[..target.span.start]);
            rewritten.push_str(&physical);
            rewritten.push_str(&line[target.span.end..]);
            out.push(rewritten);
        } else {
            out.push(line.to_string());
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(table: &str, chain: &str, action: &str) -> Rule {
        Rule {
            table: table.into(),
            chain: chain.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    fn count(cmd: &str, token: &str) -> usize {
        cmd.split_whitespace().filter(|t| *t == token).count()
    }

    #[test]
    fn ssh_accept_rule() {
        let tables = Tables::new();
        let mut r = rule("filter", "input", "accept");
        r.protocol = "tcp".into();
        r.destination_ports = "22".into();

        let cmd = build_rule(&tables, &r, "1700000000000+abcdefgh").unwrap();
        assert_eq!(
            cmd,
            "-t filter -A INPUT -p tcp --dport 22 -m comment --comment \"1700000000000+abcdefgh\" -j ACCEPT"
        );
        assert_eq!(count(&cmd, "-t"), 1);
        assert_eq!(count(&cmd, "-A"), 1);
        assert_eq!(count(&cmd, "-j"), 1);
        assert_eq!(build_rule(&tables, &r, "1700000000000+abcdefgh").unwrap(), cmd);
    }

    #[test]
    fn every_field_is_rendered() {
        let tables = Tables::new();
        let r = Rule {
            table: "NAT".into(),
            chain: "PREROUTING".into(),
            action: "DNAT".into(),
            protocol: "udp".into(),
            source_interface: "eth0".into(),
            destination_interface: "br0.10".into(),
            source_subnet: "10.0.0.0/8".into(),
            destination_subnet: "192.168.1.10/32".into(),
            source_ports: "1024:65535".into(),
            destination_ports: "53,5353".into(),
            nat_destination: "10.1.2.3:53".into(),
        };

        let cmd = build_rule(&tables, &r, "").unwrap();
        assert_eq!(
            cmd,
            "-t nat -A PREROUTING -i eth0 -o br0.10 -s 10.0.0.0/8 -d 192.168.1.10/32 \
             -p udp -m multiport --dports 53,5353 --sport 1024:65535 -j DNAT --to-destination 10.1.2.3:53"
        );
    }

    #[test]
    fn logical_chain_resolves_through_default() {
        let mut tables = Tables::new();
        tables.register(
            TableName::Filter,
            Chain::new("iptmgr-input", "INPUT").as_default(),
        );

        let cmd = build_rule(&tables, &rule("filter", "input", "drop"), "").unwrap();
        assert_eq!(cmd, "-t filter -A iptmgr-input -j DROP");
    }

    #[test]
    fn action_depends_on_chain_position() {
        let tables = Tables::new();
        assert!(build_rule(&tables, &rule("nat", "postrouting", "masquerade"), "").is_ok());
        assert!(build_rule(&tables, &rule("nat", "prerouting", "masquerade"), "").is_err());
        assert!(build_rule(&tables, &rule("filter", "forward", "masquerade"), "").is_err());
        assert!(build_rule(&tables, &rule("filter", "forward", "reject"), "").is_err());
        assert!(build_rule(&tables, &rule("nat", "output", "accept"), "").is_ok());
    }

    #[test]
    fn nat_destination_pairs_with_nat_actions() {
        let tables = Tables::new();

        let mut snat = rule("nat", "postrouting", "snat");
        assert!(matches!(
            build_rule(&tables, &snat, ""),
            Err(Error::InvalidArgument(_))
        ));
        snat.nat_destination = "203.0.113.7".into();
        assert!(build_rule(&tables, &snat, "").unwrap().ends_with("-j SNAT --to-source 203.0.113.7"));

        for action in ["accept", "drop", "masquerade"] {
            let mut r = rule("nat", "postrouting", action);
            r.nat_destination = "203.0.113.7".into();
            assert!(matches!(
                build_rule(&tables, &r, ""),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn ports_require_protocol() {
        let tables = Tables::new();
        let mut r = rule("filter", "input", "accept");
        r.source_ports = "53".into();
        let err = build_rule(&tables, &r, "").unwrap_err();
        assert!(err.to_string().contains("protocol must be specified"));
    }

    #[test]
    fn injection_attempts_are_rejected() {
        let tables = Tables::new();
        let mut r = rule("filter", "input", "accept");
        r.source_interface = "eth0; reboot".into();
        assert!(build_rule(&tables, &r, "").is_err());

        let mut r = rule("filter", "input", "accept");
        r.source_subnet = "999.0.0.1/8".into();
        assert!(build_rule(&tables, &r, "").is_err());

        let mut r = rule("filter", "input", "accept");
        r.protocol = "tcp".into();
        r.destination_ports = "70000".into();
        assert!(build_rule(&tables, &r, "").is_err());

        assert!(build_rule(&tables, &rule("filter", "input", "accept"), "\" -j DROP").is_err());
    }

    #[test]
    fn unknown_custom_chain_is_not_found() {
        let tables = Tables::new();
        assert!(matches!(
            build_rule(&tables, &rule("filter", "missing-input", "accept"), ""),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn rule_target_reads_table_and_chain() {
        let target = rule_target("-t nat -A POSTROUTING -o eth0 -j MASQUERADE").unwrap();
        assert_eq!(target.table, TableName::Nat);
        assert_eq!(target.chain, "POSTROUTING");

        let target = rule_target("-I INPUT -p tcp --dport 22 -j ACCEPT").unwrap();
        assert_eq!(target.table, TableName::Filter);
        assert_eq!(target.chain, "INPUT");

        assert!(rule_target("-t filter -j ACCEPT").is_err());
    }

    #[test]
    fn rule_target_rejects_unmanaged_tables() {
        let target = rule_target("--table filter -A FORWARD -j DROP").unwrap();
        assert_eq!(target.table, TableName::Filter);

        for line in [
            "-t mangle -A INPUT -j DROP",
            "-t raw -A PREROUTING -j NOTRACK",
            "-t NAT -A POSTROUTING -j MASQUERADE",
            "-t nat -t mangle -A INPUT -j DROP",
        ] {
            assert!(
                matches!(rule_target(line), Err(Error::InvalidArgument(_))),
                "{}",
                line
            );
        }

        let tables = Tables::new();
        assert!(sanitize_rules(&tables, "-t mangle -A INPUT -j DROP\n", false).is_err());
    }

    #[test]
    fn sanitize_rewrites_root_chains() {
        let mut tables = Tables::new();
        tables.register(
            TableName::Filter,
            Chain::new("iptmgr-input", "INPUT").as_default(),
        );

        let text = "# static rules\n\n-A INPUT -p tcp --dport 22 -j ACCEPT\n-t nat -A POSTROUTING -j MASQUERADE\n";
        let lines = sanitize_rules(&tables, text, true).unwrap();
        assert_eq!(
            lines,
            vec![
                "-A iptmgr-input -p tcp --dport 22 -j ACCEPT",
                "-t nat -A POSTROUTING -j MASQUERADE",
            ]
        );

        let untouched = sanitize_rules(&tables, text, false).unwrap();
        assert_eq!(untouched[0], "-A INPUT -p tcp --dport 22 -j ACCEPT");
    }

    #[test]
    fn sanitize_rejects_unknown_chains() {
        let tables = Tables::new();
        assert!(sanitize_rules(&tables, "-A ghost-input -j DROP", false).is_err());
        assert!(sanitize_rules(&tables, "-t nat -A FORWARD -j DROP", false).is_err());
    }
}
