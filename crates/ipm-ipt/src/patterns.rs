//! Whitelist patterns for every value embedded into an iptables command line.
//!
//! Field patterns are anchored: a value must match in full.

use ipm_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Compile a constant pattern; failure is a bug in this module
macro_rules! static_regex {
    ($pattern:expr, $name:expr) => {
        Regex::new($pattern)
            .unwrap_or_else(|_| panic!("static regex '{}' failed to compile", $name))
    };
}

/// Anchored `static_regex!` for whole-value checks
macro_rules! field_pattern {
    ($name:ident, $pattern:literal) => {
        pub static $name: Lazy<Regex> =
            Lazy::new(|| static_regex!(concat!("^(", $pattern, ")$"), stringify!($name)));
    };
}

field_pattern!(TABLE, r"nat|filter");
field_pattern!(PROTOCOL, r"tcp|udp");
field_pattern!(SUBNET, r"(\d{1,3}\.){3}\d{1,3}/\d{1,2}");
field_pattern!(DESTINATION, r"(\d{1,3}\.){3}\d{1,3}(:\d{1,5})?");
field_pattern!(INTERFACE, r"[a-z0-9]+(\.(\d{1,4}|0x[0-9a-f]{1,4}))?");
field_pattern!(PORTS, r"(\d{1,5}(:\d{1,5})?,)*?(\d{1,5}(:\d{1,5})?)");
field_pattern!(FILTER_CHAIN, r"(\w+-)?(input|output|forward)");
field_pattern!(NAT_CHAIN, r"(\w+-)?(input|output|prerouting|postrouting)");
field_pattern!(COMMENT, r"\d+\+[0-9a-z]+");
field_pattern!(NAT_ACTION, r"snat|dnat");
field_pattern!(PREROUTING_ACTION, r"dnat|accept|drop");
field_pattern!(POSTROUTING_ACTION, r"snat|masquerade|accept|drop");
field_pattern!(FILTER_ACTION, r"accept|drop");

/// `-t <table>` / `--table <table>` inside a stored rule line
pub static RULE_TABLE: Lazy<Regex> = Lazy::new(|| {
    static_regex!(r"(?:^|\s)(?:-t|--table)\s+(\S+)", "RULE_TABLE")
});

/// `-A <chain>` / `-I <chain>` inside a stored rule line
pub static RULE_CHAIN: Lazy<Regex> =
    Lazy::new(|| static_regex!(r"-[AI]\s+([\w\-]+)", "RULE_CHAIN"));

/// `InvalidArgument` unless `value` matches `pattern`
pub fn check(pattern: &Regex, value: &str, name: &str) -> Result<()> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "invalid value ({}) for argument ({})",
            value, name
        )))
    }
}
