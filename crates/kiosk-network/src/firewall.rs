//! iptables rules for the captive portal.

use crate::NetworkServiceState;

/// Netfilter table a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

/// Where a new rule goes in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Head of the chain (`-I`).
    Insert,
    /// Tail of the chain (`-A`).
    Append,
}

/// One iptables rule, minus the action flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: Table,
    pub chain: &'static str,
    pub position: Position,
    /// Match and target arguments, e.g. `-i wlan0 -j ACCEPT`.
    pub spec: Vec<String>,
}

impl FirewallRule {
    fn new(table: Table, chain: &'static str, position: Position, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            position,
            spec: spec.iter().map(ToString::to_string).collect(),
        }
    }

    fn args(&self, action: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.spec.len() + 4);
        if self.table == Table::Nat {
            args.push("-t".to_string());
            args.push("nat".to_string());
        }
        args.push(action.to_string());
        args.push(self.chain.to_string());
        args.extend(self.spec.iter().cloned());
        args
    }

    /// Arguments that add the rule.
    #[must_use]
    pub fn add_args(&self) -> Vec<String> {
        match self.position {
            Position::Insert => self.args("-I"),
            Position::Append => self.args("-A"),
        }
    }

    /// Arguments that remove one copy of the rule.
    #[must_use]
    pub fn delete_args(&self) -> Vec<String> {
        self.args("-D")
    }
}

/// Rules for the portal, in install order.
///
/// DNS is allowed ahead of everything else, QUIC is rejected so browsers
/// fall back to TCP, web traffic is redirected to the portal, and the rest
/// of the interface is accepted.
#[must_use]
pub fn portal_rules(state: &NetworkServiceState) -> Vec<FirewallRule> {
    let iface = state.interface.as_str();
    let destination = state.portal_destination();
    let redirect = |port: &str| {
        FirewallRule::new(
            Table::Nat,
            "PREROUTING",
            Position::Append,
            &[
                "-i",
                iface,
                "-p",
                "tcp",
                "--dport",
                port,
                "-j",
                "DNAT",
                "--to-destination",
                destination.as_str(),
            ],
        )
    };

    vec![
        FirewallRule::new(
            Table::Filter,
            "INPUT",
            Position::Insert,
            &["-i", iface, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
        ),
        FirewallRule::new(
            Table::Filter,
            "INPUT",
            Position::Insert,
            &["-i", iface, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
        ),
        FirewallRule::new(
            Table::Filter,
            "INPUT",
            Position::Append,
            &["-i", iface, "-p", "udp", "--dport", "443", "-j", "REJECT"],
        ),
        redirect("80"),
        redirect("443"),
        FirewallRule::new(
            Table::Filter,
            "INPUT",
            Position::Append,
            &["-i", iface, "-j", "ACCEPT"],
        ),
        FirewallRule::new(
            Table::Filter,
            "OUTPUT",
            Position::Append,
            &["-o", iface, "-j", "ACCEPT"],
        ),
    ]
}
