// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Ensures the private chains this daemon owns exist, are referenced from the built-in chains,
//! and carry the invariant base rules, regardless of what else is already present in the table.

use slog::{debug, info, warn, Logger};

use crate::errors::{NetFw6Error, Result};
use crate::iptables::{IPTables, IPVersion};

const TABLE_FILTER: &str = "filter";
const TABLE_NAT: &str = "nat";

/// Names of the six private chains this daemon owns.
#[derive(Debug, Clone)]
pub struct ChainNames {
    /// IPv6 FORWARD chain, referenced from the built-in `FORWARD`.
    pub fwd6: String,
    /// IPv6 INPUT chain, referenced from the built-in `INPUT`.
    pub in6: String,
    /// IPv6 NAT chain, referenced from the built-in `PREROUTING`.
    pub nat6: String,
    /// IPv4 FORWARD chain, referenced from the built-in `FORWARD`.
    pub fwd4: String,
    /// IPv4 NAT chain, referenced from the built-in `POSTROUTING`.
    pub nat4: String,
    /// Isolation chain, shared by both families, referenced from the built-in `INPUT`.
    pub isolation: String,
}

impl Default for ChainNames {
    fn default() -> Self {
        ChainNames {
            fwd6: "DOCKER_IPV6FW_FORWARD".to_owned(),
            in6: "DOCKER_IPV6FW_INPUT".to_owned(),
            nat6: "DOCKER_IPV6FW_NAT".to_owned(),
            fwd4: "DOCKER_IPV4FW_FORWARD".to_owned(),
            nat4: "DOCKER_IPV4FW_NAT".to_owned(),
            isolation: "DOCKER_IPV6FW_ISOLATION".to_owned(),
        }
    }
}

const ICMPV6_IN_TYPES: &[&str] = &[
    "destination-unreachable",
    "packet-too-big",
    "time-exceeded",
    "parameter-problem",
    "neighbor-solicitation",
    "neighbor-advertisement",
    "router-solicitation",
    "router-advertisement",
];

/// Builds and tears down the six private chains and their invariant base rules.
pub struct ChainManager<'a> {
    v6: &'a dyn IPTables,
    v4: &'a dyn IPTables,
    chains: ChainNames,
    parent_iface: String,
    gateway_iface: String,
    link_local_v6: String,
    log: Logger,
    added_base_rules: Vec<(IPVersion, &'static str, String, String)>,
}

impl<'a> ChainManager<'a> {
    /// Build a manager over the given per-family drivers.
    pub fn new(
        v6: &'a dyn IPTables,
        v4: &'a dyn IPTables,
        chains: ChainNames,
        parent_iface: String,
        gateway_iface: String,
        link_local_v6: String,
        log: Logger,
    ) -> Self {
        ChainManager {
            v6,
            v4,
            chains,
            parent_iface,
            gateway_iface,
            link_local_v6,
            log,
            added_base_rules: Vec::new(),
        }
    }

    /// Create the private chains (if absent), reference them from their natural parent at
    /// position 1, flush them, remove the isolation jump, then install the base rules.
    pub fn initialize(&mut self) -> Result<()> {
        use IPVersion::{IPv4, IPv6};

        self.ensure_chain(IPv6, TABLE_FILTER, &self.chains.fwd6.clone())?;
        self.ensure_jump(IPv6, TABLE_FILTER, "FORWARD", &self.chains.fwd6.clone(), 1)?;

        self.ensure_chain(IPv6, TABLE_FILTER, &self.chains.in6.clone())?;
        self.ensure_jump(IPv6, TABLE_FILTER, "INPUT", &self.chains.in6.clone(), 1)?;

        self.ensure_chain(IPv6, TABLE_NAT, &self.chains.nat6.clone())?;
        self.ensure_jump(IPv6, TABLE_NAT, "PREROUTING", &self.chains.nat6.clone(), 1)?;

        self.ensure_chain(IPv4, TABLE_FILTER, &self.chains.fwd4.clone())?;
        self.ensure_jump(IPv4, TABLE_FILTER, "FORWARD", &self.chains.fwd4.clone(), 1)?;

        self.ensure_chain(IPv4, TABLE_NAT, &self.chains.nat4.clone())?;
        self.ensure_jump(IPv4, TABLE_NAT, "POSTROUTING", &self.chains.nat4.clone(), 1)?;

        self.ensure_chain(IPv6, TABLE_FILTER, &self.chains.isolation.clone())?;
        self.ensure_jump(IPv6, TABLE_FILTER, "INPUT", &self.chains.isolation.clone(), 1)?;

        self.flush(IPv6, TABLE_FILTER, &self.chains.fwd6.clone())?;
        self.flush(IPv6, TABLE_FILTER, &self.chains.in6.clone())?;
        self.flush(IPv6, TABLE_NAT, &self.chains.nat6.clone())?;
        self.flush(IPv4, TABLE_FILTER, &self.chains.fwd4.clone())?;
        self.flush(IPv4, TABLE_NAT, &self.chains.nat4.clone())?;

        self.install_base_rules()?;
        Ok(())
    }

    fn install_base_rules(&mut self) -> Result<()> {
        use IPVersion::{IPv4, IPv6};

        let fwd6 = self.chains.fwd6.clone();
        let in6 = self.chains.in6.clone();
        let isolation = self.chains.isolation.clone();
        let fwd4 = self.chains.fwd4.clone();
        let nat4 = self.chains.nat4.clone();

        self.insert_base(
            IPv6,
            TABLE_FILTER,
            &fwd6,
            1,
            &format!(
                "-i {} -o {} -m conntrack --ctstate DNAT -j ACCEPT",
                self.parent_iface, self.gateway_iface
            ),
        )?;

        self.append_base(
            IPv6,
            TABLE_FILTER,
            &fwd6,
            &format!(
                "-i {} -o {} -p icmpv6 -j ACCEPT",
                self.parent_iface, self.gateway_iface
            ),
        )?;
        self.append_base(
            IPv6,
            TABLE_FILTER,
            &fwd6,
            &format!(
                "-i {} -o {} -p icmpv6 -j ACCEPT",
                self.gateway_iface, self.parent_iface
            ),
        )?;
        self.append_base(
            IPv4,
            TABLE_FILTER,
            &fwd4,
            &format!(
                "-i {} -o {} -p icmp -j ACCEPT",
                self.parent_iface, self.gateway_iface
            ),
        )?;
        self.append_base(
            IPv4,
            TABLE_FILTER,
            &fwd4,
            &format!(
                "-i {} -o {} -p icmp -j ACCEPT",
                self.gateway_iface, self.parent_iface
            ),
        )?;

        for icmp_type in ICMPV6_IN_TYPES {
            self.append_base(
                IPv6,
                TABLE_FILTER,
                &in6,
                &format!("-p icmpv6 --icmpv6-type {} -j ACCEPT", icmp_type),
            )?;
        }
        self.append_base(
            IPv6,
            TABLE_FILTER,
            &in6,
            &format!("-s {} -j ACCEPT", self.link_local_v6),
        )?;
        self.append_base(
            IPv6,
            TABLE_FILTER,
            &in6,
            &format!("-d {} -j ACCEPT", self.link_local_v6),
        )?;

        self.append_base(
            IPv6,
            TABLE_FILTER,
            &isolation,
            &format!(
                "-i {} -p ! icmpv6 -m addrtype --dst-type LOCAL -j DROP",
                self.gateway_iface
            ),
        )?;
        self.append_base(
            IPv4,
            TABLE_FILTER,
            &isolation,
            &format!(
                "-i {} -p ! icmp -m addrtype --dst-type LOCAL -j DROP",
                self.gateway_iface
            ),
        )?;

        self.append_base(
            IPv4,
            TABLE_FILTER,
            &fwd4,
            &format!(
                "-i {} -o {} -j ACCEPT",
                self.gateway_iface, self.parent_iface
            ),
        )?;

        self.append_base(
            IPv4,
            TABLE_NAT,
            &nat4,
            &format!("-o {} -j MASQUERADE", self.parent_iface),
        )?;

        Ok(())
    }

    /// Remove owner-attributed rules (the caller's responsibility, via the Reconciler), then
    /// remove exactly the base rules `initialize()` recorded having added — not a blanket flush,
    /// so operator rules coexisting in these chains survive a restart — then remove the
    /// parent-chain jumps. The chains themselves and the isolation chain's body are left in place.
    pub fn cleanup(&mut self) -> Result<()> {
        use IPVersion::{IPv4, IPv6};

        for (family, table, chain, rule) in self.added_base_rules.drain(..).collect::<Vec<_>>() {
            let driver = Self::driver_for(self.v6, self.v4, family);
            match driver.delete(table, &chain, &rule) {
                Ok(_) => {
                    debug!(self.log, "removed base rule"; "table" => table, "chain" => &chain, "rule" => &rule)
                }
                Err(e) => warn!(
                    self.log, "failed to remove base rule, leaving it in place";
                    "table" => table, "chain" => &chain, "rule" => &rule, "error" => e.to_string()
                ),
            }
        }

        self.remove_jump(IPv6, TABLE_FILTER, "FORWARD", &self.chains.fwd6.clone())?;
        self.remove_jump(IPv6, TABLE_FILTER, "INPUT", &self.chains.in6.clone())?;
        self.remove_jump(IPv6, TABLE_NAT, "PREROUTING", &self.chains.nat6.clone())?;
        self.remove_jump(IPv4, TABLE_FILTER, "FORWARD", &self.chains.fwd4.clone())?;
        self.remove_jump(IPv4, TABLE_NAT, "POSTROUTING", &self.chains.nat4.clone())?;
        self.remove_jump(IPv6, TABLE_FILTER, "INPUT", &self.chains.isolation.clone())?;

        Ok(())
    }

    fn driver_for(v6: &'a dyn IPTables, v4: &'a dyn IPTables, family: IPVersion) -> &'a dyn IPTables {
        match family {
            IPVersion::IPv6 => v6,
            IPVersion::IPv4 => v4,
        }
    }

    fn driver(&self, family: IPVersion) -> &'a dyn IPTables {
        Self::driver_for(self.v6, self.v4, family)
    }

    fn ensure_chain(&self, family: IPVersion, table: &str, chain: &str) -> Result<()> {
        let driver = self.driver(family);
        if !driver.chain_exists(table, chain)? {
            driver.new_chain(table, chain)?;
            info!(self.log, "created chain"; "table" => table, "chain" => chain);
        }
        Ok(())
    }

    fn ensure_jump(
        &self,
        family: IPVersion,
        table: &str,
        parent: &str,
        child: &str,
        position: i32,
    ) -> Result<()> {
        let driver = self.driver(family);
        let rule = format!("-j {}", child);
        if !driver.exists(table, parent, &rule)? {
            driver.insert(table, parent, &rule, position)?;
            info!(self.log, "inserted jump"; "table" => table, "parent" => parent, "child" => child);
        }
        Ok(())
    }

    fn remove_jump(&self, family: IPVersion, table: &str, parent: &str, child: &str) -> Result<()> {
        let driver = self.driver(family);
        let rule = format!("-j {}", child);
        if driver.exists(table, parent, &rule)? {
            driver.delete(table, parent, &rule)?;
            info!(self.log, "removed jump"; "table" => table, "parent" => parent, "child" => child);
        }
        Ok(())
    }

    fn flush(&self, family: IPVersion, table: &str, chain: &str) -> Result<()> {
        self.driver(family).flush_chain(table, chain).map_err(|e| {
            NetFw6Error::AdminProgramFailure {
                program: "iptables".to_owned(),
                table: table.to_owned(),
                chain: chain.to_owned(),
                reason: e.to_string(),
            }
            .into()
        })?;
        Ok(())
    }

    fn insert_base(
        &mut self,
        family: IPVersion,
        table: &str,
        chain: &str,
        position: i32,
        rule: &str,
    ) -> Result<()> {
        let driver = self.driver(family);
        if !driver.exists(table, chain, rule)? {
            driver.insert(table, chain, rule, position)?;
            self.added_base_rules
                .push((family, table_name(table), chain.to_owned(), rule.to_owned()));
            debug!(self.log, "installed base rule"; "table" => table, "chain" => chain, "rule" => rule);
        }
        Ok(())
    }

    fn append_base(&mut self, family: IPVersion, table: &str, chain: &str, rule: &str) -> Result<()> {
        let driver = self.driver(family);
        if !driver.exists(table, chain, rule)? {
            driver.append(table, chain, rule)?;
            self.added_base_rules
                .push((family, table_name(table), chain.to_owned(), rule.to_owned()));
            debug!(self.log, "installed base rule"; "table" => table, "chain" => chain, "rule" => rule);
        }
        Ok(())
    }

    /// The base rules actually added (as opposed to already present) during `initialize()`;
    /// `cleanup()` drains and removes exactly these.
    pub fn added_base_rules(&self) -> &[(IPVersion, &'static str, String, String)] {
        &self.added_base_rules
    }
}

fn table_name(table: &str) -> &'static str {
    match table {
        TABLE_NAT => TABLE_NAT,
        _ => TABLE_FILTER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::IPTablesLogger;
    use slog::{o, Discard};

    fn test_log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn test_manager<'a>(v6: &'a IPTablesLogger, v4: &'a IPTablesLogger) -> ChainManager<'a> {
        ChainManager::new(
            v6,
            v4,
            ChainNames::default(),
            "eth0".to_owned(),
            "dfwbr0".to_owned(),
            "fe80::/10".to_owned(),
            test_log(),
        )
    }

    #[test]
    fn initialize_creates_chains_and_jumps_on_the_right_driver() {
        let v6 = IPTablesLogger::new();
        let v4 = IPTablesLogger::new();
        let mut manager = test_manager(&v6, &v4);
        manager.initialize().unwrap();

        let v6_calls = v6.logs();
        let v4_calls = v4.logs();

        assert!(v6_calls
            .iter()
            .any(|(name, args)| name == "new_chain"
                && args.as_deref() == Some("filter DOCKER_IPV6FW_FORWARD")));
        assert!(v6_calls
            .iter()
            .any(|(name, args)| name == "insert"
                && args.as_deref().unwrap_or("").contains("FORWARD -j DOCKER_IPV6FW_FORWARD")));
        assert!(v4_calls
            .iter()
            .any(|(name, args)| name == "new_chain"
                && args.as_deref() == Some("filter DOCKER_IPV4FW_FORWARD")));
        assert!(v4_calls
            .iter()
            .any(|(name, args)| name == "new_chain"
                && args.as_deref() == Some("nat DOCKER_IPV4FW_NAT")));

        // The isolation chain and its INPUT jump live on the v6 driver only.
        assert!(v6_calls
            .iter()
            .any(|(name, args)| name == "new_chain"
                && args.as_deref() == Some("filter DOCKER_IPV6FW_ISOLATION")));
        assert_eq!(
            v4_calls
                .iter()
                .filter(|(name, _)| name == "new_chain")
                .count(),
            2,
            "v4 only owns fwd4 and nat4, never the isolation chain"
        );
    }

    #[test]
    fn initialize_installs_every_base_rule_exactly_once() {
        let v6 = IPTablesLogger::new();
        let v4 = IPTablesLogger::new();
        let mut manager = test_manager(&v6, &v4);
        manager.initialize().unwrap();

        // v6: 1 conntrack-DNAT + 2 icmpv6 fwd + 8 icmpv6 in + 2 link-local + 1 isolation = 14.
        // v4: 2 icmp fwd + 1 isolation + 1 gateway->parent accept + 1 masquerade = 5.
        assert_eq!(manager.added_base_rules().len(), 19);
        assert!(manager
            .added_base_rules()
            .iter()
            .any(|(_, table, chain, rule)| *table == "nat"
                && chain == "DOCKER_IPV4FW_NAT"
                && rule.contains("MASQUERADE")));
    }

    #[test]
    fn cleanup_removes_exactly_the_recorded_base_rules_and_never_deletes_the_chains_themselves() {
        let v6 = IPTablesLogger::new();
        let v4 = IPTablesLogger::new();
        let mut manager = test_manager(&v6, &v4);
        manager.initialize().unwrap();
        let recorded = manager.added_base_rules().len();
        manager.cleanup().unwrap();

        let v6_calls = v6.logs();
        let v4_calls = v4.logs();
        let deletes = v6_calls
            .iter()
            .chain(v4_calls.iter())
            .filter(|(name, _)| name == "delete")
            .count();
        assert_eq!(
            deletes, recorded,
            "cleanup should delete exactly the base rules recorded as added, nothing more or less"
        );
        assert!(v6_calls
            .iter()
            .any(|(name, args)| name == "delete"
                && args.as_deref().unwrap_or("").contains("DOCKER_IPV6FW_ISOLATION")));
        assert!(v4_calls
            .iter()
            .any(|(name, args)| name == "delete"
                && args.as_deref().unwrap_or("").contains("MASQUERADE")));
        assert!(manager.added_base_rules().is_empty());

        // Nothing ever flushes or deletes the chains wholesale: operator rules coexisting in
        // these chains must survive a cleanup/restart cycle.
        assert!(v6_calls.iter().all(|(name, _)| name != "flush_chain"));
        assert!(v4_calls.iter().all(|(name, _)| name != "flush_chain"));
        assert!(v6_calls.iter().all(|(name, _)| name != "delete_chain"));
        assert!(v4_calls.iter().all(|(name, _)| name != "delete_chain"));
    }
}
