// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The engine proper: derives desired rules from inventory descriptors, diffs them against the
//! [`Ledger`](../ledger/struct.Ledger.html), and converges the live kernel tables through the
//! Filter Driver.

use std::collections::BTreeMap;

use slog::{debug, error, warn, Logger};

use crate::config::Config;
use crate::errors::{MissingAddress, NetFw6Error, Result};
use crate::inventory::InventorySource;
use crate::ledger::Ledger;
use crate::iptables::IPTables;
use crate::types::{
    AttachedNetwork, ContainerBucket, ContainerDescriptor, Event, ForwardRule, NatRule,
    NatRulePair, OwnerDescriptor, Protocol, PublishMode, RuleSet, ServiceDescriptor,
};
use crate::label;

/// The label carrying the custom-port list, read on both containers and services.
pub const CUSTOM_PORTS_LABEL: &str = "docker-ipv6-firewall.ports";

/// Eligible networks' IPv6 addresses, per §4.4.1. A network whose driver matches but that has no
/// usable address is skipped silently (debug-level only, via `on_missing_address`) rather than
/// failing the whole derivation, per §7's `MissingAddress` failure semantics.
fn eligible_addresses(
    networks: &[AttachedNetwork],
    monitored_drivers: &[String],
    on_missing_address: &mut dyn FnMut(MissingAddress),
) -> Vec<String> {
    let mut addresses = Vec::new();
    for network in networks {
        let driver_lower = network.driver.to_ascii_lowercase();
        let driver_matches = monitored_drivers
            .iter()
            .any(|d| driver_lower.contains(&d.to_ascii_lowercase()));
        if !driver_matches {
            continue;
        }
        match network.global_ipv6_address.as_ref().filter(|a| !a.is_empty()) {
            Some(addr) => addresses.push(addr.clone()),
            None => on_missing_address(MissingAddress {
                network: network.name.clone(),
            }),
        }
    }
    addresses
}

/// Derive the desired rule sets for a single owner descriptor, keyed by owner bucket.
///
/// Containers may occupy up to three buckets (`<id>`, `<id>_public`, `<id>_custom`); services
/// occupy exactly one, keyed by their cluster-assigned id.
pub fn derive<F, G>(
    owner: &OwnerDescriptor,
    config: &Config,
    mut on_label_error: F,
    mut on_missing_address: G,
) -> BTreeMap<String, RuleSet>
where
    F: FnMut(NetFw6Error),
    G: FnMut(MissingAddress),
{
    match owner {
        OwnerDescriptor::Container(c) => {
            derive_for_container(c, config, &mut on_label_error, &mut on_missing_address)
        }
        OwnerDescriptor::Service(s, containers) => derive_for_service(
            s,
            containers,
            config,
            &mut on_label_error,
            &mut on_missing_address,
        ),
    }
}

fn derive_for_container(
    container: &ContainerDescriptor,
    config: &Config,
    on_label_error: &mut dyn FnMut(NetFw6Error),
    on_missing_address: &mut dyn FnMut(MissingAddress),
) -> BTreeMap<String, RuleSet> {
    let addresses = eligible_addresses(
        &container.networks,
        &config.monitored_drivers,
        on_missing_address,
    );

    let plain_key = ContainerBucket::Plain.owner_key(&container.id);
    let public_key = ContainerBucket::Public.owner_key(&container.id);
    let custom_key = ContainerBucket::Custom.owner_key(&container.id);

    let mut buckets = BTreeMap::new();
    buckets.insert(plain_key.clone(), RuleSet::default());
    buckets.insert(public_key.clone(), RuleSet::default());
    buckets.insert(custom_key.clone(), RuleSet::default());

    for dst_addr in &addresses {
        for port in &container.published_ports {
            if port.container_port == 0 {
                continue;
            }
            match port.host_port {
                None => {
                    insert_forward_rule(
                        buckets.get_mut(&plain_key).unwrap(),
                        &container.id,
                        &container.name,
                        port.proto,
                        dst_addr,
                        port.container_port,
                        &config.parent_iface,
                        &config.gateway_iface,
                    );
                }
                Some(host_port) if host_port == port.container_port => {
                    insert_forward_rule(
                        buckets.get_mut(&plain_key).unwrap(),
                        &container.id,
                        &container.name,
                        port.proto,
                        dst_addr,
                        port.container_port,
                        &config.parent_iface,
                        &config.gateway_iface,
                    );
                }
                Some(host_port) => {
                    insert_nat_pair(
                        buckets.get_mut(&public_key).unwrap(),
                        &container.id,
                        &container.name,
                        port.proto,
                        dst_addr,
                        host_port,
                        port.container_port,
                        &config.parent_iface,
                        &config.gateway_iface,
                    );
                }
            }
        }
    }

    if let Some(label_value) = container.labels.get(CUSTOM_PORTS_LABEL) {
        let entries = label::parse_port_label(label_value, |e| on_label_error(e));
        for dst_addr in &addresses {
            for entry in &entries {
                if entry.published == 0 {
                    continue;
                }
                if entry.published == entry.target {
                    insert_forward_rule(
                        buckets.get_mut(&custom_key).unwrap(),
                        &container.id,
                        &container.name,
                        entry.proto,
                        dst_addr,
                        entry.published,
                        &config.parent_iface,
                        &config.gateway_iface,
                    );
                } else {
                    insert_nat_pair(
                        buckets.get_mut(&custom_key).unwrap(),
                        &container.id,
                        &container.name,
                        entry.proto,
                        dst_addr,
                        entry.published,
                        entry.target,
                        &config.parent_iface,
                        &config.gateway_iface,
                    );
                }
            }
        }
    }

    buckets
}

fn derive_for_service(
    service: &ServiceDescriptor,
    containers: &[ContainerDescriptor],
    config: &Config,
    on_label_error: &mut dyn FnMut(NetFw6Error),
    on_missing_address: &mut dyn FnMut(MissingAddress),
) -> BTreeMap<String, RuleSet> {
    let mut rules = RuleSet::default();

    if let Some(label_value) = service.labels.get(CUSTOM_PORTS_LABEL) {
        // Custom-label exclusivity: the label-derived ports are authoritative; the runtime
        // service port set is ignored entirely.
        let entries = label::parse_port_label(label_value, |e| on_label_error(e));
        for container in containers {
            let addresses = eligible_addresses(
                &container.networks,
                &config.monitored_drivers,
                on_missing_address,
            );
            for dst_addr in &addresses {
                for entry in &entries {
                    if entry.published == 0 {
                        continue;
                    }
                    if entry.published == entry.target {
                        insert_forward_rule(
                            &mut rules,
                            &service.id,
                            &service.name,
                            entry.proto,
                            dst_addr,
                            entry.published,
                            &config.parent_iface,
                            &config.gateway_iface,
                        );
                    } else {
                        insert_nat_pair(
                            &mut rules,
                            &service.id,
                            &service.name,
                            entry.proto,
                            dst_addr,
                            entry.published,
                            entry.target,
                            &config.parent_iface,
                            &config.gateway_iface,
                        );
                    }
                }
            }
        }
    } else {
        for port in &service.ports {
            if port.publish_mode != PublishMode::Ingress {
                continue;
            }
            let (published, target) = match (port.published_port, port.target_port) {
                (Some(p), Some(t)) if p != 0 => (p, t),
                _ => continue,
            };
            for container in containers {
                let addresses = eligible_addresses(
                    &container.networks,
                    &config.monitored_drivers,
                    on_missing_address,
                );
                for dst_addr in &addresses {
                    insert_nat_pair(
                        &mut rules,
                        &service.id,
                        &service.name,
                        port.proto,
                        dst_addr,
                        published,
                        target,
                        &config.parent_iface,
                        &config.gateway_iface,
                    );
                }
            }
        }
    }

    let mut buckets = BTreeMap::new();
    buckets.insert(service.id.clone(), rules);
    buckets
}

#[allow(clippy::too_many_arguments)]
fn insert_forward_rule(
    rules: &mut RuleSet,
    owner_id: &str,
    owner_label: &str,
    proto: Protocol,
    dst_addr: &str,
    dport: u16,
    in_iface: &str,
    out_iface: &str,
) {
    if dst_addr.is_empty() || dport == 0 {
        return;
    }
    rules.forward.insert(ForwardRule {
        owner_id: owner_id.to_owned(),
        owner_label: owner_label.to_owned(),
        proto,
        dst_addr: dst_addr.to_owned(),
        dport,
        in_iface: in_iface.to_owned(),
        out_iface: out_iface.to_owned(),
    });
}

#[allow(clippy::too_many_arguments)]
fn insert_nat_pair(
    rules: &mut RuleSet,
    owner_id: &str,
    owner_label: &str,
    proto: Protocol,
    dst_addr: &str,
    published_port: u16,
    target_port: u16,
    in_iface: &str,
    out_iface: &str,
) {
    if dst_addr.is_empty() || published_port == 0 {
        return;
    }
    let nat = NatRule {
        owner_id: owner_id.to_owned(),
        owner_label: owner_label.to_owned(),
        proto,
        dst_addr: dst_addr.to_owned(),
        published_port,
        target_port,
        in_iface: in_iface.to_owned(),
    };
    let forward = nat.companion_forward_rule(out_iface);
    rules.nat.insert(NatRulePair { nat, forward });
}

/// Table/chain names the Reconciler drives rules against — always the IPv6 private chains,
/// since owner-attributed rules only ever concern IPv6 container addresses.
pub struct ReconcileChains {
    /// Filter table chain holding ACCEPT rules.
    pub fwd6: String,
    /// NAT table chain holding DNAT rules.
    pub nat6: String,
}

/// The engine: owns the Ledger, drives the Filter Driver, and talks to the Inventory Source.
pub struct Reconciler<'a> {
    ledger: Ledger,
    inventory: &'a dyn InventorySource,
    driver: &'a dyn IPTables,
    chains: ReconcileChains,
    config: Config,
    log: Logger,
}

impl<'a> Reconciler<'a> {
    /// Build a reconciler over the given collaborators.
    pub fn new(
        inventory: &'a dyn InventorySource,
        driver: &'a dyn IPTables,
        chains: ReconcileChains,
        config: Config,
        log: Logger,
    ) -> Self {
        Reconciler {
            ledger: Ledger::new(),
            inventory,
            driver,
            chains,
            config,
            log,
        }
    }

    /// Read-only access to the Ledger, for observability.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Replace the configuration used to derive desired rules (monitored drivers, label
    /// grammar) on subsequent calls. Does not retroactively re-reconcile existing owners; the
    /// next sweep picks up the change for everything still live.
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// Reconcile a single owner descriptor: derive desired rules, diff per bucket against the
    /// Ledger, and converge the kernel tables. A no-op per bucket is a cheap short-circuit.
    pub fn reconcile_owner(&mut self, owner: &OwnerDescriptor) -> Result<()> {
        let log = self.log.clone();
        let label_log = log.clone();
        let desired = derive(
            owner,
            &self.config,
            move |e| {
                warn!(label_log, "skipping malformed port label element"; "error" => e.to_string());
            },
            move |e| {
                debug!(log, "skipping network with no usable IPv6 address"; "network" => &e.network);
            },
        );

        for (bucket, new_rules) in desired {
            self.reconcile_bucket(&bucket, new_rules)?;
        }
        Ok(())
    }

    fn reconcile_bucket(&mut self, bucket: &str, new_rules: RuleSet) -> Result<()> {
        let old_rules = self.ledger.get(bucket);
        if new_rules == old_rules {
            return Ok(());
        }

        let (to_add, to_remove) = self.ledger.diff(bucket, &new_rules);
        let mut actual = old_rules;

        for rule in &to_remove.forward {
            match self.driver.delete(
                "filter",
                &self.chains.fwd6,
                &forward_rule_spec(rule),
            ) {
                Ok(_) => {
                    actual.forward.remove(rule);
                }
                Err(e) => error!(self.log, "failed to delete forward rule"; "owner" => bucket, "error" => e.to_string()),
            }
        }
        for pair in &to_remove.nat {
            match self.delete_nat_pair(pair) {
                Ok(_) => {
                    actual.nat.remove(pair);
                }
                Err(e) => error!(self.log, "failed to delete nat rule"; "owner" => bucket, "error" => e.to_string()),
            }
        }

        for rule in &to_add.forward {
            match self.driver.append_unique(
                "filter",
                &self.chains.fwd6,
                &forward_rule_spec(rule),
            ) {
                Ok(_) => {
                    actual.forward.insert(rule.clone());
                }
                Err(e) => error!(self.log, "failed to add forward rule"; "owner" => bucket, "error" => e.to_string()),
            }
        }
        for pair in &to_add.nat {
            match self.add_nat_pair(pair) {
                Ok(_) => {
                    actual.nat.insert(pair.clone());
                }
                Err(e) => error!(self.log, "failed to add nat rule"; "owner" => bucket, "error" => e.to_string()),
            }
        }

        debug!(self.log, "reconciled owner bucket";
               "owner" => bucket, "added" => to_add.rule_count(), "removed" => to_remove.rule_count());

        self.ledger.replace(bucket, actual);
        Ok(())
    }

    fn add_nat_pair(&self, pair: &NatRulePair) -> Result<()> {
        self.driver
            .append_unique("nat", &self.chains.nat6, &nat_rule_spec(&pair.nat))?;
        self.driver
            .append_unique("filter", &self.chains.fwd6, &forward_rule_spec(&pair.forward))?;
        Ok(())
    }

    fn delete_nat_pair(&self, pair: &NatRulePair) -> Result<()> {
        self.driver
            .delete("nat", &self.chains.nat6, &nat_rule_spec(&pair.nat))?;
        self.driver
            .delete("filter", &self.chains.fwd6, &forward_rule_spec(&pair.forward))?;
        Ok(())
    }

    /// Apply a single lifecycle event.
    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::ContainerStart(c) => self.reconcile_owner(&OwnerDescriptor::Container(c)),
            Event::ContainerStop(id) => self.drop_owner_family(&id),
            Event::ServiceUpdate(s, containers) => {
                self.reconcile_owner(&OwnerDescriptor::Service(s, containers))
            }
            Event::ServiceRemove(id) => self.drop_owner(&id),
        }
    }

    fn drop_owner_family(&mut self, container_id: &str) -> Result<()> {
        for bucket in [
            ContainerBucket::Plain.owner_key(container_id),
            ContainerBucket::Public.owner_key(container_id),
            ContainerBucket::Custom.owner_key(container_id),
        ] {
            self.drop_owner(&bucket)?;
        }
        Ok(())
    }

    fn drop_owner(&mut self, owner_id: &str) -> Result<()> {
        let rules = self.ledger.get(owner_id);
        if rules.is_empty() {
            self.ledger.drop(owner_id);
            return Ok(());
        }
        self.reconcile_bucket(owner_id, RuleSet::default())
    }

    /// Delete every rule currently tracked by the Ledger and drop all its entries. Used during
    /// shutdown, before the Chain Topology Manager flushes the private chains themselves (§4.2's
    /// cleanup contract: "remove owner-attributed rules … driven by the Reconciler").
    pub fn teardown_all(&mut self) -> Result<()> {
        for owner in self.ledger.owners() {
            self.drop_owner(&owner)?;
        }
        Ok(())
    }

    /// Run a full periodic sweep: drop Ledger owners no longer reported live, then re-reconcile
    /// every live owner (cheap, thanks to the no-op short-circuit).
    pub fn sweep(&mut self) -> Result<()> {
        let containers = self.inventory.snapshot_containers()?;
        let services = self.inventory.snapshot_services()?;

        let mut live_buckets = std::collections::BTreeSet::new();
        for c in &containers {
            live_buckets.insert(ContainerBucket::Plain.owner_key(&c.id));
            live_buckets.insert(ContainerBucket::Public.owner_key(&c.id));
            live_buckets.insert(ContainerBucket::Custom.owner_key(&c.id));
        }
        for s in &services {
            live_buckets.insert(s.id.clone());
        }

        let stale: Vec<String> = self
            .ledger
            .owners()
            .into_iter()
            .filter(|owner| !live_buckets.contains(owner))
            .collect();
        for owner in stale {
            self.drop_owner(&owner)?;
        }

        for c in &containers {
            self.reconcile_owner(&OwnerDescriptor::Container(c.clone()))?;
        }
        for s in &services {
            let backing = self
                .inventory
                .containers_for_service(&s.id)
                .unwrap_or_default();
            self.reconcile_owner(&OwnerDescriptor::Service(s.clone(), backing))?;
        }

        Ok(())
    }
}

fn forward_rule_spec(rule: &ForwardRule) -> String {
    format!(
        "-i {} -o {} -p {} -d {} --dport {} -j ACCEPT",
        rule.in_iface, rule.out_iface, rule.proto, rule.dst_addr, rule.dport
    )
}

fn nat_rule_spec(rule: &NatRule) -> String {
    format!(
        "-i {} -p {} -d {} --dport {} -j DNAT --to-destination [{}]:{}",
        rule.in_iface, rule.proto, rule.dst_addr, rule.published_port, rule.dst_addr, rule.target_port
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::types::{PublishedPort, ServicePort};
    use maplit::btreemap;
    use slog::{o, Discard};

    fn test_config() -> Config {
        ConfigBuilder::default()
            .parent_iface("eth0")
            .gateway_iface("eth1")
            .build()
            .unwrap()
    }

    fn container_with_address(id: &str, addr: &str) -> ContainerDescriptor {
        ContainerDescriptor {
            id: id.to_owned(),
            name: id.to_owned(),
            labels: Default::default(),
            published_ports: Vec::new(),
            networks: vec![AttachedNetwork {
                name: "macvlan0".to_owned(),
                driver: "macvlan".to_owned(),
                global_ipv6_address: Some(addr.to_owned()),
            }],
        }
    }

    #[test]
    fn label_parse_scenario_yields_three_custom_rules() {
        let mut container = container_with_address("c1", "2a0e::99");
        container.labels.insert(
            CUSTOM_PORTS_LABEL.to_owned(),
            "809/tcp, 443:444/udp, 5000".to_owned(),
        );

        let config = test_config();
        let buckets = derive(&OwnerDescriptor::Container(container), &config, |_| {}, |_| {});

        let custom = &buckets["c1_custom"];
        assert_eq!(custom.forward.len(), 2);
        assert_eq!(custom.nat.len(), 1);
        let nat = custom.nat.iter().next().unwrap();
        assert_eq!(nat.nat.published_port, 443);
        assert_eq!(nat.nat.target_port, 444);
        assert_eq!(nat.nat.proto, Protocol::Udp);
    }

    #[test]
    fn host_port_mapping_produces_public_bucket_nat_pair() {
        let mut container = container_with_address("c1", "2a0e::99");
        container.published_ports.push(PublishedPort {
            container_port: 80,
            host_port: Some(8080),
            proto: Protocol::Tcp,
        });

        let config = test_config();
        let buckets = derive(&OwnerDescriptor::Container(container), &config, |_| {}, |_| {});

        assert!(buckets["c1"].is_empty());
        assert_eq!(buckets["c1_public"].nat.len(), 1);
    }

    #[test]
    fn identity_host_port_produces_plain_forward_rule() {
        let mut container = container_with_address("c1", "2a0e::99");
        container.published_ports.push(PublishedPort {
            container_port: 80,
            host_port: Some(80),
            proto: Protocol::Tcp,
        });

        let config = test_config();
        let buckets = derive(&OwnerDescriptor::Container(container), &config, |_| {}, |_| {});

        assert_eq!(buckets["c1"].forward.len(), 1);
        assert!(buckets["c1_public"].is_empty());
    }

    #[test]
    fn ineligible_network_contributes_no_rules() {
        let container = ContainerDescriptor {
            id: "c1".to_owned(),
            name: "c1".to_owned(),
            labels: btreemap! { CUSTOM_PORTS_LABEL.to_owned() => "80".to_owned() },
            published_ports: Vec::new(),
            networks: vec![AttachedNetwork {
                name: "bridge0".to_owned(),
                driver: "overlay".to_owned(),
                global_ipv6_address: Some("2a0e::1".to_owned()),
            }],
        };

        let config = test_config();
        let buckets = derive(&OwnerDescriptor::Container(container), &config, |_| {}, |_| {});
        assert!(buckets["c1_custom"].is_empty());
    }

    #[test]
    fn eligible_driver_with_no_ipv6_address_is_skipped_and_reported() {
        let container = ContainerDescriptor {
            id: "c1".to_owned(),
            name: "c1".to_owned(),
            labels: btreemap! { CUSTOM_PORTS_LABEL.to_owned() => "80".to_owned() },
            published_ports: Vec::new(),
            networks: vec![AttachedNetwork {
                name: "macvlan0".to_owned(),
                driver: "macvlan".to_owned(),
                global_ipv6_address: None,
            }],
        };

        let config = test_config();
        let mut missing = Vec::new();
        let buckets = derive(
            &OwnerDescriptor::Container(container),
            &config,
            |_| {},
            |e| missing.push(e.network),
        );
        assert!(buckets["c1_custom"].is_empty());
        assert_eq!(missing, vec!["macvlan0".to_owned()]);
    }

    #[test]
    fn service_custom_label_ignores_runtime_port_set() {
        let service = ServiceDescriptor {
            id: "svc1".to_owned(),
            name: "web".to_owned(),
            labels: btreemap! { CUSTOM_PORTS_LABEL.to_owned() => "9000".to_owned() },
            ports: vec![ServicePort {
                published_port: Some(80),
                target_port: Some(8080),
                proto: Protocol::Tcp,
                publish_mode: PublishMode::Ingress,
            }],
        };
        let container = container_with_address("task1", "2a0e::42");

        let config = test_config();
        let buckets = derive(
            &OwnerDescriptor::Service(service, vec![container]),
            &config,
            |_| {},
            |_| {},
        );

        let rules = &buckets["svc1"];
        assert_eq!(rules.forward.len(), 1);
        assert_eq!(rules.forward.iter().next().unwrap().dport, 9000);
        assert!(rules.nat.is_empty());
    }

    #[test]
    fn service_ingress_ports_produce_nat_pair_per_backing_container() {
        let service = ServiceDescriptor {
            id: "svc1".to_owned(),
            name: "web".to_owned(),
            labels: Default::default(),
            ports: vec![ServicePort {
                published_port: Some(80),
                target_port: Some(8080),
                proto: Protocol::Tcp,
                publish_mode: PublishMode::Ingress,
            }],
        };
        let t1 = container_with_address("task1", "2a0e::1");
        let t2 = container_with_address("task2", "2a0e::2");

        let config = test_config();
        let buckets = derive(
            &OwnerDescriptor::Service(service, vec![t1, t2]),
            &config,
            |_| {},
            |_| {},
        );

        assert_eq!(buckets["svc1"].nat.len(), 2);
    }

    #[test]
    fn host_mode_service_port_contributes_no_rules() {
        let service = ServiceDescriptor {
            id: "svc1".to_owned(),
            name: "web".to_owned(),
            labels: Default::default(),
            ports: vec![ServicePort {
                published_port: Some(80),
                target_port: Some(8080),
                proto: Protocol::Tcp,
                publish_mode: PublishMode::Host,
            }],
        };
        let container = container_with_address("task1", "2a0e::1");

        let config = test_config();
        let buckets = derive(
            &OwnerDescriptor::Service(service, vec![container]),
            &config,
            |_| {},
            |_| {},
        );
        assert!(buckets["svc1"].is_empty());
    }

    fn test_chains() -> ReconcileChains {
        ReconcileChains {
            fwd6: "DOCKER_IPV6FW_FORWARD".to_owned(),
            nat6: "DOCKER_IPV6FW_NAT".to_owned(),
        }
    }

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn reconcile_owner_appends_rules_once_and_is_a_noop_on_replay() {
        use crate::inventory::fake::FakeInventory;
        use crate::iptables::IPTablesLogger;

        let inventory = FakeInventory::new();
        let driver = IPTablesLogger::new();
        let mut reconciler = Reconciler::new(
            &inventory,
            &driver,
            test_chains(),
            test_config(),
            test_logger(),
        );

        let container = container_with_address("c1", "2a0e::99");
        reconciler
            .reconcile_owner(&OwnerDescriptor::Container(container.clone()))
            .unwrap();
        assert!(reconciler.ledger().owners().contains("c1"));

        let calls_after_first = driver.logs().len();
        reconciler
            .reconcile_owner(&OwnerDescriptor::Container(container))
            .unwrap();
        assert_eq!(
            driver.logs().len(),
            calls_after_first,
            "re-reconciling an unchanged owner must not issue any driver calls"
        );
    }

    #[test]
    fn update_in_place_only_appends_the_new_port() {
        use crate::inventory::fake::FakeInventory;
        use crate::iptables::IPTablesLogger;

        let inventory = FakeInventory::new();
        let driver = IPTablesLogger::new();
        let mut reconciler = Reconciler::new(
            &inventory,
            &driver,
            test_chains(),
            test_config(),
            test_logger(),
        );

        let mut container = container_with_address("c1", "2a0e::99");
        container.published_ports.push(PublishedPort {
            container_port: 80,
            host_port: Some(80),
            proto: Protocol::Tcp,
        });
        reconciler
            .reconcile_owner(&OwnerDescriptor::Container(container.clone()))
            .unwrap();

        container.published_ports.push(PublishedPort {
            container_port: 443,
            host_port: Some(443),
            proto: Protocol::Udp,
        });
        let calls_before = driver.logs().len();
        reconciler
            .reconcile_owner(&OwnerDescriptor::Container(container))
            .unwrap();

        let new_calls = &driver.logs()[calls_before..];
        let appends: Vec<_> = new_calls
            .iter()
            .filter(|(function, _)| function == "append_unique")
            .collect();
        let deletes: Vec<_> = new_calls
            .iter()
            .filter(|(function, _)| function == "delete")
            .collect();
        assert_eq!(appends.len(), 1, "expected exactly one new rule appended");
        assert!(deletes.is_empty(), "update in place must not delete the untouched rule");
    }

    #[test]
    fn sweep_drops_rules_for_owners_no_longer_reported_live() {
        use crate::inventory::fake::FakeInventory;
        use crate::iptables::IPTablesLogger;

        let inventory = FakeInventory::new();
        let driver = IPTablesLogger::new();
        let mut reconciler = Reconciler::new(
            &inventory,
            &driver,
            test_chains(),
            test_config(),
            test_logger(),
        );

        let container = container_with_address("c1", "2a0e::99");
        inventory.set_containers(vec![container.clone()]);
        reconciler
            .reconcile_owner(&OwnerDescriptor::Container(container))
            .unwrap();
        assert!(reconciler.ledger().owners().contains("c1"));

        // The container has disappeared from the inventory by the next sweep.
        inventory.set_containers(vec![]);
        reconciler.sweep().unwrap();

        assert!(!reconciler.ledger().owners().contains("c1"));
    }

    #[test]
    fn teardown_all_empties_the_ledger_and_deletes_every_tracked_rule() {
        use crate::inventory::fake::FakeInventory;
        use crate::iptables::IPTablesLogger;

        let inventory = FakeInventory::new();
        let driver = IPTablesLogger::new();
        let mut reconciler = Reconciler::new(
            &inventory,
            &driver,
            test_chains(),
            test_config(),
            test_logger(),
        );

        let mut container = container_with_address("c1", "2a0e::99");
        container.published_ports.push(PublishedPort {
            container_port: 80,
            host_port: Some(8080),
            proto: Protocol::Tcp,
        });
        reconciler
            .reconcile_owner(&OwnerDescriptor::Container(container))
            .unwrap();
        assert!(!reconciler.ledger().owners().is_empty());

        reconciler.teardown_all().unwrap();

        assert!(reconciler.ledger().owners().is_empty());
        let deletes = driver
            .logs()
            .into_iter()
            .filter(|(function, _)| function == "delete")
            .count();
        assert!(deletes >= 2, "expected both the forward and NAT rule to be deleted");
    }
}
