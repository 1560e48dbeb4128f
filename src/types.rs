// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Data model shared by the [`ledger`](../ledger/index.html) and
//! [`reconcile`](../reconcile/index.html) modules: rule tuples, owner identities, and the
//! inventory descriptors the Reconciler derives rules from.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// IP protocol carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// The lowercase name iptables expects on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// An ACCEPT rule in the forward chain of one address family, admitting traffic for a single
/// container/service port.
///
/// `owner_label` is informational only (used for logging) and deliberately excluded from
/// equality, hashing and ordering, so relabeling an otherwise-identical rule is not seen as a
/// change by the [`Ledger`](../ledger/struct.Ledger.html).
#[derive(Debug, Clone)]
pub struct ForwardRule {
    /// Id of the container or service this rule is attributed to.
    pub owner_id: String,
    /// Human-readable name of the owner, for logging.
    pub owner_label: String,
    /// Protocol to match.
    pub proto: Protocol,
    /// Destination IPv6/IPv4 address to match.
    pub dst_addr: String,
    /// Destination port to match.
    pub dport: u16,
    /// Interface the packet must arrive on.
    pub in_iface: String,
    /// Interface the packet must be forwarded out of.
    pub out_iface: String,
}

impl ForwardRule {
    fn key(&self) -> (&str, Protocol, &str, u16, &str, &str) {
        (
            &self.owner_id,
            self.proto,
            &self.dst_addr,
            self.dport,
            &self.in_iface,
            &self.out_iface,
        )
    }
}

impl PartialEq for ForwardRule {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ForwardRule {}

impl Hash for ForwardRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ForwardRule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ForwardRule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A DNAT rule in the IPv6 NAT chain, rewriting `[dst_addr]:published_port` to
/// `[dst_addr]:target_port`. Every `NatRule` is paired with a companion
/// [`ForwardRule`](struct.ForwardRule.html) whose `dport` equals `published_port`.
#[derive(Debug, Clone)]
pub struct NatRule {
    /// Id of the container or service this rule is attributed to.
    pub owner_id: String,
    /// Human-readable name of the owner, for logging.
    pub owner_label: String,
    /// Protocol to match.
    pub proto: Protocol,
    /// Destination address to match and rewrite to.
    pub dst_addr: String,
    /// Port as seen by the outside world.
    pub published_port: u16,
    /// Port the packet is rewritten to before reaching the container.
    pub target_port: u16,
    /// Interface the packet must arrive on.
    pub in_iface: String,
}

impl NatRule {
    fn key(&self) -> (&str, Protocol, &str, u16, u16, &str) {
        (
            &self.owner_id,
            self.proto,
            &self.dst_addr,
            self.published_port,
            self.target_port,
            &self.in_iface,
        )
    }

    /// The companion [`ForwardRule`](struct.ForwardRule.html) required by the invariant in §3:
    /// "for every NatRule there exists a matching ForwardRule with the same
    /// `(owner_id, proto, dst_addr, published_port, in_iface, out_iface)`".
    pub fn companion_forward_rule(&self, out_iface: &str) -> ForwardRule {
        ForwardRule {
            owner_id: self.owner_id.clone(),
            owner_label: self.owner_label.clone(),
            proto: self.proto,
            dst_addr: self.dst_addr.clone(),
            dport: self.published_port,
            in_iface: self.in_iface.clone(),
            out_iface: out_iface.to_owned(),
        }
    }
}

impl PartialEq for NatRule {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for NatRule {}

impl Hash for NatRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for NatRule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NatRule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A `NatRule` together with its mandatory companion `ForwardRule`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NatRulePair {
    /// The DNAT rule.
    pub nat: NatRule,
    /// The companion ACCEPT rule.
    pub forward: ForwardRule,
}

/// The complete set of rules attributed to one owner bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    /// Plain ACCEPT rules (no DNAT involved).
    pub forward: BTreeSet<ForwardRule>,
    /// DNAT rule pairs.
    pub nat: BTreeSet<NatRulePair>,
}

impl RuleSet {
    /// True if this bucket has no rules at all.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.nat.is_empty()
    }

    /// Number of concrete kernel rules this bucket represents (every `NatRulePair` counts as two:
    /// the DNAT rule and its companion ACCEPT rule).
    pub fn rule_count(&self) -> usize {
        self.forward.len() + self.nat.len() * 2
    }
}

/// A port published from a container to the host, in either of the two representations the
/// container runtime can report: an explicit `HostConfig.PortBindings` entry, or a
/// `NetworkSettings.Ports` entry (used as a fallback when no explicit binding exists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host, if one has actually been bound (`HostPort == 0` or absent means "no
    /// binding", per §8 scenario 2).
    pub host_port: Option<u16>,
    /// Protocol.
    pub proto: Protocol,
}

/// A single IPv6-capable network a container or task is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedNetwork {
    /// Name of the Docker network.
    pub name: String,
    /// Network driver, e.g. `macvlan`, `bridge`, `overlay`.
    pub driver: String,
    /// The container's global IPv6 address on this network, if any.
    pub global_ipv6_address: Option<String>,
}

/// Snapshot of a single running container, as reported by the Inventory Source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerDescriptor {
    /// Full container id.
    pub id: String,
    /// Container name (for logging).
    pub name: String,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// Ports published via `HostConfig.PortBindings` or `NetworkSettings.Ports`.
    pub published_ports: Vec<PublishedPort>,
    /// Networks the container is attached to.
    pub networks: Vec<AttachedNetwork>,
}

/// The publish mode of a single service port entry, as reported by the container orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// The port is published on every node in the cluster (`ingress` mode).
    Ingress,
    /// The port is only reachable directly on the node running the task (`host` mode).
    Host,
}

/// A single entry of a cluster service's published-port list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    /// Port as seen by clients outside the cluster.
    pub published_port: Option<u16>,
    /// Port the task listens on.
    pub target_port: Option<u16>,
    /// Protocol.
    pub proto: Protocol,
    /// Publish mode; only `Ingress` entries contribute rules (§4.4.2.c).
    pub publish_mode: PublishMode,
}

/// Snapshot of a cluster service, as reported by the Inventory Source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceDescriptor {
    /// Cluster-assigned service id.
    pub id: String,
    /// Service name (for logging).
    pub name: String,
    /// Service labels (used for the custom-port label, same grammar as on containers).
    pub labels: BTreeMap<String, String>,
    /// Published-port list.
    pub ports: Vec<ServicePort>,
}

/// The full descriptor the Reconciler derives a rule set from: either a container, or a service
/// together with the containers currently backing its tasks (already resolved by the Inventory
/// Source, including the label-based fallback described in §4.4.2.c).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerDescriptor {
    /// A single running container.
    Container(ContainerDescriptor),
    /// A cluster service and the containers currently backing it.
    Service(ServiceDescriptor, Vec<ContainerDescriptor>),
}

impl OwnerDescriptor {
    /// The owner id this descriptor is keyed by in the Ledger.
    pub fn owner_id(&self) -> &str {
        match self {
            OwnerDescriptor::Container(c) => &c.id,
            OwnerDescriptor::Service(s, _) => &s.id,
        }
    }

    /// A human-readable label for logging.
    pub fn owner_label(&self) -> &str {
        match self {
            OwnerDescriptor::Container(c) => &c.name,
            OwnerDescriptor::Service(s, _) => &s.name,
        }
    }
}

/// A lifecycle event emitted by the Inventory Source, in source order per owner (§5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A container started, or an already-running container's observable state changed.
    ContainerStart(ContainerDescriptor),
    /// A container stopped or was removed.
    ContainerStop(String),
    /// A cluster service was created or updated.
    ServiceUpdate(ServiceDescriptor, Vec<ContainerDescriptor>),
    /// A cluster service was removed.
    ServiceRemove(String),
}

/// The three owner-bucket suffixes a container may occupy in the Ledger (§3).
pub enum ContainerBucket {
    /// Plain exposed ports: `<container-id>`.
    Plain,
    /// Host-port-mapped publications: `<container-id>_public`.
    Public,
    /// Label-declared custom ports: `<container-id>_custom`.
    Custom,
}

impl ContainerBucket {
    /// Build the owner key for `container_id` in this bucket.
    pub fn owner_key(&self, container_id: &str) -> String {
        match self {
            ContainerBucket::Plain => container_id.to_owned(),
            ContainerBucket::Public => format!("{}_public", container_id),
            ContainerBucket::Custom => format!("{}_custom", container_id),
        }
    }
}
