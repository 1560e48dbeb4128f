// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The in-memory desired-state store.
//!
//! The Ledger is a single-writer structure: only the [`Reconciler`](../reconcile/index.html)
//! mutates it. Other workers may only observe it through [`Ledger::list`] or [`Ledger::owners`].
//! It performs no I/O.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ForwardRule, NatRulePair, RuleSet};

/// Two mappings keyed by owner bucket id: plain ACCEPT rules and NAT rule pairs.
#[derive(Debug, Default)]
pub struct Ledger {
    forward_rules: BTreeMap<String, BTreeSet<ForwardRule>>,
    service_rules: BTreeMap<String, BTreeSet<NatRulePair>>,
}

impl Ledger {
    /// An empty ledger.
    pub fn new() -> Self {
        Ledger::default()
    }

    /// The current rule set attributed to `owner_id`, or an empty one if untracked.
    pub fn get(&self, owner_id: &str) -> RuleSet {
        RuleSet {
            forward: self
                .forward_rules
                .get(owner_id)
                .cloned()
                .unwrap_or_default(),
            nat: self.service_rules.get(owner_id).cloned().unwrap_or_default(),
        }
    }

    /// Compare `new_rules` against the owner's current set by structural equality, returning
    /// `(to_add, to_remove)` as two disjoint rule sets.
    pub fn diff(&self, owner_id: &str, new_rules: &RuleSet) -> (RuleSet, RuleSet) {
        let old = self.get(owner_id);

        let to_add = RuleSet {
            forward: new_rules
                .forward
                .difference(&old.forward)
                .cloned()
                .collect(),
            nat: new_rules.nat.difference(&old.nat).cloned().collect(),
        };
        let to_remove = RuleSet {
            forward: old
                .forward
                .difference(&new_rules.forward)
                .cloned()
                .collect(),
            nat: old.nat.difference(&new_rules.nat).cloned().collect(),
        };

        (to_add, to_remove)
    }

    /// Atomically overwrite `owner_id`'s entry with `new_rules`. An empty `new_rules` removes the
    /// entry entirely rather than leaving an empty one behind.
    pub fn replace(&mut self, owner_id: &str, new_rules: RuleSet) {
        if new_rules.forward.is_empty() {
            self.forward_rules.remove(owner_id);
        } else {
            self.forward_rules
                .insert(owner_id.to_owned(), new_rules.forward);
        }
        if new_rules.nat.is_empty() {
            self.service_rules.remove(owner_id);
        } else {
            self.service_rules.insert(owner_id.to_owned(), new_rules.nat);
        }
    }

    /// Remove `owner_id`'s entry entirely, returning whatever rule set it held.
    pub fn drop(&mut self, owner_id: &str) -> RuleSet {
        let forward = self.forward_rules.remove(owner_id).unwrap_or_default();
        let nat = self.service_rules.remove(owner_id).unwrap_or_default();
        RuleSet { forward, nat }
    }

    /// The set of currently tracked owner ids, across both rule families.
    pub fn owners(&self) -> BTreeSet<String> {
        self.forward_rules
            .keys()
            .chain(self.service_rules.keys())
            .cloned()
            .collect()
    }

    /// Total number of concrete kernel rules tracked across all owners.
    pub fn count(&self) -> usize {
        self.forward_rules.values().map(BTreeSet::len).sum::<usize>()
            + self.service_rules.values().map(|s| s.len() * 2).sum::<usize>()
    }

    /// A snapshot of every tracked owner's rule set, for observability.
    pub fn list(&self) -> BTreeMap<String, RuleSet> {
        self.owners()
            .into_iter()
            .map(|owner_id| {
                let rules = self.get(&owner_id);
                (owner_id, rules)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NatRule, Protocol};

    fn fwd(owner: &str, port: u16) -> ForwardRule {
        ForwardRule {
            owner_id: owner.to_owned(),
            owner_label: owner.to_owned(),
            proto: Protocol::Tcp,
            dst_addr: "2a0e::99".to_owned(),
            dport: port,
            in_iface: "eth0".to_owned(),
            out_iface: "eth1".to_owned(),
        }
    }

    fn nat_pair(owner: &str, published: u16, target: u16) -> NatRulePair {
        let nat = NatRule {
            owner_id: owner.to_owned(),
            owner_label: owner.to_owned(),
            proto: Protocol::Tcp,
            dst_addr: "2a0e::99".to_owned(),
            published_port: published,
            target_port: target,
            in_iface: "eth0".to_owned(),
        };
        let forward = nat.companion_forward_rule("eth1");
        NatRulePair { nat, forward }
    }

    #[test]
    fn diff_on_empty_ledger_adds_everything() {
        let ledger = Ledger::new();
        let mut new_rules = RuleSet::default();
        new_rules.forward.insert(fwd("c1", 80));

        let (to_add, to_remove) = ledger.diff("c1", &new_rules);
        assert_eq!(to_add.forward.len(), 1);
        assert!(to_remove.forward.is_empty());
    }

    #[test]
    fn replace_then_diff_is_noop() {
        let mut ledger = Ledger::new();
        let mut rules = RuleSet::default();
        rules.forward.insert(fwd("c1", 80));
        ledger.replace("c1", rules.clone());

        let (to_add, to_remove) = ledger.diff("c1", &rules);
        assert!(to_add.forward.is_empty());
        assert!(to_remove.forward.is_empty());
    }

    #[test]
    fn update_in_place_adds_only_the_new_port() {
        let mut ledger = Ledger::new();
        let mut old = RuleSet::default();
        old.forward.insert(fwd("c1", 80));
        ledger.replace("c1", old);

        let mut new_rules = RuleSet::default();
        new_rules.forward.insert(fwd("c1", 80));
        new_rules.forward.insert(fwd("c1", 443));

        let (to_add, to_remove) = ledger.diff("c1", &new_rules);
        assert_eq!(to_add.forward.len(), 1);
        assert_eq!(to_add.forward.iter().next().unwrap().dport, 443);
        assert!(to_remove.forward.is_empty());
    }

    #[test]
    fn replace_with_empty_set_drops_the_entry() {
        let mut ledger = Ledger::new();
        let mut rules = RuleSet::default();
        rules.forward.insert(fwd("c1", 80));
        ledger.replace("c1", rules);
        assert!(ledger.owners().contains("c1"));

        ledger.replace("c1", RuleSet::default());
        assert!(!ledger.owners().contains("c1"));
    }

    #[test]
    fn drop_returns_and_removes_the_owners_rules() {
        let mut ledger = Ledger::new();
        let mut rules = RuleSet::default();
        rules.forward.insert(fwd("c1", 80));
        rules.nat.insert(nat_pair("c1", 443, 8443));
        ledger.replace("c1", rules);

        let dropped = ledger.drop("c1");
        assert_eq!(dropped.forward.len(), 1);
        assert_eq!(dropped.nat.len(), 1);
        assert!(ledger.owners().is_empty());
    }

    #[test]
    fn count_counts_nat_pairs_twice() {
        let mut ledger = Ledger::new();
        let mut rules = RuleSet::default();
        rules.forward.insert(fwd("c1", 80));
        rules.nat.insert(nat_pair("c1", 443, 8443));
        ledger.replace("c1", rules);

        assert_eq!(ledger.count(), 3);
    }

    #[test]
    fn stale_owner_diff_removes_everything() {
        let mut ledger = Ledger::new();
        let mut rules = RuleSet::default();
        rules.forward.insert(fwd("c1", 80));
        ledger.replace("c1", rules);

        let (to_add, to_remove) = ledger.diff("c1", &RuleSet::default());
        assert!(to_add.forward.is_empty());
        assert_eq!(to_remove.forward.len(), 1);
    }
}
