// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest firewall rules for one hypervisor
//!
//! Renders an nftables ruleset with one chain per guest hosted on the
//! hypervisor, built from the rules of the guest's firewall group and ending
//! in a drop.  Guests without a group are not filtered; guests whose group
//! is unknown get only the drop.  An event that contradicts the mirror is
//! logged and dropped.

use crate::mirror::IntegrationError;
use crate::mirror::Mirror;
use crate::reconciler::Integrator;
use crate::reconciler::OnInconsistency;
use crate::reconciler::Rendered;
use async_trait::async_trait;
use corral_kv::WatchEvent;
use corral_store::FWGroup;
use corral_store::FWRule;
use corral_store::Guest;
use corral_store::Protocol;
use corral_store::RuleAction;
use corral_store::Store;
use std::fmt::Write;
use uuid::Uuid;

pub const RULESET: &str = "ruleset";

const TABLE: &str = "inet corral";

/// Key of the lock held by the daemon generating rules for `hypervisor`
pub fn lock_key(root: &str, hypervisor: Uuid) -> String {
    format!("{}/fwd/{}/lock", root.trim_end_matches('/'), hypervisor)
}

pub struct FirewallIntegrator {
    hypervisor: Uuid,
    guests: Mirror<Guest>,
    groups: Mirror<FWGroup>,
}

impl FirewallIntegrator {
    pub fn new(root: &str, hypervisor: Uuid) -> FirewallIntegrator {
        FirewallIntegrator {
            hypervisor,
            guests: Mirror::new(root),
            groups: Mirror::new(root),
        }
    }

    fn is_local(&self, guest: Option<&Guest>) -> bool {
        guest.map_or(false, |g| g.hypervisor_id == Some(self.hypervisor))
    }

    fn local_guests(&self) -> impl Iterator<Item = &Guest> {
        self.guests.iter().filter(|g| self.is_local(Some(g)))
    }

    fn render_ruleset(&self) -> String {
        let guests: Vec<_> =
            self.local_guests().filter(|g| g.fwgroup_id.is_some()).collect();

        // Declaring the table first makes the delete succeed on a host that
        // does not have it yet.
        let mut out = format!(
            "# generated by corral-fwd for hypervisor {}\n\
             table {TABLE}\n\
             delete table {TABLE}\n\
             \n\
             table {TABLE} {{\n\
             \tchain forward {{\n\
             \t\ttype filter hook forward priority 0; policy accept;\n",
            self.hypervisor
        );
        for guest in &guests {
            if let Some(ip) = guest.ip {
                let _ = writeln!(
                    out,
                    "\t\tip daddr {ip} jump {}",
                    chain_name(guest.id)
                );
            }
        }
        out.push_str("\t}\n");

        for guest in guests {
            if guest.ip.is_none() {
                continue;
            }
            let _ = write!(
                out,
                "\n\tchain {} {{\n\
                 \t\tct state established,related accept\n",
                chain_name(guest.id)
            );
            let rules = guest
                .fwgroup_id
                .and_then(|id| self.groups.get(&id.to_string()))
                .map(|group| group.rules.as_slice())
                .unwrap_or_default();
            for rule in rules {
                let _ = writeln!(out, "\t\t{}", rule_statement(rule));
            }
            out.push_str("\t\tdrop\n\t}\n");
        }
        out.push_str("}\n");
        out
    }
}

fn chain_name(guest: Uuid) -> String {
    format!("guest-{}", guest)
}

fn rule_statement(rule: &FWRule) -> String {
    let mut parts = Vec::new();
    if !rule.source.is_empty() {
        parts.push(format!("ip saddr {}", rule.source));
    }
    match rule.protocol {
        Protocol::Icmp => parts.push(String::from("meta l4proto icmp")),
        proto if rule.port_end == 0 => {
            parts.push(format!("meta l4proto {}", proto))
        }
        proto if rule.port_start == rule.port_end => {
            parts.push(format!("{} dport {}", proto, rule.port_start))
        }
        proto => parts.push(format!(
            "{} dport {}-{}",
            proto, rule.port_start, rule.port_end
        )),
    }
    parts.push(String::from(match rule.action {
        RuleAction::Allow => "accept",
        RuleAction::Drop => "drop",
    }));
    parts.join(" ")
}

#[async_trait]
impl Integrator for FirewallIntegrator {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn prefixes(&self, store: &Store) -> Vec<String> {
        vec![store.prefix::<Guest>(), store.prefix::<FWGroup>()]
    }

    fn on_inconsistency(&self) -> OnInconsistency {
        OnInconsistency::Skip
    }

    async fn fetch_all(
        &mut self,
        store: &Store,
    ) -> Result<(), corral_store::Error> {
        let guests = store.fetch_all::<Guest>().await?;
        let groups = store.fetch_all::<FWGroup>().await?;
        let through = store.head_index().await?;
        self.guests.replace_all(guests, through);
        self.groups.replace_all(groups, through);
        Ok(())
    }

    /// Every guest and group is mirrored, but only changes that touch a
    /// guest on this hypervisor call for new rules.
    fn integrate_event(
        &mut self,
        event: &WatchEvent,
    ) -> Result<bool, IntegrationError> {
        if self.guests.covers(event) {
            let Some(change) = self.guests.apply(event)? else {
                return Ok(false);
            };
            return Ok(self.is_local(change.before.as_ref())
                || self.is_local(change.after.as_ref()));
        }
        if self.groups.covers(event) {
            let Some(change) = self.groups.apply(event)? else {
                return Ok(false);
            };
            let group = change.before.or(change.after).map(|g| g.id);
            return Ok(self
                .local_guests()
                .any(|g| g.fwgroup_id.is_some() && g.fwgroup_id == group));
        }
        Ok(false)
    }

    fn render(&self) -> Vec<Rendered> {
        vec![Rendered { name: RULESET, contents: self.render_ruleset() }]
    }
}
