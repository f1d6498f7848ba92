// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DHCP host reservations
//!
//! Renders ISC dhcpd `host` declarations for every hypervisor and for every
//! guest with an address, into one file each.  A guest's netmask and router
//! come from its subnet.  An event that contradicts the mirror makes the
//! daemon load everything again.

use crate::mirror::IntegrationError;
use crate::mirror::Mirror;
use crate::reconciler::Integrator;
use crate::reconciler::OnInconsistency;
use crate::reconciler::Rendered;
use async_trait::async_trait;
use corral_kv::WatchEvent;
use corral_store::Guest;
use corral_store::Hypervisor;
use corral_store::Store;
use corral_store::Subnet;
use std::fmt::Write;
use std::net::Ipv4Addr;

pub const HYPERVISORS: &str = "hypervisors";
pub const GUESTS: &str = "guests";

/// Key of the lock that keeps DHCP generation to one daemon at a time
pub fn lock_key(root: &str) -> String {
    format!("{}/dhcpd/lock", root.trim_end_matches('/'))
}

pub struct DhcpIntegrator {
    hypervisors: Mirror<Hypervisor>,
    guests: Mirror<Guest>,
    subnets: Mirror<Subnet>,
}

impl DhcpIntegrator {
    pub fn new(root: &str) -> DhcpIntegrator {
        DhcpIntegrator {
            hypervisors: Mirror::new(root),
            guests: Mirror::new(root),
            subnets: Mirror::new(root),
        }
    }

    fn render_hypervisors(&self) -> String {
        let mut out = String::from(HEADER);
        for hv in self.hypervisors.iter() {
            host(
                &mut out,
                &format!("hypervisor-{}", hv.id),
                &hv.mac,
                hv.ip,
                hv.netmask,
                hv.gateway,
            );
        }
        out
    }

    fn render_guests(&self) -> String {
        let mut out = String::from(HEADER);
        for guest in self.guests.iter() {
            let (Some(ip), Some(subnet_id)) = (guest.ip, guest.subnet_id)
            else {
                continue;
            };
            if guest.mac.is_empty() {
                continue;
            }
            let Some(subnet) = self.subnets.get(&subnet_id.to_string()) else {
                continue;
            };
            let Ok((_, netmask)) = subnet.network() else {
                continue;
            };
            host(
                &mut out,
                &format!("guest-{}", guest.id),
                &guest.mac,
                ip,
                netmask,
                subnet.gateway,
            );
        }
        out
    }
}

const HEADER: &str = "# generated by corral-dhcpd; changes will be lost\n";

fn host(
    out: &mut String,
    name: &str,
    mac: &str,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
) {
    // Writing to a String cannot fail.
    let _ = write!(
        out,
        "\nhost {name} {{\n\
         \thardware ethernet {mac};\n\
         \tfixed-address {ip};\n\
         \toption subnet-mask {netmask};\n\
         \toption routers {gateway};\n\
         }}\n"
    );
}

#[async_trait]
impl Integrator for DhcpIntegrator {
    fn name(&self) -> &'static str {
        "dhcp"
    }

    fn prefixes(&self, store: &Store) -> Vec<String> {
        vec![
            store.prefix::<Hypervisor>(),
            store.prefix::<Guest>(),
            store.prefix::<Subnet>(),
        ]
    }

    fn on_inconsistency(&self) -> OnInconsistency {
        OnInconsistency::Refetch
    }

    async fn fetch_all(
        &mut self,
        store: &Store,
    ) -> Result<(), corral_store::Error> {
        let hypervisors = store.fetch_all::<Hypervisor>().await?;
        let guests = store.fetch_all::<Guest>().await?;
        let subnets = store.fetch_all::<Subnet>().await?;
        let through = store.head_index().await?;
        self.hypervisors.replace_all(hypervisors, through);
        self.guests.replace_all(guests, through);
        self.subnets.replace_all(subnets, through);
        Ok(())
    }

    fn integrate_event(
        &mut self,
        event: &WatchEvent,
    ) -> Result<bool, IntegrationError> {
        let change = if self.hypervisors.covers(event) {
            self.hypervisors.apply(event)?.is_some()
        } else if self.guests.covers(event) {
            self.guests.apply(event)?.is_some()
        } else if self.subnets.covers(event) {
            self.subnets.apply(event)?.is_some()
        } else {
            false
        };
        Ok(change)
    }

    fn render(&self) -> Vec<Rendered> {
        vec![
            Rendered {
                name: HYPERVISORS,
                contents: self.render_hypervisors(),
            },
            Rendered { name: GUESTS, contents: self.render_guests() },
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ArtifactWriter;
    use crate::Config;
    use crate::Outcome;
    use crate::Reconciler;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use corral_common::stats::StatsRegistry;
    use corral_kv::EventKind;
    use corral_store::Entity;
    use corral_store::testing::*;
    use corral_test_utils::dev::test_setup_log;
    use slog::Logger;

    fn reconciler(
        log: &Logger,
        store: &Store,
        dir: &Utf8TempDir,
    ) -> Reconciler<DhcpIntegrator> {
        let artifacts = vec![
            (
                HYPERVISORS,
                ArtifactWriter::new(
                    log,
                    HYPERVISORS,
                    &dir.path().join("hypervisors.conf"),
                ),
            ),
            (
                GUESTS,
                ArtifactWriter::new(
                    log,
                    GUESTS,
                    &dir.path().join("guests.conf"),
                ),
            ),
        ];
        Reconciler::new(
            log,
            store.clone(),
            DhcpIntegrator::new(store.root()),
            artifacts,
            StatsRegistry::new(),
            &Config::default(),
        )
    }

    #[tokio::test]
    async fn test_dhcp_follows_changes() {
        let logctx = test_setup_log("test_dhcp_follows_changes");
        let dir = Utf8TempDir::new().unwrap();
        let store = store(&logctx.log);
        let mut hv = hypervisor(8, 8192);
        store.save(&mut hv).await.unwrap();
        let mut subnet = subnet();
        store.save(&mut subnet).await.unwrap();

        let mut reconciler = reconciler(&logctx.log, &store, &dir);
        reconciler.start().await.unwrap();
        let hosts =
            std::fs::read_to_string(dir.path().join("hypervisors.conf"))
                .unwrap();
        assert!(hosts.contains(&format!("host hypervisor-{} {{", hv.id)));
        assert!(hosts.contains("fixed-address 10.0.0.10;"));

        let mut guest = guest(&subnet, Ipv4Addr::new(10, 10, 0, 20));
        store.save(&mut guest).await.unwrap();
        assert_eq!(
            reconciler.step().await.unwrap(),
            Some(Outcome::Regenerated)
        );
        let guests =
            std::fs::read_to_string(dir.path().join("guests.conf")).unwrap();
        assert!(guests.contains(&format!("host guest-{} {{", guest.id)));
        assert!(guests.contains("fixed-address 10.10.0.20;"));
        assert!(guests.contains("option subnet-mask 255.255.255.0;"));
        assert!(guests.contains("option routers 10.10.0.1;"));

        // Saving an identical body changes nothing.
        store.save(&mut guest).await.unwrap();
        assert_eq!(reconciler.step().await.unwrap(), Some(Outcome::Ignored));

        // A heartbeat is not part of the output.
        store
            .hypervisor_heartbeat(hv.id, std::time::Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reconciler.step().await.unwrap(), Some(Outcome::Ignored));

        store.delete::<Guest>(&guest.id).await.unwrap();
        assert_eq!(
            reconciler.step().await.unwrap(),
            Some(Outcome::Regenerated)
        );
        let guests =
            std::fs::read_to_string(dir.path().join("guests.conf")).unwrap();
        assert!(!guests.contains("host guest-"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_dhcp_refetches_when_stale() {
        let logctx = test_setup_log("test_dhcp_refetches_when_stale");
        let dir = Utf8TempDir::new().unwrap();
        let store = store(&logctx.log);
        let mut subnet = subnet();
        store.save(&mut subnet).await.unwrap();

        let mut reconciler = reconciler(&logctx.log, &store, &dir);
        reconciler.start().await.unwrap();
        let mut guest = guest(&subnet, Ipv4Addr::new(10, 10, 0, 30));
        store.save(&mut guest).await.unwrap();

        // An update for an object the mirror never saw means the mirror is
        // out of date.  Reloading also picks up the guest saved above.
        let other = Guest::new(guest.flavor_id);
        let stale = WatchEvent {
            key: Guest::key(store.root(), &other.id),
            kind: EventKind::Update,
            value: Some(serde_json::to_string(&other).unwrap()),
            index: store.head_index().await.unwrap() + 100,
        };
        assert_eq!(
            reconciler.handle_event(&stale).await.unwrap(),
            Outcome::Refetched
        );
        let guests =
            std::fs::read_to_string(dir.path().join("guests.conf")).unwrap();
        assert!(guests.contains(&format!("host guest-{} {{", guest.id)));
        assert_matches!(
            reconciler.integrator().guests.get(&other.id.to_string()),
            None
        );

        // The guest's create event, still queued, repeats what the reload
        // already found.
        assert_eq!(reconciler.step().await.unwrap(), Some(Outcome::Ignored));
        logctx.cleanup_successful();
    }

    /// Events queued while a reload runs are already part of it and must
    /// not set off one reload after another.
    #[tokio::test]
    async fn test_dhcp_reloads_once() {
        let logctx = test_setup_log("test_dhcp_reloads_once");
        let dir = Utf8TempDir::new().unwrap();
        let store = store(&logctx.log);
        let mut subnet = subnet();
        store.save(&mut subnet).await.unwrap();

        let mut reconciler = reconciler(&logctx.log, &store, &dir);
        reconciler.start().await.unwrap();
        let mut guests = Vec::new();
        for i in 0..5 {
            let mut guest = guest(&subnet, Ipv4Addr::new(10, 10, 0, 40 + i));
            store.save(&mut guest).await.unwrap();
            guests.push(guest);
        }

        let missed = Guest::new(guests[0].flavor_id);
        let stale = WatchEvent {
            key: Guest::key(store.root(), &missed.id),
            kind: EventKind::Delete,
            value: None,
            index: store.head_index().await.unwrap() + 100,
        };
        assert_eq!(
            reconciler.handle_event(&stale).await.unwrap(),
            Outcome::Refetched
        );
        let mut outcomes = Vec::new();
        for _ in &guests {
            outcomes.push(reconciler.step().await.unwrap().unwrap());
        }
        assert_eq!(outcomes, vec![Outcome::Ignored; guests.len()]);

        let hosts =
            std::fs::read_to_string(dir.path().join("guests.conf")).unwrap();
        for guest in &guests {
            assert!(hosts.contains(&format!("host guest-{} {{", guest.id)));
        }
        logctx.cleanup_successful();
    }
}
