// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to cluster state
//!
//! Every object is read together with its version (the key's modification
//! index) and written back with compare-and-swap against that version, so a
//! save that races with another writer fails with [`Error::Conflict`] rather
//! than silently overwriting the other write.  Objects that have never been
//! saved (version 0) are written with create-if-absent.

mod entity;
mod error;
mod job;
pub mod keys;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use entity::*;
pub use error::Error;
pub use job::actions;
pub use job::Job;
pub use job::JobStatus;

use corral_kv::KvStore;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How often a read-modify-write of hypervisor resources is retried when
/// another placer gets there first
const RESOURCE_CAS_ATTEMPTS: usize = 10;

/// Default lifetime of a job record
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Handle on the cluster state stored under one key root
#[derive(Clone)]
pub struct Store {
    log: Logger,
    kv: Arc<dyn KvStore>,
    root: String,
    job_ttl: Duration,
}

impl Store {
    pub fn new(
        log: &Logger,
        kv: Arc<dyn KvStore>,
        root: &str,
        job_ttl: Duration,
    ) -> Store {
        let root = root.trim_end_matches('/').to_string();
        Store {
            log: log.new(o!("component" => "Store", "root" => root.clone())),
            kv,
            root,
            job_ttl,
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Key prefix under which all objects of type `E` live
    pub fn prefix<E: Entity>(&self) -> String {
        format!("{}/{}", self.root, E::KIND)
    }

    pub async fn fetch<E: Entity>(&self, id: &E::Id) -> Result<E, Error> {
        let key = E::key(&self.root, id);
        let value = self.kv.get(&key).await.map_err(|error| {
            if error.is_not_found() {
                Error::NotFound { kind: E::KIND, id: id.to_string() }
            } else {
                Error::from(error)
            }
        })?;
        let mut entity: E = serde_json::from_str(&value.value)
            .map_err(|err| Error::Decode { key, err })?;
        entity.set_version(value.index);
        Ok(entity)
    }

    /// Reload `entity` from the store, discarding local changes.
    pub async fn refresh<E: Entity>(
        &self,
        entity: &mut E,
    ) -> Result<(), Error> {
        *entity = self.fetch(&entity.id()).await?;
        Ok(())
    }

    /// Validate and write `entity`.  On success its version is updated.
    pub async fn save<E: Entity>(&self, entity: &mut E) -> Result<(), Error> {
        self.save_with_ttl(entity, None).await
    }

    async fn save_with_ttl<E: Entity>(
        &self,
        entity: &mut E,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        entity.validate()?;
        let id = entity.id();
        let key = E::key(&self.root, &id);
        let body = serde_json::to_string(entity).map_err(|err| {
            Error::Encode { kind: E::KIND, id: id.to_string(), err }
        })?;
        let result = match entity.version() {
            0 => self.kv.create(&key, &body, ttl).await,
            version => {
                self.kv.compare_and_swap(&key, &body, ttl, version).await
            }
        };
        let index = result.map_err(|error| {
            if error.is_conflict() {
                Error::Conflict { kind: E::KIND, id: id.to_string() }
            } else if error.is_not_found() {
                Error::NotFound { kind: E::KIND, id: id.to_string() }
            } else {
                Error::from(error)
            }
        })?;
        debug!(self.log, "saved object";
            "kind" => E::KIND,
            "id" => %id,
            "version" => index,
        );
        entity.set_version(index);
        Ok(())
    }

    /// Remove the object with `id` and everything stored below it.
    pub async fn delete<E: Entity>(&self, id: &E::Id) -> Result<(), Error> {
        match self.kv.delete(&E::dir(&self.root, id), true).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => {
                Err(Error::NotFound { kind: E::KIND, id: id.to_string() })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Returns the IDs of all objects of type `E`.
    pub async fn list_ids<E: Entity>(&self) -> Result<Vec<E::Id>, Error> {
        let nodes = match self.kv.list(&self.prefix::<E>()).await {
            Ok(nodes) => nodes,
            Err(error) if error.is_not_found() => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let mut ids = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match node.name().parse::<E::Id>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(self.log, "ignoring unexpected key";
                    "key" => &node.key),
            }
        }
        Ok(ids)
    }

    /// Loads every object of type `E`.  Objects that disappear while this
    /// runs are skipped.
    pub async fn fetch_all<E: Entity>(&self) -> Result<Vec<E>, Error> {
        let mut all = Vec::new();
        for id in self.list_ids::<E>().await? {
            match self.fetch::<E>(&id).await {
                Ok(entity) => all.push(entity),
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(all)
    }

    /// Returns the index of the most recent change to the store.  Loads that
    /// finished before this call reflect every change up to that index.
    pub async fn head_index(&self) -> Result<u64, Error> {
        Ok(self.kv.head_index().await?)
    }

    // Jobs

    /// Creates and saves a new job in state "new".
    pub async fn job_create(
        &self,
        action: &str,
        guest: Uuid,
    ) -> Result<Job, Error> {
        let mut job = Job::new(action, guest);
        self.job_save(&mut job).await?;
        info!(self.log, "created job";
            "job_id" => %job.id,
            "action" => &job.action,
            "guest_id" => %guest,
        );
        Ok(job)
    }

    /// Saves `job` with the configured job TTL.
    pub async fn job_save(&self, job: &mut Job) -> Result<(), Error> {
        self.save_with_ttl(job, Some(self.job_ttl)).await
    }

    // Hypervisor relationships

    fn link_key(&self, hypervisor: Uuid, what: &str, id: Uuid) -> String {
        format!(
            "{}/{}/{}",
            Hypervisor::dir(&self.root, &hypervisor),
            what,
            id
        )
    }

    async fn links(
        &self,
        hypervisor: Uuid,
        what: &str,
    ) -> Result<Vec<Uuid>, Error> {
        let dir =
            format!("{}/{}", Hypervisor::dir(&self.root, &hypervisor), what);
        match self.kv.list(&dir).await {
            Ok(nodes) => {
                Ok(nodes.iter().filter_map(|n| n.name().parse().ok()).collect())
            }
            Err(error) if error.is_not_found() => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    /// Place `guest` on `hypervisor`.
    ///
    /// The flavor's resources are taken from the hypervisor first, then the
    /// link key is written, and the guest is claimed last (compare-and-swap
    /// of its hypervisor ID), so of two placers racing for the same guest
    /// exactly one succeeds.  A failed step undoes the earlier ones and the
    /// failure is returned; a failure while undoing is only logged.
    pub async fn hypervisor_add_guest(
        &self,
        hypervisor: Uuid,
        guest: &mut Guest,
    ) -> Result<Hypervisor, Error> {
        if let Some(current) = guest.hypervisor_id {
            return Err(Error::AlreadyPlaced {
                guest: guest.id,
                hypervisor: current,
            });
        }
        let flavor: Flavor = self.fetch(&guest.flavor_id).await?;

        let hv = self
            .update_resources(hypervisor, |available| {
                available.checked_sub(&flavor.resources)
            })
            .await?
            .ok_or(Error::InsufficientResources {
                hypervisor,
                guest: guest.id,
            })?;

        let link = self.link_key(hypervisor, "guests", guest.id);
        if let Err(error) = self.kv.set(&link, "", None).await {
            self.release_resources(hypervisor, guest, &flavor).await;
            return Err(error.into());
        }

        guest.hypervisor_id = Some(hypervisor);
        if let Err(error) = self.save(guest).await {
            guest.hypervisor_id = None;
            if let Err(undo) = self.kv.delete(&link, false).await {
                warn!(self.log, "failed to remove link of unplaced guest";
                    "guest_id" => %guest.id,
                    "hypervisor_id" => %hypervisor,
                    "error" => %undo,
                );
            }
            self.release_resources(hypervisor, guest, &flavor).await;
            return Err(error);
        }

        info!(self.log, "placed guest";
            "guest_id" => %guest.id,
            "hypervisor_id" => %hypervisor,
        );
        Ok(hv)
    }

    /// Gives back resources taken by a placement that did not complete.
    async fn release_resources(
        &self,
        hypervisor: Uuid,
        guest: &Guest,
        flavor: &Flavor,
    ) {
        let result = self
            .update_resources(hypervisor, |available| {
                Some(available.saturating_add(&flavor.resources))
            })
            .await;
        if let Err(error) = result {
            warn!(self.log, "failed to return resources of unplaced guest";
                "guest_id" => %guest.id,
                "hypervisor_id" => %hypervisor,
                "error" => %error,
            );
        }
    }

    /// Undo [`Store::hypervisor_add_guest()`]: remove the link, give the
    /// resources back and clear the guest's hypervisor ID.
    pub async fn hypervisor_remove_guest(
        &self,
        guest: &mut Guest,
    ) -> Result<(), Error> {
        let Some(hypervisor) = guest.hypervisor_id else {
            return Ok(());
        };
        self.unlink_guest(hypervisor, guest).await?;
        guest.hypervisor_id = None;
        self.save(guest).await
    }

    async fn unlink_guest(
        &self,
        hypervisor: Uuid,
        guest: &Guest,
    ) -> Result<(), Error> {
        let link = self.link_key(hypervisor, "guests", guest.id);
        match self.kv.delete(&link, false).await {
            Ok(()) => (),
            // already unlinked: the resources went back too
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error.into()),
        }

        let flavor = match self.fetch::<Flavor>(&guest.flavor_id).await {
            Ok(flavor) => flavor,
            Err(error) if error.is_not_found() => {
                warn!(self.log, "flavor gone; not returning resources";
                    "guest_id" => %guest.id,
                    "flavor_id" => %guest.flavor_id,
                );
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        match self
            .update_resources(hypervisor, |available| {
                Some(available.saturating_add(&flavor.resources))
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Applies `update` to the hypervisor's available resources, retrying on
    /// concurrent modification.  Returns `None` if `update` does.
    async fn update_resources<F>(
        &self,
        hypervisor: Uuid,
        update: F,
    ) -> Result<Option<Hypervisor>, Error>
    where
        F: Fn(&Resources) -> Option<Resources> + Send + Sync,
    {
        let mut last_error = None;
        for _ in 0..RESOURCE_CAS_ATTEMPTS {
            let mut hv: Hypervisor = self.fetch(&hypervisor).await?;
            let Some(available) = update(&hv.available_resources) else {
                return Ok(None);
            };
            // Never hand back more than the hypervisor has.
            hv.available_resources = Resources {
                memory: available.memory.min(hv.total_resources.memory),
                disk: available.disk.min(hv.total_resources.disk),
                cpu: available.cpu.min(hv.total_resources.cpu),
            };
            match self.save(&mut hv).await {
                Ok(()) => return Ok(Some(hv)),
                Err(error) if error.is_conflict() => {
                    debug!(self.log, "retrying resource update";
                        "hypervisor_id" => %hypervisor);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error.unwrap_or(Error::Conflict {
            kind: Hypervisor::KIND,
            id: hypervisor.to_string(),
        }))
    }

    /// Returns the IDs of the guests placed on `hypervisor`.
    pub async fn hypervisor_guests(
        &self,
        hypervisor: Uuid,
    ) -> Result<Vec<Uuid>, Error> {
        self.links(hypervisor, "guests").await
    }

    pub async fn hypervisor_add_subnet(
        &self,
        hypervisor: Uuid,
        subnet: Uuid,
    ) -> Result<(), Error> {
        self.fetch::<Subnet>(&subnet).await?;
        let link = self.link_key(hypervisor, "subnets", subnet);
        self.kv.set(&link, "", None).await?;
        Ok(())
    }

    pub async fn hypervisor_remove_subnet(
        &self,
        hypervisor: Uuid,
        subnet: Uuid,
    ) -> Result<(), Error> {
        match self
            .kv
            .delete(&self.link_key(hypervisor, "subnets", subnet), false)
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Returns the IDs of the subnets `hypervisor` is attached to.
    pub async fn hypervisor_subnets(
        &self,
        hypervisor: Uuid,
    ) -> Result<Vec<Uuid>, Error> {
        self.links(hypervisor, "subnets").await
    }

    fn heartbeat_key(&self, hypervisor: Uuid) -> String {
        format!("{}/heartbeat", Hypervisor::dir(&self.root, &hypervisor))
    }

    /// Mark `hypervisor` alive for the next `ttl`.
    pub async fn hypervisor_heartbeat(
        &self,
        hypervisor: Uuid,
        ttl: Duration,
    ) -> Result<(), Error> {
        let now = chrono::Utc::now().to_rfc3339();
        self.kv.set(&self.heartbeat_key(hypervisor), &now, Some(ttl)).await?;
        Ok(())
    }

    /// Returns true if `hypervisor` has an unexpired heartbeat.
    pub async fn hypervisor_is_alive(
        &self,
        hypervisor: Uuid,
    ) -> Result<bool, Error> {
        match self.kv.get(&self.heartbeat_key(hypervisor)).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    // Guests

    /// Remove every trace of a guest whose hypervisor has deleted it.
    pub async fn guest_destroy(&self, guest: &Guest) -> Result<(), Error> {
        if let Some(hypervisor) = guest.hypervisor_id {
            self.unlink_guest(hypervisor, guest).await?;
        }
        match self.delete::<Guest>(&guest.id).await {
            Ok(()) => (),
            Err(error) if error.is_not_found() => (),
            Err(error) => return Err(error),
        }
        info!(self.log, "destroyed guest"; "guest_id" => %guest.id);
        Ok(())
    }
}
