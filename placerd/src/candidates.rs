// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Candidate functions for hypervisor selection
//!
//! Selection starts with every hypervisor in the cluster and passes the list
//! through each configured function in turn.  A function may drop
//! hypervisors (a filter) or reorder them (a score).  The first function to
//! leave nothing ends selection with "no candidates"; otherwise the guest
//! goes to whatever hypervisor is first in the final list.

use async_trait::async_trait;
use corral_store::Flavor;
use corral_store::Guest;
use corral_store::Hypervisor;
use corral_store::Store;
use rand::seq::SliceRandom;
use std::cmp::Reverse;

/// Order used when the configuration does not give one
pub const DEFAULT_ORDER: &[&str] =
    &["alive", "subnet", "resources", "most-available"];

/// What a candidate function knows about the placement request
pub struct PlacementContext<'a> {
    pub store: &'a Store,
    pub guest: &'a Guest,
    pub flavor: &'a Flavor,
}

#[async_trait]
pub trait CandidateFunction: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(
        &self,
        ctx: &PlacementContext<'_>,
        candidates: Vec<Hypervisor>,
    ) -> Result<Vec<Hypervisor>, corral_store::Error>;
}

#[derive(Debug, thiserror::Error)]
#[error("unknown candidate function {0:?}")]
pub struct UnknownCandidate(pub String);

/// Builds the pipeline of candidate functions named in `names`.
pub fn from_names<S: AsRef<str>>(
    names: &[S],
) -> Result<Vec<Box<dyn CandidateFunction>>, UnknownCandidate> {
    names
        .iter()
        .map(|name| -> Result<Box<dyn CandidateFunction>, UnknownCandidate> {
            match name.as_ref() {
                "alive" => Ok(Box::new(Alive)),
                "subnet" => Ok(Box::new(OnSubnet)),
                "resources" => Ok(Box::new(HasResources)),
                "most-available" => Ok(Box::new(MostAvailable)),
                "random" => Ok(Box::new(Random)),
                other => Err(UnknownCandidate(other.to_string())),
            }
        })
        .collect()
}

/// Keeps hypervisors with an unexpired heartbeat.
pub struct Alive;

#[async_trait]
impl CandidateFunction for Alive {
    fn name(&self) -> &'static str {
        "alive"
    }

    async fn apply(
        &self,
        ctx: &PlacementContext<'_>,
        candidates: Vec<Hypervisor>,
    ) -> Result<Vec<Hypervisor>, corral_store::Error> {
        let mut alive = Vec::with_capacity(candidates.len());
        for hv in candidates {
            if ctx.store.hypervisor_is_alive(hv.id).await? {
                alive.push(hv);
            }
        }
        Ok(alive)
    }
}

/// Keeps hypervisors attached to the guest's subnet.  Guests without a
/// subnet can go anywhere.
pub struct OnSubnet;

#[async_trait]
impl CandidateFunction for OnSubnet {
    fn name(&self) -> &'static str {
        "subnet"
    }

    async fn apply(
        &self,
        ctx: &PlacementContext<'_>,
        candidates: Vec<Hypervisor>,
    ) -> Result<Vec<Hypervisor>, corral_store::Error> {
        let Some(subnet) = ctx.guest.subnet_id else {
            return Ok(candidates);
        };
        let mut attached = Vec::with_capacity(candidates.len());
        for hv in candidates {
            if ctx.store.hypervisor_subnets(hv.id).await?.contains(&subnet) {
                attached.push(hv);
            }
        }
        Ok(attached)
    }
}

/// Keeps hypervisors with room for the guest's flavor.
pub struct HasResources;

#[async_trait]
impl CandidateFunction for HasResources {
    fn name(&self) -> &'static str {
        "resources"
    }

    async fn apply(
        &self,
        ctx: &PlacementContext<'_>,
        mut candidates: Vec<Hypervisor>,
    ) -> Result<Vec<Hypervisor>, corral_store::Error> {
        candidates.retain(|hv| {
            hv.available_resources.fits(&ctx.flavor.resources)
        });
        Ok(candidates)
    }
}

/// Puts the hypervisors with the most free memory (then CPU) first.
pub struct MostAvailable;

#[async_trait]
impl CandidateFunction for MostAvailable {
    fn name(&self) -> &'static str {
        "most-available"
    }

    async fn apply(
        &self,
        _ctx: &PlacementContext<'_>,
        mut candidates: Vec<Hypervisor>,
    ) -> Result<Vec<Hypervisor>, corral_store::Error> {
        candidates.sort_by_key(|hv| {
            let free = &hv.available_resources;
            Reverse((free.memory, free.cpu))
        });
        Ok(candidates)
    }
}

/// Shuffles the candidates, spreading guests across equal hypervisors.
pub struct Random;

#[async_trait]
impl CandidateFunction for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn apply(
        &self,
        _ctx: &PlacementContext<'_>,
        mut candidates: Vec<Hypervisor>,
    ) -> Result<Vec<Hypervisor>, corral_store::Error> {
        candidates.shuffle(&mut rand::thread_rng());
        Ok(candidates)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use corral_store::testing::*;
    use corral_test_utils::dev::test_setup_log;
    use std::time::Duration;

    #[test]
    fn test_from_names() {
        let functions = from_names(DEFAULT_ORDER).unwrap();
        let names: Vec<_> = functions.iter().map(|f| f.name()).collect();
        assert_eq!(names, DEFAULT_ORDER);

        let error = from_names(&["alive", "cheapest"]).err().unwrap();
        assert_eq!(error.0, "cheapest");
    }

    #[tokio::test]
    async fn test_candidate_functions() {
        let logctx = test_setup_log("test_candidate_functions");
        let store = store(&logctx.log);

        let mut small = hypervisor(4, 4096);
        let mut large = hypervisor(32, 65536);
        let mut dead = hypervisor(64, 131072);
        for hv in [&mut small, &mut large, &mut dead] {
            store.save(hv).await.unwrap();
        }
        for hv in [&small, &large] {
            store
                .hypervisor_heartbeat(hv.id, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let mut subnet = subnet();
        store.save(&mut subnet).await.unwrap();
        store.hypervisor_add_subnet(large.id, subnet.id).await.unwrap();

        let flavor = flavor(8, 8192);
        let mut guest = Guest::new(flavor.id);
        let all = vec![small.clone(), large.clone(), dead.clone()];
        let ids = |hvs: Vec<Hypervisor>| {
            hvs.into_iter().map(|hv| hv.id).collect::<Vec<_>>()
        };

        let ctx =
            PlacementContext { store: &store, guest: &guest, flavor: &flavor };
        let alive = Alive.apply(&ctx, all.clone()).await.unwrap();
        assert_eq!(ids(alive), vec![small.id, large.id]);
        let fits = HasResources.apply(&ctx, all.clone()).await.unwrap();
        assert_eq!(ids(fits), vec![large.id, dead.id]);
        let sorted = MostAvailable.apply(&ctx, all.clone()).await.unwrap();
        assert_eq!(ids(sorted), vec![dead.id, large.id, small.id]);
        let shuffled = Random.apply(&ctx, all.clone()).await.unwrap();
        assert_eq!(shuffled.len(), 3);
        // no subnet: no restriction
        let any = OnSubnet.apply(&ctx, all.clone()).await.unwrap();
        assert_eq!(any.len(), 3);

        guest.subnet_id = Some(subnet.id);
        let ctx =
            PlacementContext { store: &store, guest: &guest, flavor: &flavor };
        let attached = OnSubnet.apply(&ctx, all).await.unwrap();
        assert_eq!(ids(attached), vec![large.id]);
        logctx.cleanup_successful();
    }
}
