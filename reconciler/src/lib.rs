// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation daemons
//!
//! Each daemon keeps a generated configuration file in line with the cluster
//! state.  It loads the relevant objects once, then follows the store's
//! change feed and applies each change to an in-memory [`mirror::Mirror`].
//! Only a change that actually alters the mirror leads to the output being
//! rendered again, and only output that differs from what is on disk is
//! written and followed by a reload.
//!
//! [`dhcp`] generates DHCP host reservations and [`firewall`] generates the
//! nftables rules for the guests on one hypervisor.

pub mod artifact;
mod config;
pub mod dhcp;
pub mod firewall;
pub mod mirror;
mod reconciler;

pub use artifact::ArtifactWriter;
pub use config::Config;
pub use config::LoadError;
pub use reconciler::Integrator;
pub use reconciler::OnInconsistency;
pub use reconciler::Outcome;
pub use reconciler::Reconciler;
pub use reconciler::Rendered;
