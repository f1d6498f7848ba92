// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Placement daemon
//!
//! Takes "select-hypervisor" jobs off the "create" tube, chooses a
//! hypervisor for each job's guest and hands the job on to the worker as a
//! "fetch" job.  See [`placer`] for the pipeline and [`candidates`] for how
//! hypervisors are chosen.

pub mod candidates;
mod config;
pub mod placer;

pub use config::Config;
pub use config::LoadError;
pub use placer::Outcome;
pub use placer::Placer;

/// Key of the lock that keeps placement to one daemon at a time
pub fn lock_key(root: &str) -> String {
    format!("{}/placerd/lock", root.trim_end_matches('/'))
}
