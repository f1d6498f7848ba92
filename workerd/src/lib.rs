// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker daemon
//!
//! Takes jobs off the "work" tube and carries them out through the agent on
//! the guest's hypervisor.  Any number of workers can share the tube.

mod config;
pub mod worker;

pub use config::Config;
pub use config::LoadError;
pub use config::DEFAULT_GUEST_ACTIONS;
pub use worker::Outcome;
pub use worker::Worker;
