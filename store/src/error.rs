// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors reported by the object store

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Somebody else modified the object since it was loaded.
    #[error("{kind} {id} was modified concurrently")]
    Conflict { kind: &'static str, id: String },

    #[error("invalid {kind} {id}: {message}")]
    Invalid { kind: &'static str, id: String, message: String },

    #[error("guest {guest} is already placed on hypervisor {hypervisor}")]
    AlreadyPlaced { guest: Uuid, hypervisor: Uuid },

    #[error("hypervisor {hypervisor} lacks resources for guest {guest}")]
    InsufficientResources { hypervisor: Uuid, guest: Uuid },

    #[error("failed to decode {key}")]
    Decode {
        key: String,
        #[source]
        err: serde_json::Error,
    },

    #[error("failed to encode {kind} {id}")]
    Encode {
        kind: &'static str,
        id: String,
        #[source]
        err: serde_json::Error,
    },

    #[error(transparent)]
    Kv(#[from] corral_kv::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
            || matches!(self, Error::Kv(e) if e.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
