// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key layout
//!
//! ```text
//! <root>/<kind>/<id>/metadata              object body
//! <root>/hypervisors/<id>/heartbeat        liveness marker (TTL)
//! <root>/hypervisors/<id>/guests/<guest>   placement link
//! <root>/hypervisors/<id>/subnets/<subnet> subnet link
//! <root>/jobs/<id>                         job body (TTL)
//! ```

/// A key split into its components relative to the store root
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPath<'a> {
    pub kind: &'a str,
    pub id: &'a str,
    /// components below the object's directory, e.g. `["metadata"]` or
    /// `["guests", "<guest-id>"]`; empty for the directory itself
    pub sub: Vec<&'a str>,
}

impl KeyPath<'_> {
    /// Returns true if the key holds an object body.
    pub fn is_metadata(&self) -> bool {
        self.sub == ["metadata"] || (self.kind == "jobs" && self.sub.is_empty())
    }

    /// Returns true if the key is the object's whole directory, as seen on a
    /// recursive delete.
    pub fn is_dir(&self) -> bool {
        self.sub.is_empty()
    }
}

/// Splits `key` into (kind, id, sub-resource).  Returns `None` for keys
/// outside `root` or without an object ID.
pub fn parse_key<'a>(root: &str, key: &'a str) -> Option<KeyPath<'a>> {
    let root = root.trim_end_matches('/');
    let rest = key.strip_prefix(root)?.strip_prefix('/')?;
    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let kind = parts.next()?;
    let id = parts.next()?;
    Some(KeyPath { kind, id, sub: parts.collect() })
}
