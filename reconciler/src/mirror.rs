// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory copy of one entity type, kept current from watch events

use corral_kv::EventKind;
use corral_kv::WatchEvent;
use corral_store::keys::parse_key;
use corral_store::Entity;
use std::collections::BTreeMap;

/// Why an event could not be applied to a mirror
#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    /// The event contradicts what the mirror holds, so the mirror has missed
    /// something.
    #[error("mirror is stale at {key}: {reason}")]
    Inconsistent { key: String, reason: &'static str },

    #[error("failed to decode {key}")]
    Decode {
        key: String,
        #[source]
        err: serde_json::Error,
    },

    #[error("unexpected key {key}")]
    BadKey { key: String },
}

impl IntegrationError {
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, IntegrationError::Inconsistent { .. })
    }
}

/// Effect of one event on a mirror
#[derive(Clone, Debug, PartialEq)]
pub struct Change<E> {
    /// the object before the event; `None` for a create
    pub before: Option<E>,
    /// the object after the event; `None` for a delete
    pub after: Option<E>,
}

/// Objects of type `E` by ID
///
/// Versions are cleared on the way in, so that an update event carrying an
/// unchanged body compares equal to what is already here.  The index each
/// object was last changed at is kept alongside.
pub struct Mirror<E: Entity> {
    root: String,
    objects: BTreeMap<String, (u64, E)>,
    /// index up to which the last full load reflects every change
    loaded_through: u64,
}

impl<E: Entity + Clone + PartialEq> Mirror<E> {
    pub fn new(root: &str) -> Mirror<E> {
        Mirror {
            root: root.trim_end_matches('/').to_string(),
            objects: BTreeMap::new(),
            loaded_through: 0,
        }
    }

    /// Replaces the contents with `all`, a full load that reflects every
    /// change up to `loaded_through`.  Events from before that point are
    /// expected to be delivered afterwards; [`Mirror::apply()`] drops them.
    pub fn replace_all(&mut self, all: Vec<E>, loaded_through: u64) {
        self.loaded_through = loaded_through;
        self.objects = all
            .into_iter()
            .map(|mut object| {
                let index = object.version();
                object.set_version(0);
                (object.id().to_string(), (index, object))
            })
            .collect();
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.objects.get(id).map(|(_, object)| object)
    }

    /// Iterates in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.objects.values().map(|(_, object)| object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns true if `event` is about an object of this type.
    pub fn covers(&self, event: &WatchEvent) -> bool {
        parse_key(&self.root, &event.key)
            .map_or(false, |path| path.kind == E::KIND)
    }

    /// Applies `event` and reports what changed, if anything.  Keys below
    /// an object's directory other than its body are ignored.
    ///
    /// Events the mirror already reflects are ignored: a create or update
    /// no newer than the object held, and an update or delete of an unknown
    /// object no newer than the last full load.  Any other event that does
    /// not fit is rejected without touching the mirror: a create for an ID
    /// that is already here, or an update or delete for one that is not.
    pub fn apply(
        &mut self,
        event: &WatchEvent,
    ) -> Result<Option<Change<E>>, IntegrationError> {
        let Some(path) = parse_key(&self.root, &event.key) else {
            return Ok(None);
        };
        if path.kind != E::KIND {
            return Ok(None);
        }
        let whole_dir = path.is_dir();
        if !path.is_metadata() && !whole_dir {
            return Ok(None);
        }
        let id = path.id.to_string();
        if path.id.parse::<E::Id>().is_err() {
            return Err(IntegrationError::BadKey { key: event.key.clone() });
        }

        let inconsistent = |reason| IntegrationError::Inconsistent {
            key: event.key.clone(),
            reason,
        };
        let held = self.objects.get(&id).map(|(index, _)| *index);
        let loaded = event.index <= self.loaded_through;

        match (event.kind, held) {
            (EventKind::Delete, _) => match self.objects.remove(&id) {
                Some((_, before)) => {
                    Ok(Some(Change { before: Some(before), after: None }))
                }
                None if loaded => Ok(None),
                None => Err(inconsistent("delete of unknown object")),
            },
            // Directories are created implicitly; only their removal
            // matters.
            _ if whole_dir => Ok(None),
            (_, Some(index)) if event.index <= index => Ok(None),
            (EventKind::Create, Some(_)) => {
                Err(inconsistent("create of known object"))
            }
            (EventKind::Update, None) if loaded => Ok(None),
            (EventKind::Update, None) => {
                Err(inconsistent("update of unknown object"))
            }
            (EventKind::Create, None) => {
                let object = self.decode(event, &id)?;
                self.objects.insert(id, (event.index, object.clone()));
                Ok(Some(Change { before: None, after: Some(object) }))
            }
            (EventKind::Update, Some(_)) => {
                let object = self.decode(event, &id)?;
                let before = self
                    .objects
                    .insert(id, (event.index, object.clone()))
                    .map(|(_, before)| before);
                if before.as_ref() == Some(&object) {
                    return Ok(None);
                }
                Ok(Some(Change { before, after: Some(object) }))
            }
        }
    }

    fn decode(
        &self,
        event: &WatchEvent,
        id: &str,
    ) -> Result<E, IntegrationError> {
        let value = event.value.as_deref().unwrap_or_default();
        let mut object: E = serde_json::from_str(value).map_err(|err| {
            IntegrationError::Decode { key: event.key.clone(), err }
        })?;
        if object.id().to_string() != id {
            return Err(IntegrationError::Inconsistent {
                key: event.key.clone(),
                reason: "body names a different object",
            });
        }
        object.set_version(0);
        Ok(object)
    }
}
