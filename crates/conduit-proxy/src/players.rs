use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use conduit_protocol::ProtocolVersion;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::SessionCommand;

/// A live, admitted player as seen from outside its session task.
pub struct PlayerHandle {
    pub uuid: Uuid,
    pub name: String,
    pub remote: SocketAddr,
    pub version: ProtocolVersion,
    /// Commands are delivered into the session's event loop.
    pub control: mpsc::UnboundedSender<SessionCommand>,
    current_server: Mutex<Option<String>>,
}

impl PlayerHandle {
    pub fn new(
        uuid: Uuid,
        name: String,
        remote: SocketAddr,
        version: ProtocolVersion,
        control: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            uuid,
            name,
            remote,
            version,
            control,
            current_server: Mutex::new(None),
        }
    }

    pub fn current_server(&self) -> Option<String> {
        self.current_server.lock().clone()
    }

    pub fn set_current_server(&self, server: Option<String>) {
        *self.current_server.lock() = server;
    }
}

/// Result of trying to admit a player.
pub enum Admission {
    Admitted,
    /// Kick-existing replaced this older session; the caller must disconnect
    /// it with a duplicate-login reason.
    Replaced(Arc<PlayerHandle>),
    /// The identity is already connected and kick-existing is off.
    Rejected,
}

struct Indices {
    by_uuid: HashMap<Uuid, Arc<PlayerHandle>>,
    by_name: HashMap<String, Arc<PlayerHandle>>,
}

/// Process-wide registry of admitted sessions, indexed by UUID and by
/// lower-cased name. The two indices are updated together under one lock:
/// a session is present in both or in neither.
pub struct PlayerRegistry {
    inner: Mutex<Indices>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Indices {
                by_uuid: HashMap::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    /// Admit a freshly logged-in player. With `kick_existing`, an existing
    /// session under the same identity is atomically replaced and returned
    /// for disconnection.
    pub fn admit(&self, handle: Arc<PlayerHandle>, kick_existing: bool) -> Admission {
        let name_key = handle.name.to_lowercase();
        let mut indices = self.inner.lock();

        let existing_uuid = indices.by_uuid.get(&handle.uuid).cloned();
        let existing_name = indices.by_name.get(&name_key).cloned();

        if existing_uuid.is_none() && existing_name.is_none() {
            indices.by_uuid.insert(handle.uuid, handle.clone());
            indices.by_name.insert(name_key, handle);
            return Admission::Admitted;
        }
        if !kick_existing {
            return Admission::Rejected;
        }

        // Both matches are evicted; they are normally the same session, but
        // a name collision across distinct UUIDs must not orphan an index
        // entry.
        let mut replaced: Option<Arc<PlayerHandle>> = None;
        for old in [existing_uuid, existing_name].into_iter().flatten() {
            indices.by_uuid.remove(&old.uuid);
            indices.by_name.remove(&old.name.to_lowercase());
            replaced.get_or_insert(old);
        }
        indices.by_uuid.insert(handle.uuid, handle.clone());
        indices.by_name.insert(name_key, handle);
        Admission::Replaced(replaced.expect("at least one existing session"))
    }

    /// Remove a session on teardown. Guarded by pointer identity so a
    /// replaced session cannot evict its replacement.
    pub fn remove(&self, handle: &Arc<PlayerHandle>) {
        let mut indices = self.inner.lock();
        let is_current = indices
            .by_uuid
            .get(&handle.uuid)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if is_current {
            indices.by_uuid.remove(&handle.uuid);
            indices.by_name.remove(&handle.name.to_lowercase());
        }
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<Arc<PlayerHandle>> {
        self.inner.lock().by_uuid.get(&uuid).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<PlayerHandle>> {
        self.inner.lock().by_name.get(&name.to_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<PlayerHandle>> {
        self.inner.lock().by_uuid.values().cloned().collect()
    }

    /// Player count per server, used by dynamic fallback selection.
    pub fn count_on(&self, server: &str) -> usize {
        self.inner
            .lock()
            .by_uuid
            .values()
            .filter(|handle| handle.current_server().as_deref() == Some(server))
            .count()
    }

    /// Check the two-index invariant; used by tests and debug assertions.
    pub fn indices_agree(&self) -> bool {
        let indices = self.inner.lock();
        indices.by_uuid.len() == indices.by_name.len()
            && indices.by_uuid.values().all(|handle| {
                indices
                    .by_name
                    .get(&handle.name.to_lowercase())
                    .is_some_and(|other| Arc::ptr_eq(other, handle))
            })
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(uuid: Uuid, name: &str) -> Arc<PlayerHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(PlayerHandle::new(
            uuid,
            name.to_owned(),
            "203.0.113.5:54321".parse().unwrap(),
            ProtocolVersion::V1_21,
            tx,
        ))
    }

    #[test]
    fn admit_then_lookup_by_both_indices() {
        let registry = PlayerRegistry::new();
        let uuid = Uuid::new_v4();
        let alice = handle(uuid, "Alice");
        assert!(matches!(registry.admit(alice.clone(), false), Admission::Admitted));

        assert!(registry.by_uuid(uuid).is_some());
        assert!(registry.by_name("alice").is_some());
        assert!(registry.by_name("ALICE").is_some());
        assert!(registry.indices_agree());
    }

    #[test]
    fn duplicate_is_rejected_without_kick_existing() {
        let registry = PlayerRegistry::new();
        let uuid = Uuid::new_v4();
        registry.admit(handle(uuid, "Alice"), false);
        assert!(matches!(
            registry.admit(handle(uuid, "Alice"), false),
            Admission::Rejected
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.indices_agree());
    }

    #[test]
    fn duplicate_name_different_uuid_is_rejected() {
        let registry = PlayerRegistry::new();
        registry.admit(handle(Uuid::new_v4(), "Alice"), false);
        assert!(matches!(
            registry.admit(handle(Uuid::new_v4(), "alice"), false),
            Admission::Rejected
        ));
    }

    #[test]
    fn kick_existing_replaces_atomically() {
        let registry = PlayerRegistry::new();
        let uuid = Uuid::new_v4();
        let first = handle(uuid, "Alice");
        let second = handle(uuid, "Alice");
        registry.admit(first.clone(), true);
        match registry.admit(second.clone(), true) {
            Admission::Replaced(old) => assert!(Arc::ptr_eq(&old, &first)),
            _ => panic!("expected replacement"),
        }
        assert!(Arc::ptr_eq(&registry.by_uuid(uuid).unwrap(), &second));
        assert!(registry.indices_agree());
    }

    #[test]
    fn replaced_session_teardown_does_not_evict_replacement() {
        let registry = PlayerRegistry::new();
        let uuid = Uuid::new_v4();
        let first = handle(uuid, "Alice");
        let second = handle(uuid, "Alice");
        registry.admit(first.clone(), true);
        registry.admit(second.clone(), true);

        // The replaced session tears down afterwards.
        registry.remove(&first);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.by_uuid(uuid).unwrap(), &second));
        assert!(registry.indices_agree());
    }

    #[test]
    fn count_on_tracks_current_server() {
        let registry = PlayerRegistry::new();
        let a = handle(Uuid::new_v4(), "Alice");
        let b = handle(Uuid::new_v4(), "Bob");
        registry.admit(a.clone(), false);
        registry.admit(b.clone(), false);
        a.set_current_server(Some("lobby".to_owned()));
        b.set_current_server(Some("factions".to_owned()));
        assert_eq!(registry.count_on("lobby"), 1);
        assert_eq!(registry.count_on("factions"), 1);
        assert_eq!(registry.count_on("empty"), 0);
    }
}
