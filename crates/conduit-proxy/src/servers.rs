use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ProxyConfig;
use crate::forwarding::ForwardingMode;

/// A backend the proxy can forward players to.
#[derive(Debug, Clone)]
pub struct RegisteredBackend {
    pub name: String,
    /// host:port, resolved at dial time.
    pub address: String,
    pub forwarding: ForwardingMode,
}

impl RegisteredBackend {
    /// The host half of the address, used as the base of the spliced
    /// forwarding handshake.
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }

    pub fn port(&self) -> u16 {
        self.address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(25565)
    }
}

/// An immutable view of the server table. Reloads publish a fresh snapshot;
/// an operation holding one observes a consistent table throughout.
#[derive(Debug, Default)]
pub struct ServerSnapshot {
    entries: HashMap<String, Arc<RegisteredBackend>>,
    /// Fallback names in declaration order.
    fallbacks: Vec<String>,
}

impl ServerSnapshot {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let entries = config
            .servers
            .entries
            .iter()
            .map(|(name, address)| {
                (
                    name.clone(),
                    Arc::new(RegisteredBackend {
                        name: name.clone(),
                        address: address.clone(),
                        forwarding: config.forwarding_for(name),
                    }),
                )
            })
            .collect();
        Self {
            entries,
            fallbacks: config.servers.try_order.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredBackend>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The mutable holder: copy-on-write snapshot plus the fallback cursor that
/// spreads repeated selections.
pub struct ServerMap {
    snapshot: RwLock<Arc<ServerSnapshot>>,
    fallback_cursor: AtomicUsize,
}

impl ServerMap {
    pub fn new(snapshot: ServerSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            fallback_cursor: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<ServerSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredBackend>> {
        self.snapshot().get(name)
    }

    /// Publish a new table. In-flight operations keep their old snapshot.
    pub fn replace(&self, snapshot: ServerSnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Pick the next fallback, excluding the listed names (the backend the
    /// player just lost, plus any fallback already tried this round).
    ///
    /// With dynamic fallbacks the least-populated candidate wins, ties
    /// broken by declaration order. Otherwise the fallback list is walked
    /// round-robin from a cursor so repeated selections spread load.
    pub fn choose_fallback(
        &self,
        dynamic: bool,
        exclude: &[String],
        player_count: impl Fn(&str) -> usize,
    ) -> Option<Arc<RegisteredBackend>> {
        let snapshot = self.snapshot();
        let candidates: Vec<&String> = snapshot
            .fallbacks()
            .iter()
            .filter(|name| !exclude.contains(name))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let chosen = if dynamic {
            candidates
                .iter()
                .enumerate()
                .min_by_key(|(index, name)| (player_count(name), *index))
                .map(|(_, name)| (*name).clone())?
        } else {
            let cursor = self.fallback_cursor.fetch_add(1, Ordering::Relaxed);
            candidates[cursor % candidates.len()].clone()
        };
        snapshot.get(&chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn config_with_servers(servers: &[(&str, &str)], fallbacks: &[&str]) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.servers.entries = servers
            .iter()
            .map(|(name, addr)| (name.to_string(), addr.to_string()))
            .collect();
        config.servers.try_order = fallbacks.iter().map(|s| s.to_string()).collect();
        config
    }

    fn map_with_fallbacks(fallbacks: &[&str]) -> ServerMap {
        let servers: Vec<(&str, &str)> = fallbacks
            .iter()
            .map(|name| (*name, "127.0.0.1:25566"))
            .collect();
        ServerMap::new(ServerSnapshot::from_config(&config_with_servers(
            &servers, fallbacks,
        )))
    }

    #[test]
    fn snapshot_reload_does_not_disturb_held_references() {
        let map = map_with_fallbacks(&["lobby"]);
        let held = map.snapshot();
        map.replace(ServerSnapshot::from_config(&config_with_servers(
            &[("other", "127.0.0.1:1")],
            &["other"],
        )));
        assert!(held.get("lobby").is_some());
        assert!(map.get("lobby").is_none());
        assert!(map.get("other").is_some());
    }

    #[test]
    fn dynamic_fallback_picks_least_populated() {
        let map = map_with_fallbacks(&["a", "b", "c"]);
        let counts: HashMap<&str, usize> = [("a", 4), ("b", 2), ("c", 7)].into();
        let chosen = map
            .choose_fallback(true, &[], |name| counts[name])
            .unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[test]
    fn dynamic_tie_breaks_by_declaration_order() {
        let map = map_with_fallbacks(&["a", "b", "c"]);
        let counts: HashMap<&str, usize> = [("a", 2), ("b", 2), ("c", 7)].into();
        let chosen = map
            .choose_fallback(true, &[], |name| counts[name])
            .unwrap();
        assert_eq!(chosen.name, "a");
    }

    #[test]
    fn static_fallback_cycles() {
        let map = map_with_fallbacks(&["a", "b"]);
        let first = map.choose_fallback(false, &[], |_| 0).unwrap();
        let second = map.choose_fallback(false, &[], |_| 0).unwrap();
        assert_ne!(first.name, second.name);
        let third = map.choose_fallback(false, &[], |_| 0).unwrap();
        assert_eq!(first.name, third.name);
    }

    #[test]
    fn excluded_backend_is_never_chosen() {
        let map = map_with_fallbacks(&["a", "b"]);
        for _ in 0..4 {
            let chosen = map.choose_fallback(false, &["a".to_owned()], |_| 0).unwrap();
            assert_eq!(chosen.name, "b");
        }
    }

    #[test]
    fn no_usable_fallback_yields_none() {
        let map = map_with_fallbacks(&["a"]);
        assert!(map.choose_fallback(true, &["a".to_owned()], |_| 0).is_none());
    }
}
