use std::net::SocketAddr;
use std::sync::Arc;

use conduit_protocol::ProtocolVersion;
use conduit_types::GameProfile;
use parking_lot::RwLock;

use crate::ping::StatusDocument;
use crate::players::PlayerHandle;

/// Observer hooks invoked synchronously from the session state machine.
///
/// Implementations must be fast and non-blocking; they run on the
/// connection's task. Every method has a no-op default so observers
/// implement only what they care about.
#[allow(unused_variables)]
pub trait ProxyHook: Send + Sync {
    fn on_handshake(&self, remote: SocketAddr, version: i32, server_address: &str) {}

    /// Return `false` to deny the login; the connection is kicked.
    fn on_login(&self, profile: &GameProfile, remote: SocketAddr) -> bool {
        true
    }

    /// Return `Some(name)` to redirect the connection to another backend.
    fn on_server_pre_connect(&self, player: &PlayerHandle, target: &str) -> Option<String> {
        None
    }

    fn on_server_connected(&self, player: &PlayerHandle, server: &str) {}

    fn on_disconnect(&self, player: &PlayerHandle) {}

    fn on_plugin_message(&self, player: &PlayerHandle, channel: &str, data: &[u8]) {}

    /// Rewrite the status document before serialization.
    fn on_ping(&self, document: &mut StatusDocument, version: ProtocolVersion) {}
}

/// Registered observers, walked in registration order.
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ProxyHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, hook: Arc<dyn ProxyHook>) {
        self.hooks.write().push(hook);
    }

    pub fn handshake(&self, remote: SocketAddr, version: i32, server_address: &str) {
        for hook in self.hooks.read().iter() {
            hook.on_handshake(remote, version, server_address);
        }
    }

    /// `false` when any observer denies the login.
    pub fn login(&self, profile: &GameProfile, remote: SocketAddr) -> bool {
        self.hooks
            .read()
            .iter()
            .all(|hook| hook.on_login(profile, remote))
    }

    /// The last observer to redirect wins.
    pub fn server_pre_connect(&self, player: &PlayerHandle, target: &str) -> String {
        let mut chosen = target.to_owned();
        for hook in self.hooks.read().iter() {
            if let Some(redirect) = hook.on_server_pre_connect(player, &chosen) {
                chosen = redirect;
            }
        }
        chosen
    }

    pub fn server_connected(&self, player: &PlayerHandle, server: &str) {
        for hook in self.hooks.read().iter() {
            hook.on_server_connected(player, server);
        }
    }

    pub fn disconnect(&self, player: &PlayerHandle) {
        for hook in self.hooks.read().iter() {
            hook.on_disconnect(player);
        }
    }

    pub fn plugin_message(&self, player: &PlayerHandle, channel: &str, data: &[u8]) {
        for hook in self.hooks.read().iter() {
            hook.on_plugin_message(player, channel, data);
        }
    }

    pub fn ping(&self, document: &mut StatusDocument, version: ProtocolVersion) {
        for hook in self.hooks.read().iter() {
            hook.on_ping(document, version);
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    struct DenyBob;
    impl ProxyHook for DenyBob {
        fn on_login(&self, profile: &GameProfile, _remote: SocketAddr) -> bool {
            profile.name != "Bob"
        }
    }

    struct RedirectToHub;
    impl ProxyHook for RedirectToHub {
        fn on_server_pre_connect(&self, _player: &PlayerHandle, _target: &str) -> Option<String> {
            Some("hub".to_owned())
        }
    }

    struct MotdRewriter;
    impl ProxyHook for MotdRewriter {
        fn on_ping(&self, document: &mut StatusDocument, _version: ProtocolVersion) {
            document.online = 42;
        }
    }

    fn remote() -> SocketAddr {
        "203.0.113.5:1234".parse().unwrap()
    }

    #[test]
    fn login_denial_short_circuits() {
        let hooks = HookRegistry::new();
        hooks.register(Arc::new(DenyBob));
        assert!(hooks.login(&GameProfile::offline("Alice"), remote()));
        assert!(!hooks.login(&GameProfile::offline("Bob"), remote()));
    }

    #[test]
    fn ping_observers_mutate_the_document() {
        let hooks = HookRegistry::new();
        hooks.register(Arc::new(MotdRewriter));
        let config = ProxyConfig::default();
        let mut doc = StatusDocument::build(&config, None, 0, 767);
        hooks.ping(&mut doc, ProtocolVersion::V1_21);
        assert_eq!(doc.online, 42);
    }

    #[test]
    fn pre_connect_redirect_applies() {
        use tokio::sync::mpsc;
        let hooks = HookRegistry::new();
        hooks.register(Arc::new(RedirectToHub));
        let (tx, _rx) = mpsc::unbounded_channel();
        let player = PlayerHandle::new(
            uuid::Uuid::new_v4(),
            "Alice".into(),
            remote(),
            ProtocolVersion::V1_21,
            tx,
        );
        assert_eq!(hooks.server_pre_connect(&player, "lobby"), "hub");
    }
}
