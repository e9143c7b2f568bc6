use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::{ProxyKeyPair, SessionService};
use crate::command::{CommandManager, CommandSource};
use crate::config::ProxyConfig;
use crate::events::HookRegistry;
use crate::players::PlayerRegistry;
use crate::query::QueryListener;
use crate::ratelimit::LoginRateLimiter;
use crate::servers::{ServerMap, ServerSnapshot};
use crate::session::{self, SessionCommand};

/// Shared proxy state: everything a session needs by reference.
pub struct Proxy {
    config: RwLock<Arc<ProxyConfig>>,
    favicon: RwLock<Option<String>>,
    pub servers: ServerMap,
    pub players: PlayerRegistry,
    pub keys: ProxyKeyPair,
    pub session_service: SessionService,
    pub ratelimit: LoginRateLimiter,
    pub hooks: HookRegistry,
    pub commands: CommandManager,
    pub shutdown: CancellationToken,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> anyhow::Result<Arc<Self>> {
        let keys = ProxyKeyPair::generate().context("generating the RSA key pair")?;
        let favicon = config.load_favicon();
        let servers = ServerMap::new(ServerSnapshot::from_config(&config));
        let proxy = Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            favicon: RwLock::new(favicon),
            servers,
            players: PlayerRegistry::new(),
            keys,
            session_service: SessionService::default(),
            ratelimit: LoginRateLimiter::new(),
            hooks: HookRegistry::new(),
            commands: CommandManager::new(),
            shutdown: CancellationToken::new(),
        });
        proxy.register_builtin_commands();
        Ok(proxy)
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.read().clone()
    }

    pub fn favicon(&self) -> Option<String> {
        self.favicon.read().clone()
    }

    /// Accept loop. Returns after a graceful shutdown completes.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let config = self.config();
        let bind = config
            .bind_addr()
            .context("bind address validated at load")?;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding {bind}"))?;
        info!("listening on {bind}");

        let _query = if config.query_enabled {
            match QueryListener::bind(bind.ip(), config.query_port, &self.shutdown).await {
                Ok(listener) => Some(listener),
                Err(err) => {
                    warn!("query endpoint failed to bind: {err}");
                    None
                }
            }
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let proxy = self.clone();
                        tokio::spawn(async move {
                            session::handle_connection(proxy, stream, peer).await;
                        });
                    }
                    Err(err) => error!("accept failed: {err}"),
                },
            }
        }

        // Listener is closed by drop; kick everyone and wait for teardown.
        drop(listener);
        self.drain_sessions().await;
        Ok(())
    }

    async fn drain_sessions(&self) {
        let config = self.config();
        for player in self.players.all() {
            let _ = player.control.send(SessionCommand::Kick {
                reason: config.messages.kick_proxy_shutdown.clone(),
            });
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.players.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let stragglers = self.players.len();
        if stragglers > 0 {
            warn!("{stragglers} session(s) did not tear down within 10s");
        } else {
            info!("all sessions torn down");
        }
    }

    /// Swap in a validated configuration. Players on servers that vanished
    /// are evacuated to a fallback, or kicked when none is usable.
    pub fn reload(self: &Arc<Self>, config: ProxyConfig) {
        let snapshot = ServerSnapshot::from_config(&config);
        let removed: Vec<_> = self
            .servers
            .snapshot()
            .names()
            .filter(|name| snapshot.get(name).is_none())
            .map(str::to_owned)
            .collect();

        self.servers.replace(snapshot);
        *self.favicon.write() = config.load_favicon();
        *self.config.write() = Arc::new(config.clone());
        self.commands.clear();
        self.register_builtin_commands();

        for name in removed {
            for player in self.players.all() {
                if player.current_server().as_deref() == Some(name.as_str()) {
                    let fallback = self.servers.choose_fallback(
                        config.enable_dynamic_fallbacks,
                        std::slice::from_ref(&name),
                        |server| self.players.count_on(server),
                    );
                    let command = match fallback {
                        Some(backend) => SessionCommand::Switch {
                            target: backend.name.clone(),
                            force: true,
                        },
                        None => SessionCommand::Kick {
                            reason: config.messages.kick_lost_connection.clone(),
                        },
                    };
                    let _ = player.control.send(command);
                }
            }
        }
        info!("configuration reloaded");
    }

    /// The built-in admin commands, re-registered on every reload so config
    /// booleans can enable or disable them.
    fn register_builtin_commands(self: &Arc<Self>) {
        let config = self.config();
        if !config.announce_proxy_commands {
            return;
        }

        let proxy = self.clone();
        self.commands.register(
            "server",
            Arc::new(move |source: &CommandSource, args: &[&str]| {
                let (CommandSource::Player(player), [target]) = (source, args) else {
                    return;
                };
                if proxy.servers.get(target).is_some() {
                    let _ = player.control.send(SessionCommand::Switch {
                        target: (*target).to_owned(),
                        force: false,
                    });
                }
            }),
            &[],
        );

        let proxy = self.clone();
        self.commands.register(
            "send",
            Arc::new(move |source: &CommandSource, args: &[&str]| {
                if !source.is_console() {
                    return;
                }
                let [player_name, target] = args else { return };
                if proxy.servers.get(target).is_none() {
                    return;
                }
                if let Some(player) = proxy.players.by_name(player_name) {
                    let _ = player.control.send(SessionCommand::Switch {
                        target: (*target).to_owned(),
                        force: true,
                    });
                }
            }),
            &[],
        );

        let proxy = self.clone();
        self.commands.register(
            "hub",
            Arc::new(move |source: &CommandSource, _args: &[&str]| {
                let CommandSource::Player(player) = source else { return };
                let exclude: Vec<String> = player.current_server().into_iter().collect();
                let fallback = proxy.servers.choose_fallback(
                    proxy.config().enable_dynamic_fallbacks,
                    &exclude,
                    |server| proxy.players.count_on(server),
                );
                if let Some(backend) = fallback {
                    let _ = player.control.send(SessionCommand::Switch {
                        target: backend.name.clone(),
                        force: false,
                    });
                }
            }),
            &["lobby"],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::players::PlayerHandle;
    use conduit_protocol::ProtocolVersion;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn test_proxy() -> Arc<Proxy> {
        let mut config = ProxyConfig::default();
        config.servers.entries.insert(
            "factions".to_owned(),
            "127.0.0.1:25567".to_owned(),
        );
        Proxy::new(config).unwrap()
    }

    fn admit_player(proxy: &Arc<Proxy>, name: &str) -> mpsc::UnboundedReceiver<SessionCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(PlayerHandle::new(
            Uuid::new_v4(),
            name.to_owned(),
            "203.0.113.9:5000".parse().unwrap(),
            ProtocolVersion::V1_21,
            tx,
        ));
        match proxy.players.admit(handle.clone(), false) {
            crate::players::Admission::Admitted => {}
            _ => panic!("admission failed"),
        }
        handle.set_current_server(Some("factions".to_owned()));
        rx
    }

    #[tokio::test]
    async fn builtin_server_command_sends_switch() {
        let proxy = test_proxy();
        let mut rx = admit_player(&proxy, "Alice");
        let player = proxy.players.by_name("Alice").unwrap();

        proxy
            .commands
            .dispatch(&CommandSource::Player(player), "/server lobby");
        match rx.try_recv().unwrap() {
            SessionCommand::Switch { target, force } => {
                assert_eq!(target, "lobby");
                assert!(!force);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_command_requires_console() {
        let proxy = test_proxy();
        let mut rx = admit_player(&proxy, "Alice");
        let player = proxy.players.by_name("Alice").unwrap();

        proxy.commands.dispatch(
            &CommandSource::Player(player),
            "/send Alice lobby",
        );
        assert!(rx.try_recv().is_err());

        proxy
            .commands
            .dispatch(&CommandSource::Console, "/send Alice lobby");
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionCommand::Switch { force: true, .. }
        ));
    }

    #[tokio::test]
    async fn reload_evacuates_players_on_removed_servers() {
        let proxy = test_proxy();
        let mut rx = admit_player(&proxy, "Alice");

        // New config drops the factions server Alice is on.
        let new_config = ProxyConfig::default();
        proxy.reload(new_config);

        match rx.try_recv().unwrap() {
            SessionCommand::Switch { target, force } => {
                assert_eq!(target, "lobby");
                assert!(force);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(proxy.servers.get("factions").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_kicks_all_sessions() {
        let proxy = test_proxy();
        let mut rx = admit_player(&proxy, "Alice");
        proxy.drain_sessions().await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionCommand::Kick { .. }
        ));
    }
}
