use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use conduit_protocol::{
    table, Connection, ConnectionState, Direction, FrameReader, FrameWriter, InitialFrame,
    Packet, PacketKind, ProtocolVersion,
};
use conduit_types::{GameProfile, TextComponent};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::auth::{server_hash, ProxyKeyPair};
use crate::backend::{self, BackendContext, BackendPhase, PreparedBackend};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::forwarding;
use crate::ping::{legacy_ping_response, StatusDocument};
use crate::players::{Admission, PlayerHandle};
use crate::proxy::Proxy;
use crate::servers::RegisteredBackend;
use crate::wire::{decode_frame, frame_packet, frame_packet_as, packet_id, send_packet};

/// Commands delivered into a live session's event loop from the outside
/// (admin commands, reload evacuation, duplicate-login replacement).
#[derive(Debug)]
pub enum SessionCommand {
    Kick { reason: String },
    Switch { target: String, force: bool },
}

/// Entry point for one accepted client socket.
pub async fn handle_connection(proxy: Arc<Proxy>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    match run_session(proxy, stream, peer).await {
        Ok(()) => trace!("session {peer} ended"),
        Err(err) if err.is_silent() => debug!("session {peer} closed: {err}"),
        Err(err) => debug!("session {peer} failed: {err}"),
    }
}

async fn run_session(
    proxy: Arc<Proxy>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let config = proxy.config();
    let mut remote = peer;
    if config.haproxy {
        if let Some(real) = read_haproxy_header(&mut stream).await? {
            remote = real;
        }
    }

    let mut conn = Connection::new(stream);

    let initial = timeout(config.connection_timeout(), conn.read_initial_frame())
        .await
        .map_err(|_| ProxyError::Timeout)??;
    let frame = match initial {
        InitialFrame::LegacyPing(format) => {
            let online = proxy.players.len() as u32;
            conn.write_raw(&legacy_ping_response(&config, online, format))
                .await?;
            return Ok(());
        }
        InitialFrame::Packet(frame) => frame,
    };

    // The handshake layout predates every versioned table.
    let (id, _) = packet_id(&frame)?;
    let handshake_table = table(
        ProtocolVersion::MINIMUM,
        ConnectionState::Handshake,
        Direction::Serverbound,
    );
    if handshake_table.kind(id) != Some(PacketKind::Handshake) {
        return Err(ProxyError::Violation("expected handshake"));
    }
    let Packet::Handshake {
        protocol,
        server_address,
        next_state,
        ..
    } = decode_frame(PacketKind::Handshake, ProtocolVersion::MINIMUM, &frame)?
    else {
        unreachable!()
    };

    // Forge clients tag the address with NUL-separated markers.
    let clean_address = server_address
        .split('\0')
        .next()
        .unwrap_or_default()
        .to_owned();
    if config.disable_forge && server_address.contains('\0') {
        debug!("stripping forge markers from {remote}");
    }
    proxy.hooks.handshake(remote, protocol, &clean_address);

    let version =
        ProtocolVersion::closest_supported(protocol).unwrap_or(ProtocolVersion::MINIMUM);
    match ConnectionState::from_handshake_next(next_state) {
        Some(ConnectionState::Status) => run_status(conn, &proxy, &config, version, protocol).await,
        Some(ConnectionState::Login) => {
            run_login(conn, proxy.clone(), config, version, protocol, remote).await
        }
        _ => Err(ProxyError::Violation("bad next-state in handshake")),
    }
}

/// Consume a HAProxy PROXY-protocol v1 header if one is present.
async fn read_haproxy_header(stream: &mut TcpStream) -> Result<Option<SocketAddr>, ProxyError> {
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > 106 {
            return Err(ProxyError::Violation("oversized proxy-protocol header"));
        }
    }
    let text = std::str::from_utf8(&line)
        .map_err(|_| ProxyError::Violation("invalid proxy-protocol header"))?
        .trim_end_matches('\r');
    let mut parts = text.split(' ');
    match (parts.next(), parts.next()) {
        (Some("PROXY"), Some("TCP4" | "TCP6")) => {
            let source_ip = parts.next();
            let _dest_ip = parts.next();
            let source_port = parts.next();
            match (source_ip, source_port) {
                (Some(ip), Some(port)) => {
                    let addr = format!("{ip}:{port}")
                        .parse()
                        .map_err(|_| ProxyError::Violation("invalid proxy-protocol address"))?;
                    Ok(Some(addr))
                }
                _ => Err(ProxyError::Violation("truncated proxy-protocol header")),
            }
        }
        (Some("PROXY"), Some("UNKNOWN")) => Ok(None),
        _ => Err(ProxyError::Violation("invalid proxy-protocol header")),
    }
}

// === STATUS ===

async fn run_status(
    mut conn: Connection,
    proxy: &Arc<Proxy>,
    config: &Arc<ProxyConfig>,
    version: ProtocolVersion,
    declared_protocol: i32,
) -> Result<(), ProxyError> {
    let status_table = table(version, ConnectionState::Status, Direction::Serverbound);
    let mut responded = false;
    loop {
        let frame = timeout(config.read_timeout(), conn.read_frame())
            .await
            .map_err(|_| ProxyError::Timeout)??;
        let (id, _) = packet_id(&frame)?;
        match status_table.kind(id) {
            Some(PacketKind::StatusRequest) if !responded => {
                responded = true;
                let mut document = StatusDocument::build(
                    config,
                    proxy.favicon(),
                    proxy.players.len() as u32,
                    declared_protocol,
                );
                for player in proxy.players.all().into_iter().take(12) {
                    document.sample.push((player.name.clone(), player.uuid));
                }
                proxy.hooks.ping(&mut document, version);
                let json = document.to_json(version.status_dialect());
                send_packet(
                    &mut conn,
                    version,
                    ConnectionState::Status,
                    Direction::Clientbound,
                    &Packet::StatusResponse { json },
                )
                .await?;
            }
            Some(PacketKind::StatusRequest) => {
                return Err(ProxyError::Violation("duplicate status request"))
            }
            Some(PacketKind::StatusPing) => {
                let Packet::StatusPing { payload } =
                    decode_frame(PacketKind::StatusPing, version, &frame)?
                else {
                    unreachable!()
                };
                send_packet(
                    &mut conn,
                    version,
                    ConnectionState::Status,
                    Direction::Clientbound,
                    &Packet::StatusPong { payload },
                )
                .await?;
                return Ok(());
            }
            _ => return Err(ProxyError::Violation("unexpected status packet")),
        }
    }
}

// === LOGIN ===

async fn kick_login(
    conn: &mut Connection,
    version: ProtocolVersion,
    message: &str,
) -> Result<(), ProxyError> {
    let reason_json = TextComponent::plain(message).to_json(version.status_dialect());
    send_packet(
        conn,
        version,
        ConnectionState::Login,
        Direction::Clientbound,
        &Packet::LoginDisconnect { reason_json },
    )
    .await
}

async fn run_login(
    mut conn: Connection,
    proxy: Arc<Proxy>,
    config: Arc<ProxyConfig>,
    version: ProtocolVersion,
    declared_protocol: i32,
    remote: SocketAddr,
) -> Result<(), ProxyError> {
    // Overload rejection happens before any other work.
    if !proxy.ratelimit.check(
        remote.ip(),
        std::time::Duration::from_millis(config.login_ratelimit),
    ) {
        kick_login(&mut conn, version, &config.messages.kick_too_fast_login).await?;
        return Ok(());
    }

    let frame = timeout(config.connection_timeout(), conn.read_frame())
        .await
        .map_err(|_| ProxyError::Timeout)??;
    let (id, _) = packet_id(&frame)?;
    let login_table = table(version, ConnectionState::Login, Direction::Serverbound);
    if login_table.kind(id) != Some(PacketKind::LoginStart) {
        return Err(ProxyError::Violation("expected login start"));
    }
    let Packet::LoginStart { name, .. } = decode_frame(PacketKind::LoginStart, version, &frame)?
    else {
        unreachable!()
    };

    let minimum = config
        .minimum_protocol()
        .unwrap_or(ProtocolVersion::MINIMUM);
    if declared_protocol < minimum.number() {
        let message = config
            .messages
            .kick_below_minimum
            .replace("{minimum-version}", minimum.name());
        kick_login(&mut conn, version, &message).await?;
        return Ok(());
    }
    if declared_protocol > ProtocolVersion::MAXIMUM.number() {
        kick_login(&mut conn, version, &config.messages.kick_unsupported_version).await?;
        return Ok(());
    }

    let profile = if config.online_mode {
        match authenticate(&mut conn, &proxy, &config, version, remote, &name).await? {
            Some(profile) => profile,
            None => {
                kick_login(&mut conn, version, &config.messages.kick_online_mode_only).await?;
                return Ok(());
            }
        }
    } else {
        if config.log_offline_connections {
            info!("offline login for {name} from {remote}");
        }
        GameProfile::offline(name)
    };

    if !proxy.hooks.login(&profile, remote) {
        kick_login(&mut conn, version, &config.messages.kick_lost_connection).await?;
        return Ok(());
    }

    if config.compression_threshold >= 0 {
        send_packet(
            &mut conn,
            version,
            ConnectionState::Login,
            Direction::Clientbound,
            &Packet::SetCompression {
                threshold: config.compression_threshold,
            },
        )
        .await?;
        conn.enable_compression(config.compression_threshold, config.compression_level);
    }

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handle = Arc::new(PlayerHandle::new(
        profile.uuid,
        profile.name.clone(),
        remote,
        version,
        control_tx,
    ));
    let kick_existing = config.online_mode && config.online_mode_kick_existing_players;
    match proxy.players.admit(handle.clone(), kick_existing) {
        Admission::Admitted => {}
        Admission::Replaced(old) => {
            let _ = old.control.send(SessionCommand::Kick {
                reason: config.messages.kick_duplicate_login.clone(),
            });
        }
        Admission::Rejected => {
            kick_login(&mut conn, version, &config.messages.kick_duplicate_login).await?;
            return Ok(());
        }
    }

    info!("{} ({}) logged in from {remote}", profile.name, profile.uuid);
    let result = run_admitted(conn, &proxy, config, version, profile, &handle, control_rx, remote)
        .await;
    proxy.players.remove(&handle);
    proxy.hooks.disconnect(&handle);
    result
}

/// Online-mode key exchange and session-service validation. `None` means
/// the service refused the login.
async fn authenticate(
    conn: &mut Connection,
    proxy: &Arc<Proxy>,
    config: &Arc<ProxyConfig>,
    version: ProtocolVersion,
    remote: SocketAddr,
    name: &str,
) -> Result<Option<GameProfile>, ProxyError> {
    let token = ProxyKeyPair::new_verify_token();
    send_packet(
        conn,
        version,
        ConnectionState::Login,
        Direction::Clientbound,
        &Packet::EncryptionRequest {
            server_id: String::new(),
            public_key: proxy.keys.public_der().to_vec(),
            verify_token: token.to_vec(),
        },
    )
    .await?;

    let frame = timeout(config.connection_timeout(), conn.read_frame())
        .await
        .map_err(|_| ProxyError::Timeout)??;
    let (id, _) = packet_id(&frame)?;
    let login_table = table(version, ConnectionState::Login, Direction::Serverbound);
    if login_table.kind(id) != Some(PacketKind::EncryptionResponse) {
        return Err(ProxyError::Violation("expected encryption response"));
    }
    let Packet::EncryptionResponse {
        shared_secret,
        verify_token,
    } = decode_frame(PacketKind::EncryptionResponse, version, &frame)?
    else {
        unreachable!()
    };

    if let Some(encrypted_token) = verify_token {
        let decrypted = proxy.keys.decrypt(&encrypted_token)?;
        if decrypted != token {
            return Err(ProxyError::Auth(crate::auth::AuthError::TokenMismatch));
        }
    }

    let secret = proxy.keys.decrypt(&shared_secret)?;
    let secret: [u8; 16] = secret
        .try_into()
        .map_err(|_| ProxyError::Violation("shared secret must be 16 bytes"))?;
    conn.enable_encryption(&secret);

    let hash = server_hash("", &secret, proxy.keys.public_der());
    let ip = config
        .prevent_client_proxy_connections
        .then_some(remote.ip());
    let profile = proxy.session_service.has_joined(name, &hash, ip).await?;
    Ok(profile.filter(|p| p.name.eq_ignore_ascii_case(name)))
}

// === CONFIG / PLAY relay ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    Config,
    /// A StartConfiguration is outstanding. For a proxy-driven switch the
    /// acknowledgement is absorbed; for a backend-driven reconfiguration it
    /// is forwarded.
    AwaitConfigAck { forward: bool },
    Play,
}

enum Action {
    Continue,
    /// Install a new backend reader after a link swap.
    SwapReader(FrameReader),
    /// Stop reading the current backend (handover in progress).
    ParkReader,
    /// The backend is gone; route to a fallback or kick.
    BackendLost(Option<String>),
}

struct PendingSwitch {
    target: String,
    /// A mandatory switch (fallback after loss) kicks when it runs dry; an
    /// optional one leaves the player where they are.
    mandatory: bool,
    tried: Vec<String>,
    task: JoinHandle<Result<PreparedBackend, ProxyError>>,
}

struct Relay {
    proxy: Arc<Proxy>,
    config: Arc<ProxyConfig>,
    version: ProtocolVersion,
    profile: GameProfile,
    handle: Arc<PlayerHandle>,
    remote: SocketAddr,

    client_w: FrameWriter,
    backend: Option<Arc<RegisteredBackend>>,
    backend_w: Option<FrameWriter>,
    /// Old link kept open until the new one produces its first PLAY frame.
    retiring_w: Option<FrameWriter>,
    /// A prepared link waiting for the client's configuration ack.
    incoming: Option<(Arc<RegisteredBackend>, FrameReader, FrameWriter)>,

    client_phase: ClientPhase,
    backend_phase: BackendPhase,
    channels: HashSet<String>,
    dimension: Option<i32>,
    /// The next JoinGame is the first packet of a fresh link.
    expect_join: bool,
    /// Close `retiring_w` once a PLAY frame from the new link is relayed.
    retire_on_play_frame: bool,
}

impl Relay {
    fn backend_name(&self) -> Option<String> {
        self.backend.as_ref().map(|b| b.name.clone())
    }

    async fn kick(&mut self, message: &str) {
        let reason_json =
            TextComponent::plain(message).to_json(self.version.status_dialect());
        let packet = Packet::Disconnect { reason_json };
        let kind = match self.client_phase {
            ClientPhase::Config => PacketKind::ConfigDisconnect,
            _ => PacketKind::PlayDisconnect,
        };
        let state = match self.client_phase {
            ClientPhase::Config => ConnectionState::Config,
            _ => ConnectionState::Play,
        };
        if let Ok(payload) =
            frame_packet_as(kind, self.version, state, Direction::Clientbound, &packet)
        {
            let _ = self.client_w.write_frame(&payload).await;
        }
    }

    /// Spawn a dial toward `target`. Returns `None` for a no-op (already
    /// there and not forced, or unknown server with no fallback semantics).
    fn start_switch(&self, target: &str, force: bool, mandatory: bool) -> Option<PendingSwitch> {
        if !force && self.backend_name().as_deref() == Some(target) {
            debug!("{} is already on {target}", self.profile.name);
            return None;
        }
        let backend = self.proxy.servers.get(target)?;
        let ctx = self.backend_context();
        let task = tokio::spawn(backend::connect(backend, ctx));
        Some(PendingSwitch {
            target: target.to_owned(),
            mandatory,
            tried: vec![target.to_owned()],
            task,
        })
    }

    fn backend_context(&self) -> BackendContext {
        BackendContext {
            version: self.version,
            profile: self.profile.clone(),
            client_ip: self.remote.ip(),
            forwarding_secret: self.config.forwarding_secret.clone(),
            compression_level: self.config.compression_level,
            connect_timeout: self.config.connection_timeout(),
        }
    }

    /// A freshly prepared link is ready: begin the handover.
    async fn install_prepared(&mut self, prepared: PreparedBackend) -> Result<Action, ProxyError> {
        let (backend, phase, reader, writer) = prepared.into_split();
        match phase {
            BackendPhase::Config => match self.client_phase {
                // The client already sits in CONFIG (the old link died
                // mid-configuration); bridge the new link directly.
                ClientPhase::Config => {
                    self.incoming = Some((backend, reader, writer));
                    self.complete_config_handover().await
                }
                // The client owes an acknowledgement from an earlier
                // StartConfiguration; absorb it and hand over then.
                ClientPhase::AwaitConfigAck { .. } => {
                    self.incoming = Some((backend, reader, writer));
                    self.client_phase = ClientPhase::AwaitConfigAck { forward: false };
                    Ok(Action::ParkReader)
                }
                // Modern path: move the client into CONFIG first; the new
                // link stays parked until the acknowledgement arrives.
                ClientPhase::Play => {
                    self.incoming = Some((backend, reader, writer));
                    let payload = frame_packet(
                        self.version,
                        ConnectionState::Play,
                        Direction::Clientbound,
                        &Packet::StartConfiguration,
                    )?;
                    self.client_w.write_frame(&payload).await?;
                    self.client_phase = ClientPhase::AwaitConfigAck { forward: false };
                    Ok(Action::ParkReader)
                }
            },
            BackendPhase::Play => {
                // Legacy path: swap immediately; the JoinGame interception
                // resets the client.
                self.retiring_w = self.backend_w.replace(writer);
                self.set_backend(backend);
                self.backend_phase = BackendPhase::Play;
                self.expect_join = true;
                self.retire_on_play_frame = true;
                Ok(Action::SwapReader(reader))
            }
        }
    }

    fn set_backend(&mut self, backend: Arc<RegisteredBackend>) {
        self.handle.set_current_server(Some(backend.name.clone()));
        self.proxy.hooks.server_connected(&self.handle, &backend.name);
        info!("{} connected to {}", self.profile.name, backend.name);
        self.backend = Some(backend);
    }

    /// The client acknowledged the proxy-driven StartConfiguration: swap in
    /// the parked link and bridge its configuration data.
    async fn complete_config_handover(&mut self) -> Result<Action, ProxyError> {
        let Some((backend, reader, writer)) = self.incoming.take() else {
            return Err(ProxyError::Violation("no parked backend for handover"));
        };
        self.retiring_w = self.backend_w.replace(writer);
        self.set_backend(backend);
        self.client_phase = ClientPhase::Config;
        self.backend_phase = BackendPhase::Config;
        self.retire_on_play_frame = true;
        self.replay_channels_config().await?;
        Ok(Action::SwapReader(reader))
    }

    /// Replay the client's known plugin channels to a fresh backend during
    /// its CONFIG phase.
    async fn replay_channels_config(&mut self) -> Result<(), ProxyError> {
        if self.channels.is_empty() {
            return Ok(());
        }
        let packet = Packet::PluginMessage {
            channel: forwarding::register_channel(true).to_owned(),
            data: forwarding::encode_channel_list(
                self.channels.iter().map(String::as_str),
            ),
        };
        let payload = frame_packet_as(
            PacketKind::ConfigPluginMessage,
            self.version,
            ConnectionState::Config,
            Direction::Serverbound,
            &packet,
        )?;
        if let Some(writer) = self.backend_w.as_mut() {
            writer.write_frame(&payload).await?;
        }
        Ok(())
    }

    /// Replay channels over PLAY plugin messages (legacy switch path).
    async fn replay_channels_play(&mut self) -> Result<(), ProxyError> {
        if self.channels.is_empty() {
            return Ok(());
        }
        let modern = self.version.supports_modern_forwarding();
        let packet = Packet::PluginMessage {
            channel: forwarding::register_channel(modern).to_owned(),
            data: forwarding::encode_channel_list(
                self.channels.iter().map(String::as_str),
            ),
        };
        let payload = frame_packet(
            self.version,
            ConnectionState::Play,
            Direction::Serverbound,
            &packet,
        )?;
        if let Some(writer) = self.backend_w.as_mut() {
            writer.write_frame(&payload).await?;
        }
        Ok(())
    }

    fn track_channels(&mut self, channel: &str, data: &[u8]) {
        let modern = self.version.supports_modern_forwarding();
        if channel == forwarding::register_channel(modern) {
            for registered in forwarding::decode_channel_list(data) {
                self.channels.insert(registered);
            }
        } else if channel == forwarding::unregister_channel(modern) {
            for unregistered in forwarding::decode_channel_list(data) {
                self.channels.remove(&unregistered);
            }
        }
    }

    async fn forward_to_backend(&mut self, frame: &[u8]) -> Result<(), ProxyError> {
        if let Some(writer) = self.backend_w.as_mut() {
            writer.write_frame(frame).await?;
        }
        Ok(())
    }

    async fn forward_to_client(&mut self, frame: &[u8]) -> Result<(), ProxyError> {
        self.client_w.write_frame(frame).await?;
        if self.retire_on_play_frame && self.backend_phase == BackendPhase::Play {
            self.retire_on_play_frame = false;
            if let Some(mut old) = self.retiring_w.take() {
                let _ = old.shutdown().await;
                debug!("retired previous backend link for {}", self.profile.name);
            }
        }
        Ok(())
    }

    /// One frame from the client.
    async fn handle_serverbound(&mut self, frame: BytesMut) -> Result<Action, ProxyError> {
        let (id, _) = packet_id(&frame)?;
        match self.client_phase {
            ClientPhase::Play => {
                let play_table =
                    table(self.version, ConnectionState::Play, Direction::Serverbound);
                match play_table.kind(id) {
                    Some(PacketKind::PlayPluginMessage) => {
                        if let Ok(Packet::PluginMessage { channel, data }) =
                            decode_frame(PacketKind::PlayPluginMessage, self.version, &frame)
                        {
                            self.track_channels(&channel, &data);
                            self.proxy.hooks.plugin_message(&self.handle, &channel, &data);
                        }
                        self.forward_to_backend(&frame).await?;
                    }
                    Some(PacketKind::AcknowledgeConfiguration) => {
                        return Err(ProxyError::Violation(
                            "unsolicited configuration acknowledgement",
                        ));
                    }
                    // Everything else in PLAY relays through opaquely.
                    _ => self.forward_to_backend(&frame).await?,
                }
                Ok(Action::Continue)
            }
            ClientPhase::AwaitConfigAck { forward } => {
                let play_table =
                    table(self.version, ConnectionState::Play, Direction::Serverbound);
                if play_table.kind(id) == Some(PacketKind::AcknowledgeConfiguration) {
                    if forward {
                        self.forward_to_backend(&frame).await?;
                        self.client_phase = ClientPhase::Config;
                        Ok(Action::Continue)
                    } else {
                        self.complete_config_handover().await
                    }
                } else {
                    // Frames racing the reconfiguration are dropped; the
                    // client re-sends state after entering PLAY again.
                    trace!("dropping serverbound 0x{id:02X} during reconfiguration");
                    Ok(Action::Continue)
                }
            }
            ClientPhase::Config => {
                let config_table =
                    table(self.version, ConnectionState::Config, Direction::Serverbound);
                let Some(kind) = config_table.kind(id) else {
                    return Err(ProxyError::Violation("unknown packet in config state"));
                };
                match kind {
                    PacketKind::FinishConfigurationAck => {
                        self.forward_to_backend(&frame).await?;
                        self.client_phase = ClientPhase::Play;
                        self.backend_phase = BackendPhase::Play;
                        self.expect_join = true;
                    }
                    PacketKind::ConfigPluginMessage => {
                        if let Ok(Packet::PluginMessage { channel, data }) =
                            decode_frame(PacketKind::ConfigPluginMessage, self.version, &frame)
                        {
                            self.track_channels(&channel, &data);
                            self.proxy.hooks.plugin_message(&self.handle, &channel, &data);
                        }
                        self.forward_to_backend(&frame).await?;
                    }
                    _ => self.forward_to_backend(&frame).await?,
                }
                Ok(Action::Continue)
            }
        }
    }

    /// One frame from the current backend.
    async fn handle_clientbound(&mut self, frame: BytesMut) -> Result<Action, ProxyError> {
        let (id, _) = packet_id(&frame)?;
        match self.backend_phase {
            BackendPhase::Config => {
                let config_table =
                    table(self.version, ConnectionState::Config, Direction::Clientbound);
                let Some(kind) = config_table.kind(id) else {
                    return Err(ProxyError::Violation(
                        "unknown packet from backend in config state",
                    ));
                };
                match kind {
                    PacketKind::ConfigDisconnect => {
                        let reason = decode_frame(kind, self.version, &frame)
                            .ok()
                            .and_then(|packet| match packet {
                                Packet::Disconnect { reason_json } => Some(reason_json),
                                _ => None,
                            });
                        return Ok(Action::BackendLost(reason));
                    }
                    PacketKind::ConfigPluginMessage => {
                        let frame = self.maybe_rewrite_brand(kind, frame)?;
                        self.forward_to_client(&frame).await?;
                    }
                    _ => self.forward_to_client(&frame).await?,
                }
                Ok(Action::Continue)
            }
            BackendPhase::Play => {
                let play_table =
                    table(self.version, ConnectionState::Play, Direction::Clientbound);
                match play_table.kind(id) {
                    Some(PacketKind::PlayDisconnect) => {
                        let reason = decode_frame(
                            PacketKind::PlayDisconnect,
                            self.version,
                            &frame,
                        )
                        .ok()
                        .and_then(|packet| match packet {
                            Packet::Disconnect { reason_json } => Some(reason_json),
                            _ => None,
                        });
                        Ok(Action::BackendLost(reason))
                    }
                    Some(PacketKind::JoinGame) if self.expect_join => {
                        self.expect_join = false;
                        self.handle_join_game(frame).await?;
                        Ok(Action::Continue)
                    }
                    Some(PacketKind::StartConfiguration) => {
                        // Backend-driven reconfiguration of the live link:
                        // forwarded, and the client's ack goes back through.
                        self.forward_to_client(&frame).await?;
                        self.client_phase = ClientPhase::AwaitConfigAck { forward: true };
                        self.backend_phase = BackendPhase::Config;
                        Ok(Action::Continue)
                    }
                    Some(PacketKind::PlayPluginMessage) => {
                        let frame =
                            self.maybe_rewrite_brand(PacketKind::PlayPluginMessage, frame)?;
                        self.forward_to_client(&frame).await?;
                        Ok(Action::Continue)
                    }
                    _ => {
                        self.forward_to_client(&frame).await?;
                        Ok(Action::Continue)
                    }
                }
            }
        }
    }

    /// First packet of a fresh link: record the dimension and, for pre-1.16
    /// clients landing in the dimension they already occupy, reset them
    /// through a synthesized Respawn first.
    async fn handle_join_game(&mut self, frame: BytesMut) -> Result<(), ProxyError> {
        let decoded = decode_frame(PacketKind::JoinGame, self.version, &frame)?;
        let Packet::JoinGame {
            gamemode,
            dimension,
            ..
        } = decoded
        else {
            unreachable!()
        };

        if self.version < ProtocolVersion::V1_16 {
            if let (Some(new_dim), Some(old_dim)) = (dimension, self.dimension) {
                if new_dim == old_dim {
                    let detour = if new_dim == 0 { -1 } else { 0 };
                    let respawn = Packet::Respawn {
                        dimension: detour,
                        gamemode,
                    };
                    let payload = frame_packet(
                        self.version,
                        ConnectionState::Play,
                        Direction::Clientbound,
                        &respawn,
                    )?;
                    self.client_w.write_frame(&payload).await?;
                }
            }
        }
        self.dimension = dimension;
        self.forward_to_client(&frame).await?;
        self.replay_channels_play().await
    }

    /// Append the proxy's brand to `minecraft:brand` payloads.
    fn maybe_rewrite_brand(
        &self,
        kind: PacketKind,
        frame: BytesMut,
    ) -> Result<BytesMut, ProxyError> {
        if self.version < ProtocolVersion::V1_8 {
            return Ok(frame);
        }
        let modern = self.version.supports_modern_forwarding();
        let Ok(Packet::PluginMessage { channel, data }) =
            decode_frame(kind, self.version, &frame)
        else {
            return Ok(frame);
        };
        if channel != forwarding::brand_channel(modern) {
            return Ok(frame);
        }
        let rewritten = Packet::PluginMessage {
            channel,
            data: forwarding::rewrite_brand(&data, &self.config.server_brand),
        };
        let state = match kind {
            PacketKind::ConfigPluginMessage => ConnectionState::Config,
            _ => ConnectionState::Play,
        };
        frame_packet_as(kind, self.version, state, Direction::Clientbound, &rewritten)
    }
}

// === The admitted-session event loop ===

#[allow(clippy::too_many_arguments)]
async fn run_admitted(
    mut conn: Connection,
    proxy: &Arc<Proxy>,
    config: Arc<ProxyConfig>,
    version: ProtocolVersion,
    profile: GameProfile,
    handle: &Arc<PlayerHandle>,
    mut control_rx: mpsc::UnboundedReceiver<SessionCommand>,
    remote: SocketAddr,
) -> Result<(), ProxyError> {
    send_packet(
        &mut conn,
        version,
        ConnectionState::Login,
        Direction::Clientbound,
        &Packet::LoginSuccess {
            profile: profile.clone(),
        },
    )
    .await?;

    if version.has_config_state() {
        let frame = timeout(config.connection_timeout(), conn.read_frame())
            .await
            .map_err(|_| ProxyError::Timeout)??;
        let (id, _) = packet_id(&frame)?;
        let login_table = table(version, ConnectionState::Login, Direction::Serverbound);
        if login_table.kind(id) != Some(PacketKind::LoginAcknowledged) {
            return Err(ProxyError::Violation("expected login acknowledgement"));
        }
    }

    // Pick and dial the first backend, walking the fallback list on failure.
    let snapshot = proxy.servers.snapshot();
    let first_choice = snapshot
        .fallbacks()
        .first()
        .cloned()
        .ok_or_else(|| ProxyError::Unreachable("no servers configured".into()))?;
    let target = proxy.hooks.server_pre_connect(handle, &first_choice);

    let ctx = BackendContext {
        version,
        profile: profile.clone(),
        client_ip: remote.ip(),
        forwarding_secret: config.forwarding_secret.clone(),
        compression_level: config.compression_level,
        connect_timeout: config.connection_timeout(),
    };

    let mut tried = Vec::new();
    let mut chosen = proxy.servers.get(&target);
    let prepared = loop {
        let Some(backend) = chosen.take() else {
            kick_post_login(&mut conn, version, &config.messages.kick_lost_connection).await?;
            return Ok(());
        };
        tried.push(backend.name.clone());
        match backend::connect(backend, ctx.clone()).await {
            Ok(prepared) => break prepared,
            Err(err) => {
                warn!("initial connect for {} failed: {err}", profile.name);
                chosen = proxy.servers.choose_fallback(
                    config.enable_dynamic_fallbacks,
                    &tried,
                    |name| proxy.players.count_on(name),
                );
            }
        }
    };

    let (client_r, client_w) = conn.into_split();
    let (backend_arc, phase, backend_r, backend_w) = prepared.into_split();

    let mut relay = Relay {
        proxy: proxy.clone(),
        config: config.clone(),
        version,
        profile,
        handle: handle.clone(),
        remote,
        client_w,
        backend: None,
        backend_w: Some(backend_w),
        retiring_w: None,
        incoming: None,
        client_phase: match phase {
            BackendPhase::Config => ClientPhase::Config,
            BackendPhase::Play => ClientPhase::Play,
        },
        backend_phase: phase,
        channels: HashSet::new(),
        dimension: None,
        expect_join: phase == BackendPhase::Play,
        retire_on_play_frame: false,
    };
    relay.set_backend(backend_arc);

    run_relay(relay, client_r, backend_r, &mut control_rx).await
}

/// Kick a client that already passed LOGIN: modern clients sit in CONFIG at
/// this point, older ones in PLAY.
async fn kick_post_login(
    conn: &mut Connection,
    version: ProtocolVersion,
    message: &str,
) -> Result<(), ProxyError> {
    let reason_json = TextComponent::plain(message).to_json(version.status_dialect());
    let packet = Packet::Disconnect { reason_json };
    let (kind, state) = if version.has_config_state() {
        (PacketKind::ConfigDisconnect, ConnectionState::Config)
    } else {
        (PacketKind::PlayDisconnect, ConnectionState::Play)
    };
    let payload = frame_packet_as(kind, version, state, Direction::Clientbound, &packet)?;
    conn.write_frame(&payload).await?;
    Ok(())
}

async fn run_relay(
    mut relay: Relay,
    mut client_r: FrameReader,
    backend_r: FrameReader,
    control_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<(), ProxyError> {
    let mut backend_r = Some(backend_r);
    let mut pending: Option<PendingSwitch> = None;
    let idle = relay.config.read_timeout();

    loop {
        tokio::select! {
            biased;

            _ = relay.proxy.shutdown.cancelled() => {
                let message = relay.config.messages.kick_proxy_shutdown.clone();
                relay.kick(&message).await;
                return Ok(());
            }

            command = control_rx.recv() => match command {
                None => return Ok(()),
                Some(SessionCommand::Kick { reason }) => {
                    relay.kick(&reason).await;
                    return Ok(());
                }
                Some(SessionCommand::Switch { target, force }) => {
                    if pending.is_some() {
                        debug!("switch for {} already in flight", relay.profile.name);
                    } else {
                        pending = relay.start_switch(&target, force, false);
                    }
                }
            },

            joined = async { (&mut pending.as_mut().unwrap().task).await }, if pending.is_some() => {
                let finished = pending.take().unwrap();
                match joined {
                    Ok(Ok(prepared)) => match relay.install_prepared(prepared).await? {
                        Action::SwapReader(reader) => backend_r = Some(reader),
                        Action::ParkReader => backend_r = None,
                        _ => {}
                    },
                    Ok(Err(err)) => {
                        warn!("switch to {} failed for {}: {err}", finished.target, relay.profile.name);
                        if finished.mandatory {
                            pending = next_fallback_switch(&relay, finished.tried);
                            if pending.is_none() {
                                let message = relay.config.messages.kick_lost_connection.clone();
                                relay.kick(&message).await;
                                return Ok(());
                            }
                        }
                    }
                    Err(join_error) => {
                        warn!("switch task for {} panicked: {join_error}", relay.profile.name);
                    }
                }
            },

            frame = client_r.read_frame() => match frame {
                Err(err) => {
                    trace!("client read ended for {}: {err}", relay.profile.name);
                    return Ok(());
                }
                Ok(frame) => match relay.handle_serverbound(frame).await? {
                    Action::SwapReader(reader) => backend_r = Some(reader),
                    Action::ParkReader => backend_r = None,
                    Action::BackendLost(_) | Action::Continue => {}
                },
            },

            frame = async { backend_r.as_mut().unwrap().read_frame().await },
                if backend_r.is_some() && relay.incoming.is_none() =>
            {
                let lost = match frame {
                    Err(err) => {
                        debug!("backend read ended for {}: {err}", relay.profile.name);
                        Some(None)
                    }
                    Ok(frame) => match relay.handle_clientbound(frame).await? {
                        Action::BackendLost(reason) => Some(reason),
                        Action::SwapReader(reader) => {
                            backend_r = Some(reader);
                            None
                        }
                        Action::ParkReader => {
                            backend_r = None;
                            None
                        }
                        Action::Continue => None,
                    },
                };
                if let Some(reason) = lost {
                    if let Some(reason) = &reason {
                        debug!("{} was disconnected by the backend: {reason}", relay.profile.name);
                    }
                    backend_r = None;
                    relay.backend_w = None;
                    let tried = relay.backend_name().into_iter().collect();
                    pending = next_fallback_switch(&relay, tried);
                    if pending.is_none() {
                        let message = relay.config.messages.kick_lost_connection.clone();
                        relay.kick(&message).await;
                        return Ok(());
                    }
                }
            },

            _ = tokio::time::sleep(idle) => {
                debug!("session for {} idled out", relay.profile.name);
                return Ok(());
            }
        }
    }
}

/// Spawn a mandatory switch to the next usable fallback, or `None` when the
/// list is exhausted.
fn next_fallback_switch(relay: &Relay, tried: Vec<String>) -> Option<PendingSwitch> {
    let fallback = relay.proxy.servers.choose_fallback(
        relay.config.enable_dynamic_fallbacks,
        &tried,
        |name| relay.proxy.players.count_on(name),
    )?;
    let ctx = relay.backend_context();
    let mut all_tried = tried;
    all_tried.push(fallback.name.clone());
    let task = tokio::spawn(backend::connect(fallback.clone(), ctx));
    Some(PendingSwitch {
        target: fallback.name.clone(),
        mandatory: true,
        tried: all_tried,
        task,
    })
}
