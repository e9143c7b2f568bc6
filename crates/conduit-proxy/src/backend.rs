use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use conduit_protocol::{
    table, Connection, ConnectionState, Direction, FrameReader, FrameWriter, Packet,
    PacketKind, ProtocolVersion,
};
use conduit_types::GameProfile;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::ProxyError;
use crate::forwarding::{self, ForwardingMode};
use crate::servers::RegisteredBackend;
use crate::wire::{decode_frame, packet_id, send_packet};

/// Where the backend handshake left off: modern protocols hand over in
/// CONFIG, older ones directly in PLAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    Config,
    Play,
}

/// A backend connection driven through LOGIN on behalf of one session,
/// ready to be bridged to the client.
pub struct PreparedBackend {
    pub backend: Arc<RegisteredBackend>,
    pub conn: Connection,
    pub phase: BackendPhase,
}

impl PreparedBackend {
    pub fn into_split(self) -> (Arc<RegisteredBackend>, BackendPhase, FrameReader, FrameWriter) {
        let (reader, writer) = self.conn.into_split();
        (self.backend, self.phase, reader, writer)
    }
}

/// Everything the dial task needs; cheap to clone into a spawned switch.
#[derive(Clone)]
pub struct BackendContext {
    pub version: ProtocolVersion,
    pub profile: GameProfile,
    pub client_ip: IpAddr,
    pub forwarding_secret: String,
    pub compression_level: u32,
    pub connect_timeout: Duration,
}

/// Dial a backend and drive it through LOGIN. On return the link is in
/// CONFIG (modern) or PLAY (legacy) and has produced no game traffic yet.
pub async fn connect(
    backend: Arc<RegisteredBackend>,
    ctx: BackendContext,
) -> Result<PreparedBackend, ProxyError> {
    if backend.forwarding == ForwardingMode::Modern && !ctx.version.supports_modern_forwarding() {
        return Err(ProxyError::ForwardingUnsupported);
    }

    let stream = timeout(ctx.connect_timeout, TcpStream::connect(&backend.address))
        .await
        .map_err(|_| ProxyError::Unreachable(format!("{}: dial timed out", backend.name)))?
        .map_err(|err| ProxyError::Unreachable(format!("{}: {err}", backend.name)))?;
    stream.set_nodelay(true)?;
    let mut conn = Connection::new(stream);

    let handshake_address = match backend.forwarding {
        ForwardingMode::Legacy => forwarding::legacy_handshake_address(
            backend.host(),
            ctx.client_ip,
            &ctx.profile,
            None,
        ),
        ForwardingMode::Bungeeguard => forwarding::legacy_handshake_address(
            backend.host(),
            ctx.client_ip,
            &ctx.profile,
            Some(&ctx.forwarding_secret),
        ),
        ForwardingMode::None | ForwardingMode::Modern => backend.host().to_owned(),
    };

    send_packet(
        &mut conn,
        ctx.version,
        ConnectionState::Handshake,
        Direction::Serverbound,
        &Packet::Handshake {
            protocol: ctx.version.number(),
            server_address: handshake_address,
            server_port: backend.port(),
            next_state: 2,
        },
    )
    .await?;

    send_packet(
        &mut conn,
        ctx.version,
        ConnectionState::Login,
        Direction::Serverbound,
        &Packet::LoginStart {
            name: ctx.profile.name.clone(),
            uuid: Some(ctx.profile.uuid),
        },
    )
    .await?;

    // Drive the backend's login until LoginSuccess.
    let login_table = table(ctx.version, ConnectionState::Login, Direction::Clientbound);
    let deadline = tokio::time::Instant::now() + ctx.connect_timeout;
    loop {
        let frame = timeout(
            deadline.saturating_duration_since(tokio::time::Instant::now()),
            conn.read_frame(),
        )
        .await
        .map_err(|_| ProxyError::Unreachable(format!("{}: login timed out", backend.name)))??;

        let (id, _) = packet_id(&frame)?;
        let Some(kind) = login_table.kind(id) else {
            return Err(ProxyError::Violation("unknown login packet from backend"));
        };
        match kind {
            PacketKind::LoginDisconnect => {
                let packet = decode_frame(kind, ctx.version, &frame)?;
                let Packet::LoginDisconnect { reason_json } = packet else {
                    unreachable!()
                };
                return Err(ProxyError::BackendKicked(reason_json));
            }
            PacketKind::EncryptionRequest => return Err(ProxyError::OnlineModeBackend),
            PacketKind::SetCompression => {
                let Packet::SetCompression { threshold } =
                    decode_frame(kind, ctx.version, &frame)?
                else {
                    unreachable!()
                };
                if threshold >= 0 {
                    conn.enable_compression(threshold, ctx.compression_level);
                }
                trace!("backend {} set compression {threshold}", backend.name);
            }
            PacketKind::LoginPluginRequest => {
                let Packet::LoginPluginRequest {
                    message_id,
                    channel,
                    ..
                } = decode_frame(kind, ctx.version, &frame)?
                else {
                    unreachable!()
                };
                let response = if channel == forwarding::PLAYER_INFO_CHANNEL
                    && backend.forwarding == ForwardingMode::Modern
                {
                    debug!("answering forwarding request from {}", backend.name);
                    Packet::LoginPluginResponse {
                        message_id,
                        data: Some(forwarding::modern_forwarding_payload(
                            ctx.forwarding_secret.as_bytes(),
                            ctx.client_ip,
                            &ctx.profile,
                        )),
                    }
                } else {
                    Packet::LoginPluginResponse {
                        message_id,
                        data: None,
                    }
                };
                send_packet(
                    &mut conn,
                    ctx.version,
                    ConnectionState::Login,
                    Direction::Serverbound,
                    &response,
                )
                .await?;
            }
            PacketKind::LoginSuccess => break,
            _ => return Err(ProxyError::Violation("unexpected login packet from backend")),
        }
    }

    let phase = if ctx.version.has_config_state() {
        send_packet(
            &mut conn,
            ctx.version,
            ConnectionState::Login,
            Direction::Serverbound,
            &Packet::LoginAcknowledged,
        )
        .await?;
        BackendPhase::Config
    } else {
        BackendPhase::Play
    };

    debug!(
        "backend {} ready for {} in {:?}",
        backend.name, ctx.profile.name, phase
    );
    Ok(PreparedBackend {
        backend,
        conn,
        phase,
    })
}
