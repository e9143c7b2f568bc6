use bytes::{BufMut, BytesMut};
use conduit_types::{GameProfile, ProfileProperty};
use uuid::Uuid;

use crate::codec::*;
use crate::registry::PacketKind;
use crate::version::ProtocolVersion;

/// A decoded packet the proxy understands.
///
/// Only traffic the proxy itself inspects or synthesizes is typed here; the
/// relay forwards everything else as raw frames without constructing one of
/// these.
#[derive(Debug, Clone)]
pub enum Packet {
    Handshake {
        protocol: i32,
        server_address: String,
        server_port: u16,
        next_state: i32,
    },

    StatusRequest,
    StatusResponse {
        json: String,
    },
    StatusPing {
        payload: i64,
    },
    StatusPong {
        payload: i64,
    },

    LoginStart {
        name: String,
        uuid: Option<Uuid>,
    },
    EncryptionRequest {
        server_id: String,
        public_key: Vec<u8>,
        verify_token: Vec<u8>,
    },
    EncryptionResponse {
        shared_secret: Vec<u8>,
        /// `None` when a 1.19–1.19.1 client answered with the salted
        /// signature layout instead of the echoed token.
        verify_token: Option<Vec<u8>>,
    },
    SetCompression {
        threshold: i32,
    },
    LoginSuccess {
        profile: GameProfile,
    },
    LoginDisconnect {
        reason_json: String,
    },
    LoginAcknowledged,
    LoginPluginRequest {
        message_id: i32,
        channel: String,
        data: Vec<u8>,
    },
    LoginPluginResponse {
        message_id: i32,
        data: Option<Vec<u8>>,
    },

    PluginMessage {
        channel: String,
        data: Vec<u8>,
    },
    Disconnect {
        reason_json: String,
    },
    KeepAlive {
        id: i64,
    },

    FinishConfiguration,
    FinishConfigurationAck,
    StartConfiguration,
    AcknowledgeConfiguration,

    /// Partially decoded: only the fields the switch coordinator needs, with
    /// the undecoded tail preserved for verbatim re-emission.
    JoinGame {
        entity_id: i32,
        gamemode: u8,
        /// Numeric dimension for pre-1.16 protocols; later revisions carry
        /// registry-keyed dimensions the proxy does not interpret.
        dimension: Option<i32>,
        rest: Vec<u8>,
    },
    /// Synthesized for pre-1.16 clients during a backend switch.
    Respawn {
        dimension: i32,
        gamemode: u8,
    },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake { .. } => PacketKind::Handshake,
            Packet::StatusRequest => PacketKind::StatusRequest,
            Packet::StatusResponse { .. } => PacketKind::StatusResponse,
            Packet::StatusPing { .. } => PacketKind::StatusPing,
            Packet::StatusPong { .. } => PacketKind::StatusPong,
            Packet::LoginStart { .. } => PacketKind::LoginStart,
            Packet::EncryptionRequest { .. } => PacketKind::EncryptionRequest,
            Packet::EncryptionResponse { .. } => PacketKind::EncryptionResponse,
            Packet::SetCompression { .. } => PacketKind::SetCompression,
            Packet::LoginSuccess { .. } => PacketKind::LoginSuccess,
            Packet::LoginDisconnect { .. } => PacketKind::LoginDisconnect,
            Packet::LoginAcknowledged => PacketKind::LoginAcknowledged,
            Packet::LoginPluginRequest { .. } => PacketKind::LoginPluginRequest,
            Packet::LoginPluginResponse { .. } => PacketKind::LoginPluginResponse,
            Packet::PluginMessage { .. } => PacketKind::PlayPluginMessage,
            Packet::Disconnect { .. } => PacketKind::PlayDisconnect,
            Packet::KeepAlive { .. } => PacketKind::PlayKeepAlive,
            Packet::FinishConfiguration => PacketKind::FinishConfiguration,
            Packet::FinishConfigurationAck => PacketKind::FinishConfigurationAck,
            Packet::StartConfiguration => PacketKind::StartConfiguration,
            Packet::AcknowledgeConfiguration => PacketKind::AcknowledgeConfiguration,
            Packet::JoinGame { .. } => PacketKind::JoinGame,
            Packet::Respawn { .. } => PacketKind::Respawn,
        }
    }

    /// Decode a packet body (the bytes after the packet ID).
    pub fn decode(
        kind: PacketKind,
        version: ProtocolVersion,
        data: &mut BytesMut,
    ) -> CodecResult<Packet> {
        use ProtocolVersion as V;
        match kind {
            PacketKind::Handshake => Ok(Packet::Handshake {
                protocol: read_varint(data)?,
                server_address: read_string(data, 255)?,
                server_port: read_u16(data)?,
                next_state: read_varint(data)?,
            }),

            PacketKind::StatusRequest => Ok(Packet::StatusRequest),
            PacketKind::StatusResponse => Ok(Packet::StatusResponse {
                json: read_string(data, 32767)?,
            }),
            PacketKind::StatusPing => Ok(Packet::StatusPing {
                payload: read_i64(data)?,
            }),
            PacketKind::StatusPong => Ok(Packet::StatusPong {
                payload: read_i64(data)?,
            }),

            PacketKind::LoginStart => {
                let name = read_string(data, 16)?;
                let uuid = if version >= V::V1_20_2 {
                    Some(read_uuid(data)?)
                } else if version >= V::V1_19_4 {
                    // Optional UUID only; the signature block left in 1.19.3.
                    if read_bool(data)? {
                        Some(read_uuid(data)?)
                    } else {
                        None
                    }
                } else if version == V::V1_19_1 {
                    // Optional signature block, then optional UUID.
                    if read_bool(data)? {
                        let _timestamp = read_i64(data)?;
                        let _key = read_byte_array(data)?;
                        let _sig = read_byte_array(data)?;
                    }
                    if read_bool(data)? {
                        Some(read_uuid(data)?)
                    } else {
                        None
                    }
                } else if version == V::V1_19 {
                    if read_bool(data)? {
                        let _timestamp = read_i64(data)?;
                        let _key = read_byte_array(data)?;
                        let _sig = read_byte_array(data)?;
                    }
                    None
                } else {
                    None
                };
                Ok(Packet::LoginStart { name, uuid })
            }

            PacketKind::EncryptionRequest => {
                let server_id = read_string(data, 20)?;
                let (public_key, verify_token) = if version < V::V1_8 {
                    (read_short_byte_array(data)?, read_short_byte_array(data)?)
                } else {
                    (read_byte_array(data)?, read_byte_array(data)?)
                };
                Ok(Packet::EncryptionRequest {
                    server_id,
                    public_key,
                    verify_token,
                })
            }

            PacketKind::EncryptionResponse => {
                if version < V::V1_8 {
                    Ok(Packet::EncryptionResponse {
                        shared_secret: read_short_byte_array(data)?,
                        verify_token: Some(read_short_byte_array(data)?),
                    })
                } else if version == V::V1_19 || version == V::V1_19_1 {
                    let shared_secret = read_byte_array(data)?;
                    let verify_token = if read_bool(data)? {
                        Some(read_byte_array(data)?)
                    } else {
                        // Salted-signature layout; the session service still
                        // validates the shared secret via the server hash.
                        let _salt = read_i64(data)?;
                        let _sig = read_byte_array(data)?;
                        None
                    };
                    Ok(Packet::EncryptionResponse {
                        shared_secret,
                        verify_token,
                    })
                } else {
                    Ok(Packet::EncryptionResponse {
                        shared_secret: read_byte_array(data)?,
                        verify_token: Some(read_byte_array(data)?),
                    })
                }
            }

            PacketKind::SetCompression => Ok(Packet::SetCompression {
                threshold: read_varint(data)?,
            }),

            PacketKind::LoginSuccess => {
                let uuid = if version < V::V1_16 {
                    let s = read_string(data, 36)?;
                    Uuid::parse_str(&s).map_err(|_| CodecError::BadString)?
                } else {
                    read_uuid(data)?
                };
                let name = read_string(data, 16)?;
                let mut properties = Vec::new();
                if version >= V::V1_19 {
                    let count = read_varint(data)?;
                    if count < 0 {
                        return Err(CodecError::NegativeLength);
                    }
                    for _ in 0..count {
                        let name = read_string(data, 64)?;
                        let value = read_string(data, 32767)?;
                        let signature = if read_bool(data)? {
                            Some(read_string(data, 1024)?)
                        } else {
                            None
                        };
                        properties.push(ProfileProperty {
                            name,
                            value,
                            signature,
                        });
                    }
                }
                if version == V::V1_20_5 || version == V::V1_21 {
                    let _strict_error_handling = read_bool(data)?;
                }
                Ok(Packet::LoginSuccess {
                    profile: GameProfile {
                        uuid,
                        name,
                        properties,
                    },
                })
            }

            PacketKind::LoginDisconnect => Ok(Packet::LoginDisconnect {
                reason_json: read_string(data, 262144)?,
            }),
            PacketKind::LoginAcknowledged => Ok(Packet::LoginAcknowledged),

            PacketKind::LoginPluginRequest => Ok(Packet::LoginPluginRequest {
                message_id: read_varint(data)?,
                channel: read_string(data, 256)?,
                data: data.split_to(data.len()).to_vec(),
            }),
            PacketKind::LoginPluginResponse => {
                let message_id = read_varint(data)?;
                let data = if read_bool(data)? {
                    Some(data.split_to(data.len()).to_vec())
                } else {
                    None
                };
                Ok(Packet::LoginPluginResponse { message_id, data })
            }

            PacketKind::PlayPluginMessage | PacketKind::ConfigPluginMessage => {
                let channel = read_string(data, 256)?;
                let body = if version < V::V1_8 {
                    read_short_byte_array(data)?
                } else {
                    data.split_to(data.len()).to_vec()
                };
                Ok(Packet::PluginMessage {
                    channel,
                    data: body,
                })
            }

            PacketKind::PlayDisconnect | PacketKind::ConfigDisconnect => Ok(Packet::Disconnect {
                reason_json: read_string(data, 262144)?,
            }),

            PacketKind::PlayKeepAlive | PacketKind::ConfigKeepAlive => {
                let id = if version < V::V1_8 {
                    read_i32(data)? as i64
                } else if version < V::V1_12_2 {
                    read_varint(data)? as i64
                } else {
                    read_i64(data)?
                };
                Ok(Packet::KeepAlive { id })
            }

            PacketKind::FinishConfiguration => Ok(Packet::FinishConfiguration),
            PacketKind::FinishConfigurationAck => Ok(Packet::FinishConfigurationAck),
            PacketKind::StartConfiguration => Ok(Packet::StartConfiguration),
            PacketKind::AcknowledgeConfiguration => Ok(Packet::AcknowledgeConfiguration),

            PacketKind::JoinGame => {
                let entity_id = read_i32(data)?;
                let (gamemode, dimension) = if version < V::V1_16 {
                    let gamemode = read_u8(data)?;
                    let dimension = if version < V::V1_9_4 {
                        read_i8(data)? as i32
                    } else {
                        read_i32(data)?
                    };
                    (gamemode, Some(dimension))
                } else {
                    (0, None)
                };
                Ok(Packet::JoinGame {
                    entity_id,
                    gamemode,
                    dimension,
                    rest: data.split_to(data.len()).to_vec(),
                })
            }

            _ => Err(CodecError::BadPacket("kind has no typed decoder")),
        }
    }

    /// Encode the packet body (the bytes after the packet ID).
    pub fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> CodecResult<()> {
        use ProtocolVersion as V;
        match self {
            Packet::Handshake {
                protocol,
                server_address,
                server_port,
                next_state,
            } => {
                write_varint(buf, *protocol);
                write_string(buf, server_address);
                buf.put_u16(*server_port);
                write_varint(buf, *next_state);
            }

            Packet::StatusRequest => {}
            Packet::StatusResponse { json } => write_string(buf, json),
            Packet::StatusPing { payload } => buf.put_i64(*payload),
            Packet::StatusPong { payload } => buf.put_i64(*payload),

            Packet::LoginStart { name, uuid } => {
                write_string(buf, name);
                if version >= V::V1_20_2 {
                    write_uuid(buf, &uuid.unwrap_or_else(Uuid::nil));
                } else if version >= V::V1_19_4 {
                    match uuid {
                        Some(u) => {
                            buf.put_u8(1);
                            write_uuid(buf, u);
                        }
                        None => buf.put_u8(0),
                    }
                } else if version == V::V1_19_1 {
                    buf.put_u8(0);
                    match uuid {
                        Some(u) => {
                            buf.put_u8(1);
                            write_uuid(buf, u);
                        }
                        None => buf.put_u8(0),
                    }
                } else if version == V::V1_19 {
                    buf.put_u8(0);
                }
            }

            Packet::EncryptionRequest {
                server_id,
                public_key,
                verify_token,
            } => {
                write_string(buf, server_id);
                if version < V::V1_8 {
                    write_short_byte_array(buf, public_key);
                    write_short_byte_array(buf, verify_token);
                } else {
                    write_byte_array(buf, public_key);
                    write_byte_array(buf, verify_token);
                }
                if version >= V::V1_20_5 {
                    // should-authenticate: the proxy performs the session
                    // lookup itself.
                    buf.put_u8(1);
                }
            }

            Packet::EncryptionResponse {
                shared_secret,
                verify_token,
            } => {
                let token = verify_token
                    .as_deref()
                    .ok_or(CodecError::BadPacket("cannot re-encode signature layout"))?;
                if version < V::V1_8 {
                    write_short_byte_array(buf, shared_secret);
                    write_short_byte_array(buf, token);
                } else {
                    write_byte_array(buf, shared_secret);
                    write_byte_array(buf, token);
                }
            }

            Packet::SetCompression { threshold } => write_varint(buf, *threshold),

            Packet::LoginSuccess { profile } => {
                if version < V::V1_16 {
                    write_string(buf, &profile.uuid.hyphenated().to_string());
                } else {
                    write_uuid(buf, &profile.uuid);
                }
                write_string(buf, &profile.name);
                if version >= V::V1_19 {
                    write_varint(buf, profile.properties.len() as i32);
                    for p in &profile.properties {
                        write_string(buf, &p.name);
                        write_string(buf, &p.value);
                        match &p.signature {
                            Some(sig) => {
                                buf.put_u8(1);
                                write_string(buf, sig);
                            }
                            None => buf.put_u8(0),
                        }
                    }
                }
                if version == V::V1_20_5 || version == V::V1_21 {
                    buf.put_u8(1);
                }
            }

            Packet::LoginDisconnect { reason_json } => write_string(buf, reason_json),
            Packet::LoginAcknowledged => {}

            Packet::LoginPluginRequest {
                message_id,
                channel,
                data,
            } => {
                write_varint(buf, *message_id);
                write_string(buf, channel);
                buf.put_slice(data);
            }
            Packet::LoginPluginResponse { message_id, data } => {
                write_varint(buf, *message_id);
                match data {
                    Some(data) => {
                        buf.put_u8(1);
                        buf.put_slice(data);
                    }
                    None => buf.put_u8(0),
                }
            }

            Packet::PluginMessage { channel, data } => {
                write_string(buf, channel);
                if version < V::V1_8 {
                    write_short_byte_array(buf, data);
                } else {
                    buf.put_slice(data);
                }
            }

            Packet::Disconnect { reason_json } => write_string(buf, reason_json),

            Packet::KeepAlive { id } => {
                if version < V::V1_8 {
                    buf.put_i32(*id as i32);
                } else if version < V::V1_12_2 {
                    write_varint(buf, *id as i32);
                } else {
                    buf.put_i64(*id);
                }
            }

            Packet::FinishConfiguration
            | Packet::FinishConfigurationAck
            | Packet::StartConfiguration
            | Packet::AcknowledgeConfiguration => {}

            Packet::JoinGame {
                entity_id,
                gamemode,
                dimension,
                rest,
            } => {
                buf.put_i32(*entity_id);
                if version < V::V1_16 {
                    buf.put_u8(*gamemode);
                    let dimension = dimension.unwrap_or(0);
                    if version < V::V1_9_4 {
                        buf.put_i8(dimension as i8);
                    } else {
                        buf.put_i32(dimension);
                    }
                }
                buf.put_slice(rest);
            }

            Packet::Respawn {
                dimension,
                gamemode,
            } => {
                // Pre-1.16 layout only; later protocols never get a
                // synthesized Respawn from the proxy.
                buf.put_i32(*dimension);
                if version < V::V1_14 {
                    buf.put_u8(1); // difficulty: easy
                }
                if version >= V::V1_15 {
                    buf.put_i64(0); // hashed seed
                }
                buf.put_u8(*gamemode);
                write_string(buf, "default");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PacketKind;

    fn roundtrip(packet: &Packet, kind: PacketKind, version: ProtocolVersion) -> Packet {
        let mut buf = BytesMut::new();
        packet.encode(version, &mut buf).unwrap();
        Packet::decode(kind, version, &mut buf).unwrap()
    }

    #[test]
    fn handshake_roundtrip() {
        let p = Packet::Handshake {
            protocol: 767,
            server_address: "play.example.org".into(),
            server_port: 25565,
            next_state: 2,
        };
        let decoded = roundtrip(&p, PacketKind::Handshake, ProtocolVersion::V1_21);
        match decoded {
            Packet::Handshake {
                protocol,
                server_address,
                server_port,
                next_state,
            } => {
                assert_eq!(protocol, 767);
                assert_eq!(server_address, "play.example.org");
                assert_eq!(server_port, 25565);
                assert_eq!(next_state, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn login_start_gains_uuid_on_modern_protocols() {
        let uuid = Uuid::new_v4();
        let p = Packet::LoginStart {
            name: "Alice".into(),
            uuid: Some(uuid),
        };
        match roundtrip(&p, PacketKind::LoginStart, ProtocolVersion::V1_20_3) {
            Packet::LoginStart { name, uuid: u } => {
                assert_eq!(name, "Alice");
                assert_eq!(u, Some(uuid));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn login_start_is_name_only_on_legacy_protocols() {
        let p = Packet::LoginStart {
            name: "Alice".into(),
            uuid: Some(Uuid::new_v4()),
        };
        match roundtrip(&p, PacketKind::LoginStart, ProtocolVersion::V1_8) {
            Packet::LoginStart { name, uuid } => {
                assert_eq!(name, "Alice");
                assert_eq!(uuid, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn encryption_arrays_use_short_prefix_on_1_7() {
        let p = Packet::EncryptionResponse {
            shared_secret: vec![1; 16],
            verify_token: Some(vec![2; 4]),
        };
        let mut buf = BytesMut::new();
        p.encode(ProtocolVersion::V1_7_2, &mut buf).unwrap();
        // i16 length prefix, not varint
        assert_eq!(&buf[..2], &[0x00, 0x10]);
        match Packet::decode(
            PacketKind::EncryptionResponse,
            ProtocolVersion::V1_7_2,
            &mut buf,
        )
        .unwrap()
        {
            Packet::EncryptionResponse {
                shared_secret,
                verify_token,
            } => {
                assert_eq!(shared_secret, vec![1; 16]);
                assert_eq!(verify_token, Some(vec![2; 4]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn login_success_uuid_is_a_string_before_1_16() {
        let profile = GameProfile::new(Uuid::new_v4(), "Alice");
        let p = Packet::LoginSuccess {
            profile: profile.clone(),
        };
        match roundtrip(&p, PacketKind::LoginSuccess, ProtocolVersion::V1_8) {
            Packet::LoginSuccess { profile: got } => {
                assert_eq!(got.uuid, profile.uuid);
                assert_eq!(got.name, "Alice");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn login_success_carries_properties_from_1_19() {
        let mut profile = GameProfile::new(Uuid::new_v4(), "Alice");
        profile
            .properties
            .push(ProfileProperty::new("textures", "dGV4dHVyZQ=="));
        let p = Packet::LoginSuccess { profile };
        match roundtrip(&p, PacketKind::LoginSuccess, ProtocolVersion::V1_21) {
            Packet::LoginSuccess { profile } => {
                assert_eq!(profile.properties.len(), 1);
                assert_eq!(profile.properties[0].name, "textures");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keep_alive_width_varies_by_version() {
        let p = Packet::KeepAlive { id: 0x1234 };
        let mut buf = BytesMut::new();
        p.encode(ProtocolVersion::V1_7_2, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);

        let mut buf = BytesMut::new();
        p.encode(ProtocolVersion::V1_8, &mut buf).unwrap();
        assert!(buf.len() <= 3);

        let mut buf = BytesMut::new();
        p.encode(ProtocolVersion::V1_21, &mut buf).unwrap();
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn join_game_preserves_undecoded_tail() {
        let p = Packet::JoinGame {
            entity_id: 7,
            gamemode: 1,
            dimension: Some(-1),
            rest: vec![0xAA, 0xBB],
        };
        match roundtrip(&p, PacketKind::JoinGame, ProtocolVersion::V1_8) {
            Packet::JoinGame {
                entity_id,
                gamemode,
                dimension,
                rest,
            } => {
                assert_eq!(entity_id, 7);
                assert_eq!(gamemode, 1);
                assert_eq!(dimension, Some(-1));
                assert_eq!(rest, vec![0xAA, 0xBB]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
