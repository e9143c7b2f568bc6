use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::state::ConnectionState;
use crate::version::{ProtocolVersion, SUPPORTED_VERSIONS};

/// Which peer produced a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Serverbound,
    Clientbound,
}

/// Every packet the proxy disciplines by ID.
///
/// PLAY traffic outside this set is relayed opaquely; traffic outside this
/// set in any other state is a protocol violation. Kinds the proxy never
/// decodes (registry data, tags, resource packs) still appear here so the
/// CONFIG state can tell legitimate traffic from garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    // Handshake
    Handshake,

    // Status
    StatusRequest,
    StatusPing,
    StatusResponse,
    StatusPong,

    // Login serverbound
    LoginStart,
    EncryptionResponse,
    LoginPluginResponse,
    LoginAcknowledged,
    LoginCookieResponse,

    // Login clientbound
    LoginDisconnect,
    EncryptionRequest,
    LoginSuccess,
    SetCompression,
    LoginPluginRequest,
    LoginCookieRequest,

    // Config serverbound
    ClientInformation,
    ConfigCookieResponse,
    ConfigPluginMessage,
    FinishConfigurationAck,
    ConfigKeepAlive,
    ConfigPong,
    ConfigResourcePackResponse,
    KnownPacksResponse,

    // Config clientbound
    ConfigCookieRequest,
    ConfigDisconnect,
    FinishConfiguration,
    ConfigPing,
    ResetChat,
    RegistryData,
    RemoveResourcePack,
    AddResourcePack,
    ConfigStoreCookie,
    ConfigTransfer,
    FeatureFlags,
    ConfigUpdateTags,
    KnownPacksRequest,
    CustomReportDetails,
    ServerLinks,

    // Play (both directions where noted)
    PlayPluginMessage,
    PlayKeepAlive,
    PlayDisconnect,
    JoinGame,
    Respawn,
    StartConfiguration,
    AcknowledgeConfiguration,
}

/// `(since protocol number, packet id)` pairs, oldest first. The id in
/// effect for a version is the last entry at or below it; a version below
/// the first entry does not carry the packet at all.
type IdChain = &'static [(i32, i32)];

const HANDSHAKE_SERVERBOUND: &[(PacketKind, IdChain)] =
    &[(PacketKind::Handshake, &[(4, 0x00)])];

const STATUS_SERVERBOUND: &[(PacketKind, IdChain)] = &[
    (PacketKind::StatusRequest, &[(4, 0x00)]),
    (PacketKind::StatusPing, &[(4, 0x01)]),
];

const STATUS_CLIENTBOUND: &[(PacketKind, IdChain)] = &[
    (PacketKind::StatusResponse, &[(4, 0x00)]),
    (PacketKind::StatusPong, &[(4, 0x01)]),
];

const LOGIN_SERVERBOUND: &[(PacketKind, IdChain)] = &[
    (PacketKind::LoginStart, &[(4, 0x00)]),
    (PacketKind::EncryptionResponse, &[(4, 0x01)]),
    (PacketKind::LoginPluginResponse, &[(393, 0x02)]),
    (PacketKind::LoginAcknowledged, &[(764, 0x03)]),
    (PacketKind::LoginCookieResponse, &[(766, 0x04)]),
];

const LOGIN_CLIENTBOUND: &[(PacketKind, IdChain)] = &[
    (PacketKind::LoginDisconnect, &[(4, 0x00)]),
    (PacketKind::EncryptionRequest, &[(4, 0x01)]),
    (PacketKind::LoginSuccess, &[(4, 0x02)]),
    (PacketKind::SetCompression, &[(47, 0x03)]),
    (PacketKind::LoginPluginRequest, &[(393, 0x04)]),
    (PacketKind::LoginCookieRequest, &[(766, 0x05)]),
];

const CONFIG_SERVERBOUND: &[(PacketKind, IdChain)] = &[
    (PacketKind::ClientInformation, &[(764, 0x00)]),
    (PacketKind::ConfigCookieResponse, &[(766, 0x01)]),
    (PacketKind::ConfigPluginMessage, &[(764, 0x01), (766, 0x02)]),
    (PacketKind::FinishConfigurationAck, &[(764, 0x02), (766, 0x03)]),
    (PacketKind::ConfigKeepAlive, &[(764, 0x03), (766, 0x04)]),
    (PacketKind::ConfigPong, &[(764, 0x04), (766, 0x05)]),
    (
        PacketKind::ConfigResourcePackResponse,
        &[(764, 0x05), (766, 0x06)],
    ),
    (PacketKind::KnownPacksResponse, &[(766, 0x07)]),
];

const CONFIG_CLIENTBOUND: &[(PacketKind, IdChain)] = &[
    (PacketKind::ConfigCookieRequest, &[(766, 0x00)]),
    (PacketKind::ConfigPluginMessage, &[(764, 0x00), (766, 0x01)]),
    (PacketKind::ConfigDisconnect, &[(764, 0x01), (766, 0x02)]),
    (PacketKind::FinishConfiguration, &[(764, 0x02), (766, 0x03)]),
    (PacketKind::ConfigKeepAlive, &[(764, 0x03), (766, 0x04)]),
    (PacketKind::ConfigPing, &[(764, 0x04), (766, 0x05)]),
    (PacketKind::ResetChat, &[(766, 0x06)]),
    (PacketKind::RegistryData, &[(764, 0x05), (766, 0x07)]),
    (PacketKind::RemoveResourcePack, &[(764, 0x06), (766, 0x08)]),
    (PacketKind::AddResourcePack, &[(764, 0x07), (766, 0x09)]),
    (PacketKind::ConfigStoreCookie, &[(766, 0x0A)]),
    (PacketKind::ConfigTransfer, &[(766, 0x0B)]),
    (PacketKind::FeatureFlags, &[(764, 0x08), (766, 0x0C)]),
    (PacketKind::ConfigUpdateTags, &[(764, 0x09), (766, 0x0D)]),
    (PacketKind::KnownPacksRequest, &[(766, 0x0E)]),
    (PacketKind::CustomReportDetails, &[(767, 0x0F)]),
    (PacketKind::ServerLinks, &[(767, 0x10)]),
];

const PLAY_SERVERBOUND: &[(PacketKind, IdChain)] = &[
    (
        PacketKind::PlayPluginMessage,
        &[
            (4, 0x17),
            (107, 0x09),
            (393, 0x0A),
            (477, 0x0B),
            (755, 0x0A),
            (759, 0x0C),
            (760, 0x0D),
            (764, 0x0F),
            (766, 0x12),
        ],
    ),
    (
        PacketKind::PlayKeepAlive,
        &[
            (4, 0x00),
            (107, 0x0B),
            (393, 0x0E),
            (477, 0x0F),
            (759, 0x11),
            (760, 0x12),
            (764, 0x14),
            (765, 0x15),
            (766, 0x18),
        ],
    ),
    (
        PacketKind::AcknowledgeConfiguration,
        &[(764, 0x0B), (766, 0x0C)],
    ),
];

const PLAY_CLIENTBOUND: &[(PacketKind, IdChain)] = &[
    (
        PacketKind::PlayPluginMessage,
        &[
            (4, 0x3F),
            (107, 0x18),
            (393, 0x19),
            (477, 0x18),
            (573, 0x19),
            (735, 0x17),
            (755, 0x18),
            (759, 0x15),
            (760, 0x16),
            (762, 0x17),
            (764, 0x18),
            (766, 0x19),
        ],
    ),
    (
        PacketKind::PlayKeepAlive,
        &[
            (4, 0x00),
            (107, 0x1F),
            (393, 0x21),
            (477, 0x20),
            (573, 0x21),
            (735, 0x20),
            (751, 0x1F),
            (755, 0x21),
            (759, 0x1E),
            (760, 0x20),
            (762, 0x23),
            (764, 0x24),
            (766, 0x26),
        ],
    ),
    (
        PacketKind::PlayDisconnect,
        &[
            (4, 0x40),
            (107, 0x1A),
            (393, 0x1B),
            (477, 0x1A),
            (573, 0x1B),
            (735, 0x1A),
            (751, 0x19),
            (755, 0x1A),
            (759, 0x17),
            (760, 0x19),
            (762, 0x1A),
            (764, 0x1B),
            (766, 0x1D),
        ],
    ),
    (
        PacketKind::JoinGame,
        &[
            (4, 0x01),
            (107, 0x23),
            (393, 0x25),
            (573, 0x26),
            (735, 0x25),
            (751, 0x24),
            (755, 0x26),
            (759, 0x23),
            (760, 0x25),
            (762, 0x28),
            (764, 0x29),
            (766, 0x2B),
        ],
    ),
    (
        PacketKind::Respawn,
        &[
            (4, 0x07),
            (107, 0x33),
            (340, 0x35),
            (393, 0x38),
            (477, 0x3A),
            (573, 0x3B),
            (735, 0x3A),
            (751, 0x39),
            (755, 0x3D),
            (759, 0x3B),
            (760, 0x3E),
            (762, 0x41),
            (764, 0x43),
            (765, 0x45),
            (766, 0x47),
        ],
    ),
    (
        PacketKind::StartConfiguration,
        &[(764, 0x65), (765, 0x67), (766, 0x69)],
    ),
];

/// An immutable bijection between packet IDs and kinds for one
/// `(version, state, direction)`. Built once at startup, shared by
/// reference, O(1) lookup both ways.
#[derive(Debug, Default)]
pub struct PacketTable {
    by_id: HashMap<i32, PacketKind>,
    by_kind: HashMap<PacketKind, i32>,
}

impl PacketTable {
    fn build(decls: &[(PacketKind, IdChain)], version: ProtocolVersion) -> Self {
        let number = version.number();
        let mut table = PacketTable::default();
        for (kind, chain) in decls {
            let id = chain
                .iter()
                .take_while(|(since, _)| *since <= number)
                .last()
                .map(|(_, id)| *id);
            if let Some(id) = id {
                let clash = table.by_id.insert(id, *kind);
                assert!(
                    clash.is_none(),
                    "duplicate packet id 0x{id:02X} for {kind:?} in {version}"
                );
                table.by_kind.insert(*kind, id);
            }
        }
        table
    }

    pub fn kind(&self, id: i32) -> Option<PacketKind> {
        self.by_id.get(&id).copied()
    }

    pub fn id(&self, kind: PacketKind) -> Option<i32> {
        self.by_kind.get(&kind).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

static TABLES: Lazy<HashMap<(ProtocolVersion, ConnectionState, Direction), PacketTable>> =
    Lazy::new(|| {
        let mut tables = HashMap::new();
        for &version in SUPPORTED_VERSIONS {
            let states: &[(ConnectionState, Direction, &[(PacketKind, IdChain)])] = &[
                (
                    ConnectionState::Handshake,
                    Direction::Serverbound,
                    HANDSHAKE_SERVERBOUND,
                ),
                (ConnectionState::Status, Direction::Serverbound, STATUS_SERVERBOUND),
                (ConnectionState::Status, Direction::Clientbound, STATUS_CLIENTBOUND),
                (ConnectionState::Login, Direction::Serverbound, LOGIN_SERVERBOUND),
                (ConnectionState::Login, Direction::Clientbound, LOGIN_CLIENTBOUND),
                (ConnectionState::Config, Direction::Serverbound, CONFIG_SERVERBOUND),
                (ConnectionState::Config, Direction::Clientbound, CONFIG_CLIENTBOUND),
                (ConnectionState::Play, Direction::Serverbound, PLAY_SERVERBOUND),
                (ConnectionState::Play, Direction::Clientbound, PLAY_CLIENTBOUND),
            ];
            for (state, direction, decls) in states {
                tables.insert(
                    (version, *state, *direction),
                    PacketTable::build(decls, version),
                );
            }
        }
        tables
    });

static EMPTY: Lazy<PacketTable> = Lazy::new(PacketTable::default);

/// Look up the packet table for a `(version, state, direction)` triple.
pub fn table(
    version: ProtocolVersion,
    state: ConnectionState,
    direction: Direction,
) -> &'static PacketTable {
    TABLES
        .get(&(version, state, direction))
        .unwrap_or_else(|| Lazy::force(&EMPTY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_bijective_for_every_version() {
        for &version in SUPPORTED_VERSIONS {
            for state in [
                ConnectionState::Handshake,
                ConnectionState::Status,
                ConnectionState::Login,
                ConnectionState::Config,
                ConnectionState::Play,
            ] {
                for direction in [Direction::Serverbound, Direction::Clientbound] {
                    let t = table(version, state, direction);
                    assert_eq!(t.by_id.len(), t.by_kind.len());
                    for (id, kind) in &t.by_id {
                        assert_eq!(t.id(*kind), Some(*id));
                    }
                }
            }
        }
    }

    #[test]
    fn config_state_is_empty_before_1_20_2() {
        assert!(table(
            ProtocolVersion::V1_19_4,
            ConnectionState::Config,
            Direction::Clientbound
        )
        .is_empty());
        assert!(!table(
            ProtocolVersion::V1_20_2,
            ConnectionState::Config,
            Direction::Clientbound
        )
        .is_empty());
    }

    #[test]
    fn id_chains_pick_the_latest_applicable_entry() {
        let t = table(
            ProtocolVersion::V1_20_3,
            ConnectionState::Play,
            Direction::Clientbound,
        );
        assert_eq!(t.id(PacketKind::StartConfiguration), Some(0x67));
        let t = table(
            ProtocolVersion::V1_20_2,
            ConnectionState::Play,
            Direction::Clientbound,
        );
        assert_eq!(t.id(PacketKind::StartConfiguration), Some(0x65));
    }

    #[test]
    fn packets_absent_below_their_introduction() {
        let t = table(
            ProtocolVersion::V1_7_2,
            ConnectionState::Login,
            Direction::Clientbound,
        );
        assert_eq!(t.id(PacketKind::SetCompression), None);
        let t = table(
            ProtocolVersion::V1_12_2,
            ConnectionState::Login,
            Direction::Clientbound,
        );
        assert_eq!(t.id(PacketKind::LoginPluginRequest), None);
        let t = table(
            ProtocolVersion::V1_19_4,
            ConnectionState::Play,
            Direction::Serverbound,
        );
        assert_eq!(t.id(PacketKind::AcknowledgeConfiguration), None);
    }

    #[test]
    fn handshake_accepts_only_one_packet() {
        for &version in SUPPORTED_VERSIONS {
            let t = table(version, ConnectionState::Handshake, Direction::Serverbound);
            assert_eq!(t.by_id.len(), 1);
            assert_eq!(t.kind(0x00), Some(PacketKind::Handshake));
        }
    }
}
