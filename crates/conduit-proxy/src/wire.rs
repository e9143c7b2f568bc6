use bytes::BytesMut;
use conduit_protocol::{
    read_varint, table, write_varint, Connection, ConnectionState, Direction, FrameWriter,
    Packet, PacketKind, ProtocolVersion,
};

use crate::error::ProxyError;

/// Frame a typed packet into an `id ‖ body` payload for the given peer.
pub fn frame_packet(
    version: ProtocolVersion,
    state: ConnectionState,
    direction: Direction,
    packet: &Packet,
) -> Result<BytesMut, ProxyError> {
    let kind = packet.kind();
    let id = table(version, state, direction)
        .id(kind)
        .ok_or(ProxyError::Unmapped(kind))?;
    let mut payload = BytesMut::new();
    write_varint(&mut payload, id);
    packet.encode(version, &mut payload)?;
    Ok(payload)
}

/// Frame a typed packet under an explicit kind, for packets whose kind
/// differs by state (Disconnect, PluginMessage, KeepAlive all have CONFIG
/// twins).
pub fn frame_packet_as(
    kind: PacketKind,
    version: ProtocolVersion,
    state: ConnectionState,
    direction: Direction,
    packet: &Packet,
) -> Result<BytesMut, ProxyError> {
    let id = table(version, state, direction)
        .id(kind)
        .ok_or(ProxyError::Unmapped(kind))?;
    let mut payload = BytesMut::new();
    write_varint(&mut payload, id);
    packet.encode(version, &mut payload)?;
    Ok(payload)
}

/// Read the packet ID off the front of a raw frame payload, returning the
/// ID and the number of prefix bytes it occupied.
pub fn packet_id(payload: &[u8]) -> Result<(i32, usize), ProxyError> {
    let mut result: i32 = 0;
    for (i, &byte) in payload.iter().take(5).enumerate() {
        result |= ((byte & 0x7F) as i32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(ProxyError::Violation("unterminated packet id"))
}

/// Decode the typed body of a raw frame whose kind is already known. The
/// original payload is left untouched for verbatim relay.
pub fn decode_frame(
    kind: PacketKind,
    version: ProtocolVersion,
    payload: &[u8],
) -> Result<Packet, ProxyError> {
    let mut body = BytesMut::from(payload);
    let _ = read_varint(&mut body)?;
    Ok(Packet::decode(kind, version, &mut body)?)
}

pub async fn send_packet(
    conn: &mut Connection,
    version: ProtocolVersion,
    state: ConnectionState,
    direction: Direction,
    packet: &Packet,
) -> Result<(), ProxyError> {
    let payload = frame_packet(version, state, direction, packet)?;
    conn.write_frame(&payload).await?;
    Ok(())
}

pub async fn send_packet_split(
    writer: &mut FrameWriter,
    version: ProtocolVersion,
    state: ConnectionState,
    direction: Direction,
    packet: &Packet,
) -> Result<(), ProxyError> {
    let payload = frame_packet(version, state, direction, packet)?;
    writer.write_frame(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_packet_prefixes_the_mapped_id() {
        let payload = frame_packet(
            ProtocolVersion::V1_21,
            ConnectionState::Status,
            Direction::Clientbound,
            &Packet::StatusPong { payload: 0x1234 },
        )
        .unwrap();
        let (id, prefix) = packet_id(&payload).unwrap();
        assert_eq!(id, 0x01);
        assert_eq!(payload.len() - prefix, 8);
    }

    #[test]
    fn unmapped_packet_is_an_error() {
        // SetCompression does not exist on 1.7.
        let result = frame_packet(
            ProtocolVersion::V1_7_2,
            ConnectionState::Login,
            Direction::Clientbound,
            &Packet::SetCompression { threshold: 256 },
        );
        assert!(matches!(result, Err(ProxyError::Unmapped(_))));
    }

    #[test]
    fn decode_frame_leaves_payload_intact() {
        let payload = frame_packet(
            ProtocolVersion::V1_21,
            ConnectionState::Status,
            Direction::Serverbound,
            &Packet::StatusPing { payload: 99 },
        )
        .unwrap();
        let before = payload.clone();
        let decoded = decode_frame(
            PacketKind::StatusPing,
            ProtocolVersion::V1_21,
            &payload,
        )
        .unwrap();
        assert!(matches!(decoded, Packet::StatusPing { payload: 99 }));
        assert_eq!(payload, before);
    }
}
