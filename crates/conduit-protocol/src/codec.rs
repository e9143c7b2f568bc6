use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("VarInt too big")]
    VarIntTooBig,
    #[error("Not enough data")]
    NotEnoughData,
    #[error("String too long: {0} > {1}")]
    StringTooLong(usize, usize),
    #[error("Invalid string encoding")]
    BadString,
    #[error("Negative length field")]
    NegativeLength,
    #[error("Unexpected packet layout: {0}")]
    BadPacket(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Read a VarInt from the buffer. At most 5 bytes are consumed; a fifth byte
/// with the continuation bit set is an error.
pub fn read_varint(buf: &mut BytesMut) -> CodecResult<i32> {
    let mut result: i32 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(CodecError::NotEnoughData);
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as i32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 32 {
            return Err(CodecError::VarIntTooBig);
        }
    }
}

/// Write a VarInt to the buffer.
pub fn write_varint(buf: &mut BytesMut, mut value: i32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value = ((value as u32) >> 7) as i32;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Calculate the byte length of a VarInt.
pub fn varint_len(value: i32) -> usize {
    let mut val = value as u32;
    let mut len = 0;
    loop {
        len += 1;
        val >>= 7;
        if val == 0 {
            break;
        }
    }
    len
}

/// Read a VarLong from the buffer.
pub fn read_varlong(buf: &mut BytesMut) -> CodecResult<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(CodecError::NotEnoughData);
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as i64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(CodecError::VarIntTooBig);
        }
    }
}

/// Read a protocol string (varint-prefixed UTF-8). `max_len` is in
/// characters; the wire length may be up to four bytes per character.
pub fn read_string(buf: &mut BytesMut, max_len: usize) -> CodecResult<String> {
    let len = read_varint(buf)?;
    if len < 0 {
        return Err(CodecError::NegativeLength);
    }
    let len = len as usize;
    if len > max_len * 4 {
        return Err(CodecError::StringTooLong(len, max_len));
    }
    if buf.remaining() < len {
        return Err(CodecError::NotEnoughData);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadString)
}

/// Write a protocol string.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.put_slice(s.as_bytes());
}

/// Read a UUID (128 bits, big endian).
pub fn read_uuid(buf: &mut BytesMut) -> CodecResult<Uuid> {
    if buf.remaining() < 16 {
        return Err(CodecError::NotEnoughData);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

/// Write a UUID.
pub fn write_uuid(buf: &mut BytesMut, uuid: &Uuid) {
    buf.put_slice(uuid.as_bytes());
}

/// Read a byte array with varint length prefix.
pub fn read_byte_array(buf: &mut BytesMut) -> CodecResult<Vec<u8>> {
    let len = read_varint(buf)?;
    if len < 0 {
        return Err(CodecError::NegativeLength);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(CodecError::NotEnoughData);
    }
    let bytes = buf.split_to(len);
    Ok(bytes.to_vec())
}

/// Write a byte array with varint length prefix.
pub fn write_byte_array(buf: &mut BytesMut, data: &[u8]) {
    write_varint(buf, data.len() as i32);
    buf.put_slice(data);
}

/// Read a byte array with an i16 length prefix (1.7 login layout).
pub fn read_short_byte_array(buf: &mut BytesMut) -> CodecResult<Vec<u8>> {
    let len = read_i16(buf)?;
    if len < 0 {
        return Err(CodecError::NegativeLength);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.split_to(len).to_vec())
}

/// Write a byte array with an i16 length prefix (1.7 login layout).
pub fn write_short_byte_array(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i16(data.len() as i16);
    buf.put_slice(data);
}

pub fn read_u8(buf: &mut BytesMut) -> CodecResult<u8> {
    if !buf.has_remaining() {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.get_u8())
}

pub fn read_i8(buf: &mut BytesMut) -> CodecResult<i8> {
    Ok(read_u8(buf)? as i8)
}

pub fn read_bool(buf: &mut BytesMut) -> CodecResult<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn read_u16(buf: &mut BytesMut) -> CodecResult<u16> {
    if buf.remaining() < 2 {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.get_u16())
}

pub fn read_i16(buf: &mut BytesMut) -> CodecResult<i16> {
    if buf.remaining() < 2 {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.get_i16())
}

pub fn read_i32(buf: &mut BytesMut) -> CodecResult<i32> {
    if buf.remaining() < 4 {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut BytesMut) -> CodecResult<i64> {
    if buf.remaining() < 8 {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.get_i64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        let cases = vec![
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (255, vec![0xFF, 0x01]),
            (25565, vec![0xDD, 0xC7, 0x01]),
            (2097151, vec![0xFF, 0xFF, 0x7F]),
            (-1, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        ];

        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.to_vec(), expected, "write_varint({})", value);

            let mut buf = BytesMut::from(&expected[..]);
            assert_eq!(read_varint(&mut buf).unwrap(), value, "read_varint({})", value);
        }
    }

    #[test]
    fn varint_rejects_overlong_encoding() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert!(matches!(read_varint(&mut buf), Err(CodecError::VarIntTooBig)));
    }

    #[test]
    fn varint_len_matches_wire() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(25565), 3);
        assert_eq!(varint_len(-1), 5);
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "Hello, world!");
        assert_eq!(read_string(&mut buf, 32767).unwrap(), "Hello, world!");
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        write_byte_array(&mut buf, &[0xC0, 0xAF]);
        assert!(matches!(read_string(&mut buf, 16), Err(CodecError::BadString)));
    }

    #[test]
    fn string_rejects_oversize() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, 1024);
        assert!(matches!(
            read_string(&mut buf, 16),
            Err(CodecError::StringTooLong(1024, 16))
        ));
    }

    #[test]
    fn uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        let mut buf = BytesMut::new();
        write_uuid(&mut buf, &uuid);
        assert_eq!(read_uuid(&mut buf).unwrap(), uuid);
    }

    #[test]
    fn short_byte_array_roundtrip() {
        let mut buf = BytesMut::new();
        write_short_byte_array(&mut buf, &[1, 2, 3]);
        assert_eq!(read_short_byte_array(&mut buf).unwrap(), vec![1, 2, 3]);
    }
}
