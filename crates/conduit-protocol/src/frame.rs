use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use bytes::{Buf, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read as _, Write as _};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::codec::{read_varint, write_varint};

/// Frames above this length close the connection, in either direction.
pub const MAX_FRAME_LEN: usize = (1 << 21) - 1;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed")]
    Closed,
    #[error("malformed frame length")]
    BadLength,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("negative uncompressed-size field")]
    NegativeDataLength,
    #[error("compressed frame inflated to {got} bytes, expected {expected}")]
    InflateSizeMismatch { expected: usize, got: usize },
    #[error("corrupt zlib data: {0}")]
    BadDeflate(std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Manual AES-128-CFB8 cipher that supports streaming (byte-at-a-time).
/// The wire protocol requires cipher state to persist across frames.
struct Cfb8Cipher {
    cipher: Aes128,
    iv: [u8; 16],
}

impl Cfb8Cipher {
    fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        let cipher = Aes128::new(key.into());
        Self { cipher, iv: *iv }
    }

    fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let mut block = aes::Block::from(self.iv);
            self.cipher.encrypt_block(&mut block);
            *byte ^= block[0];
            self.iv.copy_within(1.., 0);
            self.iv[15] = *byte;
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let mut block = aes::Block::from(self.iv);
            self.cipher.encrypt_block(&mut block);
            let ciphertext = *byte;
            *byte ^= block[0];
            self.iv.copy_within(1.., 0);
            self.iv[15] = ciphertext;
        }
    }
}

/// What the very first read of a fresh connection produced.
#[derive(Debug)]
pub enum InitialFrame {
    /// A normal framed packet (`id ‖ body`).
    Packet(BytesMut),
    /// A pre-1.7 server-list ping (leading 0xFE); answered out-of-band
    /// with a kick-style legacy disconnect.
    LegacyPing(LegacyPingFormat),
}

/// Which legacy server-list probe the client sent. The two forms expect
/// different reply bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyPingFormat {
    /// Beta 1.8 through 1.5: a bare 0xFE and nothing more until the kick
    /// reply arrives.
    Pre1_6,
    /// 1.6: 0xFE 0x01, optionally followed by a plugin-message payload.
    V1_6,
}

/// A framed connection with optional compression and encryption.
///
/// `read_frame` yields the decompressed packet payload (packet ID varint
/// followed by the body); `write_frame` takes the same shape. The relay
/// passes payloads between two connections without re-encoding packets.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    threshold: Option<i32>,
    compression_level: u32,
    encryptor: Option<Cfb8Cipher>,
    decryptor: Option<Cfb8Cipher>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            threshold: None,
            compression_level: 6,
            encryptor: None,
            decryptor: None,
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    /// Enable compression. One-shot: every later frame in both directions
    /// uses the compressed layout.
    pub fn enable_compression(&mut self, threshold: i32, level: u32) {
        self.threshold = Some(threshold);
        self.compression_level = level.min(9);
    }

    /// Enable AES-CFB8 encryption with the 16-byte shared secret. The IV
    /// equals the key. One-shot and irreversible.
    pub fn enable_encryption(&mut self, shared_secret: &[u8; 16]) {
        self.encryptor = Some(Cfb8Cipher::new(shared_secret, shared_secret));
        self.decryptor = Some(Cfb8Cipher::new(shared_secret, shared_secret));
    }

    /// Read the first frame of a fresh connection, watching for the legacy
    /// server-list ping probes that predate framing.
    ///
    /// A leading 0xFE is always a legacy ping, never a frame-decode error.
    /// The pre-1.6 probe is a single bare byte and the client sends nothing
    /// further until the reply arrives, so the classification must not wait
    /// for more input: only a 0x01 already buffered marks the 1.6 form.
    pub async fn read_initial_frame(&mut self) -> Result<InitialFrame, FrameError> {
        loop {
            if self.read_buf.first() == Some(&0xFE) {
                let format = if self.read_buf.get(1) == Some(&0x01) {
                    LegacyPingFormat::V1_6
                } else {
                    LegacyPingFormat::Pre1_6
                };
                return Ok(InitialFrame::LegacyPing(format));
            }
            if let Some(frame) = try_parse_frame(&mut self.read_buf, self.threshold)? {
                return Ok(InitialFrame::Packet(frame));
            }
            self.fill_read_buf().await?;
        }
    }

    /// Read one frame, returning the decompressed `id ‖ body` payload.
    pub async fn read_frame(&mut self) -> Result<BytesMut, FrameError> {
        loop {
            if let Some(frame) = try_parse_frame(&mut self.read_buf, self.threshold)? {
                trace!("read frame of {} bytes", frame.len());
                return Ok(frame);
            }
            self.fill_read_buf().await?;
        }
    }

    async fn fill_read_buf(&mut self) -> Result<(), FrameError> {
        let mut tmp = [0u8; 4096];
        let n = self.stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        let data = &mut tmp[..n];
        if let Some(decryptor) = self.decryptor.as_mut() {
            decryptor.decrypt(data);
        }
        self.read_buf.extend_from_slice(data);
        Ok(())
    }

    /// Frame and send a packet payload (`id ‖ body`).
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let mut frame = build_frame(payload, self.threshold, self.compression_level)?;
        if let Some(encryptor) = self.encryptor.as_mut() {
            encryptor.encrypt(&mut frame);
        }
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Send raw bytes with no framing. Only the legacy-ping response uses
    /// this.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Split into read and write halves for the relay loop. Codec state is
    /// carried into each half.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                stream: read_half,
                read_buf: self.read_buf,
                threshold: self.threshold,
                decryptor: self.decryptor,
            },
            FrameWriter {
                stream: write_half,
                threshold: self.threshold,
                compression_level: self.compression_level,
                encryptor: self.encryptor,
            },
        )
    }
}

/// Read half of a split connection.
pub struct FrameReader {
    stream: OwnedReadHalf,
    read_buf: BytesMut,
    threshold: Option<i32>,
    decryptor: Option<Cfb8Cipher>,
}

impl FrameReader {
    pub async fn read_frame(&mut self) -> Result<BytesMut, FrameError> {
        loop {
            if let Some(frame) = try_parse_frame(&mut self.read_buf, self.threshold)? {
                return Ok(frame);
            }
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            let data = &mut tmp[..n];
            if let Some(decryptor) = self.decryptor.as_mut() {
                decryptor.decrypt(data);
            }
            self.read_buf.extend_from_slice(data);
        }
    }
}

/// Write half of a split connection.
pub struct FrameWriter {
    stream: OwnedWriteHalf,
    threshold: Option<i32>,
    compression_level: u32,
    encryptor: Option<Cfb8Cipher>,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let mut frame = build_frame(payload, self.threshold, self.compression_level)?;
        if let Some(encryptor) = self.encryptor.as_mut() {
            encryptor.encrypt(&mut frame);
        }
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// === Shared framing helpers ===

/// Attempt to cut one frame out of `read_buf`. Returns `None` when more
/// bytes are needed; errors are fatal to the connection.
fn try_parse_frame(
    read_buf: &mut BytesMut,
    threshold: Option<i32>,
) -> Result<Option<BytesMut>, FrameError> {
    let (length, prefix_len) = match peek_varint(read_buf)? {
        Some(v) => v,
        None => return Ok(None),
    };
    if length <= 0 {
        return Err(FrameError::BadLength);
    }
    let length = length as usize;
    if length > MAX_FRAME_LEN {
        return Err(FrameError::FrameTooLarge(length));
    }
    if read_buf.len() < prefix_len + length {
        return Ok(None);
    }

    read_buf.advance(prefix_len);
    let mut payload = read_buf.split_to(length);

    if threshold.is_some() {
        let data_length = read_varint(&mut payload).map_err(|_| FrameError::BadLength)?;
        if data_length < 0 {
            return Err(FrameError::NegativeDataLength);
        }
        if data_length > 0 {
            let expected = data_length as usize;
            if expected > MAX_FRAME_LEN {
                return Err(FrameError::FrameTooLarge(expected));
            }
            let mut inflated = Vec::with_capacity(expected.min(64 * 1024));
            let mut decoder = ZlibDecoder::new(&payload[..]);
            decoder
                .read_to_end(&mut inflated)
                .map_err(FrameError::BadDeflate)?;
            if inflated.len() != expected {
                return Err(FrameError::InflateSizeMismatch {
                    expected,
                    got: inflated.len(),
                });
            }
            payload = BytesMut::from(&inflated[..]);
        }
    }

    Ok(Some(payload))
}

/// Non-destructive varint parse at the head of the buffer. `Ok(None)` means
/// the prefix is incomplete; more than five length bytes is malformed.
fn peek_varint(buf: &BytesMut) -> Result<Option<(i32, usize)>, FrameError> {
    let mut result: i32 = 0;
    for (i, &byte) in buf.iter().take(5).enumerate() {
        result |= ((byte & 0x7F) as i32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((result, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(FrameError::BadLength);
    }
    Ok(None)
}

fn build_frame(
    payload: &[u8],
    threshold: Option<i32>,
    compression_level: u32,
) -> Result<BytesMut, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::FrameTooLarge(payload.len()));
    }

    let mut frame = BytesMut::with_capacity(payload.len() + 6);
    match threshold {
        Some(threshold) if payload.len() as i32 >= threshold => {
            let mut encoder =
                ZlibEncoder::new(Vec::new(), Compression::new(compression_level));
            encoder.write_all(payload)?;
            let compressed = encoder.finish()?;

            let mut inner = BytesMut::with_capacity(compressed.len() + 5);
            write_varint(&mut inner, payload.len() as i32);
            inner.extend_from_slice(&compressed);

            write_varint(&mut frame, inner.len() as i32);
            frame.extend_from_slice(&inner);
        }
        Some(_) => {
            write_varint(&mut frame, payload.len() as i32 + 1);
            write_varint(&mut frame, 0);
            frame.extend_from_slice(payload);
        }
        None => {
            write_varint(&mut frame, payload.len() as i32);
            frame.extend_from_slice(payload);
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode one frame out of raw wire bytes, mirroring the read path
    /// without a socket.
    fn parse(wire: &[u8], threshold: Option<i32>) -> Result<Option<BytesMut>, FrameError> {
        let mut buf = BytesMut::from(wire);
        try_parse_frame(&mut buf, threshold)
    }

    fn roundtrip(payload: &[u8], threshold: Option<i32>) -> BytesMut {
        let frame = build_frame(payload, threshold, 6).unwrap();
        parse(&frame, threshold).unwrap().expect("complete frame")
    }

    #[test]
    fn uncompressed_roundtrip() {
        let payload = vec![0x05, 1, 2, 3, 4];
        assert_eq!(roundtrip(&payload, None)[..], payload[..]);
    }

    #[test]
    fn compressed_roundtrip_above_threshold() {
        let payload = vec![7u8; 1024];
        let frame = build_frame(&payload, Some(256), 6).unwrap();
        // Compressible payload framed smaller than the raw form.
        assert!(frame.len() < payload.len());
        assert_eq!(roundtrip(&payload, Some(256))[..], payload[..]);
    }

    #[test]
    fn below_threshold_is_sent_raw_with_zero_marker() {
        let payload = vec![0x09, 0xAB];
        let frame = build_frame(&payload, Some(256), 6).unwrap();
        // length, data_length == 0, then the raw payload
        assert_eq!(&frame[..], &[0x03, 0x00, 0x09, 0xAB]);
        assert_eq!(roundtrip(&payload, Some(256))[..], payload[..]);
    }

    #[test]
    fn incomplete_frame_waits_for_more() {
        let frame = build_frame(&[1, 2, 3, 4], None, 6).unwrap();
        assert!(parse(&frame[..2], None).unwrap().is_none());
    }

    #[test]
    fn overlong_length_prefix_is_fatal() {
        let wire = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(parse(&wire, None), Err(FrameError::BadLength)));
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut wire = BytesMut::new();
        write_varint(&mut wire, (MAX_FRAME_LEN + 1) as i32);
        assert!(matches!(
            parse(&wire, None),
            Err(FrameError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn zero_length_frame_is_fatal() {
        assert!(matches!(parse(&[0x00], None), Err(FrameError::BadLength)));
    }

    #[test]
    fn inflate_size_mismatch_is_fatal() {
        let payload = vec![7u8; 512];
        let frame = build_frame(&payload, Some(256), 6).unwrap();
        // Corrupt the declared uncompressed size: reparse with the inner
        // data_length bumped by one.
        let mut buf = BytesMut::from(&frame[..]);
        let _outer = read_varint(&mut buf).unwrap();
        let inner_len = read_varint(&mut buf).unwrap();
        let mut rebuilt_inner = BytesMut::new();
        write_varint(&mut rebuilt_inner, inner_len + 1);
        rebuilt_inner.extend_from_slice(&buf);
        let mut wire = BytesMut::new();
        write_varint(&mut wire, rebuilt_inner.len() as i32);
        wire.extend_from_slice(&rebuilt_inner);
        assert!(matches!(
            parse(&wire, Some(256)),
            Err(FrameError::InflateSizeMismatch { .. })
        ));
    }

    #[test]
    fn encryption_roundtrips_across_frame_boundaries() {
        let secret = [0x42u8; 16];
        let mut enc = Cfb8Cipher::new(&secret, &secret);
        let mut dec = Cfb8Cipher::new(&secret, &secret);

        let mut first = build_frame(&[0x01, 0x02], None, 6).unwrap();
        let mut second = build_frame(&[0x03], None, 6).unwrap();
        let plain_first = first.to_vec();
        let plain_second = second.to_vec();

        enc.encrypt(&mut first);
        enc.encrypt(&mut second);
        assert_ne!(first.to_vec(), plain_first);

        // Decrypt in a different chunking to prove byte-level streaming.
        let mut joined = [first.to_vec(), second.to_vec()].concat();
        dec.decrypt(&mut joined);
        assert_eq!(joined, [plain_first, plain_second].concat());
    }

    #[tokio::test]
    async fn initial_frame_classifies_legacy_pings() {
        use tokio::io::AsyncWriteExt as _;
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Bare 0xFE: the pre-1.6 probe, classified without waiting for a
        // second byte that never comes.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        client.write_all(&[0xFE]).await.unwrap();
        let mut conn = Connection::new(server);
        assert!(matches!(
            conn.read_initial_frame().await.unwrap(),
            InitialFrame::LegacyPing(LegacyPingFormat::Pre1_6)
        ));

        // 0xFE 0x01: the 1.6 probe.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        client.write_all(&[0xFE, 0x01]).await.unwrap();
        let mut conn = Connection::new(server);
        assert!(matches!(
            conn.read_initial_frame().await.unwrap(),
            InitialFrame::LegacyPing(LegacyPingFormat::V1_6)
        ));

        // An ordinary framed packet still parses.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let frame = build_frame(&[0x00, 0x2F], None, 6).unwrap();
        client.write_all(&frame).await.unwrap();
        let mut conn = Connection::new(server);
        match conn.read_initial_frame().await.unwrap() {
            InitialFrame::Packet(payload) => assert_eq!(&payload[..], &[0x00, 0x2F]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_cross_a_real_socket_with_codec_state() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let secret = [5u8; 16];
        let mut a = Connection::new(client);
        let mut b = Connection::new(server);
        for conn in [&mut a, &mut b] {
            conn.enable_compression(64, 6);
            conn.enable_encryption(&secret);
        }

        // Small (raw) and large (compressed) frames, both under encryption.
        let small = vec![0x0A, 1, 2, 3];
        let large = vec![0x0B; 2048];
        a.write_frame(&small).await.unwrap();
        a.write_frame(&large).await.unwrap();
        assert_eq!(b.read_frame().await.unwrap()[..], small[..]);
        assert_eq!(b.read_frame().await.unwrap()[..], large[..]);

        // Split halves carry the codec state.
        let (_reader, mut writer) = a.into_split();
        writer.write_frame(&small).await.unwrap();
        assert_eq!(b.read_frame().await.unwrap()[..], small[..]);
    }

    #[test]
    fn compressed_and_encrypted_roundtrip() {
        let secret = [9u8; 16];
        let payload = vec![3u8; 700];
        let mut frame = build_frame(&payload, Some(64), 6).unwrap();
        let mut enc = Cfb8Cipher::new(&secret, &secret);
        let mut dec = Cfb8Cipher::new(&secret, &secret);
        enc.encrypt(&mut frame);
        let mut wire = frame.to_vec();
        dec.decrypt(&mut wire);
        assert_eq!(
            parse(&wire, Some(64)).unwrap().expect("frame")[..],
            payload[..]
        );
    }
}
