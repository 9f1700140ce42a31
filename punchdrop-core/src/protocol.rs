use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// ASCII magic bytes that open every punchdrop frame.
const MAGIC: &[u8; 4] = b"PDRP";
/// Total header size: magic(4) + packet(1) + length(4).
pub const HEADER_LEN: usize = 9;
/// Upper bound on a single frame payload to protect against malicious peers.
///
/// Large enough for one chunk of the biggest configurable chunk size plus
/// its flag byte.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_PACKET: usize = 4;
const OFF_LENGTH: usize = 5;

/// Protocol version spoken by this build, exchanged during the
/// compatibility handshake.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Packet type codes.
///
/// Values are part of the wire format and must never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Packet {
    // ── Rendezvous ──
    ClientRoleUploader = 0x01,
    ClientRoleDownloader = 0x02,
    UidLookupRequest = 0x03,
    UidAssignment = 0x04,
    PeerReady = 0x05,
    PeerNotFound = 0x06,

    // ── Peer handshake ──
    VersionAnnounce = 0x10,

    // ── Transfer ──
    MetaInfo = 0x20,
    FileNameAnnounce = 0x21,
    FileSizeAnnounce = 0x22,
    FileHashAnnounce = 0x23,
    ReadyAck = 0x24,
    Reject = 0x25,
    ChunkData = 0x30,
    ChecksumMatch = 0x40,
    ChecksumMismatch = 0x41,

    // ── Errors ──
    ProtocolError = 0x7E,
    InternalError = 0x7F,
}

impl TryFrom<u8> for Packet {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::ClientRoleUploader),
            0x02 => Ok(Self::ClientRoleDownloader),
            0x03 => Ok(Self::UidLookupRequest),
            0x04 => Ok(Self::UidAssignment),
            0x05 => Ok(Self::PeerReady),
            0x06 => Ok(Self::PeerNotFound),
            0x10 => Ok(Self::VersionAnnounce),
            0x20 => Ok(Self::MetaInfo),
            0x21 => Ok(Self::FileNameAnnounce),
            0x22 => Ok(Self::FileSizeAnnounce),
            0x23 => Ok(Self::FileHashAnnounce),
            0x24 => Ok(Self::ReadyAck),
            0x25 => Ok(Self::Reject),
            0x30 => Ok(Self::ChunkData),
            0x40 => Ok(Self::ChecksumMatch),
            0x41 => Ok(Self::ChecksumMismatch),
            0x7E => Ok(Self::ProtocolError),
            0x7F => Ok(Self::InternalError),
            other => Err(Error::MalformedMessage(format!(
                "unknown packet type: 0x{other:02X}"
            ))),
        }
    }
}

impl From<Packet> for u8 {
    fn from(packet: Packet) -> u8 {
        packet as u8
    }
}

/// One decoded message: a packet tag and its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub packet: Packet,
    pub body: Bytes,
}

impl Message {
    pub fn new(packet: Packet, body: impl Into<Bytes>) -> Self {
        Self {
            packet,
            body: body.into(),
        }
    }

    /// A message with no body.
    #[must_use]
    pub fn bare(packet: Packet) -> Self {
        Self {
            packet,
            body: Bytes::new(),
        }
    }

    /// Interprets the body as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(message))`: a full frame was present; its bytes have been
///   consumed from `buf`.
/// * `Ok(None)`: not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)`: protocol violation (bad magic, unknown packet type,
///   oversized payload).  The caller should close the connection.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] on protocol violations.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Message>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    if &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] != MAGIC {
        return Err(Error::MalformedMessage("bad magic: expected PDRP".into()));
    }

    let packet = Packet::try_from(buf[OFF_PACKET])?;

    let mut length = [0u8; 4];
    length.copy_from_slice(&buf[OFF_LENGTH..OFF_LENGTH + 4]);
    let payload_len = u32::from_be_bytes(length) as usize;

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::MalformedMessage(format!(
            "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
        )));
    }

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let body = buf.split_to(payload_len).freeze();

    Ok(Some(Message { packet, body }))
}

/// Encodes a frame into `buf`.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] if `payload` exceeds
/// [`MAX_PAYLOAD_LEN`]; nothing is written in that case.
pub fn encode_frame(packet: Packet, payload: &[u8], buf: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::MalformedMessage(format!(
            "payload too large: {} bytes (max {MAX_PAYLOAD_LEN})",
            payload.len()
        )));
    }

    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(packet.into());
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
///
/// # Errors
///
/// See [`encode_frame`].
pub fn encode_frame_to_bytes(packet: Packet, payload: &[u8]) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(packet, payload, &mut buf)?;
    Ok(buf)
}
