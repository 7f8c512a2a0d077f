use bitflags::bitflags;

use crate::error::WireError;

/// First sentinel word of every frame.
pub const FRAME_MAGIC: u32 = 0x5254_4D51;
/// Second sentinel, trailing the header. Catches header misalignment when a
/// stream resyncs onto byte noise that happened to carry a valid magic.
pub const FRAME_CHECKSUM: u32 = 0x1ED2_3CB4;
/// Upper bound on the body of a single frame.
pub const MAX_FRAME_BODY: usize = 1 << 20;

const MAGIC_OFF: usize = 0;
const TYPE_OFF: usize = 4;
const FLAG_OFF: usize = 6;
const LEN_OFF: usize = 8;
const ORIG_OFF: usize = 12;
const DEST_OFF: usize = 16;
const CHKSUM_OFF: usize = 20;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u16 {
        /// Broker-internal control traffic (AUTH, SUB, PING, ...).
        const SYSTEM = 1 << 0;
        /// Application payload traffic.
        const EXPRESS = 1 << 1;
    }
}

/// Fixed wire header, 24 bytes, network byte order.
///
/// The two sentinel words (`magic` leading, `checksum` trailing) are
/// constants and are validated on parse; they never reach the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u16,
    pub flags: FrameFlags,
    pub length: u32,
    pub orig: u32,
    pub dest: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 24;

    pub fn system(msg_type: u16, orig: u32, dest: u32, body_len: usize) -> Self {
        Self { msg_type, flags: FrameFlags::SYSTEM, length: body_len as u32, orig, dest }
    }

    pub fn express(msg_type: u16, orig: u32, dest: u32, body_len: usize) -> Self {
        Self { msg_type, flags: FrameFlags::EXPRESS, length: body_len as u32, orig, dest }
    }

    #[inline]
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.flags.bits().to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.orig.to_be_bytes());
        out.extend_from_slice(&self.dest.to_be_bytes());
        out.extend_from_slice(&FRAME_CHECKSUM.to_be_bytes());
    }

    /// Parses and validates one header from exactly [`Self::SIZE`] bytes.
    ///
    /// Both sentinels and the body bound are checked here; a failure means
    /// the stream is corrupt and the connection must be closed.
    #[inline]
    pub fn parse(raw: &[u8; Self::SIZE]) -> Result<Self, WireError> {
        let magic = be_u32(raw, MAGIC_OFF);
        if magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let chksum = be_u32(raw, CHKSUM_OFF);
        if chksum != FRAME_CHECKSUM {
            return Err(WireError::BadChecksum(chksum));
        }
        let length = be_u32(raw, LEN_OFF);
        if length as usize > MAX_FRAME_BODY {
            return Err(WireError::Oversize(length));
        }

        Ok(Self {
            msg_type: be_u16(raw, TYPE_OFF),
            flags: FrameFlags::from_bits_retain(be_u16(raw, FLAG_OFF)),
            length,
            orig: be_u32(raw, ORIG_OFF),
            dest: be_u32(raw, DEST_OFF),
        })
    }
}

/// Encodes a complete frame (header + body) into a fresh buffer.
pub fn encode_frame(header: &FrameHeader, body: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.length as usize, body.len());
    let mut out = Vec::with_capacity(FrameHeader::SIZE + body.len());
    header.encode_into(&mut out);
    out.extend_from_slice(body);
    out
}

/// Outcome of [`decode`] on an accumulated byte buffer.
#[derive(Debug)]
pub enum Decoded<'a> {
    /// Not enough bytes for a complete frame yet.
    NeedMore,
    /// One complete frame; `consumed` bytes may be dropped from the front.
    Frame { header: FrameHeader, body: &'a [u8], consumed: usize },
}

/// Streaming parse over whatever has arrived so far.
///
/// Callers that own a socket read loop (the receive server) decode directly
/// from fixed header/payload buffers instead; this buffer form serves client
/// implementations and tests.
pub fn decode(buf: &[u8]) -> Result<Decoded<'_>, WireError> {
    if buf.len() < FrameHeader::SIZE {
        return Ok(Decoded::NeedMore);
    }
    let raw: &[u8; FrameHeader::SIZE] = buf[..FrameHeader::SIZE].try_into().unwrap();
    let header = FrameHeader::parse(raw)?;
    let total = FrameHeader::SIZE + header.length as usize;
    if buf.len() < total {
        return Ok(Decoded::NeedMore);
    }
    Ok(Decoded::Frame { header, body: &buf[FrameHeader::SIZE..total], consumed: total })
}

#[inline]
fn be_u32(raw: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(raw[off..off + 4].try_into().unwrap())
}

#[inline]
fn be_u16(raw: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(raw[off..off + 2].try_into().unwrap())
}
