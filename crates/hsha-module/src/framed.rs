//! Length-prefixed framing.
//!
//! Every request and response on the wire is a 4-byte big-endian
//! payload length followed by the payload. The selector uses the
//! encoding helpers; the blocking `read_frame` / `write_frame` pair is
//! for clients and tests.

use std::io::{self, Read, Write};

pub const FRAME_HEADER_LEN: usize = 4;

/// Decode a frame header.
#[inline]
pub fn decode_len(header: [u8; FRAME_HEADER_LEN]) -> usize {
    u32::from_be_bytes(header) as usize
}

/// Header + payload in one buffer, ready to write.
///
/// Payloads longer than `u32::MAX` cannot be framed.
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame payload exceeds u32::MAX"))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Blocking write of one frame.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    w.write_all(&encode_frame(payload)?)?;
    w.flush()
}

/// Blocking read of one frame. EOF before a full frame is
/// `ErrorKind::UnexpectedEof`.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    r.read_exact(&mut header)?;
    let mut payload = vec![0u8; decode_len(header)];
    r.read_exact(&mut payload)?;
    Ok(payload)
}
