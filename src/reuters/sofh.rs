//! Simple Open Framing Header.
//!
//! ```text
//! u32 message_length (BE, includes this 6-byte header)
//! u16 encoding_type  (BE, 0xEB50 = SBE little-endian)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const SOFH_LEN: usize = 6;
pub const SBE_LITTLE_ENDIAN: u16 = 0xEB50;
/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SofhError {
    #[error("unsupported encoding type {0:#06x}")]
    EncodingType(u16),
    #[error("frame length {0} is outside {SOFH_LEN}..={MAX_FRAME_LEN}")]
    Length(usize),
}

pub fn encode_frame(payload: &[u8]) -> Result<Bytes, SofhError> {
    let total = SOFH_LEN + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(SofhError::Length(total));
    }
    let mut out = BytesMut::with_capacity(total);
    out.put_u32(total as u32);
    out.put_u16(SBE_LITTLE_ENDIAN);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Reassembles frames from arbitrarily split stream reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, without its header. `Ok(None)` until enough bytes arrive.
    /// After an error the stream cannot be resynchronised and should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, SofhError> {
        if self.buf.len() < SOFH_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let encoding = u16::from_be_bytes([self.buf[4], self.buf[5]]);
        if encoding != SBE_LITTLE_ENDIAN {
            return Err(SofhError::EncodingType(encoding));
        }
        if !(SOFH_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(SofhError::Length(len));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(len);
        frame.advance(SOFH_LEN);
        Ok(Some(frame.freeze()))
    }
}
