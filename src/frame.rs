//! Length-prefixed framing.
//!
//! Every VTP message is a 4-byte network-order length followed by that many
//! bytes of UTF-8 XML. There is no magic, version byte or checksum.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{VtpError, FRAME_HEADER_LEN};

/// Encode a payload as a single frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, VtpError> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    encode_frame_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Append a frame for `payload` to `dst`.
pub fn encode_frame_into(payload: &[u8], dst: &mut BytesMut) -> Result<(), VtpError> {
    let len = u32::try_from(payload.len()).map_err(|_| VtpError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_u32(len);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Try to split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. The length prefix is
/// checked against `max_len` before any payload is buffered, so an oversized
/// declaration fails immediately.
pub fn try_decode_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>, VtpError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = BigEndian::read_u32(&buf[..FRAME_HEADER_LEN]) as usize;
    if len > max_len {
        return Err(VtpError::FrameTooLarge { len, max: max_len });
    }

    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let _ = buf.split_to(FRAME_HEADER_LEN);
    Ok(Some(buf.split_to(len).freeze()))
}
