//! On-wire layout of one frame.
//!
//! Each length-delimited unit holds a complete message:
//! `u32 header-length (big endian) | header bytes | payload bytes`.
//! Assembling both parts into one unit keeps the pair atomic, so concurrent
//! senders can never interleave headers and payloads.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::NetError;

pub(crate) fn encode(
    header: &[u8],
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(header);
    buf.put_slice(payload);
    buf.freeze()
}

pub(crate) fn decode(mut frame: BytesMut) -> Result<(Bytes, Bytes), NetError> {
    if frame.len() < 4 {
        return Err(NetError::BadFrame("frame shorter than its length prefix"));
    }
    let header_len = frame.get_u32() as usize;
    if frame.len() < header_len {
        return Err(NetError::BadFrame("header length exceeds frame"));
    }
    let header = frame.split_to(header_len).freeze();
    let payload = frame.freeze();
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() -> anyhow::Result<()> {
        let encoded = encode(b"{\"function\":\"status\"}", b"OK");
        let (header, payload) = decode(BytesMut::from(&encoded[..]))?;
        assert_eq!(&header[..], b"{\"function\":\"status\"}");
        assert_eq!(&payload[..], b"OK");
        Ok(())
    }

    #[test]
    fn empty_payload_is_legal() -> anyhow::Result<()> {
        let encoded = encode(b"h", b"");
        let (header, payload) = decode(BytesMut::from(&encoded[..]))?;
        assert_eq!(&header[..], b"h");
        assert!(payload.is_empty());
        Ok(())
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut encoded = BytesMut::from(&encode(b"header", b"payload")[..]);
        encoded.truncate(6);
        assert!(decode(encoded).is_err());
    }
}
