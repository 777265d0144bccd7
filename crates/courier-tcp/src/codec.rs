//! Length-prefixed JSON framing: `<byte-length>#<json>`.
//!
//! The prefix is the decimal byte length of the JSON text that follows the
//! `#`. Frames are used in both directions.

use bytes::{Buf, BufMut, BytesMut};
use courier_core::TransportError;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a single frame's JSON body.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const DELIMITER: u8 = b'#';
/// Digits needed to express `usize::MAX`, more than enough for any prefix.
const MAX_PREFIX_DIGITS: usize = 20;

/// Codec for the `<length>#<json>` framing.
#[derive(Debug, Clone)]
pub struct JsonSocketCodec {
    max_frame_length: usize,
}

impl JsonSocketCodec {
    /// Codec with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Codec rejecting frames larger than `max` bytes.
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            max_frame_length: max,
        }
    }
}

impl Default for JsonSocketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonSocketCodec {
    type Item = Value;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, TransportError> {
        let Some(delimiter) = src.iter().position(|b| *b == DELIMITER) else {
            if src.len() > MAX_PREFIX_DIGITS {
                return Err(TransportError::codec("missing length prefix delimiter"));
            }
            return Ok(None);
        };

        let prefix = &src[..delimiter];
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return Err(TransportError::codec(format!(
                "corrupted length prefix: {:?}",
                String::from_utf8_lossy(prefix)
            )));
        }
        let length: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::codec("length prefix out of range"))?;
        if length > self.max_frame_length {
            return Err(TransportError::codec(format!(
                "frame of {length} bytes exceeds limit of {}",
                self.max_frame_length
            )));
        }

        let frame_end = delimiter + 1 + length;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(delimiter + 1);
        let body = src.split_to(length);
        let value = serde_json::from_slice(&body)?;
        Ok(Some(value))
    }
}

impl Encoder<Value> for JsonSocketCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_length {
            return Err(TransportError::codec(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame_length
            )));
        }
        let prefix = body.len().to_string();
        dst.reserve(prefix.len() + 1 + body.len());
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(DELIMITER);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn encode(value: Value) -> BytesMut {
        let mut buf = BytesMut::new();
        JsonSocketCodec::new().encode(value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encodes_byte_length_prefix() {
        let buf = encode(json!({"pattern": "sum"}));
        assert_eq!(&buf[..], br#"17#{"pattern":"sum"}"#);
    }

    #[test]
    fn prefix_counts_bytes_not_chars() {
        let buf = encode(json!("é"));
        assert_eq!(&buf[..2], b"4#");
    }

    #[test]
    fn decodes_complete_frame() {
        let mut buf = BytesMut::from(&br#"10#{"data":1}"#[..]);
        let value = JsonSocketCodec::new().decode(&mut buf).unwrap();
        assert_eq!(value, Some(json!({"data": 1})));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frame() {
        let mut codec = JsonSocketCodec::new();
        let mut buf = BytesMut::from(&b"10#{\"data\""[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b":1}");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"data": 1})));
    }

    #[test]
    fn waits_for_prefix() {
        let mut buf = BytesMut::from(&b"12"[..]);
        assert_eq!(JsonSocketCodec::new().decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = encode(json!(1));
        buf.extend_from_slice(&encode(json!([2, 3])));
        let mut codec = JsonSocketCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!([2, 3])));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_non_numeric_prefix() {
        let mut buf = BytesMut::from(&b"ab#{}"[..]);
        assert_matches!(
            JsonSocketCodec::new().decode(&mut buf),
            Err(TransportError::Codec { .. })
        );
    }

    #[test]
    fn rejects_missing_delimiter() {
        let mut buf = BytesMut::from(&b"{\"pattern\":\"sum\",\"data\":1}"[..]);
        assert_matches!(
            JsonSocketCodec::new().decode(&mut buf),
            Err(TransportError::Codec { .. })
        );
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = BytesMut::from(&b"100#"[..]);
        assert_matches!(
            JsonSocketCodec::with_max_frame_length(10).decode(&mut buf),
            Err(TransportError::Codec { .. })
        );
    }

    #[test]
    fn rejects_invalid_json_body() {
        let mut buf = BytesMut::from(&b"3#{x}"[..]);
        assert_matches!(
            JsonSocketCodec::new().decode(&mut buf),
            Err(TransportError::Codec { .. })
        );
    }
}
