//! Frame encoding.
//!
//! Every frame on the wire has the layout
//!
//! ```text
//! [2 bytes content type][2 bytes key length][key][2 bytes payload length][payload]
//! ```
//!
//! The three fixed-width fields are big-endian `u16`s written with the same bincode
//! configuration the rest of the crate uses for integers on the wire. Decoding is
//! incremental and lives in [`Parser`](super::Parser); this module only holds the pieces
//! both directions share.
//!
//! Stream frames declare a payload length of zero. Their body is written as it becomes
//! available and closed with the in-band sentinel `__end_<key>`. Body bytes that happen to
//! contain the sentinel for the same key are indistinguishable from the real end of the
//! stream; this is a known limitation of the format.
use bincode::config::{BigEndian, Configuration, Fixint};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

/// Key of the frame closing every transaction.
pub const TERMINATOR_KEY: &str = "$$__END__$$";

/// JSON value carried by the terminator frame.
pub const TERMINATOR_VALUE: u8 = 1;

/// Prefix of the in-band marker closing a stream frame.
pub const SENTINEL_PREFIX: &str = "__end_";

/// Width of every fixed header field.
pub(crate) const FIELD_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("key is {0} bytes long; keys are limited to {max} bytes", max = u16::MAX)]
    KeyTooLong(usize),

    #[error(
        "payload for '{key}' is {len} bytes long; payloads are limited to {max} bytes",
        max = u16::MAX
    )]
    PayloadTooLarge { key: String, len: usize },

    #[error("unknown content type {0}")]
    UnknownContentType(u16),

    #[error("failed to serialize value for '{key}': {source}")]
    Json {
        key: String,
        source: serde_json::Error,
    },

    #[error("failed to encode header field: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode header field: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Tag stored in the first header field.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// UTF-8 JSON document.
    Data = 0,
    /// Unbounded body closed by the key's sentinel.
    Stream = 1,
    /// Raw bytes with a declared length.
    Buffer = 2,
}

impl TryFrom<u16> for ContentType {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ContentType::Data),
            1 => Ok(ContentType::Stream),
            2 => Ok(ContentType::Buffer),
            other => Err(CodecError::UnknownContentType(other)),
        }
    }
}

fn header_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

fn put_field(dst: &mut BytesMut, value: u16) -> Result<(), CodecError> {
    let mut field = [0u8; FIELD_LEN];
    bincode::encode_into_slice(value, &mut field, header_config())?;
    dst.extend_from_slice(&field);
    Ok(())
}

/// Reads one big-endian header field. `field` must hold exactly [`FIELD_LEN`] bytes.
pub(crate) fn read_field(field: &[u8]) -> Result<u16, CodecError> {
    let (value, _) = bincode::decode_from_slice::<u16, _>(field, header_config())?;
    Ok(value)
}

/// The byte sequence that terminates a stream frame for `key`.
pub fn sentinel(key: &str) -> Vec<u8> {
    format!("{SENTINEL_PREFIX}{key}").into_bytes()
}

fn encode_frame(
    content_type: ContentType,
    key: &str,
    payload: Option<&[u8]>,
) -> Result<BytesMut, CodecError> {
    let key_len = u16::try_from(key.len()).map_err(|_| CodecError::KeyTooLong(key.len()))?;
    let body = payload.unwrap_or_default();
    let payload_len = u16::try_from(body.len()).map_err(|_| CodecError::PayloadTooLarge {
        key: key.to_string(),
        len: body.len(),
    })?;

    let mut frame = BytesMut::with_capacity(3 * FIELD_LEN + key.len() + body.len());
    put_field(&mut frame, content_type as u16)?;
    put_field(&mut frame, key_len)?;
    frame.extend_from_slice(key.as_bytes());
    put_field(&mut frame, payload_len)?;
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Encodes `value` as a JSON data frame.
pub fn encode_data<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_vec(value).map_err(|source| CodecError::Json {
        key: key.to_string(),
        source,
    })?;
    Ok(encode_frame(ContentType::Data, key, Some(&payload))?.freeze())
}

/// Encodes a raw buffer frame.
pub fn encode_buffer(key: &str, payload: &[u8]) -> Result<Bytes, CodecError> {
    Ok(encode_frame(ContentType::Buffer, key, Some(payload))?.freeze())
}

/// Encodes the header of a stream frame. The body follows, then [`stream_trailer`].
pub fn encode_stream_header(key: &str) -> Result<Bytes, CodecError> {
    Ok(encode_frame(ContentType::Stream, key, None)?.freeze())
}

pub fn stream_trailer(key: &str) -> Bytes {
    Bytes::from(sentinel(key))
}

/// Encodes the frame that closes a transaction.
pub fn encode_terminator() -> Result<Bytes, CodecError> {
    encode_data(TERMINATOR_KEY, &TERMINATOR_VALUE)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn data_frame_layout() {
        let frame = encode_data("n", &json!(42)).unwrap();

        assert_eq!(&frame[..], &[0, 0, 0, 1, b'n', 0, 2, b'4', b'2']);
    }

    #[test]
    fn buffer_frame_declares_byte_length() {
        let frame = encode_buffer("raw", &[0xde, 0xad, 0xbe, 0xef]).unwrap();

        assert_eq!(&frame[..2], &[0, 2]);
        assert_eq!(&frame[2..4], &[0, 3]);
        assert_eq!(&frame[4..7], b"raw");
        assert_eq!(&frame[7..9], &[0, 4]);
        assert_eq!(&frame[9..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn stream_header_declares_zero_length() {
        let frame = encode_stream_header("file").unwrap();

        assert_eq!(&frame[..], &[0, 1, 0, 4, b'f', b'i', b'l', b'e', 0, 0]);
        assert_eq!(&stream_trailer("file")[..], b"__end_file");
    }

    #[test]
    fn terminator_frame() {
        let frame = encode_terminator().unwrap();

        let mut expected = vec![0, 0, 0, 11];
        expected.extend_from_slice(TERMINATOR_KEY.as_bytes());
        expected.extend_from_slice(&[0, 1, b'1']);
        assert_eq!(&frame[..], &expected[..]);
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let key = "k".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            encode_data(&key, &1),
            Err(CodecError::KeyTooLong(len)) if len == key.len()
        ));

        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            encode_buffer("big", &payload),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn fields_are_big_endian() {
        assert_eq!(read_field(&[0x01, 0x02]).unwrap(), 0x0102);
    }

    #[test]
    fn content_type_tags() {
        assert_eq!(ContentType::try_from(0).unwrap(), ContentType::Data);
        assert_eq!(ContentType::try_from(1).unwrap(), ContentType::Stream);
        assert_eq!(ContentType::try_from(2).unwrap(), ContentType::Buffer);
        assert!(matches!(
            ContentType::try_from(7),
            Err(CodecError::UnknownContentType(7))
        ));
    }
}
