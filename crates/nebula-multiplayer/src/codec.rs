//! Binary encoding of wire messages.
//!
//! Layout: `[protocol version][compression flag][body]`, where the body is
//! the [`postcard`] encoding of the message, LZ4-compressed when it is at
//! least [`CompressionConfig::threshold`] bytes long.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current wire-protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Body is stored as-is.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Body is LZ4-compressed with a prepended size.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when bodies are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum body size in bytes before compression is applied. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
        }
    }
}

/// Errors produced while decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload is shorter than the two header bytes.
    #[error("payload too short for header")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The compression flag is neither none nor LZ4.
    #[error("unknown compression flag: {0:#04x}")]
    UnknownFlag(u8),

    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    Decompress(String),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encodes `message` for the wire.
pub fn encode<T: Serialize>(message: &T, config: &CompressionConfig) -> Result<Vec<u8>, CodecError> {
    let body = postcard::to_allocvec(message)?;
    let (flag, body) = if config.enabled && body.len() >= config.threshold {
        (COMPRESSION_FLAG_LZ4, compress_prepend_size(&body))
    } else {
        (COMPRESSION_FLAG_NONE, body)
    };
    let mut out = Vec::with_capacity(2 + body.len());
    out.push(PROTOCOL_VERSION);
    out.push(flag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a payload produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let [version, flag, body @ ..] = bytes else {
        return Err(CodecError::EmptyPayload);
    };
    if *version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(*version));
    }
    match *flag {
        COMPRESSION_FLAG_NONE => Ok(postcard::from_bytes(body)?),
        COMPRESSION_FLAG_LZ4 => {
            let body = decompress_size_prepended(body)
                .map_err(|e| CodecError::Decompress(e.to_string()))?;
            Ok(postcard::from_bytes(&body)?)
        }
        other => Err(CodecError::UnknownFlag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, ServerMessage};
    use crate::world::{EntitySnapshot, NetworkId, ReplicatedComponent};

    #[test]
    fn test_small_message_is_not_compressed() {
        let msg = ClientMessage::Heartbeat {
            tick: 7,
            adjustment_iteration: 1,
        };
        let bytes = encode(&msg, &CompressionConfig::default()).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], COMPRESSION_FLAG_NONE);
        assert_eq!(decode::<ClientMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_large_message_is_compressed() {
        let msg = ServerMessage::EntityInit {
            tick: 3,
            snapshot: EntitySnapshot {
                entity: NetworkId(1),
                components: vec![ReplicatedComponent::Name("n".repeat(1024))],
            },
        };
        let bytes = encode(&msg, &CompressionConfig::default()).unwrap();
        assert_eq!(bytes[1], COMPRESSION_FLAG_LZ4);
        assert!(bytes.len() < 1024);
        assert_eq!(decode::<ServerMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(matches!(
            decode::<ClientMessage>(&[PROTOCOL_VERSION]),
            Err(CodecError::EmptyPayload)
        ));
        assert!(matches!(
            decode::<ClientMessage>(&[99, 0, 0]),
            Err(CodecError::UnsupportedVersion(99))
        ));
        assert!(matches!(
            decode::<ClientMessage>(&[PROTOCOL_VERSION, 7, 0]),
            Err(CodecError::UnknownFlag(7))
        ));
    }

    #[test]
    fn test_truncated_body_is_a_postcard_error() {
        let msg = ClientMessage::ConnectionRequest {
            player_name: "somebody".into(),
        };
        let bytes = encode(&msg, &CompressionConfig::default()).unwrap();
        let err = decode::<ClientMessage>(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::Postcard(_)));
    }
}
