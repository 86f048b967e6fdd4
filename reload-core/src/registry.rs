//! Codec registry: message code → body decoder.
//!
//! Encoding is an exhaustive match on [`Content`]; decoding reads the message code first and
//! hands the rest of the content field to the decoder registered for it. Collaborator services
//! register their codes at start-up; an unregistered code is an `UnsupportedType` error.

use std::collections::HashMap;

use bytes::Bytes;

use crate::codec::{CodecError, LengthWidth, WireObject, WireReader};
use crate::config::CodecConfig;
use crate::message::{
    Content, ContentType, ErrorContent, Header, LeaveRequest, Message, PingRequest, PingResponse,
};
use crate::security::SecurityBlock;

/// Decodes the body field that follows `content_type`. Must consume all of it; the registry
/// rejects leftovers.
pub type BodyDecoder =
    fn(ContentType, &mut WireReader<'_>, &CodecConfig) -> Result<Content, CodecError>;

fn decode_ping_request(
    _: ContentType,
    r: &mut WireReader<'_>,
    cfg: &CodecConfig,
) -> Result<Content, CodecError> {
    PingRequest::decode(r, cfg).map(Content::PingRequest)
}

fn decode_ping_response(
    _: ContentType,
    r: &mut WireReader<'_>,
    cfg: &CodecConfig,
) -> Result<Content, CodecError> {
    PingResponse::decode(r, cfg).map(Content::PingResponse)
}

fn decode_leave_request(
    _: ContentType,
    r: &mut WireReader<'_>,
    cfg: &CodecConfig,
) -> Result<Content, CodecError> {
    LeaveRequest::decode(r, cfg).map(Content::LeaveRequest)
}

fn decode_leave_response(
    _: ContentType,
    _: &mut WireReader<'_>,
    _: &CodecConfig,
) -> Result<Content, CodecError> {
    Ok(Content::LeaveResponse)
}

fn decode_error(
    _: ContentType,
    r: &mut WireReader<'_>,
    cfg: &CodecConfig,
) -> Result<Content, CodecError> {
    ErrorContent::decode(r, cfg).map(Content::Error)
}

/// Decoder for collaborator-owned bodies: keeps the bytes verbatim.
pub fn decode_opaque(
    content_type: ContentType,
    r: &mut WireReader<'_>,
    _: &CodecConfig,
) -> Result<Content, CodecError> {
    Ok(Content::Opaque {
        content_type,
        body: Bytes::copy_from_slice(r.rest()),
    })
}

/// Message decode failure. `header` is set when the forwarding header was readable, which
/// is what makes an error reply to the sender possible.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct MessageDecodeError {
    pub header: Option<Header>,
    pub error: CodecError,
}

/// Built once at process start and shared by reference.
#[derive(Clone)]
pub struct CodecRegistry {
    config: CodecConfig,
    decoders: HashMap<ContentType, BodyDecoder>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.decoders.keys().map(|c| c.0).collect();
        codes.sort_unstable();
        f.debug_struct("CodecRegistry")
            .field("config", &self.config)
            .field("codes", &codes)
            .finish()
    }
}

impl CodecRegistry {
    /// Empty registry; nothing decodes until registered.
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            decoders: HashMap::new(),
        }
    }

    /// Registry with the core's own content types.
    pub fn with_builtin(config: CodecConfig) -> Self {
        let mut registry = Self::new(config);
        registry.register(ContentType::PING_REQ, decode_ping_request);
        registry.register(ContentType::PING_ANS, decode_ping_response);
        registry.register(ContentType::LEAVE_REQ, decode_leave_request);
        registry.register(ContentType::LEAVE_ANS, decode_leave_response);
        registry.register(ContentType::ERROR, decode_error);
        registry
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Register `decoder` for `content_type`, returning any decoder it replaces.
    pub fn register(
        &mut self,
        content_type: ContentType,
        decoder: BodyDecoder,
    ) -> Option<BodyDecoder> {
        self.decoders.insert(content_type, decoder)
    }

    /// Accept `content_type` and transport its body verbatim.
    pub fn register_opaque(&mut self, content_type: ContentType) {
        self.register(content_type, decode_opaque);
    }

    pub fn is_registered(&self, content_type: ContentType) -> bool {
        self.decoders.contains_key(&content_type)
    }

    /// Decode a content field (`message_code | body<u32>`) that spans all of `r`.
    pub fn decode_content(&self, r: &mut WireReader<'_>) -> Result<Content, CodecError> {
        let content_type = ContentType(r.get_u16()?);
        let decoder = self
            .decoders
            .get(&content_type)
            .ok_or(CodecError::UnsupportedType(content_type.0))?;
        r.decode_field(LengthWidth::U32, |body| {
            decoder(content_type, body, &self.config)
        })
    }

    /// Decode a whole message. The header is decoded first so its transaction id survives
    /// failures later in the buffer.
    pub fn decode_message(&self, bytes: &[u8]) -> Result<Message, MessageDecodeError> {
        let mut r = WireReader::new(bytes);
        let header = r
            .decode_field(LengthWidth::U16, |h| Header::decode(h, &self.config))
            .map_err(|error| MessageDecodeError {
                header: None,
                error,
            })?;
        let fail = |error| MessageDecodeError {
            header: Some(header.clone()),
            error,
        };
        if bytes.len() > self.config.max_message_size {
            return Err(fail(CodecError::MessageTooLarge {
                size: bytes.len(),
                max: self.config.max_message_size,
            }));
        }
        let security = r
            .decode_field(LengthWidth::U32, |s| SecurityBlock::decode(s, &self.config))
            .map_err(fail)?;
        let content = r
            .decode_field(LengthWidth::U32, |c| self.decode_content(c))
            .map_err(fail)?;
        r.finish().map_err(fail)?;
        Ok(Message {
            header,
            security,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;
    use crate::identity::NodeId;
    use crate::message::{Destination, ErrorCode};

    fn overlay() -> OverlayConfig {
        OverlayConfig::default()
    }

    fn ping() -> Message {
        Message::request(
            &overlay(),
            vec![Destination::Node(NodeId::random(16))],
            Content::PingRequest(PingRequest {
                padding: Bytes::from_static(b"pad"),
            }),
        )
    }

    #[test]
    fn builtin_messages_roundtrip() {
        let registry = CodecRegistry::with_builtin(overlay().codec());
        let request = ping();
        let contents = vec![
            request.content.clone(),
            Content::PingResponse(PingResponse {
                response_id: 77,
                time: 1_700_000_000_000,
            }),
            Content::LeaveRequest(LeaveRequest {
                node_id: NodeId::random(16),
                overlay_specific: Bytes::new(),
            }),
            Content::LeaveResponse,
            Content::Error(ErrorContent::with_text(ErrorCode::GEN_COUNTER_TOO_LOW, "gen")),
        ];
        for content in contents {
            let msg = Message::response(&request, &overlay(), content);
            let bytes = msg.encode(registry.config()).unwrap();
            assert_eq!(registry.decode_message(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn unregistered_code_is_unsupported() {
        let registry = CodecRegistry::with_builtin(overlay().codec());
        let msg = Message::request(
            &overlay(),
            vec![],
            Content::Opaque {
                content_type: ContentType::STORE_REQ,
                body: Bytes::from_static(b"kind-data"),
            },
        );
        let bytes = msg.encode(registry.config()).unwrap();
        let err = registry.decode_message(&bytes).unwrap_err();
        assert_eq!(err.error, CodecError::UnsupportedType(7));
        assert_eq!(
            err.header.map(|h| h.transaction_id),
            Some(msg.transaction_id())
        );
    }

    #[test]
    fn registered_opaque_body_is_transported_verbatim() {
        let mut registry = CodecRegistry::with_builtin(overlay().codec());
        registry.register_opaque(ContentType::STORE_REQ);
        let msg = Message::request(
            &overlay(),
            vec![],
            Content::Opaque {
                content_type: ContentType::STORE_REQ,
                body: Bytes::from_static(b"kind-data"),
            },
        );
        let bytes = msg.encode(registry.config()).unwrap();
        assert_eq!(registry.decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn trailing_bytes_in_body_rejected() {
        let registry = CodecRegistry::with_builtin(overlay().codec());
        let msg = Message::request(&overlay(), vec![], Content::LeaveResponse);
        let mut bytes = msg.encode(registry.config()).unwrap().to_vec();
        // Grow the body by one byte the leave-response decoder won't read.
        let body_len_at = bytes.len() - 4;
        bytes[body_len_at..].copy_from_slice(&1u32.to_be_bytes());
        let content_len_at = bytes.len() - 4 - 2 - 4;
        let len = u32::from_be_bytes(bytes[content_len_at..content_len_at + 4].try_into().unwrap());
        bytes[content_len_at..content_len_at + 4].copy_from_slice(&(len + 1).to_be_bytes());
        bytes.push(0xee);
        let err = registry.decode_message(&bytes).unwrap_err();
        assert_eq!(err.error, CodecError::TrailingBytes(1));
        assert!(err.header.is_some());
    }

    #[test]
    fn truncated_message_never_decodes() {
        let registry = CodecRegistry::with_builtin(overlay().codec());
        let bytes = ping().encode(registry.config()).unwrap();
        for cut in 0..bytes.len() {
            let err = registry.decode_message(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err.error, CodecError::Truncated { .. }),
                "cut at {cut}: {err:?}"
            );
        }
    }

    #[test]
    fn oversized_input_rejected_with_header() {
        let big = OverlayConfig {
            max_message_size: 64 * 1024,
            ..overlay()
        };
        let msg = Message::request(
            &big,
            vec![],
            Content::PingRequest(PingRequest {
                padding: Bytes::from(vec![0u8; 6000]),
            }),
        );
        let bytes = msg.encode(&big.codec()).unwrap();
        let registry = CodecRegistry::with_builtin(overlay().codec());
        let err = registry.decode_message(&bytes).unwrap_err();
        assert!(matches!(err.error, CodecError::MessageTooLarge { .. }));
        assert_eq!(err.error.error_code(), ErrorCode::MESSAGE_TOO_LARGE);
    }
}
