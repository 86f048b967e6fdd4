//! Overlay messages: forwarding header, security block and typed content.
//!
//! Wire layout of a message:
//!
//! ```text
//! +----------------+------------------+-------------------------------+
//! | header<u16>    | security<u32>    | content<u32>                  |
//! +----------------+------------------+-------------------------------+
//! header  = relo_token u32 | overlay u32 | configuration_sequence u16 | version u8 | ttl u8 |
//!           transaction_id u64 | max_response_length u32 |
//!           via_list<u16> | destination_list<u16> | options<u16>
//! content = message_code u16 | body<u32>
//! ```

use std::fmt;

use bytes::Bytes;
use rand::Rng;

use crate::codec::{
    decode_list, encode_list, CodecError, LengthWidth, WireObject, WireReader, WireWriter,
};
use crate::config::{CodecConfig, OverlayConfig};
use crate::identity::{overlay_hash, NodeId};
use crate::security::SecurityBlock;

/// First four bytes of every header: "\xd2ELO".
pub const RELO_TOKEN: u32 = 0xd245_4c4f;
/// Protocol version 1.0.
pub const PROTOCOL_VERSION: u8 = 10;

/// Message code identifying a content body. Requests are odd, their responses are the
/// request code plus one, and `ERROR` answers any request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentType(pub u16);

impl ContentType {
    pub const PROBE_REQ: Self = Self(1);
    pub const PROBE_ANS: Self = Self(2);
    pub const ATTACH_REQ: Self = Self(3);
    pub const ATTACH_ANS: Self = Self(4);
    pub const STORE_REQ: Self = Self(7);
    pub const STORE_ANS: Self = Self(8);
    pub const FETCH_REQ: Self = Self(9);
    pub const FETCH_ANS: Self = Self(10);
    pub const FIND_REQ: Self = Self(13);
    pub const FIND_ANS: Self = Self(14);
    pub const JOIN_REQ: Self = Self(15);
    pub const JOIN_ANS: Self = Self(16);
    pub const LEAVE_REQ: Self = Self(17);
    pub const LEAVE_ANS: Self = Self(18);
    pub const UPDATE_REQ: Self = Self(19);
    pub const UPDATE_ANS: Self = Self(20);
    pub const ROUTE_QUERY_REQ: Self = Self(21);
    pub const ROUTE_QUERY_ANS: Self = Self(22);
    pub const PING_REQ: Self = Self(23);
    pub const PING_ANS: Self = Self(24);
    pub const STAT_REQ: Self = Self(25);
    pub const STAT_ANS: Self = Self(26);
    pub const APP_ATTACH_REQ: Self = Self(29);
    pub const APP_ATTACH_ANS: Self = Self(30);
    pub const CONFIG_UPDATE_REQ: Self = Self(33);
    pub const CONFIG_UPDATE_ANS: Self = Self(34);
    pub const ERROR: Self = Self(0xffff);

    pub fn is_error(self) -> bool {
        self == Self::ERROR
    }

    pub fn is_request(self) -> bool {
        !self.is_error() && self.0 % 2 == 1
    }

    pub fn is_response(self) -> bool {
        !self.is_request()
    }

    /// Answer code paired with this request code.
    pub fn response_type(self) -> Option<ContentType> {
        self.is_request().then(|| ContentType(self.0 + 1))
    }

    /// Codes whose bodies the core itself decodes.
    pub fn is_builtin(self) -> bool {
        matches!(
            self,
            Self::PING_REQ | Self::PING_ANS | Self::LEAVE_REQ | Self::LEAVE_ANS | Self::ERROR
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Error code carried in an error response. Codes the core does not name are carried
/// through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const FORBIDDEN: Self = Self(2);
    pub const NOT_FOUND: Self = Self(3);
    pub const REQUEST_TIMEOUT: Self = Self(4);
    pub const GEN_COUNTER_TOO_LOW: Self = Self(5);
    pub const INCOMPATIBLE_WITH_OVERLAY: Self = Self(6);
    pub const UNSUPPORTED_FORWARDING_OPTION: Self = Self(7);
    pub const DATA_TOO_LARGE: Self = Self(8);
    pub const DATA_TOO_OLD: Self = Self(9);
    pub const TTL_EXCEEDED: Self = Self(10);
    pub const MESSAGE_TOO_LARGE: Self = Self(11);
    pub const UNKNOWN_KIND: Self = Self(12);
    pub const UNKNOWN_EXTENSION: Self = Self(13);
    pub const RESPONSE_TOO_LARGE: Self = Self(14);
    pub const CONFIG_TOO_OLD: Self = Self(15);
    pub const CONFIG_TOO_NEW: Self = Self(16);
    pub const IN_PROGRESS: Self = Self(17);
    pub const INVALID_MESSAGE: Self = Self(20);
}

/// Error response body: code plus opaque info (US-ASCII text when textual).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContent {
    pub code: ErrorCode,
    pub info: Bytes,
}

impl ErrorContent {
    pub fn new(code: ErrorCode, info: impl Into<Bytes>) -> Self {
        Self {
            code,
            info: info.into(),
        }
    }

    /// Error with a textual reason; non-ASCII characters are replaced by `?`.
    pub fn with_text(code: ErrorCode, text: &str) -> Self {
        let ascii: Vec<u8> = text
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        Self::new(code, ascii)
    }

    /// Info as text, when it is US-ASCII.
    pub fn text(&self) -> Option<&str> {
        if self.info.is_ascii() {
            std::str::from_utf8(&self.info).ok()
        } else {
            None
        }
    }
}

impl WireObject for ErrorContent {
    fn encode(&self, w: &mut WireWriter, _cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_u16(self.code.0);
        w.put_opaque(LengthWidth::U16, &self.info)
    }

    fn decode(r: &mut WireReader<'_>, _cfg: &CodecConfig) -> Result<Self, CodecError> {
        let code = ErrorCode(r.get_u16()?);
        let info = Bytes::copy_from_slice(r.opaque(LengthWidth::U16)?);
        Ok(Self { code, info })
    }
}

const DEST_NODE: u8 = 1;
const DEST_RESOURCE: u8 = 2;
const DEST_OPAQUE: u8 = 3;
const DEST_COMPRESSED_FLAG: u8 = 0x80;

/// One entry of a destination or via list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Node(NodeId),
    Resource(Bytes),
    Opaque(Bytes),
    /// Two-byte id whose meaning is agreed between neighbours.
    Compressed(u16),
}

impl Destination {
    pub fn is_node(&self, id: &NodeId) -> bool {
        matches!(self, Destination::Node(n) if n == id)
    }
}

impl WireObject for Destination {
    fn encode(&self, w: &mut WireWriter, cfg: &CodecConfig) -> Result<(), CodecError> {
        match self {
            Destination::Node(id) => {
                if id.len() != cfg.node_id_length {
                    return Err(CodecError::Malformed(format!(
                        "node id of {} bytes, overlay uses {}",
                        id.len(),
                        cfg.node_id_length
                    )));
                }
                w.put_u8(DEST_NODE);
                w.put_opaque(LengthWidth::U8, id.as_bytes())
            }
            Destination::Resource(id) => {
                w.put_u8(DEST_RESOURCE);
                w.put_field(LengthWidth::U8, |w| w.put_opaque(LengthWidth::U8, id))
            }
            Destination::Opaque(id) => {
                w.put_u8(DEST_OPAQUE);
                w.put_field(LengthWidth::U8, |w| w.put_opaque(LengthWidth::U8, id))
            }
            Destination::Compressed(id) => {
                if *id > 0x7fff {
                    return Err(CodecError::Malformed(format!(
                        "compressed id {id:#x} exceeds 15 bits"
                    )));
                }
                w.put_u16(0x8000 | id);
                Ok(())
            }
        }
    }

    fn decode(r: &mut WireReader<'_>, cfg: &CodecConfig) -> Result<Self, CodecError> {
        if r.peek_u8()? & DEST_COMPRESSED_FLAG != 0 {
            return Ok(Destination::Compressed(r.get_u16()? & 0x7fff));
        }
        let dest_type = r.get_u8()?;
        r.decode_field(LengthWidth::U8, |value| match dest_type {
            DEST_NODE => {
                let id = value.rest();
                if id.len() != cfg.node_id_length {
                    return Err(CodecError::Malformed(format!(
                        "node id of {} bytes, overlay uses {}",
                        id.len(),
                        cfg.node_id_length
                    )));
                }
                Ok(Destination::Node(NodeId::from_bytes(Bytes::copy_from_slice(id))))
            }
            DEST_RESOURCE => Ok(Destination::Resource(Bytes::copy_from_slice(
                value.opaque(LengthWidth::U8)?,
            ))),
            DEST_OPAQUE => Ok(Destination::Opaque(Bytes::copy_from_slice(
                value.opaque(LengthWidth::U8)?,
            ))),
            other => Err(CodecError::UnsupportedType(other as u16)),
        })
    }
}

/// Hop-by-hop option in the forwarding header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingOption {
    pub option_type: u8,
    pub flags: u8,
    pub value: Bytes,
}

impl ForwardingOption {
    pub const FORWARD_CRITICAL: u8 = 0x01;
    pub const DESTINATION_CRITICAL: u8 = 0x02;
    pub const RESPONSE_COPY: u8 = 0x04;

    pub fn is_forward_critical(&self) -> bool {
        self.flags & Self::FORWARD_CRITICAL != 0
    }

    pub fn is_destination_critical(&self) -> bool {
        self.flags & Self::DESTINATION_CRITICAL != 0
    }
}

impl WireObject for ForwardingOption {
    fn encode(&self, w: &mut WireWriter, _cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_u8(self.option_type);
        w.put_u8(self.flags);
        w.put_opaque(LengthWidth::U16, &self.value)
    }

    fn decode(r: &mut WireReader<'_>, _cfg: &CodecConfig) -> Result<Self, CodecError> {
        let option_type = r.get_u8()?;
        let flags = r.get_u8()?;
        let value = Bytes::copy_from_slice(r.opaque(LengthWidth::U16)?);
        Ok(Self {
            option_type,
            flags,
            value,
        })
    }
}

/// Forwarding header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub overlay: u32,
    pub configuration_sequence: u16,
    pub version: u8,
    pub ttl: u8,
    pub transaction_id: u64,
    pub max_response_length: u32,
    pub via_list: Vec<Destination>,
    pub destination_list: Vec<Destination>,
    pub options: Vec<ForwardingOption>,
}

impl Header {
    /// Fresh header for a message originated by this node.
    pub fn new(config: &OverlayConfig, destination_list: Vec<Destination>) -> Self {
        Self {
            overlay: overlay_hash(&config.overlay_name),
            configuration_sequence: config.configuration_sequence,
            version: PROTOCOL_VERSION,
            ttl: config.initial_ttl,
            transaction_id: rand::thread_rng().gen(),
            max_response_length: 0,
            via_list: Vec::new(),
            destination_list,
            options: Vec::new(),
        }
    }

    /// Header for an answer: same transaction, addressed back along the reversed via list.
    pub fn response_header(&self, config: &OverlayConfig) -> Self {
        let mut header = Header::new(config, self.via_list.iter().rev().cloned().collect());
        header.transaction_id = self.transaction_id;
        header
    }
}

impl WireObject for Header {
    fn encode(&self, w: &mut WireWriter, cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_u32(RELO_TOKEN);
        w.put_u32(self.overlay);
        w.put_u16(self.configuration_sequence);
        w.put_u8(self.version);
        w.put_u8(self.ttl);
        w.put_u64(self.transaction_id);
        w.put_u32(self.max_response_length);
        encode_list(w, LengthWidth::U16, &self.via_list, cfg)?;
        encode_list(w, LengthWidth::U16, &self.destination_list, cfg)?;
        encode_list(w, LengthWidth::U16, &self.options, cfg)
    }

    fn decode(r: &mut WireReader<'_>, cfg: &CodecConfig) -> Result<Self, CodecError> {
        let token = r.get_u32()?;
        if token != RELO_TOKEN {
            return Err(CodecError::Malformed(format!("bad relo token {token:#010x}")));
        }
        let overlay = r.get_u32()?;
        let configuration_sequence = r.get_u16()?;
        let version = r.get_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::Malformed(format!(
                "unsupported protocol version {version}"
            )));
        }
        let ttl = r.get_u8()?;
        let transaction_id = r.get_u64()?;
        let max_response_length = r.get_u32()?;
        let via_list = decode_list(r, LengthWidth::U16, cfg)?;
        let destination_list = decode_list(r, LengthWidth::U16, cfg)?;
        let options = decode_list(r, LengthWidth::U16, cfg)?;
        Ok(Self {
            overlay,
            configuration_sequence,
            version,
            ttl,
            transaction_id,
            max_response_length,
            via_list,
            destination_list,
            options,
        })
    }
}

/// Ping request: padding lets a sender discover the path MTU.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PingRequest {
    pub padding: Bytes,
}

impl WireObject for PingRequest {
    fn encode(&self, w: &mut WireWriter, _cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_opaque(LengthWidth::U16, &self.padding)
    }

    fn decode(r: &mut WireReader<'_>, _cfg: &CodecConfig) -> Result<Self, CodecError> {
        Ok(Self {
            padding: Bytes::copy_from_slice(r.opaque(LengthWidth::U16)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResponse {
    pub response_id: u64,
    /// Responder clock, milliseconds since the Unix epoch.
    pub time: u64,
}

impl WireObject for PingResponse {
    fn encode(&self, w: &mut WireWriter, _cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_u64(self.response_id);
        w.put_u64(self.time);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>, _cfg: &CodecConfig) -> Result<Self, CodecError> {
        Ok(Self {
            response_id: r.get_u64()?,
            time: r.get_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveRequest {
    pub node_id: NodeId,
    pub overlay_specific: Bytes,
}

impl WireObject for LeaveRequest {
    fn encode(&self, w: &mut WireWriter, cfg: &CodecConfig) -> Result<(), CodecError> {
        if self.node_id.len() != cfg.node_id_length {
            return Err(CodecError::Malformed(format!(
                "node id of {} bytes, overlay uses {}",
                self.node_id.len(),
                cfg.node_id_length
            )));
        }
        w.put_slice(self.node_id.as_bytes());
        w.put_opaque(LengthWidth::U16, &self.overlay_specific)
    }

    fn decode(r: &mut WireReader<'_>, cfg: &CodecConfig) -> Result<Self, CodecError> {
        let node_id = NodeId::from_bytes(Bytes::copy_from_slice(r.get_bytes(cfg.node_id_length)?));
        let overlay_specific = Bytes::copy_from_slice(r.opaque(LengthWidth::U16)?);
        Ok(Self {
            node_id,
            overlay_specific,
        })
    }
}

/// Message content, keyed by message code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    LeaveRequest(LeaveRequest),
    LeaveResponse,
    Error(ErrorContent),
    /// Body owned by a collaborator service (storage, attach, ...), transported verbatim.
    Opaque { content_type: ContentType, body: Bytes },
}

impl Content {
    pub fn content_type(&self) -> ContentType {
        match self {
            Content::PingRequest(_) => ContentType::PING_REQ,
            Content::PingResponse(_) => ContentType::PING_ANS,
            Content::LeaveRequest(_) => ContentType::LEAVE_REQ,
            Content::LeaveResponse => ContentType::LEAVE_ANS,
            Content::Error(_) => ContentType::ERROR,
            Content::Opaque { content_type, .. } => *content_type,
        }
    }

    /// Writes `message_code | body<u32>`. Decoding goes through the codec registry.
    pub fn encode(&self, w: &mut WireWriter, cfg: &CodecConfig) -> Result<(), CodecError> {
        if let Content::Opaque { content_type, .. } = self {
            if content_type.is_builtin() {
                return Err(CodecError::Malformed(format!(
                    "opaque body under built-in code {content_type}"
                )));
            }
        }
        w.put_u16(self.content_type().0);
        w.put_field(LengthWidth::U32, |w| match self {
            Content::PingRequest(body) => body.encode(w, cfg),
            Content::PingResponse(body) => body.encode(w, cfg),
            Content::LeaveRequest(body) => body.encode(w, cfg),
            Content::LeaveResponse => Ok(()),
            Content::Error(body) => body.encode(w, cfg),
            Content::Opaque { body, .. } => {
                w.put_slice(body);
                Ok(())
            }
        })
    }
}

/// A complete overlay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub security: SecurityBlock,
    pub content: Content,
}

impl Message {
    /// New request from this node with a fresh transaction id.
    pub fn request(
        config: &OverlayConfig,
        destination_list: Vec<Destination>,
        content: Content,
    ) -> Self {
        Self {
            header: Header::new(config, destination_list),
            security: SecurityBlock::default(),
            content,
        }
    }

    /// Answer to `request`, routed back along its via list.
    pub fn response(request: &Message, config: &OverlayConfig, content: Content) -> Self {
        Self {
            header: request.header.response_header(config),
            security: SecurityBlock::default(),
            content,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.header.transaction_id
    }

    pub fn content_type(&self) -> ContentType {
        self.content.content_type()
    }

    pub fn encode(&self, cfg: &CodecConfig) -> Result<Bytes, CodecError> {
        let mut w = WireWriter::with_capacity(256);
        w.put_field(LengthWidth::U16, |w| self.header.encode(w, cfg))?;
        w.put_field(LengthWidth::U32, |w| self.security.encode(w, cfg))?;
        w.put_field(LengthWidth::U32, |w| self.content.encode(w, cfg))?;
        if w.len() > cfg.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: w.len(),
                max: cfg.max_message_size,
            });
        }
        Ok(w.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CodecConfig {
        CodecConfig::default()
    }

    #[test]
    fn content_type_parity() {
        assert!(ContentType::PING_REQ.is_request());
        assert!(ContentType::PING_ANS.is_response());
        assert!(ContentType::ERROR.is_response());
        assert_eq!(
            ContentType::STORE_REQ.response_type(),
            Some(ContentType::STORE_ANS)
        );
        assert_eq!(ContentType::ERROR.response_type(), None);
    }

    #[test]
    fn error_content_layout() {
        let err = ErrorContent::with_text(ErrorCode::DATA_TOO_OLD, "stale");
        let bytes = err.to_bytes(&cfg()).unwrap();
        assert_eq!(&bytes[..], &[0, 9, 0, 5, b's', b't', b'a', b'l', b'e']);
        let decoded = ErrorContent::from_bytes(&bytes, &cfg()).unwrap();
        assert_eq!(decoded.text(), Some("stale"));
    }

    #[test]
    fn error_text_is_ascii_only() {
        let err = ErrorContent::with_text(ErrorCode::FORBIDDEN, "naïve");
        assert_eq!(err.text(), Some("na?ve"));
        let binary = ErrorContent::new(ErrorCode(999), vec![0xffu8, 0x00]);
        assert_eq!(binary.text(), None);
    }

    #[test]
    fn destination_variants_roundtrip() {
        let list = vec![
            Destination::Node(NodeId::random(16)),
            Destination::Resource(Bytes::from_static(b"resource-key")),
            Destination::Opaque(Bytes::from_static(&[1, 2, 3])),
            Destination::Compressed(0x1234),
        ];
        let mut w = WireWriter::new();
        encode_list(&mut w, LengthWidth::U16, &list, &cfg()).unwrap();
        let bytes = w.finish();
        let mut r = WireReader::new(&bytes);
        let decoded: Vec<Destination> = decode_list(&mut r, LengthWidth::U16, &cfg()).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn node_destination_length_checked_against_config() {
        let long = Destination::Node(NodeId::random(20));
        assert!(long.to_bytes(&cfg()).is_err());

        let wide = CodecConfig {
            node_id_length: 20,
            ..cfg()
        };
        let bytes = long.to_bytes(&wide).unwrap();
        assert!(matches!(
            Destination::from_bytes(&bytes, &cfg()),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_destination_type() {
        let bytes = [7u8, 1, 0];
        assert_eq!(
            Destination::from_bytes(&bytes, &cfg()).unwrap_err(),
            CodecError::UnsupportedType(7)
        );
    }

    #[test]
    fn header_rejects_bad_token() {
        let overlay = OverlayConfig::default();
        let header = Header::new(&overlay, vec![Destination::Node(NodeId::random(16))]);
        let mut bytes = header.to_bytes(&cfg()).unwrap().to_vec();
        bytes[0] = 0;
        assert!(matches!(
            Header::from_bytes(&bytes, &cfg()),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn response_header_reverses_via_list() {
        let overlay = OverlayConfig::default();
        let a = NodeId::random(16);
        let b = NodeId::random(16);
        let mut header = Header::new(&overlay, vec![]);
        header.via_list = vec![Destination::Node(a.clone()), Destination::Node(b.clone())];
        let reply = header.response_header(&overlay);
        assert_eq!(reply.transaction_id, header.transaction_id);
        assert_eq!(
            reply.destination_list,
            vec![Destination::Node(b), Destination::Node(a)]
        );
        assert!(reply.via_list.is_empty());
        assert_eq!(reply.ttl, overlay.initial_ttl);
    }

    #[test]
    fn content_body_is_length_prefixed() {
        let mut w = WireWriter::new();
        Content::LeaveResponse.encode(&mut w, &cfg()).unwrap();
        assert_eq!(&w.finish()[..], &[0, 18, 0, 0, 0, 0]);

        let mut w = WireWriter::new();
        Content::PingResponse(PingResponse {
            response_id: 1,
            time: 2,
        })
        .encode(&mut w, &cfg())
        .unwrap();
        let bytes = w.finish();
        assert_eq!(&bytes[..6], &[0, 24, 0, 0, 0, 16]);
        assert_eq!(bytes.len(), 6 + 16);
    }

    #[test]
    fn opaque_cannot_borrow_builtin_code() {
        let forged = Content::Opaque {
            content_type: ContentType::PING_REQ,
            body: Bytes::from_static(b"not a ping"),
        };
        let mut w = WireWriter::new();
        assert!(matches!(
            forged.encode(&mut w, &cfg()),
            Err(CodecError::Malformed(_))
        ));

        let stored = Content::Opaque {
            content_type: ContentType::STORE_REQ,
            body: Bytes::from_static(b"kind-data"),
        };
        let mut w = WireWriter::new();
        assert!(stored.encode(&mut w, &cfg()).is_ok());
    }

    #[test]
    fn oversized_message_rejected_on_encode() {
        let overlay = OverlayConfig {
            max_message_size: 128,
            ..OverlayConfig::default()
        };
        let msg = Message::request(
            &overlay,
            vec![Destination::Node(NodeId::random(16))],
            Content::PingRequest(PingRequest {
                padding: Bytes::from(vec![0u8; 200]),
            }),
        );
        assert!(matches!(
            msg.encode(&overlay.codec()),
            Err(CodecError::MessageTooLarge { max: 128, .. })
        ));
    }
}
