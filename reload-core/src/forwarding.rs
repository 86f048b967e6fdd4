//! Forwarding stage: local delivery vs. next-hop forwarding.
//!
//! Inbound: decode, record the previous hop in the via list, strip this node from the front
//! of the destination list, then either publish to the dispatcher or hand the re-encoded
//! message (TTL decremented) to the link of the next hop. Failures on requests produce an
//! error response back over the link the request arrived on; anything else is dropped and
//! logged.
//!
//! Routing itself belongs to the [`RoutingTable`] collaborator; this stage only asks it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::codec::CodecError;
use crate::config::OverlayConfig;
use crate::dispatch::Dispatcher;
use crate::identity::{overlay_hash, NodeId};
use crate::message::{Content, Destination, ErrorCode, ErrorContent, Message};
use crate::registry::{CodecRegistry, MessageDecodeError};
use crate::security::SecurityBlock;

/// Identifies one link of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    Local,
    Connection(ConnectionId),
}

/// Overlay routing lookup. Must be a pure lookup without side effects.
pub trait RoutingTable: Send + Sync {
    /// Where a message with these remaining destinations goes next; `None` when there is no
    /// route.
    fn next_hop_for(&self, destinations: &[Destination]) -> Option<NextHop>;
}

impl<T: RoutingTable + ?Sized> RoutingTable for Arc<T> {
    fn next_hop_for(&self, destinations: &[Destination]) -> Option<NextHop> {
        (**self).next_hop_for(destinations)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("ttl exhausted")]
    TtlExceeded,
    #[error("no route to destination")]
    NoRoute,
    #[error("overlay {actual:#010x} is not ours ({expected:#010x})")]
    OverlayMismatch { expected: u32, actual: u32 },
    #[error("unsupported critical forwarding option {0}")]
    UnsupportedOption(u8),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RoutingError {
    /// Error code reported to the originator.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RoutingError::TtlExceeded => ErrorCode::TTL_EXCEEDED,
            RoutingError::NoRoute => ErrorCode::NOT_FOUND,
            RoutingError::OverlayMismatch { .. } => ErrorCode::INCOMPATIBLE_WITH_OVERLAY,
            RoutingError::UnsupportedOption(_) => ErrorCode::UNSUPPORTED_FORWARDING_OPTION,
            RoutingError::Codec(e) => e.error_code(),
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Published locally to this many handlers.
    Delivered(usize),
    /// Send `bytes` over `connection`.
    Forwarded { connection: ConnectionId, bytes: Bytes },
    /// Not routable; send the error response in `bytes` back over `connection`.
    Rejected {
        connection: ConnectionId,
        bytes: Bytes,
        error: RoutingError,
    },
    /// Discarded without reply.
    Dropped(RoutingError),
}

pub struct ForwardingStage<R> {
    local: NodeId,
    config: OverlayConfig,
    overlay: u32,
    registry: Arc<CodecRegistry>,
    dispatcher: Arc<Dispatcher>,
    routing: R,
}

impl<R: RoutingTable> ForwardingStage<R> {
    pub fn new(
        local: NodeId,
        config: OverlayConfig,
        registry: Arc<CodecRegistry>,
        dispatcher: Arc<Dispatcher>,
        routing: R,
    ) -> Self {
        let overlay = overlay_hash(&config.overlay_name);
        Self {
            local,
            config,
            overlay,
            registry,
            dispatcher,
            routing,
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn routing(&self) -> &R {
        &self.routing
    }

    /// Handle one message payload received over `from` from neighbour `peer`.
    pub fn on_inbound(&self, from: ConnectionId, peer: &NodeId, bytes: &[u8]) -> RouteOutcome {
        let mut message = match self.registry.decode_message(bytes) {
            Ok(message) => message,
            Err(MessageDecodeError { header, error }) => {
                warn!(connection = %from, %peer, error = %error, "undecodable message");
                return match header {
                    Some(mut header) => {
                        header.via_list.push(Destination::Node(peer.clone()));
                        let reply = Message {
                            header: header.response_header(&self.config),
                            security: SecurityBlock::default(),
                            content: Content::Error(ErrorContent::with_text(
                                error.error_code(),
                                &error.to_string(),
                            )),
                        };
                        self.error_reply(from, reply, RoutingError::Codec(error))
                    }
                    None => RouteOutcome::Dropped(RoutingError::Codec(error)),
                };
            }
        };
        message
            .header
            .via_list
            .push(Destination::Node(peer.clone()));
        trace!(
            connection = %from,
            transaction_id = message.transaction_id(),
            content_type = %message.content_type(),
            ttl = message.header.ttl,
            "inbound message"
        );

        if message.header.overlay != self.overlay {
            let error = RoutingError::OverlayMismatch {
                expected: self.overlay,
                actual: message.header.overlay,
            };
            return self.reject(from, &message, error);
        }

        match self.route(&mut message) {
            Ok(NextHop::Local) => self.deliver(from, &message),
            Ok(NextHop::Connection(next)) => self.forward(from, next, message),
            Err(error) => self.reject(from, &message, error),
        }
    }

    /// Route a message originated by this node. The TTL is left as issued.
    pub fn send_message(&self, message: &mut Message) -> RouteOutcome {
        let next = match self.route(message) {
            Ok(next) => next,
            Err(error) => {
                debug!(transaction_id = message.transaction_id(), error = %error, "cannot route");
                return RouteOutcome::Dropped(error);
            }
        };
        match next {
            NextHop::Local => RouteOutcome::Delivered(self.dispatcher.publish(message)),
            NextHop::Connection(connection) => {
                match message.encode(self.registry.config()) {
                    Ok(bytes) => RouteOutcome::Forwarded { connection, bytes },
                    Err(e) => RouteOutcome::Dropped(e.into()),
                }
            }
        }
    }

    /// Strip this node from the front of the destination list and look up the next hop.
    fn route(&self, message: &mut Message) -> Result<NextHop, RoutingError> {
        let destinations = &mut message.header.destination_list;
        if destinations.first().is_some_and(|d| d.is_node(&self.local)) {
            destinations.remove(0);
        }
        if destinations.is_empty() {
            return Ok(NextHop::Local);
        }
        self.routing
            .next_hop_for(destinations)
            .ok_or(RoutingError::NoRoute)
    }

    fn deliver(&self, from: ConnectionId, message: &Message) -> RouteOutcome {
        let options = &message.header.options;
        if let Some(option) = options.iter().find(|o| o.is_destination_critical()) {
            let error = RoutingError::UnsupportedOption(option.option_type);
            return self.reject(from, message, error);
        }
        RouteOutcome::Delivered(self.dispatcher.publish(message))
    }

    fn forward(
        &self,
        from: ConnectionId,
        next: ConnectionId,
        mut message: Message,
    ) -> RouteOutcome {
        if let Some(option) = message.header.options.iter().find(|o| o.is_forward_critical()) {
            let error = RoutingError::UnsupportedOption(option.option_type);
            return self.reject(from, &message, error);
        }
        if message.header.ttl == 0 {
            return self.reject(from, &message, RoutingError::TtlExceeded);
        }
        message.header.ttl -= 1;
        match message.encode(self.registry.config()) {
            Ok(bytes) => {
                trace!(
                    from = %from,
                    to = %next,
                    transaction_id = message.transaction_id(),
                    ttl = message.header.ttl,
                    "forwarding"
                );
                RouteOutcome::Forwarded {
                    connection: next,
                    bytes,
                }
            }
            Err(e) => self.reject(from, &message, e.into()),
        }
    }

    /// Error response to a request; other messages are dropped.
    fn reject(&self, from: ConnectionId, message: &Message, error: RoutingError) -> RouteOutcome {
        if !message.content_type().is_request() {
            debug!(
                connection = %from,
                transaction_id = message.transaction_id(),
                content_type = %message.content_type(),
                error = %error,
                "dropping message"
            );
            return RouteOutcome::Dropped(error);
        }
        let reply = Message::response(
            message,
            &self.config,
            Content::Error(ErrorContent::with_text(error.error_code(), &error.to_string())),
        );
        self.error_reply(from, reply, error)
    }

    fn error_reply(&self, from: ConnectionId, reply: Message, error: RoutingError) -> RouteOutcome {
        debug!(
            connection = %from,
            transaction_id = reply.transaction_id(),
            error = %error,
            "replying with error"
        );
        match reply.encode(self.registry.config()) {
            Ok(bytes) => RouteOutcome::Rejected {
                connection: from,
                bytes,
                error,
            },
            Err(e) => {
                warn!(error = %e, "cannot encode error response");
                RouteOutcome::Dropped(error)
            }
        }
    }
}

impl<R> fmt::Debug for ForwardingStage<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingStage")
            .field("local", &self.local)
            .field("overlay", &format_args!("{:#010x}", self.overlay))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::message::{ContentType, ForwardingOption, PingRequest};

    struct StaticRoutes(HashMap<NodeId, ConnectionId>);

    impl RoutingTable for StaticRoutes {
        fn next_hop_for(&self, destinations: &[Destination]) -> Option<NextHop> {
            match destinations.first()? {
                Destination::Node(id) => self.0.get(id).copied().map(NextHop::Connection),
                _ => None,
            }
        }
    }

    struct Fixture {
        local: NodeId,
        peer: NodeId,
        remote: NodeId,
        stage: ForwardingStage<StaticRoutes>,
        seen: Arc<Mutex<Vec<Message>>>,
    }

    const FROM: ConnectionId = ConnectionId(1);
    const NEXT: ConnectionId = ConnectionId(7);

    fn fixture() -> Fixture {
        let local = NodeId::random(16);
        let peer = NodeId::random(16);
        let remote = NodeId::random(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let sink = seen.clone();
        dispatcher.subscribe(ContentType::PING_REQ, move |m: &Message| {
            sink.lock().unwrap().push(m.clone());
        });
        let routes = StaticRoutes(HashMap::from([(remote.clone(), NEXT)]));
        let config = OverlayConfig::default();
        let stage = ForwardingStage::new(
            local.clone(),
            config.clone(),
            Arc::new(CodecRegistry::with_builtin(config.codec())),
            Arc::new(dispatcher),
            routes,
        );
        Fixture {
            local,
            peer,
            remote,
            stage,
            seen,
        }
    }

    fn ping_to(dests: Vec<Destination>) -> Message {
        Message::request(
            &OverlayConfig::default(),
            dests,
            Content::PingRequest(PingRequest::default()),
        )
    }

    fn decode(f: &Fixture, bytes: &[u8]) -> Message {
        f.stage.registry().decode_message(bytes).unwrap()
    }

    #[test]
    fn forwarding_strips_one_entry_and_one_ttl() {
        let f = fixture();
        let far = NodeId::random(16);
        let msg = ping_to(vec![
            Destination::Node(f.local.clone()),
            Destination::Node(f.remote.clone()),
            Destination::Node(far.clone()),
        ]);
        let bytes = msg.encode(f.stage.registry().config()).unwrap();

        let outcome = f.stage.on_inbound(FROM, &f.peer, &bytes);
        let RouteOutcome::Forwarded { connection, bytes } = outcome else {
            panic!("expected forward");
        };
        assert_eq!(connection, NEXT);
        let out = decode(&f, &bytes);
        assert_eq!(out.header.destination_list.len(), 2);
        assert_eq!(out.header.ttl, msg.header.ttl - 1);
        assert_eq!(out.header.via_list, vec![Destination::Node(f.peer.clone())]);
        assert_eq!(out.transaction_id(), msg.transaction_id());
    }

    #[test]
    fn final_destination_is_delivered_locally() {
        let f = fixture();
        let msg = ping_to(vec![Destination::Node(f.local.clone())]);
        let bytes = msg.encode(f.stage.registry().config()).unwrap();
        assert_eq!(
            f.stage.on_inbound(FROM, &f.peer, &bytes),
            RouteOutcome::Delivered(1)
        );
        let seen = f.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].header.destination_list.is_empty());
        // TTL only changes when forwarding.
        assert_eq!(seen[0].header.ttl, msg.header.ttl);
    }

    #[test]
    fn zero_ttl_request_gets_error_reply() {
        let f = fixture();
        let mut msg = ping_to(vec![Destination::Node(f.remote.clone())]);
        msg.header.ttl = 0;
        let bytes = msg.encode(f.stage.registry().config()).unwrap();
        let RouteOutcome::Rejected {
            connection,
            bytes,
            error,
        } = f.stage.on_inbound(FROM, &f.peer, &bytes)
        else {
            panic!("expected rejection");
        };
        assert_eq!(connection, FROM);
        assert_eq!(error, RoutingError::TtlExceeded);
        let reply = decode(&f, &bytes);
        assert_eq!(reply.transaction_id(), msg.transaction_id());
        assert_eq!(
            reply.header.destination_list,
            vec![Destination::Node(f.peer.clone())]
        );
        match reply.content {
            Content::Error(e) => assert_eq!(e.code, ErrorCode::TTL_EXCEEDED),
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn zero_ttl_response_is_dropped_silently() {
        let f = fixture();
        let request = ping_to(vec![]);
        let overlay = OverlayConfig::default();
        let mut msg = Message::response(&request, &overlay, Content::LeaveResponse);
        msg.header.destination_list = vec![Destination::Node(f.remote.clone())];
        msg.header.ttl = 0;
        let bytes = msg.encode(f.stage.registry().config()).unwrap();
        assert_eq!(
            f.stage.on_inbound(FROM, &f.peer, &bytes),
            RouteOutcome::Dropped(RoutingError::TtlExceeded)
        );
    }

    #[test]
    fn unknown_destination_has_no_route() {
        let f = fixture();
        let msg = ping_to(vec![Destination::Node(NodeId::random(16))]);
        let bytes = msg.encode(f.stage.registry().config()).unwrap();
        assert!(matches!(
            f.stage.on_inbound(FROM, &f.peer, &bytes),
            RouteOutcome::Rejected {
                error: RoutingError::NoRoute,
                ..
            }
        ));
    }

    #[test]
    fn foreign_overlay_is_rejected() {
        let f = fixture();
        let other = OverlayConfig {
            overlay_name: "elsewhere.example.org".into(),
            ..OverlayConfig::default()
        };
        let msg = Message::request(
            &other,
            vec![Destination::Node(f.local.clone())],
            Content::PingRequest(PingRequest::default()),
        );
        let bytes = msg.encode(&other.codec()).unwrap();
        let RouteOutcome::Rejected { error, bytes, .. } = f.stage.on_inbound(FROM, &f.peer, &bytes)
        else {
            panic!("expected rejection");
        };
        assert!(matches!(error, RoutingError::OverlayMismatch { .. }));
        match decode(&f, &bytes).content {
            Content::Error(e) => assert_eq!(e.code, ErrorCode::INCOMPATIBLE_WITH_OVERLAY),
            other => panic!("unexpected content {other:?}"),
        }
        assert!(f.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn critical_options_are_enforced() {
        let f = fixture();
        let option = |flags| ForwardingOption {
            option_type: 9,
            flags,
            value: Bytes::new(),
        };

        let mut local = ping_to(vec![Destination::Node(f.local.clone())]);
        local.header.options = vec![option(ForwardingOption::DESTINATION_CRITICAL)];
        let bytes = local.encode(f.stage.registry().config()).unwrap();
        assert!(matches!(
            f.stage.on_inbound(FROM, &f.peer, &bytes),
            RouteOutcome::Rejected {
                error: RoutingError::UnsupportedOption(9),
                ..
            }
        ));

        // Forward-critical does not matter at the destination.
        local.header.options = vec![option(ForwardingOption::FORWARD_CRITICAL)];
        let bytes = local.encode(f.stage.registry().config()).unwrap();
        assert_eq!(
            f.stage.on_inbound(FROM, &f.peer, &bytes),
            RouteOutcome::Delivered(1)
        );

        let mut transit = ping_to(vec![Destination::Node(f.remote.clone())]);
        transit.header.options = vec![option(ForwardingOption::FORWARD_CRITICAL)];
        let bytes = transit.encode(f.stage.registry().config()).unwrap();
        assert!(matches!(
            f.stage.on_inbound(FROM, &f.peer, &bytes),
            RouteOutcome::Rejected {
                error: RoutingError::UnsupportedOption(9),
                ..
            }
        ));
    }

    #[test]
    fn malformed_message_with_header_gets_invalid_message() {
        let f = fixture();
        let msg = Message::request(
            &OverlayConfig::default(),
            vec![Destination::Node(f.local.clone())],
            Content::Opaque {
                content_type: ContentType::STORE_REQ,
                body: Bytes::from_static(b"unregistered"),
            },
        );
        let bytes = msg.encode(f.stage.registry().config()).unwrap();
        let RouteOutcome::Rejected { bytes, error, .. } = f.stage.on_inbound(FROM, &f.peer, &bytes)
        else {
            panic!("expected rejection");
        };
        assert_eq!(error, RoutingError::Codec(CodecError::UnsupportedType(7)));
        let reply = decode(&f, &bytes);
        assert_eq!(reply.transaction_id(), msg.transaction_id());
        match reply.content {
            Content::Error(e) => assert_eq!(e.code, ErrorCode::INVALID_MESSAGE),
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn garbage_is_dropped() {
        let f = fixture();
        assert!(matches!(
            f.stage.on_inbound(FROM, &f.peer, &[1, 2, 3]),
            RouteOutcome::Dropped(RoutingError::Codec(CodecError::Truncated { .. }))
        ));
    }

    #[test]
    fn outbound_keeps_ttl() {
        let f = fixture();
        let mut msg = ping_to(vec![Destination::Node(f.remote.clone())]);
        let RouteOutcome::Forwarded { connection, bytes } = f.stage.send_message(&mut msg) else {
            panic!("expected forward");
        };
        assert_eq!(connection, NEXT);
        assert_eq!(decode(&f, &bytes).header.ttl, OverlayConfig::default().initial_ttl);

        let mut to_self = ping_to(vec![Destination::Node(f.local.clone())]);
        assert_eq!(f.stage.send_message(&mut to_self), RouteOutcome::Delivered(1));
    }
}
