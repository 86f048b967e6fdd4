//! RELOAD overlay transport core.
//! Host-driven: no I/O; the host passes bytes and clock readings in and performs the
//! returned actions.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod forwarding;
pub mod frame;
pub mod identity;
pub mod link;
pub mod message;
pub mod registry;
pub mod security;
pub mod transaction;

pub use codec::{CodecError, LengthWidth, WireObject, WireReader, WireWriter};
pub use config::{CodecConfig, ConfigError, LinkType, OverlayConfig};
pub use dispatch::{DispatchStats, Dispatcher, MessageHandler};
pub use forwarding::{
    ConnectionId, ForwardingStage, NextHop, RouteOutcome, RoutingError, RoutingTable,
};
pub use frame::{Frame, FrameError};
pub use identity::{overlay_hash, NodeId};
pub use link::{
    completion, Completion, CompletionHandle, LinkAction, LinkConfig, LinkEngine, LinkError,
    LinkStats, Outbound,
};
pub use message::{
    Content, ContentType, Destination, ErrorCode, ErrorContent, Header, Message, PROTOCOL_VERSION,
};
pub use registry::{CodecRegistry, MessageDecodeError};
pub use security::SecurityBlock;
pub use transaction::{ResponseHandle, TransactionError, TransactionTable};
