//! Overlay parameters consumed by the core. The core never owns or parses the overlay
//! configuration document; the host supplies these read-only values at construction time.

use serde::{Deserialize, Serialize};

/// Shortest node id the codecs accept (RFC 6940: 128 bits).
pub const MIN_NODE_ID_LENGTH: usize = 16;
/// Longest node id the codecs accept (RFC 6940: 160 bits).
pub const MAX_NODE_ID_LENGTH: usize = 20;

/// Default node id length in bytes.
pub const DEFAULT_NODE_ID_LENGTH: usize = 16;
/// Default upper bound on an encoded message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5000;
/// Default hop budget of freshly originated messages.
pub const DEFAULT_INITIAL_TTL: u8 = 100;

/// Link protocols a node may run its overlay links over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkType {
    Tls,
    Dtls,
}

/// Overlay-wide parameters. Loaded by the host (TOML in the daemon), never mutated by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    pub overlay_name: String,
    pub node_id_length: usize,
    pub max_message_size: usize,
    pub initial_ttl: u8,
    pub configuration_sequence: u16,
    pub link_types: Vec<LinkType>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            overlay_name: "overlay.example.org".to_string(),
            node_id_length: DEFAULT_NODE_ID_LENGTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            initial_ttl: DEFAULT_INITIAL_TTL,
            configuration_sequence: 0,
            link_types: vec![LinkType::Tls],
        }
    }
}

impl OverlayConfig {
    /// Reject values the codecs cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.overlay_name.is_empty() {
            return Err(ConfigError::EmptyOverlayName);
        }
        if !(MIN_NODE_ID_LENGTH..=MAX_NODE_ID_LENGTH).contains(&self.node_id_length) {
            return Err(ConfigError::NodeIdLength(self.node_id_length));
        }
        if self.initial_ttl == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.link_types.is_empty() {
            return Err(ConfigError::NoLinkTypes);
        }
        Ok(())
    }

    /// The subset of parameters the codecs depend on.
    pub fn codec(&self) -> CodecConfig {
        CodecConfig {
            node_id_length: self.node_id_length,
            max_message_size: self.max_message_size,
        }
    }
}

/// Read-only codec parameters. Cheap to copy, so every codec holds its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub node_id_length: usize,
    pub max_message_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        OverlayConfig::default().codec()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("overlay name is empty")]
    EmptyOverlayName,
    #[error("node id length {0} outside 16..=20")]
    NodeIdLength(usize),
    #[error("initial ttl must be non-zero")]
    ZeroTtl,
    #[error("no link types configured")]
    NoLinkTypes,
}
