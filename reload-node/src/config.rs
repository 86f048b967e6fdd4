//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reload_core::{LinkConfig, NodeId, OverlayConfig};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/reload/config.toml or /etc/reload/config.toml.
/// Env overrides: RELOAD_LISTEN_PORT, RELOAD_OVERLAY, RELOAD_NODE_ID.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Link listen port (default 6084).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Hex node id; random when absent.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Neighbours to dial at start-up.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub link: LinkSettings,
    /// How long a request waits for its response (default 15000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Ping every neighbour this often; 0 disables (default 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

/// `[link]` table: retransmission timing in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSettings {
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub max_retransmits: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let d = LinkConfig::default();
        Self {
            initial_rto_ms: d.initial_rto.as_millis() as u64,
            min_rto_ms: d.min_rto.as_millis() as u64,
            max_rto_ms: d.max_rto.as_millis() as u64,
            max_retransmits: d.max_retransmits,
        }
    }
}

impl LinkSettings {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            initial_rto: Duration::from_millis(self.initial_rto_ms),
            min_rto: Duration::from_millis(self.min_rto_ms),
            max_rto: Duration::from_millis(self.max_rto_ms),
            max_retransmits: self.max_retransmits,
            ..LinkConfig::default()
        }
    }
}

fn default_listen_port() -> u16 {
    6084
}
fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            node_id: None,
            peers: Vec::new(),
            overlay: OverlayConfig::default(),
            link: LinkSettings::default(),
            request_timeout_ms: default_request_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Link timing from `[link]`, with frames bounded by the overlay's message size.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            max_payload: self.overlay.max_message_size,
            ..self.link.link_config()
        }
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// Check values the core cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.overlay.validate().context("invalid [overlay]")?;
        if let Some(id) = &self.node_id {
            anyhow::ensure!(
                id.len() == self.overlay.node_id_length,
                "node_id is {} bytes, overlay uses {}",
                id.len(),
                self.overlay.node_id_length
            );
        }
        anyhow::ensure!(
            self.link.min_rto_ms > 0 && self.link.min_rto_ms <= self.link.max_rto_ms,
            "link.min_rto_ms must be in 1..=max_rto_ms"
        );
        Ok(())
    }
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    c.validate()?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("RELOAD_LISTEN_PORT") {
        c.listen_port = s
            .parse()
            .with_context(|| format!("RELOAD_LISTEN_PORT={s}"))?;
    }
    if let Some(s) = var("RELOAD_OVERLAY") {
        c.overlay.overlay_name = s;
    }
    if let Some(s) = var("RELOAD_NODE_ID") {
        c.node_id = Some(NodeId::from_hex(&s).with_context(|| format!("RELOAD_NODE_ID={s}"))?);
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/reload/config.toml"));
    }
    out.push(PathBuf::from("/etc/reload/config.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    for p in config_paths() {
        if p.exists() {
            let s = std::fs::read_to_string(&p)
                .with_context(|| format!("reading {}", p.display()))?;
            let c = parse(&s).with_context(|| format!("parsing {}", p.display()))?;
            return Ok(Some(c));
        }
    }
    Ok(None)
}
