//! Link transport: TCP server (incoming), TCP client (outbound to configured peers), handshake,
//! and the neighbour table the forwarding stage routes with.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use reload_core::{ConnectionId, Destination, NextHop, NodeId, RoutingTable, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::link::LinkHandle;
use crate::node::Node;

/// Exchange `version u8 | node_id_length u8 | node_id` in both directions and return the
/// peer's node id.
pub async fn handshake<S>(stream: &mut S, local: &NodeId) -> std::io::Result<NodeId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&handshake_bytes(local)).await?;
    stream.flush().await?;

    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported protocol version {}", head[0]),
        ));
    }
    if usize::from(head[1]) != local.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("peer node id is {} bytes, overlay uses {}", head[1], local.len()),
        ));
    }
    let mut id = vec![0u8; local.len()];
    stream.read_exact(&mut id).await?;
    Ok(NodeId::from_bytes(id))
}

fn handshake_bytes(local: &NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + local.len());
    out.push(PROTOCOL_VERSION);
    out.push(local.len() as u8);
    out.extend_from_slice(local.as_bytes());
    out
}

/// Directly connected neighbours. Routes only to destinations that are neighbours.
#[derive(Debug)]
pub struct NeighborTable {
    local: NodeId,
    links: RwLock<HashMap<ConnectionId, LinkHandle>>,
    by_node: RwLock<HashMap<NodeId, ConnectionId>>,
}

impl NeighborTable {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            links: RwLock::new(HashMap::new()),
            by_node: RwLock::new(HashMap::new()),
        }
    }

    /// Register a link. A newer link to the same node replaces the older one for routing.
    pub fn insert(&self, link: LinkHandle) {
        let connection = link.connection();
        self.by_node
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(link.peer().clone(), connection);
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection, link);
    }

    pub fn remove(&self, connection: ConnectionId) -> Option<LinkHandle> {
        let link = self
            .links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection)?;
        let mut by_node = self.by_node.write().unwrap_or_else(PoisonError::into_inner);
        if by_node.get(link.peer()) == Some(&connection) {
            by_node.remove(link.peer());
        }
        Some(link)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<LinkHandle> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection)
            .cloned()
    }

    pub fn links(&self) -> Vec<LinkHandle> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RoutingTable for NeighborTable {
    fn next_hop_for(&self, destinations: &[Destination]) -> Option<NextHop> {
        match destinations.first()? {
            Destination::Node(id) if *id == self.local => Some(NextHop::Local),
            Destination::Node(id) => self
                .by_node
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(id)
                .copied()
                .map(NextHop::Connection),
            _ => None,
        }
    }
}

/// Accept incoming links until the listener fails.
pub async fn run_listener(listener: TcpListener, node: Arc<Node>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = establish(stream, addr, &node).await {
                        warn!(%addr, error = %e, "incoming link rejected");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Dial `addr` and bring up a link.
pub async fn connect(addr: SocketAddr, node: Arc<Node>) -> std::io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    establish(stream, addr, &node).await
}

async fn establish(
    mut stream: TcpStream,
    addr: SocketAddr,
    node: &Arc<Node>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let peer = handshake(&mut stream, node.local()).await?;
    if peer == *node.local() {
        debug!(%addr, "refusing link to self");
        return Ok(());
    }
    info!(%addr, %peer, "handshake complete");
    node.attach(stream, peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reload_core::LinkConfig;
    use tokio::sync::mpsc;

    use crate::link::spawn_link;

    #[tokio::test]
    async fn handshake_exchanges_ids() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let a_id = NodeId::random(16);
        let b_id = NodeId::random(16);
        let (ra, rb) = tokio::join!(handshake(&mut a, &a_id), handshake(&mut b, &b_id));
        assert_eq!(ra.unwrap(), b_id);
        assert_eq!(rb.unwrap(), a_id);
    }

    #[tokio::test]
    async fn handshake_rejects_other_version() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let id = NodeId::random(16);
        let mut bogus = handshake_bytes(&NodeId::random(16));
        bogus[0] = 9;
        let (res, _) = tokio::join!(handshake(&mut a, &id), async {
            b.write_all(&bogus).await.unwrap();
        });
        assert_eq!(res.unwrap_err().kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn handshake_rejects_other_id_length() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let id = NodeId::random(16);
        let other = handshake_bytes(&NodeId::random(20));
        let (res, _) = tokio::join!(handshake(&mut a, &id), async {
            b.write_all(&other).await.unwrap();
        });
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn routes_to_neighbours_only() {
        let local = NodeId::random(16);
        let peer = NodeId::random(16);
        let table = NeighborTable::new(local.clone());
        let (stream, _far) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (link, _task) =
            spawn_link(stream, ConnectionId(3), peer.clone(), LinkConfig::default(), tx);
        table.insert(link);

        assert_eq!(
            table.next_hop_for(&[Destination::Node(peer.clone())]),
            Some(NextHop::Connection(ConnectionId(3)))
        );
        assert_eq!(
            table.next_hop_for(&[Destination::Node(local)]),
            Some(NextHop::Local)
        );
        assert_eq!(table.next_hop_for(&[Destination::Node(NodeId::random(16))]), None);
        assert_eq!(table.next_hop_for(&[Destination::Compressed(1)]), None);
        assert_eq!(table.next_hop_for(&[]), None);

        assert!(table.remove(ConnectionId(3)).is_some());
        assert_eq!(table.next_hop_for(&[Destination::Node(peer)]), None);
        assert!(table.is_empty());
    }
}
