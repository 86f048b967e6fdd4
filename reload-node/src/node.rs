//! A running overlay node: registry, dispatcher, forwarding stage and neighbour links, plus
//! the services the daemon provides itself (ping responder, keepalive, request expiry).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use reload_core::message::{PingRequest, PingResponse};
use reload_core::{
    CodecRegistry, ConnectionId, Content, ContentType, Destination, Dispatcher, ForwardingStage,
    LinkConfig, Message, NodeId, OverlayConfig, ResponseHandle, RouteOutcome, TransactionError,
    TransactionTable,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::link::{now, spawn_link, Inbound, LinkHandle};
use crate::transport::NeighborTable;

const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct Node {
    local: NodeId,
    config: OverlayConfig,
    link_config: LinkConfig,
    stage: ForwardingStage<Arc<NeighborTable>>,
    neighbors: Arc<NeighborTable>,
    transactions: Arc<TransactionTable>,
    inbound: mpsc::UnboundedSender<Inbound>,
    next_connection: AtomicU64,
    stop: watch::Sender<bool>,
}

impl Node {
    /// Build the node and spawn its forwarding worker and built-in services. Must be called
    /// inside a tokio runtime.
    pub fn start(
        local: NodeId,
        config: OverlayConfig,
        link_config: LinkConfig,
        request_timeout: Duration,
    ) -> Arc<Node> {
        let neighbors = Arc::new(NeighborTable::new(local.clone()));
        let transactions = Arc::new(TransactionTable::new(request_timeout));
        let registry = Arc::new(CodecRegistry::with_builtin(config.codec()));

        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe(ContentType::PING_REQ, ping_tx);
        for code in [ContentType::PING_ANS, ContentType::LEAVE_ANS, ContentType::ERROR] {
            dispatcher.subscribe_shared(code, transactions.clone());
        }

        let stage = ForwardingStage::new(
            local.clone(),
            config.clone(),
            registry,
            Arc::new(dispatcher),
            neighbors.clone(),
        );
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let node = Arc::new(Node {
            local,
            config,
            link_config,
            stage,
            neighbors,
            transactions,
            inbound,
            next_connection: AtomicU64::new(1),
            stop: watch::Sender::new(false),
        });
        tokio::spawn(run_forwarding(node.clone(), inbound_rx));
        tokio::spawn(run_ping_responder(node.clone(), ping_rx));
        tokio::spawn(run_expiry(node.clone()));
        node
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Run a link over an established, handshaken stream and route through it.
    pub fn attach<S>(self: &Arc<Self>, stream: S, peer: NodeId) -> LinkHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let inbound = self.inbound.clone();
        let (link, task) = spawn_link(stream, connection, peer, self.link_config, inbound);
        self.neighbors.insert(link.clone());
        let node = self.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(stats) => debug!(%connection, ?stats, "link finished"),
                Err(e) => warn!(%connection, error = %e, "link task failed"),
            }
            node.neighbors.remove(connection);
        });
        link
    }

    /// Send a request originated here. The handle resolves with the response, an error
    /// response, or the failure that kept the request from leaving.
    pub fn request(&self, mut message: Message) -> ResponseHandle {
        let handle = self.transactions.issue(&mut message, now());
        let transaction_id = handle.transaction_id();
        match self.stage.send_message(&mut message) {
            RouteOutcome::Forwarded { connection, bytes } => {
                self.transmit(connection, bytes, Some(transaction_id))
            }
            RouteOutcome::Delivered(_) => {}
            RouteOutcome::Dropped(error) | RouteOutcome::Rejected { error, .. } => {
                self.transactions.fail(transaction_id, error.into());
            }
        }
        handle
    }

    /// Send a response or other message that expects no answer.
    pub fn send(&self, mut message: Message) {
        match self.stage.send_message(&mut message) {
            RouteOutcome::Forwarded { connection, bytes } => self.transmit(connection, bytes, None),
            RouteOutcome::Delivered(_) => {}
            RouteOutcome::Dropped(error) | RouteOutcome::Rejected { error, .. } => {
                let transaction_id = message.transaction_id();
                warn!(transaction_id, error = %error, "message not sent");
            }
        }
    }

    /// Ping `peer` and return the round-trip time of the exchange.
    pub async fn ping(&self, peer: NodeId) -> anyhow::Result<Duration> {
        let started = tokio::time::Instant::now();
        let request = Message::request(
            &self.config,
            vec![Destination::Node(peer)],
            Content::PingRequest(PingRequest::default()),
        );
        let reply = self.request(request).await?;
        match reply.content {
            Content::PingResponse(_) => Ok(started.elapsed()),
            Content::Error(e) => anyhow::bail!(
                "ping answered with error {}: {}",
                e.code.0,
                e.text().unwrap_or("")
            ),
            other => anyhow::bail!("unexpected ping answer {}", other.content_type()),
        }
    }

    fn transmit(&self, connection: ConnectionId, bytes: Bytes, transaction_id: Option<u64>) {
        let Some(link) = self.neighbors.get(connection) else {
            debug!(%connection, "link gone before send");
            if let Some(id) = transaction_id {
                self.transactions
                    .fail(id, TransactionError::Link(reload_core::LinkError::Closed));
            }
            return;
        };
        let done = link.send(bytes);
        if let Some(id) = transaction_id {
            let transactions = self.transactions.clone();
            tokio::spawn(async move {
                if let Err(e) = done.await {
                    transactions.fail(id, e.into());
                }
            });
        }
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stop = self.stop.subscribe();
        async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        }
    }

    /// Stop the background services, fail pending requests and close every link.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        self.transactions.cancel_all();
        for link in self.neighbors.links() {
            link.close();
        }
    }
}

/// Decode, route and dispatch everything the links deliver.
async fn run_forwarding(node: Arc<Node>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    let stopped = node.stopped();
    tokio::pin!(stopped);
    loop {
        let Inbound {
            connection,
            peer,
            payload,
        } = tokio::select! {
            _ = &mut stopped => break,
            next = inbound.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        match node.stage.on_inbound(connection, &peer, &payload) {
            RouteOutcome::Forwarded { connection, bytes }
            | RouteOutcome::Rejected {
                connection, bytes, ..
            } => node.transmit(connection, bytes, None),
            RouteOutcome::Delivered(_) | RouteOutcome::Dropped(_) => {}
        }
    }
}

async fn run_ping_responder(node: Arc<Node>, mut requests: mpsc::UnboundedReceiver<Message>) {
    let stopped = node.stopped();
    tokio::pin!(stopped);
    loop {
        let request = tokio::select! {
            _ = &mut stopped => break,
            next = requests.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };
        let answer = Message::response(
            &request,
            &node.config,
            Content::PingResponse(PingResponse {
                response_id: rand::random(),
                time: unix_millis(),
            }),
        );
        node.send(answer);
    }
}

async fn run_expiry(node: Arc<Node>) {
    let stopped = node.stopped();
    tokio::pin!(stopped);
    let mut ticker = tokio::time::interval(EXPIRY_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {}
        }
        let expired = node.transactions.expire(now());
        if expired > 0 {
            debug!(expired, "requests timed out");
        }
    }
}

/// Ping every neighbour each `interval` until shutdown.
pub async fn run_keepalive(node: Arc<Node>, interval: Duration) {
    let stopped = node.stopped();
    tokio::pin!(stopped);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {}
        }
        for link in node.neighbors.links() {
            let node = node.clone();
            let peer = link.peer().clone();
            tokio::spawn(async move {
                match node.ping(peer.clone()).await {
                    Ok(rtt) => info!(%peer, rtt_ms = rtt.as_millis() as u64, "ping"),
                    Err(e) => warn!(%peer, error = %e, "ping failed"),
                }
            });
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
