//! Link actor: one task per connection owns its `LinkEngine`.
//!
//! Sends, inbound bytes and retransmission wake-ups all arrive on that task, so the
//! outstanding-transmission table is only ever touched from one place. Delivered payloads go
//! to the forwarding worker over `inbound`. Frames are written by a separate writer task fed
//! over a queue, so a peer that stops reading never stalls our reads or timers.

use bytes::{Buf, Bytes, BytesMut};
use reload_core::{
    completion, Completion, CompletionHandle, ConnectionId, Frame, LinkAction, LinkConfig,
    LinkEngine, LinkStats, NodeId,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CAPACITY: usize = 16 * 1024;

/// Engine clock. Taken from tokio so paused-time tests drive retransmissions.
pub fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// A message payload delivered by a link.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub connection: ConnectionId,
    pub peer: NodeId,
    pub payload: Bytes,
}

enum Command {
    Send { payload: Bytes, completion: Completion },
    Close,
}

/// Cloneable handle to a running link actor. The link closes when every handle is dropped.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    connection: ConnectionId,
    peer: NodeId,
    tx: mpsc::UnboundedSender<Command>,
}

impl LinkHandle {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Queue `payload` for reliable delivery. Resolves with the RTT once acked; a link that
    /// is already gone resolves with `Cancelled`.
    pub fn send(&self, payload: Bytes) -> CompletionHandle {
        let (completion, handle) = completion();
        // A closed actor drops the command and with it the completion.
        let _ = self.tx.send(Command::Send {
            payload,
            completion,
        });
        handle
    }

    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the actor for an established, handshaken stream.
pub fn spawn_link<S>(
    stream: S,
    connection: ConnectionId,
    peer: NodeId,
    config: LinkConfig,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> (LinkHandle, JoinHandle<LinkStats>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = LinkHandle {
        connection,
        peer: peer.clone(),
        tx,
    };
    let actor = LinkActor {
        connection,
        peer,
        engine: LinkEngine::new(config),
        inbound,
    };
    let task = tokio::spawn(actor.run(stream, rx));
    (handle, task)
}

struct LinkActor {
    connection: ConnectionId,
    peer: NodeId,
    engine: LinkEngine,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl LinkActor {
    async fn run<S>(
        mut self,
        stream: S,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> LinkStats
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (frames, queued) = mpsc::unbounded_channel();
        let mut write_task = tokio::spawn(write_frames(writer, queued, self.connection));
        let mut buf = BytesMut::with_capacity(READ_CAPACITY);
        info!(connection = %self.connection, peer = %self.peer, "link up");
        loop {
            let deadline = self.engine.next_deadline().map(tokio::time::Instant::from_std);
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let actions = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Send { payload, completion }) => {
                        match self.engine.send_with(payload, completion, now()) {
                            Some(out) => vec![LinkAction::Transmit(out.frame)],
                            None => Vec::new(),
                        }
                    }
                    Some(Command::Close) | None => break,
                },
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!(connection = %self.connection, "peer closed link");
                        break;
                    }
                    Ok(_) => match self.drain_frames(&mut buf) {
                        Some(actions) => actions,
                        None => break,
                    },
                    Err(e) => {
                        warn!(connection = %self.connection, error = %e, "link read failed");
                        break;
                    }
                },
                _ = timer => self.engine.poll_timeouts(now()),
                _ = &mut write_task => break,
            };
            if !self.perform(&frames, actions) {
                break;
            }
        }
        write_task.abort();
        self.engine.shutdown();
        let stats = self.engine.stats();
        info!(connection = %self.connection, peer = %self.peer, ?stats, "link down");
        stats
    }

    /// Feed every complete frame in `buf` to the engine. `None` when the stream can no longer
    /// be delimited.
    fn drain_frames(&mut self, buf: &mut BytesMut) -> Option<Vec<LinkAction>> {
        let max_payload = self.engine.config().max_payload;
        let mut actions = Vec::new();
        loop {
            match Frame::decode_prefix_bounded(buf, max_payload) {
                Ok(Some((frame, used))) => {
                    buf.advance(used);
                    actions.extend(self.engine.on_frame(frame, now()));
                }
                Ok(None) => return Some(actions),
                Err(e) => {
                    warn!(
                        connection = %self.connection,
                        error = %e,
                        "undecodable frame on stream"
                    );
                    return None;
                }
            }
        }
    }

    /// Queue frames for the writer and hand payloads to the forwarding worker. False once the
    /// writer is gone.
    fn perform(&self, frames: &mpsc::UnboundedSender<Bytes>, actions: Vec<LinkAction>) -> bool {
        for action in actions {
            match action {
                LinkAction::Transmit(frame) => {
                    if frames.send(frame).is_err() {
                        return false;
                    }
                }
                LinkAction::Deliver { sequence, payload } => {
                    let delivered = self.inbound.send(Inbound {
                        connection: self.connection,
                        peer: self.peer.clone(),
                        payload,
                    });
                    if delivered.is_err() {
                        debug!(connection = %self.connection, sequence, "forwarding worker gone");
                    }
                }
            }
        }
        true
    }
}

/// Writer half of a link: writes queued frames in order, flushing whenever the queue is drained.
async fn write_frames<W>(
    mut writer: WriteHalf<W>,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
    connection: ConnectionId,
) where
    W: AsyncWrite,
{
    while let Some(first) = queued.recv().await {
        let mut next = Some(first);
        while let Some(frame) = next {
            if let Err(e) = writer.write_all(&frame).await {
                warn!(%connection, error = %e, "link write failed");
                return;
            }
            next = queued.try_recv().ok();
        }
        if let Err(e) = writer.flush().await {
            warn!(%connection, error = %e, "link flush failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reload_core::LinkError;
    use std::time::Duration;

    type End = (LinkHandle, JoinHandle<LinkStats>, mpsc::UnboundedReceiver<Inbound>);

    fn pair() -> (End, End) {
        pair_over(64 * 1024)
    }

    fn pair_over(capacity: usize) -> (End, End) {
        let (a, b) = tokio::io::duplex(capacity);
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a_id = NodeId::random(16);
        let b_id = NodeId::random(16);
        let (ha, ta) = spawn_link(a, ConnectionId(1), b_id, LinkConfig::default(), a_tx);
        let (hb, tb) = spawn_link(b, ConnectionId(2), a_id, LinkConfig::default(), b_tx);
        ((ha, ta, a_rx), (hb, tb, b_rx))
    }

    #[tokio::test]
    async fn payload_crosses_and_is_acked() {
        let ((a, _ta, _a_rx), (_b, _tb, mut b_rx)) = pair();
        let sent = a.send(Bytes::from_static(b"TESTO DI PROVA"));
        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.connection, ConnectionId(2));
        assert_eq!(&got.payload[..], b"TESTO DI PROVA");
        assert!(sent.await.is_ok());
    }

    #[tokio::test]
    async fn many_sends_all_resolve() {
        let ((a, _ta, _a_rx), (_b, _tb, mut b_rx)) = pair();
        let handles: Vec<_> = (0..50)
            .map(|i| a.send(Bytes::from(format!("m{i}"))))
            .collect();
        for _ in 0..50 {
            b_rx.recv().await.unwrap();
        }
        for h in handles {
            assert!(h.await.is_ok());
        }
    }

    #[tokio::test]
    async fn both_directions_saturated_still_complete() {
        let ((a, _ta, mut a_rx), (b, _tb, mut b_rx)) = pair_over(1024);
        let payload = Bytes::from(vec![0x5a; 8 * 1024]);
        let mut sends = Vec::new();
        for _ in 0..8 {
            sends.push(a.send(payload.clone()));
            sends.push(b.send(payload.clone()));
        }
        let exchange = async {
            for _ in 0..8 {
                assert_eq!(a_rx.recv().await.unwrap().payload.len(), 8 * 1024);
                assert_eq!(b_rx.recv().await.unwrap().payload.len(), 8 * 1024);
            }
            for sent in sends {
                assert!(sent.await.is_ok());
            }
        };
        tokio::time::timeout(Duration::from_secs(10), exchange)
            .await
            .expect("link stalled under two-way load");
        // Retransmissions, if any, were not delivered a second time.
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_declared_frame_closes_link() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = LinkConfig {
            max_payload: 5000,
            ..LinkConfig::default()
        };
        let (_link, task) = spawn_link(near, ConnectionId(6), NodeId::random(16), config, tx);
        // Data frame header declaring a 1 MiB payload, none of which follows.
        far.write_all(&[128, 0, 0, 0, 1, 0x10, 0, 0]).await.unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("link kept waiting for the payload")
            .unwrap();
        assert_eq!(stats.delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_without_closing() {
        let (near, _far) = tokio::io::duplex(64 * 1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = LinkConfig {
            initial_rto: Duration::from_millis(100),
            max_retransmits: 2,
            ..LinkConfig::default()
        };
        let (link, task) = spawn_link(near, ConnectionId(9), NodeId::random(16), config, tx);
        let result = link.send(Bytes::from_static(b"into the void")).await;
        assert!(matches!(
            result,
            Err(LinkError::Timeout { attempts: 3, .. })
        ));
        assert!(!link.is_closed());

        link.close();
        let stats = task.await.unwrap();
        assert_eq!(stats.retransmitted, 2);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn closing_fails_outstanding_sends() {
        let (near, _far) = tokio::io::duplex(64 * 1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (link, task) =
            spawn_link(near, ConnectionId(3), NodeId::random(16), LinkConfig::default(), tx);
        let pending = link.send(Bytes::from_static(b"never acked"));
        tokio::task::yield_now().await;
        link.close();
        assert_eq!(pending.await, Err(LinkError::Closed));
        task.await.unwrap();
        assert!(matches!(
            link.send(Bytes::from_static(b"late")).await,
            Err(LinkError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn eof_closes_link() {
        let (near, far) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_link, task) =
            spawn_link(near, ConnectionId(4), NodeId::random(16), LinkConfig::default(), tx);
        drop(far);
        let stats = task.await.unwrap();
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn garbage_on_stream_closes_link() {
        let (near, mut far) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_link, task) =
            spawn_link(near, ConnectionId(5), NodeId::random(16), LinkConfig::default(), tx);
        far.write_all(&[0x42, 0, 0, 0, 1]).await.unwrap();
        task.await.unwrap();
    }
}
