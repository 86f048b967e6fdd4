//! Link reliability engine: one instance per connection.
//!
//! The engine owns the outstanding-transmission table and never does I/O. The host feeds it
//! sends, inbound frames and clock readings, and performs the returned actions. All calls for
//! one link must come from the same task; the table has no internal locking.
//!
//! Retransmission timeout follows RFC 6298: `RTO = SRTT + 4 * RTTVAR`, clamped to
//! `[min_rto, max_rto]`, doubling per retransmission. Samples from retransmitted frames are
//! not fed to the estimator (Karn's rule).
//!
//! Inbound Data frames are delivered once. A retransmission of an already delivered sequence
//! (our Ack was lost) is acked again but not delivered.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::frame::{Frame, MAX_FRAME_PAYLOAD};

pub const DEFAULT_INITIAL_RTO: Duration = Duration::from_millis(500);
pub const DEFAULT_MIN_RTO: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_RTO: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RETRANSMITS: u32 = 5;
/// Out-of-order sequences remembered above the contiguous receive point.
pub const RECEIVE_WINDOW: usize = 4096;

/// Timing parameters of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// RTO before the first RTT sample.
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Retransmissions after the first send before the transmission fails.
    pub max_retransmits: u32,
    /// Largest Data payload sent or accepted; capped at [`MAX_FRAME_PAYLOAD`].
    pub max_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            initial_rto: DEFAULT_INITIAL_RTO,
            min_rto: DEFAULT_MIN_RTO,
            max_rto: DEFAULT_MAX_RTO,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }
}

impl LinkConfig {
    fn payload_limit(&self) -> usize {
        self.max_payload.min(MAX_FRAME_PAYLOAD)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("no ack for sequence {sequence} after {attempts} transmissions")]
    Timeout { sequence: u32, attempts: u32 },
    #[error("transmission cancelled")]
    Cancelled,
    #[error("link closed")]
    Closed,
    #[error("payload of {len} bytes exceeds frame limit {max}")]
    Oversized { len: usize, max: usize },
    #[error("sequence numbers exhausted")]
    SequenceExhausted,
}

impl LinkError {
    /// Whether resending the same payload may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::Timeout { .. })
    }
}

/// RTO estimator (RFC 6298 section 2).
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    config: LinkConfig,
    /// (SRTT, RTTVAR) once the first sample has arrived.
    estimate: Option<(Duration, Duration)>,
    rto: Duration,
}

impl RetransmitTimer {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            estimate: None,
            rto: config.initial_rto.clamp(config.min_rto, config.max_rto),
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.estimate.map(|(srtt, _)| srtt)
    }

    /// First sample: SRTT = R, RTTVAR = R/2.
    /// Later: RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|, SRTT = 7/8 SRTT + 1/8 R.
    pub fn record_sample(&mut self, sample: Duration) {
        let (srtt, rttvar) = match self.estimate {
            None => (sample, sample / 2),
            Some((srtt, rttvar)) => {
                let diff = sample.abs_diff(srtt);
                (srtt * 7 / 8 + sample / 8, rttvar * 3 / 4 + diff / 4)
            }
        };
        self.estimate = Some((srtt, rttvar));
        self.rto = (srtt + rttvar * 4).clamp(self.config.min_rto, self.config.max_rto);
    }

    /// Double the RTO after a retransmission timeout, capped at `max_rto`.
    pub fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(self.config.max_rto);
    }
}

type CompletionResult = Result<Duration, LinkError>;

/// Sending half of a transmission's completion: resolved exactly once.
#[derive(Debug)]
pub struct Completion(oneshot::Sender<CompletionResult>);

impl Completion {
    fn resolve(self, result: CompletionResult) {
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.0.send(result);
    }
}

/// Resolves with the measured round-trip time once the frame is acknowledged, or with the
/// failure that ended the transmission. Dropping the engine without a verdict yields
/// `Cancelled`.
#[derive(Debug)]
pub struct CompletionHandle(oneshot::Receiver<CompletionResult>);

impl CompletionHandle {
    /// Non-blocking check; `None` while the transmission is still outstanding.
    pub fn try_result(&mut self) -> Option<CompletionResult> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(LinkError::Cancelled)),
        }
    }
}

impl Future for CompletionHandle {
    type Output = CompletionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(LinkError::Cancelled)))
    }
}

/// A linked completion pair.
pub fn completion() -> (Completion, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    (Completion(tx), CompletionHandle(rx))
}

/// Bookkeeping for one unacknowledged Data frame.
#[derive(Debug)]
struct Transmission {
    created_at: Instant,
    deadline: Instant,
    timeout: Duration,
    attempts: u32,
    frame: Bytes,
    completion: Completion,
}

/// What the host must do after feeding the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Write these frame bytes to the link.
    Transmit(Bytes),
    /// Hand this payload up to message decoding.
    Deliver { sequence: u32, payload: Bytes },
}

/// A freshly assigned Data frame ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub sequence: u32,
    pub frame: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub retransmitted: u64,
    pub acked: u64,
    pub duplicate_acks: u64,
    pub timeouts: u64,
    pub delivered: u64,
    pub duplicate_data: u64,
}

/// Inbound sequences already delivered: everything up to `through`, plus the ones above it.
#[derive(Debug, Default)]
struct ReceiveWindow {
    through: u32,
    above: BTreeSet<u32>,
}

impl ReceiveWindow {
    /// Record `sequence`; false when it was already seen.
    fn accept(&mut self, sequence: u32) -> bool {
        if sequence <= self.through || !self.above.insert(sequence) {
            return false;
        }
        if self.above.len() > RECEIVE_WINDOW {
            // Give up on the oldest gap rather than grow without bound.
            if let Some(oldest) = self.above.pop_first() {
                self.through = oldest;
            }
        }
        while self.through < u32::MAX && self.above.remove(&(self.through + 1)) {
            self.through += 1;
        }
        true
    }
}

pub struct LinkEngine {
    config: LinkConfig,
    timer: RetransmitTimer,
    next_sequence: u32,
    outstanding: BTreeMap<u32, Transmission>,
    received: ReceiveWindow,
    stats: LinkStats,
    closed: bool,
}

impl LinkEngine {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            timer: RetransmitTimer::new(config),
            next_sequence: 1,
            outstanding: BTreeMap::new(),
            received: ReceiveWindow::default(),
            stats: LinkStats::default(),
            closed: false,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn rto(&self) -> Duration {
        self.timer.rto()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, sequence: u32) -> bool {
        self.outstanding.contains_key(&sequence)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Assign the next sequence number to `payload` and start tracking it. Returns the handle
    /// immediately; the frame must be transmitted by the host.
    pub fn send(
        &mut self,
        payload: Bytes,
        now: Instant,
    ) -> Result<(CompletionHandle, Outbound), LinkError> {
        let (sequence, frame) = self.prepare(payload)?;
        let (tx, handle) = completion();
        Ok((handle, self.track(sequence, frame, tx, now)))
    }

    /// Like [`send`](Self::send) with a completion created by the caller. On failure the
    /// completion is resolved with the error and `None` is returned.
    pub fn send_with(
        &mut self,
        payload: Bytes,
        completion: Completion,
        now: Instant,
    ) -> Option<Outbound> {
        match self.prepare(payload) {
            Ok((sequence, frame)) => Some(self.track(sequence, frame, completion, now)),
            Err(e) => {
                debug!(error = %e, "send refused");
                completion.resolve(Err(e));
                None
            }
        }
    }

    fn prepare(&mut self, payload: Bytes) -> Result<(u32, Bytes), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        let len = payload.len();
        let max = self.config.payload_limit();
        if len > max {
            return Err(LinkError::Oversized { len, max });
        }
        let sequence = self.next_sequence;
        self.next_sequence = sequence
            .checked_add(1)
            .ok_or(LinkError::SequenceExhausted)?;
        let frame = Frame::Data { sequence, payload }
            .encode()
            .map_err(|_| LinkError::Oversized { len, max })?;
        Ok((sequence, frame))
    }

    fn track(
        &mut self,
        sequence: u32,
        frame: Bytes,
        completion: Completion,
        now: Instant,
    ) -> Outbound {
        let timeout = self.timer.rto();
        self.outstanding.insert(
            sequence,
            Transmission {
                created_at: now,
                deadline: now + timeout,
                timeout,
                attempts: 1,
                frame: frame.clone(),
                completion,
            },
        );
        self.stats.sent += 1;
        trace!(sequence, outstanding = self.outstanding.len(), "data frame queued");
        Outbound { sequence, frame }
    }

    /// Process one decoded inbound frame.
    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Vec<LinkAction> {
        match frame {
            Frame::Data { sequence, payload } => {
                let mut actions = Vec::with_capacity(2);
                if self.received.accept(sequence) {
                    self.stats.delivered += 1;
                    actions.push(LinkAction::Deliver { sequence, payload });
                } else {
                    self.stats.duplicate_data += 1;
                    debug!(sequence, "duplicate data frame, re-acking");
                }
                match (Frame::Ack { sequence }).encode() {
                    Ok(ack) => actions.push(LinkAction::Transmit(ack)),
                    Err(e) => warn!(sequence, error = %e, "ack encode failed"),
                }
                actions
            }
            Frame::Ack { sequence } => {
                self.on_ack(sequence, now);
                Vec::new()
            }
        }
    }

    /// Process one datagram holding exactly one frame. Undecodable or oversized datagrams are
    /// logged and discarded; the link stays up.
    pub fn on_datagram(&mut self, datagram: &[u8], now: Instant) -> Vec<LinkAction> {
        match Frame::decode_bounded(datagram, self.config.payload_limit()) {
            Ok(frame) => self.on_frame(frame, now),
            Err(e) => {
                debug!(len = datagram.len(), error = %e, "discarding undecodable frame");
                Vec::new()
            }
        }
    }

    fn on_ack(&mut self, sequence: u32, now: Instant) {
        let Some(t) = self.outstanding.remove(&sequence) else {
            self.stats.duplicate_acks += 1;
            debug!(sequence, "duplicate or stale ack");
            return;
        };
        let rtt = now.saturating_duration_since(t.created_at);
        if t.attempts == 1 {
            self.timer.record_sample(rtt);
        }
        self.stats.acked += 1;
        trace!(
            sequence,
            rtt_ms = rtt.as_millis() as u64,
            rto_ms = self.timer.rto().as_millis() as u64,
            "acked"
        );
        t.completion.resolve(Ok(rtt));
    }

    /// Retransmit or fail every transmission whose deadline has passed. The shared RTO backs
    /// off at most once per call.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<LinkAction> {
        let due: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        let mut actions = Vec::new();
        for sequence in due {
            let exhausted = match self.outstanding.get(&sequence) {
                Some(t) => t.attempts > self.config.max_retransmits,
                None => continue,
            };
            if exhausted {
                if let Some(t) = self.outstanding.remove(&sequence) {
                    self.stats.timeouts += 1;
                    warn!(sequence, attempts = t.attempts, "transmission timed out");
                    t.completion.resolve(Err(LinkError::Timeout {
                        sequence,
                        attempts: t.attempts,
                    }));
                }
                continue;
            }
            if let Some(t) = self.outstanding.get_mut(&sequence) {
                t.attempts += 1;
                t.timeout = (t.timeout * 2).min(self.config.max_rto);
                t.deadline = now + t.timeout;
                self.stats.retransmitted += 1;
                debug!(
                    sequence,
                    attempt = t.attempts,
                    timeout_ms = t.timeout.as_millis() as u64,
                    "retransmitting"
                );
                actions.push(LinkAction::Transmit(t.frame.clone()));
            }
        }
        if !actions.is_empty() {
            self.timer.back_off();
        }
        actions
    }

    /// Earliest retransmission deadline, if anything is outstanding.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.values().map(|t| t.deadline).min()
    }

    /// Stop tracking `sequence` and fail its handle with `Cancelled`.
    pub fn cancel(&mut self, sequence: u32) -> bool {
        match self.outstanding.remove(&sequence) {
            Some(t) => {
                t.completion.resolve(Err(LinkError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding transmission with `Closed` and refuse further sends.
    pub fn shutdown(&mut self) {
        self.closed = true;
        let outstanding = std::mem::take(&mut self.outstanding);
        if !outstanding.is_empty() {
            debug!(count = outstanding.len(), "failing outstanding transmissions");
        }
        for (_, t) in outstanding {
            t.completion.resolve(Err(LinkError::Closed));
        }
    }
}

impl Drop for LinkEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LinkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkEngine")
            .field("next_sequence", &self.next_sequence)
            .field("outstanding", &self.outstanding.len())
            .field("rto", &self.timer.rto())
            .field("closed", &self.closed)
            .finish()
    }
}
