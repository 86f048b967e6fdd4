//! Requester-side correlation: outstanding requests keyed by transaction id.
//!
//! The forwarding stage only delivers; matching a response to the request that caused it
//! happens here. The table subscribes to the dispatcher for response and error codes and
//! resolves the waiting [`ResponseHandle`] by transaction id alone.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::dispatch::MessageHandler;
use crate::forwarding::RoutingError;
use crate::link::LinkError;
use crate::message::{ContentType, Message};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("no response for transaction {0:#018x}")]
    Timeout(u64),
    #[error("request cancelled")]
    Cancelled,
    #[error("first hop failed: {0}")]
    Link(#[from] LinkError),
    #[error("not routable: {0}")]
    Routing(#[from] RoutingError),
}

type Reply = Result<Message, TransactionError>;

struct Pending {
    request_type: ContentType,
    deadline: Instant,
    sender: oneshot::Sender<Reply>,
}

/// Resolves with the response (or error response) to one request.
#[derive(Debug)]
pub struct ResponseHandle {
    transaction_id: u64,
    rx: oneshot::Receiver<Reply>,
}

impl ResponseHandle {
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }
}

impl Future for ResponseHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TransactionError::Cancelled)))
    }
}

pub struct TransactionTable {
    timeout: Duration,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl TransactionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give `request` a transaction id no other outstanding request uses and start waiting
    /// for its response.
    pub fn issue(&self, request: &mut Message, now: Instant) -> ResponseHandle {
        let mut pending = self.lock();
        let mut rng = rand::thread_rng();
        let mut transaction_id = request.header.transaction_id;
        while pending.contains_key(&transaction_id) {
            transaction_id = rng.gen();
        }
        request.header.transaction_id = transaction_id;
        let (sender, rx) = oneshot::channel();
        pending.insert(
            transaction_id,
            Pending {
                request_type: request.content_type(),
                deadline: now + self.timeout,
                sender,
            },
        );
        trace!(transaction_id, content_type = %request.content_type(), "request issued");
        ResponseHandle { transaction_id, rx }
    }

    /// Resolve the request `response` answers. Returns false for unknown transactions.
    pub fn complete(&self, response: &Message) -> bool {
        if response.content_type().is_request() {
            return false;
        }
        let transaction_id = response.transaction_id();
        let Some(p) = self.lock().remove(&transaction_id) else {
            debug!(transaction_id, "response for unknown transaction");
            return false;
        };
        if !response.content_type().is_error()
            && p.request_type.response_type() != Some(response.content_type())
        {
            debug!(
                transaction_id,
                request = %p.request_type,
                response = %response.content_type(),
                "response code does not pair with request"
            );
        }
        let _ = p.sender.send(Ok(response.clone()));
        true
    }

    /// Fail one request, e.g. when its first hop could not deliver it.
    pub fn fail(&self, transaction_id: u64, error: TransactionError) -> bool {
        match self.lock().remove(&transaction_id) {
            Some(p) => {
                let _ = p.sender.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every request whose deadline has passed. Returns how many expired.
    pub fn expire(&self, now: Instant) -> usize {
        let mut pending = self.lock();
        let due: Vec<u64> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for transaction_id in &due {
            if let Some(p) = pending.remove(transaction_id) {
                debug!(transaction_id, "request timed out");
                let _ = p.sender.send(Err(TransactionError::Timeout(*transaction_id)));
            }
        }
        due.len()
    }

    /// Fail everything with `Cancelled`; used on shutdown.
    pub fn cancel_all(&self) {
        for (_, p) in self.lock().drain() {
            let _ = p.sender.send(Err(TransactionError::Cancelled));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().map(|p| p.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl MessageHandler for TransactionTable {
    fn handle(&self, message: &Message) {
        self.complete(message);
    }
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTable")
            .field("timeout", &self.timeout)
            .field("pending", &self.len())
            .finish()
    }
}
