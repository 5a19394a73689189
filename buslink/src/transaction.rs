//! Request/reply transactions over the half-duplex bus.
//!
//! RS-485 is a shared medium with no collision handling, so the master
//! keeps at most one request in flight. Requests queue in FIFO order; the
//! queue is the only mutual exclusion the bus needs. Each outbound object
//! without an `id` gets one from a rotating zero-padded counter, and
//! replies correlate back by id through a small set of accepted field
//! aliases.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::link::{Link, LinkEvent};
use crate::tracing::prelude::*;

/// Reply correlation field aliases, in precedence order. The first one
/// present in an inbound object decides the reply id.
const REPLY_ID_FIELDS: [&str; 4] = ["replyTo", "id", "reply_to", "responseTo"];

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Where outbound commands go. Seam between the transaction layer and the
/// link, so tests can run against a scripted transport.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, message: &Value) -> Result<()>;
}

#[async_trait]
impl CommandSink for Link {
    async fn send_command(&self, message: &Value) -> Result<()> {
        Link::send_command(self, message).await
    }
}

struct Pending {
    message: Value,
    timeout: Duration,
    reply: oneshot::Sender<Result<Value>>,
}

/// Handle for submitting transactions. Cheap to clone.
#[derive(Clone)]
pub struct TransactionManager {
    requests: mpsc::Sender<Pending>,
}

impl TransactionManager {
    /// Start the transaction task, consuming inbound messages from `events`.
    pub fn spawn(
        sink: Arc<dyn CommandSink>,
        events: broadcast::Receiver<LinkEvent>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> TransactionManager {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let runner = Runner {
            sink,
            queue: VecDeque::new(),
            current: None,
            next_id: 0,
        };
        tracker.spawn(runner.run(rx, events, cancel));
        TransactionManager { requests: tx }
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// The request joins the FIFO queue and is transmitted once everything
    /// ahead of it has completed. An object without an `id` is assigned
    /// one; the caller's own id (string or number) is kept as-is. The
    /// timeout clock starts at transmission, not submission.
    pub async fn request(&self, message: Value, timeout: Duration) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Pending {
                message,
                timeout,
                reply,
            })
            .await
            .map_err(|_| Error::ManagerStopped)?;
        rx.await.map_err(|_| Error::ManagerStopped)?
    }
}

struct InFlight {
    id: Option<String>,
    reply: oneshot::Sender<Result<Value>>,
    sent_at: Instant,
    deadline: Instant,
}

struct Runner {
    sink: Arc<dyn CommandSink>,
    queue: VecDeque<Pending>,
    current: Option<InFlight>,
    next_id: u16,
}

impl Runner {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Pending>,
        mut events: broadcast::Receiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        trace!("Transaction task started.");
        loop {
            self.pump().await;
            let deadline = self.current.as_ref().map(|c| c.deadline);
            tokio::select! {
                _ = cancel.cancelled() => break,
                pending = requests.recv() => match pending {
                    Some(pending) => self.queue.push_back(pending),
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(LinkEvent::Message(message)) => self.correlate(&message),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Transaction task lagged behind link events.");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => self.expire(),
            }
        }
        trace!("Transaction task stopped.");
    }

    /// Transmit queued requests until one is in flight or the queue is
    /// empty. A transmit failure rejects that request immediately and moves
    /// on to the next.
    async fn pump(&mut self) {
        while self.current.is_none() {
            let Some(mut pending) = self.queue.pop_front() else {
                return;
            };
            let id = self.assign_id(&mut pending.message);
            let sent_at = Instant::now();
            match self.sink.send_command(&pending.message).await {
                Ok(()) => {
                    self.current = Some(InFlight {
                        id,
                        reply: pending.reply,
                        sent_at,
                        deadline: sent_at + pending.timeout,
                    });
                }
                Err(e) => {
                    debug!(error = %e, "Transmit failed, rejecting request.");
                    let _ = pending.reply.send(Err(e));
                }
            }
        }
    }

    /// Ensure the outbound object carries a correlation id, and report the
    /// id the reply must match. Non-object payloads go out untouched and
    /// can only complete by timeout.
    fn assign_id(&mut self, message: &mut Value) -> Option<String> {
        let Value::Object(map) = message else {
            return None;
        };
        match map.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => None,
            None => {
                let id = format!("{:03}", self.next_id);
                self.next_id = (self.next_id + 1) % 1000;
                map.insert("id".to_string(), Value::String(id.clone()));
                Some(id)
            }
        }
    }

    fn correlate(&mut self, message: &Value) {
        let Some(current) = &self.current else {
            trace!("Inbound message with no request in flight.");
            return;
        };
        let Some(reply_id) = reply_id(message) else {
            // Unsolicited traffic (heartbeats, notifications) lands here.
            return;
        };
        let Some(id) = &current.id else {
            trace!(got = %reply_id, "Reply for a request without an id, ignoring.");
            return;
        };
        if normalize_id(&reply_id) != normalize_id(id) {
            debug!(got = %reply_id, want = %id, "Reply id mismatch, discarding.");
            return;
        }
        if let Some(current) = self.current.take() {
            let _ = current.reply.send(Ok(message.clone()));
        }
    }

    fn expire(&mut self) {
        if let Some(current) = self.current.take() {
            let elapsed_ms = current.sent_at.elapsed().as_millis() as u64;
            let id = current.id.unwrap_or_else(|| "<none>".to_string());
            warn!(id = %id, elapsed_ms, "Request timed out.");
            let _ = current.reply.send(Err(Error::Timeout { id, elapsed_ms }));
        }
    }
}

/// The reply id carried by an inbound object, if any. The first alias
/// holding a string or number wins; aliases with other values are skipped.
fn reply_id(message: &Value) -> Option<String> {
    let map = message.as_object()?;
    for field in REPLY_ID_FIELDS {
        match map.get(field) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Canonical form of an id for comparison. Numeric strings lose their
/// leading zeros so "005" and "5" match; anything else compares verbatim.
fn normalize_id(id: &str) -> &str {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        let trimmed = id.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    } else {
        id
    }
}
