//! Remote-device liveness tracking.
//!
//! The remote controller announces itself with `{"hello": <name>}` and
//! proves liveness with periodic `{"heartbeat": <name>}` messages. The
//! monitor folds those into a [`RemoteStatus`] snapshot on a watch channel
//! and declares the remote gone after a configurable silence, downgrading
//! the link status with it so consumers see one coherent picture.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::link::{LinkEvent, LinkState, LinkStatus, LinkStatusHandle};
use crate::tracing::prelude::*;

const HEARTBEAT_TIMEOUT_REASON: &str = "Remote heartbeat timeout";

/// Snapshot of the remote controller as seen from this end of the bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemoteStatus {
    /// A hello or heartbeat arrived within the timeout window
    pub connected: bool,

    /// Name the remote announced itself with
    pub device: Option<String>,

    /// Speed value carried by the last hello, passed through verbatim
    pub speed: Option<Value>,

    /// When the last hello or heartbeat arrived
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// When the current connection was established
    pub connected_at: Option<DateTime<Utc>>,

    /// When the remote was last declared gone
    pub disconnected_at: Option<DateTime<Utc>>,

    /// Why the remote was declared gone
    pub reason: Option<String>,
}

/// Handle on the liveness task.
pub struct ConnectionMonitor {
    status: watch::Receiver<RemoteStatus>,
}

impl ConnectionMonitor {
    /// Start the liveness task, consuming inbound messages and link status
    /// changes from `events`.
    pub fn spawn(
        events: broadcast::Receiver<LinkEvent>,
        link: LinkStatusHandle,
        heartbeat_timeout: Duration,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> ConnectionMonitor {
        let (status, status_rx) = watch::channel(RemoteStatus::default());
        let monitor = Monitor {
            status,
            link,
            heartbeat_timeout,
            last_seen: None,
        };
        tracker.spawn(monitor.run(events, cancel));
        ConnectionMonitor { status: status_rx }
    }

    /// Watch the remote status.
    pub fn status(&self) -> watch::Receiver<RemoteStatus> {
        self.status.clone()
    }

    /// Current remote status snapshot.
    pub fn current(&self) -> RemoteStatus {
        self.status.borrow().clone()
    }
}

struct Monitor {
    status: watch::Sender<RemoteStatus>,
    link: LinkStatusHandle,
    heartbeat_timeout: Duration,
    last_seen: Option<Instant>,
}

impl Monitor {
    async fn run(mut self, mut events: broadcast::Receiver<LinkEvent>, cancel: CancellationToken) {
        trace!("Connection monitor started.");
        // Check at least every half window so staleness is declared no
        // later than one tick past the timeout.
        let tick = std::cmp::max(Duration::from_secs(1), self.heartbeat_timeout / 2);
        let mut interval = time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(LinkEvent::Message(message)) => self.observe(&message),
                    Ok(LinkEvent::Status(state)) if state.status != LinkStatus::Connected => {
                        self.link_lost(&state);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Connection monitor lagged behind link events.");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = interval.tick() => self.check_stale(),
            }
        }
        trace!("Connection monitor stopped.");
    }

    fn observe(&mut self, message: &Value) {
        if let Some(name) = message.get("hello").and_then(Value::as_str) {
            self.hello(name, message.get("speed").cloned());
        } else if let Some(name) = message.get("heartbeat").and_then(Value::as_str) {
            self.heartbeat(name);
        }
    }

    /// A hello starts (or restarts) a connection and carries the remote's
    /// identity.
    fn hello(&mut self, name: &str, speed: Option<Value>) {
        info!(device = name, "Remote controller said hello.");
        self.last_seen = Some(Instant::now());
        self.link.mark_connected();
        let now = Utc::now();
        self.status.send_modify(|status| {
            if !status.connected {
                status.connected = true;
                status.connected_at = Some(now);
            }
            status.device = Some(name.to_string());
            status.speed = speed;
            status.last_heartbeat = Some(now);
            status.disconnected_at = None;
            status.reason = None;
        });
    }

    /// A heartbeat refreshes the window. It adopts the remote's identity
    /// only when no hello has supplied one.
    fn heartbeat(&mut self, name: &str) {
        trace!(device = name, "Heartbeat.");
        self.last_seen = Some(Instant::now());
        self.link.mark_connected();
        let now = Utc::now();
        self.status.send_modify(|status| {
            if !status.connected {
                status.connected = true;
                status.connected_at = Some(now);
                status.disconnected_at = None;
                status.reason = None;
            }
            if status.device.is_none() {
                status.device = Some(name.to_string());
            }
            status.last_heartbeat = Some(now);
        });
    }

    fn check_stale(&mut self) {
        let Some(last_seen) = self.last_seen else {
            return;
        };
        if self.status.borrow().connected && last_seen.elapsed() > self.heartbeat_timeout {
            warn!(
                silence_ms = last_seen.elapsed().as_millis() as u64,
                "Remote heartbeat timeout."
            );
            self.mark_disconnected(HEARTBEAT_TIMEOUT_REASON);
            self.link.downgrade(HEARTBEAT_TIMEOUT_REASON);
        }
    }

    fn link_lost(&mut self, state: &LinkState) {
        let reason = state
            .last_error
            .clone()
            .unwrap_or_else(|| "link down".to_string());
        self.mark_disconnected(&reason);
    }

    /// Declare the remote gone. Only a connected remote transitions, so an
    /// earlier, more specific reason is never overwritten.
    fn mark_disconnected(&mut self, reason: &str) {
        self.last_seen = None;
        self.status.send_if_modified(|status| {
            if !status.connected {
                return false;
            }
            status.connected = false;
            status.disconnected_at = Some(Utc::now());
            status.reason = Some(reason.to_string());
            true
        });
    }
}
