//! Link transport for the RS-485 bus.
//!
//! Owns the physical serial port, the direction-control lines, the line
//! framing, and the connect/reconnect lifecycle. Inbound lines are
//! published as [`LinkEvent`]s; the transmit path enforces the half-duplex
//! direction discipline around every write: assert transmit, write and
//! flush, restore receive on every exit path, then wait the turnaround
//! delay so the transceiver settles before anyone listens for a reply.

pub mod codec;
pub mod direction;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_serial::SerialPortBuilderExt;
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, Parity, ReconnectConfig, SerialConfig};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use codec::LineCodec;
use direction::DirectionControl;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Physical link status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Fail,
}

/// Snapshot published on the status watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkState {
    pub status: LinkStatus,
    pub last_error: Option<String>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            last_error: None,
        }
    }
}

/// Events emitted by the link for downstream consumers.
///
/// The link does not fan these out to multiple clients; that belongs to
/// the broadcast layer above it. It only publishes on one channel that the
/// transaction manager, the connection monitor, and the broadcaster each
/// subscribe to.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The link status changed.
    Status(LinkState),
    /// An inbound line parsed as JSON.
    Message(Value),
    /// Every non-empty inbound line, JSON or not, for diagnostics.
    RawLine(String),
    /// A port error was captured.
    Error(String),
}

/// Byte stream the link runs over.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// Seam for opening the port, so tests can substitute in-memory pipes.
#[async_trait]
pub trait PortOpen: Send + Sync {
    async fn open(&self) -> Result<Box<dyn SerialIo>>;
}

/// Opens the configured tokio-serial port.
pub struct SerialOpener {
    config: SerialConfig,
}

impl SerialOpener {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PortOpen for SerialOpener {
    async fn open(&self) -> Result<Box<dyn SerialIo>> {
        let data_bits = match self.config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match self.config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stream = tokio_serial::new(&self.config.device, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()?;
        Ok(Box::new(stream))
    }
}

/// Shared view of the link status, with the two transitions the connection
/// monitor is allowed to drive.
#[derive(Clone)]
pub struct LinkStatusHandle {
    status: Arc<watch::Sender<LinkState>>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkStatusHandle {
    pub(crate) fn new(events: broadcast::Sender<LinkEvent>) -> Self {
        let (status, _) = watch::channel(LinkState::default());
        Self {
            status: Arc::new(status),
            events,
        }
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.status.subscribe()
    }

    /// Current status snapshot.
    pub fn current(&self) -> LinkState {
        self.status.borrow().clone()
    }

    /// In-band traffic proves the link is passing data.
    pub fn mark_connected(&self) {
        self.set(LinkStatus::Connected, None);
    }

    /// Downgrade `Connected` to `Disconnected`. Any other state is more
    /// specific and kept as-is.
    pub fn downgrade(&self, reason: &str) {
        if self.status.borrow().status == LinkStatus::Connected {
            self.set(LinkStatus::Disconnected, Some(reason.to_string()));
        }
    }

    pub(crate) fn set(&self, status: LinkStatus, last_error: Option<String>) {
        let changed = self.status.send_if_modified(|state| {
            if state.status == status && state.last_error == last_error {
                return false;
            }
            *state = LinkState {
                status,
                last_error: last_error.clone(),
            };
            true
        });
        if changed {
            let _ = self
                .events
                .send(LinkEvent::Status(self.status.borrow().clone()));
        }
    }
}

struct TxPath {
    writer: Option<WriteHalf<Box<dyn SerialIo>>>,
    direction: Box<dyn DirectionControl>,
    // Cancelled to end the current read session without stopping the link.
    session: CancellationToken,
}

/// The link transport. Cheap to clone; all clones share the same port.
#[derive(Clone)]
pub struct Link {
    tx_path: Arc<Mutex<TxPath>>,
    // Tracks whether a writer is installed. Transmission gates on this, not
    // on [`LinkStatus`]: status can be downgraded by liveness inference
    // while the port itself is fine.
    port_open: Arc<watch::Sender<bool>>,
    status: LinkStatusHandle,
    cancel: CancellationToken,
    delimiter: u8,
    turnaround: Duration,
}

impl Link {
    /// Start the link task.
    ///
    /// The port is opened by the task, not here: an open failure schedules
    /// the reconnect loop instead of propagating. Only configuration
    /// problems (bad delimiter) fail the spawn.
    pub fn spawn(
        config: &Config,
        opener: Box<dyn PortOpen>,
        direction: Box<dyn DirectionControl>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Link> {
        let delimiter = config.serial.delimiter_byte()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (port_open, _) = watch::channel(false);
        let link = Link {
            tx_path: Arc::new(Mutex::new(TxPath {
                writer: None,
                direction,
                session: cancel.child_token(),
            })),
            port_open: Arc::new(port_open),
            status: LinkStatusHandle::new(events),
            cancel,
            delimiter,
            turnaround: config.direction.turnaround(),
        };
        tracker.spawn(run(link.clone(), opener, config.reconnect.clone()));
        Ok(link)
    }

    /// Subscribe to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.status.events.subscribe()
    }

    /// Watch the link status.
    pub fn status(&self) -> watch::Receiver<LinkState> {
        self.status.subscribe()
    }

    /// Handle for components that may mark the link up or down.
    pub fn status_handle(&self) -> LinkStatusHandle {
        self.status.clone()
    }

    /// Serialize a message to a delimited JSON line and transmit it.
    pub async fn send_command(&self, message: &Value) -> Result<()> {
        let mut buf = BytesMut::new();
        LineCodec::new(self.delimiter).encode(message, &mut buf)?;
        trace!(line = %String::from_utf8_lossy(&buf).trim_end(), "TX");
        self.send_raw(&buf).await
    }

    /// Transmit raw bytes with the half-duplex direction discipline.
    ///
    /// Waits until the port is open (the reconnect loop reopens it), then:
    /// transmit direction on, write and flush, receive direction restored
    /// on every exit path, turnaround delay, and only then return.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        loop {
            self.wait_for_port().await?;
            let mut tx = self.tx_path.lock().await;
            let TxPath {
                writer,
                direction,
                session,
            } = &mut *tx;
            let Some(w) = writer.as_mut() else {
                // The port dropped between the check and the lock; go back
                // to waiting.
                drop(tx);
                tokio::task::yield_now().await;
                continue;
            };

            direction.set_transmit();
            let result = async {
                w.write_all(bytes).await?;
                w.flush().await
            }
            .await;
            direction.set_receive();
            tokio::time::sleep(self.turnaround).await;

            if let Err(e) = &result {
                // A dead transmit path ends the session: drop the writer
                // and stop the read loop so the lifecycle task falls
                // through to its reconnect sleep.
                *writer = None;
                session.cancel();
                self.port_open.send_replace(false);
                self.emit(LinkEvent::Error(format!("write failed: {e}")));
                self.status.set(LinkStatus::Fail, Some(e.to_string()));
            }
            return result.map_err(Error::from);
        }
    }

    /// Tear the link down. Terminal: stops the reconnect loop, closes the
    /// port, and drives both direction lines low before releasing them.
    ///
    /// An in-flight request is NOT rejected by this call; its caller
    /// observes teardown through its own timeout.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        self.port_open.send_replace(false);
        let mut tx = self.tx_path.lock().await;
        if let Some(mut writer) = tx.writer.take() {
            if let Err(e) = writer.shutdown().await {
                warn!(error = %e, "Error closing serial port.");
                self.emit(LinkEvent::Error(format!("close failed: {e}")));
            }
        }
        tx.direction.release();
        self.status
            .set(LinkStatus::Disconnected, Some("link destroyed".to_string()));
        trace!("Link destroyed.");
    }

    fn emit(&self, event: LinkEvent) {
        // No receivers is fine; the broadcaster may not be up yet.
        let _ = self.status.events.send(event);
    }

    async fn wait_for_port(&self) -> Result<()> {
        let mut port = self.port_open.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(Error::LinkDown("link destroyed".to_string()))
            }
            changed = port.wait_for(|open| *open) => changed
                .map(|_| ())
                .map_err(|_| Error::LinkDown("link task stopped".to_string())),
        }
    }

    /// Pump inbound lines until the port errors, closes, the session is
    /// torn down, or we shut down.
    async fn read_until_closed(
        &self,
        reader: ReadHalf<Box<dyn SerialIo>>,
        session: &CancellationToken,
    ) {
        let mut framed = FramedRead::new(reader, LineCodec::new(self.delimiter));
        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                item = framed.next() => match item {
                    Some(Ok(line)) => self.handle_line(line),
                    Some(Err(e)) => {
                        warn!(error = %e, "Serial read error.");
                        self.emit(LinkEvent::Error(e.to_string()));
                        self.status.set(LinkStatus::Fail, Some(e.to_string()));
                        return;
                    }
                    None => {
                        info!("Serial port closed.");
                        self.status.set(
                            LinkStatus::Disconnected,
                            Some("serial port closed".to_string()),
                        );
                        return;
                    }
                },
            }
        }
    }

    fn handle_line(&self, line: String) {
        trace!(line = %line, "RX");
        match serde_json::from_str::<Value>(&line) {
            Ok(message) => {
                self.emit(LinkEvent::RawLine(line));
                self.emit(LinkEvent::Message(message));
            }
            // Not an error: the remote is free to chat in plain text.
            Err(_) => self.emit(LinkEvent::RawLine(line)),
        }
    }
}

/// Connection lifecycle: open, read until the port drops, reconnect at a
/// fixed interval for as long as auto-reconnect is enabled.
async fn run(link: Link, opener: Box<dyn PortOpen>, reconnect: ReconnectConfig) {
    trace!("Link task started.");
    loop {
        if link.cancel.is_cancelled() {
            break;
        }
        match opener.open().await {
            Ok(io) => {
                let (reader, writer) = tokio::io::split(io);
                let session = link.cancel.child_token();
                {
                    let mut tx = link.tx_path.lock().await;
                    tx.writer = Some(writer);
                    tx.session = session.clone();
                    // Make sure we are listening, not driving the bus.
                    tx.direction.set_receive();
                }
                link.port_open.send_replace(true);
                link.status.set(LinkStatus::Connected, None);
                info!("Serial link up.");

                link.read_until_closed(reader, &session).await;
                link.port_open.send_replace(false);
                link.tx_path.lock().await.writer = None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to open serial port.");
                link.emit(LinkEvent::Error(e.to_string()));
                link.status.set(LinkStatus::Fail, Some(e.to_string()));
            }
        }

        if !reconnect.enabled || link.cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = link.cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect.interval()) => {}
        }
    }
    trace!("Link task stopped.");
}

#[cfg(test)]
mod tests {
    use super::direction::testing::{PinState, RecordingDirection};
    use super::direction::NoDirection;
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};
    use tokio::time::{self, Duration, Instant};

    /// Hands out prepared streams, recording when each open was attempted.
    struct ScriptedOpener {
        streams: StdMutex<VecDeque<Option<Box<dyn SerialIo>>>>,
        attempts: StdMutex<Vec<Instant>>,
    }

    impl ScriptedOpener {
        fn new(streams: Vec<Option<Box<dyn SerialIo>>>) -> Arc<Self> {
            Arc::new(Self {
                streams: StdMutex::new(streams.into()),
                attempts: StdMutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PortOpen for Arc<ScriptedOpener> {
        async fn open(&self) -> Result<Box<dyn SerialIo>> {
            self.attempts.lock().unwrap().push(Instant::now());
            match self.streams.lock().unwrap().pop_front() {
                Some(Some(stream)) => Ok(stream),
                _ => Err(Error::LinkDown("no port".to_string())),
            }
        }
    }

    /// Write side always fails; read side stays open.
    struct BrokenWriteIo;

    impl AsyncRead for BrokenWriteIo {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWriteIo {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "tx dead")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct OnceOpener(StdMutex<Option<Box<dyn SerialIo>>>);

    #[async_trait]
    impl PortOpen for OnceOpener {
        async fn open(&self) -> Result<Box<dyn SerialIo>> {
            match self.0.lock().unwrap().take() {
                Some(io) => Ok(io),
                None => Err(Error::LinkDown("no port".to_string())),
            }
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.reconnect.interval_ms = 1000;
        config.direction.turnaround_ms = 2;
        config
    }

    fn spawn_link(
        config: &Config,
        opener: Box<dyn PortOpen>,
        direction: Box<dyn DirectionControl>,
    ) -> Link {
        let tracker = TaskTracker::new();
        Link::spawn(config, opener, direction, CancellationToken::new(), &tracker).unwrap()
    }

    async fn wait_for_status(link: &Link, status: LinkStatus) {
        let mut rx = link.status();
        rx.wait_for(|s| s.status == status).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn direction_discipline_on_successful_write() {
        let (local, _remote) = tokio::io::duplex(256);
        let direction = RecordingDirection::new();
        let link = spawn_link(
            &test_config(),
            Box::new(OnceOpener(StdMutex::new(Some(Box::new(local))))),
            Box::new(direction.clone()),
        );
        wait_for_status(&link, LinkStatus::Connected).await;

        link.send_raw(b"{\"cmd\":\"ping\"}\n").await.unwrap();

        assert_eq!(
            direction.transitions(),
            vec![PinState::Receive, PinState::Transmit, PinState::Receive]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn direction_discipline_when_the_write_fails() {
        let direction = RecordingDirection::new();
        let link = spawn_link(
            &test_config(),
            Box::new(OnceOpener(StdMutex::new(Some(Box::new(BrokenWriteIo))))),
            Box::new(direction.clone()),
        );
        wait_for_status(&link, LinkStatus::Connected).await;

        let result = link.send_raw(b"{\"cmd\":\"ping\"}\n").await;
        assert!(result.is_err());

        // Post-condition pin state is identical to the success path.
        assert_eq!(
            direction.transitions(),
            vec![PinState::Receive, PinState::Transmit, PinState::Receive]
        );
        assert_eq!(link.status().borrow().status, LinkStatus::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn turnaround_delay_is_observed_before_returning() {
        let (local, _remote) = tokio::io::duplex(256);
        let link = spawn_link(
            &test_config(),
            Box::new(OnceOpener(StdMutex::new(Some(Box::new(local))))),
            Box::new(NoDirection),
        );
        wait_for_status(&link, LinkStatus::Connected).await;

        let before = Instant::now();
        link.send_raw(b"x\n").await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_lines_become_raw_and_message_events() {
        let (local, remote) = tokio::io::duplex(256);
        let link = spawn_link(
            &test_config(),
            Box::new(OnceOpener(StdMutex::new(Some(Box::new(local))))),
            Box::new(NoDirection),
        );
        let mut events = link.subscribe();
        wait_for_status(&link, LinkStatus::Connected).await;

        let mut remote = remote;
        remote
            .write_all(b"plain text\n{\"hello\":\"ctrl-1\"}\n\n")
            .await
            .unwrap();

        // Skip status events; collect the traffic ones.
        let mut raw = Vec::new();
        let mut messages = Vec::new();
        while raw.len() < 2 || messages.is_empty() {
            match events.recv().await.unwrap() {
                LinkEvent::RawLine(line) => raw.push(line),
                LinkEvent::Message(m) => messages.push(m),
                _ => {}
            }
        }
        assert_eq!(raw, vec!["plain text", "{\"hello\":\"ctrl-1\"}"]);
        assert_eq!(messages, vec![serde_json::json!({"hello": "ctrl-1"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_fire_at_the_configured_interval() {
        let opener = ScriptedOpener::new(vec![]);
        let link = spawn_link(
            &test_config(),
            Box::new(opener.clone()),
            Box::new(NoDirection),
        );
        wait_for_status(&link, LinkStatus::Fail).await;

        // Let several reconnect cycles elapse.
        time::sleep(Duration::from_millis(3500)).await;

        let attempts = opener.attempts();
        assert!(attempts.len() >= 3, "got {} attempts", attempts.len());
        for pair in attempts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn port_close_schedules_a_reconnect() {
        let (local, remote) = tokio::io::duplex(256);
        let opener = ScriptedOpener::new(vec![Some(Box::new(local))]);
        let link = spawn_link(
            &test_config(),
            Box::new(opener.clone()),
            Box::new(NoDirection),
        );
        wait_for_status(&link, LinkStatus::Connected).await;

        drop(remote); // simulated port loss
        wait_for_status(&link, LinkStatus::Disconnected).await;

        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(opener.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_downgrade_does_not_block_transmission() {
        let (local, _remote) = tokio::io::duplex(256);
        let link = spawn_link(
            &test_config(),
            Box::new(OnceOpener(StdMutex::new(Some(Box::new(local))))),
            Box::new(NoDirection),
        );
        wait_for_status(&link, LinkStatus::Connected).await;

        // Liveness inference can mark the link disconnected while the port
        // itself is fine; the transmit path must not gate on it.
        link.status_handle().downgrade("Remote heartbeat timeout");
        assert_eq!(link.status().borrow().status, LinkStatus::Disconnected);

        link.send_raw(b"{\"cmd\":\"ping\"}\n").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_tears_the_session_down_and_reconnects() {
        let (local, _remote) = tokio::io::duplex(256);
        let opener = ScriptedOpener::new(vec![
            Some(Box::new(BrokenWriteIo)),
            Some(Box::new(local)),
        ]);
        let link = spawn_link(
            &test_config(),
            Box::new(opener.clone()),
            Box::new(NoDirection),
        );
        wait_for_status(&link, LinkStatus::Connected).await;

        assert!(link.send_raw(b"x\n").await.is_err());
        assert_eq!(link.status().borrow().status, LinkStatus::Fail);

        // The read side of the broken port never fails on its own; the
        // write failure must end the session so a reconnect happens.
        wait_for_status(&link, LinkStatus::Connected).await;
        assert_eq!(opener.attempts().len(), 2);
        link.send_raw(b"x\n").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_disabled_stops_after_one_failure() {
        let mut config = test_config();
        config.reconnect.enabled = false;
        let opener = ScriptedOpener::new(vec![]);
        let link = spawn_link(&config, Box::new(opener.clone()), Box::new(NoDirection));
        wait_for_status(&link, LinkStatus::Fail).await;

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opener.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_releases_the_direction_lines() {
        let (local, _remote) = tokio::io::duplex(256);
        let direction = RecordingDirection::new();
        let link = spawn_link(
            &test_config(),
            Box::new(OnceOpener(StdMutex::new(Some(Box::new(local))))),
            Box::new(direction.clone()),
        );
        wait_for_status(&link, LinkStatus::Connected).await;

        link.destroy().await;

        assert_eq!(direction.transitions().last(), Some(&PinState::Released));
        assert_eq!(link.status().borrow().status, LinkStatus::Disconnected);

        // Terminal: sends now fail instead of waiting for a reconnect.
        assert!(link.send_raw(b"x\n").await.is_err());
    }
}
