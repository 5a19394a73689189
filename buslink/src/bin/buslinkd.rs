use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use buslink::link::{direction::GpioDirection, Link, SerialOpener};
use buslink::tracing::{self, prelude::*};
use buslink::{Config, ConnectionMonitor, TransactionManager};

/// How long to wait for a startup ping before giving up on it. The daemon
/// keeps running either way; the ping only probes the bus.
const STARTUP_PING_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;
    info!(device = %config.serial.device, baud = config.serial.baud_rate, "Starting.");

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let direction = GpioDirection::configure(&config.direction);
    let opener = Box::new(SerialOpener::new(config.serial.clone()));
    let link = Link::spawn(&config, opener, direction, running.clone(), &tracker)
        .context("starting serial link")?;

    let manager = TransactionManager::spawn(
        Arc::new(link.clone()),
        link.subscribe(),
        running.clone(),
        &tracker,
    );
    let monitor = ConnectionMonitor::spawn(
        link.subscribe(),
        link.status_handle(),
        config.remote.heartbeat_timeout(),
        running.clone(),
        &tracker,
    );

    tracker.spawn(log_remote_status(monitor, running.clone()));
    tracker.spawn(startup_ping(manager.clone(), running.clone()));
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    link.destroy().await;

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}

/// Probe the bus once at startup so a wiring problem shows up in the log
/// right away instead of on the first real transaction.
async fn startup_ping(manager: TransactionManager, running: CancellationToken) {
    let ping = serde_json::json!({"cmd": "ping"});
    tokio::select! {
        _ = running.cancelled() => {}
        result = manager.request(ping, STARTUP_PING_TIMEOUT) => match result {
            Ok(reply) => debug!(reply = %reply, "Startup ping answered."),
            Err(e) => warn!(error = %e, "Startup ping failed."),
        }
    }
}

/// Log remote connect/disconnect transitions.
async fn log_remote_status(monitor: ConnectionMonitor, running: CancellationToken) {
    let mut status = monitor.status();
    let mut connected = status.borrow().connected;
    loop {
        tokio::select! {
            _ = running.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = status.borrow().clone();
                if current.connected != connected {
                    connected = current.connected;
                    if connected {
                        info!(
                            device = current.device.as_deref().unwrap_or("unknown"),
                            "Remote controller connected."
                        );
                    } else {
                        warn!(
                            device = current.device.as_deref().unwrap_or("unknown"),
                            reason = current.reason.as_deref().unwrap_or("unknown"),
                            "Remote controller disconnected."
                        );
                    }
                }
            }
        }
    }
}
