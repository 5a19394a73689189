//! Logging for the daemon.
//!
//! [`init_journald_or_stdout`] installs a subscriber once at startup.
//! Modules pull the level macros through [`prelude`]:
//! `use crate::tracing::prelude::*;`

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Install the logging subscriber: journald when running under systemd,
/// otherwise stdout.
pub fn init_journald_or_stdout() {
    // systemd sets JOURNAL_STREAM when it captures our output.
    if env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
            Err(e) => {
                init_stdout();
                warn!(error = %e, "Journald unavailable, logging to stdout.");
                return;
            }
        }
    }
    init_stdout();
}

// Stdout logging, filtered by RUST_LOG with a default level of INFO so a
// bare invocation still shows the link lifecycle.
fn init_stdout() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(WallClock))
        .init();
}

// Second-resolution local-time stamps. Journald keeps its own timestamps;
// this only matters on stdout, where subsecond UTC noise helps nobody
// reading a serial-bus log.
struct WallClock;

impl FormatTime for WallClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        match now.format(time::macros::format_description!(
            "[hour]:[minute]:[second]"
        )) {
            Ok(stamp) => write!(w, "{stamp}"),
            Err(_) => Err(std::fmt::Error),
        }
    }
}
