//! Provide tracing, tailored to this program.
//!
//! The binary calls [`init`] once at startup to install a subscriber. Under
//! systemd the subscriber emits to journald; otherwise it falls back to
//! stdout, filtered by the RUST_LOG environment variable.
//!
//! The rest of the program includes `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()`, `debug!()`, `info!()`, `warn!()`,
//! and `error!()` macros.

use std::env;
use time::OffsetDateTime;
use tracing_journald;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{trace, debug, info, warn, error};
}

use prelude::*;

/// Initialize logging.
///
/// Uses journald when running under systemd, stdout otherwise.
pub fn init() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry().with(layer).init(),
            Err(_) => {
                init_stdout();
                error!("Failed to initialize journald logging, using stdout.");
            }
        }
    } else {
        init_stdout();
    }
}

// Log to stdout. RUST_LOG selects the filter, defaulting to INFO.
fn init_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(WallClock))
        .init();
}

// Timestamps in local time to the nearest second; the default timer's long
// UTC strings drown out the message on a narrow terminal.
struct WallClock;

impl FormatTime for WallClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .unwrap(),
        )
    }
}
