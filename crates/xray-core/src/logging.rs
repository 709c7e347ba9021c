//! Tracing initialisation.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable holding per-target log directives.
pub const LOG_ENV: &str = "XRAY_LOG";

/// Install the global fmt subscriber.
///
/// Reads `XRAY_LOG` (e.g. `XRAY_LOG=_xray_core=debug`) and falls back to `_xray_core=info`.
/// Calling it more than once is a no-op, and a subscriber installed elsewhere
/// is left untouched.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("_xray_core=info"));

        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .with(filter)
            .try_init();
    });
}
