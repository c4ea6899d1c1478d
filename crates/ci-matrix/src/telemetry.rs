//! Log setup for the `ci-matrix` binary.
//!
//! Job output never goes through tracing; only lifecycle events from
//! [`crate::obs`] do. Everything is written to stderr so stdout stays free for
//! the text report and `plan` output.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset: `level` for this crate, warnings
/// from everything else.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("warn,ci_matrix={}", level)
}

/// Install the global subscriber. Later calls are ignored.
///
/// `json` switches to newline-delimited JSON, one object per event, with the
/// run span's `run_id` and `matrix` fields attached.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let layer = if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .ok();
}
