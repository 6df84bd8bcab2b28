//! Structured logging setup.
//!
//! A `tracing-subscriber` `fmt` layer with file/line/level annotations,
//! always compiled in: a reverse proxy with no logs is not operable in
//! production. Verbosity is controlled by `RUST_LOG` (default `info`) via
//! `EnvFilter` rather than a fixed level, so operators can raise it without
//! a redeploy.

use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global tracing subscriber with formatted, leveled output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_filter(filter),
        )
        .init();
}
