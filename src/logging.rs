//! Opt-in structured logging for binaries and tests that embed the pump.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the filter directives, e.g. `compressor=debug`.
pub const LOG_ENV_VAR: &str = "COMPRESSOR_LOG";

/// Install a JSON subscriber that only reports errors unless `COMPRESSOR_LOG` says otherwise.
pub fn init() {
    init_with_default(LevelFilter::ERROR);
}

/// Like `init`, with a different fallback level. Later calls are ignored.
pub fn init_with_default(level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(level.into())
        .from_env_lossy();

    // Worker threads log inside the pump's span, so keep span context on every line.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_thread_names(true),
        )
        .try_init();
}
