//! Diagnostic tracing for debugging the engine.
//!
//! Tracing output goes to stderr. It is kept apart from operator-facing
//! output (plans, prompts, live script output), which is printed to stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset, by `-v` count.
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,stepwise=info",
        _ => "warn,stepwise=debug",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbosity` picks the level.
///
/// # Example
/// ```bash
/// RUST_LOG=stepwise::engine=debug stepwise repl
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
