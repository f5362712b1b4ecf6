//! Named log channels.
//!
//! Each channel is a `tracing` target so operators can route or filter them
//! independently, e.g. `RUST_LOG=mailhold::error=warn,mailhold::general=info`.

/// Run progress: accounts started, mailboxes drained, summaries.
pub const GENERAL: &str = "mailhold::general";
/// Failures that flip an error indicator.
pub const ERROR: &str = "mailhold::error";
/// Per-message detail and protocol chatter.
pub const DEBUG: &str = "mailhold::debug";
/// Reserved for test harnesses driving the engine.
pub const TEST: &str = "mailhold::test";

const DEFAULT_FILTER: &str = "mailhold=info";

/// Installs the global fmt subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with_target(true)
        .try_init();
}
