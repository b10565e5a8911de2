//! Process-wide tracing setup
//!
//! Sessions never install a subscriber themselves. The entry point calls
//! [`ensure_initialized`] once; later calls are no-ops.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INITIALIZED: OnceCell<bool> = OnceCell::new();

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Install the global `tracing` subscriber if it is not installed yet.
///
/// Returns `true` when this call installed it. A subscriber installed by
/// someone else (a test harness, an embedding application) is left alone.
pub fn ensure_initialized() -> bool {
    ensure_initialized_with(DEFAULT_FILTER)
}

/// Like [`ensure_initialized`] with a custom fallback filter
pub fn ensure_initialized_with(default_filter: &str) -> bool {
    let mut installed_now = false;
    INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        installed_now = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_ok();
        installed_now
    });
    installed_now
}

/// Whether [`ensure_initialized`] has run in this process
pub fn is_initialized() -> bool {
    INITIALIZED.get().is_some()
}
