use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary, so the rehash/
/// invalidate-wait instrumentation in `concurrent::static_int_map` and
/// `concurrent::cached_value` is visible under `cargo test -- --nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().with_target(false).init();
    });
}
