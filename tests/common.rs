//! Shared setup for integration tests: a process-wide `tracing` subscriber installed once,
//! mirroring the teacher's `tests/common` convention.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    });
}
