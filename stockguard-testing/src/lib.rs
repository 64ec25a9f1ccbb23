//! Test support for `StockGuard`: fault injection, fixtures and tracing setup.

#![forbid(unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    non_ascii_idents,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_variables
)]

pub mod chaos;
pub mod fixtures;

pub use chaos::*;
pub use fixtures::*;

/// Installs a `tracing` subscriber for tests, filtered by `RUST_LOG`
/// (default `warn`). Safe to call from every test; only the first call wins.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
