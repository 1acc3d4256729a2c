// Shared fixtures for tern integration tests and the harness binaries.
pub mod server;
pub mod tls;

pub use server::{MockServer, MockServerConfig};
pub use tls::{ServerTls, TestPki};

/// Install a fmt subscriber honoring `RUST_LOG` (default `info`). Safe to
/// call from every test; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
