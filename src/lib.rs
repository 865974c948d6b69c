//! mirrormesh - peer-to-peer pull-through mirror for container images
//!
//! Each node observes the images its local runtime holds, advertises the
//! corresponding content keys to a distributed peer index, and resolves
//! pulls from peers that advertised the needed artifact before falling
//! back to the upstream registry.

pub mod channel;
pub mod cleanup;
pub mod config;
pub mod daemon;
pub mod error;
pub mod httpx;
pub mod metrics;
pub mod oci;
pub mod routing;
pub mod state;

// Re-export commonly used types
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for the library
pub fn init_tracing() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirrormesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|_| Error::other("Tracing already initialized"))
}
