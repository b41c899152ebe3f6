//! Relay Leaf - a relay network client library
//!
//! # Architecture
//!
//! ```text
//! Discovery (HTTP node list, background refresh)
//! → Connection Pool (per-node reconnect workers)
//! → Mux (framed multiplexing over one TCP connection)
//! → Proxy Chain (optional SOCKS5/HTTP CONNECT upstreams)
//! → Transport (TCP)
//! ```
//!
//! A [`RelaySession`] owns the whole stack: it fetches relay nodes from
//! the discovery endpoint, keeps multiplexed connections to a few of
//! them, and hands out logical streams. Counters for every layer are
//! aggregated into a [`StatsSnapshot`].
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, ProxyEndpoint
//! ├── transport/       # Transport layer: TCP
//! ├── proxy/           # Upstream proxy chain: SOCKS5, HTTP CONNECT
//! ├── discovery/       # Node discovery client and refresh loop
//! ├── mux/             # Frame protocol and stream multiplexer
//! ├── pool/            # Connection pool and reconnect backoff
//! ├── session.rs       # Session lifecycle
//! ├── stats.rs         # Counters and stats snapshots
//! └── config.rs        # JSON configuration for the demo binary
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod proxy;
pub mod discovery;
pub mod mux;
pub mod pool;
pub mod session;

// Supporting modules
pub mod config;
pub mod stats;

// Re-exports for convenience
pub use common::{Address, ProxyEndpoint, ProxyScheme, Stream};
pub use config::RelayConfig;
pub use error::{code, error_message, Error, Result};
pub use session::{RelaySession, SessionState};
pub use stats::StatsSnapshot;

/// Library version string
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
