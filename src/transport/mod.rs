//! Transport layer
//!
//! Establishes raw outbound connections. No protocol parsing, no
//! encryption, no proxying; those live above this layer. The client
//! never listens, so there is no bind side.

mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};

/// Transport trait for establishing raw connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<Stream>;
}
