//! Proxy layer
//!
//! Client-side handshakes for tunneling relay connections through an
//! upstream SOCKS5 or HTTP proxy, plus the ordered chain dialer that
//! applies the session's proxy policy.

mod chain;
mod http;
mod socks5;

pub use chain::ProxyChain;
pub use http::HttpConnectConnector;
pub use socks5::Socks5Connector;

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};

/// Client-side proxy handshake
///
/// Takes a stream already connected to the proxy server and performs
/// the tunnel handshake toward `target`, returning a stream that talks
/// to the target through the proxy.
#[async_trait]
pub trait ProxyConnector: Send + Sync {
    async fn connect_through(&self, stream: Stream, target: &Address) -> Result<Stream>;

    /// Get connector name
    fn name(&self) -> &'static str;
}
