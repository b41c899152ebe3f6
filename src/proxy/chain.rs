//! Ordered proxy chain dialer
//!
//! Applies the session's proxy policy: with proxies configured, the
//! first reachable one in registration order carries the connection,
//! and if none is reachable the dial fails. There is no silent direct
//! fallback.

use std::sync::Arc;

use tracing::debug;

use crate::common::{Address, ProxyEndpoint, ProxyScheme, Result, Stream};
use crate::error::Error;
use crate::transport::Transport;

use super::{HttpConnectConnector, ProxyConnector, Socks5Connector};

/// Dialer that routes connections through the configured proxy chain
pub struct ProxyChain {
    transport: Arc<dyn Transport>,
    proxies: Vec<(ProxyEndpoint, Box<dyn ProxyConnector>)>,
}

impl ProxyChain {
    pub fn new(endpoints: Vec<ProxyEndpoint>, transport: Arc<dyn Transport>) -> Self {
        let proxies = endpoints
            .into_iter()
            .map(|ep| {
                let connector: Box<dyn ProxyConnector> = match ep.scheme {
                    ProxyScheme::Socks5 => Box::new(Socks5Connector::new(
                        ep.username.clone(),
                        ep.password.clone(),
                    )),
                    ProxyScheme::Http => Box::new(HttpConnectConnector::new(
                        ep.username.clone(),
                        ep.password.clone(),
                    )),
                };
                (ep, connector)
            })
            .collect();

        Self { transport, proxies }
    }

    /// Whether any proxies are configured
    pub fn is_proxied(&self) -> bool {
        !self.proxies.is_empty()
    }

    /// Dial `target`, through the first reachable proxy when any are
    /// configured, directly otherwise.
    pub async fn dial(&self, target: &Address) -> Result<Stream> {
        if self.proxies.is_empty() {
            return self.transport.connect(target).await;
        }

        let mut last_err = None;
        for (endpoint, connector) in &self.proxies {
            match self.dial_via(endpoint, connector.as_ref(), target).await {
                Ok(stream) => {
                    debug!("dialed {} via {} proxy {}", target, connector.name(), endpoint);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("proxy {} unusable for {}: {}", endpoint, target, e);
                    last_err = Some(e);
                }
            }
        }

        Err(Error::Proxy(format!(
            "no reachable proxy for {} (last error: {})",
            target,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn dial_via(
        &self,
        endpoint: &ProxyEndpoint,
        connector: &dyn ProxyConnector,
        target: &Address,
    ) -> Result<Stream> {
        let stream = self.transport.connect(&endpoint.address()).await?;
        connector.connect_through(stream, target).await
    }
}
