//! Discovery client
//!
//! Fetches the current relay node list from the discovery endpoint and
//! keeps it fresh in the background. Fetch failures never surface to
//! the caller as errors; they are recorded in the session counters and
//! retried with backoff, so `start()` is never blocked on discovery
//! beyond its initial bounded attempt.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{Address, Result};
use crate::pool::Backoff;
use crate::stats::SessionCounters;

/// Default production discovery endpoint
pub const DEFAULT_DISCOVERY_URL: &str = "https://api.prx.network/public/relay/nodes";

/// How often a healthy node list is refreshed
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Backoff bounds for failed fetches
const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(500);
const FETCH_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Per-request timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One relay node as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayNode {
    pub address: String,
    #[serde(default)]
    pub exit: Option<String>,
}

/// Wire shape of the discovery response; some deployments wrap the
/// array in a `nodes` object.
#[derive(Deserialize)]
#[serde(untagged)]
enum NodeListBody {
    Bare(Vec<RelayNode>),
    Wrapped { nodes: Vec<RelayNode> },
}

/// Parse a discovery response body, dropping entries whose address
/// does not parse as `host:port`.
pub fn parse_node_list(body: &str) -> Result<Vec<RelayNode>> {
    let body: NodeListBody = serde_json::from_str(body)?;
    let nodes = match body {
        NodeListBody::Bare(nodes) => nodes,
        NodeListBody::Wrapped { nodes } => nodes,
    };

    let mut valid = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node.address.parse::<Address>() {
            Ok(_) => valid.push(node),
            Err(_) => warn!("discovery returned unusable node address: {}", node.address),
        }
    }
    Ok(valid)
}

/// HTTP client for the discovery endpoint
pub struct DiscoveryClient {
    http: reqwest::Client,
    url: String,
    partner_id: Option<String>,
}

impl DiscoveryClient {
    pub fn new(url: String, partner_id: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("relay-leaf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            url,
            partner_id,
        })
    }

    /// Fetch the current node list once
    pub async fn fetch(&self) -> Result<Vec<RelayNode>> {
        let mut request = self.http.get(&self.url);
        if let Some(partner_id) = &self.partner_id {
            request = request.header("X-Partner-Id", partner_id);
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        let nodes = parse_node_list(&body)?;

        debug!("discovery returned {} nodes from {}", nodes.len(), self.url);
        Ok(nodes)
    }
}

/// Publish a node set into the counters' cached view
pub fn publish_nodes(counters: &SessionCounters, nodes: &[RelayNode]) {
    let addresses: Vec<String> = nodes.iter().map(|n| n.address.clone()).collect();
    let mut exit_points: Vec<String> = nodes.iter().filter_map(|n| n.exit.clone()).collect();
    exit_points.sort();
    exit_points.dedup();
    counters.set_nodes(addresses, exit_points);
}

/// Background refresh loop. Each successful fetch replaces the watched
/// node set wholesale, which is what evicts nodes that disappeared from
/// discovery.
pub fn spawn_refresh(
    client: DiscoveryClient,
    nodes_tx: watch::Sender<Vec<RelayNode>>,
    counters: Arc<SessionCounters>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(FETCH_BACKOFF_BASE, FETCH_BACKOFF_CAP);
        let mut delay = REFRESH_INTERVAL;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    debug!("discovery refresh loop shutting down");
                    return;
                }
            }

            match client.fetch().await {
                Ok(nodes) => {
                    info!("discovery refresh: {} nodes", nodes.len());
                    publish_nodes(&counters, &nodes);
                    let _ = nodes_tx.send(nodes);
                    backoff.reset();
                    delay = REFRESH_INTERVAL;
                }
                Err(e) => {
                    warn!("discovery fetch failed: {}", e);
                    counters.record_error(format!("discovery fetch failed: {}", e));
                    delay = backoff.next();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_array() {
        let nodes = parse_node_list(
            r#"[{"address": "1.2.3.4:443", "exit": "de"}, {"address": "relay.example.com:443"}]"#,
        )
        .unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].exit.as_deref(), Some("de"));
        assert!(nodes[1].exit.is_none());
    }

    #[test]
    fn test_parse_wrapped_object() {
        let nodes =
            parse_node_list(r#"{"nodes": [{"address": "5.6.7.8:8443"}]}"#).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "5.6.7.8:8443");
    }

    #[test]
    fn test_parse_drops_invalid_addresses() {
        let nodes = parse_node_list(
            r#"[{"address": "no-port"}, {"address": "ok.example.com:443"}]"#,
        )
        .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "ok.example.com:443");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_node_list("not json").is_err());
        assert!(parse_node_list(r#"{"unexpected": true}"#).is_err());
    }

    #[test]
    fn test_publish_nodes_dedupes_exits() {
        let counters = SessionCounters::new();
        let nodes = vec![
            RelayNode {
                address: "1.1.1.1:443".into(),
                exit: Some("de".into()),
            },
            RelayNode {
                address: "2.2.2.2:443".into(),
                exit: Some("de".into()),
            },
            RelayNode {
                address: "3.3.3.3:443".into(),
                exit: Some("us".into()),
            },
        ];
        publish_nodes(&counters, &nodes);

        let snap = counters.snapshot();
        assert_eq!(snap.exit_points_json, r#"["de","us"]"#);
        assert!(snap.node_addresses_json.contains("1.1.1.1:443"));
    }
}
