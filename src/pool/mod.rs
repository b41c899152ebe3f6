//! Connection pool
//!
//! Keeps live multiplexed connections to a subset of the discovered
//! relay nodes. A supervisor task reconciles workers against the latest
//! discovery set: nodes that disappeared are evicted, replacements are
//! picked at random up to the target count. Each worker owns one node's
//! reconnect loop; connection health itself (keepalive, idle eviction)
//! lives in the mux layer, a dead connection simply surfaces here as a
//! loss.

mod backoff;

pub use backoff::Backoff;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{Address, Result};
use crate::discovery::RelayNode;
use crate::error::Error;
use crate::mux::{HelloInfo, MuxConnection, RelayStream};
use crate::proxy::ProxyChain;
use crate::stats::SessionCounters;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How many nodes to hold connections to
    pub target_nodes: usize,
    /// Reconnect backoff bounds
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_nodes: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    chain: Arc<ProxyChain>,
    hello: HelloInfo,
    counters: Arc<SessionCounters>,
    /// Live connections by node address
    conns: Mutex<HashMap<String, Arc<MuxConnection>>>,
}

/// Pool of multiplexed relay node connections
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

struct WorkerHandle {
    /// Dropping this sender tells the worker to stop
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl ConnectionPool {
    /// Start the pool supervisor. It follows `nodes_rx` until the
    /// shutdown broadcast fires, then stops and joins every worker
    /// before the returned handle resolves.
    pub fn spawn(
        config: PoolConfig,
        chain: Arc<ProxyChain>,
        hello: HelloInfo,
        counters: Arc<SessionCounters>,
        nodes_rx: watch::Receiver<Vec<RelayNode>>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(PoolShared {
            config,
            chain,
            hello,
            counters,
            conns: Mutex::new(HashMap::new()),
        });

        let handle = tokio::spawn(supervisor(shared.clone(), nodes_rx, shutdown_rx));

        (Self { shared }, handle)
    }

    /// Open a logical stream via a randomly chosen live connection
    pub async fn open_stream(&self, target: &Address) -> Result<RelayStream> {
        let conn = {
            let conns = self.shared.conns.lock();
            let live: Vec<_> = conns.values().filter(|c| !c.is_closed()).cloned().collect();
            if live.is_empty() {
                None
            } else {
                let idx = rand::thread_rng().gen_range(0..live.len());
                Some(live[idx].clone())
            }
        };

        match conn {
            Some(conn) => conn.open_stream(target).await,
            None => Err(Error::Internal("no connected relay node".into())),
        }
    }

    /// Number of currently live connections
    pub fn connected_count(&self) -> usize {
        self.shared
            .conns
            .lock()
            .values()
            .filter(|c| !c.is_closed())
            .count()
    }
}

async fn supervisor(
    shared: Arc<PoolShared>,
    mut nodes_rx: watch::Receiver<Vec<RelayNode>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut workers: HashMap<String, WorkerHandle> = HashMap::new();
    let mut retired: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let nodes = nodes_rx.borrow().clone();
        reconcile(&shared, &mut workers, &mut retired, nodes);
        retired.retain(|h| !h.is_finished());

        tokio::select! {
            changed = nodes_rx.changed() => {
                if changed.is_err() {
                    // Discovery is gone; hold current workers until shutdown
                    let _ = shutdown_rx.recv().await;
                    break;
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    debug!("pool supervisor shutting down {} workers", workers.len());
    for (_, worker) in workers.drain() {
        drop(worker.stop_tx);
        retired.push(worker.handle);
    }
    for handle in retired {
        let _ = handle.await;
    }
}

fn reconcile(
    shared: &Arc<PoolShared>,
    workers: &mut HashMap<String, WorkerHandle>,
    retired: &mut Vec<JoinHandle<()>>,
    nodes: Vec<RelayNode>,
) {
    let desired: HashSet<&str> = nodes.iter().map(|n| n.address.as_str()).collect();

    // Evict workers whose node vanished from the latest discovery set
    let gone: Vec<String> = workers
        .keys()
        .filter(|addr| !desired.contains(addr.as_str()))
        .cloned()
        .collect();
    for addr in gone {
        if let Some(worker) = workers.remove(&addr) {
            debug!("evicting relay node {} (absent from discovery)", addr);
            drop(worker.stop_tx);
            retired.push(worker.handle);
        }
    }

    // Fill up to the target with randomly chosen new nodes
    let mut candidates: Vec<&RelayNode> = nodes
        .iter()
        .filter(|n| !workers.contains_key(&n.address))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());

    for node in candidates {
        if workers.len() >= shared.config.target_nodes {
            break;
        }
        let addr: Address = match node.address.parse() {
            Ok(addr) => addr,
            Err(_) => continue,
        };

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(node_worker(shared.clone(), node.clone(), addr, stop_rx));
        workers.insert(node.address.clone(), WorkerHandle { stop_tx, handle });
    }
}

/// Reconnect loop for one relay node
async fn node_worker(
    shared: Arc<PoolShared>,
    node: RelayNode,
    addr: Address,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut backoff = Backoff::new(shared.config.backoff_base, shared.config.backoff_cap);
    let mut ever_connected = false;

    loop {
        let stream = tokio::select! {
            result = shared.chain.dial(&addr) => match result {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!("dial {} failed: {}", node.address, e);
                    shared.counters.record_error(format!("connect to {} failed: {}", node.address, e));
                    if ever_connected {
                        shared.counters.inc_reconnects();
                    }
                    None
                }
            },
            _ = stop_rx.recv() => return,
        };

        if let Some(stream) = stream {
            let conn = Arc::new(MuxConnection::spawn(
                stream,
                shared.hello.clone(),
                shared.counters.clone(),
            ));
            shared
                .conns
                .lock()
                .insert(node.address.clone(), conn.clone());
            shared.counters.node_connected();
            info!("connected to relay node {}", node.address);
            ever_connected = true;
            backoff.reset();

            let stopping = tokio::select! {
                _ = conn.wait_closed() => false,
                _ = stop_rx.recv() => true,
            };

            shared.conns.lock().remove(&node.address);
            shared.counters.node_disconnected();
            conn.shutdown().await;

            if stopping {
                return;
            }

            warn!("connection to relay node {} lost", node.address);
            shared
                .counters
                .record_error(format!("connection to {} lost", node.address));
            shared.counters.inc_reconnects();
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff.next()) => {}
            _ = stop_rx.recv() => return,
        }
    }
}
