//! Session lifecycle
//!
//! A [`RelaySession`] moves through Created → Started → Stopped →
//! Destroyed, strictly forward. Configuration is only accepted before
//! `start()`; a stopped session keeps serving frozen stats but can
//! never be restarted. `stop()` and `destroy()` are idempotent and
//! never fail.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{Address, ProxyEndpoint};
use crate::discovery::{self, DiscoveryClient, DEFAULT_DISCOVERY_URL};
use crate::error::{Error, Result};
use crate::mux::{HelloInfo, RelayStream};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::ProxyChain;
use crate::stats::{SessionCounters, StatsSnapshot};
use crate::transport::TcpTransport;

/// Bound on the blocking discovery fetch inside `start()`; beyond this
/// the session starts with an empty node set and lets the background
/// refresh catch up.
const START_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle states, strictly forward-moving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// Background machinery owned by a started session
struct SessionRuntime {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    pool: ConnectionPool,
}

/// One relay client session
pub struct RelaySession {
    device_id: String,
    state: SessionState,
    discovery_url: String,
    partner_id: Option<String>,
    proxies: Vec<ProxyEndpoint>,
    verbose: bool,
    counters: Arc<SessionCounters>,
    runtime: Option<SessionRuntime>,
}

impl RelaySession {
    /// Create a new session in the `Created` state
    pub fn create(verbose: bool) -> Result<Self> {
        let device_id = uuid::Uuid::new_v4().to_string();
        debug!("created session with device id {}", device_id);

        Ok(Self {
            device_id,
            state: SessionState::Created,
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            partner_id: None,
            proxies: Vec::new(),
            verbose,
            counters: Arc::new(SessionCounters::new()),
            runtime: None,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Reject configuration unless the session is still in `Created`
    fn check_configurable(&self) -> Result<()> {
        match self.state {
            SessionState::Created => Ok(()),
            SessionState::Destroyed => Err(Error::InvalidHandle),
            _ => Err(Error::AlreadyStarted),
        }
    }

    /// Override the discovery endpoint. Only valid before `start()`.
    pub fn set_discovery_url(&mut self, url: &str) -> Result<()> {
        self.check_configurable()?;
        if url.is_empty() {
            return Err(Error::NullParam);
        }
        self.discovery_url = url.to_string();
        Ok(())
    }

    /// Set the partner identifier. Only valid before `start()`.
    pub fn set_partner_id(&mut self, partner_id: &str) -> Result<()> {
        self.check_configurable()?;
        if partner_id.is_empty() {
            return Err(Error::NullParam);
        }
        self.partner_id = Some(partner_id.to_string());
        Ok(())
    }

    /// Add an upstream proxy. A URL that fails to parse leaves the
    /// already-accepted proxies untouched.
    pub fn add_proxy(&mut self, url: &str) -> Result<()> {
        self.check_configurable()?;
        if url.is_empty() {
            return Err(Error::NullParam);
        }
        let endpoint: ProxyEndpoint = url.parse()?;
        self.proxies.push(endpoint);
        Ok(())
    }

    /// Start the session: fetch an initial node set, then spawn the
    /// discovery refresh loop and the connection pool.
    ///
    /// Discovery being down is not fatal; the session starts with an
    /// empty node set and the refresh loop keeps retrying. A stopped
    /// session cannot be restarted.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Created => {}
            SessionState::Started => return Err(Error::AlreadyStarted),
            SessionState::Stopped => {
                return Err(Error::StartFailed("session cannot be restarted".into()))
            }
            SessionState::Destroyed => return Err(Error::InvalidHandle),
        }

        let client = DiscoveryClient::new(self.discovery_url.clone(), self.partner_id.clone())
            .map_err(|e| Error::StartFailed(format!("discovery client: {}", e)))?;

        self.counters.mark_started();

        let nodes = match tokio::time::timeout(START_FETCH_TIMEOUT, client.fetch()).await {
            Ok(Ok(nodes)) => {
                info!("initial discovery returned {} nodes", nodes.len());
                nodes
            }
            Ok(Err(e)) => {
                warn!("initial discovery fetch failed: {}", e);
                self.counters
                    .record_error(format!("discovery fetch failed: {}", e));
                Vec::new()
            }
            Err(_) => {
                warn!("initial discovery fetch timed out");
                self.counters
                    .record_error("discovery fetch timed out".to_string());
                Vec::new()
            }
        };
        discovery::publish_nodes(&self.counters, &nodes);

        let (shutdown_tx, _) = broadcast::channel(1);
        let (nodes_tx, nodes_rx) = watch::channel(nodes);

        let refresh = discovery::spawn_refresh(
            client,
            nodes_tx,
            self.counters.clone(),
            shutdown_tx.subscribe(),
        );

        let chain = Arc::new(ProxyChain::new(
            self.proxies.clone(),
            Arc::new(TcpTransport::new()),
        ));
        let hello = HelloInfo {
            device_id: self.device_id.clone(),
            partner_id: self.partner_id.clone(),
        };
        let (pool, pool_task) = ConnectionPool::spawn(
            PoolConfig::default(),
            chain,
            hello,
            self.counters.clone(),
            nodes_rx,
            shutdown_tx.subscribe(),
        );

        self.runtime = Some(SessionRuntime {
            shutdown_tx,
            tasks: vec![refresh, pool_task],
            pool,
        });
        self.state = SessionState::Started;
        info!("session {} started", self.device_id);
        Ok(())
    }

    /// Stop the session. Idempotent; a no-op unless currently started.
    /// Stats remain readable afterwards with the uptime frozen.
    pub async fn stop(&mut self) {
        if self.state != SessionState::Started {
            return;
        }

        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown_tx.send(());
            for task in runtime.tasks {
                let _ = task.await;
            }
            drop(runtime.pool);
        }

        self.counters.mark_stopped();
        self.state = SessionState::Stopped;
        info!("session {} stopped", self.device_id);
    }

    /// Destroy the session, stopping it first if needed. Idempotent.
    pub async fn destroy(&mut self) {
        if self.state == SessionState::Destroyed {
            return;
        }
        self.stop().await;
        self.runtime = None;
        self.state = SessionState::Destroyed;
        debug!("session {} destroyed", self.device_id);
    }

    /// Current stats snapshot.
    ///
    /// Fails with `NotStarted` before the first `start()` and with
    /// `InvalidHandle` after `destroy()`; a stopped session still
    /// serves its frozen counters.
    pub fn stats(&self) -> Result<StatsSnapshot> {
        match self.state {
            SessionState::Created => Err(Error::NotStarted),
            SessionState::Destroyed => Err(Error::InvalidHandle),
            _ => Ok(self.counters.snapshot()),
        }
    }

    /// Open a logical stream to `target` through a connected relay node
    pub async fn open_stream(&self, target: &Address) -> Result<RelayStream> {
        match self.state {
            SessionState::Started => {}
            SessionState::Destroyed => return Err(Error::InvalidHandle),
            _ => return Err(Error::NotStarted),
        }
        match &self.runtime {
            Some(runtime) => runtime.pool.open_stream(target).await,
            None => Err(Error::NotStarted),
        }
    }

    /// Number of relay nodes currently connected
    pub fn connected_count(&self) -> usize {
        self.runtime
            .as_ref()
            .map(|r| r.pool.connected_count())
            .unwrap_or(0)
    }
}
