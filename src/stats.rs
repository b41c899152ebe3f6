//! Session counters and stats snapshots
//!
//! Background tasks (discovery, pool workers, mux) publish into
//! `SessionCounters`; callers poll `snapshot()` which reads only cached
//! state. Scalars are atomics, the string and list fields sit behind
//! parking_lot locks so a snapshot never observes a torn update of an
//! individual field.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Live counter state shared between caller and background tasks
#[derive(Default)]
pub struct SessionCounters {
    started_at: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    frozen_uptime: AtomicI64,

    connected_nodes: AtomicI64,
    active_streams: AtomicI64,
    total_streams: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU64,

    last_error: Mutex<Option<String>>,
    node_addresses: RwLock<Vec<String>>,
    exit_points: RwLock<Vec<String>>,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the wall-clock start of the session
    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Instant::now());
    }

    /// Freeze the uptime clock; counters must not change afterwards
    pub fn mark_stopped(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.frozen_uptime
                .store(self.live_uptime(), Ordering::SeqCst);
        }
    }

    fn live_uptime(&self) -> i64 {
        self.started_at
            .lock()
            .map(|t| t.elapsed().as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> i64 {
        if self.stopped.load(Ordering::SeqCst) {
            self.frozen_uptime.load(Ordering::SeqCst)
        } else {
            self.live_uptime()
        }
    }

    pub fn stream_opened(&self) {
        self.total_streams.fetch_add(1, Ordering::Relaxed);
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn node_connected(&self) {
        self.connected_nodes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn node_disconnected(&self) {
        self.connected_nodes.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, msg: impl Into<String>) {
        *self.last_error.lock() = Some(msg.into());
    }

    /// Publish the latest discovered node view
    pub fn set_nodes(&self, addresses: Vec<String>, exit_points: Vec<String>) {
        *self.node_addresses.write() = addresses;
        *self.exit_points.write() = exit_points;
    }

    /// Build a consistent point-in-time snapshot from cached state
    pub fn snapshot(&self) -> StatsSnapshot {
        let connected_nodes = self.connected_nodes.load(Ordering::SeqCst).max(0) as i32;
        StatsSnapshot {
            connected: connected_nodes > 0,
            connected_nodes,
            uptime_seconds: self.uptime_seconds(),
            active_streams: self.active_streams.load(Ordering::Relaxed).max(0) as i32,
            total_streams: self.total_streams.load(Ordering::Relaxed) as i64,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed) as i64,
            bytes_received: self.bytes_received.load(Ordering::Relaxed) as i64,
            reconnect_count: self.reconnects.load(Ordering::Relaxed) as i64,
            last_error: self.last_error.lock().clone(),
            exit_points_json: to_json_list(&self.exit_points.read()),
            node_addresses_json: to_json_list(&self.node_addresses.read()),
        }
    }
}

fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Point-in-time immutable view of the session counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connected: bool,
    pub connected_nodes: i32,
    pub uptime_seconds: i64,
    pub active_streams: i32,
    pub total_streams: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub reconnect_count: i64,
    pub last_error: Option<String>,
    pub exit_points_json: String,
    pub node_addresses_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_counters() {
        let c = SessionCounters::new();
        c.stream_opened();
        c.stream_opened();
        c.stream_closed();

        let s = c.snapshot();
        assert_eq!(s.total_streams, 2);
        assert_eq!(s.active_streams, 1);
        assert!(s.active_streams as i64 <= s.total_streams);
    }

    #[test]
    fn test_connected_flag_tracks_nodes() {
        let c = SessionCounters::new();
        assert!(!c.snapshot().connected);

        c.node_connected();
        let s = c.snapshot();
        assert!(s.connected);
        assert_eq!(s.connected_nodes, 1);

        c.node_disconnected();
        assert!(!c.snapshot().connected);
    }

    #[test]
    fn test_monotonic_counters() {
        let c = SessionCounters::new();
        let mut prev_total = 0;
        let mut prev_reconnects = 0;
        for i in 0..10 {
            if i % 2 == 0 {
                c.stream_opened();
            } else {
                c.inc_reconnects();
                c.stream_closed();
            }
            let s = c.snapshot();
            assert!(s.total_streams >= prev_total);
            assert!(s.reconnect_count >= prev_reconnects);
            prev_total = s.total_streams;
            prev_reconnects = s.reconnect_count;
        }
    }

    #[test]
    fn test_node_lists_as_json() {
        let c = SessionCounters::new();
        c.set_nodes(
            vec!["1.2.3.4:443".into(), "relay.example.com:443".into()],
            vec!["de".into()],
        );

        let s = c.snapshot();
        assert_eq!(
            s.node_addresses_json,
            r#"["1.2.3.4:443","relay.example.com:443"]"#
        );
        assert_eq!(s.exit_points_json, r#"["de"]"#);
    }

    #[test]
    fn test_uptime_freezes_on_stop() {
        let c = SessionCounters::new();
        c.mark_started();
        c.mark_stopped();
        let first = c.snapshot().uptime_seconds;
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(c.snapshot().uptime_seconds, first);
    }

    #[test]
    fn test_last_error_recorded() {
        let c = SessionCounters::new();
        assert!(c.snapshot().last_error.is_none());
        c.record_error("connection to 1.2.3.4:443 lost");
        assert_eq!(
            c.snapshot().last_error.as_deref(),
            Some("connection to 1.2.3.4:443 lost")
        );
    }
}
