//! Stream multiplexer
//!
//! One `MuxConnection` per relay node connection. Logical streams are
//! multiplexed over it by stream id; a reader task routes incoming Data
//! frames to per-stream inboxes, a writer task serializes all outgoing
//! frames, and a keepalive task pings the node. Any frame resets the
//! idle clock; a connection silent beyond `IDLE_TIMEOUT` is torn down
//! and the owning pool worker observes that as a connection loss.

pub mod frame;

pub use frame::{read_frame, write_frame, Frame, FrameType, HelloInfo, MAX_PAYLOAD};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::common::{Address, Result, Stream};
use crate::error::Error;
use crate::stats::SessionCounters;

/// Keepalive ping cadence
const PING_INTERVAL: Duration = Duration::from_secs(15);
/// A connection with no inbound frame for this long is considered dead
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const WRITE_QUEUE_DEPTH: usize = 256;
const STREAM_INBOX_DEPTH: usize = 64;

/// State shared between the connection tasks and stream handles
struct MuxShared {
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    counters: Arc<SessionCounters>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl MuxShared {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Settle accounting for streams the caller still holds.
            // Dropping the senders makes every stream inbox report EOF.
            let orphaned = self.streams.lock().drain().count();
            for _ in 0..orphaned {
                self.counters.stream_closed();
            }
            self.closed_notify.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove a stream from the routing table. Returns true when this
    /// call took the entry, i.e. the caller owns the final decrement.
    fn release(&self, id: u32) -> bool {
        if self.streams.lock().remove(&id).is_some() {
            self.counters.stream_closed();
            true
        } else {
            false
        }
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            // Register the waiter before checking the flag, so a close
            // landing in between still wakes us.
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// A multiplexed connection to one relay node
pub struct MuxConnection {
    shared: Arc<MuxShared>,
    writer_tx: mpsc::Sender<Frame>,
    next_stream_id: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MuxConnection {
    /// Take ownership of a connected stream and start the connection
    /// tasks. The Hello frame goes out before anything else.
    pub fn spawn(stream: Stream, hello: HelloInfo, counters: Arc<SessionCounters>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        let shared = Arc::new(MuxShared {
            streams: Mutex::new(HashMap::new()),
            counters,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });

        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let tasks = vec![
            tokio::spawn(writer_loop(write_half, writer_rx, shared.clone(), hello)),
            tokio::spawn(reader_loop(read_half, writer_tx.clone(), shared.clone())),
            tokio::spawn(ping_loop(writer_tx.clone(), shared.clone())),
        ];

        Self {
            shared,
            writer_tx,
            next_stream_id: AtomicU32::new(1),
            tasks: Mutex::new(tasks),
        }
    }

    /// Open a logical stream toward `target` through this connection
    pub async fn open_stream(&self, target: &Address) -> Result<RelayStream> {
        if self.shared.is_closed() {
            return Err(Error::Protocol("relay connection closed".into()));
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_INBOX_DEPTH);
        // Count before inserting: every table entry has a matching
        // increment, so whoever removes the entry owns the decrement.
        self.shared.counters.stream_opened();
        self.shared.streams.lock().insert(id, tx);

        let open = Frame::open_stream(id, &target.to_string());
        if self.writer_tx.send(open).await.is_err() {
            // Either we still own the entry or a concurrent teardown
            // already settled it; both paths decrement exactly once.
            self.shared.release(id);
            return Err(Error::Protocol("relay connection closed".into()));
        }

        trace!("opened stream {} to {}", id, target);

        Ok(RelayStream {
            id,
            inbox: rx,
            writer_tx: self.writer_tx.clone(),
            shared: self.shared.clone(),
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the connection dies (peer close, idle timeout, error)
    pub async fn wait_closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Tear the connection down and join its tasks
    pub async fn shutdown(&self) {
        self.shared.mark_closed();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn writer_loop(
    mut write_half: WriteHalf<Stream>,
    mut writer_rx: mpsc::Receiver<Frame>,
    shared: Arc<MuxShared>,
    hello: HelloInfo,
) {
    match Frame::hello(&hello) {
        Ok(frame) => {
            if write_frame(&mut write_half, &frame).await.is_err() {
                shared.mark_closed();
                return;
            }
        }
        Err(e) => {
            warn!("failed to encode hello frame: {}", e);
            shared.mark_closed();
            return;
        }
    }

    loop {
        tokio::select! {
            maybe = writer_rx.recv() => {
                let frame = match maybe {
                    Some(f) => f,
                    None => break,
                };
                let data_len = match frame.frame_type {
                    FrameType::Data => frame.payload.len() as u64,
                    _ => 0,
                };
                if write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
                if data_len > 0 {
                    shared.counters.add_sent(data_len);
                }
            }
            _ = shared.wait_closed() => break,
        }
    }

    shared.mark_closed();
}

async fn reader_loop(
    mut read_half: ReadHalf<Stream>,
    writer_tx: mpsc::Sender<Frame>,
    shared: Arc<MuxShared>,
) {
    loop {
        let frame = match timeout(IDLE_TIMEOUT, read_frame(&mut read_half)).await {
            Err(_) => {
                debug!("relay connection idle for {:?}, dropping", IDLE_TIMEOUT);
                break;
            }
            Ok(Err(e)) => {
                trace!("relay connection read ended: {}", e);
                break;
            }
            Ok(Ok(frame)) => frame,
        };

        match frame.frame_type {
            FrameType::Ping => {
                if writer_tx.send(Frame::pong()).await.is_err() {
                    break;
                }
            }
            FrameType::Pong | FrameType::Hello => {}
            FrameType::Data => {
                shared.counters.add_received(frame.payload.len() as u64);
                let inbox = shared.streams.lock().get(&frame.stream_id).cloned();
                match inbox {
                    Some(inbox) => {
                        if inbox.send(frame.payload).await.is_err() {
                            // Receiver side is gone, tell the node
                            shared.release(frame.stream_id);
                            let _ = writer_tx.send(Frame::close_stream(frame.stream_id)).await;
                        }
                    }
                    None => {
                        let _ = writer_tx.send(Frame::close_stream(frame.stream_id)).await;
                    }
                }
            }
            FrameType::CloseStream => {
                shared.release(frame.stream_id);
            }
            FrameType::OpenStream => {
                // Node-initiated streams are not part of the leaf role
                let _ = writer_tx.send(Frame::close_stream(frame.stream_id)).await;
            }
        }
    }

    shared.mark_closed();
}

async fn ping_loop(writer_tx: mpsc::Sender<Frame>, shared: Arc<MuxShared>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if writer_tx.send(Frame::ping()).await.is_err() {
                    break;
                }
            }
            _ = shared.wait_closed() => break,
        }
    }
}

/// One logical stream over a relay connection
///
/// Closing (or dropping) the stream decrements the active-stream count
/// exactly once. If the owning connection is torn down first, the
/// teardown settles the count and a later close or drop of the handle
/// leaves the counters alone. The lifetime total is never decremented.
pub struct RelayStream {
    id: u32,
    inbox: mpsc::Receiver<Bytes>,
    writer_tx: mpsc::Sender<Frame>,
    shared: Arc<MuxShared>,
    closed: bool,
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RelayStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send data on this stream, chunked to the frame size limit
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Protocol("stream already closed".into()));
        }
        for chunk in data.chunks(MAX_PAYLOAD) {
            let frame = Frame::data(self.id, Bytes::copy_from_slice(chunk));
            self.writer_tx
                .send(frame)
                .await
                .map_err(|_| Error::Protocol("relay connection closed".into()))?;
        }
        Ok(())
    }

    /// Receive the next data chunk; `None` means the stream is closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbox.recv().await
    }

    /// Close the stream, notifying the node
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if self.shared.release(self.id) {
                let _ = self.writer_tx.send(Frame::close_stream(self.id)).await;
            }
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if self.shared.release(self.id) {
                let _ = self.writer_tx.try_send(Frame::close_stream(self.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::time::{sleep, Duration};

    fn hello() -> HelloInfo {
        HelloInfo {
            device_id: "test-device".into(),
            partner_id: None,
        }
    }

    /// Frame-level echo peer: replies to Ping, echoes Data back on the
    /// same stream id, ignores everything else.
    async fn echo_peer(mut io: DuplexStream) {
        let (mut rh, mut wh) = tokio::io::split(&mut io);
        while let Ok(frame) = read_frame(&mut rh).await {
            match frame.frame_type {
                FrameType::Ping => {
                    if write_frame(&mut wh, &Frame::pong()).await.is_err() {
                        break;
                    }
                }
                FrameType::Data => {
                    let echo = Frame::data(frame.stream_id, frame.payload);
                    if write_frame(&mut wh, &echo).await.is_err() {
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_stream_echo_and_counters() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(echo_peer(server_io));

        let counters = Arc::new(SessionCounters::new());
        let conn = MuxConnection::spawn(Box::new(client_io), hello(), counters.clone());

        let target: Address = "10.0.0.9:443".parse().unwrap();
        let mut stream = conn.open_stream(&target).await.unwrap();
        stream.send(b"payload").await.unwrap();

        let echoed = stream.recv().await.unwrap();
        assert_eq!(&echoed[..], b"payload");

        let snap = counters.snapshot();
        assert_eq!(snap.total_streams, 1);
        assert_eq!(snap.active_streams, 1);
        assert!(snap.bytes_sent >= 7);
        assert!(snap.bytes_received >= 7);
        assert!(snap.active_streams as i64 <= snap.total_streams);

        stream.close().await;
        assert_eq!(counters.snapshot().active_streams, 0);
        assert_eq!(counters.snapshot().total_streams, 1);

        conn.shutdown().await;
        peer.abort();
    }

    #[tokio::test]
    async fn test_drop_decrements_active_once() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let peer = tokio::spawn(echo_peer(server_io));

        let counters = Arc::new(SessionCounters::new());
        let conn = MuxConnection::spawn(Box::new(client_io), hello(), counters.clone());

        let target: Address = "10.0.0.9:443".parse().unwrap();
        let stream = conn.open_stream(&target).await.unwrap();
        assert_eq!(counters.snapshot().active_streams, 1);

        drop(stream);
        assert_eq!(counters.snapshot().active_streams, 0);
        assert_eq!(counters.snapshot().total_streams, 1);

        conn.shutdown().await;
        peer.abort();
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_connection() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let counters = Arc::new(SessionCounters::new());
        let conn = MuxConnection::spawn(Box::new(client_io), hello(), counters.clone());

        let target: Address = "10.0.0.9:443".parse().unwrap();
        let mut stream = conn.open_stream(&target).await.unwrap();

        drop(server_io);

        // Reader sees EOF, connection closes, stream inbox drains to EOF
        tokio::time::timeout(Duration::from_secs(2), conn.wait_closed())
            .await
            .expect("connection did not close");
        assert!(conn.is_closed());
        assert!(stream.recv().await.is_none());

        // New streams are refused on a dead connection
        assert!(conn.open_stream(&target).await.is_err());

        conn.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_closed_sees_concurrent_close() {
        // Waiter and closer race on separate threads; every round must
        // finish, whichever side wins the flag check.
        for _ in 0..500 {
            let shared = Arc::new(MuxShared {
                streams: Mutex::new(HashMap::new()),
                counters: Arc::new(SessionCounters::new()),
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
            });

            let waiter = {
                let shared = shared.clone();
                tokio::spawn(async move { shared.wait_closed().await })
            };
            let closer = {
                let shared = shared.clone();
                tokio::spawn(async move { shared.mark_closed() })
            };

            tokio::time::timeout(Duration::from_secs(1), async {
                waiter.await.unwrap();
                closer.await.unwrap();
            })
            .await
            .expect("close notification was missed");
        }
    }

    #[tokio::test]
    async fn test_drop_after_connection_close_leaves_counters_settled() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let counters = Arc::new(SessionCounters::new());
        let conn = MuxConnection::spawn(Box::new(client_io), hello(), counters.clone());

        let target: Address = "10.0.0.9:443".parse().unwrap();
        let stream = conn.open_stream(&target).await.unwrap();
        assert_eq!(counters.snapshot().active_streams, 1);

        // Connection teardown settles the accounting for open handles
        conn.shutdown().await;
        assert_eq!(counters.snapshot().active_streams, 0);

        // A handle dropped after teardown must not decrement again
        drop(stream);
        assert_eq!(counters.snapshot().active_streams, 0);
        assert_eq!(counters.snapshot().total_streams, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let counters = Arc::new(SessionCounters::new());
        let conn = MuxConnection::spawn(Box::new(client_io), hello(), counters);

        conn.shutdown().await;
        conn.shutdown().await;
        assert!(conn.is_closed());
        // Give aborted tasks a moment to unwind
        sleep(Duration::from_millis(10)).await;
    }
}
