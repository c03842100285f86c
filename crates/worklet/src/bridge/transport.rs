//! Named-channel connection over local Unix sockets.
//!
//! Socket path format: `{root}/{channel_name}.sock` (root defaults to the OS
//! temp dir). The manager derives the same channel name from the worker's
//! process id, so both sides rendezvous without a discovery step.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::MessageCodec;
use super::connection::{Connection, ConnectionState, ReceivePoll};
use super::message::{MAX_MESSAGE_SIZE, Message};
use crate::error::BridgeError;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A concrete [`Connection`] bound to a named local socket.
///
/// The client role retries its connect while the state stays `Waiting`; the
/// server role binds the listener and accepts exactly one peer. Once the
/// stream is up, a reader task and a writer task own its two halves: the
/// writer drains an ordered queue (send order equals delivery order) and the
/// reader queues inbound messages for [`Connection::try_receive`].
pub struct NamedChannelConnection {
    shared: Arc<Shared>,
}

struct Shared {
    root: PathBuf,
    initialized: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    /// Present only while the channel is usable; taken on teardown. Holding
    /// this lock while checking the state makes check-and-send atomic.
    outbound: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound_tx: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound_rx: StdMutex<mpsc::UnboundedReceiver<Message>>,
    /// Socket file to unlink on teardown (server role only).
    unlink_path: StdMutex<Option<PathBuf>>,
    label: StdMutex<String>,
}

impl NamedChannelConnection {
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir())
    }

    /// Use a custom socket root instead of the OS temp dir.
    pub fn with_root(root: PathBuf) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Waiting);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                root,
                initialized: AtomicBool::new(false),
                state_tx,
                outbound: StdMutex::new(None),
                inbound_tx: StdMutex::new(Some(inbound_tx)),
                inbound_rx: StdMutex::new(inbound_rx),
                unlink_path: StdMutex::new(None),
                label: StdMutex::new(String::new()),
            }),
        }
    }

    /// Filesystem path backing a channel name under this connection's root.
    pub fn socket_path(&self, channel_name: &str) -> PathBuf {
        self.shared.root.join(format!("{}.sock", channel_name))
    }
}

impl Default for NamedChannelConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for NamedChannelConnection {
    async fn initialize(
        &self,
        server: bool,
        display_name: &str,
        channel_name: &str,
    ) -> Result<(), BridgeError> {
        if self.shared.initialized.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyInitialized);
        }

        let path = self.socket_path(channel_name);
        *lock(&self.shared.label) = display_name.to_string();
        tracing::debug!(
            display = display_name,
            channel = channel_name,
            path = %path.display(),
            server,
            "Initializing named channel"
        );

        if server {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let std_listener = std::os::unix::net::UnixListener::bind(&path)?;
            std_listener.set_nonblocking(true)?;
            let listener = UnixListener::from_std(std_listener)?;

            *lock(&self.shared.unlink_path) = Some(path);

            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut state_rx = shared.state_tx.subscribe();
                tokio::select! {
                    biased;
                    _ = state_rx.wait_for(|s| s.is_terminal()) => {}
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => start_io(shared, stream),
                        Err(e) => {
                            tracing::warn!(error = %e, "Channel accept failed");
                            shared.mark_disconnected();
                        }
                    }
                }
            });
        } else {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut state_rx = shared.state_tx.subscribe();
                loop {
                    tokio::select! {
                        biased;
                        // Discard the `watch::Ref` inside the future: holding it in
                        // the select output across the retry sleep makes the task
                        // future non-Send.
                        _ = async { let _ = state_rx.wait_for(|s| s.is_terminal()).await; } => return,
                        connected = UnixStream::connect(&path) => match connected {
                            Ok(stream) => {
                                start_io(shared, stream);
                                return;
                            }
                            // Listener not up yet; the manager may still be opening
                            // its end. Keep retrying until teardown.
                            Err(_) => tokio::time::sleep(CONNECT_RETRY_INTERVAL).await,
                        }
                    }
                }
            });
        }

        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    fn create_message(&self, id: u32, size: usize) -> Result<Message, BridgeError> {
        if size > MAX_MESSAGE_SIZE {
            return Err(BridgeError::MessageTooLarge { size });
        }
        if self.shared.state().is_terminal() {
            return Err(BridgeError::NotConnected);
        }
        Ok(Message::new(id, size))
    }

    fn send(&self, message: Message) -> ConnectionState {
        let guard = lock(&self.shared.outbound);
        let state = self.shared.state();
        if !state.is_active() {
            return state;
        }
        let Some(tx) = guard.as_ref() else {
            return state;
        };
        if tx.send(message).is_err() {
            drop(guard);
            self.shared.mark_disconnected();
        }
        self.shared.state()
    }

    fn try_receive(&self) -> ReceivePoll {
        match lock(&self.shared.inbound_rx).try_recv() {
            Ok(message) => ReceivePoll::Message(message),
            Err(TryRecvError::Empty) => ReceivePoll::Empty,
            Err(TryRecvError::Disconnected) => ReceivePoll::Disconnected,
        }
    }

    fn close(&self) {
        let mut outbound = lock(&self.shared.outbound);
        let first = self.shared.state_tx.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = ConnectionState::Closing;
                true
            }
        });
        if !first {
            return;
        }
        // Dropping the senders ends the writer task (after it flushes the
        // queue) and lets receive polls report Disconnected once drained.
        outbound.take();
        drop(outbound);
        lock(&self.shared.inbound_tx).take();
        self.shared.unlink_socket();
        self.shared.state_tx.send_replace(ConnectionState::Closed);
        tracing::debug!(display = %lock(&self.shared.label), "Channel closed");
    }
}

impl Drop for NamedChannelConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Transport-observed teardown (peer gone, write failure).
    fn mark_disconnected(&self) {
        let changed = self.state_tx.send_if_modified(|s| {
            if *s == ConnectionState::Closed {
                false
            } else {
                *s = ConnectionState::Closed;
                true
            }
        });
        if changed {
            lock(&self.outbound).take();
            lock(&self.inbound_tx).take();
            self.unlink_socket();
            tracing::debug!(display = %lock(&self.label), "Channel peer disconnected");
        }
    }

    fn unlink_socket(&self) {
        if let Some(path) = lock(&self.unlink_path).take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to unlink socket");
            }
        }
    }
}

/// Activate the connection and hand the stream halves to the I/O tasks.
fn start_io(shared: Arc<Shared>, stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    {
        // Under the outbound lock so activation cannot race a concurrent close.
        let mut outbound = lock(&shared.outbound);
        if shared.state() != ConnectionState::Waiting {
            return;
        }
        *outbound = Some(out_tx);
        shared.state_tx.send_replace(ConnectionState::Active);
    }
    tracing::debug!(display = %lock(&shared.label), "Channel active");

    let writer_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, MessageCodec::new());
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = framed.send(message).await {
                tracing::warn!(error = %e, "Channel write failed");
                writer_shared.mark_disconnected();
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut framed = FramedRead::new(read_half, MessageCodec::new());
        let mut state_rx = shared.state_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = state_rx.wait_for(|s| s.is_terminal()) => break,
                frame = framed.next() => match frame {
                    Some(Ok(message)) => {
                        let tx = lock(&shared.inbound_tx).clone();
                        match tx {
                            Some(tx) => {
                                let _ = tx.send(message);
                            }
                            None => break,
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Channel read failed");
                        shared.mark_disconnected();
                        break;
                    }
                    None => {
                        shared.mark_disconnected();
                        break;
                    }
                }
            }
        }
    });
}

/// Std mutexes here are poison-tolerant: teardown may run from a panicking
/// thread's hooks and must still observe "already cleaned up" safely.
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn active_pair(dir: &tempfile::TempDir) -> (NamedChannelConnection, NamedChannelConnection) {
        let server = NamedChannelConnection::with_root(dir.path().to_path_buf());
        let client = NamedChannelConnection::with_root(dir.path().to_path_buf());
        server.initialize(true, "test manager", "pair").await.unwrap();
        client.initialize(false, "test worker", "pair").await.unwrap();

        let mut rx = client.watch_state();
        rx.wait_for(|s| s.is_active()).await.unwrap();
        let mut rx = server.watch_state();
        rx.wait_for(|s| s.is_active()).await.unwrap();
        (server, client)
    }

    async fn recv(conn: &NamedChannelConnection) -> Option<Message> {
        loop {
            match conn.try_receive() {
                ReceivePoll::Message(msg) => return Some(msg),
                ReceivePoll::Disconnected => return None,
                ReceivePoll::Empty => tokio::task::yield_now().await,
            }
        }
    }

    #[tokio::test]
    async fn pair_exchanges_messages_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = active_pair(&dir).await;

        let mut msg = client.create_message(10, 3).unwrap();
        msg.payload_mut().copy_from_slice(b"abc");
        assert_eq!(client.send(msg), ConnectionState::Active);

        let received = recv(&server).await.unwrap();
        assert_eq!(received.id(), 10);
        assert_eq!(received.payload(), b"abc");

        let reply = server.create_message(11, 0).unwrap();
        assert_eq!(server.send(reply), ConnectionState::Active);
        let received = recv(&client).await.unwrap();
        assert_eq!(received.id(), 11);
        assert_eq!(received.len(), 0);
    }

    #[tokio::test]
    async fn send_before_active_reports_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let client = NamedChannelConnection::with_root(dir.path().to_path_buf());
        client.initialize(false, "test worker", "nobody").await.unwrap();

        let msg = client.create_message(1, 0).unwrap();
        assert_eq!(client.send(msg), ConnectionState::Waiting);
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let conn = NamedChannelConnection::with_root(dir.path().to_path_buf());
        conn.initialize(false, "test worker", "twice").await.unwrap();
        let err = conn.initialize(false, "test worker", "twice").await.unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observed_by_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = active_pair(&dir).await;

        client.close();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);

        let msg = Message::new(1, 0);
        assert_eq!(client.send(msg), ConnectionState::Closed);

        // Peer sees EOF and winds down.
        let mut rx = server.watch_state();
        rx.wait_for(|s| *s == ConnectionState::Closed).await.unwrap();
        assert!(matches!(server.try_receive(), ReceivePoll::Disconnected));
    }

    #[tokio::test]
    async fn queued_messages_drain_after_peer_close() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = active_pair(&dir).await;

        let mut msg = client.create_message(5, 4).unwrap();
        msg.payload_mut().copy_from_slice(b"last");
        assert_eq!(client.send(msg), ConnectionState::Active);

        let received = recv(&server).await.unwrap();
        client.close();
        assert_eq!(received.payload(), b"last");
        assert!(recv(&server).await.is_none());
    }

    #[tokio::test]
    async fn server_unlinks_socket_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let (server, client) = active_pair(&dir).await;
        let path = server.socket_path("pair");
        assert!(path.exists());
        server.close();
        assert!(!path.exists());
        drop(client);
    }

    #[tokio::test]
    async fn create_message_rejects_oversized_payload() {
        let dir = tempfile::tempdir().unwrap();
        let conn = NamedChannelConnection::with_root(dir.path().to_path_buf());
        let err = conn.create_message(1, MAX_MESSAGE_SIZE + 1).unwrap_err();
        assert!(matches!(err, BridgeError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn create_message_fails_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let conn = NamedChannelConnection::with_root(dir.path().to_path_buf());
        conn.close();
        let err = conn.create_message(1, 8).unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }
}
