//! Connection lifecycle and the abstract channel contract.

use async_trait::async_trait;
use tokio::sync::watch;

use super::message::Message;
use crate::error::BridgeError;

/// Lifecycle of a channel endpoint.
///
/// `Waiting -> Active` is driven asynchronously by the transport (connect
/// completion); any state can move to `Closing`/`Closed` via explicit teardown
/// or peer disconnect. A `Closed` connection is not reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channel opened, handshake incomplete.
    Waiting,
    /// Ready for send/receive.
    Active,
    /// Teardown in progress.
    Closing,
    /// Torn down or peer gone.
    Closed,
}

impl ConnectionState {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Result of one non-blocking receive poll.
#[derive(Debug)]
pub enum ReceivePoll {
    /// A fully-formed message was queued and ready.
    Message(Message),
    /// Nothing ready; the connection is still usable.
    Empty,
    /// The connection is done and its queue is drained.
    Disconnected,
}

/// An abstract bidirectional message channel with an explicit lifecycle.
///
/// Exactly one connection instance owns its underlying channel resources.
#[async_trait]
pub trait Connection: Send + Sync {
    /// One-time setup binding this endpoint to the named transport.
    ///
    /// Returns [`BridgeError::AlreadyInitialized`] on a second call. Connecting
    /// is asynchronous: immediately after this returns the state is typically
    /// [`ConnectionState::Waiting`].
    async fn initialize(
        &self,
        server: bool,
        display_name: &str,
        channel_name: &str,
    ) -> Result<(), BridgeError>;

    /// Current state. Non-blocking, always safe to call.
    fn state(&self) -> ConnectionState;

    /// Subscribe to state transitions (connect completion, teardown).
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Allocate a message with a zero-initialized payload of `size` bytes.
    ///
    /// Fails when the connection is torn down or `size` exceeds the frame
    /// limit; otherwise always succeeds.
    fn create_message(&self, id: u32, size: usize) -> Result<Message, BridgeError>;

    /// Transmit a whole framed message and return the post-send state.
    ///
    /// The frame is enqueued atomically with the `Active` check, so a send can
    /// never race into a half-closed channel. A non-`Active` return means the
    /// message was not delivered; it is dropped, never retried.
    fn send(&self, message: Message) -> ConnectionState;

    /// One non-blocking receive poll. Never blocks.
    ///
    /// Messages queued before a disconnect are still drained before
    /// [`ReceivePoll::Disconnected`] is reported.
    fn try_receive(&self) -> ReceivePoll;

    /// Tear the connection down.
    ///
    /// Idempotent and safe to call concurrently from multiple triggers; the
    /// underlying channel resources are released at most once.
    fn close(&self);
}
