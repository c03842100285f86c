//! Error types for the worker bridge.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Channel-level failures surfaced by connections and the wire codec.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// `initialize` called twice on the same connection.
    #[error("connection already initialized")]
    AlreadyInitialized,

    /// The connection has been torn down (or was never brought up).
    #[error("connection is not live")]
    NotConnected,

    /// Requested payload exceeds the frame limit.
    #[error("message of {size} bytes exceeds the frame limit")]
    MessageTooLarge { size: usize },

    /// A console-output payload that does not match the wire layout.
    #[error("malformed console payload: {0}")]
    MalformedConsolePayload(&'static str),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures surfaced by the worker client facade.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The manager never opened its end of the channel within the budget.
    #[error("timeout connecting to manager process after {waited:?}")]
    ConnectTimeout { waited: Duration },

    /// The channel closed before the handshake completed.
    #[error("channel closed before becoming active")]
    ChannelClosed,

    /// The launch-info document passed down by the manager did not parse.
    #[error("invalid launch info: {0}")]
    LaunchInfo(#[from] serde_json::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
