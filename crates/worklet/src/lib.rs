//! worklet: worker-side IPC bridge for manager/worker subprocess trees.
//!
//! A manager process spawns worker subprocesses and converses with each over
//! a local, bidirectional, message-oriented named channel. This crate is the
//! worker side: the connection state machine, framed message exchange, a
//! bounded connect-timeout handshake, and best-effort forwarding of the
//! worker's log output as protocol messages.

pub mod bridge;
mod client;
mod console;
mod error;
mod hooks;
mod semaphore;

pub use bridge::connection::{Connection, ConnectionState, ReceivePoll};
pub use bridge::message::{
    CONSOLE_HEADER_SIZE, CONSOLE_OUTPUT, ConsoleOutput, MAX_MESSAGE_SIZE, Message,
};
pub use bridge::transport::NamedChannelConnection;
pub use client::{
    DEBUG_CHANNEL_NAME, DEFAULT_CONNECT_TIMEOUT, LAUNCH_INFO_ENV, WorkerClient, WorkerOptions,
};
pub use console::{CONSOLE_STREAM_ERROR, CONSOLE_STREAM_OUT, ConsoleForwardLayer};
pub use error::{BridgeError, ClientError};
pub use hooks::{EventHook, HookGuard, LifecycleHooks};
pub use semaphore::Semaphore;
