//! Worker-side client facade.
//!
//! Owns the one connection a worker process holds to its manager: performs
//! the bounded-wait handshake, routes shutdown and fatal-termination events
//! to teardown, and exposes the send/receive surface application code uses.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;

use crate::bridge::connection::{Connection, ConnectionState, ReceivePoll};
use crate::bridge::message::{CONSOLE_OUTPUT, ConsoleOutput, Message};
use crate::bridge::transport::NamedChannelConnection;
use crate::console::ConsoleForwardLayer;
use crate::error::ClientError;
use crate::hooks::{HookGuard, LifecycleHooks};

/// Fixed channel name used when the debug flag is set; the manager attaches
/// to it without knowing the worker's pid.
pub const DEBUG_CHANNEL_NAME: &str = "worker_debug";

/// Budget for the connect handshake unless overridden or waived.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable carrying the launch-info document from the manager.
pub const LAUNCH_INFO_ENV: &str = "WORKLET_LAUNCH_INFO";

/// Launch contract passed down by the manager when spawning the worker.
///
/// The core consumes two booleans; everything else is local tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Use [`DEBUG_CHANNEL_NAME`] instead of the pid-derived channel name.
    pub debug: bool,
    /// Wait indefinitely for the manager instead of failing on the budget.
    pub wait_forever: bool,
    /// Override the handshake budget. Ignored when `wait_forever` is set.
    #[serde(skip)]
    pub connect_timeout: Option<Duration>,
    /// Override the socket root (tests); defaults to the OS temp dir.
    #[serde(skip)]
    pub channel_root: Option<PathBuf>,
}

impl WorkerOptions {
    /// Read the launch-info document the manager placed in the environment.
    ///
    /// An absent variable means default options; a malformed document is an
    /// error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ClientError> {
        match std::env::var(LAUNCH_INFO_ENV) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Channel name the manager independently computes to rendezvous:
    /// the debug name, or `worker_` + the hex process id.
    pub fn channel_name(&self) -> String {
        if self.debug {
            DEBUG_CHANNEL_NAME.to_string()
        } else {
            format!("worker_{:x}", std::process::id())
        }
    }
}

struct ClientInner {
    connection: StdMutex<Option<Arc<dyn Connection>>>,
    dropped_console: AtomicU64,
    hook_guards: StdMutex<Vec<HookGuard>>,
}

/// Handle to the worker process's connection to its manager.
///
/// Cloneable; all clones share the one connection. Teardown may be triggered
/// from an explicit [`cleanup`](Self::cleanup) call, the graceful-shutdown
/// hook, or the fatal-termination hook - whichever runs first closes the
/// channel, the rest observe "already cleaned up".
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient").finish_non_exhaustive()
    }
}

impl WorkerClient {
    /// Bring up the connection to the manager.
    ///
    /// Creates a named-channel connection under the derived channel name and
    /// waits for it to become active: bounded by the timeout budget, or
    /// indefinitely when the launcher asked for that. On timeout the worker
    /// must not proceed; the error says so and the half-open channel is torn
    /// down.
    pub async fn initialize(
        options: WorkerOptions,
        hooks: &LifecycleHooks,
    ) -> Result<Self, ClientError> {
        let connection = match &options.channel_root {
            Some(root) => NamedChannelConnection::with_root(root.clone()),
            None => NamedChannelConnection::new(),
        };
        let channel_name = options.channel_name();
        connection
            .initialize(false, "worker process connection", &channel_name)
            .await?;
        let connection: Arc<dyn Connection> = Arc::new(connection);

        let budget = if options.wait_forever {
            None
        } else {
            Some(options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
        };

        let mut state_rx = connection.watch_state();
        let settled = state_rx.wait_for(|s| *s != ConnectionState::Waiting);
        let state = match budget {
            None => settled.await.map(|s| *s),
            Some(budget) => match tokio::time::timeout(budget, settled).await {
                Ok(result) => result.map(|s| *s),
                Err(_) => {
                    connection.close();
                    tracing::error!(
                        channel = %channel_name,
                        waited = ?budget,
                        "Timeout connecting to manager process"
                    );
                    return Err(ClientError::ConnectTimeout { waited: budget });
                }
            },
        };
        let state = state.unwrap_or(ConnectionState::Closed);
        if !state.is_active() {
            connection.close();
            tracing::error!(channel = %channel_name, ?state, "Channel closed before the manager connected");
            return Err(ClientError::ChannelClosed);
        }
        tracing::debug!(channel = %channel_name, "Connected to manager process");

        let client = Self {
            inner: Arc::new(ClientInner {
                connection: StdMutex::new(Some(connection)),
                dropped_console: AtomicU64::new(0),
                hook_guards: StdMutex::new(Vec::new()),
            }),
        };

        // Both lifecycle triggers route to cleanup. The callbacks hold weak
        // references so the subscriptions do not keep the client alive.
        let mut guards = Vec::new();
        let weak = Arc::downgrade(&client.inner);
        guards.push(hooks.on_shutdown(move || cleanup_weak(&weak)));
        let weak = Arc::downgrade(&client.inner);
        guards.push(hooks.on_terminate(move || cleanup_weak(&weak)));
        *lock(&client.inner.hook_guards) = guards;

        Ok(client)
    }

    /// Release the connection to the manager. No-op when already cleaned up.
    pub fn cleanup(&self) {
        let taken = lock(&self.inner.connection).take();
        if let Some(connection) = taken {
            connection.close();
            tracing::debug!("Worker connection released");
        }
        lock(&self.inner.hook_guards).clear();
    }

    /// Send one message with the given id and payload.
    ///
    /// Returns `false` without sending when there is no connection or it is
    /// not active; otherwise reports whether the post-send state was still
    /// active. Undelivered messages are dropped, never retried.
    pub fn send(&self, id: u32, payload: &[u8]) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        if !connection.state().is_active() {
            return false;
        }
        let Ok(mut message) = connection.create_message(id, payload.len()) else {
            return false;
        };
        if !payload.is_empty() {
            message.payload_mut().copy_from_slice(payload);
        }
        connection.send(message).is_active()
    }

    /// Poll for one message from the manager.
    ///
    /// With `wait` set, spins (yielding between polls) until a message
    /// arrives or the connection stops being active; returns `None` if the
    /// connection died. Messages queued before a disconnect are still
    /// returned.
    pub async fn receive(&self, wait: bool) -> Option<Message> {
        let connection = self.connection()?;
        loop {
            match connection.try_receive() {
                ReceivePoll::Message(message) => return Some(message),
                ReceivePoll::Disconnected => return None,
                ReceivePoll::Empty => {
                    if !wait || !connection.state().is_active() {
                        return None;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Forward one log statement to the manager as a console-output message.
    ///
    /// Best-effort: with the connection missing or not active the statement
    /// is dropped (and counted), never queued or retried. Must not block or
    /// fail the worker.
    pub fn forward_console(&self, output: &ConsoleOutput) {
        let Some(connection) = self.connection() else {
            self.note_dropped_console();
            return;
        };
        if !connection.state().is_active() {
            self.note_dropped_console();
            return;
        }
        let Ok(mut message) = connection.create_message(CONSOLE_OUTPUT, output.encoded_len())
        else {
            self.note_dropped_console();
            return;
        };
        output.write_to(message.payload_mut());
        if !connection.send(message).is_active() {
            self.note_dropped_console();
        }
    }

    /// Tracing layer that forwards this process's log output to the manager.
    pub fn console_layer(&self) -> ConsoleForwardLayer {
        ConsoleForwardLayer::new(self.clone())
    }

    /// Console messages dropped because the channel was down. Forwarding is
    /// best-effort by design; this makes the drops observable.
    pub fn dropped_console_messages(&self) -> u64 {
        self.inner.dropped_console.load(Ordering::Relaxed)
    }

    /// Current connection state, [`ConnectionState::Closed`] after cleanup.
    pub fn state(&self) -> ConnectionState {
        match self.connection() {
            Some(connection) => connection.state(),
            None => ConnectionState::Closed,
        }
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        lock(&self.inner.connection).clone()
    }

    fn note_dropped_console(&self) {
        self.inner.dropped_console.fetch_add(1, Ordering::Relaxed);
    }
}

fn cleanup_weak(inner: &Weak<ClientInner>) {
    if let Some(inner) = inner.upgrade() {
        WorkerClient { inner }.cleanup();
    }
}

/// Cleanup may run from a panicking thread's termination hook; a poisoned
/// lock must still yield the connection so it is closed exactly once.
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_debug_mode() {
        let options = WorkerOptions {
            debug: true,
            ..Default::default()
        };
        assert_eq!(options.channel_name(), DEBUG_CHANNEL_NAME);
    }

    #[test]
    fn channel_name_derives_from_pid() {
        let options = WorkerOptions::default();
        assert_eq!(
            options.channel_name(),
            format!("worker_{:x}", std::process::id())
        );
    }

    #[test]
    fn launch_info_parses_flags() {
        let options: WorkerOptions =
            serde_json::from_str(r#"{"debug": true, "wait_forever": true}"#).unwrap();
        assert!(options.debug);
        assert!(options.wait_forever);
    }

    #[test]
    fn launch_info_defaults_missing_fields() {
        let options: WorkerOptions = serde_json::from_str("{}").unwrap();
        assert!(!options.debug);
        assert!(!options.wait_forever);
        assert!(options.connect_timeout.is_none());
    }
}
