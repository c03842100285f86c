//! Lifecycle event sources consumed by the worker client.
//!
//! The embedding application wires these to its own shutdown and
//! fatal-termination plumbing (signal handlers, panic hooks) and calls the
//! emit methods; subscriptions are owned guards that unsubscribe on drop
//! rather than entries in a global callback list.

use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// One subscribable event source.
#[derive(Clone, Default)]
pub struct EventHook {
    registry: Arc<Mutex<Registry>>,
}

impl EventHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; it stays subscribed while the guard is alive.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> HookGuard {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(callback)));
        HookGuard {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Invoke every current subscriber.
    ///
    /// The subscriber list is snapshotted first, so a callback may drop hook
    /// guards (its own included) without deadlocking.
    pub fn emit(&self) {
        let snapshot: Vec<Callback> = lock(&self.registry)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).entries.len()
    }
}

/// Active subscription to an [`EventHook`]; unsubscribes on drop.
pub struct HookGuard {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

/// The shutdown and fatal-termination event sources a worker process exposes
/// to the client facade.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    shutdown: EventHook,
    terminate: EventHook,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to graceful shutdown.
    pub fn on_shutdown(&self, callback: impl Fn() + Send + Sync + 'static) -> HookGuard {
        self.shutdown.subscribe(callback)
    }

    /// Subscribe to fatal termination (panic/signal context).
    pub fn on_terminate(&self, callback: impl Fn() + Send + Sync + 'static) -> HookGuard {
        self.terminate.subscribe(callback)
    }

    pub fn emit_shutdown(&self) {
        self.shutdown.emit();
    }

    pub fn emit_terminate(&self) {
        self.terminate.emit();
    }
}

/// Emission can run from a panicking thread; a poisoned registry must still
/// be usable so cleanup callbacks fire.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn emit_invokes_subscribers() {
        let hook = EventHook::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_hook = Arc::clone(&hits);
        let _guard = hook.subscribe(move || {
            hits_in_hook.fetch_add(1, Ordering::SeqCst);
        });

        hook.emit();
        hook.emit();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_guard_unsubscribes() {
        let hook = EventHook::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_hook = Arc::clone(&hits);
        let guard = hook.subscribe(move || {
            hits_in_hook.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hook.subscriber_count(), 1);

        drop(guard);
        assert_eq!(hook.subscriber_count(), 0);
        hook.emit();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_drop_guards_during_emit() {
        let hook = EventHook::new();
        let held: Arc<Mutex<Vec<HookGuard>>> = Arc::new(Mutex::new(Vec::new()));

        let held_in_hook = Arc::clone(&held);
        let guard = hook.subscribe(move || {
            held_in_hook.lock().unwrap().clear();
        });
        held.lock().unwrap().push(guard);
        held.lock()
            .unwrap()
            .push(hook.subscribe(|| {}));

        hook.emit();
        assert_eq!(hook.subscriber_count(), 0);
    }

    #[test]
    fn shutdown_and_terminate_are_independent() {
        let hooks = LifecycleHooks::new();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let terminations = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&shutdowns);
        let _g1 = hooks.on_shutdown(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&terminations);
        let _g2 = hooks.on_terminate(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hooks.emit_shutdown();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(terminations.load(Ordering::SeqCst), 0);

        hooks.emit_terminate();
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }
}
