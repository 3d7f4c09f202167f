// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{Level, event};

use crate::pal::INFINITE;
use crate::{CompletionRegistry, Result};

/// A snapshot of the activity of a registry's dispatcher.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DispatcherStats {
    /// Completions handed to the operation that was waiting for them.
    pub delivered: u64,

    /// Completions whose operation was no longer waiting. The result was discarded.
    pub dropped_deliveries: u64,

    /// Wake-ups that did not carry a completed operation.
    pub spurious_wakeups: u64,

    /// Times the dispatch loop panicked and was restarted.
    pub restarts: u64,
}

impl DispatcherStats {
    fn dispatched(&self) -> u64 {
        self.delivered + self.dropped_deliveries + self.spurious_wakeups
    }
}

/// What happened to one dequeued completion packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Dispatch {
    Delivered,
    Dropped,
    Spurious,
}

#[derive(Debug, Default)]
pub(crate) struct DispatcherCounters {
    delivered: AtomicU64,
    dropped_deliveries: AtomicU64,
    spurious_wakeups: AtomicU64,
    restarts: AtomicU64,
}

impl DispatcherCounters {
    pub(crate) fn record(&self, dispatch: Dispatch) {
        let counter = match dispatch {
            Dispatch::Delivered => &self.delivered,
            Dispatch::Dropped => &self.dropped_deliveries,
            Dispatch::Spurious => &self.spurious_wakeups,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            spurious_wakeups: self.spurious_wakeups.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Starts the thread that dispatches completions of a registry.
///
/// The thread is never joined. It owns a reference to the registry, so a registry with a running
/// dispatcher lives until the process exits.
pub(crate) fn spawn(registry: Arc<CompletionRegistry>, thread_name: &str) -> Result<()> {
    thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || supervise(&registry))?;

    event!(Level::DEBUG, message = "dispatcher started", thread_name);

    Ok(())
}

/// Runs the dispatch loop, restarting it if it panics. Operations waiting for a completion would
/// otherwise wait forever.
fn supervise(registry: &CompletionRegistry) {
    let mut backoff = RestartBackoff::default();

    loop {
        recover_from_panic(registry, &mut backoff);
    }
}

/// Runs the dispatch loop until it panics, then logs the panic and sleeps for the restart delay.
fn recover_from_panic(registry: &CompletionRegistry, backoff: &mut RestartBackoff) {
    let dispatched_before = registry.stats().dispatched();

    let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| run(registry))) else {
        return;
    };

    registry.record_restart();
    let delay = backoff.next(registry.stats().dispatched() != dispatched_before);

    event!(
        Level::ERROR,
        message = "dispatcher panicked, restarting",
        registry = ?registry,
        panic = panic_message(payload.as_ref()),
        ?delay,
    );

    thread::sleep(delay);
}

fn run(registry: &CompletionRegistry) {
    loop {
        registry.dispatch_next(INFINITE);
    }
}

const MIN_RESTART_DELAY: Duration = Duration::from_millis(10);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Delay before restarting a panicked dispatch loop. Doubles with every panic that follows
/// another without any completion dispatched in between, up to a limit.
#[derive(Debug)]
struct RestartBackoff {
    delay: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            delay: MIN_RESTART_DELAY,
        }
    }
}

impl RestartBackoff {
    fn next(&mut self, made_progress: bool) -> Duration {
        if made_progress {
            self.delay = MIN_RESTART_DELAY;
        }

        let delay = self.delay;
        self.delay = (delay * 2).min(MAX_RESTART_DELAY);
        delay
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
