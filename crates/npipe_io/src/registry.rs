// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
#[cfg(windows)]
use std::sync::OnceLock;

use tracing::{Level, event};

use crate::dispatcher::{self, Dispatch, DispatcherCounters};
use crate::operation::OperationToken;
use crate::pal::{
    Bindings, BindingsFacade, CompletionDescriptor, FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
    FILE_SKIP_SET_EVENT_ON_HANDLE, INVALID_HANDLE_VALUE, NativeHandle, SimulatedBindings,
};
use crate::{DispatcherStats, RegistryOptions, Result};

/// Owns a completion port shared by any number of pipe files and the dispatcher thread that
/// routes completions from the port back to the operations waiting for them.
///
/// Most users never touch this type directly: [`PipeFile::new()`][1] uses the process-wide
/// registry returned by [`global()`][Self::global], which is created on first use and lives
/// until the process exits. Explicit registries exist to run pipe files over other bindings
/// (e.g. the in-process simulation) or to isolate groups of pipe files from each other.
///
/// # Thread safety
///
/// This type is thread-safe.
///
/// [1]: crate::PipeFile::new
#[derive(derive_more::Debug)]
#[debug("CompletionRegistry({completion_port})")]
pub struct CompletionRegistry {
    completion_port: NativeHandle,

    // Passed to the OS for every association, kept for consistency with port creation.
    concurrency: u32,

    bindings: BindingsFacade,

    counters: DispatcherCounters,
}

impl CompletionRegistry {
    /// The process-wide registry, backed by the operating system. Created and started on first
    /// use, in a thread-safe manner.
    ///
    /// # Panics
    ///
    /// Panics if the operating system cannot create a completion port or start a thread. Nothing
    /// in the process could perform pipe I/O in that case.
    #[cfg(windows)]
    #[must_use]
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: OnceLock<Arc<CompletionRegistry>> = OnceLock::new();

        GLOBAL.get_or_init(|| {
            Self::start(BindingsFacade::real(), &RegistryOptions::default()).expect(
                "creating the process-wide I/O completion port should never fail unless the OS is critically out of resources",
            )
        })
    }

    /// Creates a new registry backed by the operating system, with its own completion port and
    /// dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the completion port cannot be created or the thread cannot be started.
    #[cfg(windows)]
    pub fn new(options: &RegistryOptions) -> Result<Arc<Self>> {
        Self::start(BindingsFacade::real(), options)
    }

    /// Creates a new registry backed by the in-process simulation, with its own simulated
    /// completion port and a real dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the completion port cannot be created or the thread cannot be started.
    pub fn simulated(
        bindings: &Arc<SimulatedBindings>,
        options: &RegistryOptions,
    ) -> Result<Arc<Self>> {
        Self::start(Arc::clone(bindings).into(), options)
    }

    fn start(bindings: BindingsFacade, options: &RegistryOptions) -> Result<Arc<Self>> {
        let registry = Arc::new(Self::create(bindings, options.concurrency())?);

        if let Err(error) =
            dispatcher::spawn(Arc::clone(&registry), options.dispatcher_thread_name())
        {
            // Nothing else can reference the port yet.
            _ = registry.bindings.close_handle(registry.completion_port);
            return Err(error);
        }

        Ok(registry)
    }

    /// Creates the completion port without starting a dispatcher. Tests drive dispatching
    /// manually via [`dispatch_next()`][Self::dispatch_next].
    pub(crate) fn create(bindings: BindingsFacade, concurrency: u32) -> Result<Self> {
        let completion_port = bindings.create_io_completion_port(
            INVALID_HANDLE_VALUE, // We are not binding an existing handle right now.
            None,                 // Create a new completion port.
            0,                    // Ignored as we are not binding an existing handle to the port.
            concurrency,
        )?;

        event!(Level::DEBUG, message = "completion registry created", %completion_port, concurrency);

        Ok(Self {
            completion_port,
            concurrency,
            bindings,
            counters: DispatcherCounters::default(),
        })
    }

    /// A snapshot of what the dispatcher has done so far.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// The completion port owned by this registry.
    #[must_use]
    pub const fn as_native_handle(&self) -> NativeHandle {
        self.completion_port
    }

    pub(crate) fn record_restart(&self) {
        self.counters.record_restart();
    }

    pub(crate) const fn bindings(&self) -> &BindingsFacade {
        &self.bindings
    }

    /// Binds a handle to the completion port. Returns `false` if the handle cannot be bound (e.g.
    /// it was not opened for overlapped I/O), in which case it must be used synchronously.
    ///
    /// Every overlapped operation on a bound handle must be started via [`OperationToken`], as
    /// the dispatcher treats every completion on the port as one of those.
    pub(crate) fn associate(&self, handle: NativeHandle) -> bool {
        match self.bindings.create_io_completion_port(
            handle,
            Some(self.completion_port),
            0, // Completion key is not used.
            self.concurrency,
        ) {
            Ok(_) => {
                event!(Level::TRACE, message = "handle associated", %handle, completion_port = %self.completion_port);
                true
            }
            Err(error) => {
                event!(Level::DEBUG, message = "handle cannot be associated with completion port", %handle, %error);
                false
            }
        }
    }

    /// Stops the operating system from queueing completions for operations that complete
    /// synchronously and from signaling the handle itself. Returns `false` if the handle does not
    /// support this, in which case it must not be used with the completion port.
    #[cfg_attr(test, mutants::skip)] // Mutates | into ^ which is a no-op and false positive.
    pub(crate) fn configure_notification_skipping(&self, handle: NativeHandle) -> bool {
        // SAFETY: After this call we will not get completion notifications for operations that
        // complete synchronously. That is intentional: the pipe file only waits for a completion
        // after receiving ERROR_IO_PENDING and takes every other result inline.
        let result = unsafe {
            self.bindings.set_file_completion_notification_modes(
                handle,
                FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE,
            )
        };

        match result {
            Ok(()) => true,
            Err(error) => {
                event!(Level::DEBUG, message = "handle does not support skipping completion notifications", %handle, %error);
                false
            }
        }
    }

    /// Requests cancellation of a pending operation. Its completion is still delivered.
    pub(crate) fn cancel(&self, handle: NativeHandle, descriptor: *mut CompletionDescriptor) {
        if let Err(error) = self.bindings.cancel_io_ex(handle, descriptor) {
            // Typically ERROR_NOT_FOUND, meaning the operation has already completed.
            event!(Level::TRACE, message = "cancellation had no effect", %handle, %error);
        }
    }

    /// Waits up to `milliseconds` for one completion packet and routes it to its operation.
    pub(crate) fn dispatch_next(&self, milliseconds: u32) -> Dispatch {
        let packet = self
            .bindings
            .get_queued_completion_status(self.completion_port, milliseconds);

        let dispatch = if packet.descriptor == 0 {
            event!(Level::TRACE, message = "spurious wake-up", result = ?packet.result);
            Dispatch::Spurious
        } else {
            let outcome = packet.result.map(|()| packet.bytes_transferred);

            // SAFETY: Every handle associated with this port only has overlapped operations
            // started via OperationToken, each of which queues exactly one packet carrying the
            // address it was started with.
            if unsafe { OperationToken::complete(packet.descriptor, outcome) } {
                event!(Level::TRACE, message = "completion delivered", descriptor = packet.descriptor, ?outcome);
                Dispatch::Delivered
            } else {
                event!(Level::WARN, message = "completion dropped, nobody was waiting for it", descriptor = packet.descriptor, ?outcome);
                Dispatch::Dropped
            }
        };

        self.counters.record(dispatch);
        dispatch
    }
}
