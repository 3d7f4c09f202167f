// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::marker::PhantomPinned;
use std::mem::offset_of;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use oneshot::RecvTimeoutError;
use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use tracing::{Level, event};

use crate::pal::{CompletionDescriptor, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED};
use crate::{Error, OsError, Result};

type OperationResult = std::result::Result<u32, OsError>;

/// The heap-allocated state of one overlapped read or write.
///
/// The completion descriptor is the first field, so the address the operating system reports in
/// a completion packet is also the address of the token itself. While the operation is pending,
/// the operating system owns one strong reference to the token, converted into a raw pointer.
/// The dispatcher converts it back and releases it when the completion packet arrives.
///
/// # Thread safety
///
/// This type is thread-safe. The descriptor is only ever written by the operating system and the
/// result sender is guarded by a mutex.
#[repr(C)]
pub(crate) struct OperationToken {
    descriptor: UnsafeCell<CompletionDescriptor>,

    // Taken by whoever delivers the result. A second delivery finds it empty.
    result_tx: Mutex<Option<oneshot::Sender<OperationResult>>>,

    // Instances of this type must stay at a fixed address while the OS references them.
    _requires_pinning: PhantomPinned,
}

// The completion packet carries the descriptor address, which must equal the token address.
const_assert_eq!(offset_of!(OperationToken, descriptor), 0);

// SAFETY: The descriptor is only mutated by the operating system while the operation is pending
// and is never read or written through shared references on the Rust side, so sharing the token
// across threads cannot create a data race. The remaining fields are thread-safe on their own.
unsafe impl Sync for OperationToken {}

/// The immediate outcome of starting an overlapped operation.
#[derive(Debug)]
pub(crate) enum Begin {
    /// The operation completed (successfully or not) without going through the completion port.
    Completed(OperationResult),

    /// The operation will complete via the completion port.
    Pending(PendingOperation),
}

impl OperationToken {
    /// Allocates a token and starts an overlapped operation with its descriptor.
    ///
    /// `start` receives the descriptor to pass to the operating system call and returns the
    /// immediate result of that call. `ERROR_IO_PENDING` hands a reference to the token over to
    /// the operating system until [`complete`][Self::complete] is called with its address.
    pub(crate) fn begin<F>(start: F) -> Begin
    where
        F: FnOnce(*mut CompletionDescriptor) -> OperationResult,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let token = Arc::new(Self {
            descriptor: UnsafeCell::new(CompletionDescriptor::default()),
            result_tx: Mutex::new(Some(result_tx)),
            _requires_pinning: PhantomPinned,
        });

        // This reference belongs to the OS while the operation is pending. The provenance is
        // exposed so the dispatcher can turn the address in the completion packet back into it.
        let os_reference = Arc::into_raw(Arc::clone(&token));
        _ = os_reference.expose_provenance();

        let descriptor = os_reference.cast::<CompletionDescriptor>().cast_mut();

        match start(descriptor) {
            Err(ERROR_IO_PENDING) => {
                event!(Level::TRACE, message = "operation pending", descriptor = descriptor.addr());

                Begin::Pending(PendingOperation { token, result_rx })
            }
            result => {
                // No completion packet will be queued, so the OS reference is ours to release.
                // SAFETY: Created by `Arc::into_raw` above and not released elsewhere.
                drop(unsafe { Arc::from_raw(os_reference) });

                Begin::Completed(result)
            }
        }
    }

    /// Delivers the outcome of a pending operation to whoever waits for it and releases the
    /// operating system's reference to the token.
    ///
    /// Returns `false` if nobody was waiting for the outcome, in which case it is dropped.
    ///
    /// # Safety
    ///
    /// `address` must be the descriptor address of an operation started by [`begin`][Self::begin]
    /// that returned [`Begin::Pending`], and each such address must be completed exactly once.
    pub(crate) unsafe fn complete(address: usize, outcome: OperationResult) -> bool {
        // SAFETY: Forwarding safety requirements. The address is that of a pointer created by
        // `Arc::into_raw` whose provenance was exposed.
        let token =
            unsafe { Arc::from_raw(ptr::with_exposed_provenance::<OperationToken>(address)) };

        let Some(result_tx) = token.result_tx.lock().take() else {
            return false;
        };

        result_tx.send(outcome).is_ok()
    }
}

impl Debug for OperationToken {
    #[cfg_attr(test, mutants::skip)] // There is no API contract this needs to satisfy.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationToken")
            .field("descriptor", &format_args!("{:p}", self.descriptor.get()))
            .finish_non_exhaustive()
    }
}

/// An operation that returned `ERROR_IO_PENDING`. Its buffer and descriptor must remain valid
/// until one of the wait methods returns, which only happens once the completion has been
/// delivered.
#[derive(Debug)]
#[must_use = "the buffer of a pending operation must stay borrowed until the operation completes"]
pub(crate) struct PendingOperation {
    token: Arc<OperationToken>,
    result_rx: oneshot::Receiver<OperationResult>,
}

impl PendingOperation {
    /// Blocks until the dispatcher delivers the outcome.
    pub(crate) fn wait(self) -> Result<u32> {
        match self.result_rx.recv() {
            Ok(result) => Ok(result?),
            Err(oneshot::RecvError) => Err(lost_result()),
        }
    }

    /// Blocks until the dispatcher delivers the outcome or `timeout` elapses. On timeout, `cancel`
    /// is asked to cancel the operation identified by the descriptor, after which this waits
    /// (without a limit) for the operation's final notification.
    ///
    /// Returns [`Error::TimedOut`] if the cancellation took effect, otherwise the real result.
    pub(crate) fn wait_timeout<C>(self, timeout: Duration, cancel: C) -> Result<u32>
    where
        C: FnOnce(*mut CompletionDescriptor),
    {
        let Self { token, result_rx } = self;

        match result_rx.recv_timeout(timeout) {
            Ok(result) => return Ok(result?),
            Err(RecvTimeoutError::Disconnected) => return Err(lost_result()),
            Err(RecvTimeoutError::Timeout) => {}
        }

        event!(Level::TRACE, message = "operation timed out, canceling", ?timeout);

        cancel(token.descriptor.get());

        match result_rx.recv() {
            Ok(Err(ERROR_OPERATION_ABORTED)) => Err(Error::TimedOut),
            Ok(result) => Ok(result?),
            Err(oneshot::RecvError) => Err(lost_result()),
        }
    }
}

fn lost_result() -> Error {
    Error::ContractViolation(
        "the result channel of a pending operation was closed without a result".to_string(),
    )
}
