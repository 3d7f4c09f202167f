// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

/// Decides whether new operations may start on a pipe file and lets the closing logic wait until
/// every admitted operation has finished.
///
/// Admission (check the closing flag, count the operation) happens under the shared side of a
/// reader/writer lock, the transition to closing under the exclusive side. Therefore, once
/// [`close_and_drain`][Self::close_and_drain] has set the flag, it sees every operation that
/// will ever be admitted and nothing can be admitted afterwards.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Default)]
pub(crate) struct AdmissionGate {
    closing: RwLock<bool>,

    in_flight: AtomicUsize,

    // Only used to wait for `in_flight` to reach zero.
    drained: Mutex<()>,
    drained_signal: Condvar,
}

impl AdmissionGate {
    /// Admits a new operation unless the gate is closing. The operation is counted as in flight
    /// until the returned permit is dropped.
    pub(crate) fn admit(&self) -> Option<OperationPermit<'_>> {
        let closing = self.closing.read();

        if *closing {
            return None;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);

        Some(OperationPermit { gate: self })
    }

    /// Stops admitting operations and blocks until all admitted operations have finished.
    ///
    /// Returns `false` without waiting if the gate was already closing.
    pub(crate) fn close_and_drain(&self) -> bool {
        {
            let mut closing = self.closing.write();

            if *closing {
                return false;
            }

            *closing = true;
        }

        let mut drained = self.drained.lock();

        while self.in_flight.load(Ordering::Acquire) > 0 {
            self.drained_signal.wait(&mut drained);
        }

        true
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Marks one operation as in flight. Released on every exit path of the operation, including
/// unwinding.
#[derive(Debug)]
pub(crate) struct OperationPermit<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for OperationPermit<'_> {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Taking the lock orders this signal after the closer's check of the counter.
            let _drained = self.gate.drained.lock();
            self.gate.drained_signal.notify_all();
        }
    }
}
