// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{Level, event};

use crate::OsError;
use crate::pal::{
    Bindings, CompletionDescriptor, CompletionPacket, ERROR_BROKEN_PIPE, ERROR_INVALID_HANDLE,
    ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, ERROR_NO_DATA, ERROR_NOT_FOUND,
    ERROR_NOT_SUPPORTED, ERROR_OPERATION_ABORTED, FILE_SKIP_COMPLETION_PORT_ON_SUCCESS, INFINITE,
    INVALID_HANDLE_VALUE, NativeHandle, WAIT_TIMEOUT,
};

/// Handle values start here and advance in steps of 4, like real Windows handles do.
const FIRST_HANDLE: usize = 0x100;

/// Default size of the inbound buffer of each pipe end, matching a typical `CreateNamedPipe` call.
const DEFAULT_CAPACITY: usize = 4096;

/// An in-process operating system that implements byte-mode duplex pipes and completion ports
/// with Win32 semantics.
///
/// This allows pipe files to be exercised end to end (shared completion port, dispatcher thread,
/// synchronous fallback, peer shutdown, cancellation) on every build target and without touching
/// real system resources. The simulation follows the Win32 contract closely:
///
/// * A pipe end opened for overlapped I/O can be associated with one completion port. Ends opened
///   without it (or configured to reject association) refuse association.
/// * An overlapped call on an associated end either completes immediately or returns
///   `ERROR_IO_PENDING` and later produces a completion packet. Immediate completions also
///   produce a packet unless `FILE_SKIP_COMPLETION_PORT_ON_SUCCESS` is in effect.
/// * Calls without a descriptor (or on unassociated ends) block the calling thread.
/// * Reads after the peer has closed and its data is drained fail with `ERROR_BROKEN_PIPE`;
///   writes fail with `ERROR_NO_DATA`.
/// * Each end buffers at most `capacity` inbound bytes; writes that do not fit wait for room.
///   A write into an empty buffer is always accepted whole.
/// * Closing an end aborts its own pending operations with `ERROR_OPERATION_ABORTED`.
///
/// Faults can be injected per pipe (see [`SimulatedPipeOptions`]) and into the completion wait
/// (see [`panic_on_next_wait()`][Self::panic_on_next_wait]).
///
/// # Thread safety
///
/// This type is thread-safe. All state is guarded by one lock; blocked calls wait on one
/// condition variable that is signaled on every state change.
#[derive(Debug)]
pub struct SimulatedBindings {
    kernel: Mutex<Kernel>,
    changed: Condvar,

    panic_on_next_wait: AtomicBool,
}

/// Configuration of a simulated pipe, applied to both of its ends.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SimulatedPipeOptions {
    capacity: usize,
    overlapped: bool,
    reject_association: bool,
    reject_skip_mode: bool,
}

impl Default for SimulatedPipeOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overlapped: true,
            reject_association: false,
            reject_skip_mode: false,
        }
    }
}

impl SimulatedPipeOptions {
    /// Number of bytes each end buffers before further writes have to wait.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Whether the ends are opened for overlapped I/O. Non-overlapped ends cannot be associated
    /// with a completion port.
    #[must_use]
    pub const fn with_overlapped(mut self, overlapped: bool) -> Self {
        self.overlapped = overlapped;
        self
    }

    /// Makes completion port association fail even though the ends are overlapped.
    #[must_use]
    pub const fn with_association_rejected(mut self, reject: bool) -> Self {
        self.reject_association = reject;
        self
    }

    /// Makes `SetFileCompletionNotificationModes` fail on the ends.
    #[must_use]
    pub const fn with_skip_mode_rejected(mut self, reject: bool) -> Self {
        self.reject_skip_mode = reject;
        self
    }
}

impl SimulatedBindings {
    /// Creates an empty simulated operating system.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kernel: Mutex::new(Kernel::new()),
            changed: Condvar::new(),
            panic_on_next_wait: AtomicBool::new(false),
        })
    }

    /// Creates a connected duplex pipe and returns its two ends.
    ///
    /// Both ends are ready for I/O, i.e. this stands in for both the server side
    /// (`CreateNamedPipe` + `ConnectNamedPipe`) and the client side (`CreateFile`).
    pub fn create_pipe(&self, options: &SimulatedPipeOptions) -> (NativeHandle, NativeHandle) {
        let mut kernel = self.kernel.lock();

        let first = kernel.allocate_handle();
        let second = kernel.allocate_handle();

        kernel.pipe_ends.insert(first, PipeEnd::new(second, options));
        kernel.pipe_ends.insert(second, PipeEnd::new(first, options));

        event!(Level::TRACE, message = "simulated pipe created", %first, %second);

        (first, second)
    }

    /// Whether the handle refers to an object that has not been closed yet.
    #[must_use]
    pub fn is_open(&self, handle: NativeHandle) -> bool {
        let kernel = self.kernel.lock();
        kernel.pipe_ends.contains_key(&handle) || kernel.ports.contains_key(&handle)
    }

    /// Number of overlapped reads and writes issued on this pipe end that are still pending.
    #[must_use]
    pub fn pending_operations(&self, handle: NativeHandle) -> usize {
        self.kernel
            .lock()
            .pipe_ends
            .get(&handle)
            .map_or(0, |end| end.pending_reads.len() + end.pending_writes.len())
    }

    /// Makes the next wait for a completion packet panic, on whichever port and thread it happens.
    /// A wait that is already blocked is not affected.
    pub fn panic_on_next_wait(&self) {
        self.panic_on_next_wait.store(true, Ordering::Release);
    }

    #[expect(clippy::panic, reason = "injected fault, requested via panic_on_next_wait()")]
    fn inject_wait_failure(&self) {
        if self.panic_on_next_wait.swap(false, Ordering::AcqRel) {
            panic!("simulated failure while waiting for completions");
        }
    }
}

impl Bindings for SimulatedBindings {
    fn create_io_completion_port(
        &self,
        file_handle: NativeHandle,
        existing_completion_port: Option<NativeHandle>,
        completion_key: usize,
        _number_of_concurrent_threads: u32,
    ) -> Result<NativeHandle, OsError> {
        let mut kernel = self.kernel.lock();

        let port = match existing_completion_port {
            Some(port) if kernel.ports.contains_key(&port) => port,
            Some(_) => return Err(ERROR_INVALID_HANDLE),
            None => {
                let port = kernel.allocate_handle();
                kernel.ports.insert(port, Port::default());
                port
            }
        };

        if file_handle == INVALID_HANDLE_VALUE {
            return Ok(port);
        }

        let end = kernel
            .pipe_ends
            .get_mut(&file_handle)
            .ok_or(ERROR_INVALID_HANDLE)?;

        if !end.overlapped || end.reject_association || end.association.is_some() {
            return Err(ERROR_INVALID_PARAMETER);
        }

        end.association = Some((port, completion_key));
        Ok(port)
    }

    unsafe fn set_file_completion_notification_modes(
        &self,
        file_handle: NativeHandle,
        flags: u8,
    ) -> Result<(), OsError> {
        let mut kernel = self.kernel.lock();

        let end = kernel
            .pipe_ends
            .get_mut(&file_handle)
            .ok_or(ERROR_INVALID_HANDLE)?;

        if end.reject_skip_mode {
            return Err(ERROR_NOT_SUPPORTED);
        }

        end.skip_on_success = flags & FILE_SKIP_COMPLETION_PORT_ON_SUCCESS != 0;
        Ok(())
    }

    unsafe fn read_file(
        &self,
        file_handle: NativeHandle,
        buffer: *mut u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError> {
        let transfer = Transfer {
            buffer: buffer.expose_provenance(),
            len,
            descriptor: overlapped.expose_provenance(),
        };

        let mut kernel = self.kernel.lock();

        loop {
            let end = kernel
                .pipe_ends
                .get_mut(&file_handle)
                .ok_or(ERROR_INVALID_HANDLE)?;

            let asynchronous = transfer.descriptor != 0 && end.association.is_some();

            // Earlier pending reads are served first.
            if !end.inbound.is_empty() && end.pending_reads.is_empty() {
                // SAFETY: The caller guarantees the buffer is valid for `len` bytes.
                let bytes_read = unsafe { end.drain_into(transfer.buffer, transfer.len) };
                let notify = (asynchronous && !end.skip_on_success)
                    .then_some(end.association)
                    .flatten();

                if let Some(association) = notify {
                    kernel.complete(Some(association), transfer.descriptor, Ok(bytes_read));
                }

                kernel.settle();
                self.changed.notify_all();
                return Ok(bytes_read);
            }

            if end.inbound.is_empty() && end.peer_closed {
                return Err(ERROR_BROKEN_PIPE);
            }

            if asynchronous {
                end.pending_reads.push_back(transfer);
                return Err(ERROR_IO_PENDING);
            }

            self.changed.wait(&mut kernel);
        }
    }

    unsafe fn write_file(
        &self,
        file_handle: NativeHandle,
        buffer: *const u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError> {
        let transfer = Transfer {
            buffer: buffer.expose_provenance(),
            len,
            descriptor: overlapped.expose_provenance(),
        };

        let mut kernel = self.kernel.lock();

        loop {
            let end = kernel
                .pipe_ends
                .get(&file_handle)
                .ok_or(ERROR_INVALID_HANDLE)?;

            if end.peer_closed {
                return Err(ERROR_NO_DATA);
            }

            let asynchronous = transfer.descriptor != 0 && end.association.is_some();
            let association = end.association;
            let skip_on_success = end.skip_on_success;
            let writes_queued = !end.pending_writes.is_empty();
            let peer_handle = end.peer;

            let peer = kernel
                .pipe_ends
                .get_mut(&peer_handle)
                .expect("a pipe end whose peer is not closed always has a live peer");

            // Earlier pending writes are served first.
            if !writes_queued && peer.has_room_for(transfer.len) {
                // SAFETY: The caller guarantees the buffer is valid for `len` bytes.
                unsafe { peer.fill_from(transfer.buffer, transfer.len) };

                if asynchronous && !skip_on_success {
                    kernel.complete(association, transfer.descriptor, Ok(transfer.len));
                }

                kernel.settle();
                self.changed.notify_all();
                return Ok(transfer.len);
            }

            if asynchronous {
                kernel
                    .pipe_ends
                    .get_mut(&file_handle)
                    .expect("looked up above under the same lock")
                    .pending_writes
                    .push_back(transfer);
                return Err(ERROR_IO_PENDING);
            }

            self.changed.wait(&mut kernel);
        }
    }

    fn get_queued_completion_status(
        &self,
        completion_port: NativeHandle,
        milliseconds: u32,
    ) -> CompletionPacket {
        self.inject_wait_failure();

        let deadline = (milliseconds != INFINITE)
            .then(|| Instant::now() + Duration::from_millis(milliseconds.into()));

        let mut kernel = self.kernel.lock();

        loop {
            let Some(port) = kernel.ports.get_mut(&completion_port) else {
                return CompletionPacket::empty(ERROR_INVALID_HANDLE);
            };

            if let Some(packet) = port.packets.pop_front() {
                return packet;
            }

            match deadline {
                None => self.changed.wait(&mut kernel),
                Some(deadline) if Instant::now() >= deadline => {
                    return CompletionPacket::empty(WAIT_TIMEOUT);
                }
                Some(deadline) => {
                    _ = self.changed.wait_until(&mut kernel, deadline);
                }
            }
        }
    }

    fn cancel_io_ex(
        &self,
        file_handle: NativeHandle,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<(), OsError> {
        let descriptor = overlapped.addr();
        let mut kernel = self.kernel.lock();

        let end = kernel
            .pipe_ends
            .get_mut(&file_handle)
            .ok_or(ERROR_INVALID_HANDLE)?;

        // A null descriptor cancels everything issued on the handle.
        let matches = |transfer: &Transfer| descriptor == 0 || transfer.descriptor == descriptor;

        let mut canceled = Vec::new();
        for queue in [&mut end.pending_reads, &mut end.pending_writes] {
            let (hit, kept): (VecDeque<_>, VecDeque<_>) = queue.drain(..).partition(matches);
            *queue = kept;
            canceled.extend(hit);
        }

        if canceled.is_empty() {
            return Err(ERROR_NOT_FOUND);
        }

        let association = end.association;
        for transfer in canceled {
            kernel.complete(association, transfer.descriptor, Err(ERROR_OPERATION_ABORTED));
        }

        kernel.settle();
        self.changed.notify_all();
        Ok(())
    }

    fn close_handle(&self, handle: NativeHandle) -> Result<(), OsError> {
        let mut kernel = self.kernel.lock();

        if kernel.ports.remove(&handle).is_some() {
            return Ok(());
        }

        let mut end = kernel
            .pipe_ends
            .remove(&handle)
            .ok_or(ERROR_INVALID_HANDLE)?;

        for transfer in end.pending_reads.drain(..).chain(end.pending_writes.drain(..)) {
            kernel.complete(end.association, transfer.descriptor, Err(ERROR_OPERATION_ABORTED));
        }

        if let Some(peer) = kernel.pipe_ends.get_mut(&end.peer) {
            peer.peer_closed = true;
        }

        event!(Level::TRACE, message = "simulated pipe end closed", %handle);

        kernel.settle();
        self.changed.notify_all();
        Ok(())
    }
}

#[derive(Debug)]
struct Kernel {
    next_handle: usize,
    ports: HashMap<NativeHandle, Port>,
    pipe_ends: HashMap<NativeHandle, PipeEnd>,
}

impl Kernel {
    fn new() -> Self {
        Self {
            next_handle: FIRST_HANDLE,
            ports: HashMap::new(),
            pipe_ends: HashMap::new(),
        }
    }

    fn allocate_handle(&mut self) -> NativeHandle {
        let handle = NativeHandle(self.next_handle);
        self.next_handle += 4;
        handle
    }

    /// Records the outcome in the operation's descriptor and queues a packet on the port the
    /// issuing handle is associated with.
    fn complete(
        &mut self,
        association: Option<(NativeHandle, usize)>,
        descriptor: usize,
        result: Result<u32, OsError>,
    ) {
        let (status, bytes_transferred) = match result {
            Ok(bytes) => (0, bytes),
            Err(error) => (error.code() as usize, 0),
        };

        // SAFETY: The issuer of an overlapped call guarantees the descriptor stays valid and
        // unmoved until the completion packet is dequeued, which cannot happen before this.
        let target = unsafe {
            &mut *ptr::with_exposed_provenance_mut::<CompletionDescriptor>(descriptor)
        };
        target.internal = status;
        target.internal_high = bytes_transferred as usize;

        let Some((port_handle, completion_key)) = association else {
            return;
        };

        if let Some(port) = self.ports.get_mut(&port_handle) {
            port.packets.push_back(CompletionPacket {
                bytes_transferred,
                completion_key,
                descriptor,
                result: result.map(|_| ()),
            });
        }
    }

    /// Moves data between pipe ends and completes pending operations until nothing changes.
    fn settle(&mut self) {
        loop {
            let handles: Vec<NativeHandle> = self.pipe_ends.keys().copied().collect();

            let mut progressed = false;
            for handle in handles {
                progressed |= self.settle_writes(handle);
                progressed |= self.settle_reads(handle);
            }

            if !progressed {
                break;
            }
        }
    }

    fn settle_reads(&mut self, handle: NativeHandle) -> bool {
        let Some(end) = self.pipe_ends.get_mut(&handle) else {
            return false;
        };

        let mut completed = Vec::new();

        while !end.inbound.is_empty() {
            let Some(read) = end.pending_reads.pop_front() else {
                break;
            };

            // SAFETY: Pending reads keep their buffers valid until completion.
            let bytes_read = unsafe { end.drain_into(read.buffer, read.len) };
            completed.push((read.descriptor, Ok(bytes_read)));
        }

        if end.inbound.is_empty() && end.peer_closed {
            completed.extend(
                end.pending_reads
                    .drain(..)
                    .map(|read| (read.descriptor, Err(ERROR_BROKEN_PIPE))),
            );
        }

        let association = end.association;
        let progressed = !completed.is_empty();

        for (descriptor, result) in completed {
            self.complete(association, descriptor, result);
        }

        progressed
    }

    fn settle_writes(&mut self, handle: NativeHandle) -> bool {
        let mut progressed = false;

        loop {
            let Some(end) = self.pipe_ends.get_mut(&handle) else {
                return progressed;
            };

            let association = end.association;

            if end.peer_closed {
                let failed: Vec<_> = end.pending_writes.drain(..).collect();
                progressed |= !failed.is_empty();

                for write in failed {
                    self.complete(association, write.descriptor, Err(ERROR_NO_DATA));
                }

                return progressed;
            }

            let Some(write) = end.pending_writes.pop_front() else {
                return progressed;
            };

            let peer_handle = end.peer;
            let peer = self
                .pipe_ends
                .get_mut(&peer_handle)
                .expect("a pipe end whose peer is not closed always has a live peer");

            if !peer.has_room_for(write.len) {
                self.pipe_ends
                    .get_mut(&handle)
                    .expect("looked up above")
                    .pending_writes
                    .push_front(write);
                return progressed;
            }

            // SAFETY: Pending writes keep their buffers valid until completion.
            unsafe { peer.fill_from(write.buffer, write.len) };

            self.complete(association, write.descriptor, Ok(write.len));
            progressed = true;
        }
    }
}

#[derive(Debug, Default)]
struct Port {
    packets: VecDeque<CompletionPacket>,
}

#[derive(Debug)]
struct PipeEnd {
    peer: NativeHandle,
    peer_closed: bool,

    overlapped: bool,
    reject_association: bool,
    reject_skip_mode: bool,
    capacity: usize,

    /// Completion port and completion key, once associated.
    association: Option<(NativeHandle, usize)>,
    skip_on_success: bool,

    inbound: VecDeque<u8>,

    pending_reads: VecDeque<Transfer>,

    /// Writes issued on this end that wait for room in the peer's inbound buffer.
    pending_writes: VecDeque<Transfer>,
}

impl PipeEnd {
    fn new(peer: NativeHandle, options: &SimulatedPipeOptions) -> Self {
        Self {
            peer,
            peer_closed: false,
            overlapped: options.overlapped,
            reject_association: options.reject_association,
            reject_skip_mode: options.reject_skip_mode,
            capacity: options.capacity,
            association: None,
            skip_on_success: false,
            inbound: VecDeque::new(),
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
        }
    }

    fn has_room_for(&self, len: u32) -> bool {
        self.inbound.is_empty() || self.inbound.len() + len as usize <= self.capacity
    }

    /// # Safety
    ///
    /// `buffer` must be the exposed address of memory valid for writes of `len` bytes.
    unsafe fn drain_into(&mut self, buffer: usize, len: u32) -> u32 {
        let count = self.inbound.len().min(len as usize);
        let buffer = ptr::with_exposed_provenance_mut::<u8>(buffer);

        // SAFETY: Forwarding safety requirements, count <= len.
        let target = unsafe { std::slice::from_raw_parts_mut(buffer, count) };

        for (slot, byte) in target.iter_mut().zip(self.inbound.drain(..count)) {
            *slot = byte;
        }

        u32::try_from(count).expect("count is bounded by a u32 length")
    }

    /// # Safety
    ///
    /// `buffer` must be the exposed address of memory valid for reads of `len` bytes.
    unsafe fn fill_from(&mut self, buffer: usize, len: u32) {
        let buffer = ptr::with_exposed_provenance::<u8>(buffer);

        // SAFETY: Forwarding safety requirements.
        let bytes = unsafe { std::slice::from_raw_parts(buffer, len as usize) };
        self.inbound.extend(bytes);
    }
}

/// A read or write waiting inside the simulated kernel. Addresses are kept as exposed integers.
#[derive(Debug)]
struct Transfer {
    buffer: usize,
    len: u32,
    descriptor: usize,
}

#[cfg(test)]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    fn new_port(bindings: &SimulatedBindings) -> NativeHandle {
        bindings
            .create_io_completion_port(INVALID_HANDLE_VALUE, None, 0, 1)
            .unwrap()
    }

    fn associate(bindings: &SimulatedBindings, handle: NativeHandle, port: NativeHandle) {
        bindings
            .create_io_completion_port(handle, Some(port), 0, 1)
            .unwrap();

        // SAFETY: Tests only take results inline on synchronous completion.
        unsafe {
            bindings
                .set_file_completion_notification_modes(
                    handle,
                    FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
                )
                .unwrap();
        }
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(SimulatedBindings: Send, Sync);
    }

    #[test]
    fn blocking_write_then_read() {
        let bindings = SimulatedBindings::new();
        let (a, b) = bindings.create_pipe(&SimulatedPipeOptions::default());

        let data = *b"hello";
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let written =
            unsafe { bindings.write_file(a, data.as_ptr(), 5, ptr::null_mut()) }.unwrap();
        assert_eq!(written, 5);

        let mut buffer = [0u8; 16];
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let read =
            unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 16, ptr::null_mut()) }.unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buffer[..5], b"hello");
    }

    #[test]
    fn blocking_read_waits_for_writer() {
        let bindings = SimulatedBindings::new();
        let (a, b) = bindings.create_pipe(&SimulatedPipeOptions::default());

        let reader = thread::spawn({
            let bindings = Arc::clone(&bindings);
            move || {
                let mut buffer = [0u8; 8];
                // SAFETY: Buffers outlive the calls, no descriptor is used.
                let read =
                    unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, ptr::null_mut()) };
                (read, buffer)
            }
        });

        thread::sleep(Duration::from_millis(20));

        let data = *b"late";
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        unsafe { bindings.write_file(a, data.as_ptr(), 4, ptr::null_mut()) }.unwrap();

        let (read, buffer) = reader.join().unwrap();
        assert_eq!(read, Ok(4));
        assert_eq!(&buffer[..4], b"late");
    }

    #[test]
    fn pending_read_completes_through_port() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);
        let (a, b) = bindings.create_pipe(&SimulatedPipeOptions::default());
        associate(&bindings, b, port);

        let mut buffer = [0u8; 8];
        let mut descriptor = CompletionDescriptor::default();

        // SAFETY: Buffer and descriptor outlive the dequeue below.
        let result = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, &raw mut descriptor) };
        assert_eq!(result, Err(ERROR_IO_PENDING));
        assert_eq!(bindings.pending_operations(b), 1);

        let timed_out = bindings.get_queued_completion_status(port, 0);
        assert_eq!(timed_out.descriptor, 0);
        assert_eq!(timed_out.result, Err(WAIT_TIMEOUT));

        let data = *b"abc";
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        unsafe { bindings.write_file(a, data.as_ptr(), 3, ptr::null_mut()) }.unwrap();

        let packet = bindings.get_queued_completion_status(port, INFINITE);
        assert_eq!(packet.descriptor, (&raw const descriptor).addr());
        assert_eq!(packet.bytes_transferred, 3);
        assert_eq!(packet.result, Ok(()));
        assert_eq!(descriptor.internal_high, 3);
        assert_eq!(&buffer[..3], b"abc");
        assert_eq!(bindings.pending_operations(b), 0);
    }

    #[test]
    fn immediate_completion_skips_port() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);
        let (a, b) = bindings.create_pipe(&SimulatedPipeOptions::default());
        associate(&bindings, b, port);

        let data = *b"xyz";
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        unsafe { bindings.write_file(a, data.as_ptr(), 3, ptr::null_mut()) }.unwrap();

        let mut buffer = [0u8; 8];
        let mut descriptor = CompletionDescriptor::default();
        // SAFETY: Buffer and descriptor outlive the call; it completes synchronously.
        let result = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, &raw mut descriptor) };
        assert_eq!(result, Ok(3));

        let packet = bindings.get_queued_completion_status(port, 0);
        assert_eq!(packet.result, Err(WAIT_TIMEOUT));
    }

    #[test]
    fn peer_close_breaks_pending_read() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);
        let (a, b) = bindings.create_pipe(&SimulatedPipeOptions::default());
        associate(&bindings, b, port);

        let mut buffer = [0u8; 8];
        let mut descriptor = CompletionDescriptor::default();
        // SAFETY: Buffer and descriptor outlive the dequeue below.
        let result = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, &raw mut descriptor) };
        assert_eq!(result, Err(ERROR_IO_PENDING));

        bindings.close_handle(a).unwrap();
        assert!(!bindings.is_open(a));

        let packet = bindings.get_queued_completion_status(port, INFINITE);
        assert_eq!(packet.result, Err(ERROR_BROKEN_PIPE));

        // Nothing left to drain, so later reads fail immediately.
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let result = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, ptr::null_mut()) };
        assert_eq!(result, Err(ERROR_BROKEN_PIPE));

        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let result = unsafe { bindings.write_file(b, buffer.as_ptr(), 8, ptr::null_mut()) };
        assert_eq!(result, Err(ERROR_NO_DATA));
    }

    #[test]
    fn data_written_before_close_is_still_readable() {
        let bindings = SimulatedBindings::new();
        let (a, b) = bindings.create_pipe(&SimulatedPipeOptions::default());

        let data = *b"bye";
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        unsafe { bindings.write_file(a, data.as_ptr(), 3, ptr::null_mut()) }.unwrap();
        bindings.close_handle(a).unwrap();

        let mut buffer = [0u8; 8];
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let result = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, ptr::null_mut()) };
        assert_eq!(result, Ok(3));

        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let result = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, ptr::null_mut()) };
        assert_eq!(result, Err(ERROR_BROKEN_PIPE));
    }

    #[test]
    fn cancel_aborts_pending_read() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);
        let (_a, b) = bindings.create_pipe(&SimulatedPipeOptions::default());
        associate(&bindings, b, port);

        let mut buffer = [0u8; 8];
        let mut descriptor = CompletionDescriptor::default();
        // SAFETY: Buffer and descriptor outlive the dequeue below.
        let result = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 8, &raw mut descriptor) };
        assert_eq!(result, Err(ERROR_IO_PENDING));

        bindings.cancel_io_ex(b, &raw mut descriptor).unwrap();

        let packet = bindings.get_queued_completion_status(port, INFINITE);
        assert_eq!(packet.result, Err(ERROR_OPERATION_ABORTED));
        assert_eq!(descriptor.internal, ERROR_OPERATION_ABORTED.code() as usize);

        assert_eq!(
            bindings.cancel_io_ex(b, &raw mut descriptor),
            Err(ERROR_NOT_FOUND)
        );
    }

    #[test]
    fn full_pipe_makes_write_pending() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);
        let (a, b) = bindings.create_pipe(&SimulatedPipeOptions::default().with_capacity(4));
        associate(&bindings, a, port);

        let first = *b"12345678";
        let second = *b"abcd";
        let mut descriptor = CompletionDescriptor::default();

        // An empty buffer accepts a write of any size.
        // SAFETY: Buffer and descriptor outlive the calls.
        let result = unsafe { bindings.write_file(a, first.as_ptr(), 8, &raw mut descriptor) };
        assert_eq!(result, Ok(8));

        // SAFETY: Buffer and descriptor outlive the dequeue below.
        let result = unsafe { bindings.write_file(a, second.as_ptr(), 4, &raw mut descriptor) };
        assert_eq!(result, Err(ERROR_IO_PENDING));

        let mut buffer = [0u8; 16];
        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let read = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 16, ptr::null_mut()) };
        assert_eq!(read, Ok(8));

        let packet = bindings.get_queued_completion_status(port, INFINITE);
        assert_eq!(packet.result, Ok(()));
        assert_eq!(packet.bytes_transferred, 4);

        // SAFETY: Buffers outlive the calls, no descriptor is used.
        let read = unsafe { bindings.read_file(b, buffer.as_mut_ptr(), 16, ptr::null_mut()) };
        assert_eq!(read, Ok(4));
        assert_eq!(&buffer[..4], b"abcd");
    }

    #[test]
    fn association_rules() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);

        let (plain, _) =
            bindings.create_pipe(&SimulatedPipeOptions::default().with_overlapped(false));
        assert_eq!(
            bindings.create_io_completion_port(plain, Some(port), 0, 1),
            Err(ERROR_INVALID_PARAMETER)
        );

        let (rejecting, _) = bindings
            .create_pipe(&SimulatedPipeOptions::default().with_association_rejected(true));
        assert_eq!(
            bindings.create_io_completion_port(rejecting, Some(port), 0, 1),
            Err(ERROR_INVALID_PARAMETER)
        );

        let (overlapped, _) = bindings
            .create_pipe(&SimulatedPipeOptions::default().with_skip_mode_rejected(true));
        assert_eq!(
            bindings.create_io_completion_port(overlapped, Some(port), 0, 1),
            Ok(port)
        );

        // Already associated.
        assert_eq!(
            bindings.create_io_completion_port(overlapped, Some(port), 0, 1),
            Err(ERROR_INVALID_PARAMETER)
        );

        // SAFETY: No operations are issued on the handle.
        let result = unsafe {
            bindings.set_file_completion_notification_modes(
                overlapped,
                FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
            )
        };
        assert_eq!(result, Err(ERROR_NOT_SUPPORTED));
    }

    #[test]
    fn closed_port_is_gone() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);
        assert!(bindings.is_open(port));

        bindings.close_handle(port).unwrap();
        assert!(!bindings.is_open(port));
        assert_eq!(bindings.close_handle(port), Err(ERROR_INVALID_HANDLE));

        let packet = bindings.get_queued_completion_status(port, 0);
        assert_eq!(packet, CompletionPacket::empty(ERROR_INVALID_HANDLE));
    }

    #[test]
    fn injected_wait_failure_panics_once() {
        let bindings = SimulatedBindings::new();
        let port = new_port(&bindings);

        bindings.panic_on_next_wait();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            bindings.get_queued_completion_status(port, 0)
        }));
        assert!(result.is_err());

        // The kernel lock does not poison, so the next wait behaves normally.
        let packet = bindings.get_queued_completion_status(port, 0);
        assert_eq!(packet, CompletionPacket::empty(WAIT_TIMEOUT));
    }
}
