// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;

use derive_more::Display;

use crate::OsError;

/// A raw operating system handle (a named pipe end, a completion port, ...).
///
/// The value is opaque to this crate. It is never dereferenced, only passed back to the bindings
/// that produced it.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{_0:#x}")]
pub struct NativeHandle(pub usize);

/// The per-call descriptor that the operating system writes into when an overlapped operation
/// completes. Layout-compatible with the Win32 `OVERLAPPED` structure.
///
/// The address of a descriptor is the correlation key that comes back in a completion packet,
/// so a descriptor must stay at a fixed address for as long as the operation is pending.
#[derive(Debug, Default)]
#[repr(C)]
pub struct CompletionDescriptor {
    /// Completion status, written by the operating system.
    pub internal: usize,
    /// Number of bytes transferred, written by the operating system.
    pub internal_high: usize,
    pub offset: u32,
    pub offset_high: u32,
    pub event: usize,
}

/// One dequeued completion port entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompletionPacket {
    pub bytes_transferred: u32,

    pub completion_key: usize,

    /// Address of the `CompletionDescriptor` of the completed operation, or zero if the wait
    /// itself failed (e.g. timed out).
    pub descriptor: usize,

    /// Outcome of the completed operation (or of the wait, when `descriptor` is zero).
    pub result: Result<(), OsError>,
}

impl CompletionPacket {
    /// A packet describing a wait that returned without dequeuing anything.
    #[must_use]
    pub const fn empty(error: OsError) -> Self {
        Self {
            bytes_transferred: 0,
            completion_key: 0,
            descriptor: 0,
            result: Err(error),
        }
    }
}

/// Bindings for FFI calls into the operating system.
///
/// All calls the engine makes go through this trait, enabling them to be mocked or simulated.
/// Methods mirror the Win32 functions of the same name, with failures reported as the
/// `GetLastError()` code instead of a `BOOL`.
#[cfg_attr(test, mockall::automock)]
pub trait Bindings: Debug + Send + Sync + 'static {
    fn create_io_completion_port(
        &self,
        file_handle: NativeHandle,
        existing_completion_port: Option<NativeHandle>,
        completion_key: usize,
        number_of_concurrent_threads: u32,
    ) -> Result<NativeHandle, OsError>;

    /// # Safety
    ///
    /// Understand the impact of the flags you set. With `FILE_SKIP_COMPLETION_PORT_ON_SUCCESS`,
    /// synchronously completed overlapped calls produce no completion packet, so the caller must
    /// take the result inline and must not wait for a notification.
    unsafe fn set_file_completion_notification_modes(
        &self,
        file_handle: NativeHandle,
        flags: u8,
    ) -> Result<(), OsError>;

    /// Returns the number of bytes read if the call completed synchronously.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for writes of `len` bytes. If `overlapped` is not null and the call
    /// returns `ERROR_IO_PENDING`, both `buffer` and `overlapped` must remain valid and unmoved
    /// until the matching completion packet has been dequeued.
    unsafe fn read_file(
        &self,
        file_handle: NativeHandle,
        buffer: *mut u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError>;

    /// Returns the number of bytes written if the call completed synchronously.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads of `len` bytes. If `overlapped` is not null and the call
    /// returns `ERROR_IO_PENDING`, both `buffer` and `overlapped` must remain valid and unmoved
    /// until the matching completion packet has been dequeued.
    unsafe fn write_file(
        &self,
        file_handle: NativeHandle,
        buffer: *const u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError>;

    fn get_queued_completion_status(
        &self,
        completion_port: NativeHandle,
        milliseconds: u32,
    ) -> CompletionPacket;

    /// Requests cancellation of the pending operation that uses `overlapped`. The operation still
    /// produces a completion packet (with `ERROR_OPERATION_ABORTED` if the cancellation won).
    fn cancel_io_ex(
        &self,
        file_handle: NativeHandle,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<(), OsError>;

    fn close_handle(&self, handle: NativeHandle) -> Result<(), OsError>;
}
