// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ffi::c_void;
use std::ptr;

use static_assertions::{assert_eq_align, assert_eq_size};
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    ReadFile, SetFileCompletionNotificationModes, WriteFile,
};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

use crate::OsError;
use crate::pal::{Bindings, CompletionDescriptor, CompletionPacket, NativeHandle};

// The descriptor is handed to the OS in place of an OVERLAPPED.
assert_eq_size!(CompletionDescriptor, OVERLAPPED);
assert_eq_align!(CompletionDescriptor, OVERLAPPED);

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in tests that need to use mock or simulated bindings.
#[derive(Debug, Default)]
pub struct BuildTargetBindings;

fn as_raw(handle: NativeHandle) -> HANDLE {
    // Handles are opaque values that are never dereferenced by us.
    ptr::without_provenance_mut::<c_void>(handle.0)
}

fn last_error() -> OsError {
    // SAFETY: No safety requirements.
    OsError(unsafe { GetLastError() })
}

fn check(success: i32) -> Result<(), OsError> {
    if success == 0 { Err(last_error()) } else { Ok(()) }
}

impl Bindings for BuildTargetBindings {
    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn create_io_completion_port(
        &self,
        file_handle: NativeHandle,
        existing_completion_port: Option<NativeHandle>,
        completion_key: usize,
        number_of_concurrent_threads: u32,
    ) -> Result<NativeHandle, OsError> {
        let existing = existing_completion_port.map_or(ptr::null_mut(), as_raw);

        // SAFETY: No safety requirements.
        let port = unsafe {
            CreateIoCompletionPort(
                as_raw(file_handle),
                existing,
                completion_key,
                number_of_concurrent_threads,
            )
        };

        if port.is_null() {
            Err(last_error())
        } else {
            Ok(NativeHandle(port.addr()))
        }
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn set_file_completion_notification_modes(
        &self,
        file_handle: NativeHandle,
        flags: u8,
    ) -> Result<(), OsError> {
        // SAFETY: We inherit and forward safety requirements from trait.
        check(unsafe { SetFileCompletionNotificationModes(as_raw(file_handle), flags) })
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn read_file(
        &self,
        file_handle: NativeHandle,
        buffer: *mut u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError> {
        let mut bytes_read: u32 = 0;

        // SAFETY: We inherit and forward safety requirements from trait. The descriptor is
        // layout-compatible with OVERLAPPED, asserted above.
        check(unsafe {
            ReadFile(
                as_raw(file_handle),
                buffer,
                len,
                &raw mut bytes_read,
                overlapped.cast::<OVERLAPPED>(),
            )
        })?;

        Ok(bytes_read)
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    unsafe fn write_file(
        &self,
        file_handle: NativeHandle,
        buffer: *const u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError> {
        let mut bytes_written: u32 = 0;

        // SAFETY: We inherit and forward safety requirements from trait. The descriptor is
        // layout-compatible with OVERLAPPED, asserted above.
        check(unsafe {
            WriteFile(
                as_raw(file_handle),
                buffer,
                len,
                &raw mut bytes_written,
                overlapped.cast::<OVERLAPPED>(),
            )
        })?;

        Ok(bytes_written)
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn get_queued_completion_status(
        &self,
        completion_port: NativeHandle,
        milliseconds: u32,
    ) -> CompletionPacket {
        let mut bytes_transferred: u32 = 0;
        let mut completion_key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

        // SAFETY: No safety requirements, the output pointers just have to outlive the call,
        // which they do, being on the stack until end of scope.
        let success = unsafe {
            GetQueuedCompletionStatus(
                as_raw(completion_port),
                &raw mut bytes_transferred,
                &raw mut completion_key,
                &raw mut overlapped,
                milliseconds,
            )
        };

        // A failed call with a non-null OVERLAPPED means the dequeued operation failed. A failed
        // call with a null OVERLAPPED means nothing was dequeued.
        CompletionPacket {
            bytes_transferred,
            completion_key,
            descriptor: overlapped.addr(),
            result: check(success),
        }
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn cancel_io_ex(
        &self,
        file_handle: NativeHandle,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<(), OsError> {
        // SAFETY: No safety requirements. The OVERLAPPED is only used as a lookup key.
        check(unsafe {
            CancelIoEx(
                as_raw(file_handle),
                overlapped.cast_const().cast::<OVERLAPPED>(),
            )
        })
    }

    #[cfg_attr(test, mutants::skip)] // Real PAL behavior is not meaningful to mutate, we try mutations manually via mock PAL.
    fn close_handle(&self, handle: NativeHandle) -> Result<(), OsError> {
        // SAFETY: No safety requirements. Closing a handle twice is logically
        // invalid but does not violate Rust language rules, so not a safety concern.
        check(unsafe { CloseHandle(as_raw(handle)) })
    }
}
