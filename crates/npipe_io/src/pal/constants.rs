// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Win32 constants used by the engine. They are defined here rather than imported from
//! `windows-sys` because the simulated platform needs the same values on every build target.

use crate::OsError;
use crate::pal::NativeHandle;

/// The handle value passed to `CreateIoCompletionPort` when creating a new port.
pub const INVALID_HANDLE_VALUE: NativeHandle = NativeHandle(usize::MAX);

/// Wait timeout meaning "wait forever".
pub const INFINITE: u32 = u32::MAX;

/// Skips queueing a completion packet when an overlapped call completes synchronously.
pub const FILE_SKIP_COMPLETION_PORT_ON_SUCCESS: u8 = 0x1;

/// Skips signaling the handle as an event when an overlapped call completes.
pub const FILE_SKIP_SET_EVENT_ON_HANDLE: u8 = 0x2;

pub const ERROR_INVALID_HANDLE: OsError = OsError(6);
pub const ERROR_NOT_SUPPORTED: OsError = OsError(50);
pub const ERROR_INVALID_PARAMETER: OsError = OsError(87);
pub const ERROR_BROKEN_PIPE: OsError = OsError(109);
pub const ERROR_NO_DATA: OsError = OsError(232);
pub const WAIT_TIMEOUT: OsError = OsError(258);
pub const ERROR_OPERATION_ABORTED: OsError = OsError(995);
pub const ERROR_IO_PENDING: OsError = OsError(997);
pub const ERROR_NOT_FOUND: OsError = OsError(1168);
