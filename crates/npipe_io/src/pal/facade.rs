// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockBindings;
#[cfg(windows)]
use crate::pal::BuildTargetBindings;
use crate::pal::{
    Bindings, CompletionDescriptor, CompletionPacket, NativeHandle, SimulatedBindings,
};
use crate::OsError;

// Hides the difference between real, simulated and mock bindings behind a common facade.
#[derive(Clone, Debug)]
pub enum BindingsFacade {
    #[cfg(windows)]
    Real(&'static BuildTargetBindings),

    Simulated(Arc<SimulatedBindings>),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

impl BindingsFacade {
    #[cfg(windows)]
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    pub const fn real() -> Self {
        Self::Real(&BuildTargetBindings)
    }

    #[cfg(test)]
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    pub fn from_mock(bindings: MockBindings) -> Self {
        Self::Mock(Arc::new(bindings))
    }
}

impl From<Arc<SimulatedBindings>> for BindingsFacade {
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn from(bindings: Arc<SimulatedBindings>) -> Self {
        Self::Simulated(bindings)
    }
}

/// Forwards a call to whichever bindings are behind the facade.
macro_rules! delegate {
    ($self:ident, $bindings:ident => $call:expr) => {
        match $self {
            #[cfg(windows)]
            Self::Real($bindings) => $call,
            Self::Simulated($bindings) => $call,
            #[cfg(test)]
            Self::Mock($bindings) => $call,
        }
    };
}

impl Bindings for BindingsFacade {
    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn create_io_completion_port(
        &self,
        file_handle: NativeHandle,
        existing_completion_port: Option<NativeHandle>,
        completion_key: usize,
        number_of_concurrent_threads: u32,
    ) -> Result<NativeHandle, OsError> {
        delegate!(self, bindings => bindings.create_io_completion_port(
            file_handle,
            existing_completion_port,
            completion_key,
            number_of_concurrent_threads,
        ))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn set_file_completion_notification_modes(
        &self,
        file_handle: NativeHandle,
        flags: u8,
    ) -> Result<(), OsError> {
        // SAFETY: Forwarding safety requirements.
        delegate!(self, bindings => unsafe {
            bindings.set_file_completion_notification_modes(file_handle, flags)
        })
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn read_file(
        &self,
        file_handle: NativeHandle,
        buffer: *mut u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError> {
        // SAFETY: Forwarding safety requirements.
        delegate!(self, bindings => unsafe {
            bindings.read_file(file_handle, buffer, len, overlapped)
        })
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    unsafe fn write_file(
        &self,
        file_handle: NativeHandle,
        buffer: *const u8,
        len: u32,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<u32, OsError> {
        // SAFETY: Forwarding safety requirements.
        delegate!(self, bindings => unsafe {
            bindings.write_file(file_handle, buffer, len, overlapped)
        })
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn get_queued_completion_status(
        &self,
        completion_port: NativeHandle,
        milliseconds: u32,
    ) -> CompletionPacket {
        delegate!(self, bindings => bindings.get_queued_completion_status(completion_port, milliseconds))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn cancel_io_ex(
        &self,
        file_handle: NativeHandle,
        overlapped: *mut CompletionDescriptor,
    ) -> Result<(), OsError> {
        delegate!(self, bindings => bindings.cancel_io_ex(file_handle, overlapped))
    }

    #[cfg_attr(test, mutants::skip)] // Low-impact layer, waste of time to mutate.
    fn close_handle(&self, handle: NativeHandle) -> Result<(), OsError> {
        delegate!(self, bindings => bindings.close_handle(handle))
    }
}
