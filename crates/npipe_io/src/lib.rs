// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Blocking-style I/O on named pipe handles, with the completions of all pipes in the process
//! multiplexed over one shared I/O completion port and one dispatcher thread.
//!
//! A [`PipeFile`] wraps one end of an already connected pipe. Reads and writes look like ordinary
//! blocking calls but, when the handle supports it, they are issued as overlapped operations and
//! the calling thread waits for the completion to be routed back to it by the dispatcher of a
//! [`CompletionRegistry`]. Handles that cannot be bound to the completion port transparently fall
//! back to synchronous operating system calls.
//!
//! ```ignore
//! use npipe_io::{NativeHandle, PipeFile};
//!
//! let pipe = PipeFile::new(NativeHandle(raw_handle as usize));
//! pipe.write(b"hello")?;
//!
//! let mut buffer = [0u8; 64];
//! let bytes_read = pipe.read(&mut buffer)?;
//!
//! pipe.close()?;
//! ```
//!
//! Creating, naming and connecting pipes is outside the scope of this crate; it only consumes raw
//! handles. For testing and for use on build targets other than Windows, the crate ships an
//! [in-process simulation][simulation] of pipes and completion ports with Win32 semantics.

mod admission;
mod dispatcher;
mod error;
mod operation;
mod options;
mod pal;
mod pipe_file;
mod registry;

pub use dispatcher::DispatcherStats;
pub use error::*;
pub use options::*;
pub use pal::NativeHandle;
pub use pipe_file::*;
pub use registry::*;

/// An in-process implementation of duplex byte pipes and completion ports with Win32 semantics,
/// usable on every build target.
///
/// ```
/// use std::sync::Arc;
///
/// use npipe_io::simulation::{SimulatedBindings, SimulatedPipeOptions};
/// use npipe_io::{CompletionRegistry, PipeFile, PipeFileOptions, RegistryOptions};
///
/// let bindings = SimulatedBindings::new();
/// let registry = CompletionRegistry::simulated(&bindings, &RegistryOptions::default())?;
///
/// let (server, client) = bindings.create_pipe(&SimulatedPipeOptions::default());
/// let server = PipeFile::with_registry(server, Arc::clone(&registry), &PipeFileOptions::default());
/// let client = PipeFile::with_registry(client, registry, &PipeFileOptions::default());
///
/// client.write(b"hello")?;
///
/// let mut buffer = [0u8; 16];
/// let bytes_read = server.read(&mut buffer)?;
/// assert_eq!(&buffer[..bytes_read], b"hello");
/// # Ok::<(), npipe_io::Error>(())
/// ```
pub mod simulation {
    pub use crate::pal::{SimulatedBindings, SimulatedPipeOptions};
}
