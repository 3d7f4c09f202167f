// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Level, event};

use crate::admission::AdmissionGate;
use crate::operation::{Begin, OperationToken};
use crate::pal::{Bindings, CompletionDescriptor, ERROR_BROKEN_PIPE, NativeHandle};
use crate::{CompletionRegistry, Error, OsError, PipeFileOptions, Result};

/// Blocking reads and writes on one end of a connected named pipe, with completions of
/// overlapped operations delivered through a shared [`CompletionRegistry`].
///
/// At construction, the pipe file tries to bind the handle to the registry's completion port
/// and to disable completion notifications for operations that complete synchronously. If both
/// succeed, the pipe file is *asynchronous*: every operation is an overlapped operation, the
/// calling thread waits until the dispatcher delivers the completion and no thread is dedicated
/// to the handle. Otherwise it is *synchronous* for its whole life: every operation is a
/// blocking operating system call. Both modes produce identical results.
///
/// Operations may be issued from any number of threads concurrently. They are not ordered with
/// respect to each other.
///
/// # Closing
///
/// [`close()`][Self::close] stops admitting new operations, waits until every admitted operation
/// has returned and then releases the handle. Dropping a pipe file that was not closed does the
/// same, logging a failure to release the handle instead of reporting it.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug)]
pub struct PipeFile {
    handle: NativeHandle,
    registry: Arc<CompletionRegistry>,
    asynchronous: bool,
    gate: AdmissionGate,
}

impl PipeFile {
    /// Takes ownership of an open, connected pipe handle and uses it via the process-wide
    /// completion registry, creating the registry if this is the first pipe file in the process.
    ///
    /// # Panics
    ///
    /// Panics if the process-wide completion registry cannot be created.
    #[cfg(windows)]
    #[must_use]
    pub fn new(handle: NativeHandle) -> Self {
        Self::with_registry(
            handle,
            Arc::clone(CompletionRegistry::global()),
            &PipeFileOptions::default(),
        )
    }

    /// Takes ownership of an open, connected pipe handle and uses it via the given registry. The
    /// handle must belong to the bindings the registry was created with.
    #[must_use]
    pub fn with_registry(
        handle: NativeHandle,
        registry: Arc<CompletionRegistry>,
        options: &PipeFileOptions,
    ) -> Self {
        // A handle that is bound to the port but still queues completions for synchronously
        // completed operations cannot be used asynchronously. Such a handle falls back to
        // blocking calls, which do not involve the port.
        let asynchronous = !options.synchronous_only()
            && registry.associate(handle)
            && registry.configure_notification_skipping(handle);

        event!(Level::DEBUG, message = "pipe file opened", %handle, asynchronous);

        Self {
            handle,
            registry,
            asynchronous,
            gate: AdmissionGate::default(),
        }
    }

    /// Reads up to `buffer.len()` bytes, blocking until at least one byte is available.
    ///
    /// # Errors
    ///
    /// * [`Error::EndOfStream`] if the peer has closed the pipe and all data has been read.
    /// * [`Error::Closing`] if the pipe file is closed or closing.
    /// * [`Error::Os`] for any other failure reported by the operating system.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        self.read_core(buffer, None)
    }

    /// Like [`read()`][Self::read] but gives up after `timeout`, in which case the operation is
    /// canceled and [`Error::TimedOut`] is returned. An operation that completes while being
    /// canceled returns its actual result instead.
    ///
    /// Synchronous pipe files cannot cancel operations and ignore the timeout.
    ///
    /// # Errors
    ///
    /// As [`read()`][Self::read], plus [`Error::TimedOut`].
    pub fn read_timeout(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_core(buffer, Some(timeout))
    }

    /// Writes up to `buffer.len()` bytes, blocking until the operating system has accepted them.
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// * [`Error::Closing`] if the pipe file is closed or closing.
    /// * [`Error::Os`] for any failure reported by the operating system, e.g. `ERROR_NO_DATA` when
    ///   the peer has closed the pipe.
    pub fn write(&self, buffer: &[u8]) -> Result<usize> {
        self.write_core(buffer, None)
    }

    /// Like [`write()`][Self::write] but gives up after `timeout`, in which case the operation is
    /// canceled and [`Error::TimedOut`] is returned. An operation that completes while being
    /// canceled returns its actual result instead.
    ///
    /// Synchronous pipe files cannot cancel operations and ignore the timeout.
    ///
    /// # Errors
    ///
    /// As [`write()`][Self::write], plus [`Error::TimedOut`].
    pub fn write_timeout(&self, buffer: &[u8], timeout: Duration) -> Result<usize> {
        self.write_core(buffer, Some(timeout))
    }

    /// Stops admitting new operations, waits for all admitted operations to return and releases
    /// the handle.
    ///
    /// # Errors
    ///
    /// * [`Error::Closing`] if the pipe file was already closed or is being closed by another
    ///   thread.
    /// * [`Error::Os`] if the operating system fails to release the handle.
    pub fn close(&self) -> Result<()> {
        if !self.gate.close_and_drain() {
            return Err(Error::Closing);
        }

        self.release()
    }

    /// Whether operations are completed through the completion port (as opposed to blocking
    /// operating system calls).
    #[must_use]
    pub const fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// Number of operations that have been admitted and have not returned yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// The handle owned by this pipe file.
    #[must_use]
    pub const fn as_native_handle(&self) -> NativeHandle {
        self.handle
    }

    fn read_core(&self, buffer: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let _permit = self.gate.admit().ok_or(Error::Closing)?;

        if buffer.is_empty() {
            return Ok(0);
        }

        let bindings = self.registry.bindings();
        let len = clamp_len(buffer.len());
        let data = buffer.as_mut_ptr();

        let result = if self.asynchronous {
            self.overlapped(timeout, |descriptor| {
                // SAFETY: The buffer is exclusively borrowed until `overlapped()` returns, which
                // only happens after the operation has completed.
                unsafe { bindings.read_file(self.handle, data, len, descriptor) }
            })
        } else {
            // SAFETY: The buffer is valid for `len` bytes and the call blocks until it is done.
            unsafe { bindings.read_file(self.handle, data, len, ptr::null_mut()) }
                .map_err(Error::from)
        };

        match result {
            Ok(bytes_read) => Ok(bytes_read as usize),
            Err(Error::Os(ERROR_BROKEN_PIPE)) => {
                event!(Level::TRACE, message = "end of stream", handle = %self.handle);
                Err(Error::EndOfStream)
            }
            Err(error) => Err(error),
        }
    }

    fn write_core(&self, buffer: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let _permit = self.gate.admit().ok_or(Error::Closing)?;

        if buffer.is_empty() {
            return Ok(0);
        }

        let bindings = self.registry.bindings();
        let len = clamp_len(buffer.len());
        let data = buffer.as_ptr();

        let bytes_written = if self.asynchronous {
            self.overlapped(timeout, |descriptor| {
                // SAFETY: The buffer is borrowed until `overlapped()` returns, which only happens
                // after the operation has completed.
                unsafe { bindings.write_file(self.handle, data, len, descriptor) }
            })?
        } else {
            // SAFETY: The buffer is valid for `len` bytes and the call blocks until it is done.
            unsafe { bindings.write_file(self.handle, data, len, ptr::null_mut()) }?
        };

        Ok(bytes_written as usize)
    }

    /// Starts an overlapped operation and returns its result once it has completed, either
    /// immediately or via the dispatcher.
    fn overlapped<F>(&self, timeout: Option<Duration>, start: F) -> Result<u32>
    where
        F: FnOnce(*mut CompletionDescriptor) -> std::result::Result<u32, OsError>,
    {
        match OperationToken::begin(start) {
            Begin::Completed(result) => Ok(result?),
            Begin::Pending(pending) => match timeout {
                None => pending.wait(),
                Some(timeout) => pending.wait_timeout(timeout, |descriptor| {
                    self.registry.cancel(self.handle, descriptor);
                }),
            },
        }
    }

    fn release(&self) -> Result<()> {
        event!(Level::DEBUG, message = "pipe file closed", handle = %self.handle);

        Ok(self.registry.bindings().close_handle(self.handle)?)
    }
}

impl Drop for PipeFile {
    fn drop(&mut self) {
        if !self.gate.close_and_drain() {
            // Already closed explicitly.
            return;
        }

        if let Err(error) = self.release() {
            event!(Level::WARN, message = "failed to release pipe handle", handle = %self.handle, %error);
        }
    }
}

fn clamp_len(len: usize) -> u32 {
    // Larger buffers are filled partially, as with any short read or write.
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl io::Read for &PipeFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match PipeFile::read(self, buf) {
            Err(Error::EndOfStream) => Ok(0),
            result => Ok(result?),
        }
    }
}

impl io::Write for &PipeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(PipeFile::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Writes are not buffered.
        Ok(())
    }
}

impl io::Read for PipeFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for PipeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &*self)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use mockall::predicate::eq;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::pal::{
        BindingsFacade, CompletionPacket, ERROR_INVALID_PARAMETER, ERROR_IO_PENDING,
        ERROR_NO_DATA, ERROR_NOT_SUPPORTED, ERROR_OPERATION_ABORTED, INVALID_HANDLE_VALUE,
        MockBindings,
    };

    const PORT: NativeHandle = NativeHandle(0x40);
    const PIPE: NativeHandle = NativeHandle(0x80);

    /// Mock bindings that create the port, accept association and notification skipping, and
    /// expect the pipe handle to be released exactly once.
    fn async_bindings() -> MockBindings {
        let mut bindings = MockBindings::new();

        bindings
            .expect_create_io_completion_port()
            .withf(|file, _, _, _| *file == INVALID_HANDLE_VALUE)
            .times(1)
            .return_const(Ok(PORT));
        bindings
            .expect_create_io_completion_port()
            .with(eq(PIPE), eq(Some(PORT)), eq(0), eq(1))
            .times(1)
            .return_const(Ok(PORT));
        bindings
            .expect_set_file_completion_notification_modes()
            .times(1)
            .return_const(Ok(()));
        bindings
            .expect_close_handle()
            .with(eq(PIPE))
            .times(1)
            .return_const(Ok(()));

        bindings
    }

    fn sync_bindings() -> MockBindings {
        let mut bindings = MockBindings::new();

        bindings
            .expect_create_io_completion_port()
            .withf(|file, _, _, _| *file == INVALID_HANDLE_VALUE)
            .times(1)
            .return_const(Ok(PORT));
        bindings
            .expect_close_handle()
            .with(eq(PIPE))
            .times(1)
            .return_const(Ok(()));

        bindings
    }

    fn registry(bindings: MockBindings) -> Arc<CompletionRegistry> {
        Arc::new(CompletionRegistry::create(BindingsFacade::from_mock(bindings), 1).unwrap())
    }

    fn open(bindings: MockBindings, options: &PipeFileOptions) -> PipeFile {
        PipeFile::with_registry(PIPE, registry(bindings), options)
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(PipeFile: Send, Sync);
    }

    #[test]
    fn asynchronous_when_port_accepts_handle() {
        let file = open(async_bindings(), &PipeFileOptions::default());

        assert!(file.is_asynchronous());
        assert_eq!(file.as_native_handle(), PIPE);
        assert_eq!(file.in_flight(), 0);
    }

    #[test]
    fn synchronous_only_skips_association() {
        let file = open(
            sync_bindings(),
            &PipeFileOptions::default().with_synchronous_only(true),
        );

        assert!(!file.is_asynchronous());
    }

    #[test]
    fn association_failure_downgrades() {
        let mut bindings = sync_bindings();
        bindings
            .expect_create_io_completion_port()
            .with(eq(PIPE), eq(Some(PORT)), eq(0), eq(1))
            .times(1)
            .return_const(Err(ERROR_INVALID_PARAMETER));

        let file = open(bindings, &PipeFileOptions::default());
        assert!(!file.is_asynchronous());
    }

    #[test]
    fn skip_mode_failure_downgrades() {
        let mut bindings = sync_bindings();
        bindings
            .expect_create_io_completion_port()
            .with(eq(PIPE), eq(Some(PORT)), eq(0), eq(1))
            .times(1)
            .return_const(Ok(PORT));
        bindings
            .expect_set_file_completion_notification_modes()
            .times(1)
            .return_const(Err(ERROR_NOT_SUPPORTED));

        let file = open(bindings, &PipeFileOptions::default());
        assert!(!file.is_asynchronous());
    }

    #[test]
    fn synchronous_read_uses_no_descriptor() {
        let mut bindings = sync_bindings();
        bindings
            .expect_read_file()
            .withf(|handle, _, len, descriptor| {
                *handle == PIPE && *len == 16 && descriptor.is_null()
            })
            .times(1)
            .returning(|_, buffer, _, _| {
                // SAFETY: The buffer is valid for 16 bytes.
                unsafe { ptr::copy_nonoverlapping(b"hello".as_ptr(), buffer, 5) };
                Ok(5)
            });

        let file = open(bindings, &PipeFileOptions::default().with_synchronous_only(true));

        let mut buffer = [0u8; 16];
        assert_eq!(file.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"hello");
    }

    #[test]
    fn immediate_completion_is_returned_inline() {
        let mut bindings = async_bindings();
        bindings
            .expect_write_file()
            .withf(|handle, _, len, descriptor| {
                *handle == PIPE && *len == 3 && !descriptor.is_null()
            })
            .times(1)
            .return_const(Ok(3));

        let file = open(bindings, &PipeFileOptions::default());
        assert_eq!(file.write(b"abc").unwrap(), 3);
        assert_eq!(file.registry.stats().delivered, 0);
    }

    #[test]
    fn broken_pipe_read_is_end_of_stream() {
        let mut bindings = sync_bindings();
        bindings
            .expect_read_file()
            .times(1)
            .return_const(Err(ERROR_BROKEN_PIPE));

        let file = open(bindings, &PipeFileOptions::default().with_synchronous_only(true));

        let mut buffer = [0u8; 4];
        assert!(matches!(file.read(&mut buffer), Err(Error::EndOfStream)));
    }

    #[test]
    fn write_error_is_surfaced_verbatim() {
        let mut bindings = async_bindings();
        bindings
            .expect_write_file()
            .times(1)
            .return_const(Err(ERROR_NO_DATA));

        let file = open(bindings, &PipeFileOptions::default());
        assert!(matches!(file.write(b"x"), Err(Error::Os(ERROR_NO_DATA))));
    }

    #[test]
    fn empty_buffers_do_not_call_os() {
        let file = open(async_bindings(), &PipeFileOptions::default());

        assert_eq!(file.read(&mut []).unwrap(), 0);
        assert_eq!(file.write(&[]).unwrap(), 0);
    }

    #[test]
    fn pending_read_completes_via_dispatch() {
        let address = Arc::new(AtomicUsize::new(0));

        let mut bindings = async_bindings();
        bindings.expect_read_file().times(1).returning({
            let address = Arc::clone(&address);
            move |_, buffer, _, descriptor| {
                // SAFETY: The buffer is valid for 8 bytes until the completion is delivered.
                unsafe { ptr::copy_nonoverlapping(b"later".as_ptr(), buffer, 5) };
                address.store(descriptor.addr(), Ordering::SeqCst);
                Err(ERROR_IO_PENDING)
            }
        });
        bindings
            .expect_get_queued_completion_status()
            .times(1)
            .returning({
                let address = Arc::clone(&address);
                move |_, _| {
                    let descriptor = loop {
                        match address.load(Ordering::SeqCst) {
                            0 => thread::yield_now(),
                            descriptor => break descriptor,
                        }
                    };

                    CompletionPacket {
                        bytes_transferred: 5,
                        completion_key: 0,
                        descriptor,
                        result: Ok(()),
                    }
                }
            });

        let file = open(bindings, &PipeFileOptions::default());

        thread::scope(|s| {
            s.spawn(|| file.registry.dispatch_next(0));

            let mut buffer = [0u8; 8];
            assert_eq!(file.read(&mut buffer).unwrap(), 5);
            assert_eq!(&buffer[..5], b"later");
        });

        assert_eq!(file.registry.stats().delivered, 1);
        assert_eq!(file.in_flight(), 0);
    }

    #[test]
    fn timed_out_write_is_canceled() {
        let address = Arc::new(AtomicUsize::new(0));

        let mut bindings = async_bindings();
        bindings.expect_write_file().times(1).returning({
            let address = Arc::clone(&address);
            move |_, _, _, descriptor| {
                address.store(descriptor.addr(), Ordering::SeqCst);
                Err(ERROR_IO_PENDING)
            }
        });
        bindings
            .expect_cancel_io_ex()
            .withf(|handle, _| *handle == PIPE)
            .times(1)
            .returning(|_, descriptor| {
                // The cancellation wins: the aborted operation is completed right away.
                // SAFETY: The descriptor belongs to the pending write, completed once.
                unsafe { OperationToken::complete(descriptor.addr(), Err(ERROR_OPERATION_ABORTED)) };
                Ok(())
            });

        let file = open(bindings, &PipeFileOptions::default());

        let result = file.write_timeout(b"stuck", Duration::from_millis(10));
        assert!(matches!(result, Err(Error::TimedOut)));
        assert_ne!(address.load(Ordering::SeqCst), 0);
        assert_eq!(file.in_flight(), 0);
    }

    #[test]
    fn closed_file_rejects_operations() {
        let file = open(async_bindings(), &PipeFileOptions::default());

        file.close().unwrap();

        let mut buffer = [0u8; 4];
        assert!(matches!(file.read(&mut buffer), Err(Error::Closing)));
        assert!(matches!(file.write(b"x"), Err(Error::Closing)));
        assert!(matches!(file.close(), Err(Error::Closing)));

        // Drop does not release the handle a second time, which the mock would reject.
        drop(file);
    }

    #[test]
    fn close_reports_release_failure() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_create_io_completion_port()
            .times(1)
            .return_const(Ok(PORT));
        bindings
            .expect_close_handle()
            .times(1)
            .return_const(Err(OsError(6)));

        let file = open(bindings, &PipeFileOptions::default().with_synchronous_only(true));
        assert!(matches!(file.close(), Err(Error::Os(OsError(6)))));
    }

    #[test]
    fn drop_releases_handle() {
        // The mock verifies on drop that the handle was released once.
        let file = open(sync_bindings(), &PipeFileOptions::default().with_synchronous_only(true));
        drop(file);
    }

    #[test]
    fn std_io_adapters() {
        let mut bindings = sync_bindings();
        bindings
            .expect_write_file()
            .times(1)
            .return_const(Ok(2));
        bindings
            .expect_read_file()
            .times(1)
            .return_const(Err(ERROR_BROKEN_PIPE));

        let mut file = open(bindings, &PipeFileOptions::default().with_synchronous_only(true));

        file.write_all(b"hi").unwrap();
        file.flush().unwrap();

        // End of stream is a zero-length read in the std::io world.
        let mut buffer = [0u8; 4];
        assert_eq!(Read::read(&mut file, &mut buffer).unwrap(), 0);

        file.close().unwrap();

        let error = Write::write(&mut file, b"x").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
    }
}
