// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;

const DEFAULT_DISPATCHER_THREAD_NAME: &str = "npipe-dispatcher";

/// Configures a [`CompletionRegistry`][crate::CompletionRegistry] and its dispatcher thread.
///
/// The process-wide registry always uses the default options.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RegistryOptions {
    dispatcher_thread_name: Cow<'static, str>,
    concurrency: u32,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            dispatcher_thread_name: Cow::Borrowed(DEFAULT_DISPATCHER_THREAD_NAME),
            concurrency: 1,
        }
    }
}

impl RegistryOptions {
    /// Name of the dispatcher thread, visible in debuggers and panic messages.
    #[must_use]
    pub fn with_dispatcher_thread_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.dispatcher_thread_name = name.into();
        self
    }

    /// Number of threads the operating system allows to process completions concurrently.
    ///
    /// There is only ever one dispatcher thread per registry, so values above 1 have no effect
    /// other than being passed to the operating system.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Name of the dispatcher thread.
    #[must_use]
    pub fn dispatcher_thread_name(&self) -> &str {
        &self.dispatcher_thread_name
    }

    /// Concurrency value passed to the operating system.
    #[must_use]
    pub const fn concurrency(&self) -> u32 {
        self.concurrency
    }
}

/// Configures a [`PipeFile`][crate::PipeFile].
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct PipeFileOptions {
    synchronous_only: bool,
}

impl PipeFileOptions {
    /// Skips association with the completion port. All operations are then performed as blocking
    /// operating system calls on the calling thread.
    #[must_use]
    pub const fn with_synchronous_only(mut self, synchronous_only: bool) -> Self {
        self.synchronous_only = synchronous_only;
        self
    }

    /// Whether association with the completion port is skipped.
    #[must_use]
    pub const fn synchronous_only(&self) -> bool {
        self.synchronous_only
    }
}
