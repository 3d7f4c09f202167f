// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform abstraction layer. Every FFI call made by this crate goes through the [`Bindings`]
//! trait so that the engine can run against the real operating system, the in-process
//! simulation or (in unit tests) mock bindings.

mod abstractions;
mod constants;
mod facade;
mod simulated;

pub use abstractions::*;
pub use constants::*;
pub use facade::*;
pub use simulated::*;

#[cfg(windows)]
mod real;
#[cfg(windows)]
pub use real::*;
