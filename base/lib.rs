// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Small utilities shared by the catalog crate and the main binary: a
//! testable clock abstraction, a structured error type, a cooperative
//! shutdown channel, and string-parsing helpers.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};

/// A `HashMap` keyed on the non-cryptographic `ahash` hasher, for the many
/// small maps on hot paths (stream registry, garbage sets) that don't need
/// DoS resistance.
pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type FastHashSet<T> = std::collections::HashSet<T, ahash::RandomState>;

pub use parking_lot::{Condvar, Mutex, MutexGuard};
