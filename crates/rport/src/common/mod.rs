//! Common types shared across the crate.
//!
//! This module provides:
//! 1. **Constants:** Protocol version, packet layout sizes and limits.
//! 2. **Errors:** Codec, protocol, bus, configuration and channel error types.
//! 3. **Lock helpers:** Poison-tolerant locking for the channel's shared state.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Wire protocol constants.
pub mod constants;
/// Error types and the crate `Result` alias.
pub mod error;

pub use error::{BusError, CodecError, ConfigError, Error, ProtocolError, Result};

/// Locks a mutex, ignoring poisoning.
///
/// A panic on one thread is the fatal-error path; the state behind the lock is
/// still consistent enough to observe termination and shut down.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait_timeout<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match cond.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}
