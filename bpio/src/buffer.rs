//! Owned buffers
//!
//! [`PayloadBuffer`] is the writer-side growable byte region with an
//! explicit capacity, growth factor and ceiling. Positions handed out by it
//! are absolute: bytes already flushed to a transport are still counted.
//!
//! [`SharedBuffer`] is the user-facing handle for deferred Put/Get. The
//! engine reads or fills it when the deferred operation executes, so any
//! mutation made before that point is what gets written.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::params::{BufferOverflowPolicy, EngineParams};

/// Sizing rules of a payload buffer
#[derive(Debug, Clone, Copy)]
pub struct BufferPolicy {
    pub initial_size: u64,
    pub growth_factor: f64,
    pub max_size: u64,
    pub overflow: BufferOverflowPolicy,
}

impl BufferPolicy {
    pub fn from_params(params: &EngineParams) -> Self {
        Self {
            initial_size: params.initial_buffer_size,
            growth_factor: params.buffer_growth_factor,
            max_size: params.max_buffer_size,
            overflow: params.buffer_overflow_policy,
        }
    }
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self::from_params(&EngineParams::default())
    }
}

/// Result of asking a buffer for room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserve {
    /// The bytes fit (possibly after growing)
    Ready,
    /// The ceiling was hit; the caller must spill and retry
    Spill,
}

/// Growable payload buffer with absolute positions
#[derive(Debug)]
pub struct PayloadBuffer {
    data: Vec<u8>,
    /// Absolute position of `data[0]`
    base: u64,
    policy: BufferPolicy,
}

impl PayloadBuffer {
    pub fn new(policy: BufferPolicy, base: u64) -> Self {
        let initial = policy.initial_size.min(policy.max_size).min(usize::MAX as u64) as usize;
        Self {
            data: Vec::with_capacity(initial),
            base,
            policy,
        }
    }

    /// Absolute position of the next byte
    pub fn position(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    /// Absolute position of the first buffered byte
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Make room for `additional` bytes according to the policy
    pub fn reserve(&mut self, additional: usize) -> Result<Reserve> {
        let needed = self.data.len() as u64 + additional as u64;
        if needed <= self.data.capacity() as u64 {
            return Ok(Reserve::Ready);
        }

        if needed > self.policy.max_size {
            let fits_after_spill = additional as u64 <= self.policy.max_size;
            return match self.policy.overflow {
                BufferOverflowPolicy::Flush if fits_after_spill && !self.data.is_empty() => {
                    Ok(Reserve::Spill)
                }
                _ => Err(Error::OutOfMemory {
                    requested: needed,
                    max: self.policy.max_size,
                }),
            };
        }

        let grown = (self.data.capacity() as f64 * self.policy.growth_factor) as u64;
        let target = grown.max(needed).min(self.policy.max_size);
        self.data.reserve_exact(target as usize - self.data.len());
        Ok(Reserve::Ready)
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Hand out the buffered bytes and advance the base past them
    pub fn take(&mut self) -> Vec<u8> {
        let capacity = self.data.capacity();
        let taken = std::mem::replace(&mut self.data, Vec::with_capacity(capacity));
        self.base += taken.len() as u64;
        taken
    }

    /// Move the base, used when the buffer is reused for a new stream step
    pub fn reset_base(&mut self, base: u64) {
        debug_assert!(self.data.is_empty());
        self.base = base;
    }
}

/// Shared, lockable element buffer for deferred operations
#[derive(Debug, Default)]
pub struct SharedBuffer<T> {
    inner: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedBuffer<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.inner.write()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> SharedBuffer<T> {
    /// Copy the current contents out
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.read().clone()
    }
}

impl<T> From<Vec<T>> for SharedBuffer<T> {
    fn from(values: Vec<T>) -> Self {
        Self::new(values)
    }
}
