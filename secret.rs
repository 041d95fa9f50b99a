//! Owned, mutable buffers for secrets.
//!
//! Secrets are never stored in `String`/`&str` for dry storage: the only copy
//! lives in a [`SensitiveBuffer`], whose [`SensitiveBuffer::wipe`] overwrites
//! it in place. This is best-effort erasure; copies made by the allocator on
//! growth or by the OS (swap, core dumps) are out of reach.

use rand_core::{OsRng, RngCore};
use std::fmt;
use zeroize::Zeroize;

/// Number of random overwrite passes before the final zero pass.
pub const WIPE_PASSES: usize = 3;

pub struct SensitiveBuffer {
    bytes: Vec<u8>,
    wiped: bool,
}

impl SensitiveBuffer {
    /// Take ownership of `bytes`. The vector is not copied.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            wiped: false,
        }
    }

    /// Copy `slice` into a fresh buffer allocated at exactly its length.
    pub fn copy_from(slice: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(slice.len());
        bytes.extend_from_slice(slice);
        Self::new(bytes)
    }

    /// Borrow the secret bytes. Callers must not copy them into longer-lived
    /// storage.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite the buffer with random bytes [`WIPE_PASSES`] times, then
    /// with zeros. Length is preserved so the result can be inspected.
    pub fn wipe(&mut self) {
        for _ in 0..WIPE_PASSES {
            OsRng.fill_bytes(&mut self.bytes);
        }
        self.bytes.as_mut_slice().zeroize();
        self.wiped = true;
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped
    }
}

impl Drop for SensitiveBuffer {
    fn drop(&mut self) {
        if !self.wiped {
            self.wipe();
        }
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SensitiveBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBuffer([REDACTED; {}])", self.bytes.len())
    }
}
