//! Zeroing byte buffer for secret material
//!
//! Every pre-master, random, credential, and derived key in the engine lives
//! in a [`SecureBuf`]. The buffer scrubs its backing allocation on drop, on
//! `clear`, and on truncation, including bytes past the logical length that
//! are still reachable through the allocation.

use std::fmt;

use zeroize::Zeroize;

/// Growable byte buffer whose contents are scrubbed on release.
///
/// The backing storage is kept fully initialized at all times, with a
/// separate logical length. That way no byte of the allocation is ever
/// outside the reach of [`Zeroize`]: reallocation scrubs the old allocation,
/// truncation scrubs the cut-off tail in place, and `Drop` scrubs the whole
/// backing store.
pub struct SecureBuf {
    /// Fully-initialized backing store; `storage.len()` is the capacity.
    storage: Vec<u8>,
    /// Logical length, always `<= storage.len()`.
    len: usize,
}

impl SecureBuf {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            len: 0,
        }
    }

    /// Create an empty buffer with pre-reserved (zeroed) capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Create a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            storage: data.to_vec(),
            len: data.len(),
        }
    }

    /// Create a buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            storage: vec![0u8; len],
            len,
        }
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read-only view of the contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Mutable view of the contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[..self.len]
    }

    /// Append raw bytes, scrubbing the old allocation if growth is needed.
    pub fn append(&mut self, data: &[u8]) {
        self.grow_to(self.len + data.len());
        self.storage[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// Append a single byte.
    pub fn push(&mut self, byte: u8) {
        self.append(&[byte]);
    }

    /// Append a big-endian `u16`.
    pub fn append_u16(&mut self, value: u16) {
        self.append(&value.to_be_bytes());
    }

    /// Append a big-endian `u32`.
    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Append a 2-byte big-endian length prefix followed by the bytes.
    pub fn append_length_prefixed(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= u16::MAX as usize);
        self.append_u16(data.len() as u16);
        self.append(data);
    }

    /// Drop the first `count` bytes, scrubbing the consumed prefix.
    ///
    /// Used by reassembly paths that consume a prefix of accumulated
    /// plaintext and must not leave it behind in the allocation.
    pub fn truncate_front(&mut self, count: usize) {
        let count = count.min(self.len);
        self.storage.copy_within(count..self.len, 0);
        let new_len = self.len - count;
        self.storage[new_len..self.len].zeroize();
        self.len = new_len;
    }

    /// Shorten the buffer to `len` bytes, scrubbing the removed tail.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        self.storage[len..self.len].zeroize();
        self.len = len;
    }

    /// Scrub the entire backing store and empty the buffer.
    pub fn clear(&mut self) {
        self.storage.zeroize();
        self.len = 0;
    }

    /// Extract a null-terminated string starting at `offset`.
    ///
    /// Returns the string without its terminator, or `None` when no
    /// terminator is present in the remaining bytes or the bytes are not
    /// valid UTF-8.
    pub fn null_terminated_string(&self, offset: usize) -> Option<&str> {
        let rest = self.as_slice().get(offset..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&rest[..end]).ok()
    }

    /// Render the contents as lowercase hex.
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(self.len * 2);
        for byte in self.as_slice() {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// The bytes of the backing allocation beyond the logical length.
    ///
    /// Exposed so tests can assert the zeroing guarantee; the engine itself
    /// never reads past `len`.
    pub fn spare_capacity(&self) -> &[u8] {
        &self.storage[self.len..]
    }

    fn grow_to(&mut self, needed: usize) {
        if needed <= self.storage.len() {
            return;
        }
        let mut grown = vec![0u8; needed.next_power_of_two()];
        grown[..self.len].copy_from_slice(&self.storage[..self.len]);
        // Scrub the outgoing allocation before the allocator reclaims it.
        self.storage.zeroize();
        self.storage = grown;
    }
}

impl Drop for SecureBuf {
    fn drop(&mut self) {
        self.storage.zeroize();
    }
}

impl Default for SecureBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SecureBuf {
    fn clone(&self) -> Self {
        Self::from_slice(self.as_slice())
    }
}

impl PartialEq for SecureBuf {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.len == other.len && bool::from(self.as_slice().ct_eq(other.as_slice()))
    }
}

impl Eq for SecureBuf {}

impl AsRef<[u8]> for SecureBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for SecureBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Contents are secret; only the length is printable.
        write!(f, "SecureBuf({} bytes)", self.len)
    }
}
