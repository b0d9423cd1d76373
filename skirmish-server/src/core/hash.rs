//! Canonical state hashing.
//!
//! Snapshots carry a SHA-256 digest of the session so a mirror can check its
//! reconstruction against the authority, and archives record the digest of
//! the final state. Values reach the hasher through [`Canonical`], which
//! fixes byte order and length-prefixes anything variable, so two different
//! states never feed the same byte stream.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// SHA-256 output.
pub type StateHash = [u8; 32];

/// Domain tag for combat session digests.
pub const SESSION_DOMAIN: &[u8] = b"SKIRMISH_STATE_V1";

/// A value with a fixed, platform-independent byte encoding.
pub trait Canonical {
    fn feed(&self, hasher: &mut StateHasher);
}

/// Streaming hasher over [`Canonical`] values.
pub struct StateHasher {
    inner: Sha256,
}

impl StateHasher {
    pub fn new(domain: &[u8]) -> Self {
        let mut inner = Sha256::new();
        inner.update((domain.len() as u32).to_le_bytes());
        inner.update(domain);
        Self { inner }
    }

    /// Feed one value. Calls chain.
    pub fn write<T: Canonical + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.feed(self);
        self
    }

    pub fn finish(self) -> StateHash {
        self.inner.finalize().into()
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn len_prefix(&mut self, len: usize) {
        self.raw(&(len as u64).to_le_bytes());
    }
}

/// Digest of a single value under `domain`.
pub fn digest<T: Canonical + ?Sized>(domain: &[u8], value: &T) -> StateHash {
    let mut hasher = StateHasher::new(domain);
    hasher.write(value);
    hasher.finish()
}

macro_rules! canonical_int {
    ($($ty:ty),*) => {
        $(
            impl Canonical for $ty {
                fn feed(&self, hasher: &mut StateHasher) {
                    hasher.raw(&self.to_le_bytes());
                }
            }
        )*
    };
}

canonical_int!(u8, u32, u64, i32);

impl Canonical for bool {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher.raw(&[u8::from(*self)]);
    }
}

impl Canonical for str {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher.len_prefix(self.len());
        hasher.raw(self.as_bytes());
    }
}

impl Canonical for String {
    fn feed(&self, hasher: &mut StateHasher) {
        self.as_str().feed(hasher);
    }
}

impl<T: Canonical> Canonical for Option<T> {
    fn feed(&self, hasher: &mut StateHasher) {
        match self {
            Some(value) => {
                hasher.raw(&[1]);
                value.feed(hasher);
            }
            None => hasher.raw(&[0]),
        }
    }
}

impl<T: Canonical> Canonical for [T] {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher.len_prefix(self.len());
        for item in self {
            item.feed(hasher);
        }
    }
}

impl<T: Canonical> Canonical for Vec<T> {
    fn feed(&self, hasher: &mut StateHasher) {
        self.as_slice().feed(hasher);
    }
}

impl<K: Canonical, V: Canonical> Canonical for BTreeMap<K, V> {
    fn feed(&self, hasher: &mut StateHasher) {
        hasher.len_prefix(self.len());
        for (key, value) in self {
            key.feed(hasher);
            value.feed(hasher);
        }
    }
}
