use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Serialize, Serializer};

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `tsumiki` a `Digest` serves two purposes:
/// 1. It fingerprints every [`Value`](crate::Value) that takes part in a node
///    key, so that equal inputs land in the same memoized node.
/// 2. It summarizes external data read by primitive nodes, such as the
///    content of a file or the captured output of a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest([u8; 32]);

impl<T> From<T> for Digest
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Digest(value.into())
    }
}

impl Digest {
    /// Hashes a buffer.
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a file on disk, memory-mapping it and splitting the work across
    /// the rayon pool for large inputs.
    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    /// Hashes anything implementing [`std::hash::Hash`].
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    /// Combines several digests, order-sensitive.
    pub fn combine<'a>(digests: impl IntoIterator<Item = &'a Digest>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for digest in digests {
            hasher.update(&digest.0);
        }
        hasher.finalize().into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Short form used in logs.
    pub(crate) fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Adapter feeding [`std::hash::Hash`] implementations into BLAKE3.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Digest {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Digest::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Locks a mutex, recovering the guard if another thread panicked while
/// holding it. Every structure guarded this way is left consistent between
/// statements, so the data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_length() {
        let digest = Digest::hash(b"tsumiki");
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest.short(), hex[..12]);
    }

    #[test]
    fn test_hash_of_is_stable() {
        let a = Digest::of(&("bob", 1u32));
        let b = Digest::of(&("bob", 1u32));
        let c = Digest::of(&("alice", 1u32));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_combine_is_order_sensitive() {
        let a = Digest::hash("a");
        let b = Digest::hash("b");
        assert_ne!(Digest::combine([&a, &b]), Digest::combine([&b, &a]));
    }

    #[test]
    fn test_serialize_as_hex() {
        let digest = Digest::hash("x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));
    }
}
