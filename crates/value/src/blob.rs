//! Byte blobs
//!
//! Raw column bytes, compared and hashed by content.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An owned byte buffer with content equality and lexicographic order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Blob(Vec<u8>);

impl Blob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_order() {
        let a = Blob::from(&b"abc"[..]);
        let b = Blob::from(&b"abd"[..]);
        let prefix = Blob::from(&b"ab"[..]);

        assert!(a < b);
        assert!(prefix < a);
        assert_eq!(a, Blob::new(b"abc".to_vec()));
    }

    #[test]
    fn test_hash_by_content() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Blob::from(&b"k"[..]));
        assert!(set.contains(&Blob::new(b"k".to_vec())));
    }
}
