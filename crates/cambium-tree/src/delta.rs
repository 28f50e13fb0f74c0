//! Opaque encoded mutations.

use std::fmt;
use std::sync::Arc;

/// One encoded tree mutation.
///
/// A `Delta` is immutable and cheap to clone; clones share the same bytes.
/// Equality is byte-wise, which is what echo suppression relies on.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Delta(Arc<[u8]>);

impl Delta {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
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

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<Vec<u8>> for Delta {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for Delta {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl AsRef<[u8]> for Delta {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 16;
        write!(f, "Delta({} bytes: ", self.0.len())?;
        for byte in self.0.iter().take(PREVIEW) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > PREVIEW {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_equality_is_bytewise() {
        let a = Delta::from(vec![1u8, 2, 3]);
        let b = Delta::from(&[1u8, 2, 3][..]);
        let c = Delta::from(vec![1u8, 2, 4]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 3);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_delta_debug_truncates() {
        let delta = Delta::from(vec![0xab; 40]);
        let text = format!("{:?}", delta);
        assert!(text.starts_with("Delta(40 bytes: abab"));
        assert!(text.ends_with("..)"));
    }
}
