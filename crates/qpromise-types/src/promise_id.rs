use crate::error::{CoreError, ErrorKind};
use sha2::{Digest, Sha256};
use std::fmt;

pub const MAX_CALL_DEPTH: usize = 64;

/// Encodes a promise's position in its creation tree using Dewey notation.
///
/// `root` identifies the chain or queue the promise belongs to; `path`
/// encodes the sequence of child operations beneath it. Has no bearing on
/// settlement semantics — it exists purely so a durability backing and
/// structured logs have a stable, human-readable key
/// (`a1b2c3d4.0.1.3`) to correlate against.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PromiseId {
    root: [u8; 32],
    path: Vec<u32>,
}

impl PromiseId {
    /// Root-level id (empty path) from a pre-computed hash.
    pub fn new(root: [u8; 32]) -> Self {
        Self {
            root,
            path: Vec::new(),
        }
    }

    /// Derive a deterministic root id from a scope name plus a caller-chosen
    /// identifier (e.g. a queue's `resource_id`).
    ///
    /// `SHA-256(scope_len || scope || key_len || key)`, each field
    /// length-prefixed (little-endian u32) to avoid concatenation
    /// collisions.
    pub fn root_for(scope: &str, key: &str) -> Self {
        let mut hasher = Sha256::new();
        let scope_bytes = scope.as_bytes();
        hasher.update((scope_bytes.len() as u32).to_le_bytes());
        hasher.update(scope_bytes);
        let key_bytes = key.as_bytes();
        hasher.update((key_bytes.len() as u32).to_le_bytes());
        hasher.update(key_bytes);
        let hash: [u8; 32] = hasher.finalize().into();
        Self::new(hash)
    }

    /// Derive a fresh, unpredictable root id for an anonymous promise.
    pub fn anonymous_root(seed: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"qpromise.anonymous");
        hasher.update(seed.to_le_bytes());
        let hash: [u8; 32] = hasher.finalize().into();
        Self::new(hash)
    }

    /// Create a child id by appending a sequence number to the path.
    ///
    /// `seq` is the caller's local counter at this depth (e.g. the Nth
    /// `then()` off this promise, or the Nth operation on this queue).
    pub fn child(&self, seq: u32) -> Result<Self, CoreError> {
        if self.path.len() >= MAX_CALL_DEPTH {
            return Err(CoreError::new(
                ErrorKind::InvalidArgument,
                format!("max call depth of {MAX_CALL_DEPTH} exceeded"),
            ));
        }
        let mut new_path = self.path.clone();
        new_path.push(seq);
        Ok(Self {
            root: self.root,
            path: new_path,
        })
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn root_bytes(&self) -> &[u8; 32] {
        &self.root
    }

    pub fn path(&self) -> &[u32] {
        &self.path
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.root[..4]))?;
        for seg in &self.path {
            write!(f, ".{seg}")?;
        }
        Ok(())
    }
}
