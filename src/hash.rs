//! Deterministic structural hashing.
//!
//! Types list the fields that matter through [`StructuralHash`]. Each field is
//! hashed by its JSON encoding, so the result is stable across processes.
//! Set fields are hashed independent of element order. Fields that are never
//! passed to the hasher do not affect the hash at all.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Error;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub trait StructuralHash {
    fn structural_hash(&self, hasher: &mut Hasher) -> Result<(), serde_json::Error>;
}

#[derive(Clone, Default)]
pub struct Hasher {
    digest: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher::default()
    }

    /// Hashes a named field by value.
    pub fn field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<&mut Self, serde_json::Error> {
        let raw = serde_json::to_vec(value)?;
        self.write(name.as_bytes());
        self.write(&raw);
        Ok(self)
    }

    /// Hashes a named field as an unordered set.
    pub fn set<'a, I, T>(&mut self, name: &str, items: I) -> Result<&mut Self, serde_json::Error>
    where
        I: IntoIterator<Item = &'a T>,
        T: Serialize + 'a,
    {
        let mut digests = items
            .into_iter()
            .map(|item| serde_json::to_vec(item).map(|raw| Sha256::digest(&raw)))
            .collect::<Result<Vec<_>, _>>()?;
        digests.sort();

        self.write(name.as_bytes());
        self.digest.update((digests.len() as u64).to_be_bytes());
        for digest in &digests {
            self.digest.update(digest);
        }
        Ok(self)
    }

    pub fn finish(self) -> u64 {
        let digest = self.digest.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(word)
    }

    // Length prefixes keep adjacent fields from running together.
    fn write(&mut self, bytes: &[u8]) {
        self.digest.update((bytes.len() as u64).to_be_bytes());
        self.digest.update(bytes);
    }
}

pub fn hash<T: StructuralHash + ?Sized>(value: &T) -> Result<u64, Error> {
    let mut hasher = Hasher::new();
    value.structural_hash(&mut hasher).map_err(Error::Hash)?;
    Ok(hasher.finish())
}

/// A compact identifier for a request, unique per stack and request id.
pub fn hash_request(stack_id: &str, request_id: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.write(format!("{}.{}", stack_id, request_id).as_bytes());
    base62(hasher.finish())
}

pub fn base62(mut n: u64) -> String {
    if n == 0 {
        return "0".into();
    }

    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE62[(n % 62) as usize]);
        n /= 62;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}
