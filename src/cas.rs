use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use base64::Engine as _;
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasError {
    pub reason: String,
}

impl std::fmt::Display for CasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cas: {}", self.reason)
    }
}

impl std::error::Error for CasError {}

/// Content-addressable object storage.
pub trait Cas: Send + Sync + 'static {
    fn put(&self, content: Vec<u8>) -> Result<String, CasError>;

    fn get(&self, address: &str) -> Result<Option<Vec<u8>>, CasError>;
}

/// base64url (no padding) of the SHA-256 of `content`.
pub fn content_address(content: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(content))
}

#[derive(Debug, Default)]
pub struct MemCas {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemCas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cas for MemCas {
    fn put(&self, content: Vec<u8>) -> Result<String, CasError> {
        let address = content_address(&content);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), content);
        Ok(address)
    }

    fn get(&self, address: &str) -> Result<Option<Vec<u8>>, CasError> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned())
    }
}
