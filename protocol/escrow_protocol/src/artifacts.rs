//! Artifact store seam. Proof files live outside the audit log; the protocol
//! records only the references this store hands out.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::errors::{EscrowError, Result};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` and return a reference to them.
    async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String>;

    /// Map a reference to a retrievable URL. Unknown references are a
    /// validation error.
    async fn resolve(&self, artifact_ref: &str) -> Result<String>;
}

/// Content-addressed reference: `sha256:<hex>/<file name>`.
pub fn content_ref(file_name: &str, bytes: &[u8]) -> Result<String> {
    let name = file_name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(EscrowError::Validation(format!(
            "invalid artifact file name '{file_name}'"
        )));
    }
    let digest = hex::encode(Sha256::digest(bytes));
    Ok(format!("sha256:{digest}/{name}"))
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    files: Mutex<HashMap<String, usize>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String> {
        let reference = content_ref(file_name, bytes)?;
        self.files
            .lock()
            .map_err(|_| EscrowError::Storage("artifact index poisoned".to_string()))?
            .insert(reference.clone(), bytes.len());
        Ok(reference)
    }

    async fn resolve(&self, artifact_ref: &str) -> Result<String> {
        let known = self
            .files
            .lock()
            .map_err(|_| EscrowError::Storage("artifact index poisoned".to_string()))?
            .contains_key(artifact_ref);
        if known {
            Ok(format!("memory://{artifact_ref}"))
        } else {
            Err(EscrowError::Validation(format!(
                "unknown artifact reference '{artifact_ref}'"
            )))
        }
    }
}
