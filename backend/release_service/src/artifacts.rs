//! Disk-backed artifact store.
//!
//! Files are written once under `<dir>/<sha256>/<file name>`; the reference
//! handed to the protocol is `sha256:<hex>/<file name>`, so identical
//! uploads share one file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use escrow_protocol::artifacts::{content_ref, ArtifactStore};
use escrow_protocol::EscrowError;
use tracing::info;

use crate::errors::Result;

pub struct DiskArtifactStore {
    dir: PathBuf,
    base_url: String,
}

impl DiskArtifactStore {
    pub async fn open(dir: impl AsRef<Path>, base_url: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        info!("Artifact store at {}", dir.display());
        Ok(Self {
            dir,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `sha256:<hex>/<name>` → `<hex>/<name>`, refusing anything path-like.
    fn relative_path(artifact_ref: &str) -> escrow_protocol::Result<&str> {
        let invalid = || EscrowError::Validation(format!("invalid artifact reference '{artifact_ref}'"));
        let rest = artifact_ref.strip_prefix("sha256:").ok_or_else(invalid)?;
        let (digest, name) = rest.split_once('/').ok_or_else(invalid)?;
        let well_formed = digest.len() == 64
            && digest.chars().all(|c| c.is_ascii_hexdigit())
            && !name.is_empty()
            && !name.contains(['/', '\\'])
            && !name.starts_with('.');
        if well_formed {
            Ok(rest)
        } else {
            Err(invalid())
        }
    }
}

#[async_trait]
impl ArtifactStore for DiskArtifactStore {
    async fn store(&self, file_name: &str, bytes: &[u8]) -> escrow_protocol::Result<String> {
        let reference = content_ref(file_name, bytes)?;
        let path = self.dir.join(Self::relative_path(&reference)?);
        let io = |e: std::io::Error| EscrowError::Storage(format!("artifact write failed: {e}"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(io)?;
        Ok(reference)
    }

    async fn resolve(&self, artifact_ref: &str) -> escrow_protocol::Result<String> {
        let relative = Self::relative_path(artifact_ref)?;
        let exists = tokio::fs::try_exists(self.dir.join(relative))
            .await
            .map_err(|e| EscrowError::Storage(format!("artifact lookup failed: {e}")))?;
        if !exists {
            return Err(EscrowError::Validation(format!(
                "unknown artifact reference '{artifact_ref}'"
            )));
        }
        Ok(format!("{}/{relative}", self.base_url))
    }
}
