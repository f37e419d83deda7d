//! Local-filesystem stand-ins for the host's authorization primitives.
//!
//! A sandboxed host would hand out opaque bookmark blobs. Here the blob
//! pins the path to the file's device and inode, so replacing or moving the
//! file is noticed on the next resolve.

use keeper_core::ResourceId;
use keeper_security::{AuthorizedResource, Authorizer, Resolution, ResourceKind, ResourceMetadata};
use keeper_session::AccessGrant;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct Fingerprint {
    path: String,
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity(meta: &Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn identity(_meta: &Metadata) -> (u64, u64) {
    (0, 0)
}

#[cfg(unix)]
fn permissions(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn kind(meta: &Metadata) -> ResourceKind {
    let ft = meta.file_type();
    if ft.is_dir() {
        ResourceKind::Directory
    } else if ft.is_file() {
        ResourceKind::File
    } else if ft.is_symlink() {
        ResourceKind::Symlink
    } else {
        ResourceKind::Other
    }
}

/// Authorizes paths on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsAuthorizer;

impl Authorizer for FsAuthorizer {
    fn authorize(&self, resource: &ResourceId) -> Result<AuthorizedResource, String> {
        let meta = std::fs::symlink_metadata(resource.as_str())
            .map_err(|e| format!("cannot stat {resource}: {e}"))?;
        let (dev, ino) = identity(&meta);
        let bytes = serde_json::to_vec(&Fingerprint {
            path: resource.as_str().to_string(),
            dev,
            ino,
        })
        .map_err(|e| e.to_string())?;

        Ok(AuthorizedResource {
            bytes,
            metadata: ResourceMetadata {
                size: meta.len(),
                kind: kind(&meta),
                permissions: permissions(&meta),
            },
        })
    }

    fn resolve(&self, bytes: &[u8]) -> Result<Resolution, String> {
        let print: Fingerprint =
            serde_json::from_slice(bytes).map_err(|e| format!("corrupt blob: {e}"))?;
        let resource = ResourceId::new(print.path.as_str());
        let moved = match std::fs::symlink_metadata(&print.path) {
            Ok(meta) => identity(&meta) != (print.dev, print.ino),
            Err(_) => true,
        };
        debug!(resource = %resource, moved, "Resolved filesystem blob");
        Ok(Resolution { resource, moved })
    }
}

/// Access grant for an unsandboxed process: nothing to start, but the path
/// has to exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsAccessGrant;

impl AccessGrant for FsAccessGrant {
    fn start_access(&self, resource: &ResourceId) -> Result<(), String> {
        if Path::new(resource.as_str()).exists() {
            Ok(())
        } else {
            Err(format!("{resource} does not exist"))
        }
    }

    fn stop_access(&self, _resource: &ResourceId) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use keeper_security::CapabilityStore;
    use std::sync::Arc;

    fn resource_in(dir: &tempfile::TempDir, name: &str) -> ResourceId {
        ResourceId::from(dir.path().join(name).as_path())
    }

    #[test]
    fn test_mint_and_resolve_file() {
        let dir = tempfile::tempdir().unwrap();
        let resource = resource_in(&dir, "repo.conf");
        std::fs::write(resource.as_str(), "abc").unwrap();

        let store = CapabilityStore::in_memory(Arc::new(FsAuthorizer));
        let token = store.mint(&resource).unwrap();
        assert_eq!(token.metadata.kind, ResourceKind::File);
        assert_eq!(token.metadata.size, 3);
        assert_eq!(store.resolve(token.id).unwrap(), resource);
    }

    #[test]
    fn test_missing_path_cannot_be_minted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CapabilityStore::in_memory(Arc::new(FsAuthorizer));
        assert!(store.mint(&resource_in(&dir, "nope")).is_err());
    }

    #[test]
    fn test_deleted_path_goes_stale() {
        let dir = tempfile::tempdir().unwrap();
        let resource = resource_in(&dir, "snapshots");
        std::fs::create_dir(resource.as_str()).unwrap();

        let store = CapabilityStore::in_memory(Arc::new(FsAuthorizer));
        let token = store.mint(&resource).unwrap();
        std::fs::remove_dir(resource.as_str()).unwrap();

        let err = store.resolve(token.id).unwrap_err();
        assert!(err.requires_remint());
    }

    #[cfg(unix)]
    #[test]
    fn test_replaced_file_goes_stale() {
        let dir = tempfile::tempdir().unwrap();
        let resource = resource_in(&dir, "key");
        std::fs::write(resource.as_str(), "one").unwrap();

        let store = CapabilityStore::in_memory(Arc::new(FsAuthorizer));
        let token = store.mint(&resource).unwrap();

        // Keep the old inode alive so the new file cannot reuse its number.
        let parked = dir.path().join("key.old");
        std::fs::rename(resource.as_str(), &parked).unwrap();
        std::fs::write(resource.as_str(), "two").unwrap();

        assert!(store.resolve(token.id).unwrap_err().requires_remint());
        let fresh = store.remint(token.id).unwrap();
        assert_eq!(store.resolve(fresh.id).unwrap(), resource);
    }

    #[test]
    fn test_grant_requires_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let grant = FsAccessGrant;
        assert!(grant.start_access(&ResourceId::from(dir.path())).is_ok());
        assert!(grant.start_access(&resource_in(&dir, "gone")).is_err());
    }
}
