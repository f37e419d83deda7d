use chrono::{DateTime, TimeZone, Utc};
use keeper_core::{CredentialError, SecretBytes};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::{debug, info, warn};

struct CredentialEntry {
    secret: SecretBytes,
    access_group: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    access_count: AtomicU64,
    // Unix millis, 0 when never read.
    last_accessed_ms: AtomicI64,
}

/// Everything about a stored credential except the secret.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub owner_id: String,
    pub access_group: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
}

/// Custody of repository passwords keyed by owner.
///
/// At most one credential per owner. A credential stored with an access
/// group can only be read, updated, or deleted by a caller presenting that
/// exact group.
#[derive(Default)]
pub struct CredentialStore {
    entries: RwLock<HashMap<String, CredentialEntry>>,
    sharing: RwLock<HashSet<String>>,
}

/// The stored group, when present, must equal the presented one.
fn check_group(
    owner: &str,
    stored: Option<&str>,
    presented: Option<&str>,
) -> Result<(), CredentialError> {
    match stored {
        Some(group) if presented != Some(group) => {
            warn!(owner = %owner, presented = ?presented, "Credential access group mismatch");
            Err(CredentialError::AccessGroupMismatch {
                owner: owner.to_string(),
                presented: presented.map(str::to_string),
            })
        }
        _ => Ok(()),
    }
}

fn not_found(owner: &str) -> CredentialError {
    CredentialError::NotFound {
        owner: owner.to_string(),
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new credential. Fails with `Duplicate` rather than overwrite.
    pub fn store(
        &self,
        owner: &str,
        secret: SecretBytes,
        access_group: Option<&str>,
    ) -> Result<(), CredentialError> {
        let mut entries = self.entries.write();
        if entries.contains_key(owner) {
            return Err(CredentialError::Duplicate {
                owner: owner.to_string(),
            });
        }
        let now = Utc::now();
        entries.insert(
            owner.to_string(),
            CredentialEntry {
                secret,
                access_group: access_group.map(str::to_string),
                created_at: now,
                updated_at: now,
                access_count: AtomicU64::new(0),
                last_accessed_ms: AtomicI64::new(0),
            },
        );
        info!(owner = %owner, access_group = ?access_group, "Credential stored");
        Ok(())
    }

    /// Read a secret. Every successful read counts as an access.
    pub fn retrieve(
        &self,
        owner: &str,
        access_group: Option<&str>,
    ) -> Result<SecretBytes, CredentialError> {
        let entries = self.entries.read();
        let entry = entries.get(owner).ok_or_else(|| not_found(owner))?;
        check_group(owner, entry.access_group.as_deref(), access_group)?;

        entry.access_count.fetch_add(1, Ordering::AcqRel);
        entry
            .last_accessed_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        debug!(owner = %owner, "Credential retrieved");
        Ok(entry.secret.clone())
    }

    /// Replace the secret of an existing credential. The owner and group stay as they are.
    pub fn update(
        &self,
        owner: &str,
        secret: SecretBytes,
        access_group: Option<&str>,
    ) -> Result<(), CredentialError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(owner).ok_or_else(|| not_found(owner))?;
        check_group(owner, entry.access_group.as_deref(), access_group)?;
        entry.secret = secret;
        entry.updated_at = Utc::now();
        info!(owner = %owner, "Credential updated");
        Ok(())
    }

    /// Delete a credential. Deleting an absent owner is `NotFound`.
    pub fn delete(&self, owner: &str, access_group: Option<&str>) -> Result<(), CredentialError> {
        let mut entries = self.entries.write();
        let entry = entries.get(owner).ok_or_else(|| not_found(owner))?;
        check_group(owner, entry.access_group.as_deref(), access_group)?;
        entries.remove(owner);
        info!(owner = %owner, "Credential deleted");
        Ok(())
    }

    /// Register a sharing domain. Registering it again is a no-op.
    pub fn configure_sharing(&self, access_group: &str) {
        if self.sharing.write().insert(access_group.to_string()) {
            info!(access_group = %access_group, "Sharing domain configured");
        }
    }

    /// Whether `access_group` has been registered.
    pub fn validate_sharing(&self, access_group: &str) -> bool {
        self.sharing.read().contains(access_group)
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.entries.read().contains_key(owner)
    }

    pub fn info(&self, owner: &str) -> Option<CredentialInfo> {
        self.entries.read().get(owner).map(|e| CredentialInfo {
            owner_id: owner.to_string(),
            access_group: e.access_group.clone(),
            created_at: e.created_at,
            updated_at: e.updated_at,
            last_accessed_at: match e.last_accessed_ms.load(Ordering::Acquire) {
                0 => None,
                ms => Utc.timestamp_millis_opt(ms).single(),
            },
            access_count: e.access_count.load(Ordering::Acquire),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
