use crate::persistence::{MemoryTokenPersistence, TokenPersistence};
use chrono::{DateTime, TimeZone, Utc};
use keeper_core::{CapabilityError, MetricsSink, NoopSink, ResourceId, TokenId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// --- Platform seam ---

/// Kind of filesystem object a token points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Diagnostic snapshot of a resource, captured at mint time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Object kind.
    pub kind: ResourceKind,
    /// Permission bits.
    pub permissions: u32,
}

/// What the host hands back when it authorizes a resource.
#[derive(Debug, Clone)]
pub struct AuthorizedResource {
    /// Opaque authorization blob.
    pub bytes: Vec<u8>,
    /// Metadata observed while authorizing.
    pub metadata: ResourceMetadata,
}

/// What the host reports when it replays a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Identity the blob currently points at.
    pub resource: ResourceId,
    /// Set when the host itself detected a move or replacement.
    pub moved: bool,
}

/// The host platform's authorization primitive.
///
/// Supplied by the embedding application. The store never parses the blobs
/// it produces.
pub trait Authorizer: Send + Sync {
    /// Produce a durable authorization blob for `resource`.
    fn authorize(&self, resource: &ResourceId) -> Result<AuthorizedResource, String>;

    /// Interpret a blob previously produced by [`Authorizer::authorize`].
    fn resolve(&self, bytes: &[u8]) -> Result<Resolution, String>;
}

// --- Token ---

/// A durable, opaque authorization to access one filesystem resource.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub id: TokenId,
    pub resource: ResourceId,
    #[serde(with = "blob_hex")]
    token_bytes: Vec<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub is_stale: bool,
    pub metadata: ResourceMetadata,
}

impl CapabilityToken {
    /// The opaque blob, to be replayed verbatim to the host.
    pub fn token_bytes(&self) -> &[u8] {
        &self.token_bytes
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("token_bytes", &format_args!("<{} bytes>", self.token_bytes.len()))
            .field("created_at", &self.created_at)
            .field("last_accessed_at", &self.last_accessed_at)
            .field("access_count", &self.access_count)
            .field("is_stale", &self.is_stale)
            .field("metadata", &self.metadata)
            .finish()
    }
}

mod blob_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Store-side record. Counters are atomics so resolution can run under the read lock.
struct TokenEntry {
    token: CapabilityToken,
    access_count: AtomicU64,
    // Unix millis, 0 when never accessed.
    last_accessed_ms: AtomicI64,
    stale: AtomicBool,
}

impl TokenEntry {
    fn new(token: CapabilityToken) -> Self {
        let last = token
            .last_accessed_at
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);
        Self {
            access_count: AtomicU64::new(token.access_count),
            last_accessed_ms: AtomicI64::new(last),
            stale: AtomicBool::new(token.is_stale),
            token,
        }
    }

    fn snapshot(&self) -> CapabilityToken {
        let mut token = self.token.clone();
        token.access_count = self.access_count.load(Ordering::Acquire);
        token.last_accessed_at = millis_to_datetime(self.last_accessed_ms.load(Ordering::Acquire));
        token.is_stale = self.stale.load(Ordering::Acquire);
        token
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(ms).single()
    }
}

// --- Store ---

/// Mints, persists, and resolves capability tokens.
///
/// A multi-map: several tokens may exist for the same resource and each
/// stays independently valid. Resolution runs under a shared lock; every
/// mutation takes the exclusive lock.
pub struct CapabilityStore {
    authorizer: Arc<dyn Authorizer>,
    persistence: Arc<dyn TokenPersistence>,
    metrics: Arc<dyn MetricsSink>,
    tokens: RwLock<HashMap<TokenId, TokenEntry>>,
}

impl CapabilityStore {
    /// Open a store, loading every token the persistence layer holds.
    pub fn open(
        authorizer: Arc<dyn Authorizer>,
        persistence: Arc<dyn TokenPersistence>,
    ) -> Result<Self, CapabilityError> {
        let loaded = persistence
            .load_all()
            .map_err(|e| CapabilityError::StoreUnavailable(e.to_string()))?;
        let tokens: HashMap<_, _> = loaded
            .into_iter()
            .map(|t| (t.id, TokenEntry::new(t)))
            .collect();
        info!(count = tokens.len(), "Capability store opened");
        Ok(Self {
            authorizer,
            persistence,
            metrics: Arc::new(NoopSink),
            tokens: RwLock::new(tokens),
        })
    }

    /// A store that forgets everything when dropped.
    pub fn in_memory(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            authorizer,
            persistence: Arc::new(MemoryTokenPersistence::new()),
            metrics: Arc::new(NoopSink),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Report mints and validations to `sink`.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Mint a new token for `resource`.
    pub fn mint(&self, resource: &ResourceId) -> Result<CapabilityToken, CapabilityError> {
        let mint_failed = |reason: String| CapabilityError::MintFailed {
            resource: resource.clone(),
            reason,
        };

        let authorized = self.authorizer.authorize(resource).map_err(mint_failed)?;
        if authorized.bytes.is_empty() {
            return Err(mint_failed("authorizer returned an empty blob".to_string()));
        }

        // The fresh blob has to point back at exactly the resource we asked for.
        let check = self.authorizer.resolve(&authorized.bytes).map_err(mint_failed)?;
        if check.moved || &check.resource != resource {
            return Err(mint_failed(format!(
                "blob resolves to {} instead",
                check.resource
            )));
        }

        let token = CapabilityToken {
            id: Uuid::new_v4(),
            resource: resource.clone(),
            token_bytes: authorized.bytes,
            created_at: Utc::now(),
            last_accessed_at: None,
            access_count: 0,
            is_stale: false,
            metadata: authorized.metadata,
        };

        let mut tokens = self.tokens.write();
        self.persistence
            .save(&token)
            .map_err(|e| CapabilityError::StoreUnavailable(e.to_string()))?;
        tokens.insert(token.id, TokenEntry::new(token.clone()));
        drop(tokens);

        self.metrics.token_minted();
        info!(token = %token.id, resource = %token.resource, "Capability token minted");
        Ok(token)
    }

    /// Resolve a token back to its resource identity.
    ///
    /// A stale token keeps failing with `StaleResource` until it is re-minted.
    pub fn resolve(&self, id: TokenId) -> Result<ResourceId, CapabilityError> {
        let started = Instant::now();
        let result = self.resolve_inner(id);
        self.metrics.validation(result.is_ok(), started.elapsed());
        result
    }

    fn resolve_inner(&self, id: TokenId) -> Result<ResourceId, CapabilityError> {
        let tokens = self.tokens.read();
        let entry = tokens.get(&id).ok_or_else(|| CapabilityError::Invalid {
            token: id,
            reason: "unknown token".to_string(),
        })?;

        let stale = || CapabilityError::StaleResource {
            token: id,
            resource: entry.token.resource.clone(),
        };

        if entry.stale.load(Ordering::Acquire) {
            return Err(stale());
        }

        let resolution = self
            .authorizer
            .resolve(&entry.token.token_bytes)
            .map_err(|reason| CapabilityError::Invalid { token: id, reason })?;

        if resolution.moved || resolution.resource != entry.token.resource {
            // Only the first resolver to observe the change persists it.
            if !entry.stale.swap(true, Ordering::AcqRel) {
                warn!(
                    token = %id,
                    resource = %entry.token.resource,
                    now = %resolution.resource,
                    "Capability token went stale"
                );
                if let Err(e) = self.persistence.save(&entry.snapshot()) {
                    warn!(token = %id, error = %e, "Failed to persist staleness");
                }
            }
            return Err(stale());
        }

        debug!(token = %id, resource = %resolution.resource, "Capability token resolved");
        Ok(resolution.resource)
    }

    /// Count one use of the token and refresh its last-access time.
    pub fn record_access(&self, id: TokenId) -> Result<CapabilityToken, CapabilityError> {
        let tokens = self.tokens.write();
        let entry = tokens.get(&id).ok_or_else(|| CapabilityError::Invalid {
            token: id,
            reason: "unknown token".to_string(),
        })?;

        let now = Utc::now();
        let mut next = entry.snapshot();
        next.access_count = next.access_count.saturating_add(1);
        next.last_accessed_at = Some(now);

        self.persistence
            .save(&next)
            .map_err(|e| CapabilityError::StoreUnavailable(e.to_string()))?;

        entry.access_count.store(next.access_count, Ordering::Release);
        entry
            .last_accessed_ms
            .store(now.timestamp_millis(), Ordering::Release);
        Ok(next)
    }

    /// Replace a token with a freshly minted one for the same resource.
    ///
    /// This is the recovery path for `StaleResource`. The old id stops resolving.
    pub fn remint(&self, id: TokenId) -> Result<CapabilityToken, CapabilityError> {
        let resource = self
            .get(id)
            .map(|t| t.resource)
            .ok_or_else(|| CapabilityError::Invalid {
                token: id,
                reason: "unknown token".to_string(),
            })?;

        let fresh = self.mint(&resource)?;
        match self.revoke(id) {
            Ok(()) | Err(CapabilityError::Invalid { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(old = %id, new = %fresh.id, resource = %resource, "Capability token re-minted");
        Ok(fresh)
    }

    /// Destroy a token.
    pub fn revoke(&self, id: TokenId) -> Result<(), CapabilityError> {
        let mut tokens = self.tokens.write();
        if !tokens.contains_key(&id) {
            return Err(CapabilityError::Invalid {
                token: id,
                reason: "unknown token".to_string(),
            });
        }
        self.persistence
            .remove(id)
            .map_err(|e| CapabilityError::StoreUnavailable(e.to_string()))?;
        tokens.remove(&id);
        info!(token = %id, "Capability token revoked");
        Ok(())
    }

    pub fn get(&self, id: TokenId) -> Option<CapabilityToken> {
        self.tokens.read().get(&id).map(TokenEntry::snapshot)
    }

    /// Every token minted for `resource`, oldest first.
    pub fn tokens_for(&self, resource: &ResourceId) -> Vec<CapabilityToken> {
        let mut found: Vec<_> = self
            .tokens
            .read()
            .values()
            .filter(|e| &e.token.resource == resource)
            .map(TokenEntry::snapshot)
            .collect();
        found.sort_by_key(|t| t.created_at);
        found
    }

    /// Every token, oldest first.
    pub fn list(&self) -> Vec<CapabilityToken> {
        let mut all: Vec<_> = self.tokens.read().values().map(TokenEntry::snapshot).collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}
