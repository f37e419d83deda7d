use crate::session::{AccessGrant, SessionHandle, SessionRecord};
use keeper_core::{AccessError, MetricsSink, NoopSink, ResourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

// Process-wide so a handle from one manager never matches a live id in another.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Reference-counts begin/end pairs per resource.
///
/// The arena lock is only held to look up or remove a record. Each record
/// has its own lock, which serializes begin/end on that resource (including
/// the platform call) while other resources proceed in parallel.
pub struct AccessSessionManager {
    grant: Arc<dyn AccessGrant>,
    metrics: Arc<dyn MetricsSink>,
    arena: Mutex<HashMap<ResourceId, Arc<Mutex<SessionRecord>>>>,
}

impl AccessSessionManager {
    pub fn new(grant: Arc<dyn AccessGrant>) -> Self {
        Self {
            grant,
            metrics: Arc::new(NoopSink),
            arena: Mutex::new(HashMap::new()),
        }
    }

    /// Report every `begin` to `sink`.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Start using `resource`. The first holder triggers the platform grant;
    /// if that fails nothing is left behind.
    pub fn begin(&self, resource: &ResourceId) -> Result<SessionHandle, AccessError> {
        let started = Instant::now();
        loop {
            let record = self
                .arena
                .lock()
                .entry(resource.clone())
                .or_default()
                .clone();
            let mut rec = record.lock();
            if rec.retired {
                continue;
            }

            if rec.live.is_empty() {
                if let Err(reason) = self.grant.start_access(resource) {
                    rec.retired = true;
                    self.evict(resource, &record);
                    warn!(resource = %resource, reason = %reason, "Platform refused access");
                    self.metrics.access(false, started.elapsed());
                    return Err(AccessError::GrantDenied {
                        resource: resource.clone(),
                        reason,
                    });
                }
                info!(resource = %resource, "Access started");
            }

            let id = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
            rec.live.insert(id);
            debug!(resource = %resource, ref_count = rec.ref_count(), "Access session begun");
            self.metrics.access(true, started.elapsed());
            return Ok(SessionHandle {
                resource: resource.clone(),
                id,
            });
        }
    }

    /// Release one hold. The last holder stops the platform grant.
    pub fn end(&self, handle: &SessionHandle) -> Result<(), AccessError> {
        let imbalanced = || AccessError::Imbalanced {
            resource: handle.resource.clone(),
        };

        let record = self
            .arena
            .lock()
            .get(&handle.resource)
            .cloned()
            .ok_or_else(imbalanced)?;
        let mut rec = record.lock();
        if rec.retired || !rec.live.remove(&handle.id) {
            error!(resource = %handle.resource, "Unbalanced end of access");
            return Err(imbalanced());
        }

        if rec.live.is_empty() {
            self.grant.stop_access(&handle.resource);
            rec.retired = true;
            self.evict(&handle.resource, &record);
            info!(resource = %handle.resource, "Access stopped");
        } else {
            debug!(resource = %handle.resource, ref_count = rec.ref_count(), "Access session ended");
        }
        Ok(())
    }

    /// `begin` with an RAII guard that ends the session on drop.
    pub fn scoped(&self, resource: &ResourceId) -> Result<AccessGuard<'_>, AccessError> {
        let handle = self.begin(resource)?;
        Ok(AccessGuard {
            manager: self,
            handle: Some(handle),
        })
    }

    /// Current holders of `resource`; zero when idle.
    pub fn ref_count(&self, resource: &ResourceId) -> usize {
        let record = self.arena.lock().get(resource).cloned();
        record.map_or(0, |r| r.lock().ref_count())
    }

    pub fn active_resources(&self) -> Vec<ResourceId> {
        let mut active: Vec<_> = self.arena.lock().keys().cloned().collect();
        active.sort();
        active
    }

    /// Drop `record` from the arena unless it was already replaced.
    fn evict(&self, resource: &ResourceId, record: &Arc<Mutex<SessionRecord>>) {
        let mut arena = self.arena.lock();
        if arena.get(resource).is_some_and(|r| Arc::ptr_eq(r, record)) {
            arena.remove(resource);
        }
    }
}

/// Ends its session when dropped.
pub struct AccessGuard<'a> {
    manager: &'a AccessSessionManager,
    handle: Option<SessionHandle>,
}

impl AccessGuard<'_> {
    pub fn resource(&self) -> Option<&ResourceId> {
        self.handle.as_ref().map(SessionHandle::resource)
    }

    /// End the session now and report the outcome.
    pub fn release(mut self) -> Result<(), AccessError> {
        match self.handle.take() {
            Some(handle) => self.manager.end(&handle),
            None => Ok(()),
        }
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.manager.end(&handle) {
                error!(error = %e, "Access guard failed to end its session");
            }
        }
    }
}
