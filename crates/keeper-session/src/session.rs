use keeper_core::ResourceId;
use std::collections::HashSet;

/// The platform's start/stop access primitive for one resource.
///
/// Supplied by the embedding application. The manager guarantees
/// `start_access` runs once per idle-to-active transition and `stop_access`
/// once per active-to-idle transition.
pub trait AccessGrant: Send + Sync {
    fn start_access(&self, resource: &ResourceId) -> Result<(), String>;
    fn stop_access(&self, resource: &ResourceId);
}

/// Proof of one `begin`. Hand it back to `end` exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub(crate) resource: ResourceId,
    pub(crate) id: u64,
}

impl SessionHandle {
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }
}

/// Arena record for one resource. The ref count is the number of live handles.
#[derive(Debug, Default)]
pub(crate) struct SessionRecord {
    pub(crate) live: HashSet<u64>,
    // Set once the record left the arena; holders must fetch a fresh one.
    pub(crate) retired: bool,
}

impl SessionRecord {
    pub(crate) fn ref_count(&self) -> usize {
        self.live.len()
    }
}
