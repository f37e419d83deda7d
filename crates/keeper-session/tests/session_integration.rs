#![allow(clippy::unwrap_used, clippy::expect_used)]

use keeper_core::{AccessError, ResourceId};
use keeper_session::{AccessGrant, AccessSessionManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

/// Records start/stop per resource and panics if the platform would see
/// a second start before a stop.
#[derive(Default)]
struct StrictGrant {
    active: Mutex<HashMap<ResourceId, bool>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl AccessGrant for StrictGrant {
    fn start_access(&self, resource: &ResourceId) -> Result<(), String> {
        let mut active = self.active.lock().unwrap();
        let was = active.insert(resource.clone(), true).unwrap_or(false);
        assert!(!was, "start_access while already active for {resource}");
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_access(&self, resource: &ResourceId) {
        let mut active = self.active.lock().unwrap();
        let was = active.insert(resource.clone(), false).unwrap_or(false);
        assert!(was, "stop_access while idle for {resource}");
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn overlapping_holders_start_and_stop_exactly_once() {
    let grant = Arc::new(StrictGrant::default());
    let mgr = Arc::new(AccessSessionManager::new(grant.clone()));
    let threads = 16;
    let all_begun = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let mgr = mgr.clone();
            let all_begun = all_begun.clone();
            thread::spawn(move || {
                let r = ResourceId::new("/tmp/x");
                let h = mgr.begin(&r).unwrap();
                all_begun.wait();
                mgr.end(&h).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(grant.starts.load(Ordering::SeqCst), 1);
    assert_eq!(grant.stops.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.ref_count(&ResourceId::new("/tmp/x")), 0);
}

#[test]
fn churn_never_double_starts() {
    let grant = Arc::new(StrictGrant::default());
    let mgr = Arc::new(AccessSessionManager::new(grant.clone()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let mgr = mgr.clone();
            thread::spawn(move || {
                let r = ResourceId::new(format!("/srv/repo-{}", i % 3));
                for _ in 0..200 {
                    let h = mgr.begin(&r).unwrap();
                    mgr.end(&h).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let starts = grant.starts.load(Ordering::SeqCst);
    assert!(starts >= 3);
    assert_eq!(starts, grant.stops.load(Ordering::SeqCst));
    assert!(mgr.active_resources().is_empty());
}

#[test]
fn end_without_begin_never_goes_negative() {
    let grant = Arc::new(StrictGrant::default());
    let mgr = AccessSessionManager::new(grant.clone());
    let r = ResourceId::new("/tmp/x");

    let h = mgr.begin(&r).unwrap();
    mgr.end(&h).unwrap();
    for _ in 0..3 {
        assert_eq!(
            mgr.end(&h).unwrap_err(),
            AccessError::Imbalanced {
                resource: r.clone()
            }
        );
    }
    assert_eq!(mgr.ref_count(&r), 0);
    assert_eq!(grant.stops.load(Ordering::SeqCst), 1);

    // The resource is still usable afterwards.
    let again = mgr.begin(&r).unwrap();
    assert_eq!(mgr.ref_count(&r), 1);
    mgr.end(&again).unwrap();
}
