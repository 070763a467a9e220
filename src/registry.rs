use hyper::{Method, Uri};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;

/// Which half of a CONNECT tunnel finished copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelSide {
    /// client to upstream
    Up,
    /// upstream to client
    Down,
}

/// Snapshot of one in-flight request, as shown on the status page.
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub id: u64,
    pub method: String,
    pub url: String,
    pub timestamp: OffsetDateTime,
    pub up_closed: bool,
    pub down_closed: bool,
}

/// Registry of in-flight requests keyed by a monotonic identifier.
///
/// The mutex guards every access to the map; the id counter is atomic and
/// never decremented, so ids are unique for the process lifetime. Entries are
/// mutated only by the tunnel engine (via [`RequestRegistry::mark`]) and the
/// critical sections touch nothing but the map.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, ActiveRequest>>,
}

impl RequestRegistry {
    /// Lock the map, recovering from a poisoned mutex. A panic in one holder
    /// must not wedge every later request; the map itself stays structurally
    /// sound.
    fn entries(&self) -> MutexGuard<'_, HashMap<u64, ActiveRequest>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate the next id and record the request. Returns the id.
    pub fn start(&self, method: &Method, url: &Uri) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = ActiveRequest {
            id,
            method: method.to_string(),
            url: url.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            up_closed: false,
            down_closed: false,
        };
        self.entries().insert(id, entry);
        id
    }

    /// Record that one copier of a CONNECT tunnel has finished.
    pub fn mark(&self, id: u64, side: TunnelSide) {
        let mut active = self.entries();
        if let Some(entry) = active.get_mut(&id) {
            match side {
                TunnelSide::Up => entry.up_closed = true,
                TunnelSide::Down => entry.down_closed = true,
            }
        }
    }

    /// Remove a finished request.
    pub fn end(&self, id: u64) {
        self.entries().remove(&id);
    }

    /// Copy of the current entries, ordered by id.
    pub fn snapshot(&self) -> Vec<ActiveRequest> {
        let mut entries: Vec<ActiveRequest> = self.entries().values().cloned().collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }
}

/// RAII handle that deregisters a request when dropped.
///
/// Dropping the guard is the only way an entry leaves the registry, so
/// deregistration happens on every exit path, panics included. For CONNECT
/// the guard is moved into the tunnel task and the entry survives until both
/// copiers have finished.
pub struct RequestGuard {
    registry: Arc<RequestRegistry>,
    id: u64,
}

impl RequestGuard {
    /// Register a request and return its guard.
    pub fn new(registry: Arc<RequestRegistry>, method: &Method, url: &Uri) -> Self {
        let id = registry.start(method, url);
        Self { registry, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.end(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_mark_end_lifecycle() {
        let registry = RequestRegistry::default();
        let id = registry.start(&Method::CONNECT, &"example.com:443".parse().unwrap());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].method, "CONNECT");
        assert!(!snapshot[0].up_closed);
        assert!(!snapshot[0].down_closed);

        registry.mark(id, TunnelSide::Up);
        assert!(registry.snapshot()[0].up_closed);
        assert!(!registry.snapshot()[0].down_closed);

        registry.mark(id, TunnelSide::Down);
        assert!(registry.snapshot()[0].down_closed);

        registry.end(id);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let registry = RequestRegistry::default();
        let url: Uri = "http://example.com/".parse().unwrap();
        let first = registry.start(&Method::GET, &url);
        let second = registry.start(&Method::GET, &url);
        let third = registry.start(&Method::GET, &url);
        assert!(first < second && second < third);

        // Ids are not reused after removal.
        registry.end(second);
        let fourth = registry.start(&Method::GET, &url);
        assert!(fourth > third);
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let registry = RequestRegistry::default();
        let url: Uri = "http://example.com/".parse().unwrap();
        for _ in 0..5 {
            registry.start(&Method::GET, &url);
        }
        let ids: Vec<u64> = registry.snapshot().iter().map(|entry| entry.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn guard_deregisters_on_drop() {
        let registry = Arc::new(RequestRegistry::default());
        let url: Uri = "http://example.com/".parse().unwrap();
        {
            let guard = RequestGuard::new(registry.clone(), &Method::GET, &url);
            assert_eq!(registry.snapshot().len(), 1);
            assert_eq!(registry.snapshot()[0].id, guard.id());
        }
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn mark_on_unknown_id_is_a_no_op() {
        let registry = RequestRegistry::default();
        registry.mark(42, TunnelSide::Up);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn survives_a_poisoned_lock() {
        let registry = Arc::new(RequestRegistry::default());
        let url: Uri = "http://example.com/".parse().unwrap();
        let id = registry.start(&Method::GET, &url);

        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.active.lock().unwrap();
            panic!("poison the registry lock");
        })
        .join();
        assert!(registry.active.is_poisoned());

        // Every operation keeps working against the poisoned mutex.
        let next = registry.start(&Method::GET, &url);
        assert!(next > id);
        registry.mark(id, TunnelSide::Up);
        assert!(registry
            .snapshot()
            .iter()
            .any(|entry| entry.id == id && entry.up_closed));
        registry.end(id);
        registry.end(next);
        assert!(registry.snapshot().is_empty());
    }
}
