//! Process-wide registry mapping a failover unit identity to its proxy.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::proxy::descript::FailoverUnitId;
use crate::proxy::fup::FailoverUnitProxy;

/// Registry of live failover unit proxies. Guarded by its own lock,
/// independent from per-proxy locks; the lock is held only for the duration
/// of a lookup/insert/remove, never across a suspension.
pub struct LocalFailoverUnitProxyMap {
    entries: Mutex<HashMap<FailoverUnitId, Arc<FailoverUnitProxy>>>,
}

impl LocalFailoverUnitProxyMap {
    pub fn new() -> Self {
        LocalFailoverUnitProxyMap {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the proxy for a failover unit.
    pub fn find(
        &self,
        id: FailoverUnitId,
    ) -> Option<Arc<FailoverUnitProxy>> {
        self.entries
            .lock()
            .expect("proxy map lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Looks up the proxy for a failover unit, creating and inserting a
    /// fresh one on first reference.
    pub fn find_or_insert(
        &self,
        id: FailoverUnitId,
    ) -> Arc<FailoverUnitProxy> {
        let mut entries = self.entries.lock().expect("proxy map lock poisoned");
        entries
            .entry(id)
            .or_insert_with(|| {
                pf_debug!("creating fup {}", id);
                Arc::new(FailoverUnitProxy::new(id))
            })
            .clone()
    }

    /// Removes a failover unit's proxy. Returns it if it was present, so
    /// that exactly one caller performs the paired cleanup.
    pub fn remove(
        &self,
        id: FailoverUnitId,
    ) -> Option<Arc<FailoverUnitProxy>> {
        self.entries
            .lock()
            .expect("proxy map lock poisoned")
            .remove(&id)
    }

    /// Atomically detaches the entire contents for bulk draining, leaving
    /// the map empty. In-flight lookups after this point consistently miss
    /// rather than racing individual removals.
    pub fn privatize(
        &self,
    ) -> HashMap<FailoverUnitId, Arc<FailoverUnitProxy>> {
        let mut entries = self.entries.lock().expect("proxy map lock poisoned");
        mem::take(&mut *entries)
    }

    /// Number of live proxies.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("proxy map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live proxies, for periodic sweeps.
    pub fn snapshot(&self) -> Vec<Arc<FailoverUnitProxy>> {
        self.entries
            .lock()
            .expect("proxy map lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Default for LocalFailoverUnitProxyMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_insert_reuses() {
        let map = LocalFailoverUnitProxyMap::new();
        let id = FailoverUnitId::new_random();
        assert!(map.find(id).is_none());
        let a = map.find_or_insert(id);
        let b = map.find_or_insert(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_returns_once() {
        let map = LocalFailoverUnitProxyMap::new();
        let id = FailoverUnitId::new_random();
        map.find_or_insert(id);
        assert!(map.remove(id).is_some());
        assert!(map.remove(id).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn privatize_detaches_everything() {
        let map = LocalFailoverUnitProxyMap::new();
        for _ in 0..3 {
            map.find_or_insert(FailoverUnitId::new_random());
        }
        let drained = map.privatize();
        assert_eq!(drained.len(), 3);
        assert!(map.is_empty());
        // later lookups consistently miss
        for id in drained.keys() {
            assert!(map.find(*id).is_none());
        }
    }
}
