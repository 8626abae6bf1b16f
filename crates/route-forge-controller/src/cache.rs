//! Address cache: the desired-state snapshot the watchers diff against
//!
//! Two indexes guarded by one lock: `VmKey -> Addresses` and
//! `vm_ip -> VmKey`. Every operation holds the lock for its whole duration,
//! so readers never observe one index updated without the other.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use tracing::debug;

use route_forge_common::{Addresses, VmKey};

#[derive(Default)]
struct Indexes {
    by_key: HashMap<VmKey, Addresses>,
    by_ip: HashMap<IpAddr, VmKey>,
}

/// Bidirectional VM address index
#[derive(Default)]
pub struct AddressCache {
    inner: RwLock<Indexes>,
}

impl AddressCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses programmed for `key`
    pub fn get_addresses(&self, key: &VmKey) -> Option<Addresses> {
        self.inner.read().by_key.get(key).copied()
    }

    /// VM owning `vm_ip`
    pub fn get_name(&self, vm_ip: IpAddr) -> Option<VmKey> {
        self.inner.read().by_ip.get(&vm_ip).cloned()
    }

    /// Record `addrs` for `key`
    ///
    /// Replaces any previous entry for `key`. If another VM owned
    /// `addrs.vm_ip`, that VM's entry is evicted.
    pub fn set(&self, key: VmKey, addrs: Addresses) {
        let mut inner = self.inner.write();

        if let Some(old) = inner.by_key.remove(&key) {
            if inner.by_ip.get(&old.vm_ip) == Some(&key) {
                inner.by_ip.remove(&old.vm_ip);
            }
        }

        if let Some(previous) = inner.by_ip.insert(addrs.vm_ip, key.clone()) {
            if previous != key {
                debug!(vm = %key, evicted = %previous, vm_ip = %addrs.vm_ip, "Address reused, evicting previous owner");
                inner.by_key.remove(&previous);
            }
        }

        inner.by_key.insert(key, addrs);
    }

    /// Remove the entry for `key`, returning its addresses
    pub fn delete_by_key(&self, key: &VmKey) -> Option<Addresses> {
        let mut inner = self.inner.write();
        let addrs = inner.by_key.remove(key)?;
        if inner.by_ip.get(&addrs.vm_ip) == Some(key) {
            inner.by_ip.remove(&addrs.vm_ip);
        }
        Some(addrs)
    }

    /// Remove the entry owning `vm_ip`, returning its key
    pub fn delete_by_ip(&self, vm_ip: IpAddr) -> Option<VmKey> {
        let mut inner = self.inner.write();
        let key = inner.by_ip.remove(&vm_ip)?;
        inner.by_key.remove(&key);
        Some(key)
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<(VmKey, Addresses)> {
        self.inner
            .read()
            .by_key
            .iter()
            .map(|(k, a)| (k.clone(), *a))
            .collect()
    }

    /// Number of cached VMs
    pub fn len(&self) -> usize {
        self.inner.read().by_key.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_key.is_empty()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.read();
        assert_eq!(inner.by_key.len(), inner.by_ip.len());
        for (key, addrs) in &inner.by_key {
            assert_eq!(inner.by_ip.get(&addrs.vm_ip), Some(key));
        }
        for (ip, key) in &inner.by_ip {
            assert_eq!(inner.by_key.get(key).map(|a| a.vm_ip), Some(*ip));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addrs(node: &str, vm: &str) -> Addresses {
        Addresses {
            node_ip: node.parse().unwrap(),
            vm_ip: vm.parse().unwrap(),
        }
    }

    #[test]
    fn set_then_lookup_both_ways() {
        let cache = AddressCache::new();
        let key = VmKey::new("ns", "vm-a");
        cache.set(key.clone(), addrs("172.16.0.1", "10.244.1.7"));

        assert_eq!(cache.get_addresses(&key), Some(addrs("172.16.0.1", "10.244.1.7")));
        assert_eq!(cache.get_name("10.244.1.7".parse().unwrap()), Some(key));
        cache.assert_consistent();
    }

    #[test]
    fn overwrite_moves_node_without_duplicating() {
        let cache = AddressCache::new();
        let key = VmKey::new("ns", "vm-a");
        cache.set(key.clone(), addrs("172.16.0.1", "10.244.1.7"));
        cache.set(key.clone(), addrs("172.16.0.2", "10.244.1.7"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_addresses(&key).unwrap().node_ip, "172.16.0.2".parse::<IpAddr>().unwrap());
        cache.assert_consistent();
    }

    #[test]
    fn address_change_drops_old_reverse_entry() {
        let cache = AddressCache::new();
        let key = VmKey::new("ns", "vm-a");
        cache.set(key.clone(), addrs("172.16.0.1", "10.244.1.7"));
        cache.set(key.clone(), addrs("172.16.0.1", "10.244.1.8"));

        assert_eq!(cache.get_name("10.244.1.7".parse().unwrap()), None);
        assert_eq!(cache.get_name("10.244.1.8".parse().unwrap()), Some(key));
        cache.assert_consistent();
    }

    #[test]
    fn address_reuse_evicts_previous_owner() {
        let cache = AddressCache::new();
        let a = VmKey::new("ns", "vm-a");
        let b = VmKey::new("ns", "vm-b");
        cache.set(a.clone(), addrs("172.16.0.1", "10.244.1.7"));
        cache.set(b.clone(), addrs("172.16.0.2", "10.244.1.7"));

        assert_eq!(cache.get_addresses(&a), None);
        assert_eq!(cache.get_name("10.244.1.7".parse().unwrap()), Some(b));
        assert_eq!(cache.len(), 1);
        cache.assert_consistent();
    }

    #[test]
    fn delete_by_key_and_by_ip() {
        let cache = AddressCache::new();
        let a = VmKey::new("ns", "vm-a");
        let b = VmKey::new("ns", "vm-b");
        cache.set(a.clone(), addrs("172.16.0.1", "10.244.1.7"));
        cache.set(b.clone(), addrs("172.16.0.1", "10.244.1.8"));

        assert_eq!(cache.delete_by_key(&a).map(|x| x.vm_ip), Some("10.244.1.7".parse().unwrap()));
        assert_eq!(cache.delete_by_key(&a), None);
        assert_eq!(cache.delete_by_ip("10.244.1.8".parse().unwrap()), Some(b));
        assert!(cache.is_empty());
        cache.assert_consistent();
    }

    #[test]
    fn entries_snapshot() {
        let cache = AddressCache::new();
        cache.set(VmKey::new("ns", "vm-a"), addrs("172.16.0.1", "10.244.1.7"));
        cache.set(VmKey::new("ns", "vm-b"), addrs("172.16.0.2", "10.244.1.8"));

        let mut entries = cache.entries();
        entries.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, VmKey::new("ns", "vm-a"));
    }

    #[test]
    fn concurrent_operations_keep_indexes_consistent() {
        let cache = Arc::new(AddressCache::new());
        let mut handles = Vec::new();

        for t in 0..8u8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    let n = (i * 7 + u32::from(t) * 13) % 16;
                    let key = VmKey::new("ns", format!("vm-{}", n % 10));
                    let ip: IpAddr = format!("10.244.0.{}", n).parse().unwrap();
                    match i % 4 {
                        0 | 1 => cache.set(
                            key,
                            Addresses {
                                node_ip: format!("172.16.0.{}", t).parse().unwrap(),
                                vm_ip: ip,
                            },
                        ),
                        2 => {
                            cache.delete_by_key(&key);
                        }
                        _ => {
                            cache.delete_by_ip(ip);
                        }
                    }
                    if let Some(owner) = cache.get_name(ip) {
                        // Reads may race with writers but never see a torn pair
                        let _ = cache.get_addresses(&owner);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        cache.assert_consistent();
    }
}
