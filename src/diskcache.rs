//! Disk-usage-bounded LRU cache manager.
//!
//! Wraps payloads in [`CacheObj`] carrying disk-usage accounting and an
//! MRU-ordered position. After any size change, and after each access, the
//! manager evicts from the true LRU tail while `disk_usage` exceeds
//! `min(disk_cache_limit, disk_usage - disk_keep_free + tmp_free_bytes)`.
//!
//! Storage is a `moka::sync::Cache`, but moka's own admission/eviction
//! policy (segmented LRU / TinyLFU) is approximate and doesn't give the
//! strict "evict the true LRU tail" ordering this manager needs. So
//! `moka` holds the payloads and answers `get`/`invalidate`; a small
//! `Mutex<VecDeque<u64>>` tracks the strict MRU order separately — the
//! list order is sufficient because every access reorders its entry to
//! the front.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use moka::sync::Cache;

/// One payload tracked by the disk cache manager.
pub struct CacheObj {
    id: u64,
    payload: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    diskusage: AtomicI64,
    name: Mutex<String>,
}

impl CacheObj {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn diskusage(&self) -> i64 {
        self.diskusage.load(Ordering::Acquire)
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Whether the payload has already been evicted from behind this
    /// handle (other strong refs may still keep the payload alive).
    pub fn is_evicted(&self) -> bool {
        self.payload.lock().unwrap().is_none()
    }
}

struct Tunables {
    disk_cache_limit: AtomicI64,
    disk_keep_free: AtomicI64,
}

/// Global disk-usage-bounded LRU, guarded by a single lock the way a
/// process-wide cache singleton needs to be. One instance normally lives
/// on [`crate::context::Context`].
pub struct DiskCacheManager {
    storage: Cache<u64, Arc<CacheObj>>,
    mru: Mutex<VecDeque<u64>>,
    next_id: AtomicU64,
    disk_usage: AtomicI64,
    tunables: Tunables,
}

const DEFAULT_DISK_CACHE_LIMIT: i64 = 100 * 1024 * 1024;
const DEFAULT_DISK_KEEP_FREE: i64 = 10 * 1024 * 1024;

impl DiskCacheManager {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_DISK_CACHE_LIMIT, DEFAULT_DISK_KEEP_FREE)
    }

    pub fn with_limits(disk_cache_limit: i64, disk_keep_free: i64) -> Self {
        DiskCacheManager {
            storage: Cache::builder().max_capacity(1_000_000).build(),
            mru: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            disk_usage: AtomicI64::new(0),
            tunables: Tunables {
                disk_cache_limit: AtomicI64::new(disk_cache_limit),
                disk_keep_free: AtomicI64::new(disk_keep_free),
            },
        }
    }

    pub fn disk_usage(&self) -> i64 {
        self.disk_usage.load(Ordering::Acquire)
    }

    pub fn disk_cache_limit(&self) -> i64 {
        self.tunables.disk_cache_limit.load(Ordering::Acquire)
    }

    pub fn set_disk_cache_limit(&self, limit: i64) {
        self.tunables.disk_cache_limit.store(limit, Ordering::Release);
        self.run_eviction(0);
    }

    pub fn disk_keep_free(&self) -> i64 {
        self.tunables.disk_keep_free.load(Ordering::Acquire)
    }

    pub fn set_disk_keep_free(&self, keep_free: i64) {
        self.tunables.disk_keep_free.store(keep_free, Ordering::Release);
        self.run_eviction(0);
    }

    /// `cacheobj_new(payload, name)`: wrap `payload`, add to MRU, run
    /// eviction. `tmp_free_bytes` is supplied by the caller (the real
    /// filesystem's free space; tests pass a fixed value).
    pub fn new_cacheobj<T: Any + Send + Sync>(
        &self,
        payload: Arc<T>,
        name: impl Into<String>,
        tmp_free_bytes: i64,
    ) -> Arc<CacheObj> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let obj = Arc::new(CacheObj {
            id,
            payload: Mutex::new(Some(payload as Arc<dyn Any + Send + Sync>)),
            diskusage: AtomicI64::new(0),
            name: Mutex::new(name.into()),
        });
        self.storage.insert(id, obj.clone());
        self.mru.lock().unwrap().push_front(id);
        self.run_eviction(tmp_free_bytes);
        obj
    }

    /// `cacheobj_get()`: bump to MRU and return the payload if still
    /// present (it may have been evicted by a previous `diskusage` change
    /// even while other strong refs to `Arc<CacheObj>` survive).
    pub fn get<T: Any + Send + Sync>(&self, cobj: &Arc<CacheObj>) -> Option<Arc<T>> {
        self.touch(cobj.id);
        self.run_eviction(0);
        cobj.payload.lock().unwrap().as_ref().and_then(|p| p.clone().downcast::<T>().ok())
    }

    /// Look a tracked object back up by the id `new_cacheobj` assigned it,
    /// for callers (e.g. [`crate::codec::zcache::ZCache`]) that only kept
    /// the id around rather than the `Arc<CacheObj>` itself.
    pub fn get_cacheobj(&self, id: u64) -> Option<Arc<CacheObj>> {
        self.storage.get(&id)
    }

    fn touch(&self, id: u64) {
        let mut mru = self.mru.lock().unwrap();
        if let Some(pos) = mru.iter().position(|x| *x == id) {
            mru.remove(pos);
            mru.push_front(id);
        }
    }

    /// `cacheobj_setsize(n)`: update accounting, then re-run eviction.
    pub fn set_size(&self, cobj: &Arc<CacheObj>, new_size: i64, tmp_free_bytes: i64) {
        let old = cobj.diskusage.swap(new_size, Ordering::AcqRel);
        self.disk_usage.fetch_add(new_size - old, Ordering::AcqRel);
        self.run_eviction(tmp_free_bytes);
    }

    /// `disk_full()`: force eviction treating `tmp_free_bytes` as 0.
    pub fn disk_full(&self) {
        self.run_eviction(0);
    }

    /// `cache_clear()`: empty the list.
    pub fn clear(&self) {
        let ids: Vec<u64> = self.mru.lock().unwrap().drain(..).collect();
        for id in ids {
            self.evict_id(id);
        }
        self.storage.invalidate_all();
    }

    fn run_eviction(&self, tmp_free_bytes: i64) {
        loop {
            let usage = self.disk_usage.load(Ordering::Acquire);
            let limit_a = self.tunables.disk_cache_limit.load(Ordering::Acquire);
            let limit_b = usage - self.tunables.disk_keep_free.load(Ordering::Acquire) + tmp_free_bytes;
            let limit = limit_a.min(limit_b);
            if usage <= limit {
                break;
            }
            let tail_id = {
                let mru = self.mru.lock().unwrap();
                mru.back().copied()
            };
            let Some(tail_id) = tail_id else { break };
            if !self.evict_id(tail_id) {
                // Nothing left with nonzero usage to reclaim.
                break;
            }
        }
    }

    /// Evict the LRU-tail entry identified by `id`; returns whether a
    /// live, nonzero-usage payload was actually dropped.
    fn evict_id(&self, id: u64) -> bool {
        let Some(obj) = self.storage.get(&id) else {
            self.mru.lock().unwrap().retain(|x| *x != id);
            return false;
        };
        let usage = obj.diskusage.swap(0, Ordering::AcqRel);
        let mut payload_slot = obj.payload.lock().unwrap();
        let had_payload = payload_slot.is_some();
        *payload_slot = None;
        drop(payload_slot);
        self.mru.lock().unwrap().retain(|x| *x != id);
        self.storage.invalidate(&id);
        if usage != 0 {
            self.disk_usage.fetch_sub(usage, Ordering::AcqRel);
        }
        if had_payload {
            tracing::debug!(name = %obj.name(), diskusage = usage, "evicted cache object");
        }
        had_payload || usage != 0
    }
}

impl Default for DiskCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cacheobj_then_get_returns_payload() {
        let mgr = DiskCacheManager::new();
        let cobj = mgr.new_cacheobj(Arc::new(String::from("hi")), "name", 0);
        let got: Arc<String> = mgr.get(&cobj).unwrap();
        assert_eq!(*got, "hi");
    }

    #[test]
    fn eviction_respects_limit_minus_keep_free() {
        let mgr = DiskCacheManager::with_limits(1_000_000, 0);
        let mut objs = Vec::new();
        for i in 0..10 {
            let obj = mgr.new_cacheobj(Arc::new(i), format!("o{i}"), 0);
            mgr.set_size(&obj, 150_000, 0);
            objs.push(obj);
        }
        assert!(mgr.disk_usage() <= 1_000_000);
        // The oldest object should have been evicted by now.
        assert!(objs[0].is_evicted());
    }

    #[test]
    fn access_bumps_to_mru_and_protects_from_eviction() {
        let mgr = DiskCacheManager::with_limits(300_000, 0);
        let a = mgr.new_cacheobj(Arc::new(1), "a", 0);
        mgr.set_size(&a, 150_000, 0);
        let b = mgr.new_cacheobj(Arc::new(2), "b", 0);
        mgr.set_size(&b, 150_000, 0);
        // Touch `a` so `b` becomes the LRU tail.
        let _: Option<Arc<i32>> = mgr.get(&a);
        let c = mgr.new_cacheobj(Arc::new(3), "c", 0);
        mgr.set_size(&c, 150_000, 0);
        assert!(b.is_evicted());
        assert!(!a.is_evicted());
    }

    #[test]
    fn cache_clear_drops_everything() {
        let mgr = DiskCacheManager::new();
        let a = mgr.new_cacheobj(Arc::new(1), "a", 0);
        mgr.set_size(&a, 1000, 0);
        mgr.clear();
        assert_eq!(mgr.disk_usage(), 0);
        assert!(a.is_evicted());
    }

    #[test]
    fn disk_full_forces_eviction_ignoring_tmp_free() {
        let mgr = DiskCacheManager::with_limits(1_000_000, 900_000);
        let a = mgr.new_cacheobj(Arc::new(1), "a", 1_000_000);
        mgr.set_size(&a, 500_000, 1_000_000);
        assert!(!a.is_evicted());
        mgr.disk_full();
        assert!(a.is_evicted());
    }
}
