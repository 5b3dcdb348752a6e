//! Stable short identifier allocation for proxies and backends, with a
//! cool-down recycling pool.

use std::collections::HashMap;
use std::collections::HashSet;

use registry_core::NodeIdentifier;
use registry_core::NodeKind;
use registry_core::RegistryError;
use registry_core::identifier::now_millis;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio::time::Instant;

const MAX_INSTANCE: u16 = 99;

#[derive(Default)]
struct Pool {
    /// Instances currently assigned to a live record.
    occupied: HashSet<u16>,
    /// Instances held in cool-down, not reissuable until their deadline.
    cooling: HashMap<u16, Instant>,
    /// Instances permanently withdrawn from circulation (`recycle-ids: false`).
    retired: HashSet<u16>,
}

impl Pool {
    fn lowest_free(&self) -> Option<u16> {
        (0..=MAX_INSTANCE).find(|instance| {
            !self.occupied.contains(instance) && !self.cooling.contains_key(instance) && !self.retired.contains(instance)
        })
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        self.cooling.retain(|_, deadline| *deadline > now);
    }
}

/// Allocates [`NodeIdentifier`]s per kind, enforcing the `[0,99]` instance
/// range (invariant I4: a released ID is never reissued while a record still
/// references it). When `recycle_ids` is `false` (spec §6 `registry.recycle-
/// ids`), a released or reserved instance is permanently retired instead of
/// returning to the free pool.
pub struct IdentifierAllocator {
    proxies: Mutex<Pool>,
    backends: Mutex<Pool>,
    recycle_ids: bool,
}

impl IdentifierAllocator {
    pub fn new() -> Self {
        Self::with_recycling(true)
    }

    pub fn with_recycling(recycle_ids: bool) -> Self {
        Self {
            proxies: Mutex::new(Pool::default()),
            backends: Mutex::new(Pool::default()),
            recycle_ids,
        }
    }

    pub async fn allocate_proxy(&self) -> Result<NodeIdentifier, RegistryError> {
        self.allocate(NodeKind::Proxy).await
    }

    pub async fn allocate_backend(&self) -> Result<NodeIdentifier, RegistryError> {
        self.allocate(NodeKind::Backend).await
    }

    async fn allocate(&self, kind: NodeKind) -> Result<NodeIdentifier, RegistryError> {
        let pool = self.pool_for(kind);
        let mut pool = pool.lock().await;
        pool.sweep_expired();
        let instance = pool.lowest_free().ok_or(RegistryError::AllocationExhausted)?;
        pool.occupied.insert(instance);
        NodeIdentifier::new(kind, uuid::Uuid::now_v7(), instance, now_millis())
            .map_err(|e| RegistryError::InvariantViolation(e.to_string()))
    }

    /// Returns the instance to the free pool immediately (graceful
    /// termination path), unless `recycle_ids` is `false`, in which case the
    /// instance is retired for good.
    pub async fn release(&self, id: NodeIdentifier) {
        let pool = self.pool_for(id.kind());
        let mut pool = pool.lock().await;
        pool.occupied.remove(&id.instance());
        pool.cooling.remove(&id.instance());
        if !self.recycle_ids {
            pool.retired.insert(id.instance());
        }
    }

    /// Holds the instance in cool-down for `ttl`, absorbing duplicate
    /// re-registration attempts from a crashing node before it is reissued
    /// (timeout-driven eviction path). With `recycle_ids` disabled the
    /// instance is retired immediately instead of merely cooled down.
    pub async fn reserve(&self, id: NodeIdentifier, ttl: Duration) {
        let pool = self.pool_for(id.kind());
        let mut pool = pool.lock().await;
        pool.occupied.remove(&id.instance());
        if self.recycle_ids {
            pool.cooling.insert(id.instance(), Instant::now() + ttl);
        } else {
            pool.retired.insert(id.instance());
        }
    }

    fn pool_for(&self, kind: NodeKind) -> &Mutex<Pool> {
        match kind {
            NodeKind::Proxy => &self.proxies,
            NodeKind::Backend => &self.backends,
        }
    }
}

impl Default for IdentifierAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_lowest_free_instance_first() {
        let allocator = IdentifierAllocator::new();
        let a = allocator.allocate_proxy().await.unwrap();
        let b = allocator.allocate_proxy().await.unwrap();
        assert_eq!(a.instance(), 0);
        assert_eq!(b.instance(), 1);
    }

    #[tokio::test]
    async fn exhausts_after_hundred_allocations() {
        let allocator = IdentifierAllocator::new();
        for _ in 0..=MAX_INSTANCE {
            allocator.allocate_backend().await.unwrap();
        }
        let err = allocator.allocate_backend().await;
        assert!(matches!(err, Err(RegistryError::AllocationExhausted)));
    }

    #[tokio::test]
    async fn released_instance_is_immediately_reissuable() {
        let allocator = IdentifierAllocator::new();
        let id = allocator.allocate_proxy().await.unwrap();
        allocator.release(id).await;
        let reissued = allocator.allocate_proxy().await.unwrap();
        assert_eq!(reissued.instance(), 0);
    }

    #[tokio::test]
    async fn reserved_instance_is_not_reissued_until_ttl_expires() {
        tokio::time::pause();
        let allocator = IdentifierAllocator::new();
        let id = allocator.allocate_proxy().await.unwrap();
        allocator.reserve(id, Duration::from_secs(30)).await;

        let next = allocator.allocate_proxy().await.unwrap();
        assert_ne!(next.instance(), id.instance());

        tokio::time::advance(Duration::from_secs(31)).await;
        let mut saw_zero = false;
        for _ in 0..99 {
            let reissued = allocator.allocate_proxy().await.unwrap();
            if reissued.instance() == id.instance() {
                saw_zero = true;
                break;
            }
        }
        assert!(saw_zero, "cooled-down instance should become allocatable again");
    }

    #[tokio::test]
    async fn proxy_and_backend_pools_are_independent() {
        let allocator = IdentifierAllocator::new();
        let proxy = allocator.allocate_proxy().await.unwrap();
        let backend = allocator.allocate_backend().await.unwrap();
        assert_eq!(proxy.instance(), 0);
        assert_eq!(backend.instance(), 0);
    }
}
