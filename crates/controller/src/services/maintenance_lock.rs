/// 维护互斥锁
///
/// 同一集群（区域级存储池为同一区域）内同时只允许一个存储池准备维护。
/// 租约保存在数据库中，控制器离线后由存活的控制器批量释放

use common::models::PoolStatus;
use tracing::{debug, info, warn};

use crate::domain::StoragePool;
use crate::errors::{PoolError, PoolResult};
use crate::repository::Repositories;

/// 已获得的租约
#[derive(Debug)]
pub struct MaintenanceLease {
    pub scope_key: String,
    pub pool_id: String,
}

pub struct MaintenanceLock {
    repos: Repositories,
    controller_id: String,
}

impl MaintenanceLock {
    pub fn new(repos: Repositories, controller_id: impl Into<String>) -> Self {
        Self {
            repos,
            controller_id: controller_id.into(),
        }
    }

    /// 获取作用域租约，并在持有租约期间检查同作用域的其他存储池
    ///
    /// 被拒绝时不会留下任何写入
    pub async fn acquire(&self, pool: &StoragePool) -> PoolResult<MaintenanceLease> {
        let scope_key = pool.scope_key();

        if !self
            .repos
            .leases
            .try_acquire(&scope_key, &pool.id, &self.controller_id)
            .await?
        {
            let holder = self.repos.leases.holder(&scope_key).await?.unwrap_or_default();
            warn!("存储池 {} 获取维护租约 {} 失败，当前持有者: {}", pool.id, scope_key, holder);
            return Err(PoolError::ConcurrentMaintenanceConflict {
                pool_id: pool.id.clone(),
                conflicting_pool_id: holder,
            });
        }

        let lease = MaintenanceLease {
            scope_key,
            pool_id: pool.id.clone(),
        };

        match self.find_preparing_sibling(pool).await {
            Ok(None) => {
                debug!("存储池 {} 已获得维护租约 {}", pool.id, lease.scope_key);
                Ok(lease)
            }
            Ok(Some(conflicting_pool_id)) => {
                self.release(&lease).await;
                Err(PoolError::ConcurrentMaintenanceConflict {
                    pool_id: pool.id.clone(),
                    conflicting_pool_id,
                })
            }
            Err(e) => {
                self.release(&lease).await;
                Err(e)
            }
        }
    }

    /// 释放租约，失败只记录日志
    pub async fn release(&self, lease: &MaintenanceLease) {
        match self.repos.leases.release(&lease.scope_key, &self.controller_id).await {
            Ok(()) => debug!("存储池 {} 已释放维护租约 {}", lease.pool_id, lease.scope_key),
            Err(e) => warn!("释放维护租约 {} 失败: {}", lease.scope_key, e),
        }
    }

    /// 释放某个控制器持有的全部租约
    pub async fn release_owned_by(&self, controller_id: &str) -> PoolResult<u64> {
        let released = self.repos.leases.release_owned_by(controller_id).await?;
        if released > 0 {
            info!("已释放控制器 {} 持有的 {} 个维护租约", controller_id, released);
        }
        Ok(released)
    }

    async fn find_preparing_sibling(&self, pool: &StoragePool) -> PoolResult<Option<String>> {
        let scope_key = pool.scope_key();
        let siblings = self.repos.pools.list_by_zone(&pool.zone_id).await?;
        Ok(siblings
            .into_iter()
            .filter(|p| !pool.same_family(p) && p.scope_key() == scope_key)
            .find(|p| p.status == PoolStatus::PrepareForMaintenance)
            .map(|p| p.id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::fixtures;
    use crate::repository::memory::MemoryStore;

    #[tokio::test]
    async fn test_second_acquire_in_scope_conflicts() {
        let store = Arc::new(MemoryStore::new());
        store.add_pool(fixtures::pool("p1", "z1", Some("c1")));
        store.add_pool(fixtures::pool("p2", "z1", Some("c1")));
        store.add_pool(fixtures::pool("p3", "z1", Some("c2")));
        let lock = MaintenanceLock::new(Repositories::memory(store.clone()), "ctl");

        let lease = lock.acquire(&store.pool("p1")).await.unwrap();
        let err = lock.acquire(&store.pool("p2")).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::ConcurrentMaintenanceConflict { ref conflicting_pool_id, .. } if conflicting_pool_id == "p1"
        ));

        // 不同集群互不影响
        let other = lock.acquire(&store.pool("p3")).await.unwrap();

        lock.release(&lease).await;
        lock.release(&other).await;
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_preparing_sibling_rejects_and_releases() {
        let store = Arc::new(MemoryStore::new());
        store.add_pool(fixtures::pool("p1", "z1", Some("c1")));
        let mut sibling = fixtures::pool("p2", "z1", Some("c1"));
        sibling.status = PoolStatus::PrepareForMaintenance;
        store.add_pool(sibling);
        let lock = MaintenanceLock::new(Repositories::memory(store.clone()), "ctl");

        let err = lock.acquire(&store.pool("p1")).await.unwrap_err();
        assert!(matches!(err, PoolError::ConcurrentMaintenanceConflict { .. }));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_family_members_are_not_siblings() {
        let store = Arc::new(MemoryStore::new());
        let mut container = fixtures::pool("p1", "z1", Some("c1"));
        container.status = PoolStatus::PrepareForMaintenance;
        store.add_pool(container);
        let mut child = fixtures::pool("p2", "z1", Some("c1"));
        child.parent_id = Some("p1".to_string());
        child.status = PoolStatus::PrepareForMaintenance;
        store.add_pool(child);
        let lock = MaintenanceLock::new(Repositories::memory(store.clone()), "ctl");

        assert!(lock.acquire(&store.pool("p1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_owned_by() {
        let store = Arc::new(MemoryStore::new());
        store.add_lease("cluster:c1", "p1", "dead");
        store.add_lease("cluster:c2", "p2", "alive");
        let lock = MaintenanceLock::new(Repositories::memory(store.clone()), "alive");

        assert_eq!(lock.release_owned_by("dead").await.unwrap(), 1);
        assert_eq!(store.lease_count(), 1);
    }
}
