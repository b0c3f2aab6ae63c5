/// 存储容量计算与准入检查

use std::sync::Arc;

use common::models::constants::{
    DEFAULT_ALLOCATED_DISABLE_THRESHOLD, DEFAULT_OVERPROVISION_FACTOR, DEFAULT_USED_DISABLE_THRESHOLD,
};
use common::models::{AllocationState, CapacityType, VolumeState};
use common::utils::{format_bytes, ratio};
use serde::Deserialize;
use tracing::{debug, info};

use super::dispatcher::DriverRegistry;
use crate::config::CapacityConfig;
use crate::domain::{CapacityRecord, StoragePool};
use crate::errors::{PoolError, PoolResult};
use crate::repository::Repositories;

/// 容量阈值（可按区域覆盖）
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CapacityThresholds {
    pub overprovision_factor: f64,
    pub allocated_disable_threshold: f64,
    pub used_disable_threshold: f64,
}

impl Default for CapacityThresholds {
    fn default() -> Self {
        Self {
            overprovision_factor: DEFAULT_OVERPROVISION_FACTOR,
            allocated_disable_threshold: DEFAULT_ALLOCATED_DISABLE_THRESHOLD,
            used_disable_threshold: DEFAULT_USED_DISABLE_THRESHOLD,
        }
    }
}

/// 超配后的有效容量
pub fn effective_capacity(pool: &StoragePool, factor: f64) -> u64 {
    if pool.pool_type.supports_overprovisioning() {
        (pool.capacity_bytes as f64 * factor) as u64
    } else {
        pool.capacity_bytes
    }
}

/// 已分配量加上本次申请量后是否仍在阈值与有效容量之内
pub fn has_enough_space(
    pool: &StoragePool,
    thresholds: &CapacityThresholds,
    allocated: u64,
    asking: i64,
) -> bool {
    if asking <= 0 {
        return true;
    }

    let effective = effective_capacity(pool, thresholds.overprovision_factor);
    let requested = allocated.saturating_add(asking.unsigned_abs());

    let Some(usage) = ratio(requested, effective) else {
        debug!("存储池 {} 有效容量为 0", pool.id);
        return false;
    };

    if usage > thresholds.allocated_disable_threshold {
        debug!(
            "存储池 {} 分配比例 {:.3} 超过阈值 {:.3}",
            pool.id, usage, thresholds.allocated_disable_threshold
        );
        return false;
    }

    if effective < requested {
        debug!(
            "存储池 {} 有效容量 {} 小于申请后的总量 {}",
            pool.id,
            format_bytes(effective),
            format_bytes(requested)
        );
        return false;
    }

    true
}

/// 物理使用量是否低于禁用阈值
///
/// 托管存储池若驱动不上报物理使用量则直接通过
pub fn has_enough_used_headroom(
    pool: &StoragePool,
    thresholds: &CapacityThresholds,
    reports_usage: bool,
) -> bool {
    if pool.managed && !reports_usage {
        return true;
    }

    match ratio(pool.used_bytes, pool.capacity_bytes) {
        Some(usage) => usage < thresholds.used_disable_threshold,
        None => false,
    }
}

pub fn has_enough_iops(pool: &StoragePool, current: u64, requested: u64) -> bool {
    match pool.capacity_iops {
        None => true,
        Some(capacity) => current.saturating_add(requested) <= capacity,
    }
}

/// 容量服务：准入检查与容量汇总
pub struct CapacityService {
    repos: Repositories,
    config: CapacityConfig,
    drivers: Arc<DriverRegistry>,
}

impl CapacityService {
    pub fn new(repos: Repositories, config: CapacityConfig, drivers: Arc<DriverRegistry>) -> Self {
        Self {
            repos,
            config,
            drivers,
        }
    }

    pub fn thresholds_for(&self, zone_id: &str) -> CapacityThresholds {
        self.config.thresholds_for(zone_id)
    }

    /// 综合空间、物理使用量和 IOPS 的准入检查
    pub async fn check_admission(
        &self,
        pool_id: &str,
        allocated: u64,
        asking: i64,
        current_iops: u64,
        requested_iops: u64,
    ) -> PoolResult<()> {
        let pool = self
            .repos
            .pools
            .get(pool_id)
            .await?
            .ok_or_else(|| PoolError::pool_not_found(pool_id))?;
        let thresholds = self.thresholds_for(&pool.zone_id);

        if !has_enough_space(&pool, &thresholds, allocated, asking) {
            return Err(PoolError::InsufficientCapacity(format!(
                "存储池 {} 空间不足: 已分配 {}, 申请 {}",
                pool.id,
                format_bytes(allocated),
                format_bytes(asking.max(0).unsigned_abs())
            )));
        }

        let reports_usage = self.drivers.reports_usage(pool.pool_type);
        if !has_enough_used_headroom(&pool, &thresholds, reports_usage) {
            return Err(PoolError::InsufficientCapacity(format!(
                "存储池 {} 物理使用量已达阈值: 已用 {} / 总量 {}",
                pool.id,
                format_bytes(pool.used_bytes),
                format_bytes(pool.capacity_bytes)
            )));
        }

        if !has_enough_iops(&pool, current_iops, requested_iops) {
            return Err(PoolError::InsufficientCapacity(format!(
                "存储池 {} IOPS 不足: 当前 {}, 申请 {}",
                pool.id, current_iops, requested_iops
            )));
        }

        Ok(())
    }

    /// 重新计算存储池的两条容量记录
    pub async fn recompute(&self, pool: &StoragePool) -> PoolResult<()> {
        let thresholds = self.thresholds_for(&pool.zone_id);

        let allocated: u64 = self
            .repos
            .volumes
            .list_by_pool(&pool.id)
            .await?
            .iter()
            .filter(|v| !v.state.is_destroyed() && v.state != VolumeState::Allocated)
            .map(|v| v.size_bytes)
            .sum();

        let state = if self.scope_enabled(pool).await? {
            AllocationState::Enabled
        } else {
            AllocationState::Disabled
        };

        let records = [
            CapacityRecord {
                pool_id: pool.id.clone(),
                capacity_type: CapacityType::StorageAllocated,
                allocated,
                total: effective_capacity(pool, thresholds.overprovision_factor),
                state,
            },
            CapacityRecord {
                pool_id: pool.id.clone(),
                capacity_type: CapacityType::StorageUsed,
                allocated: pool.used_bytes,
                total: pool.capacity_bytes,
                state,
            },
        ];

        for record in &records {
            self.repos.capacity.upsert(record).await?;
        }

        info!(
            "存储池 {} 容量已更新: 已分配 {}, 已用 {} / {}",
            pool.id,
            format_bytes(allocated),
            format_bytes(pool.used_bytes),
            format_bytes(pool.capacity_bytes)
        );
        Ok(())
    }

    async fn scope_enabled(&self, pool: &StoragePool) -> PoolResult<bool> {
        if !self.repos.scopes.zone_enabled(&pool.zone_id).await? {
            return Ok(false);
        }
        match &pool.cluster_id {
            Some(cluster_id) => self.repos.scopes.cluster_enabled(cluster_id).await,
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures;
    use crate::repository::memory::MemoryStore;
    use common::models::{StoragePoolType, VolumeType};

    fn scenario_pool() -> StoragePool {
        let mut pool = fixtures::pool("p1", "z1", Some("c1"));
        pool.capacity_bytes = 1000;
        pool
    }

    fn scenario_thresholds() -> CapacityThresholds {
        CapacityThresholds {
            overprovision_factor: 1.0,
            allocated_disable_threshold: 0.85,
            used_disable_threshold: 0.85,
        }
    }

    #[test]
    fn test_allocation_scenario() {
        let pool = scenario_pool();
        let thresholds = scenario_thresholds();
        assert!(has_enough_space(&pool, &thresholds, 600, 200));
        assert!(!has_enough_space(&pool, &thresholds, 600, 300));
    }

    #[test]
    fn test_non_positive_asking_always_fits() {
        let mut pool = scenario_pool();
        pool.capacity_bytes = 0;
        let thresholds = scenario_thresholds();
        assert!(has_enough_space(&pool, &thresholds, 5000, 0));
        assert!(has_enough_space(&pool, &thresholds, 5000, -10));
    }

    #[test]
    fn test_zero_capacity_is_insufficient() {
        let mut pool = scenario_pool();
        pool.capacity_bytes = 0;
        let thresholds = scenario_thresholds();
        assert!(!has_enough_space(&pool, &thresholds, 0, 1));
        assert!(!has_enough_used_headroom(&pool, &thresholds, true));
    }

    #[test]
    fn test_space_is_monotonic_in_asking() {
        let pool = scenario_pool();
        let thresholds = scenario_thresholds();
        let mut rejected = false;
        for asking in (0..=1000).step_by(10) {
            let fits = has_enough_space(&pool, &thresholds, 100, asking);
            if rejected {
                assert!(!fits, "asking={} 不应再次通过", asking);
            }
            rejected |= !fits;
        }
        assert!(rejected);
    }

    #[test]
    fn test_overprovisioning_only_for_supported_types() {
        let mut pool = scenario_pool();
        assert_eq!(effective_capacity(&pool, 2.0), 2000);

        pool.pool_type = StoragePoolType::Lvm;
        assert_eq!(effective_capacity(&pool, 2.0), 1000);
    }

    #[test]
    fn test_used_headroom() {
        let mut pool = scenario_pool();
        let thresholds = scenario_thresholds();
        pool.used_bytes = 849;
        assert!(has_enough_used_headroom(&pool, &thresholds, true));
        pool.used_bytes = 850;
        assert!(!has_enough_used_headroom(&pool, &thresholds, true));

        pool.managed = true;
        assert!(has_enough_used_headroom(&pool, &thresholds, false));
        assert!(!has_enough_used_headroom(&pool, &thresholds, true));
    }

    #[test]
    fn test_iops() {
        let mut pool = scenario_pool();
        assert!(has_enough_iops(&pool, u64::MAX, 1));

        pool.capacity_iops = Some(1000);
        assert!(has_enough_iops(&pool, 600, 400));
        assert!(!has_enough_iops(&pool, 600, 401));
    }

    fn service(store: Arc<MemoryStore>) -> CapacityService {
        let config = CapacityConfig {
            overprovision_factor: 1.0,
            ..CapacityConfig::default()
        };
        CapacityService::new(Repositories::memory(store), config, Arc::new(DriverRegistry::new()))
    }

    #[tokio::test]
    async fn test_check_admission_reports_reason() {
        let store = Arc::new(MemoryStore::new());
        let mut pool = scenario_pool();
        pool.capacity_iops = Some(100);
        store.add_pool(pool);
        let capacity = service(store);

        assert!(capacity.check_admission("p1", 600, 200, 0, 50).await.is_ok());

        let err = capacity.check_admission("p1", 600, 300, 0, 50).await.unwrap_err();
        assert!(matches!(err, PoolError::InsufficientCapacity(ref msg) if msg.contains("空间不足")));

        let err = capacity.check_admission("p1", 0, 10, 90, 20).await.unwrap_err();
        assert!(matches!(err, PoolError::InsufficientCapacity(ref msg) if msg.contains("IOPS")));

        assert!(matches!(
            capacity.check_admission("missing", 0, 1, 0, 0).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recompute_overwrites_records() {
        let store = Arc::new(MemoryStore::new());
        let mut pool = scenario_pool();
        pool.used_bytes = 300;
        store.add_pool(pool.clone());
        store.add_volume(fixtures::volume("v1", "p1", None, VolumeType::DataDisk));
        let mut destroyed = fixtures::volume("v2", "p1", None, VolumeType::DataDisk);
        destroyed.state = VolumeState::Destroyed;
        store.add_volume(destroyed);
        store.disable_zone("z1");

        let capacity = service(store.clone());
        capacity.recompute(&pool).await.unwrap();

        let repos = Repositories::memory(store);
        let allocated = repos
            .capacity
            .get("p1", CapacityType::StorageAllocated)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(allocated.allocated, 100);
        assert_eq!(allocated.total, 1000);
        assert_eq!(allocated.state, AllocationState::Disabled);

        let used = repos
            .capacity
            .get("p1", CapacityType::StorageUsed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(used.allocated, 300);

        pool.used_bytes = 500;
        capacity.recompute(&pool).await.unwrap();
        let used = repos
            .capacity
            .get("p1", CapacityType::StorageUsed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(used.allocated, 500);
    }
}
