/// 持久化访问接口
///
/// 服务层只依赖这里的 trait，生产环境使用 SeaORM 实现，测试使用内存实现

pub mod sea;

#[cfg(test)]
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{CapacityType, HostStatus, PoolStatus, VmState};
use sea_orm::DatabaseConnection;

use crate::domain::{CapacityRecord, ControllerNode, Host, StoragePool, VmInstance, Volume, WorkItem};
use crate::errors::PoolResult;

#[async_trait]
pub trait PoolRepository: Send + Sync {
    async fn get(&self, pool_id: &str) -> PoolResult<Option<StoragePool>>;

    async fn list_children(&self, parent_id: &str) -> PoolResult<Vec<StoragePool>>;

    async fn list_by_zone(&self, zone_id: &str) -> PoolResult<Vec<StoragePool>>;

    async fn list_by_status(&self, status: PoolStatus) -> PoolResult<Vec<StoragePool>>;

    async fn find_by_external_id(&self, zone_id: &str, external_id: &str) -> PoolResult<Option<StoragePool>>;

    async fn insert(&self, pool: &StoragePool) -> PoolResult<()>;

    /// 仅当当前状态等于 expected 时写入 next，返回是否写入
    ///
    /// owner 同时写入维护执行者，离开维护中间状态时传 None
    async fn compare_and_set_status(
        &self,
        pool_id: &str,
        expected: PoolStatus,
        next: PoolStatus,
        owner: Option<&str>,
    ) -> PoolResult<bool>;

    /// 由指定控制器执行、仍处于维护中间状态的存储池
    async fn list_owned_in_flight(&self, owner: &str) -> PoolResult<Vec<StoragePool>>;

    async fn update_usage(&self, pool_id: &str, capacity_bytes: u64, used_bytes: u64) -> PoolResult<()>;

    async fn set_parent(&self, pool_id: &str, parent_id: Option<&str>) -> PoolResult<()>;

    async fn set_removal_pending(&self, pool_id: &str, pending: bool) -> PoolResult<()>;
}

#[async_trait]
pub trait HostRepository: Send + Sync {
    async fn get(&self, host_id: &str) -> PoolResult<Option<Host>>;

    /// 与存储池建立了挂载关系的主机
    async fn list_attached_to_pool(&self, pool_id: &str) -> PoolResult<Vec<Host>>;

    async fn list_by_zone(&self, zone_id: &str) -> PoolResult<Vec<Host>>;

    async fn list_by_cluster(&self, cluster_id: &str) -> PoolResult<Vec<Host>>;

    async fn set_status(&self, host_id: &str, status: HostStatus) -> PoolResult<()>;
}

#[async_trait]
pub trait VolumeRepository: Send + Sync {
    async fn list_by_pool(&self, pool_id: &str) -> PoolResult<Vec<Volume>>;

    async fn list_by_vm(&self, vm_id: &str) -> PoolResult<Vec<Volume>>;
}

#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn get(&self, vm_id: &str) -> PoolResult<Option<VmInstance>>;

    async fn update_state(&self, vm_id: &str, state: VmState) -> PoolResult<()>;
}

#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// 按 (pool_id, vm_id) 原子插入或重置
    async fn upsert(&self, pool_id: &str, vm_id: &str, owner: &str) -> PoolResult<WorkItem>;

    async fn list_by_pool(&self, pool_id: &str) -> PoolResult<Vec<WorkItem>>;

    async fn list_all(&self) -> PoolResult<Vec<WorkItem>>;

    /// 记录不存在时返回 false
    async fn update_flags(&self, item_id: &str, stopped: bool, started: bool) -> PoolResult<bool>;

    async fn remove(&self, item_id: &str) -> PoolResult<()>;

    /// 指定控制器名下仍有未完成工作项的存储池
    async fn pool_ids_with_pending_for_owner(&self, owner: &str) -> PoolResult<Vec<String>>;

    /// 删除指定控制器在某存储池下未完成的工作项，返回删除条数
    async fn remove_pending(&self, owner: &str, pool_id: &str) -> PoolResult<u64>;
}

#[async_trait]
pub trait MaintenanceLeaseRepository: Send + Sync {
    /// 作用域键不存在时插入，返回是否获得租约
    async fn try_acquire(&self, scope_key: &str, pool_id: &str, owner: &str) -> PoolResult<bool>;

    /// 当前持有租约的存储池
    async fn holder(&self, scope_key: &str) -> PoolResult<Option<String>>;

    async fn release(&self, scope_key: &str, owner: &str) -> PoolResult<()>;

    async fn release_owned_by(&self, owner: &str) -> PoolResult<u64>;
}

#[async_trait]
pub trait CapacityRepository: Send + Sync {
    async fn upsert(&self, record: &CapacityRecord) -> PoolResult<()>;

    async fn get(&self, pool_id: &str, capacity_type: CapacityType) -> PoolResult<Option<CapacityRecord>>;
}

#[async_trait]
pub trait ControllerNodeRepository: Send + Sync {
    /// 刷新心跳，不存在则登记，返回刷新前的节点记录
    async fn heartbeat(&self, id: &str, address: &str, now: DateTime<Utc>) -> PoolResult<Option<ControllerNode>>;

    /// 心跳早于 before 且仍为 up 的节点
    async fn list_stale(&self, before: DateTime<Utc>) -> PoolResult<Vec<ControllerNode>>;

    /// up -> down，返回是否由本次调用完成标记
    async fn mark_down(&self, id: &str) -> PoolResult<bool>;
}

#[async_trait]
pub trait ScopeRepository: Send + Sync {
    async fn zone_enabled(&self, zone_id: &str) -> PoolResult<bool>;

    async fn cluster_enabled(&self, cluster_id: &str) -> PoolResult<bool>;
}

/// 所有仓储的集合
#[derive(Clone)]
pub struct Repositories {
    pub pools: Arc<dyn PoolRepository>,
    pub hosts: Arc<dyn HostRepository>,
    pub volumes: Arc<dyn VolumeRepository>,
    pub vms: Arc<dyn VmRepository>,
    pub work_items: Arc<dyn WorkItemRepository>,
    pub leases: Arc<dyn MaintenanceLeaseRepository>,
    pub capacity: Arc<dyn CapacityRepository>,
    pub controllers: Arc<dyn ControllerNodeRepository>,
    pub scopes: Arc<dyn ScopeRepository>,
}

impl Repositories {
    /// 基于 SeaORM 连接构建
    pub fn sea(db: DatabaseConnection) -> Self {
        let repo = Arc::new(sea::SeaRepository::new(db));
        Self {
            pools: repo.clone(),
            hosts: repo.clone(),
            volumes: repo.clone(),
            vms: repo.clone(),
            work_items: repo.clone(),
            leases: repo.clone(),
            capacity: repo.clone(),
            controllers: repo.clone(),
            scopes: repo,
        }
    }

    #[cfg(test)]
    pub fn memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            pools: store.clone(),
            hosts: store.clone(),
            volumes: store.clone(),
            vms: store.clone(),
            work_items: store.clone(),
            leases: store.clone(),
            capacity: store.clone(),
            controllers: store.clone(),
            scopes: store,
        }
    }
}
