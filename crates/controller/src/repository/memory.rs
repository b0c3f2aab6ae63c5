/// 内存仓储（测试用）

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{CapacityType, ControllerState, HostStatus, PoolStatus, VmState};
use common::utils::generate_id;

use super::{
    CapacityRepository, ControllerNodeRepository, HostRepository, MaintenanceLeaseRepository,
    PoolRepository, ScopeRepository, VmRepository, VolumeRepository, WorkItemRepository,
};
use crate::domain::{CapacityRecord, ControllerNode, Host, StoragePool, VmInstance, Volume, WorkItem};
use crate::errors::PoolResult;

#[derive(Default)]
struct Inner {
    pools: BTreeMap<String, StoragePool>,
    hosts: BTreeMap<String, Host>,
    pool_hosts: Vec<(String, String)>,
    volumes: BTreeMap<String, Volume>,
    vms: BTreeMap<String, VmInstance>,
    work_items: Vec<WorkItem>,
    /// scope_key -> (pool_id, owner)
    leases: HashMap<String, (String, String)>,
    capacity: HashMap<(String, CapacityType), CapacityRecord>,
    controllers: HashMap<String, ControllerNode>,
    disabled_zones: HashSet<String>,
    disabled_clusters: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pool(&self, pool: StoragePool) {
        self.inner.lock().unwrap().pools.insert(pool.id.clone(), pool);
    }

    pub fn add_host(&self, host: Host) {
        self.inner.lock().unwrap().hosts.insert(host.id.clone(), host);
    }

    pub fn attach(&self, pool_id: &str, host_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .pool_hosts
            .push((pool_id.to_string(), host_id.to_string()));
    }

    pub fn add_volume(&self, volume: Volume) {
        self.inner.lock().unwrap().volumes.insert(volume.id.clone(), volume);
    }

    pub fn add_vm(&self, vm: VmInstance) {
        self.inner.lock().unwrap().vms.insert(vm.id.clone(), vm);
    }

    pub fn add_work_item(&self, item: WorkItem) {
        self.inner.lock().unwrap().work_items.push(item);
    }

    pub fn add_controller(&self, node: ControllerNode) {
        self.inner.lock().unwrap().controllers.insert(node.id.clone(), node);
    }

    pub fn add_lease(&self, scope_key: &str, pool_id: &str, owner: &str) {
        self.inner
            .lock()
            .unwrap()
            .leases
            .insert(scope_key.to_string(), (pool_id.to_string(), owner.to_string()));
    }

    pub fn disable_zone(&self, zone_id: &str) {
        self.inner.lock().unwrap().disabled_zones.insert(zone_id.to_string());
    }

    pub fn pool(&self, pool_id: &str) -> StoragePool {
        self.inner.lock().unwrap().pools[pool_id].clone()
    }

    pub fn pools(&self) -> Vec<StoragePool> {
        self.inner.lock().unwrap().pools.values().cloned().collect()
    }

    pub fn host(&self, host_id: &str) -> Host {
        self.inner.lock().unwrap().hosts[host_id].clone()
    }

    pub fn vm(&self, vm_id: &str) -> VmInstance {
        self.inner.lock().unwrap().vms[vm_id].clone()
    }

    pub fn set_status(&self, pool_id: &str, status: PoolStatus) {
        if let Some(pool) = self.inner.lock().unwrap().pools.get_mut(pool_id) {
            pool.status = status;
        }
    }

    pub fn work_items(&self) -> Vec<WorkItem> {
        self.inner.lock().unwrap().work_items.clone()
    }

    pub fn lease_count(&self) -> usize {
        self.inner.lock().unwrap().leases.len()
    }

    pub fn controller(&self, id: &str) -> Option<ControllerNode> {
        self.inner.lock().unwrap().controllers.get(id).cloned()
    }
}

#[async_trait]
impl PoolRepository for MemoryStore {
    async fn get(&self, pool_id: &str) -> PoolResult<Option<StoragePool>> {
        Ok(self.inner.lock().unwrap().pools.get(pool_id).cloned())
    }

    async fn list_children(&self, parent_id: &str) -> PoolResult<Vec<StoragePool>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pools
            .values()
            .filter(|p| p.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn list_by_zone(&self, zone_id: &str) -> PoolResult<Vec<StoragePool>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pools
            .values()
            .filter(|p| p.zone_id == zone_id && p.status != PoolStatus::Removed)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: PoolStatus) -> PoolResult<Vec<StoragePool>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pools.values().filter(|p| p.status == status).cloned().collect())
    }

    async fn find_by_external_id(&self, zone_id: &str, external_id: &str) -> PoolResult<Option<StoragePool>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pools
            .values()
            .find(|p| {
                p.zone_id == zone_id
                    && p.external_id.as_deref() == Some(external_id)
                    && p.status != PoolStatus::Removed
            })
            .cloned())
    }

    async fn insert(&self, pool: &StoragePool) -> PoolResult<()> {
        self.add_pool(pool.clone());
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        pool_id: &str,
        expected: PoolStatus,
        next: PoolStatus,
        owner: Option<&str>,
    ) -> PoolResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.pools.get_mut(pool_id) {
            Some(pool) if pool.status == expected => {
                pool.status = next;
                pool.maintenance_owner = owner.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_owned_in_flight(&self, owner: &str) -> PoolResult<Vec<StoragePool>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pools
            .values()
            .filter(|p| p.maintenance_owner.as_deref() == Some(owner) && p.status.is_in_flight())
            .cloned()
            .collect())
    }

    async fn update_usage(&self, pool_id: &str, capacity_bytes: u64, used_bytes: u64) -> PoolResult<()> {
        if let Some(pool) = self.inner.lock().unwrap().pools.get_mut(pool_id) {
            pool.capacity_bytes = capacity_bytes;
            pool.used_bytes = used_bytes;
        }
        Ok(())
    }

    async fn set_parent(&self, pool_id: &str, parent_id: Option<&str>) -> PoolResult<()> {
        if let Some(pool) = self.inner.lock().unwrap().pools.get_mut(pool_id) {
            pool.parent_id = parent_id.map(str::to_string);
        }
        Ok(())
    }

    async fn set_removal_pending(&self, pool_id: &str, pending: bool) -> PoolResult<()> {
        if let Some(pool) = self.inner.lock().unwrap().pools.get_mut(pool_id) {
            pool.removal_pending = pending;
        }
        Ok(())
    }
}

#[async_trait]
impl HostRepository for MemoryStore {
    async fn get(&self, host_id: &str) -> PoolResult<Option<Host>> {
        Ok(self.inner.lock().unwrap().hosts.get(host_id).cloned())
    }

    async fn list_attached_to_pool(&self, pool_id: &str) -> PoolResult<Vec<Host>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hosts
            .values()
            .filter(|h| inner.pool_hosts.iter().any(|(p, id)| p == pool_id && *id == h.id))
            .cloned()
            .collect())
    }

    async fn list_by_zone(&self, zone_id: &str) -> PoolResult<Vec<Host>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hosts.values().filter(|h| h.zone_id == zone_id).cloned().collect())
    }

    async fn list_by_cluster(&self, cluster_id: &str) -> PoolResult<Vec<Host>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hosts
            .values()
            .filter(|h| h.cluster_id.as_deref() == Some(cluster_id))
            .cloned()
            .collect())
    }

    async fn set_status(&self, host_id: &str, status: HostStatus) -> PoolResult<()> {
        if let Some(host) = self.inner.lock().unwrap().hosts.get_mut(host_id) {
            host.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeRepository for MemoryStore {
    async fn list_by_pool(&self, pool_id: &str) -> PoolResult<Vec<Volume>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.volumes.values().filter(|v| v.pool_id == pool_id).cloned().collect())
    }

    async fn list_by_vm(&self, vm_id: &str) -> PoolResult<Vec<Volume>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .volumes
            .values()
            .filter(|v| v.vm_id.as_deref() == Some(vm_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VmRepository for MemoryStore {
    async fn get(&self, vm_id: &str) -> PoolResult<Option<VmInstance>> {
        Ok(self.inner.lock().unwrap().vms.get(vm_id).cloned())
    }

    async fn update_state(&self, vm_id: &str, state: VmState) -> PoolResult<()> {
        if let Some(vm) = self.inner.lock().unwrap().vms.get_mut(vm_id) {
            vm.state = state;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkItemRepository for MemoryStore {
    async fn upsert(&self, pool_id: &str, vm_id: &str, owner: &str) -> PoolResult<WorkItem> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner
            .work_items
            .iter_mut()
            .find(|w| w.pool_id == pool_id && w.vm_id == vm_id)
        {
            item.stopped_for_maintenance = false;
            item.started_after_maintenance = false;
            item.owner_controller_id = owner.to_string();
            return Ok(item.clone());
        }

        let item = WorkItem {
            id: generate_id(),
            pool_id: pool_id.to_string(),
            vm_id: vm_id.to_string(),
            stopped_for_maintenance: false,
            started_after_maintenance: false,
            owner_controller_id: owner.to_string(),
        };
        inner.work_items.push(item.clone());
        Ok(item)
    }

    async fn list_by_pool(&self, pool_id: &str) -> PoolResult<Vec<WorkItem>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.work_items.iter().filter(|w| w.pool_id == pool_id).cloned().collect())
    }

    async fn list_all(&self) -> PoolResult<Vec<WorkItem>> {
        Ok(self.work_items())
    }

    async fn update_flags(&self, item_id: &str, stopped: bool, started: bool) -> PoolResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.work_items.iter_mut().find(|w| w.id == item_id) {
            Some(item) => {
                item.stopped_for_maintenance = stopped;
                item.started_after_maintenance = started;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, item_id: &str) -> PoolResult<()> {
        self.inner.lock().unwrap().work_items.retain(|w| w.id != item_id);
        Ok(())
    }

    async fn pool_ids_with_pending_for_owner(&self, owner: &str) -> PoolResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut pool_ids: Vec<String> = inner
            .work_items
            .iter()
            .filter(|w| w.owner_controller_id == owner && !w.is_completed())
            .map(|w| w.pool_id.clone())
            .collect();
        pool_ids.sort();
        pool_ids.dedup();
        Ok(pool_ids)
    }

    async fn remove_pending(&self, owner: &str, pool_id: &str) -> PoolResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.work_items.len();
        inner
            .work_items
            .retain(|w| !(w.owner_controller_id == owner && w.pool_id == pool_id && !w.is_completed()));
        Ok((before - inner.work_items.len()) as u64)
    }
}

#[async_trait]
impl MaintenanceLeaseRepository for MemoryStore {
    async fn try_acquire(&self, scope_key: &str, pool_id: &str, owner: &str) -> PoolResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leases.contains_key(scope_key) {
            return Ok(false);
        }
        inner
            .leases
            .insert(scope_key.to_string(), (pool_id.to_string(), owner.to_string()));
        Ok(true)
    }

    async fn holder(&self, scope_key: &str) -> PoolResult<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.leases.get(scope_key).map(|(pool_id, _)| pool_id.clone()))
    }

    async fn release(&self, scope_key: &str, owner: &str) -> PoolResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leases.get(scope_key).is_some_and(|(_, o)| o == owner) {
            inner.leases.remove(scope_key);
        }
        Ok(())
    }

    async fn release_owned_by(&self, owner: &str) -> PoolResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.leases.len();
        inner.leases.retain(|_, (_, o)| o != owner);
        Ok((before - inner.leases.len()) as u64)
    }
}

#[async_trait]
impl CapacityRepository for MemoryStore {
    async fn upsert(&self, record: &CapacityRecord) -> PoolResult<()> {
        self.inner
            .lock()
            .unwrap()
            .capacity
            .insert((record.pool_id.clone(), record.capacity_type), record.clone());
        Ok(())
    }

    async fn get(&self, pool_id: &str, capacity_type: CapacityType) -> PoolResult<Option<CapacityRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.capacity.get(&(pool_id.to_string(), capacity_type)).cloned())
    }
}

#[async_trait]
impl ControllerNodeRepository for MemoryStore {
    async fn heartbeat(&self, id: &str, address: &str, now: DateTime<Utc>) -> PoolResult<Option<ControllerNode>> {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.controllers.insert(
            id.to_string(),
            ControllerNode {
                id: id.to_string(),
                address: address.to_string(),
                state: ControllerState::Up,
                last_heartbeat: now,
            },
        );
        Ok(previous)
    }

    async fn list_stale(&self, before: DateTime<Utc>) -> PoolResult<Vec<ControllerNode>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .controllers
            .values()
            .filter(|c| c.state == ControllerState::Up && c.last_heartbeat < before)
            .cloned()
            .collect())
    }

    async fn mark_down(&self, id: &str) -> PoolResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.controllers.get_mut(id) {
            Some(node) if node.state == ControllerState::Up => {
                node.state = ControllerState::Down;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ScopeRepository for MemoryStore {
    async fn zone_enabled(&self, zone_id: &str) -> PoolResult<bool> {
        Ok(!self.inner.lock().unwrap().disabled_zones.contains(zone_id))
    }

    async fn cluster_enabled(&self, cluster_id: &str) -> PoolResult<bool> {
        Ok(!self.inner.lock().unwrap().disabled_clusters.contains(cluster_id))
    }
}
