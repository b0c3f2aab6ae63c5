/// 存储池生命周期
///
/// 进入维护、取消维护以及管理员的启用 / 禁用 / 删除操作。
/// 所有状态变更都经过 PoolStatus::apply 的转移表，并以比较并交换的方式写入

use std::collections::HashSet;
use std::sync::Arc;

use common::models::{PoolEvent, PoolScope, PoolStatus, VolumeType};
use common::ws_rpc::{ModifyStoragePoolRequest, ModifyStoragePoolResponse, StorageAnswer, StorageCommand};
use tracing::{debug, error, info, warn};

use crate::domain::{Host, StoragePool};
use crate::errors::{PoolError, PoolResult};
use crate::metrics;
use crate::repository::Repositories;
use crate::services::dispatcher::CommandDispatcher;
use crate::services::maintenance_lock::MaintenanceLock;
use crate::services::topology::TopologySync;
use crate::services::vm_control::VmControl;
use crate::services::work_queue::WorkQueue;

pub struct PoolLifecycleService {
    repos: Repositories,
    dispatcher: Arc<CommandDispatcher>,
    queue: WorkQueue,
    lock: MaintenanceLock,
    topology: TopologySync,
    vm_control: Arc<dyn VmControl>,
    controller_id: String,
    heartbeat_add_attempts: u32,
}

impl PoolLifecycleService {
    pub fn new(
        repos: Repositories,
        dispatcher: Arc<CommandDispatcher>,
        vm_control: Arc<dyn VmControl>,
        controller_id: impl Into<String>,
        heartbeat_add_attempts: u32,
    ) -> Self {
        let controller_id = controller_id.into();
        Self {
            queue: WorkQueue::new(repos.clone()),
            lock: MaintenanceLock::new(repos.clone(), controller_id.clone()),
            topology: TopologySync::new(repos.clone()),
            repos,
            dispatcher,
            vm_control,
            controller_id,
            heartbeat_add_attempts: heartbeat_add_attempts.max(1),
        }
    }

    // ------------------------------------------------------------------
    // 进入维护
    // ------------------------------------------------------------------

    /// 将存储池置为维护状态
    ///
    /// 停止使用该存储池的虚拟机；系统虚拟机在区域内仍有可用存储池时立即重启
    pub async fn maintain(&self, pool_id: &str) -> PoolResult<()> {
        let pool = self.load(pool_id).await?;
        if pool.is_child() {
            return Err(PoolError::InvalidArgument(format!(
                "子存储池 {} 由其容器存储池统一进入维护",
                pool_id
            )));
        }
        if pool.status.apply(PoolEvent::MaintenanceRequested).is_none() {
            return Err(PoolError::IllegalTransition {
                pool_id: pool.id.clone(),
                from: pool.status,
                event: PoolEvent::MaintenanceRequested,
            });
        }

        let lease = self.lock.acquire(&pool).await?;
        info!("🔧 存储池 {} ({}) 开始进入维护", pool.id, pool.name);

        let result = self.run_maintenance(&pool).await;
        self.lock.release(&lease).await;

        match &result {
            Ok(()) => info!("✅ 存储池 {} 已进入维护", pool.id),
            Err(e) => error!("❌ 存储池 {} 进入维护失败: {}", pool.id, e),
        }
        result
    }

    async fn run_maintenance(&self, pool: &StoragePool) -> PoolResult<()> {
        let children = self.active_children(pool).await?;

        match self.maintenance_steps(pool, &children).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_family(&pool.id, &children).await;
                Err(PoolError::in_maintenance(&pool.id, e))
            }
        }
    }

    async fn maintenance_steps(&self, pool: &StoragePool, children: &[StoragePool]) -> PoolResult<()> {
        let mut marked = Vec::with_capacity(children.len());
        for child in children {
            marked.push(self.transition(child, PoolEvent::MaintenanceRequested).await?);
        }

        let hosts = self.resolve_hosts(pool).await?;
        if hosts.is_empty() {
            info!("存储池 {} 没有已连接的主机，直接进入维护", pool.id);
            self.transition(pool, PoolEvent::NothingToDrain).await?;
            for child in &marked {
                self.transition(child, PoolEvent::Drained).await?;
            }
            return Ok(());
        }

        let pool = self.transition(pool, PoolEvent::MaintenanceRequested).await?;
        self.remove_heartbeats(&pool, &hosts).await;
        self.enqueue_affected_vms(&pool, children).await?;
        self.drain_for_maintenance(&pool).await?;

        self.transition(&pool, PoolEvent::Drained).await?;
        for child in &marked {
            self.transition(child, PoolEvent::Drained).await?;
        }
        Ok(())
    }

    /// 移除心跳失败只记录日志
    async fn remove_heartbeats(&self, pool: &StoragePool, hosts: &[String]) {
        let command = heartbeat_command(pool, false);
        for host_id in hosts {
            match self.dispatcher.send_to_host(host_id, &command).await {
                Ok(answer) if answer.is_success() => {
                    debug!("已在主机 {} 上移除存储池 {} 的心跳", host_id, pool.id)
                }
                Ok(answer) => warn!(
                    "主机 {} 移除存储池 {} 心跳失败: {}",
                    host_id,
                    pool.id,
                    answer.message()
                ),
                Err(e) => warn!("主机 {} 移除存储池 {} 心跳失败: {}", host_id, pool.id, e),
            }
        }
    }

    /// 为仍在使用存储池（或其子池）的虚拟机登记工作项
    async fn enqueue_affected_vms(&self, pool: &StoragePool, children: &[StoragePool]) -> PoolResult<()> {
        let mut seen = HashSet::new();
        let pool_ids = std::iter::once(&pool.id).chain(children.iter().map(|c| &c.id));

        for pool_id in pool_ids {
            for volume in self.repos.volumes.list_by_pool(pool_id).await? {
                if volume.state.is_destroyed() {
                    continue;
                }
                let Some(vm_id) = volume.vm_id else {
                    continue;
                };
                if !seen.insert(vm_id.clone()) {
                    continue;
                }
                let Some(vm) = self.repos.vms.get(&vm_id).await? else {
                    continue;
                };
                if vm.state.uses_storage() {
                    self.queue.enqueue(&pool.id, &vm.id, &self.controller_id).await?;
                    debug!("虚拟机 {} ({}) 登记到存储池 {} 的维护队列", vm.id, vm.state, pool.id);
                }
            }
        }
        Ok(())
    }

    async fn drain_for_maintenance(&self, pool: &StoragePool) -> PoolResult<()> {
        let restart_infrastructure = self.another_up_pool_exists(pool).await?;

        for mut item in self.queue.list_pending_for_maintenance(&pool.id).await? {
            let Some(vm) = self.repos.vms.get(&item.vm_id).await? else {
                warn!("虚拟机 {} 已不存在，丢弃工作项 {}", item.vm_id, item.id);
                self.queue.remove(&item).await?;
                continue;
            };

            self.stop_vm(&vm.id).await?;
            self.queue.mark_stopped(&mut item).await?;

            if vm.vm_type.is_infrastructure() && restart_infrastructure {
                self.start_vm(&vm.id).await?;
                self.queue.mark_restarted(&mut item).await?;
                info!("系统虚拟机 {} ({}) 已在其他存储池上重启", vm.id, vm.vm_type);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 取消维护
    // ------------------------------------------------------------------

    /// 取消维护：恢复主机心跳并重启因维护停止的虚拟机
    pub async fn cancel_maintain(&self, pool_id: &str) -> PoolResult<()> {
        let pool = self.load(pool_id).await?;
        if pool.is_child() {
            return Err(PoolError::InvalidArgument(format!(
                "子存储池 {} 由其容器存储池统一取消维护",
                pool_id
            )));
        }

        let pool = self.transition(&pool, PoolEvent::CancelRequested).await?;
        info!("🔧 存储池 {} ({}) 开始取消维护", pool.id, pool.name);

        match self.cancel_steps(&pool).await {
            Ok(()) => {
                self.transition(&pool, PoolEvent::Resumed).await?;
                info!("✅ 存储池 {} 已恢复可用", pool.id);
                Ok(())
            }
            Err(e) => {
                error!("❌ 存储池 {} 取消维护失败: {}", pool.id, e);
                self.force_error(&pool.id, false).await;
                Err(PoolError::in_maintenance(&pool.id, e))
            }
        }
    }

    async fn cancel_steps(&self, pool: &StoragePool) -> PoolResult<()> {
        let hosts = self.resolve_hosts(pool).await?;
        if hosts.is_empty() {
            info!("存储池 {} 没有已连接的主机，无需恢复心跳", pool.id);
        }
        for host_id in &hosts {
            self.add_heartbeat(pool, host_id).await?;
        }

        // 子池上的虚拟机在进入维护时登记在容器池下，这里一并重启
        self.drain_for_cancel(pool).await?;

        if !pool.is_container() {
            return Ok(());
        }

        let mut failure = None;
        for child in self.active_children(pool).await? {
            if let Err(e) = self.cancel_child(&child).await {
                warn!("子存储池 {} 取消维护失败: {}", child.id, e);
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cancel_child(&self, child: &StoragePool) -> PoolResult<()> {
        match self.resume_child(child).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.force_error(&child.id, true).await;
                Err(PoolError::in_maintenance(&child.id, e))
            }
        }
    }

    async fn resume_child(&self, child: &StoragePool) -> PoolResult<()> {
        // 拓扑同步新加入的子池直接继承了容器的状态
        let child = if child.status == PoolStatus::CancelMaintenance {
            child.clone()
        } else {
            self.transition(child, PoolEvent::CancelRequested).await?
        };
        self.transition(&child, PoolEvent::Resumed).await?;
        Ok(())
    }

    /// 在主机上恢复心跳（挂载存储池），失败按配置次数重试
    async fn add_heartbeat(&self, pool: &StoragePool, host_id: &str) -> PoolResult<()> {
        let command = heartbeat_command(pool, true);
        let mut last_failure = String::new();

        for attempt in 1..=self.heartbeat_add_attempts {
            match self.dispatcher.send_to_host(host_id, &command).await {
                Ok(StorageAnswer::ModifyStoragePool(resp)) if resp.success => {
                    debug!("主机 {} 已恢复存储池 {} 的心跳", host_id, pool.id);
                    self.on_heartbeat_added(pool, host_id, resp).await;
                    return Ok(());
                }
                Ok(StorageAnswer::ModifyStoragePool(resp))
                    if resp.mount_rejected && pool.pool_type.requires_mount() =>
                {
                    return Err(PoolError::MountRejected {
                        pool_id: pool.id.clone(),
                        host_id: host_id.to_string(),
                        details: resp.message,
                    });
                }
                Ok(answer) => last_failure = answer.message().to_string(),
                Err(e) => last_failure = e.to_string(),
            }
            warn!(
                "主机 {} 恢复存储池 {} 心跳失败 ({}/{}): {}",
                host_id, pool.id, attempt, self.heartbeat_add_attempts, last_failure
            );
        }

        if pool.pool_type.requires_mount() {
            return Err(PoolError::HeartbeatFailed {
                pool_id: pool.id.clone(),
                host_id: host_id.to_string(),
                details: last_failure,
            });
        }
        warn!("存储池 {} 类型 {} 无需挂载，忽略主机 {} 的心跳失败", pool.id, pool.pool_type, host_id);
        Ok(())
    }

    /// 挂载应答可能带有容量和容器池的子池列表
    async fn on_heartbeat_added(&self, pool: &StoragePool, host_id: &str, resp: ModifyStoragePoolResponse) {
        if let (Some(capacity), Some(used)) = (resp.capacity_bytes, resp.used_bytes) {
            if let Err(e) = self.repos.pools.update_usage(&pool.id, capacity, used).await {
                warn!("更新存储池 {} 容量失败: {}", pool.id, e);
            }
        }

        if pool.is_container() && !resp.child_pools.is_empty() {
            match self.topology.sync_container_topology(&pool.id, &resp.child_pools).await {
                Ok(report) if !report.is_unchanged() => info!(
                    "主机 {} 上报容器存储池 {} 拓扑变化: {:?}",
                    host_id, pool.id, report
                ),
                Ok(_) => {}
                Err(e) => warn!("同步容器存储池 {} 拓扑失败: {}", pool.id, e),
            }
        }
    }

    async fn drain_for_cancel(&self, pool: &StoragePool) -> PoolResult<()> {
        for mut item in self.queue.list_pending_for_cancel_maintenance(&pool.id).await? {
            let Some(vm) = self.repos.vms.get(&item.vm_id).await? else {
                warn!("虚拟机 {} 已不存在，丢弃工作项 {}", item.vm_id, item.id);
                self.queue.remove(&item).await?;
                continue;
            };

            if !vm.vm_type.is_infrastructure() && !self.has_root_volume(&vm.id).await? {
                info!("虚拟机 {} 没有可用的根卷，不再重启", vm.id);
                self.queue.remove(&item).await?;
                continue;
            }

            self.start_vm(&vm.id).await?;
            self.queue.mark_restarted(&mut item).await?;
            self.queue.remove(&item).await?;
        }
        Ok(())
    }

    async fn has_root_volume(&self, vm_id: &str) -> PoolResult<bool> {
        Ok(self
            .repos
            .volumes
            .list_by_vm(vm_id)
            .await?
            .iter()
            .any(|v| v.volume_type == VolumeType::Root && !v.state.is_destroyed()))
    }

    // ------------------------------------------------------------------
    // 管理员操作
    // ------------------------------------------------------------------

    pub async fn enable(&self, pool_id: &str) -> PoolResult<()> {
        let pool = self.load(pool_id).await?;
        self.transition(&pool, PoolEvent::Enable).await?;
        Ok(())
    }

    pub async fn disable(&self, pool_id: &str) -> PoolResult<()> {
        let pool = self.load(pool_id).await?;
        self.transition(&pool, PoolEvent::Disable).await?;
        Ok(())
    }

    /// 删除存储池：不能还有存储卷，容器池的子池必须已全部删除
    pub async fn remove(&self, pool_id: &str) -> PoolResult<()> {
        let pool = self.load(pool_id).await?;

        let volumes = self.repos.volumes.list_by_pool(pool_id).await?;
        if volumes.iter().any(|v| !v.state.is_destroyed()) {
            return Err(PoolError::InvalidArgument(format!("存储池 {} 上仍有存储卷", pool_id)));
        }

        if pool.is_container() {
            let children = self.repos.pools.list_children(pool_id).await?;
            if let Some(child) = children.iter().find(|c| c.status != PoolStatus::Removed) {
                return Err(PoolError::InvalidArgument(format!(
                    "容器存储池 {} 的子存储池 {} 尚未删除",
                    pool_id, child.id
                )));
            }
        }

        self.transition(&pool, PoolEvent::Remove).await?;
        info!("存储池 {} 已删除", pool_id);
        Ok(())
    }

    /// 区域内是否仍有可供系统虚拟机使用的存储
    ///
    /// 只在区域内没有存储池，或唯一的存储池处于维护状态时返回 false
    pub async fn storage_available_for_forced_share(&self, zone_id: &str) -> PoolResult<bool> {
        let pools = self.repos.pools.list_by_zone(zone_id).await?;
        Ok(match pools.as_slice() {
            [] => false,
            [only] => only.status != PoolStatus::Maintenance,
            _ => true,
        })
    }

    // ------------------------------------------------------------------
    // 内部工具
    // ------------------------------------------------------------------

    async fn load(&self, pool_id: &str) -> PoolResult<StoragePool> {
        self.repos
            .pools
            .get(pool_id)
            .await?
            .ok_or_else(|| PoolError::pool_not_found(pool_id))
    }

    async fn active_children(&self, pool: &StoragePool) -> PoolResult<Vec<StoragePool>> {
        if !pool.is_container() {
            return Ok(Vec::new());
        }
        let children = self.repos.pools.list_children(&pool.id).await?;
        Ok(children
            .into_iter()
            .filter(|c| c.status != PoolStatus::Removed)
            .collect())
    }

    /// 按转移表执行一次状态变更，返回变更后的存储池
    async fn transition(&self, pool: &StoragePool, event: PoolEvent) -> PoolResult<StoragePool> {
        let next = pool
            .status
            .apply(event)
            .ok_or_else(|| PoolError::IllegalTransition {
                pool_id: pool.id.clone(),
                from: pool.status,
                event,
            })?;

        // 维护中间状态记录执行者，控制器离线后据此回收
        let owner = next.is_in_flight().then_some(self.controller_id.as_str());
        if !self
            .repos
            .pools
            .compare_and_set_status(&pool.id, pool.status, next, owner)
            .await?
        {
            return Err(PoolError::StatusChanged {
                pool_id: pool.id.clone(),
            });
        }

        metrics::POOL_TRANSITIONS.with_label_values(&[next.as_str()]).inc();
        info!("存储池 {} 状态: {} -> {} ({})", pool.id, pool.status, next, event);

        let mut updated = pool.clone();
        updated.status = next;
        updated.maintenance_owner = owner.map(str::to_string);
        Ok(updated)
    }

    /// 容器池连同子池一起置为维护失败
    async fn fail_family(&self, pool_id: &str, children: &[StoragePool]) {
        let is_family = !children.is_empty();
        self.force_error(pool_id, is_family).await;
        for child in children {
            self.force_error(&child.id, true).await;
        }
    }

    /// 优先使用 OperationFailed；force 为 true 时不论当前状态都强制进入错误状态
    async fn force_error(&self, pool_id: &str, force: bool) {
        let pool = match self.repos.pools.get(pool_id).await {
            Ok(Some(pool)) => pool,
            Ok(None) => return,
            Err(e) => {
                warn!("读取存储池 {} 失败，无法标记维护错误: {}", pool_id, e);
                return;
            }
        };

        let event = if pool.status.apply(PoolEvent::OperationFailed).is_some() {
            PoolEvent::OperationFailed
        } else if force && pool.status.apply(PoolEvent::ForceError).is_some() {
            PoolEvent::ForceError
        } else {
            return;
        };

        if let Err(e) = self.transition(&pool, event).await {
            warn!("标记存储池 {} 维护错误失败: {}", pool_id, e);
        }
    }

    /// 维护操作涉及的主机（已连接且已启用）
    async fn resolve_hosts(&self, pool: &StoragePool) -> PoolResult<Vec<String>> {
        let hosts: Vec<Host> = match (pool.scope, &pool.cluster_id) {
            (PoolScope::Zone, _) | (_, None) => self
                .repos
                .hosts
                .list_by_zone(&pool.zone_id)
                .await?
                .into_iter()
                .filter(|h| pool.hypervisor.map_or(true, |hv| h.hypervisor == hv))
                .collect(),
            (_, Some(cluster_id)) => self.repos.hosts.list_by_cluster(cluster_id).await?,
        };

        Ok(hosts
            .into_iter()
            .filter(|h| h.is_connected_up())
            .map(|h| h.id)
            .collect())
    }

    async fn another_up_pool_exists(&self, pool: &StoragePool) -> PoolResult<bool> {
        let pools = self.repos.pools.list_by_zone(&pool.zone_id).await?;
        Ok(pools
            .iter()
            .any(|p| !pool.same_family(p) && p.status == PoolStatus::Up))
    }

    async fn stop_vm(&self, vm_id: &str) -> PoolResult<()> {
        self.vm_control
            .stop(vm_id)
            .await
            .map_err(|source| PoolError::VmOperation {
                vm_id: vm_id.to_string(),
                source,
            })
    }

    async fn start_vm(&self, vm_id: &str) -> PoolResult<()> {
        self.vm_control
            .start(vm_id)
            .await
            .map_err(|source| PoolError::VmOperation {
                vm_id: vm_id.to_string(),
                source,
            })
    }
}

fn heartbeat_command(pool: &StoragePool, add: bool) -> StorageCommand {
    StorageCommand::ModifyStoragePool(ModifyStoragePoolRequest {
        pool_id: pool.id.clone(),
        pool_type: pool.pool_type,
        add,
        external_id: pool.external_id.clone(),
    })
}
