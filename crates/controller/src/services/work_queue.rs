/// 存储池维护工作队列
///
/// 记录每台虚拟机在维护中的停止 / 重启进度，控制器重启后仍可继续

use common::models::PoolStatus;
use tracing::{info, warn};

use crate::domain::WorkItem;
use crate::errors::{PoolError, PoolResult};
use crate::metrics;
use crate::repository::Repositories;

pub struct WorkQueue {
    repos: Repositories,
}

impl WorkQueue {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// 入队，已存在时重置进度并转给新的控制器
    pub async fn enqueue(&self, pool_id: &str, vm_id: &str, owner: &str) -> PoolResult<WorkItem> {
        let item = self.repos.work_items.upsert(pool_id, vm_id, owner).await?;
        metrics::WORK_ITEMS_PROCESSED.with_label_values(&["enqueued"]).inc();
        Ok(item)
    }

    /// 尚未停止的虚拟机
    pub async fn list_pending_for_maintenance(&self, pool_id: &str) -> PoolResult<Vec<WorkItem>> {
        let items = self.repos.work_items.list_by_pool(pool_id).await?;
        Ok(items.into_iter().filter(|w| !w.stopped_for_maintenance).collect())
    }

    /// 已停止但尚未重启的虚拟机
    pub async fn list_pending_for_cancel_maintenance(&self, pool_id: &str) -> PoolResult<Vec<WorkItem>> {
        let items = self.repos.work_items.list_by_pool(pool_id).await?;
        Ok(items
            .into_iter()
            .filter(|w| w.stopped_for_maintenance && !w.started_after_maintenance)
            .collect())
    }

    pub async fn mark_stopped(&self, item: &mut WorkItem) -> PoolResult<()> {
        self.update(item, true, item.started_after_maintenance).await?;
        metrics::WORK_ITEMS_PROCESSED.with_label_values(&["stopped"]).inc();
        Ok(())
    }

    pub async fn mark_restarted(&self, item: &mut WorkItem) -> PoolResult<()> {
        self.update(item, item.stopped_for_maintenance, true).await?;
        metrics::WORK_ITEMS_PROCESSED.with_label_values(&["restarted"]).inc();
        Ok(())
    }

    pub async fn remove(&self, item: &WorkItem) -> PoolResult<()> {
        self.repos.work_items.remove(&item.id).await?;
        metrics::WORK_ITEMS_PROCESSED.with_label_values(&["removed"]).inc();
        Ok(())
    }

    /// 工作项已被其他控制器回收（本控制器被判定离线）时返回 ControllerDeparted
    async fn update(&self, item: &mut WorkItem, stopped: bool, started: bool) -> PoolResult<()> {
        if !self.repos.work_items.update_flags(&item.id, stopped, started).await? {
            warn!(
                "工作项 {} (存储池 {}, 虚拟机 {}) 已不存在",
                item.id, item.pool_id, item.vm_id
            );
            return Err(PoolError::ControllerDeparted(item.owner_controller_id.clone()));
        }
        item.stopped_for_maintenance = stopped;
        item.started_after_maintenance = started;
        Ok(())
    }

    /// 回收离线控制器在中断维护的存储池上未完成的工作，返回受影响的存储池
    pub async fn reconcile_controller_departure(&self, controller_id: &str) -> PoolResult<Vec<String>> {
        let mut affected = Vec::new();

        for pool_id in self.repos.work_items.pool_ids_with_pending_for_owner(controller_id).await? {
            let Some(pool) = self.repos.pools.get(&pool_id).await? else {
                continue;
            };
            if !pool.status.is_interrupted_maintenance() {
                continue;
            }

            let removed = self.repos.work_items.remove_pending(controller_id, &pool_id).await?;
            info!(
                "已回收控制器 {} 在存储池 {} ({}) 上的 {} 个未完成工作项",
                controller_id, pool_id, pool.status, removed
            );
            affected.push(pool_id);
        }

        Ok(affected)
    }
}

/// 维护流程中仍可能留有工作项的状态
pub fn is_draining(status: PoolStatus) -> bool {
    matches!(
        status,
        PoolStatus::PrepareForMaintenance | PoolStatus::Maintenance | PoolStatus::CancelMaintenance
    )
}
