/// 控制器集群成员管理
///
/// 每个控制器定期刷新心跳；心跳超时的控制器被判定离线，
/// 其中断的维护任务由存活的控制器回收并标记为维护错误，不会自动恢复

use std::time::Duration;

use chrono::Utc;
use common::models::PoolEvent;
use tracing::{info, warn};

use crate::errors::{PoolError, PoolResult};
use crate::metrics;
use crate::repository::Repositories;
use crate::services::maintenance_lock::MaintenanceLock;
use crate::services::work_queue::WorkQueue;

pub struct MembershipService {
    repos: Repositories,
    queue: WorkQueue,
    lock: MaintenanceLock,
    controller_id: String,
    address: String,
    timeout: Duration,
}

impl MembershipService {
    pub fn new(
        repos: Repositories,
        controller_id: impl Into<String>,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let controller_id = controller_id.into();
        Self {
            queue: WorkQueue::new(repos.clone()),
            lock: MaintenanceLock::new(repos.clone(), controller_id.clone()),
            repos,
            controller_id,
            address: address.into(),
            timeout,
        }
    }

    /// 刷新本控制器的心跳
    pub async fn heartbeat(&self) -> PoolResult<()> {
        let previous = self
            .repos
            .controllers
            .heartbeat(&self.controller_id, &self.address, Utc::now())
            .await?;
        if previous.is_none() {
            info!("控制器 {} ({}) 已登记", self.controller_id, self.address);
        }
        Ok(())
    }

    /// 检查其他控制器的心跳，返回本次判定离线的控制器
    pub async fn check_peers(&self) -> PoolResult<Vec<String>> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .map_err(|e| PoolError::Config(format!("控制器超时配置无效: {}", e)))?;
        let cutoff = Utc::now() - timeout;

        let mut departed = Vec::new();
        for node in self.repos.controllers.list_stale(cutoff).await? {
            if node.id == self.controller_id {
                continue;
            }
            // 多个控制器同时检查时只有一个能完成标记
            if !self.repos.controllers.mark_down(&node.id).await? {
                continue;
            }
            warn!(
                "⚠️  控制器 {} ({}) 心跳超时，最后心跳: {}",
                node.id, node.address, node.last_heartbeat
            );
            self.on_controller_departed(&node.id).await?;
            departed.push(node.id);
        }
        Ok(departed)
    }

    /// 回收离线控制器的维护任务，返回被置为维护错误的存储池
    pub async fn on_controller_departed(&self, controller_id: &str) -> PoolResult<Vec<String>> {
        let mut affected = self.queue.reconcile_controller_departure(controller_id).await?;
        // 尚未登记工作项就中断的维护只能按执行者找回
        for pool in self.repos.pools.list_owned_in_flight(controller_id).await? {
            if !affected.contains(&pool.id) {
                affected.push(pool.id);
            }
        }

        let mut forced = Vec::new();
        for pool_id in affected {
            let Some(pool) = self.repos.pools.get(&pool_id).await? else {
                continue;
            };
            if !pool.status.is_interrupted_maintenance() {
                continue;
            }
            let Some(next) = pool.status.apply(PoolEvent::ControllerDeparted) else {
                continue;
            };

            if self
                .repos
                .pools
                .compare_and_set_status(&pool.id, pool.status, next, None)
                .await?
            {
                metrics::POOL_TRANSITIONS.with_label_values(&[next.as_str()]).inc();
                warn!(
                    "存储池 {} 的维护因控制器 {} 离线而中断: {} -> {}，需要管理员处理",
                    pool.id, controller_id, pool.status, next
                );
                forced.push(pool.id);
            } else {
                warn!("存储池 {} 状态已被并发修改，跳过", pool.id);
            }
        }

        self.lock.release_owned_by(controller_id).await?;
        Ok(forced)
    }

    /// 启动时回收本控制器上一次运行遗留的维护任务
    pub async fn reconcile_own_startup(&self) -> PoolResult<()> {
        let forced = self.on_controller_departed(&self.controller_id).await?;
        if !forced.is_empty() {
            warn!("上次运行中断的维护任务涉及存储池: {:?}", forced);
        }
        self.heartbeat().await
    }
}
