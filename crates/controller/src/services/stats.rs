/// 存储池容量统计刷新

use std::sync::Arc;

use common::models::PoolStatus;
use tracing::{debug, warn};

use crate::domain::StoragePool;
use crate::errors::PoolResult;
use crate::repository::Repositories;
use crate::services::capacity::CapacityService;
use crate::services::dispatcher::CommandDispatcher;

pub struct StatsRefresher {
    repos: Repositories,
    dispatcher: Arc<CommandDispatcher>,
    capacity: Arc<CapacityService>,
}

impl StatsRefresher {
    pub fn new(repos: Repositories, dispatcher: Arc<CommandDispatcher>, capacity: Arc<CapacityService>) -> Self {
        Self {
            repos,
            dispatcher,
            capacity,
        }
    }

    /// 刷新所有可用存储池，单个存储池失败不影响其他，返回成功数量
    pub async fn refresh_all(&self) -> PoolResult<usize> {
        let pools = self.repos.pools.list_by_status(PoolStatus::Up).await?;
        let total = pools.len();

        let mut refreshed = 0;
        for pool in pools {
            match self.refresh(pool).await {
                Ok(()) => refreshed += 1,
                Err(e) => warn!("刷新存储池容量失败: {}", e),
            }
        }

        debug!("存储池容量刷新完成: {}/{}", refreshed, total);
        Ok(refreshed)
    }

    async fn refresh(&self, mut pool: StoragePool) -> PoolResult<()> {
        let stats = self.dispatcher.dispatch_stats(&pool).await?;
        self.repos
            .pools
            .update_usage(&pool.id, stats.capacity_bytes, stats.used_bytes)
            .await?;

        pool.capacity_bytes = stats.capacity_bytes;
        pool.used_bytes = stats.used_bytes;
        self.capacity.recompute(&pool).await
    }
}
