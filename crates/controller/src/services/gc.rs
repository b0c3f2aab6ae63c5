/// 维护工作项回收
///
/// 删除已完成的工作项，以及虚拟机已不存在或已销毁的工作项。
/// 仍在维护流程中的存储池不处理，避免和正在执行的维护操作交错

use std::collections::HashMap;

use common::models::VmState;
use tracing::{debug, info};

use crate::errors::PoolResult;
use crate::metrics;
use crate::repository::Repositories;
use crate::services::work_queue::is_draining;

pub struct WorkItemCollector {
    repos: Repositories,
}

impl WorkItemCollector {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// 执行一轮回收，返回删除数量
    pub async fn collect(&self) -> PoolResult<usize> {
        let mut draining: HashMap<String, bool> = HashMap::new();
        let mut removed = 0;

        for item in self.repos.work_items.list_all().await? {
            let skip = match draining.get(&item.pool_id) {
                Some(skip) => *skip,
                None => {
                    let skip = self
                        .repos
                        .pools
                        .get(&item.pool_id)
                        .await?
                        .is_some_and(|p| is_draining(p.status));
                    draining.insert(item.pool_id.clone(), skip);
                    skip
                }
            };
            if skip {
                continue;
            }

            let obsolete = item.is_completed()
                || match self.repos.vms.get(&item.vm_id).await? {
                    None => true,
                    Some(vm) => matches!(vm.state, VmState::Destroyed | VmState::Expunging),
                };
            if obsolete {
                self.repos.work_items.remove(&item.id).await?;
                metrics::WORK_ITEMS_PROCESSED.with_label_values(&["collected"]).inc();
                debug!("回收工作项 {} (存储池 {}, 虚拟机 {})", item.id, item.pool_id, item.vm_id);
                removed += 1;
            }
        }

        if removed > 0 {
            info!("已回收 {} 个维护工作项", removed);
        }
        Ok(removed)
    }
}
