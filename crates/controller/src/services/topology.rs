/// 容器存储池拓扑同步
///
/// 主机在挂载容器池时会上报其当前包含的子存储池，据此调整数据库中的父子关系

use std::collections::HashSet;

use common::utils::generate_id;
use common::ws_rpc::ChildPoolInfo;
use tracing::{info, warn};

use crate::domain::StoragePool;
use crate::errors::{PoolError, PoolResult};
use crate::repository::Repositories;

/// 同步结果（存储池 ID）
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TopologySyncReport {
    pub added: Vec<String>,
    pub relocated: Vec<String>,
    pub flagged_for_removal: Vec<String>,
    pub restored: Vec<String>,
}

impl TopologySyncReport {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty()
            && self.relocated.is_empty()
            && self.flagged_for_removal.is_empty()
            && self.restored.is_empty()
    }
}

pub struct TopologySync {
    repos: Repositories,
}

impl TopologySync {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    pub async fn sync_container_topology(
        &self,
        container_id: &str,
        reported: &[ChildPoolInfo],
    ) -> PoolResult<TopologySyncReport> {
        let container = self
            .repos
            .pools
            .get(container_id)
            .await?
            .ok_or_else(|| PoolError::pool_not_found(container_id))?;

        if !container.is_container() {
            return Err(PoolError::InvalidArgument(format!(
                "存储池 {} 不是容器存储池",
                container_id
            )));
        }

        let mut report = TopologySyncReport::default();

        for child in reported {
            match self
                .repos
                .pools
                .find_by_external_id(&container.zone_id, &child.external_id)
                .await?
            {
                None => {
                    let pool = new_child(&container, child);
                    self.repos.pools.insert(&pool).await?;
                    info!(
                        "容器存储池 {} 发现新的子存储池 {} ({})",
                        container.id, pool.id, child.external_id
                    );
                    report.added.push(pool.id);
                }
                Some(existing) => {
                    if existing.parent_id.as_deref() != Some(container.id.as_str()) {
                        self.repos.pools.set_parent(&existing.id, Some(&container.id)).await?;
                        info!(
                            "子存储池 {} 从 {:?} 移入容器存储池 {}",
                            existing.id, existing.parent_id, container.id
                        );
                        report.relocated.push(existing.id.clone());
                    }
                    if existing.removal_pending {
                        self.repos.pools.set_removal_pending(&existing.id, false).await?;
                        report.restored.push(existing.id);
                    }
                }
            }
        }

        let reported_ids: HashSet<&str> = reported.iter().map(|c| c.external_id.as_str()).collect();
        for child in self.repos.pools.list_children(&container.id).await? {
            let still_present = child
                .external_id
                .as_deref()
                .is_some_and(|id| reported_ids.contains(id));
            if !still_present && !child.removal_pending {
                self.repos.pools.set_removal_pending(&child.id, true).await?;
                warn!("子存储池 {} 已不在容器存储池 {} 中，标记待删除", child.id, container.id);
                report.flagged_for_removal.push(child.id);
            }
        }

        Ok(report)
    }
}

/// 新发现的子存储池继承容器池的作用域、位置和状态
fn new_child(container: &StoragePool, child: &ChildPoolInfo) -> StoragePool {
    StoragePool {
        id: generate_id(),
        name: child.name.clone(),
        scope: container.scope,
        zone_id: container.zone_id.clone(),
        cluster_id: container.cluster_id.clone(),
        host_id: container.host_id.clone(),
        parent_id: Some(container.id.clone()),
        external_id: Some(child.external_id.clone()),
        status: container.status,
        pool_type: child.pool_type,
        capacity_bytes: child.capacity_bytes,
        used_bytes: child.used_bytes,
        capacity_iops: None,
        hypervisor: container.hypervisor,
        managed: container.managed,
        removal_pending: false,
        maintenance_owner: container.maintenance_owner.clone(),
    }
}
