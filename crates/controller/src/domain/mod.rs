/// 领域模型
///
/// 服务层使用的强类型结构，数据库实体在 db::models 中转换为这里的类型

use chrono::{DateTime, Utc};
use common::models::{
    AllocationState, CapacityType, ControllerState, HostStatus, HypervisorType, PoolScope,
    PoolStatus, ResourceState, StoragePoolType, VmState, VmType, VolumeState, VolumeType,
};

/// 存储池
#[derive(Debug, Clone, PartialEq)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    pub scope: PoolScope,
    pub zone_id: String,
    pub cluster_id: Option<String>,
    pub host_id: Option<String>,
    /// 所属容器池
    pub parent_id: Option<String>,
    /// 主机上报的路径或 UUID，拓扑同步按它匹配子池
    pub external_id: Option<String>,
    pub status: PoolStatus,
    pub pool_type: StoragePoolType,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    /// None 表示不统计 IOPS
    pub capacity_iops: Option<u64>,
    pub hypervisor: Option<HypervisorType>,
    pub managed: bool,
    pub removal_pending: bool,
    /// 正在执行维护流程的控制器，控制器离线后据此回收
    pub maintenance_owner: Option<String>,
}

impl StoragePool {
    pub fn is_container(&self) -> bool {
        self.pool_type.is_container()
    }

    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }

    /// 维护互斥的作用域键
    ///
    /// 区域级存储池按区域互斥，其余按集群互斥（缺少集群时退回区域）
    pub fn scope_key(&self) -> String {
        match (self.scope, &self.cluster_id) {
            (PoolScope::Zone, _) | (_, None) => format!("zone:{}", self.zone_id),
            (_, Some(cluster_id)) => format!("cluster:{}", cluster_id),
        }
    }

    /// 是否与另一个存储池属于同一个容器家族（自身、父池或子池）
    pub fn same_family(&self, other: &StoragePool) -> bool {
        self.id == other.id
            || self.parent_id.as_deref() == Some(other.id.as_str())
            || other.parent_id.as_deref() == Some(self.id.as_str())
    }
}

/// 计算主机
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub zone_id: String,
    pub cluster_id: Option<String>,
    pub hypervisor: HypervisorType,
    pub status: HostStatus,
    pub resource_state: ResourceState,
}

impl Host {
    /// 已连接且管理员允许调度
    pub fn is_connected_up(&self) -> bool {
        self.status == HostStatus::Up && self.resource_state == ResourceState::Enabled
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub pool_id: String,
    pub vm_id: Option<String>,
    pub volume_type: VolumeType,
    pub state: VolumeState,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmInstance {
    pub id: String,
    pub name: String,
    pub vm_type: VmType,
    pub state: VmState,
    /// 当前（或最近一次）所在主机
    pub host_id: Option<String>,
}

/// 存储池维护工作项，每个 (存储池, 虚拟机) 至多一条
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub pool_id: String,
    pub vm_id: String,
    pub stopped_for_maintenance: bool,
    pub started_after_maintenance: bool,
    pub owner_controller_id: String,
}

impl WorkItem {
    pub fn is_completed(&self) -> bool {
        self.stopped_for_maintenance && self.started_after_maintenance
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapacityRecord {
    pub pool_id: String,
    pub capacity_type: CapacityType,
    pub allocated: u64,
    pub total: u64,
    pub state: AllocationState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerNode {
    pub id: String,
    pub address: String,
    pub state: ControllerState,
    pub last_heartbeat: DateTime<Utc>,
}

/// 存储池容量统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}
