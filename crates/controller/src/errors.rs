/// 控制器错误定义

use common::models::{PoolEvent, PoolStatus};
use common::ws_rpc::RpcError;
use thiserror::Error;

use crate::services::vm_control::VmControlError;

/// 存储池管理错误
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("存储池 {pool_id} 没有可用的主机")]
    NoAvailableHost { pool_id: String },

    #[error("存储池 {pool_id} 的命令在所有主机上均执行失败 (共尝试 {attempted} 台)")]
    AllHostsFailed { pool_id: String, attempted: usize },

    #[error("容量不足: {0}")]
    InsufficientCapacity(String),

    #[error("存储池 {pool_id} 无法进入维护: 同一作用域的存储池 {conflicting_pool_id} 正在准备维护")]
    ConcurrentMaintenanceConflict {
        pool_id: String,
        conflicting_pool_id: String,
    },

    #[error("存储池 {pool_id} 维护操作失败: {source}")]
    ErrorInMaintenance {
        pool_id: String,
        #[source]
        source: Box<PoolError>,
    },

    #[error("控制器 {0} 已被判定离线，其维护任务已被回收")]
    ControllerDeparted(String),

    #[error("存储池 {pool_id} 当前状态 {from} 不允许事件 {event}")]
    IllegalTransition {
        pool_id: String,
        from: PoolStatus,
        event: PoolEvent,
    },

    #[error("存储池 {pool_id} 的状态已被并发修改")]
    StatusChanged { pool_id: String },

    #[error("主机 {host_id} 拒绝挂载存储池 {pool_id}: {details}")]
    MountRejected {
        pool_id: String,
        host_id: String,
        details: String,
    },

    #[error("存储池 {pool_id} 在主机 {host_id} 上添加心跳失败: {details}")]
    HeartbeatFailed {
        pool_id: String,
        host_id: String,
        details: String,
    },

    #[error("虚拟机 {vm_id} 操作失败: {source}")]
    VmOperation {
        vm_id: String,
        #[source]
        source: VmControlError,
    },

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("RPC 错误: {0}")]
    Rpc(#[from] RpcError),

    #[error("数据库错误: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] common::Error),
}

impl PoolError {
    /// 包装为维护失败错误
    pub fn in_maintenance(pool_id: impl Into<String>, source: PoolError) -> Self {
        Self::ErrorInMaintenance {
            pool_id: pool_id.into(),
            source: Box::new(source),
        }
    }

    pub fn pool_not_found(pool_id: &str) -> Self {
        Self::NotFound(format!("存储池 {}", pool_id))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
