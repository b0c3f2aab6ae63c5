/// WebSocket RPC 数据类型定义
///
/// 控制器下发给 Agent 的存储池命令，以及按命令类型区分的应答

use serde::{Deserialize, Serialize};

use crate::models::StoragePoolType;

// ============================================================================
// Agent 注册与心跳
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub timestamp: i64,
}

// ============================================================================
// 存储池心跳（挂载 / 卸载）
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyStoragePoolRequest {
    pub pool_id: String,
    pub pool_type: StoragePoolType,
    /// true 为添加心跳（挂载），false 为移除心跳
    pub add: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// 容器池下由主机上报的子存储池
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildPoolInfo {
    pub external_id: String,
    pub name: String,
    pub pool_type: StoragePoolType,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyStoragePoolResponse {
    pub success: bool,
    pub message: String,
    /// 主机明确拒绝挂载（区别于超时或无应答）
    #[serde(default)]
    pub mount_rejected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_bytes: Option<u64>,
    #[serde(default)]
    pub child_pools: Vec<ChildPoolInfo>,
}

// ============================================================================
// 存储池统计
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStorageStatsRequest {
    pub pool_id: String,
    pub pool_type: StoragePoolType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStorageStatsResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
}

// ============================================================================
// 虚拟机启停
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmOperationRequest {
    pub vm_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmOperationResponse {
    pub success: bool,
    pub message: String,
    /// 失败原因是资源（容量）不足
    #[serde(default)]
    pub insufficient_capacity: bool,
}

// ============================================================================
// 存储池命令 / 应答
// ============================================================================

/// 以存储池为作用域下发到主机的命令
#[derive(Debug, Clone)]
pub enum StorageCommand {
    ModifyStoragePool(ModifyStoragePoolRequest),
    GetStorageStats(GetStorageStatsRequest),
}

/// 与命令一一对应的应答
#[derive(Debug, Clone)]
pub enum StorageAnswer {
    ModifyStoragePool(ModifyStoragePoolResponse),
    GetStorageStats(GetStorageStatsResponse),
}

impl StorageCommand {
    /// 对应的 RPC 方法名
    pub fn method(&self) -> &'static str {
        match self {
            Self::ModifyStoragePool(_) => "modify_storage_pool",
            Self::GetStorageStats(_) => "get_storage_stats",
        }
    }

    pub fn pool_id(&self) -> &str {
        match self {
            Self::ModifyStoragePool(req) => &req.pool_id,
            Self::GetStorageStats(req) => &req.pool_id,
        }
    }

    /// 序列化为 RPC 负载
    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::ModifyStoragePool(req) => serde_json::to_value(req),
            Self::GetStorageStats(req) => serde_json::to_value(req),
        }
    }

    /// 按命令类型解析应答
    pub fn decode_answer(&self, payload: serde_json::Value) -> Result<StorageAnswer, serde_json::Error> {
        Ok(match self {
            Self::ModifyStoragePool(_) => StorageAnswer::ModifyStoragePool(serde_json::from_value(payload)?),
            Self::GetStorageStats(_) => StorageAnswer::GetStorageStats(serde_json::from_value(payload)?),
        })
    }
}

impl StorageAnswer {
    pub fn is_success(&self) -> bool {
        match self {
            Self::ModifyStoragePool(resp) => resp.success,
            Self::GetStorageStats(resp) => resp.success,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ModifyStoragePool(resp) => &resp.message,
            Self::GetStorageStats(resp) => &resp.message,
        }
    }
}
