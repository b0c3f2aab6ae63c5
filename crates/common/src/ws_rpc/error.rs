/// WebSocket RPC 错误定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// RPC 错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorCode {
    // 通用错误
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Timeout,
    ConnectionClosed,
    SerializationError,

    // 节点
    NodeNotFound,
    NodeOffline,

    // 存储
    StoragePoolNotFound,
    StorageError,

    // 虚拟机
    VmNotFound,
    VmOperationFailed,
}

impl RpcErrorCode {
    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::SerializationError => "SERIALIZATION_ERROR",

            Self::NodeNotFound => "NODE_NOT_FOUND",
            Self::NodeOffline => "NODE_OFFLINE",

            Self::StoragePoolNotFound => "STORAGE_POOL_NOT_FOUND",
            Self::StorageError => "STORAGE_ERROR",

            Self::VmNotFound => "VM_NOT_FOUND",
            Self::VmOperationFailed => "VM_OPERATION_FAILED",
        }
    }

    /// 从 Agent 返回的字符串码还原，未知的码按前缀归类
    pub fn from_code(code: &str) -> Self {
        match code {
            "INVALID_REQUEST" => Self::InvalidRequest,
            "METHOD_NOT_FOUND" => Self::MethodNotFound,
            "INVALID_PARAMS" => Self::InvalidParams,
            "TIMEOUT" => Self::Timeout,
            "CONNECTION_CLOSED" => Self::ConnectionClosed,
            "SERIALIZATION_ERROR" => Self::SerializationError,
            "NODE_NOT_FOUND" => Self::NodeNotFound,
            "NODE_OFFLINE" => Self::NodeOffline,
            "STORAGE_POOL_NOT_FOUND" => Self::StoragePoolNotFound,
            "VM_NOT_FOUND" => Self::VmNotFound,
            code if code.starts_with("VM_") => Self::VmOperationFailed,
            code if code.starts_with("STORAGE_") || code.starts_with("VOLUME_") => Self::StorageError,
            _ => Self::InternalError,
        }
    }

    /// 目标主机不可达（连接不存在、已断开或离线）
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NodeNotFound | Self::NodeOffline | Self::ConnectionClosed)
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC 错误
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl RpcError {
    /// 创建新的 RPC 错误
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// 超时错误
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    /// 连接关闭错误
    pub fn connection_closed() -> Self {
        Self::new(RpcErrorCode::ConnectionClosed, "连接已关闭")
    }

    /// 序列化错误
    pub fn serialization_error(err: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::SerializationError,
            format!("序列化错误: {}", err),
        )
    }

    /// 节点不存在
    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::new(
            RpcErrorCode::NodeNotFound,
            format!("节点不存在: {}", node_id.into()),
        )
    }

    /// 响应缺少负载
    pub fn empty_payload(method: &str) -> Self {
        Self::new(
            RpcErrorCode::InvalidParams,
            format!("响应无数据: {}", method),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.code == RpcErrorCode::Timeout
    }

    pub fn is_unavailable(&self) -> bool {
        self.code.is_unavailable()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(err)
    }
}

impl From<RpcError> for crate::Error {
    fn from(err: RpcError) -> Self {
        crate::Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [
            RpcErrorCode::Timeout,
            RpcErrorCode::NodeNotFound,
            RpcErrorCode::StoragePoolNotFound,
            RpcErrorCode::VmNotFound,
        ] {
            assert_eq!(RpcErrorCode::from_code(code.as_str()), code);
        }
    }

    #[test]
    fn test_prefix_classification() {
        assert_eq!(RpcErrorCode::from_code("VM_START_FAILED"), RpcErrorCode::VmOperationFailed);
        assert_eq!(RpcErrorCode::from_code("VOLUME_CREATE_FAILED"), RpcErrorCode::StorageError);
        assert_eq!(RpcErrorCode::from_code("SOMETHING_ELSE"), RpcErrorCode::InternalError);
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(RpcError::node_not_found("h1").is_unavailable());
        assert!(RpcError::connection_closed().is_unavailable());
        assert!(!RpcError::timeout("x").is_unavailable());
        assert!(RpcError::timeout("x").is_timeout());
    }
}
