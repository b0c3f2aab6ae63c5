/// 存储池控制器公共库
///
/// 提供控制器与 Agent 共享的存储池模型、RPC 消息、错误类型和工具函数

pub mod errors;
pub mod models;
pub mod utils;
pub mod ws_rpc;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use ws_rpc::{RpcMessage, RpcError, RpcErrorCode, MessageType};
