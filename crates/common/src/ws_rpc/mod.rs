/// WebSocket RPC 模块
/// 
/// 控制器与 Agent 之间基于 WebSocket 的 RPC 消息、错误码和命令定义

pub mod message;
pub mod error;
pub mod types;

pub use message::{RpcMessage, MessageType};
pub use error::{RpcError, RpcErrorCode};
pub use types::*;
