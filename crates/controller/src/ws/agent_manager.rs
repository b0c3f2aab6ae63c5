/// Agent 连接管理器
///
/// 负责管理所有 Agent 的 WebSocket 连接，并作为存储命令的传输层

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::models::constants::DEFAULT_AGENT_TIMEOUT;
use common::ws_rpc::{RpcError, RpcErrorCode, RpcMessage, StorageAnswer, StorageCommand};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::services::dispatcher::{AgentTransport, TransportError};

/// 等待响应的请求信息
type PendingRequest = oneshot::Sender<Result<RpcMessage, RpcError>>;

/// Agent 连接信息
pub struct AgentConnection {
    /// 节点 ID（即主机 ID）
    pub node_id: String,

    pub hostname: String,

    pub ip_address: String,

    /// 发送消息的通道
    pub sender: mpsc::UnboundedSender<RpcMessage>,

    /// 最后心跳时间
    last_heartbeat: RwLock<Instant>,

    /// 等待响应的请求 Map: request_id -> response_sender
    pending_requests: RwLock<HashMap<String, PendingRequest>>,
}

impl AgentConnection {
    /// 发送 RPC 请求并等待响应
    pub async fn call(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let method = method.into();
        let msg = RpcMessage::request(&method, payload);
        let request_id = msg.id.clone();

        info!(
            "📤 [Controller -> Agent] 发送请求: node={}, method={}, id={}",
            self.node_id, method, request_id
        );

        let (tx, rx) = oneshot::channel();
        self.pending_requests.write().await.insert(request_id.clone(), tx);

        if self.sender.send(msg).is_err() {
            self.pending_requests.write().await.remove(&request_id);
            return Err(RpcError::connection_closed());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // 连接断开时等待者会被丢弃
            Ok(Err(_)) => Err(RpcError::connection_closed()),
            Err(_) => {
                self.pending_requests.write().await.remove(&request_id);
                Err(RpcError::timeout(format!("请求超时: {} ({})", method, request_id)))
            }
        }
    }

    /// 处理收到的响应消息（由 WebSocket handler 调用）
    pub async fn handle_response(&self, response: RpcMessage) {
        let request_id = response.id.clone();

        let Some(sender) = self.pending_requests.write().await.remove(&request_id) else {
            debug!("收到未预期的响应: {}", request_id);
            return;
        };

        let result = match response.error {
            Some(info) => {
                warn!(
                    "📥 [Agent -> Controller] 收到错误响应: node={}, id={}, code={}, message={}",
                    self.node_id, request_id, info.code, info.message
                );
                Err(RpcError {
                    code: RpcErrorCode::from_code(&info.code),
                    message: info.message,
                    details: info.details,
                })
            }
            None => {
                debug!("📥 [Agent -> Controller] 收到响应: node={}, id={}", self.node_id, request_id);
                Ok(response)
            }
        };

        if sender.send(result).is_err() {
            warn!("无法发送响应，等待者已关闭: {}", request_id);
        }
    }

    /// 更新最后心跳时间
    pub async fn update_heartbeat(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    /// 距离上次心跳的时间（秒）
    pub async fn heartbeat_elapsed(&self) -> u64 {
        self.last_heartbeat.read().await.elapsed().as_secs()
    }
}

/// Agent 连接管理器
#[derive(Clone)]
pub struct AgentConnectionManager {
    /// 所有连接的映射：node_id -> AgentConnection
    connections: Arc<RwLock<HashMap<String, Arc<AgentConnection>>>>,
    /// 存储命令的等待时长
    timeout: Duration,
}

impl AgentConnectionManager {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_AGENT_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            timeout,
        }
    }

    /// 注册新的 Agent 连接，同一节点的旧连接被替换
    pub async fn register(
        &self,
        node_id: String,
        hostname: String,
        ip_address: String,
        sender: mpsc::UnboundedSender<RpcMessage>,
    ) -> Arc<AgentConnection> {
        let connection = Arc::new(AgentConnection {
            node_id: node_id.clone(),
            hostname,
            ip_address,
            sender,
            last_heartbeat: RwLock::new(Instant::now()),
            pending_requests: RwLock::new(HashMap::new()),
        });

        self.connections
            .write()
            .await
            .insert(node_id.clone(), connection.clone());

        info!("Agent 已注册: {}", node_id);
        connection
    }

    /// 注销 Agent 连接
    ///
    /// 只有当前登记的仍是这条连接时才移除，避免重连后误删新连接
    pub async fn unregister(&self, connection: &Arc<AgentConnection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&connection.node_id) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                connections.remove(&connection.node_id);
                info!("Agent 已注销: {}", connection.node_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections.read().await.get(node_id).cloned()
    }

    pub async fn is_online(&self, node_id: &str) -> bool {
        self.connections.read().await.contains_key(node_id)
    }

    /// 清理心跳超时的连接，返回被清理的节点 ID
    pub async fn cleanup_timeout_connections(&self, timeout_secs: u64) -> Vec<String> {
        let mut expired = Vec::new();
        {
            let connections = self.connections.read().await;
            for (node_id, conn) in connections.iter() {
                let elapsed = conn.heartbeat_elapsed().await;
                if elapsed > timeout_secs {
                    warn!("节点心跳超时: {} ({}秒)", node_id, elapsed);
                    expired.push(node_id.clone());
                }
            }
        }

        if !expired.is_empty() {
            let mut connections = self.connections.write().await;
            for node_id in &expired {
                connections.remove(node_id);
                info!("已清理超时节点: {}", node_id);
            }
        }

        expired
    }

    /// 向指定节点发送 RPC 请求
    pub async fn call(
        &self,
        node_id: &str,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let connection = self
            .get(node_id)
            .await
            .ok_or_else(|| RpcError::node_not_found(node_id))?;

        connection.call(method, payload, timeout).await
    }
}

impl Default for AgentConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC 错误按是否可以切换主机分类
fn classify(err: RpcError) -> TransportError {
    if err.is_unavailable() {
        TransportError::Unavailable(err.message)
    } else if err.is_timeout() {
        TransportError::TimedOut(err.message)
    } else {
        TransportError::Failed(err)
    }
}

#[async_trait]
impl AgentTransport for AgentConnectionManager {
    async fn send(&self, host_id: &str, command: &StorageCommand) -> Result<StorageAnswer, TransportError> {
        let payload = command
            .to_payload()
            .map_err(|e| TransportError::Failed(RpcError::serialization_error(e)))?;

        match self.call(host_id, command.method(), payload, self.timeout).await {
            Ok(response) => {
                let payload = response
                    .payload
                    .ok_or_else(|| TransportError::Failed(RpcError::empty_payload(command.method())))?;
                command
                    .decode_answer(payload)
                    .map_err(|e| TransportError::Failed(RpcError::serialization_error(e)))
            }
            // Agent 执行失败时可能在 details 中带回完整应答（例如挂载被拒绝）
            Err(err) => match err.details.clone().map(|d| command.decode_answer(d)) {
                Some(Ok(answer)) => Ok(answer),
                _ => Err(classify(err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::StoragePoolType;
    use common::ws_rpc::{ModifyStoragePoolRequest, ModifyStoragePoolResponse};

    fn command() -> StorageCommand {
        StorageCommand::ModifyStoragePool(ModifyStoragePoolRequest {
            pool_id: "p1".to_string(),
            pool_type: StoragePoolType::NetworkFilesystem,
            add: true,
            external_id: None,
        })
    }

    fn response_payload(success: bool, mount_rejected: bool) -> serde_json::Value {
        serde_json::to_value(ModifyStoragePoolResponse {
            success,
            message: String::new(),
            mount_rejected,
            capacity_bytes: Some(10),
            used_bytes: Some(1),
            child_pools: Vec::new(),
        })
        .unwrap()
    }

    /// 注册一个 Agent，并用 reply 生成每个请求的应答
    async fn fake_agent<F>(manager: &AgentConnectionManager, node_id: &str, reply: F) -> Arc<AgentConnection>
    where
        F: Fn(RpcMessage) -> RpcMessage + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = manager
            .register(node_id.to_string(), "host".to_string(), "10.0.0.1".to_string(), tx)
            .await;
        let responder = connection.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                responder.handle_response(reply(request)).await;
            }
        });
        connection
    }

    #[tokio::test]
    async fn test_send_decodes_answer() {
        let manager = AgentConnectionManager::with_timeout(Duration::from_secs(5));
        fake_agent(&manager, "h1", |req| {
            assert_eq!(req.method.as_deref(), Some("modify_storage_pool"));
            RpcMessage::response(req.id, response_payload(true, false))
        })
        .await;

        let answer = manager.send("h1", &command()).await.unwrap();
        assert!(answer.is_success());
    }

    #[tokio::test]
    async fn test_error_response_with_answer_details() {
        let manager = AgentConnectionManager::with_timeout(Duration::from_secs(5));
        fake_agent(&manager, "h1", |req| {
            RpcMessage::error_response(req.id, "STORAGE_ERROR", "mount failed", Some(response_payload(false, true)))
        })
        .await;

        match manager.send("h1", &command()).await.unwrap() {
            StorageAnswer::ModifyStoragePool(resp) => assert!(resp.mount_rejected),
            other => panic!("unexpected answer: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_classification() {
        let manager = AgentConnectionManager::with_timeout(Duration::from_millis(50));

        let err = manager.send("missing", &command()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));

        fake_agent(&manager, "h1", |req| RpcMessage::error_response(req.id, "STORAGE_ERROR", "bad", None)).await;
        let err = manager.send("h1", &command()).await.unwrap_err();
        assert!(matches!(err, TransportError::Failed(ref e) if e.code == RpcErrorCode::StorageError));

        // 不回复的 Agent
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .register("h2".to_string(), "host".to_string(), "10.0.0.2".to_string(), tx)
            .await;
        let err = manager.send("h2", &command()).await.unwrap_err();
        assert!(matches!(err, TransportError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_unregister_keeps_newer_connection() {
        let manager = AgentConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let old = manager
            .register("h1".to_string(), "host".to_string(), "10.0.0.1".to_string(), tx1)
            .await;
        let new = manager
            .register("h1".to_string(), "host".to_string(), "10.0.0.1".to_string(), tx2)
            .await;

        assert!(!manager.unregister(&old).await);
        assert!(manager.is_online("h1").await);
        assert!(manager.unregister(&new).await);
        assert!(!manager.is_online("h1").await);
    }
}
