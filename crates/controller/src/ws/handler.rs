/// WebSocket 连接处理器
///
/// 处理与 Agent 的 WebSocket 连接：注册、心跳通知和请求响应的路由

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use common::models::HostStatus;
use common::ws_rpc::{HeartbeatRequest, MessageType, RegisterRequest, RegisterResponse, RpcErrorCode, RpcMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::agent_manager::AgentConnection;
use crate::app_state::AppState;

/// 等待注册消息的时长
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket 升级处理器
pub async fn handle_agent_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_connection(socket, state))
}

/// 处理 Agent WebSocket 连接
async fn handle_agent_connection(socket: WebSocket, state: AppState) {
    info!("新的 Agent WebSocket 连接");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (request_id, register_req) = match wait_for_registration(&mut ws_receiver, &state).await {
        Ok(registration) => registration,
        Err(e) => {
            error!("Agent 注册失败: {}", e);
            let _ = ws_sender.close().await;
            return;
        }
    };

    let register_response = RegisterResponse {
        success: true,
        message: "注册成功".to_string(),
    };
    let payload = match serde_json::to_value(&register_response) {
        Ok(payload) => payload,
        Err(e) => {
            error!("序列化注册响应失败: {}", e);
            return;
        }
    };
    if let Err(e) = send_message(&mut ws_sender, RpcMessage::response(request_id, payload)).await {
        error!("发送注册响应失败: {}", e);
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();
    let node_id = register_req.node_id.clone();
    let connection = state
        .agent_manager
        .register(
            register_req.node_id,
            register_req.hostname.clone(),
            register_req.ip_address.clone(),
            tx,
        )
        .await;

    info!(
        "Agent 已连接并注册: node_id={}, hostname={}, ip={}",
        node_id, register_req.hostname, register_req.ip_address
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_message(&mut ws_sender, msg).await {
                error!("发送消息失败: {}", e);
                break;
            }
        }
        debug!("消息发送任务结束");
    });

    let recv_connection = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if let Err(e) = handle_incoming_message(msg, &recv_connection).await {
                        warn!("处理消息失败: {}", e);
                    }
                }
                Err(e) => {
                    error!("接收消息错误: {}", e);
                    break;
                }
            }
        }
        debug!("消息接收任务结束");
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    on_disconnected(&state, &connection).await;
}

/// 连接断开：注销连接并将主机标记为断开
async fn on_disconnected(state: &AppState, connection: &Arc<AgentConnection>) {
    if !state.agent_manager.unregister(connection).await {
        debug!("节点 {} 已有新的连接，保留主机状态", connection.node_id);
        return;
    }
    if let Err(e) = state
        .repos
        .hosts
        .set_status(&connection.node_id, HostStatus::Disconnected)
        .await
    {
        error!("更新主机 {} 状态失败: {}", connection.node_id, e);
    }
    info!("Agent 连接已关闭: {}", connection.node_id);
}

/// 等待注册消息，节点必须是已登记的主机
async fn wait_for_registration(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<(String, RegisterRequest), String> {
    let msg = match tokio::time::timeout(REGISTRATION_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => return Err(format!("接收注册消息错误: {}", e)),
        Ok(None) => return Err("连接已关闭".to_string()),
        Err(_) => return Err("等待注册消息超时".to_string()),
    };

    let rpc_msg = parse_websocket_message(msg).map_err(|e| format!("解析注册消息失败: {}", e))?;
    if rpc_msg.message_type != MessageType::Request || rpc_msg.method.as_deref() != Some("register") {
        return Err(format!("期望 register 请求，收到: {:?}", rpc_msg.method));
    }

    let register_req: RegisterRequest = rpc_msg
        .payload_as()
        .map_err(|e| format!("解析注册信息失败: {}", e))?;

    let host = state
        .repos
        .hosts
        .get(&register_req.node_id)
        .await
        .map_err(|e| format!("查询主机失败: {}", e))?
        .ok_or_else(|| format!("主机 {} 未登记", register_req.node_id))?;

    state
        .repos
        .hosts
        .set_status(&host.id, HostStatus::Up)
        .await
        .map_err(|e| format!("更新主机状态失败: {}", e))?;

    Ok((rpc_msg.id, register_req))
}

/// 处理收到的消息
async fn handle_incoming_message(ws_msg: AxumWsMessage, connection: &AgentConnection) -> Result<(), String> {
    let rpc_msg = parse_websocket_message(ws_msg)?;

    debug!(
        "收到消息: type={:?}, method={:?}, id={}",
        rpc_msg.message_type, rpc_msg.method, rpc_msg.id
    );

    match rpc_msg.message_type {
        MessageType::Notification => handle_notification(rpc_msg, connection).await,
        MessageType::Response => {
            connection.handle_response(rpc_msg).await;
            Ok(())
        }
        MessageType::Request => {
            let method = rpc_msg.method.unwrap_or_default();
            warn!("未知的请求方法: {}", method);
            let error_response = RpcMessage::error_response(
                rpc_msg.id,
                RpcErrorCode::MethodNotFound.as_str(),
                format!("方法不存在: {}", method),
                None,
            );
            connection
                .sender
                .send(error_response)
                .map_err(|_| "发送错误响应失败".to_string())
        }
    }
}

async fn handle_notification(msg: RpcMessage, connection: &AgentConnection) -> Result<(), String> {
    let method = msg.method.as_deref().ok_or("通知消息缺少方法名")?;

    match method {
        "heartbeat" => {
            if let Ok(heartbeat) = msg.payload_as::<HeartbeatRequest>() {
                if heartbeat.node_id != connection.node_id {
                    warn!(
                        "心跳节点不匹配: 连接={}, 消息={}",
                        connection.node_id, heartbeat.node_id
                    );
                    return Ok(());
                }
            }
            connection.update_heartbeat().await;
            debug!("收到心跳: node_id={}", connection.node_id);
        }
        _ => warn!("未知的通知方法: {}", method),
    }
    Ok(())
}

/// 解析 WebSocket 消息为 RPC 消息
fn parse_websocket_message(ws_msg: AxumWsMessage) -> Result<RpcMessage, String> {
    match ws_msg {
        AxumWsMessage::Text(text) => RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e)),
        AxumWsMessage::Binary(data) => {
            let text = String::from_utf8(data).map_err(|e| format!("二进制转字符串失败: {}", e))?;
            RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e))
        }
        AxumWsMessage::Close(_) => Err("连接关闭".to_string()),
        _ => Err("不支持的消息类型".to_string()),
    }
}

/// 发送 RPC 消息
async fn send_message(sender: &mut SplitSink<WebSocket, AxumWsMessage>, msg: RpcMessage) -> Result<(), String> {
    let json = msg.to_json().map_err(|e| format!("序列化消息失败: {}", e))?;
    sender
        .send(AxumWsMessage::Text(json))
        .await
        .map_err(|e| format!("发送 WebSocket 消息失败: {}", e))
}
