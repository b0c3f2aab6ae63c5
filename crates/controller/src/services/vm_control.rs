/// 虚拟机启停
///
/// 维护流程只需要停止和启动两个动作，通过 Agent 在虚拟机所在主机上执行

use std::time::Duration;

use async_trait::async_trait;
use common::models::VmState;
use common::ws_rpc::{RpcError, VmOperationRequest, VmOperationResponse};
use thiserror::Error;
use tracing::{info, warn};

use crate::repository::Repositories;
use crate::ws::AgentConnectionManager;

#[derive(Error, Debug, Clone)]
pub enum VmControlError {
    #[error("资源不可用: {0}")]
    ResourceUnavailable(String),

    #[error("操作超时: {0}")]
    TimedOut(String),

    #[error("容量不足: {0}")]
    InsufficientCapacity(String),
}

impl From<RpcError> for VmControlError {
    fn from(err: RpcError) -> Self {
        if err.is_timeout() {
            Self::TimedOut(err.message)
        } else {
            Self::ResourceUnavailable(err.to_string())
        }
    }
}

#[async_trait]
pub trait VmControl: Send + Sync {
    async fn stop(&self, vm_id: &str) -> Result<(), VmControlError>;

    async fn start(&self, vm_id: &str) -> Result<(), VmControlError>;
}

/// 通过 Agent 执行虚拟机启停
pub struct AgentVmControl {
    agents: AgentConnectionManager,
    repos: Repositories,
    timeout: Duration,
}

#[derive(Clone, Copy)]
enum VmAction {
    Stop,
    Start,
}

impl VmAction {
    fn method(self) -> &'static str {
        match self {
            Self::Stop => "stop_vm",
            Self::Start => "start_vm",
        }
    }

    fn transitional(self) -> VmState {
        match self {
            Self::Stop => VmState::Stopping,
            Self::Start => VmState::Starting,
        }
    }

    fn target(self) -> VmState {
        match self {
            Self::Stop => VmState::Stopped,
            Self::Start => VmState::Running,
        }
    }
}

impl AgentVmControl {
    pub fn new(agents: AgentConnectionManager, repos: Repositories, timeout: Duration) -> Self {
        Self {
            agents,
            repos,
            timeout,
        }
    }

    async fn run(&self, vm_id: &str, action: VmAction) -> Result<(), VmControlError> {
        let vm = self
            .repos
            .vms
            .get(vm_id)
            .await
            .map_err(|e| VmControlError::ResourceUnavailable(e.to_string()))?
            .ok_or_else(|| VmControlError::ResourceUnavailable(format!("虚拟机 {} 不存在", vm_id)))?;

        if vm.state == action.target() {
            info!("虚拟机 {} 已处于 {} 状态，跳过 {}", vm_id, vm.state, action.method());
            return Ok(());
        }

        let host_id = vm
            .host_id
            .ok_or_else(|| VmControlError::ResourceUnavailable(format!("虚拟机 {} 没有所在主机", vm_id)))?;

        let payload = serde_json::to_value(VmOperationRequest {
            vm_id: vm_id.to_string(),
            force: false,
        })
        .map_err(|e| VmControlError::ResourceUnavailable(e.to_string()))?;

        self.record_state(vm_id, action.transitional()).await;

        let result = self.call(&host_id, vm_id, action, payload).await;
        match &result {
            Ok(()) => self.record_state(vm_id, action.target()).await,
            Err(_) => self.record_state(vm_id, vm.state).await,
        }
        result
    }

    async fn call(
        &self,
        host_id: &str,
        vm_id: &str,
        action: VmAction,
        payload: serde_json::Value,
    ) -> Result<(), VmControlError> {
        let response = self
            .agents
            .call(host_id, action.method(), payload, self.timeout)
            .await?;
        let resp: VmOperationResponse = response.payload_as()?;

        if resp.success {
            info!("虚拟机 {} 已在主机 {} 上完成 {}", vm_id, host_id, action.method());
            Ok(())
        } else if resp.insufficient_capacity {
            Err(VmControlError::InsufficientCapacity(resp.message))
        } else {
            Err(VmControlError::ResourceUnavailable(resp.message))
        }
    }

    async fn record_state(&self, vm_id: &str, state: VmState) {
        if let Err(e) = self.repos.vms.update_state(vm_id, state).await {
            warn!("更新虚拟机 {} 状态为 {} 失败: {}", vm_id, state, e);
        }
    }
}

#[async_trait]
impl VmControl for AgentVmControl {
    async fn stop(&self, vm_id: &str) -> Result<(), VmControlError> {
        self.run(vm_id, VmAction::Stop).await
    }

    async fn start(&self, vm_id: &str) -> Result<(), VmControlError> {
        self.run(vm_id, VmAction::Start).await
    }
}
