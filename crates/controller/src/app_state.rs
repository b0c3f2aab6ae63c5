/// 应用全局状态

use std::sync::Arc;

use crate::config::Config;
use crate::repository::Repositories;
use crate::services::{CapacityService, PoolLifecycleService};
use crate::ws::AgentConnectionManager;

#[derive(Clone)]
pub struct AppState {
    /// Agent WebSocket 连接管理器
    pub agent_manager: AgentConnectionManager,
    pub repos: Repositories,
    pub config: Arc<Config>,
    /// 存储池维护与管理操作
    pub lifecycle: Arc<PoolLifecycleService>,
    /// 容量准入检查
    pub capacity: Arc<CapacityService>,
}
