/// 存储池命令分发
///
/// 选出存储池上可用的主机，按优先级排序后逐台下发命令，遇到主机不可达或超时切换到下一台

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::models::StoragePoolType;
use common::ws_rpc::{GetStorageStatsRequest, RpcError, StorageAnswer, StorageCommand};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{PoolStats, StoragePool};
use crate::errors::{PoolError, PoolResult};
use crate::metrics;
use crate::repository::Repositories;

/// 主机传输错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("主机不可达: {0}")]
    Unavailable(String),

    #[error("主机响应超时: {0}")]
    TimedOut(String),

    #[error(transparent)]
    Failed(RpcError),
}

/// 向主机发送存储命令
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, host_id: &str, command: &StorageCommand) -> Result<StorageAnswer, TransportError>;
}

/// 存储驱动：部分存储类型可以由控制器直接查询容量
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// 驱动能否提供物理使用量
    fn reports_usage(&self) -> bool;

    /// 驱动无法回答时返回 None，由主机代为查询
    async fn stats(&self, pool: &StoragePool) -> Option<PoolStats>;
}

/// 按存储类型注册的驱动
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<StoragePoolType, Arc<dyn StorageDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pool_type: StoragePoolType, driver: Arc<dyn StorageDriver>) {
        self.drivers.insert(pool_type, driver);
    }

    pub fn get(&self, pool_type: StoragePoolType) -> Option<Arc<dyn StorageDriver>> {
        self.drivers.get(&pool_type).cloned()
    }

    /// 没有注册驱动的类型由主机上报使用量
    pub fn reports_usage(&self, pool_type: StoragePoolType) -> bool {
        self.drivers
            .get(&pool_type)
            .map(|d| d.reports_usage())
            .unwrap_or(true)
    }
}

/// 候选主机的排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOrdering {
    Random,
    AsListed,
}

/// 去掉需要避开的主机，并把优先主机稳定地移到最前
///
/// 按 preferred 倒序逐个前移，最终 preferred 的第一个排在最前
pub fn order_candidates(mut hosts: Vec<String>, preferred: &[String], avoid: &[String]) -> Vec<String> {
    hosts.retain(|h| !avoid.contains(h));
    for host_id in preferred.iter().rev() {
        if let Some(pos) = hosts.iter().position(|h| h == host_id) {
            let host = hosts.remove(pos);
            hosts.insert(0, host);
        }
    }
    hosts
}

pub struct CommandDispatcher {
    repos: Repositories,
    transport: Arc<dyn AgentTransport>,
    drivers: Arc<DriverRegistry>,
    ordering: HostOrdering,
}

impl CommandDispatcher {
    pub fn new(
        repos: Repositories,
        transport: Arc<dyn AgentTransport>,
        drivers: Arc<DriverRegistry>,
        ordering: HostOrdering,
    ) -> Self {
        Self {
            repos,
            transport,
            drivers,
            ordering,
        }
    }

    /// 挂载了该存储池、在线且已启用的主机
    pub async fn connected_up_hosts(&self, pool_id: &str) -> PoolResult<Vec<String>> {
        let mut hosts: Vec<String> = self
            .repos
            .hosts
            .list_attached_to_pool(pool_id)
            .await?
            .into_iter()
            .filter(|h| h.is_connected_up())
            .map(|h| h.id)
            .collect();

        if self.ordering == HostOrdering::Random {
            hosts.shuffle(&mut rand::thread_rng());
        }
        Ok(hosts)
    }

    /// 向单台主机发送命令
    pub async fn send_to_host(
        &self,
        host_id: &str,
        command: &StorageCommand,
    ) -> Result<StorageAnswer, TransportError> {
        self.transport.send(host_id, command).await
    }

    /// 在候选主机上依次尝试，返回成功的主机和各命令的应答
    pub async fn dispatch(
        &self,
        pool: &StoragePool,
        preferred: &[String],
        avoid: &[String],
        commands: &[StorageCommand],
    ) -> PoolResult<(String, Vec<StorageAnswer>)> {
        let hosts = self.connected_up_hosts(&pool.id).await?;
        let candidates = order_candidates(hosts, preferred, avoid);

        if candidates.is_empty() {
            warn!("存储池 {} 没有可用主机，无法下发命令", pool.id);
            return Err(PoolError::NoAvailableHost {
                pool_id: pool.id.clone(),
            });
        }

        'hosts: for host_id in &candidates {
            let mut answers = Vec::with_capacity(commands.len());
            for command in commands {
                match self.transport.send(host_id, command).await {
                    Ok(answer) => answers.push(answer),
                    Err(e @ (TransportError::Unavailable(_) | TransportError::TimedOut(_))) => {
                        warn!(
                            "存储池 {} 在主机 {} 上执行 {} 失败，尝试下一台: {}",
                            pool.id,
                            host_id,
                            command.method(),
                            e
                        );
                        metrics::DISPATCH_FAILOVERS.inc();
                        continue 'hosts;
                    }
                    Err(TransportError::Failed(e)) => return Err(PoolError::Rpc(e)),
                }
            }

            debug!("存储池 {} 的命令已由主机 {} 执行", pool.id, host_id);
            return Ok((host_id.clone(), answers));
        }

        Err(PoolError::AllHostsFailed {
            pool_id: pool.id.clone(),
            attempted: candidates.len(),
        })
    }

    /// 查询存储池容量，优先使用存储驱动
    pub async fn dispatch_stats(&self, pool: &StoragePool) -> PoolResult<PoolStats> {
        if let Some(driver) = self.drivers.get(pool.pool_type) {
            if let Some(stats) = driver.stats(pool).await {
                return Ok(stats);
            }
            debug!("存储池 {} 的驱动无法提供容量，改由主机查询", pool.id);
        }

        let command = StorageCommand::GetStorageStats(GetStorageStatsRequest {
            pool_id: pool.id.clone(),
            pool_type: pool.pool_type,
        });
        let (host_id, answers) = self.dispatch(pool, &[], &[], std::slice::from_ref(&command)).await?;

        match answers.into_iter().next() {
            Some(StorageAnswer::GetStorageStats(resp)) if resp.success => {
                info!(
                    "主机 {} 上报存储池 {} 容量: {} / {}",
                    host_id, pool.id, resp.used_bytes, resp.capacity_bytes
                );
                Ok(PoolStats {
                    capacity_bytes: resp.capacity_bytes,
                    used_bytes: resp.used_bytes,
                })
            }
            Some(answer) => Err(PoolError::Common(common::Error::Storage(format!(
                "主机 {} 查询存储池 {} 容量失败: {}",
                host_id,
                pool.id,
                answer.message()
            )))),
            None => Err(PoolError::Common(common::Error::Internal(format!(
                "主机 {} 未返回存储池 {} 的容量应答",
                host_id, pool.id
            )))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use common::ws_rpc::{GetStorageStatsResponse, ModifyStoragePoolResponse};

    /// 可编排应答的传输层
    #[derive(Default)]
    pub struct ScriptedTransport {
        /// host_id -> 依次返回的结果，用完后返回成功
        scripts: Mutex<HashMap<String, Vec<Result<StorageAnswer, TransportError>>>>,
        calls: Mutex<Vec<(String, String, bool)>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, host_id: &str, result: Result<StorageAnswer, TransportError>) {
            self.scripts
                .lock()
                .unwrap()
                .entry(host_id.to_string())
                .or_default()
                .push(result);
        }

        /// (host_id, method, add) 的调用记录
        pub fn calls(&self) -> Vec<(String, String, bool)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn hosts_called(&self) -> Vec<String> {
            self.calls().into_iter().map(|(h, _, _)| h).collect()
        }
    }

    pub fn modify_answer(success: bool, mount_rejected: bool) -> StorageAnswer {
        StorageAnswer::ModifyStoragePool(ModifyStoragePoolResponse {
            success,
            message: if success { String::new() } else { "failed".to_string() },
            mount_rejected,
            capacity_bytes: None,
            used_bytes: None,
            child_pools: Vec::new(),
        })
    }

    #[async_trait]
    impl AgentTransport for ScriptedTransport {
        async fn send(&self, host_id: &str, command: &StorageCommand) -> Result<StorageAnswer, TransportError> {
            let add = matches!(command, StorageCommand::ModifyStoragePool(req) if req.add);
            self.calls
                .lock()
                .unwrap()
                .push((host_id.to_string(), command.method().to_string(), add));

            let scripted = {
                let mut scripts = self.scripts.lock().unwrap();
                scripts
                    .get_mut(host_id)
                    .filter(|queue| !queue.is_empty())
                    .map(|queue| queue.remove(0))
            };
            if let Some(result) = scripted {
                return result;
            }

            Ok(match command {
                StorageCommand::ModifyStoragePool(_) => modify_answer(true, false),
                StorageCommand::GetStorageStats(_) => StorageAnswer::GetStorageStats(GetStorageStatsResponse {
                    success: true,
                    message: String::new(),
                    capacity_bytes: 1000,
                    used_bytes: 400,
                }),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::domain::fixtures;
    use crate::repository::memory::MemoryStore;
    use common::models::HostStatus;
    use common::ws_rpc::ModifyStoragePoolRequest;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn setup(hosts: &[&str]) -> (Arc<MemoryStore>, Arc<ScriptedTransport>, CommandDispatcher) {
        let store = Arc::new(MemoryStore::new());
        store.add_pool(fixtures::pool("p1", "z1", Some("c1")));
        for host_id in hosts {
            store.add_host(fixtures::host(host_id, "z1", Some("c1")));
            store.attach("p1", host_id);
        }
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = CommandDispatcher::new(
            Repositories::memory(store.clone()),
            transport.clone(),
            Arc::new(DriverRegistry::new()),
            HostOrdering::AsListed,
        );
        (store, transport, dispatcher)
    }

    fn remove_heartbeat() -> StorageCommand {
        StorageCommand::ModifyStoragePool(ModifyStoragePoolRequest {
            pool_id: "p1".to_string(),
            pool_type: StoragePoolType::NetworkFilesystem,
            add: false,
            external_id: None,
        })
    }

    #[test]
    fn test_preferred_hosts_move_to_front() {
        let ordered = order_candidates(ids(&["h1", "h2", "h3"]), &ids(&["h3", "h1"]), &[]);
        assert_eq!(ordered, ids(&["h3", "h1", "h2"]));
    }

    #[test]
    fn test_avoid_and_unknown_preferred() {
        let ordered = order_candidates(ids(&["h1", "h2", "h3"]), &ids(&["h9", "h2"]), &ids(&["h1"]));
        assert_eq!(ordered, ids(&["h2", "h3"]));
    }

    #[tokio::test]
    async fn test_no_candidates_never_touches_transport() {
        let (store, transport, dispatcher) = setup(&["h1"]);
        let pool = store.pool("p1");

        let err = dispatcher
            .dispatch(&pool, &[], &ids(&["h1"]), &[remove_heartbeat()])
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableHost { .. }));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_only_up_enabled_hosts_are_candidates() {
        let (store, _, dispatcher) = setup(&["h1", "h2"]);
        let mut down = fixtures::host("h2", "z1", Some("c1"));
        down.status = HostStatus::Disconnected;
        store.add_host(down);

        assert_eq!(dispatcher.connected_up_hosts("p1").await.unwrap(), ids(&["h1"]));
    }

    #[tokio::test]
    async fn test_fails_over_on_unavailable_and_timeout() {
        let (store, transport, dispatcher) = setup(&["h1", "h2", "h3"]);
        transport.script("h1", Err(TransportError::Unavailable("h1".into())));
        transport.script("h2", Err(TransportError::TimedOut("h2".into())));
        let pool = store.pool("p1");

        let (host, answers) = dispatcher.dispatch(&pool, &[], &[], &[remove_heartbeat()]).await.unwrap();
        assert_eq!(host, "h3");
        assert_eq!(answers.len(), 1);
        assert_eq!(transport.hosts_called(), ids(&["h1", "h2", "h3"]));
    }

    #[tokio::test]
    async fn test_exhausted_candidates() {
        let (store, transport, dispatcher) = setup(&["h1", "h2"]);
        transport.script("h1", Err(TransportError::Unavailable("h1".into())));
        transport.script("h2", Err(TransportError::Unavailable("h2".into())));
        let pool = store.pool("p1");

        let err = dispatcher.dispatch(&pool, &[], &[], &[remove_heartbeat()]).await.unwrap_err();
        assert!(matches!(err, PoolError::AllHostsFailed { attempted: 2, .. }));
    }

    #[tokio::test]
    async fn test_preferred_order_is_used() {
        let (store, transport, dispatcher) = setup(&["h1", "h2", "h3"]);
        transport.script("h3", Err(TransportError::Unavailable("h3".into())));
        let pool = store.pool("p1");

        let (host, _) = dispatcher
            .dispatch(&pool, &ids(&["h3", "h1"]), &[], &[remove_heartbeat()])
            .await
            .unwrap();
        assert_eq!(host, "h1");
        assert_eq!(transport.hosts_called(), ids(&["h3", "h1"]));
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_failed_over() {
        let (store, transport, dispatcher) = setup(&["h1", "h2"]);
        transport.script(
            "h1",
            Err(TransportError::Failed(RpcError::new(
                common::RpcErrorCode::StorageError,
                "bad request",
            ))),
        );
        let pool = store.pool("p1");

        let err = dispatcher.dispatch(&pool, &[], &[], &[remove_heartbeat()]).await.unwrap_err();
        assert!(matches!(err, PoolError::Rpc(_)));
        assert_eq!(transport.hosts_called(), ids(&["h1"]));
    }

    struct FixedDriver(Option<PoolStats>);

    #[async_trait]
    impl StorageDriver for FixedDriver {
        fn reports_usage(&self) -> bool {
            false
        }

        async fn stats(&self, _pool: &StoragePool) -> Option<PoolStats> {
            self.0
        }
    }

    #[tokio::test]
    async fn test_stats_prefers_driver() {
        let store = Arc::new(MemoryStore::new());
        store.add_pool(fixtures::pool("p1", "z1", Some("c1")));
        store.add_host(fixtures::host("h1", "z1", Some("c1")));
        store.attach("p1", "h1");

        let mut drivers = DriverRegistry::new();
        drivers.register(
            StoragePoolType::NetworkFilesystem,
            Arc::new(FixedDriver(Some(PoolStats {
                capacity_bytes: 5,
                used_bytes: 1,
            }))),
        );
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = CommandDispatcher::new(
            Repositories::memory(store.clone()),
            transport.clone(),
            Arc::new(drivers),
            HostOrdering::AsListed,
        );

        let stats = dispatcher.dispatch_stats(&store.pool("p1")).await.unwrap();
        assert_eq!(stats.capacity_bytes, 5);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stats_falls_back_to_host() {
        let (store, transport, dispatcher) = setup(&["h1"]);

        let stats = dispatcher.dispatch_stats(&store.pool("p1")).await.unwrap();
        assert_eq!(stats, PoolStats { capacity_bytes: 1000, used_bytes: 400 });
        assert_eq!(transport.calls()[0].1, "get_storage_stats");
    }
}
