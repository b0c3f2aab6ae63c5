/// 存储池控制器
///
/// 提供 Agent 接入、后台维护任务和指标导出

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use controller::config::Config;
use controller::db::{apply_schema, establish_connection};
use controller::metrics::metrics_handler;
use controller::repository::Repositories;
use controller::services::{
    AgentVmControl, CapacityService, CommandDispatcher, DriverRegistry, HostOrdering, MembershipService,
    PeriodicScheduler, PoolLifecycleService, StatsRefresher, WorkItemCollector,
};
use controller::ws::{self, AgentConnectionManager};
use controller::AppState;
use common::models::HostStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    info!("🚀 启动存储池控制器...");

    dotenvy::dotenv().ok();

    let cfg = Arc::new(Config::load()?);
    info!("✅ 配置加载成功: controller_id={}", cfg.controller_id);

    let db = establish_connection(&cfg.database_url)
        .await
        .context("SeaORM 数据库连接失败")?;
    apply_schema(&db).await.context("初始化数据库表结构失败")?;
    let repos = Repositories::sea(db);
    info!("✅ 数据库初始化完成");

    let agent_manager = AgentConnectionManager::with_timeout(cfg.agent_timeout());
    let drivers = Arc::new(DriverRegistry::new());
    let dispatcher = Arc::new(CommandDispatcher::new(
        repos.clone(),
        Arc::new(agent_manager.clone()),
        drivers.clone(),
        HostOrdering::Random,
    ));
    let capacity = Arc::new(CapacityService::new(repos.clone(), cfg.capacity.clone(), drivers));
    let vm_control = Arc::new(AgentVmControl::new(
        agent_manager.clone(),
        repos.clone(),
        cfg.agent_timeout(),
    ));
    let lifecycle = Arc::new(PoolLifecycleService::new(
        repos.clone(),
        dispatcher.clone(),
        vm_control,
        cfg.controller_id.clone(),
        cfg.heartbeat_add_attempts,
    ));
    let membership = Arc::new(MembershipService::new(
        repos.clone(),
        cfg.controller_id.clone(),
        cfg.controller_address.clone(),
        Duration::from_secs(cfg.scheduler.controller_timeout_secs),
    ));

    // 上一次运行中断的维护不会自动恢复
    membership
        .reconcile_own_startup()
        .await
        .context("回收遗留维护任务失败")?;
    info!("✅ 控制器 {} 已加入集群", cfg.controller_id);

    let scheduler = start_background_tasks(&cfg, &repos, &agent_manager, &dispatcher, &capacity, &membership);
    info!("✅ 已启动 {} 个后台任务", scheduler.len());

    let app_state = AppState {
        agent_manager,
        repos,
        config: cfg.clone(),
        lifecycle,
        capacity,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/agent", get(ws::handle_agent_websocket))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    info!("👋 控制器已退出");
    Ok(())
}

fn start_background_tasks(
    cfg: &Config,
    repos: &Repositories,
    agent_manager: &AgentConnectionManager,
    dispatcher: &Arc<CommandDispatcher>,
    capacity: &Arc<CapacityService>,
    membership: &Arc<MembershipService>,
) -> PeriodicScheduler {
    let mut scheduler = PeriodicScheduler::new();
    let sched = &cfg.scheduler;

    let collector = Arc::new(WorkItemCollector::new(repos.clone()));
    let gc_period = Duration::from_secs(sched.work_gc_interval_secs);
    scheduler.spawn("work-item-gc", gc_period, gc_period, move || {
        let collector = collector.clone();
        async move {
            if let Err(e) = collector.collect().await {
                error!("回收维护工作项失败: {}", e);
            }
        }
    });

    let refresher = Arc::new(StatsRefresher::new(repos.clone(), dispatcher.clone(), capacity.clone()));
    let stats_period = Duration::from_secs(sched.stats_interval_secs);
    scheduler.spawn("storage-stats", stats_period, stats_period, move || {
        let refresher = refresher.clone();
        async move {
            if let Err(e) = refresher.refresh_all().await {
                error!("刷新存储池容量失败: {}", e);
            }
        }
    });

    let watcher = membership.clone();
    let membership_period = Duration::from_secs(sched.membership_interval_secs);
    scheduler.spawn("controller-membership", membership_period, membership_period, move || {
        let watcher = watcher.clone();
        async move {
            if let Err(e) = watcher.heartbeat().await {
                error!("刷新控制器心跳失败: {}", e);
            }
            match watcher.check_peers().await {
                Ok(departed) if !departed.is_empty() => warn!("控制器离线: {:?}", departed),
                Ok(_) => {}
                Err(e) => error!("检查控制器心跳失败: {}", e),
            }
        }
    });

    // Agent 心跳超时后断开连接，并将主机标记为断开
    let agents = agent_manager.clone();
    let host_repos = repos.clone();
    let agent_timeout_secs = cfg.agent_timeout_secs * 3;
    let agent_check_period = Duration::from_secs(cfg.agent_timeout_secs.max(1));
    scheduler.spawn("agent-heartbeat", agent_check_period, Duration::ZERO, move || {
        let agents = agents.clone();
        let host_repos = host_repos.clone();
        async move {
            for host_id in agents.cleanup_timeout_connections(agent_timeout_secs).await {
                if let Err(e) = host_repos.hosts.set_status(&host_id, HostStatus::Disconnected).await {
                    error!("更新主机 {} 状态失败: {}", host_id, e);
                }
            }
        }
    });

    scheduler
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到退出信号，正在关闭...");
}

async fn health_handler(State(state): State<AppState>) -> String {
    format!("OK {}", state.config.controller_id)
}
