/// 存储池控制器
///
/// 管理共享存储池的维护生命周期、容量准入以及向主机下发存储命令

pub mod app_state;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod metrics;
pub mod repository;
pub mod services;
pub mod ws;

pub use app_state::AppState;
pub use config::Config;
pub use errors::{PoolError, PoolResult};
