/// 数据库访问层

pub mod models;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection};
use tracing::info;

const SCHEMA: &str = include_str!("../../migrations/001_storage_pool_maintenance.sql");

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, anyhow::Error> {
    info!("正在连接数据库");

    let db = Database::connect(database_url).await?;
    info!("数据库连接成功");

    Ok(db)
}

/// 初始化表结构（幂等）
pub async fn apply_schema(db: &DatabaseConnection) -> Result<(), anyhow::Error> {
    db.execute_unprepared(SCHEMA).await?;
    info!("数据库表结构已就绪");
    Ok(())
}
