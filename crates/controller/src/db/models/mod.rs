/// 数据库实体
///
/// 枚举列统一以字符串保存，读取时解析为 common::models 中的强类型

pub mod capacity;
pub mod cluster;
pub mod controller_node;
pub mod host;
pub mod maintenance_lease;
pub mod pool_host;
pub mod storage_pool;
pub mod vm;
pub mod volume;
pub mod work_item;
pub mod zone;

/// 数据库中的 BIGINT 转为字节数，负值按 0 处理
pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
