/// 存储池数据模型

use common::models::{HypervisorType, PoolStatus, StoragePoolType};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::{to_i64, to_u64};
use crate::domain::StoragePool;

/// 存储池模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "storage_pools")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub scope: String, // host, cluster, zone
    pub zone_id: String,
    pub cluster_id: Option<String>,
    pub host_id: Option<String>,

    // 容器池层级
    pub parent_id: Option<String>,
    pub external_id: Option<String>,

    #[sea_orm(column_name = "type")]
    pub pool_type: String,
    pub status: String,

    // 容量信息
    pub capacity_bytes: i64,
    pub used_bytes: i64,
    pub capacity_iops: Option<i64>,

    pub hypervisor: Option<String>,
    pub managed: bool,
    pub removal_pending: bool,
    /// 正在执行维护流程的控制器
    pub maintenance_owner: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::volume::Entity")]
    Volumes,
}

impl Related<super::volume::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Volumes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for StoragePool {
    type Error = common::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            scope: model.scope.parse()?,
            status: model.status.parse::<PoolStatus>()?,
            pool_type: model.pool_type.parse::<StoragePoolType>()?,
            hypervisor: model
                .hypervisor
                .as_deref()
                .map(str::parse::<HypervisorType>)
                .transpose()?,
            capacity_bytes: to_u64(model.capacity_bytes),
            used_bytes: to_u64(model.used_bytes),
            capacity_iops: model.capacity_iops.map(to_u64),
            id: model.id,
            name: model.name,
            zone_id: model.zone_id,
            cluster_id: model.cluster_id,
            host_id: model.host_id,
            parent_id: model.parent_id,
            external_id: model.external_id,
            managed: model.managed,
            removal_pending: model.removal_pending,
            maintenance_owner: model.maintenance_owner,
        })
    }
}

impl ActiveModel {
    /// 由领域对象构建待插入记录
    pub fn from_domain(pool: &StoragePool, now: DateTimeWithTimeZone) -> Self {
        use sea_orm::Set;

        Self {
            id: Set(pool.id.clone()),
            name: Set(pool.name.clone()),
            scope: Set(pool.scope.to_string()),
            zone_id: Set(pool.zone_id.clone()),
            cluster_id: Set(pool.cluster_id.clone()),
            host_id: Set(pool.host_id.clone()),
            parent_id: Set(pool.parent_id.clone()),
            external_id: Set(pool.external_id.clone()),
            pool_type: Set(pool.pool_type.to_string()),
            status: Set(pool.status.to_string()),
            capacity_bytes: Set(to_i64(pool.capacity_bytes)),
            used_bytes: Set(to_i64(pool.used_bytes)),
            capacity_iops: Set(pool.capacity_iops.map(to_i64)),
            hypervisor: Set(pool.hypervisor.map(|h| h.to_string())),
            managed: Set(pool.managed),
            removal_pending: Set(pool.removal_pending),
            maintenance_owner: Set(pool.maintenance_owner.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }
}
