/// 存储池维护工作项

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::WorkItem;

/// (pool_id, vm_id) 上有唯一约束，入队依赖它做原子 upsert
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "storage_pool_work")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub pool_id: String,
    pub vm_id: String,
    pub stopped_for_maintenance: bool,
    pub started_after_maintenance: bool,
    pub owner_controller_id: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for WorkItem {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            pool_id: model.pool_id,
            vm_id: model.vm_id,
            stopped_for_maintenance: model.stopped_for_maintenance,
            started_after_maintenance: model.started_after_maintenance,
            owner_controller_id: model.owner_controller_id,
        }
    }
}
