/// 存储卷数据模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::to_u64;
use crate::domain::Volume;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "volumes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub pool_id: String,
    pub vm_id: Option<String>,
    pub volume_type: String, // root, data-disk
    pub state: String,
    pub size_bytes: i64,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::storage_pool::Entity",
        from = "Column::PoolId",
        to = "super::storage_pool::Column::Id"
    )]
    StoragePool,
}

impl Related<super::storage_pool::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StoragePool.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Volume {
    type Error = common::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            volume_type: model.volume_type.parse()?,
            state: model.state.parse()?,
            size_bytes: to_u64(model.size_bytes),
            id: model.id,
            name: model.name,
            pool_id: model.pool_id,
            vm_id: model.vm_id,
        })
    }
}
