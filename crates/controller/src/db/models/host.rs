/// 计算主机数据模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::Host;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hosts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub ip_address: Option<String>,
    pub zone_id: String,
    pub cluster_id: Option<String>,
    pub hypervisor_type: String,
    pub status: String,         // up, connecting, disconnected, down, alert
    pub resource_state: String, // enabled, disabled, maintenance
    pub last_heartbeat: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::pool_host::Entity")]
    PoolRefs,
}

impl Related<super::pool_host::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PoolRefs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Host {
    type Error = common::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            hypervisor: model.hypervisor_type.parse()?,
            status: model.status.parse()?,
            resource_state: model.resource_state.parse()?,
            id: model.id,
            name: model.name,
            zone_id: model.zone_id,
            cluster_id: model.cluster_id,
        })
    }
}
