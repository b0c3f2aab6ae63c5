/// 虚拟机数据模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::VmInstance;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_instances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub vm_type: String,
    pub state: String,
    pub host_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for VmInstance {
    type Error = common::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            vm_type: model.vm_type.parse()?,
            state: model.state.parse()?,
            id: model.id,
            name: model.name,
            host_id: model.host_id,
        })
    }
}
