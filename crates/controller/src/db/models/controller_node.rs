/// 控制器节点（集群成员）

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::ControllerNode;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "controller_nodes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub address: String,
    pub state: String, // up, down
    pub last_heartbeat: DateTimeWithTimeZone,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for ControllerNode {
    type Error = common::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            state: model.state.parse()?,
            last_heartbeat: model.last_heartbeat.with_timezone(&chrono::Utc),
            id: model.id,
            address: model.address,
        })
    }
}
