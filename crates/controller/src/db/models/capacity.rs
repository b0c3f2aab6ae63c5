/// 容量汇总记录

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::to_u64;
use crate::domain::CapacityRecord;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "op_capacity")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub pool_id: String,
    pub capacity_type: String,
    pub allocated: i64,
    pub total: i64,
    pub state: String,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for CapacityRecord {
    type Error = common::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            capacity_type: model.capacity_type.parse()?,
            state: model.state.parse()?,
            allocated: to_u64(model.allocated),
            total: to_u64(model.total),
            pool_id: model.pool_id,
        })
    }
}
