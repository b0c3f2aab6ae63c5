/// SeaORM 仓储实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{AllocationState, CapacityType, ControllerState, HostStatus, PoolStatus, VmState};
use common::utils::generate_id;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

use super::{
    CapacityRepository, ControllerNodeRepository, HostRepository, MaintenanceLeaseRepository,
    PoolRepository, ScopeRepository, VmRepository, VolumeRepository, WorkItemRepository,
};
use crate::db::models::{
    capacity, cluster, controller_node, host, maintenance_lease, pool_host, storage_pool, to_i64,
    vm, volume, work_item, zone,
};
use crate::domain::{CapacityRecord, ControllerNode, Host, StoragePool, VmInstance, Volume, WorkItem};
use crate::errors::{PoolError, PoolResult};

fn now() -> sea_orm::prelude::DateTimeWithTimeZone {
    Utc::now().into()
}

fn convert_all<M, T>(models: Vec<M>) -> PoolResult<Vec<T>>
where
    T: TryFrom<M, Error = common::Error>,
{
    models
        .into_iter()
        .map(|model| T::try_from(model).map_err(PoolError::from))
        .collect()
}

/// 未完成的工作项：停止或重启尚有一步没做
fn pending_work() -> Condition {
    Condition::any()
        .add(work_item::Column::StoppedForMaintenance.eq(false))
        .add(work_item::Column::StartedAfterMaintenance.eq(false))
}

pub struct SeaRepository {
    db: DatabaseConnection,
}

impl SeaRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PoolRepository for SeaRepository {
    async fn get(&self, pool_id: &str) -> PoolResult<Option<StoragePool>> {
        let model = storage_pool::Entity::find_by_id(pool_id).one(&self.db).await?;
        Ok(model.map(StoragePool::try_from).transpose()?)
    }

    async fn list_children(&self, parent_id: &str) -> PoolResult<Vec<StoragePool>> {
        let models = storage_pool::Entity::find()
            .filter(storage_pool::Column::ParentId.eq(parent_id))
            .order_by_asc(storage_pool::Column::CreatedAt)
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn list_by_zone(&self, zone_id: &str) -> PoolResult<Vec<StoragePool>> {
        let models = storage_pool::Entity::find()
            .filter(storage_pool::Column::ZoneId.eq(zone_id))
            .filter(storage_pool::Column::Status.ne(PoolStatus::Removed.as_str()))
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn list_by_status(&self, status: PoolStatus) -> PoolResult<Vec<StoragePool>> {
        let models = storage_pool::Entity::find()
            .filter(storage_pool::Column::Status.eq(status.as_str()))
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn find_by_external_id(&self, zone_id: &str, external_id: &str) -> PoolResult<Option<StoragePool>> {
        let model = storage_pool::Entity::find()
            .filter(storage_pool::Column::ZoneId.eq(zone_id))
            .filter(storage_pool::Column::ExternalId.eq(external_id))
            .filter(storage_pool::Column::Status.ne(PoolStatus::Removed.as_str()))
            .one(&self.db)
            .await?;
        Ok(model.map(StoragePool::try_from).transpose()?)
    }

    async fn insert(&self, pool: &StoragePool) -> PoolResult<()> {
        storage_pool::ActiveModel::from_domain(pool, now())
            .insert(&self.db)
            .await?;
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        pool_id: &str,
        expected: PoolStatus,
        next: PoolStatus,
        owner: Option<&str>,
    ) -> PoolResult<bool> {
        let result = storage_pool::Entity::update_many()
            .col_expr(storage_pool::Column::Status, Expr::value(next.as_str()))
            .col_expr(
                storage_pool::Column::MaintenanceOwner,
                Expr::value(owner.map(str::to_string)),
            )
            .col_expr(storage_pool::Column::UpdatedAt, Expr::value(now()))
            .filter(storage_pool::Column::Id.eq(pool_id))
            .filter(storage_pool::Column::Status.eq(expected.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn list_owned_in_flight(&self, owner: &str) -> PoolResult<Vec<StoragePool>> {
        let models = storage_pool::Entity::find()
            .filter(storage_pool::Column::MaintenanceOwner.eq(owner))
            .filter(storage_pool::Column::Status.is_in([
                PoolStatus::PrepareForMaintenance.as_str(),
                PoolStatus::CancelMaintenance.as_str(),
            ]))
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn update_usage(&self, pool_id: &str, capacity_bytes: u64, used_bytes: u64) -> PoolResult<()> {
        storage_pool::Entity::update_many()
            .col_expr(storage_pool::Column::CapacityBytes, Expr::value(to_i64(capacity_bytes)))
            .col_expr(storage_pool::Column::UsedBytes, Expr::value(to_i64(used_bytes)))
            .col_expr(storage_pool::Column::UpdatedAt, Expr::value(now()))
            .filter(storage_pool::Column::Id.eq(pool_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_parent(&self, pool_id: &str, parent_id: Option<&str>) -> PoolResult<()> {
        storage_pool::Entity::update_many()
            .col_expr(
                storage_pool::Column::ParentId,
                Expr::value(parent_id.map(str::to_string)),
            )
            .col_expr(storage_pool::Column::UpdatedAt, Expr::value(now()))
            .filter(storage_pool::Column::Id.eq(pool_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_removal_pending(&self, pool_id: &str, pending: bool) -> PoolResult<()> {
        storage_pool::Entity::update_many()
            .col_expr(storage_pool::Column::RemovalPending, Expr::value(pending))
            .col_expr(storage_pool::Column::UpdatedAt, Expr::value(now()))
            .filter(storage_pool::Column::Id.eq(pool_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HostRepository for SeaRepository {
    async fn get(&self, host_id: &str) -> PoolResult<Option<Host>> {
        let model = host::Entity::find_by_id(host_id).one(&self.db).await?;
        Ok(model.map(Host::try_from).transpose()?)
    }

    async fn list_attached_to_pool(&self, pool_id: &str) -> PoolResult<Vec<Host>> {
        let host_ids: Vec<String> = pool_host::Entity::find()
            .filter(pool_host::Column::PoolId.eq(pool_id))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|r| r.host_id)
            .collect();

        if host_ids.is_empty() {
            return Ok(Vec::new());
        }

        let models = host::Entity::find()
            .filter(host::Column::Id.is_in(host_ids))
            .order_by_asc(host::Column::Id)
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn list_by_zone(&self, zone_id: &str) -> PoolResult<Vec<Host>> {
        let models = host::Entity::find()
            .filter(host::Column::ZoneId.eq(zone_id))
            .order_by_asc(host::Column::Id)
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn list_by_cluster(&self, cluster_id: &str) -> PoolResult<Vec<Host>> {
        let models = host::Entity::find()
            .filter(host::Column::ClusterId.eq(cluster_id))
            .order_by_asc(host::Column::Id)
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn set_status(&self, host_id: &str, status: HostStatus) -> PoolResult<()> {
        let mut update = host::Entity::update_many()
            .col_expr(host::Column::Status, Expr::value(status.as_str()))
            .col_expr(host::Column::UpdatedAt, Expr::value(now()));
        if status == HostStatus::Up {
            update = update.col_expr(host::Column::LastHeartbeat, Expr::value(Some(now())));
        }
        update
            .filter(host::Column::Id.eq(host_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VolumeRepository for SeaRepository {
    async fn list_by_pool(&self, pool_id: &str) -> PoolResult<Vec<Volume>> {
        let models = volume::Entity::find()
            .filter(volume::Column::PoolId.eq(pool_id))
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn list_by_vm(&self, vm_id: &str) -> PoolResult<Vec<Volume>> {
        let models = volume::Entity::find()
            .filter(volume::Column::VmId.eq(vm_id))
            .all(&self.db)
            .await?;
        convert_all(models)
    }
}

#[async_trait]
impl VmRepository for SeaRepository {
    async fn get(&self, vm_id: &str) -> PoolResult<Option<VmInstance>> {
        let model = vm::Entity::find_by_id(vm_id).one(&self.db).await?;
        Ok(model.map(VmInstance::try_from).transpose()?)
    }

    async fn update_state(&self, vm_id: &str, state: VmState) -> PoolResult<()> {
        vm::Entity::update_many()
            .col_expr(vm::Column::State, Expr::value(state.as_str()))
            .col_expr(vm::Column::UpdatedAt, Expr::value(now()))
            .filter(vm::Column::Id.eq(vm_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkItemRepository for SeaRepository {
    async fn upsert(&self, pool_id: &str, vm_id: &str, owner: &str) -> PoolResult<WorkItem> {
        let now = now();
        let item = work_item::ActiveModel {
            id: Set(generate_id()),
            pool_id: Set(pool_id.to_string()),
            vm_id: Set(vm_id.to_string()),
            stopped_for_maintenance: Set(false),
            started_after_maintenance: Set(false),
            owner_controller_id: Set(owner.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        work_item::Entity::insert(item)
            .on_conflict(
                OnConflict::columns([work_item::Column::PoolId, work_item::Column::VmId])
                    .update_columns([
                        work_item::Column::StoppedForMaintenance,
                        work_item::Column::StartedAfterMaintenance,
                        work_item::Column::OwnerControllerId,
                        work_item::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        let model = work_item::Entity::find()
            .filter(work_item::Column::PoolId.eq(pool_id))
            .filter(work_item::Column::VmId.eq(vm_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| PoolError::NotFound(format!("工作项 {}/{}", pool_id, vm_id)))?;
        Ok(model.into())
    }

    async fn list_by_pool(&self, pool_id: &str) -> PoolResult<Vec<WorkItem>> {
        let models = work_item::Entity::find()
            .filter(work_item::Column::PoolId.eq(pool_id))
            .order_by_asc(work_item::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(WorkItem::from).collect())
    }

    async fn list_all(&self) -> PoolResult<Vec<WorkItem>> {
        let models = work_item::Entity::find().all(&self.db).await?;
        Ok(models.into_iter().map(WorkItem::from).collect())
    }

    async fn update_flags(&self, item_id: &str, stopped: bool, started: bool) -> PoolResult<bool> {
        let result = work_item::Entity::update_many()
            .col_expr(work_item::Column::StoppedForMaintenance, Expr::value(stopped))
            .col_expr(work_item::Column::StartedAfterMaintenance, Expr::value(started))
            .col_expr(work_item::Column::UpdatedAt, Expr::value(now()))
            .filter(work_item::Column::Id.eq(item_id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn remove(&self, item_id: &str) -> PoolResult<()> {
        work_item::Entity::delete_by_id(item_id).exec(&self.db).await?;
        Ok(())
    }

    async fn pool_ids_with_pending_for_owner(&self, owner: &str) -> PoolResult<Vec<String>> {
        let mut pool_ids: Vec<String> = work_item::Entity::find()
            .filter(work_item::Column::OwnerControllerId.eq(owner))
            .filter(pending_work())
            .all(&self.db)
            .await?
            .into_iter()
            .map(|r| r.pool_id)
            .collect();
        pool_ids.sort();
        pool_ids.dedup();
        Ok(pool_ids)
    }

    async fn remove_pending(&self, owner: &str, pool_id: &str) -> PoolResult<u64> {
        let result = work_item::Entity::delete_many()
            .filter(work_item::Column::OwnerControllerId.eq(owner))
            .filter(work_item::Column::PoolId.eq(pool_id))
            .filter(pending_work())
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl MaintenanceLeaseRepository for SeaRepository {
    async fn try_acquire(&self, scope_key: &str, pool_id: &str, owner: &str) -> PoolResult<bool> {
        let lease = maintenance_lease::ActiveModel {
            scope_key: Set(scope_key.to_string()),
            pool_id: Set(pool_id.to_string()),
            owner_controller_id: Set(owner.to_string()),
            acquired_at: Set(now()),
        };

        let inserted = maintenance_lease::Entity::insert(lease)
            .on_conflict(
                OnConflict::column(maintenance_lease::Column::ScopeKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(inserted == 1)
    }

    async fn holder(&self, scope_key: &str) -> PoolResult<Option<String>> {
        let lease = maintenance_lease::Entity::find_by_id(scope_key)
            .one(&self.db)
            .await?;
        Ok(lease.map(|l| l.pool_id))
    }

    async fn release(&self, scope_key: &str, owner: &str) -> PoolResult<()> {
        maintenance_lease::Entity::delete_many()
            .filter(maintenance_lease::Column::ScopeKey.eq(scope_key))
            .filter(maintenance_lease::Column::OwnerControllerId.eq(owner))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn release_owned_by(&self, owner: &str) -> PoolResult<u64> {
        let result = maintenance_lease::Entity::delete_many()
            .filter(maintenance_lease::Column::OwnerControllerId.eq(owner))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl CapacityRepository for SeaRepository {
    async fn upsert(&self, record: &CapacityRecord) -> PoolResult<()> {
        let row = capacity::ActiveModel {
            id: Set(generate_id()),
            pool_id: Set(record.pool_id.clone()),
            capacity_type: Set(record.capacity_type.to_string()),
            allocated: Set(to_i64(record.allocated)),
            total: Set(to_i64(record.total)),
            state: Set(record.state.to_string()),
            updated_at: Set(now()),
        };

        capacity::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([capacity::Column::PoolId, capacity::Column::CapacityType])
                    .update_columns([
                        capacity::Column::Allocated,
                        capacity::Column::Total,
                        capacity::Column::State,
                        capacity::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn get(&self, pool_id: &str, capacity_type: CapacityType) -> PoolResult<Option<CapacityRecord>> {
        let model = capacity::Entity::find()
            .filter(capacity::Column::PoolId.eq(pool_id))
            .filter(capacity::Column::CapacityType.eq(capacity_type.as_str()))
            .one(&self.db)
            .await?;
        Ok(model.map(CapacityRecord::try_from).transpose()?)
    }
}

#[async_trait]
impl ControllerNodeRepository for SeaRepository {
    async fn heartbeat(&self, id: &str, address: &str, now: DateTime<Utc>) -> PoolResult<Option<ControllerNode>> {
        let previous = controller_node::Entity::find_by_id(id).one(&self.db).await?;

        let row = controller_node::ActiveModel {
            id: Set(id.to_string()),
            address: Set(address.to_string()),
            state: Set(ControllerState::Up.to_string()),
            last_heartbeat: Set(now.into()),
            created_at: Set(now.into()),
        };

        controller_node::Entity::insert(row)
            .on_conflict(
                OnConflict::column(controller_node::Column::Id)
                    .update_columns([
                        controller_node::Column::Address,
                        controller_node::Column::State,
                        controller_node::Column::LastHeartbeat,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(previous.map(ControllerNode::try_from).transpose()?)
    }

    async fn list_stale(&self, before: DateTime<Utc>) -> PoolResult<Vec<ControllerNode>> {
        let before: sea_orm::prelude::DateTimeWithTimeZone = before.into();
        let models = controller_node::Entity::find()
            .filter(controller_node::Column::State.eq(ControllerState::Up.as_str()))
            .filter(controller_node::Column::LastHeartbeat.lt(before))
            .all(&self.db)
            .await?;
        convert_all(models)
    }

    async fn mark_down(&self, id: &str) -> PoolResult<bool> {
        let result = controller_node::Entity::update_many()
            .col_expr(controller_node::Column::State, Expr::value(ControllerState::Down.as_str()))
            .filter(controller_node::Column::Id.eq(id))
            .filter(controller_node::Column::State.eq(ControllerState::Up.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}

#[async_trait]
impl ScopeRepository for SeaRepository {
    async fn zone_enabled(&self, zone_id: &str) -> PoolResult<bool> {
        let zone = zone::Entity::find_by_id(zone_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| PoolError::NotFound(format!("区域 {}", zone_id)))?;
        Ok(zone.allocation_state.parse::<AllocationState>()? == AllocationState::Enabled)
    }

    async fn cluster_enabled(&self, cluster_id: &str) -> PoolResult<bool> {
        let cluster = cluster::Entity::find_by_id(cluster_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| PoolError::NotFound(format!("集群 {}", cluster_id)))?;
        Ok(cluster.allocation_state.parse::<AllocationState>()? == AllocationState::Enabled)
    }
}
