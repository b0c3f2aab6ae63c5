/// 存储池状态机
///
/// 所有状态变更都必须经过这里的转移表，非法转移直接拒绝

use serde::{Deserialize, Serialize};

use super::PoolStatus;

string_enum! {
    /// 驱动存储池状态变化的事件
    PoolEvent {
        MaintenanceRequested => "maintenance-requested",
        /// 没有需要排空的主机，直接进入维护
        NothingToDrain => "nothing-to-drain",
        Drained => "drained",
        OperationFailed => "operation-failed",
        CancelRequested => "cancel-requested",
        Resumed => "resumed",
        /// 容器池或子池失败时强制进入错误状态
        ForceError => "force-error",
        ControllerDeparted => "controller-departed",
        Disable => "disable",
        Enable => "enable",
        Remove => "remove",
    }
}

impl PoolStatus {
    /// 根据事件计算下一个状态，非法转移返回 None
    pub fn apply(self, event: PoolEvent) -> Option<PoolStatus> {
        use PoolStatus as S;

        let next = match (self, event) {
            (S::Up | S::Disabled | S::ErrorInMaintenance, PoolEvent::MaintenanceRequested) => {
                S::PrepareForMaintenance
            }
            (S::Up | S::Disabled | S::ErrorInMaintenance, PoolEvent::NothingToDrain) => S::Maintenance,
            (S::PrepareForMaintenance, PoolEvent::Drained) => S::Maintenance,
            (S::PrepareForMaintenance | S::CancelMaintenance, PoolEvent::OperationFailed) => {
                S::ErrorInMaintenance
            }
            (S::Maintenance | S::ErrorInMaintenance, PoolEvent::CancelRequested) => S::CancelMaintenance,
            (S::CancelMaintenance, PoolEvent::Resumed) => S::Up,
            (S::Removed, PoolEvent::ForceError) => return None,
            (_, PoolEvent::ForceError) => S::ErrorInMaintenance,
            (
                S::PrepareForMaintenance | S::CancelMaintenance | S::ErrorInMaintenance,
                PoolEvent::ControllerDeparted,
            ) => S::ErrorInMaintenance,
            (S::Up, PoolEvent::Disable) => S::Disabled,
            (S::Disabled, PoolEvent::Enable) => S::Up,
            (S::Up | S::Disabled | S::Maintenance | S::ErrorInMaintenance, PoolEvent::Remove) => S::Removed,
            _ => return None,
        };

        Some(next)
    }

    /// 维护流程中的中间状态（控制器崩溃后需要人工介入）
    pub fn is_interrupted_maintenance(&self) -> bool {
        matches!(
            self,
            PoolStatus::PrepareForMaintenance
                | PoolStatus::CancelMaintenance
                | PoolStatus::ErrorInMaintenance
        )
    }

    /// 有控制器正在推进的维护状态
    pub fn is_in_flight(&self) -> bool {
        matches!(self, PoolStatus::PrepareForMaintenance | PoolStatus::CancelMaintenance)
    }
}
