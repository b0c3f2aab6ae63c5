/// 共享数据模型
///
/// 定义控制器与 Agent 共享的枚举类型，数据库中统一以字符串形式保存

use serde::{Deserialize, Serialize};

/// 为字符串枚举生成 as_str / Display / FromStr
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::Error::InvalidArgument(format!(
                        "未知的 {} 取值: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

mod pool_state;

pub use pool_state::PoolEvent;

string_enum! {
    /// 存储池状态
    PoolStatus {
        Up => "up",
        Disabled => "disabled",
        PrepareForMaintenance => "prepare-for-maintenance",
        Maintenance => "maintenance",
        CancelMaintenance => "cancel-maintenance",
        ErrorInMaintenance => "error-in-maintenance",
        Removed => "removed",
    }
}

string_enum! {
    /// 存储池作用域
    PoolScope {
        Host => "host",
        Cluster => "cluster",
        Zone => "zone",
    }
}

string_enum! {
    /// 存储池介质类型
    StoragePoolType {
        NetworkFilesystem => "nfs",
        SharedMountPoint => "shared-mount-point",
        Filesystem => "filesystem",
        Lvm => "lvm",
        Clvm => "clvm",
        Rbd => "rbd",
        Iscsi => "iscsi",
        Gluster => "gluster",
        Vmfs => "vmfs",
        PreSetup => "pre-setup",
        /// 数据存储集群，本身不承载数据，由若干子存储池组成
        DatastoreCluster => "datastore-cluster",
        PowerFlex => "powerflex",
    }
}

impl StoragePoolType {
    /// 是否支持超配
    pub fn supports_overprovisioning(&self) -> bool {
        matches!(
            self,
            Self::NetworkFilesystem
                | Self::Vmfs
                | Self::PreSetup
                | Self::DatastoreCluster
                | Self::Rbd
                | Self::PowerFlex
        )
    }

    /// 是否必须在主机上挂载成功才可用
    pub fn requires_mount(&self) -> bool {
        matches!(
            self,
            Self::NetworkFilesystem
                | Self::SharedMountPoint
                | Self::Gluster
                | Self::Iscsi
                | Self::Vmfs
        )
    }

    /// 是否为容器型存储池
    pub fn is_container(&self) -> bool {
        matches!(self, Self::DatastoreCluster)
    }
}

string_enum! {
    /// 虚拟化类型
    HypervisorType {
        Kvm => "kvm",
        Qemu => "qemu",
        Xen => "xen",
        Vmware => "vmware",
    }
}

string_enum! {
    /// 主机连接状态
    HostStatus {
        Up => "up",
        Connecting => "connecting",
        Disconnected => "disconnected",
        Down => "down",
        Alert => "alert",
    }
}

string_enum! {
    /// 主机资源状态（管理员控制）
    ResourceState {
        Enabled => "enabled",
        Disabled => "disabled",
        Maintenance => "maintenance",
    }
}

string_enum! {
    /// 虚拟机状态
    VmState {
        Starting => "starting",
        Running => "running",
        Stopping => "stopping",
        Stopped => "stopped",
        Migrating => "migrating",
        Destroyed => "destroyed",
        Expunging => "expunging",
        Error => "error",
    }
}

impl VmState {
    /// 虚拟机是否正在使用其所在的存储
    pub fn uses_storage(&self) -> bool {
        matches!(self, Self::Running | Self::Starting | Self::Stopping)
    }
}

string_enum! {
    /// 虚拟机类型
    VmType {
        User => "user",
        ConsoleProxy => "console-proxy",
        SecondaryStorageVm => "secondary-storage-vm",
        DomainRouter => "domain-router",
    }
}

impl VmType {
    /// 系统基础设施虚拟机
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, Self::User)
    }
}

string_enum! {
    /// 存储卷类型
    VolumeType {
        Root => "root",
        DataDisk => "data-disk",
    }
}

string_enum! {
    /// 存储卷状态
    VolumeState {
        Allocated => "allocated",
        Ready => "ready",
        Migrating => "migrating",
        Destroyed => "destroyed",
        Expunged => "expunged",
    }
}

impl VolumeState {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Expunged)
    }
}

string_enum! {
    /// 容量记录类型
    CapacityType {
        StorageAllocated => "storage-allocated",
        StorageUsed => "storage-used",
    }
}

string_enum! {
    /// 区域 / 集群的分配状态
    AllocationState {
        Enabled => "enabled",
        Disabled => "disabled",
    }
}

string_enum! {
    /// 控制器节点状态
    ControllerState {
        Up => "up",
        Down => "down",
    }
}

/// 常量定义
pub mod constants {
    /// 默认控制器端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 默认 Agent RPC 超时（秒）
    pub const DEFAULT_AGENT_TIMEOUT: u64 = 60;

    /// 默认心跳间隔（秒）
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;

    /// 默认控制器离线判定超时（秒）
    pub const DEFAULT_CONTROLLER_TIMEOUT: u64 = 90;

    /// 默认超配系数
    pub const DEFAULT_OVERPROVISION_FACTOR: f64 = 2.0;

    /// 默认已分配容量禁用阈值
    pub const DEFAULT_ALLOCATED_DISABLE_THRESHOLD: f64 = 0.85;

    /// 默认已用容量禁用阈值
    pub const DEFAULT_USED_DISABLE_THRESHOLD: f64 = 0.85;
}
