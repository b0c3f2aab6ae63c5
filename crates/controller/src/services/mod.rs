/// 业务服务层

pub mod capacity;
pub mod dispatcher;
pub mod gc;
pub mod maintenance_lock;
pub mod membership;
pub mod pool_lifecycle;
pub mod scheduler;
pub mod stats;
pub mod topology;
pub mod vm_control;
pub mod work_queue;

pub use capacity::CapacityService;
pub use dispatcher::{AgentTransport, CommandDispatcher, DriverRegistry, HostOrdering, TransportError};
pub use gc::WorkItemCollector;
pub use membership::MembershipService;
pub use pool_lifecycle::PoolLifecycleService;
pub use scheduler::PeriodicScheduler;
pub use stats::StatsRefresher;
pub use vm_control::{AgentVmControl, VmControl};
