pub mod control_matrix;
pub mod monitor;
pub mod pool;
pub mod probe;
pub mod resource_scheduler;
pub mod task;

pub use control_matrix::{ControlEntry, ControlMatrix, DeferCondition};
pub use monitor::{ResourceMonitor, StateTransition, SystemState};
pub use pool::{PoolPermit, PriorityPools};
pub use probe::{ResourceProbe, ResourceSnapshot, SysinfoProbe};
pub use resource_scheduler::{is_eligible, DispatchReport, ResourceScheduler, SubmitOutcome};
pub use task::{job, Priority, ResourceClass, ScheduledTask, TaskJob, TaskKind, TaskState};
