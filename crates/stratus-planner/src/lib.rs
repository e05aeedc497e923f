//! stratus-planner — the reconciliation core of the director.
//!
//! Given a validated manifest and the persisted record of what is already
//! deployed, binds the desired state to the existing state and works out
//! what has to change.
//!
//! # Components
//!
//! - **`collector`** — queries live agents concurrently, bounded by
//!   `max_threads`, and merges their states through a channel
//! - **`migrator`** — matches groups to existing instances across zoned,
//!   legacy unzoned and renamed layouts
//! - **`instance_plan`** — per-slot decisions (create, keep, recreate,
//!   obsolete) and AZ assignment
//! - **`links`** — cross-job link resolution
//! - **`steps`** — the reconciliation steps, one per binding concern
//! - **`assembler`** — runs the steps in order as named stages
//!
//! The pipeline is sequential on one task; only agent-state collection
//! runs in parallel.

pub mod assembler;
pub mod collector;
pub mod context;
pub mod dns;
pub mod error;
pub mod instance_plan;
pub mod links;
pub mod lock;
pub mod migrator;
pub mod network;
pub mod plan;
pub mod properties;
pub mod stage;
pub mod steps;

#[cfg(test)]
mod test_support;

use std::time::{SystemTime, UNIX_EPOCH};

pub use assembler::Assembler;
pub use collector::StateCollector;
pub use context::{PlanContext, PlanSummary, VmDeletion};
pub use dns::{DnsManager, StoreDnsManager};
pub use error::{AssembleError, PlanError, PlanResult};
pub use instance_plan::{DesiredInstance, InstancePlan, Transition, VmPlaceholder};
pub use migrator::{ExistingWithAz, JobMigrator};
pub use plan::{BoundTemplate, DeploymentPlan, InstanceGroup, Rename};
pub use stage::{EventLog, RecordingEventLog, StageEvent, TracingEventLog};

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
