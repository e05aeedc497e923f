//! Reconciliation steps.
//!
//! Each step mutates the [`PlanContext`] in place and is safe to re-run
//! against the same stored state. The [`Assembler`](crate::Assembler)
//! drives them in a fixed order.

mod allocation;
mod catalog;
mod existing;
mod links;
mod releases;

use std::future::Future;
use std::pin::Pin;

use crate::context::PlanContext;
use crate::error::PlanResult;

pub use allocation::{BindDns, BindInstanceNetworks, BindUnallocatedVms};
pub use catalog::{BindProperties, BindStemcells, BindTemplates};
pub use existing::{
    BindRenames, CollectAgentState, LoadExistingState, MarkObsolete, MarkUnknownVmsForDeletion,
    MigrateLegacyDns, PlanInstances, ReserveIps,
};
pub use links::BindLinks;
pub use releases::BindReleases;

/// Boxed future returned by [`ReconciliationStep::run`].
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = PlanResult<()>> + Send + 'a>>;

pub trait ReconciliationStep: Send + Sync {
    /// Task name reported to the event log.
    fn name(&self) -> &'static str;

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a>;
}

/// A step applied to each instance group in turn. Every group is reported
/// as its own task, named after the group.
pub trait GroupStep: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a mut PlanContext, group: &'a str) -> StepFuture<'a>;
}
