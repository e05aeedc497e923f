use tracing::debug;

use crate::context::PlanContext;
use crate::links::resolve;
use crate::steps::{GroupStep, StepFuture};

/// Resolve the links consumed by one group. The assembler runs it once per
/// group, in manifest order, each as its own task.
pub struct BindLinks;

impl GroupStep for BindLinks {
    fn run<'a>(&'a self, ctx: &'a mut PlanContext, group: &'a str) -> StepFuture<'a> {
        Box::pin(async move {
            resolve(&mut ctx.plan, group)?;
            debug!(%group, "links bound");
            Ok(())
        })
    }
}
