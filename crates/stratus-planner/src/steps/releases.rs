use tracing::info;

use stratus_state::DeploymentRecord;

use crate::context::PlanContext;
use crate::epoch_secs;
use crate::error::PlanError;
use crate::lock::{acquire_locks, release_lock_name};
use crate::steps::{ReconciliationStep, StepFuture};

/// Bind the manifest's release versions to stored release records under a
/// per-release lock, and record them on the deployment.
pub struct BindReleases;

impl ReconciliationStep for BindReleases {
    fn name(&self) -> &'static str {
        "bind_releases"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            let refs = ctx.plan.manifest.releases.clone();
            let _locks = acquire_locks(
                &ctx.store,
                refs.iter().map(|r| release_lock_name(&r.name)),
                &ctx.owner,
                &ctx.config,
            )
            .await?;

            let mut bound = Vec::with_capacity(refs.len());
            for release in &refs {
                let record = ctx
                    .store
                    .get_release(&release.name, &release.version)?
                    .ok_or_else(|| {
                        PlanError::director(format!(
                            "release '{}/{}' not found",
                            release.name, release.version
                        ))
                    })?;
                bound.push(record);
            }
            ctx.bound_releases = bound;

            let now = epoch_secs();
            let record = match ctx.store.get_deployment(&ctx.plan.name)? {
                Some(existing) => DeploymentRecord {
                    releases: refs,
                    updated_at: now,
                    ..existing
                },
                None => DeploymentRecord {
                    name: ctx.plan.name.clone(),
                    releases: refs,
                    stemcells: Vec::new(),
                    created_at: now,
                    updated_at: now,
                },
            };
            ctx.store.put_deployment(&record)?;

            info!(
                deployment = %ctx.plan.name,
                releases = ctx.bound_releases.len(),
                "releases bound"
            );
            Ok(())
        })
    }
}
