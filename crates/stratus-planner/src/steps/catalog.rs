//! Catalog binding: stemcells, job templates and their properties.

use tracing::{debug, info};

use stratus_core::{ReleaseRef, StemcellRef};

use crate::context::PlanContext;
use crate::epoch_secs;
use crate::error::PlanError;
use crate::plan::{BoundTemplate, InstanceGroup};
use crate::properties;
use crate::steps::{ReconciliationStep, StepFuture};

/// Bind stemcells either per resource pool (legacy manifests) or per
/// top-level alias. The manifest never mixes the two.
pub struct BindStemcells;

impl ReconciliationStep for BindStemcells {
    fn name(&self) -> &'static str {
        "bind_stemcells"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            ctx.bound_stemcells.clear();

            if ctx.plan.uses_resource_pools() {
                for pool in &ctx.plan.manifest.resource_pools {
                    let record = ctx
                        .store
                        .get_stemcell(&pool.stemcell.name, &pool.stemcell.version)?
                        .ok_or_else(|| {
                            PlanError::director(format!(
                                "stemcell not bound for resource pool '{}'",
                                pool.name
                            ))
                        })?;
                    debug!(pool = %pool.name, stemcell = %record.cid, "stemcell bound to resource pool");
                    ctx.bound_stemcells.insert(pool.name.clone(), record);
                }
            } else {
                for alias in &ctx.plan.manifest.stemcells {
                    let record = ctx
                        .store
                        .get_stemcell(&alias.name, &alias.version)?
                        .ok_or_else(|| {
                            PlanError::director(format!(
                                "stemcell '{}/{}' not found for alias '{}'",
                                alias.name, alias.version, alias.alias
                            ))
                        })?;
                    debug!(alias = %alias.alias, stemcell = %record.cid, "stemcell bound");
                    ctx.bound_stemcells.insert(alias.alias.clone(), record);
                }
            }

            let mut stemcells: Vec<StemcellRef> = ctx
                .bound_stemcells
                .values()
                .map(|s| StemcellRef {
                    name: s.name.clone(),
                    version: s.version.clone(),
                })
                .collect();
            stemcells.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
            stemcells.dedup();

            if let Some(mut record) = ctx.store.get_deployment(&ctx.plan.name)? {
                if record.stemcells != stemcells {
                    record.stemcells = stemcells;
                    record.updated_at = epoch_secs();
                    ctx.store.put_deployment(&record)?;
                }
            }
            info!(count = ctx.bound_stemcells.len(), "stemcells bound");
            Ok(())
        })
    }
}

/// Attach each group's jobs to their templates in the bound releases.
pub struct BindTemplates;

impl ReconciliationStep for BindTemplates {
    fn name(&self) -> &'static str {
        "bind_templates"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            for group in ctx.plan.groups.iter_mut() {
                let mut templates = Vec::with_capacity(group.spec.jobs.len());
                for job in &group.spec.jobs {
                    let release = ctx
                        .bound_releases
                        .iter()
                        .find(|r| r.name == job.release)
                        .ok_or_else(|| {
                            PlanError::director(format!(
                                "job '{}' in instance group '{}' references release '{}' which is not bound",
                                job.name, group.spec.name, job.release
                            ))
                        })?;
                    let definition = release.job(&job.name).ok_or_else(|| {
                        PlanError::director(format!(
                            "job '{}' not found in release '{}/{}'",
                            job.name, release.name, release.version
                        ))
                    })?;
                    templates.push(BoundTemplate {
                        name: job.name.clone(),
                        release: ReleaseRef {
                            name: release.name.clone(),
                            version: release.version.clone(),
                        },
                        definition: definition.clone(),
                        consumes: job.consumes.clone(),
                        properties: Default::default(),
                        links: Default::default(),
                    });
                }
                debug!(group = %group.spec.name, templates = templates.len(), "templates bound");
                group.templates = templates;
            }
            Ok(())
        })
    }
}

/// Resolve every property a template declares: group properties first,
/// then deployment-wide properties, then the template default. Properties
/// with no value anywhere stay unset.
pub struct BindProperties;

impl ReconciliationStep for BindProperties {
    fn name(&self) -> &'static str {
        "bind_properties"
    }

    fn run<'a>(&'a self, ctx: &'a mut PlanContext) -> StepFuture<'a> {
        Box::pin(async move {
            let global = &ctx.plan.manifest.properties;
            for group in ctx.plan.groups.iter_mut() {
                let InstanceGroup { spec, templates, .. } = group;
                for template in templates.iter_mut() {
                    let mut resolved = stratus_core::Properties::new();
                    for (path, definition) in &template.definition.properties {
                        let value = properties::lookup(&spec.properties, path)
                            .or_else(|| properties::lookup(global, path))
                            .cloned()
                            .or_else(|| definition.default.clone());
                        if let Some(value) = value {
                            properties::insert(&mut resolved, path, value);
                        }
                    }
                    template.properties = resolved;
                }
            }
            Ok(())
        })
    }
}
