//! Job migrator.
//!
//! Finds the existing instances a desired group should take over, with the
//! availability zone each one is considered to live in. Three layouts are
//! recognised:
//!
//! - zoned instances carry their AZ in the instance record;
//! - legacy unzoned instances get the AZ implied by placement (the
//!   group's `migrated_from` entry for their job, else the group's only AZ);
//! - instances recorded under a renamed job match the new group while the
//!   rename is active.
//!
//! When several candidates want the same index, a recorded AZ beats an
//! inferred one and a same-name instance beats a renamed one. Losing
//! direct or migrated candidates move to the next free index; losing
//! renamed candidates are left unclaimed and end up obsolete.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use tracing::debug;

use stratus_core::InstanceGroupSpec;
use stratus_state::{ExistingInstance, InstanceId};

use crate::plan::Rename;

/// An existing instance matched to a group, with its resolved AZ and the
/// index slot it occupies in the group.
#[derive(Debug, Clone, Serialize)]
pub struct ExistingWithAz {
    pub instance: ExistingInstance,
    pub az: Option<String>,
    pub index: u32,
    pub renamed_from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    Direct,
    Migrated,
    Renamed,
}

struct Candidate<'a> {
    instance: &'a ExistingInstance,
    kind: MatchKind,
    az: Option<String>,
    explicit_az: bool,
}

impl Candidate<'_> {
    /// Lower sorts first: same-name before renamed, recorded AZ before
    /// inferred, direct before migrated.
    fn rank(&self) -> (bool, bool, MatchKind) {
        (
            self.kind == MatchKind::Renamed,
            !self.explicit_az,
            self.kind,
        )
    }
}

pub struct JobMigrator<'a> {
    existing: &'a [ExistingInstance],
    rename: Option<&'a Rename>,
}

impl<'a> JobMigrator<'a> {
    pub fn new(existing: &'a [ExistingInstance], rename: Option<&'a Rename>) -> Self {
        Self { existing, rename }
    }

    /// Match existing instances to `group`. Instances already in `claimed`
    /// are skipped; every instance returned is added to it, so no instance
    /// is handed to two groups.
    pub fn find_existing_instances_with_azs(
        &self,
        group: &InstanceGroupSpec,
        claimed: &mut HashSet<InstanceId>,
    ) -> Vec<ExistingWithAz> {
        let mut candidates: Vec<Candidate<'_>> = self
            .existing
            .iter()
            .filter(|e| !claimed.contains(e.id()))
            .filter_map(|e| self.candidate(group, e))
            .collect();

        // Stable: ties keep repository order (job, index).
        candidates.sort_by(|a, b| {
            (a.instance.index(), a.rank()).cmp(&(b.instance.index(), b.rank()))
        });

        let mut taken: BTreeSet<u32> = BTreeSet::new();
        let mut winners = Vec::new();
        let mut displaced = Vec::new();
        for candidate in candidates {
            if taken.insert(candidate.instance.index()) {
                winners.push(candidate);
            } else if candidate.kind == MatchKind::Renamed {
                debug!(
                    group = %group.name,
                    instance = %candidate.instance.id(),
                    "renamed instance shadowed by same-name instance"
                );
            } else {
                displaced.push(candidate);
            }
        }

        let mut matched: Vec<ExistingWithAz> = winners
            .into_iter()
            .map(|c| {
                let index = c.instance.index();
                self.finish(c, index)
            })
            .collect();

        let mut next_free = 0u32;
        for candidate in displaced {
            while taken.contains(&next_free) {
                next_free += 1;
            }
            taken.insert(next_free);
            debug!(
                group = %group.name,
                instance = %candidate.instance.id(),
                from = candidate.instance.index(),
                to = next_free,
                "re-indexing migrated instance"
            );
            matched.push(self.finish(candidate, next_free));
        }

        matched.sort_by_key(|m| m.index);
        for m in &matched {
            claimed.insert(m.instance.id().to_string());
        }
        matched
    }

    fn candidate<'e>(
        &self,
        group: &InstanceGroupSpec,
        instance: &'e ExistingInstance,
    ) -> Option<Candidate<'e>> {
        let job = instance.job();
        let (kind, migrated_az) = if job == group.name {
            (MatchKind::Direct, None)
        } else if let Some(entry) = group.migrated_from.iter().find(|m| m.name == job) {
            (MatchKind::Migrated, entry.az.clone())
        } else if self
            .rename
            .is_some_and(|r| r.new_name == group.name && r.old_name == job)
        {
            (MatchKind::Renamed, None)
        } else {
            return None;
        };

        let (az, explicit_az) = match &instance.az {
            Some(az) => (Some(az.clone()), true),
            None => {
                let inferred = migrated_az.or_else(|| match group.azs.as_slice() {
                    [only] => Some(only.clone()),
                    _ => None,
                });
                (inferred, false)
            }
        };

        Some(Candidate {
            instance,
            kind,
            az,
            explicit_az,
        })
    }

    fn finish(&self, candidate: Candidate<'_>, index: u32) -> ExistingWithAz {
        let renamed_from = match candidate.kind {
            MatchKind::Renamed => Some(candidate.instance.job().to_string()),
            _ => None,
        };
        ExistingWithAz {
            instance: candidate.instance.clone(),
            az: candidate.az,
            index,
            renamed_from,
        }
    }
}
