//! Recomputes load counters from allocation records.
//!
//! Counters are maintained by deltas on every commit; this pass repairs them
//! if a crash or an out-of-band edit ever leaves them out of step.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::allocator::Scheduler;
use crate::error::{Result, StoreError};
use crate::models::{Allocation, FacultyId, FacultyProfile};
use crate::store::{LoadSnapshot, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDrift {
    pub faculty_id: FacultyId,
    pub name: String,
    pub stored_current: i64,
    pub expected_current: i64,
    pub stored_daily: BTreeMap<NaiveDate, i64>,
    pub expected_daily: BTreeMap<NaiveDate, i64>,
}

/// Counters implied by the load-bearing allocations, for every faculty.
pub fn expected_loads(
    faculty: &[FacultyProfile],
    allocations: &[Allocation],
) -> HashMap<FacultyId, (i64, BTreeMap<NaiveDate, i64>)> {
    let mut loads: HashMap<FacultyId, (i64, BTreeMap<NaiveDate, i64>)> = faculty
        .iter()
        .map(|f| (f.id, (0, BTreeMap::new())))
        .collect();

    for allocation in allocations {
        let Some(owner) = allocation.load_owner() else {
            continue;
        };
        if let Some((current, daily)) = loads.get_mut(&owner) {
            *current += 1;
            *daily.entry(allocation.date).or_insert(0) += 1;
        }
    }
    loads
}

pub fn find_drift(faculty: &[FacultyProfile], allocations: &[Allocation]) -> Vec<LoadDrift> {
    let mut expected = expected_loads(faculty, allocations);

    faculty
        .iter()
        .filter_map(|profile| {
            let (expected_current, expected_daily) = expected.remove(&profile.id)?;
            let stored_daily: BTreeMap<NaiveDate, i64> = profile
                .daily_load
                .iter()
                .filter(|(_, count)| **count != 0)
                .map(|(date, count)| (*date, *count))
                .collect();

            if expected_current == profile.current_load && expected_daily == stored_daily {
                return None;
            }
            Some(LoadDrift {
                faculty_id: profile.id,
                name: profile.name.clone(),
                stored_current: profile.current_load,
                expected_current,
                stored_daily,
                expected_daily,
            })
        })
        .collect()
}

impl<S: Store> Scheduler<S> {
    /// Reports counter drift and, when `apply` is set, overwrites the
    /// stored counters with the recomputed ones.
    ///
    /// The overwrite is refused if any counter moved since it was read; the
    /// pass then starts over, up to `commit_attempts` times.
    pub async fn reconcile(&self, apply: bool) -> Result<Vec<LoadDrift>> {
        let attempts = self.options().commit_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let faculty = self.store().list_faculty().await?;
            let allocations = self.store().list_allocations().await?;
            let drift = find_drift(&faculty, &allocations);

            for entry in &drift {
                warn!(
                    faculty_id = %entry.faculty_id,
                    stored = entry.stored_current,
                    expected = entry.expected_current,
                    "Load counters drifted from allocations"
                );
            }
            if !apply || drift.is_empty() {
                return Ok(drift);
            }

            let stored: HashMap<FacultyId, &FacultyProfile> =
                faculty.iter().map(|f| (f.id, f)).collect();
            let snapshots: Vec<LoadSnapshot> = drift
                .iter()
                .filter_map(|entry| {
                    let profile = stored.get(&entry.faculty_id)?;
                    Some(LoadSnapshot {
                        faculty_id: entry.faculty_id,
                        current_load: entry.expected_current,
                        daily_load: entry.expected_daily.clone(),
                        seen_current: profile.current_load,
                        seen_daily: profile.daily_load.clone(),
                    })
                })
                .collect();

            match self.store().overwrite_loads(&snapshots).await {
                Ok(()) => {
                    info!(repaired = snapshots.len(), "Load counters reconciled");
                    return Ok(drift);
                }
                Err(StoreError::CountersMoved { faculty_id }) if attempt < attempts => {
                    warn!(attempt, %faculty_id, "Counters moved during reconciliation, rereading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
