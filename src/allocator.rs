//! Daily invigilator allocation.
//!
//! `plan_date` is the pure greedy pass over one date; `Scheduler` wraps it
//! with loading, per-date serialization and the replace-on-commit cycle.

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::availability::is_available;
use crate::config::{EngineOptions, PriorPolicy};
use crate::error::{Error, Result, StoreError};
use crate::locks::DateLocks;
use crate::models::{
    Allocation, AllocationId, AllocationStatus, AllocationView, Constraints, DateCount, Exam,
    FacultyId, FacultyProfile, Slot,
};
use crate::roster::{resolve_profiles, roster_emails};
use crate::scoring::{candidate_score, pick_best};
use crate::store::{prior_records, DateCommit, LoadDelta, Store};

/// Output of one planning pass.
#[derive(Debug, Clone, Default)]
pub struct DatePlan {
    pub allocations: Vec<Allocation>,
    pub loads: Vec<LoadDelta>,
}

/// Mutable bookkeeping for a single planning pass.
#[derive(Debug, Default)]
struct RunState {
    taken_by_slot: HashMap<Slot, HashSet<FacultyId>>,
    taken_by_day: HashSet<FacultyId>,
    daily_counts: HashMap<FacultyId, i64>,
    current_loads: HashMap<FacultyId, i64>,
    run_counts: HashMap<FacultyId, i64>,
}

impl RunState {
    fn new(
        date: NaiveDate,
        profiles: &[FacultyProfile],
        prior: &[Allocation],
        prior_counts: &HashMap<FacultyId, i64>,
        policy: PriorPolicy,
    ) -> Self {
        let mut state = RunState::default();

        if policy == PriorPolicy::Exclude {
            for allocation in prior {
                if let Some(owner) = allocation.load_owner() {
                    state
                        .taken_by_slot
                        .entry(allocation.slot)
                        .or_default()
                        .insert(owner);
                    state.taken_by_day.insert(owner);
                }
            }
        }

        for profile in profiles {
            let prior_count = prior_counts.get(&profile.id).copied().unwrap_or(0);
            let cumulative = match policy {
                PriorPolicy::Exclude => profile.current_load,
                PriorPolicy::Release => (profile.current_load - prior_count).max(0),
            };
            state.current_loads.insert(profile.id, cumulative);
            state.daily_counts.insert(
                profile.id,
                daily_baseline(profile, date, prior_count),
            );
        }
        state
    }

    fn day_count(&self, id: FacultyId) -> i64 {
        self.daily_counts.get(&id).copied().unwrap_or(0)
    }

    fn cumulative(&self, id: FacultyId) -> i64 {
        self.current_loads.get(&id).copied().unwrap_or(0)
    }

    fn run_count(&self, id: FacultyId) -> i64 {
        self.run_counts.get(&id).copied().unwrap_or(0)
    }

    fn is_eligible(
        &self,
        profile: &FacultyProfile,
        date: NaiveDate,
        slot: Slot,
        constraints: &Constraints,
    ) -> bool {
        let cap = i64::from(constraints.max_hours_per_day);
        if cap > 0 && self.day_count(profile.id) >= cap {
            return false;
        }
        if !is_available(profile, date, slot) {
            return false;
        }
        if self
            .taken_by_slot
            .get(&slot)
            .is_some_and(|taken| taken.contains(&profile.id))
        {
            return false;
        }
        !(constraints.no_same_day_repeat && self.taken_by_day.contains(&profile.id))
    }

    fn record(&mut self, id: FacultyId, slot: Slot) {
        self.taken_by_slot.entry(slot).or_default().insert(id);
        self.taken_by_day.insert(id);
        *self.current_loads.entry(id).or_insert(0) += 1;
        *self.daily_counts.entry(id).or_insert(0) += 1;
        *self.run_counts.entry(id).or_insert(0) += 1;
    }
}

/// Stored daily count with the soon-to-be-replaced allocations taken out.
fn daily_baseline(profile: &FacultyProfile, date: NaiveDate, prior_count: i64) -> i64 {
    (profile.daily_load_on(date) - prior_count).max(0)
}

fn prior_counts(prior: &[Allocation]) -> HashMap<FacultyId, i64> {
    let mut counts = HashMap::new();
    for owner in prior.iter().filter_map(Allocation::load_owner) {
        *counts.entry(owner).or_insert(0) += 1;
    }
    counts
}

/// Greedily staffs every room unit of `exams` on `date`.
///
/// `profiles` is the resolved candidate list in tie-break order. `outsiders`
/// are owners of `prior` allocations who are not candidates this run; they
/// only receive counter corrections.
pub fn plan_date(
    date: NaiveDate,
    constraints: &Constraints,
    profiles: &[FacultyProfile],
    outsiders: &[FacultyProfile],
    exams: &[Exam],
    prior: &[Allocation],
    policy: PriorPolicy,
) -> DatePlan {
    let prior_counts = prior_counts(prior);
    let mut state = RunState::new(date, profiles, prior, &prior_counts, policy);
    let mut allocations = Vec::new();
    let created_at = Utc::now();

    for exam in exams {
        for room in &exam.rooms {
            let needed = room.needed_invigilators.max(1);
            for unit in 0..needed {
                let scores = profiles.iter().enumerate().filter_map(|(index, profile)| {
                    state
                        .is_eligible(profile, date, exam.slot, constraints)
                        .then(|| {
                            let score = candidate_score(
                                profile,
                                constraints,
                                state.cumulative(profile.id),
                                state.day_count(profile.id),
                            );
                            (index, score)
                        })
                });
                let chosen = pick_best(scores).map(|index| &profiles[index]);

                let (invigilator_id, status) = match chosen {
                    Some(profile) => {
                        state.record(profile.id, exam.slot);
                        debug!(
                            course = %exam.course_code,
                            classroom = %room.classroom_code,
                            unit,
                            faculty_id = %profile.id,
                            "Assigned invigilator"
                        );
                        (Some(profile.id), AllocationStatus::Assigned)
                    }
                    None => {
                        warn!(
                            course = %exam.course_code,
                            classroom = %room.classroom_code,
                            slot = %exam.slot,
                            unit,
                            "No eligible invigilator, leaving unit pending"
                        );
                        (None, AllocationStatus::Pending)
                    }
                };

                let position = allocations.len() as i32;
                allocations.push(Allocation {
                    id: Uuid::new_v4(),
                    exam_id: exam.id,
                    date,
                    slot: exam.slot,
                    classroom_code: room.classroom_code.clone(),
                    invigilator_id,
                    status,
                    position,
                    created_at,
                });
            }
        }
    }

    let mut loads = Vec::new();
    let mut seen = HashSet::new();
    for profile in profiles.iter().chain(outsiders) {
        if !seen.insert(profile.id) {
            continue;
        }
        let prior_count = prior_counts.get(&profile.id).copied().unwrap_or(0);
        let run_count = state.run_count(profile.id);
        let current_delta = run_count - prior_count;
        let daily_count = daily_baseline(profile, date, prior_count) + run_count;

        if current_delta != 0 || daily_count != profile.daily_load_on(date) {
            loads.push(LoadDelta {
                faculty_id: profile.id,
                current_delta,
                daily_count,
            });
        }
    }

    DatePlan { allocations, loads }
}

/// Allocation engine over a `Store`.
pub struct Scheduler<S> {
    store: S,
    locks: DateLocks,
    options: EngineOptions,
}

impl<S: Store> Scheduler<S> {
    pub fn new(store: S, options: EngineOptions) -> Self {
        Self {
            store,
            locks: DateLocks::new(),
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn locks(&self) -> &DateLocks {
        &self.locks
    }

    pub(crate) fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Replaces every allocation of `date` with a freshly planned set.
    #[instrument(skip_all, fields(%date))]
    pub async fn generate(&self, date: NaiveDate) -> Result<Vec<AllocationView>> {
        let _guard = self.locks.acquire(date).await;
        let attempts = self.options.commit_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let commit = self.plan_commit(date).await?;
            let created = commit.allocations.len();
            let pending = commit
                .allocations
                .iter()
                .filter(|a| a.status == AllocationStatus::Pending)
                .count();

            match self.store.replace_date(&commit).await {
                Ok(()) => {
                    info!(
                        replaced = commit.expected_prior.len(),
                        created,
                        pending,
                        load_updates = commit.loads.len(),
                        "Allocations generated"
                    );
                    break;
                }
                Err(StoreError::Stale { .. }) if attempt < attempts => {
                    warn!(attempt, "Allocations changed underneath generation, replanning");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.get_for_date(date).await
    }

    async fn plan_commit(&self, date: NaiveDate) -> Result<DateCommit> {
        let constraints = self.store.load_constraints().await?.unwrap_or_default();
        let roster = self.store.load_roster().await?;
        let emails = roster_emails(&roster);
        let accounts = if emails.is_empty() {
            Vec::new()
        } else {
            self.store.faculty_by_emails(&emails).await?
        };
        let profiles = resolve_profiles(&roster, accounts);
        let exams = self.store.exams_for_date(date).await?;
        let prior = self.store.allocations_for_date(date).await?;
        let outsiders = self.outside_owners(&profiles, &prior).await?;

        debug!(
            profiles = profiles.len(),
            exams = exams.len(),
            prior = prior.len(),
            "Planning allocations"
        );

        let plan = plan_date(
            date,
            &constraints,
            &profiles,
            &outsiders,
            &exams,
            &prior,
            self.options.prior_policy,
        );

        Ok(DateCommit {
            date,
            expected_prior: prior_records(&prior),
            allocations: plan.allocations,
            loads: plan.loads,
        })
    }

    async fn outside_owners(
        &self,
        profiles: &[FacultyProfile],
        prior: &[Allocation],
    ) -> Result<Vec<FacultyProfile>> {
        let candidates: HashSet<FacultyId> = profiles.iter().map(|p| p.id).collect();
        let mut missing: Vec<FacultyId> = prior
            .iter()
            .filter_map(Allocation::load_owner)
            .filter(|id| !candidates.contains(id))
            .collect();
        missing.sort();
        missing.dedup();

        let mut outsiders = Vec::with_capacity(missing.len());
        for id in missing {
            if let Some(profile) = self.store.faculty(id).await? {
                outsiders.push(profile);
            }
        }
        Ok(outsiders)
    }

    pub async fn get_for_date(&self, date: NaiveDate) -> Result<Vec<AllocationView>> {
        Ok(self.store.views_for_date(date).await?)
    }

    pub async fn get_allocation(&self, id: AllocationId) -> Result<AllocationView> {
        self.store.view(id).await?.ok_or(Error::NotFound {
            entity: "allocation",
            id,
        })
    }

    /// Deletes every allocation of `date` and takes their load back off
    /// the owners. Returns the number of records removed.
    #[instrument(skip_all, fields(%date))]
    pub async fn clear_date(&self, date: NaiveDate) -> Result<usize> {
        let _guard = self.locks.acquire(date).await;
        let prior = self.store.allocations_for_date(date).await?;
        if prior.is_empty() {
            return Ok(0);
        }

        let mut owners: Vec<(FacultyId, i64)> = prior_counts(&prior).into_iter().collect();
        owners.sort();
        let loads = owners
            .into_iter()
            .map(|(faculty_id, count)| LoadDelta {
                faculty_id,
                current_delta: -count,
                daily_count: 0,
            })
            .collect::<Vec<_>>();

        let commit = DateCommit {
            date,
            expected_prior: prior_records(&prior),
            allocations: Vec::new(),
            loads,
        };
        self.store.replace_date(&commit).await?;

        info!(
            deleted = prior.len(),
            adjusted = commit.loads.len(),
            "Allocations cleared"
        );
        Ok(prior.len())
    }

    pub async fn history(&self) -> Result<Vec<DateCount>> {
        Ok(self.store.history().await?)
    }

    /// Dates with at least one scheduled exam, ascending.
    pub async fn exam_dates(&self) -> Result<Vec<NaiveDate>> {
        Ok(self.store.exam_dates().await?)
    }
}
