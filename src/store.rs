//! Storage seam for the allocation engine.
//!
//! Reads are plain queries. The two write paths (`replace_date` and
//! `apply_reassignment`) must each be applied atomically by the backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StoreResult;
use crate::models::{
    Allocation, AllocationId, AllocationStatus, AllocationView, Constraints, DateCount, Exam,
    FacultyId, FacultyProfile, RosterEntry, Slot,
};

#[cfg(test)]
pub mod memory;

/// Counter change for one faculty after a date is regenerated or cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadDelta {
    pub faculty_id: FacultyId,
    /// Added to `current_load`.
    pub current_delta: i64,
    /// Overwrites `daily_load[date]`; zero removes the key.
    pub daily_count: i64,
}

/// An allocation's identity and ownership as seen when a plan was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorRecord {
    pub id: AllocationId,
    pub invigilator_id: Option<FacultyId>,
    pub status: AllocationStatus,
}

impl From<&Allocation> for PriorRecord {
    fn from(allocation: &Allocation) -> Self {
        Self {
            id: allocation.id,
            invigilator_id: allocation.invigilator_id,
            status: allocation.status,
        }
    }
}

/// Snapshot of `allocations` in the order `replace_date` compares them.
pub fn prior_records<'a, I>(allocations: I) -> Vec<PriorRecord>
where
    I: IntoIterator<Item = &'a Allocation>,
{
    let mut records: Vec<PriorRecord> = allocations.into_iter().map(PriorRecord::from).collect();
    records.sort_by_key(|r| r.id);
    records
}

/// Everything written when a date's allocations are replaced.
#[derive(Debug, Clone)]
pub struct DateCommit {
    pub date: NaiveDate,
    /// The allocations the plan was computed against, sorted by id.
    pub expected_prior: Vec<PriorRecord>,
    pub allocations: Vec<Allocation>,
    pub loads: Vec<LoadDelta>,
}

/// Relative counter change used by reassignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterShift {
    pub faculty_id: FacultyId,
    pub delta: i64,
}

#[derive(Debug, Clone)]
pub struct Reassignment {
    pub allocation_id: AllocationId,
    pub date: NaiveDate,
    pub slot: Slot,
    /// Owner and status observed when the change was planned.
    pub expected_owner: Option<FacultyId>,
    pub expected_status: AllocationStatus,
    pub new_owner: FacultyId,
    pub shifts: Vec<CounterShift>,
}

/// Absolute counters written by reconciliation.
///
/// The write only goes through while the stored counters still equal the
/// `seen_*` values they were computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub faculty_id: FacultyId,
    pub current_load: i64,
    pub daily_load: BTreeMap<NaiveDate, i64>,
    pub seen_current: i64,
    pub seen_daily: BTreeMap<NaiveDate, i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_constraints(&self) -> StoreResult<Option<Constraints>>;

    async fn load_roster(&self) -> StoreResult<Vec<RosterEntry>>;

    /// Accounts whose lowercased email is in `emails`, in directory order.
    async fn faculty_by_emails(&self, emails: &[String]) -> StoreResult<Vec<FacultyProfile>>;

    async fn faculty(&self, id: FacultyId) -> StoreResult<Option<FacultyProfile>>;

    async fn list_faculty(&self) -> StoreResult<Vec<FacultyProfile>>;

    async fn exams_for_date(&self, date: NaiveDate) -> StoreResult<Vec<Exam>>;

    /// Distinct dates that have at least one exam, ascending.
    async fn exam_dates(&self) -> StoreResult<Vec<NaiveDate>>;

    async fn allocations_for_date(&self, date: NaiveDate) -> StoreResult<Vec<Allocation>>;

    async fn list_allocations(&self) -> StoreResult<Vec<Allocation>>;

    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>>;

    async fn views_for_date(&self, date: NaiveDate) -> StoreResult<Vec<AllocationView>>;

    async fn view(&self, id: AllocationId) -> StoreResult<Option<AllocationView>>;

    /// Another active allocation held by `faculty_id` at (date, slot).
    async fn active_in_slot(
        &self,
        faculty_id: FacultyId,
        date: NaiveDate,
        slot: Slot,
        excluding: AllocationId,
    ) -> StoreResult<Option<AllocationId>>;

    /// Deletes the date's allocations, inserts the new ones and applies the
    /// counter deltas as one unit. Fails `Stale` when the stored records
    /// (id, owner, status) no longer match `expected_prior`.
    async fn replace_date(&self, commit: &DateCommit) -> StoreResult<()>;

    /// Moves an allocation to a new owner and shifts counters as one unit.
    async fn apply_reassignment(&self, change: &Reassignment) -> StoreResult<Allocation>;

    /// Writes every snapshot or none. Fails `CountersMoved` when a stored
    /// counter no longer equals its `seen_*` value.
    async fn overwrite_loads(&self, loads: &[LoadSnapshot]) -> StoreResult<()>;

    async fn history(&self) -> StoreResult<Vec<DateCount>>;
}
