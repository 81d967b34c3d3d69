//! In-memory `Store` used by the engine tests.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use super::{prior_records, DateCommit, LoadSnapshot, Reassignment, Store};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Allocation, AllocationId, AllocationStatus, AllocationView, Constraints, DateCount, Exam,
    FacultyId, FacultyProfile, InvigilatorSummary, RosterEntry, Slot,
};

#[derive(Debug, Default)]
struct State {
    constraints: Option<Constraints>,
    roster: Vec<RosterEntry>,
    faculty: Vec<FacultyProfile>,
    exams: Vec<Exam>,
    allocations: Vec<Allocation>,
    /// Writes still to be raced by a simulated concurrent writer.
    interference: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_constraints(&self, constraints: Constraints) {
        self.lock().constraints = Some(constraints);
    }

    pub fn add_faculty(&self, profile: FacultyProfile) {
        self.lock().faculty.push(profile);
    }

    pub fn add_roster(&self, entry: RosterEntry) {
        self.lock().roster.push(entry);
    }

    pub fn add_exam(&self, exam: Exam) {
        self.lock().exams.push(exam);
    }

    pub fn insert_allocation(&self, allocation: Allocation) {
        self.lock().allocations.push(allocation);
    }

    /// Makes the next `writes` calls to `replace_date` or `overwrite_loads`
    /// observe a concurrent change just before they check their snapshot.
    pub fn interfere_with_next_writes(&self, writes: usize) {
        self.lock().interference = writes;
    }

    fn take_interference(state: &mut State) -> bool {
        if state.interference == 0 {
            return false;
        }
        state.interference -= 1;
        true
    }

    pub fn snapshot_faculty(&self, id: FacultyId) -> Option<FacultyProfile> {
        self.lock().faculty.iter().find(|f| f.id == id).cloned()
    }

    fn join(state: &State, allocation: &Allocation) -> AllocationView {
        let invigilator = allocation.invigilator_id.and_then(|id| {
            state
                .faculty
                .iter()
                .find(|f| f.id == id)
                .map(InvigilatorSummary::from)
        });
        AllocationView {
            allocation: allocation.clone(),
            invigilator,
        }
    }

    fn sorted_for_date(state: &State, date: NaiveDate) -> Vec<Allocation> {
        let mut rows: Vec<Allocation> = state
            .allocations
            .iter()
            .filter(|a| a.date == date)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.position);
        rows
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_constraints(&self) -> StoreResult<Option<Constraints>> {
        Ok(self.lock().constraints.clone())
    }

    async fn load_roster(&self) -> StoreResult<Vec<RosterEntry>> {
        Ok(self.lock().roster.clone())
    }

    async fn faculty_by_emails(&self, emails: &[String]) -> StoreResult<Vec<FacultyProfile>> {
        Ok(self
            .lock()
            .faculty
            .iter()
            .filter(|f| emails.contains(&f.email.to_lowercase()))
            .cloned()
            .collect())
    }

    async fn faculty(&self, id: FacultyId) -> StoreResult<Option<FacultyProfile>> {
        Ok(self.snapshot_faculty(id))
    }

    async fn list_faculty(&self) -> StoreResult<Vec<FacultyProfile>> {
        Ok(self.lock().faculty.clone())
    }

    async fn exams_for_date(&self, date: NaiveDate) -> StoreResult<Vec<Exam>> {
        Ok(self
            .lock()
            .exams
            .iter()
            .filter(|e| e.date == date)
            .cloned()
            .collect())
    }

    async fn exam_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let dates: BTreeSet<NaiveDate> = self.lock().exams.iter().map(|e| e.date).collect();
        Ok(dates.into_iter().collect())
    }

    async fn allocations_for_date(&self, date: NaiveDate) -> StoreResult<Vec<Allocation>> {
        Ok(Self::sorted_for_date(&self.lock(), date))
    }

    async fn list_allocations(&self) -> StoreResult<Vec<Allocation>> {
        Ok(self.lock().allocations.clone())
    }

    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        Ok(self.lock().allocations.iter().find(|a| a.id == id).cloned())
    }

    async fn views_for_date(&self, date: NaiveDate) -> StoreResult<Vec<AllocationView>> {
        let state = self.lock();
        Ok(Self::sorted_for_date(&state, date)
            .iter()
            .map(|a| Self::join(&state, a))
            .collect())
    }

    async fn view(&self, id: AllocationId) -> StoreResult<Option<AllocationView>> {
        let state = self.lock();
        Ok(state
            .allocations
            .iter()
            .find(|a| a.id == id)
            .map(|a| Self::join(&state, a)))
    }

    async fn active_in_slot(
        &self,
        faculty_id: FacultyId,
        date: NaiveDate,
        slot: Slot,
        excluding: AllocationId,
    ) -> StoreResult<Option<AllocationId>> {
        Ok(self
            .lock()
            .allocations
            .iter()
            .find(|a| {
                a.id != excluding
                    && a.date == date
                    && a.slot == slot
                    && a.invigilator_id == Some(faculty_id)
                    && a.status.is_active()
            })
            .map(|a| a.id))
    }

    async fn replace_date(&self, commit: &DateCommit) -> StoreResult<()> {
        let mut state = self.lock();

        if Self::take_interference(&mut state) {
            let position = state.allocations.len() as i32;
            state.allocations.push(Allocation {
                id: Uuid::new_v4(),
                exam_id: Uuid::new_v4(),
                date: commit.date,
                slot: Slot::Evening,
                classroom_code: "X0".to_string(),
                invigilator_id: None,
                status: AllocationStatus::Pending,
                position,
                created_at: Utc::now(),
            });
        }

        let current = prior_records(state.allocations.iter().filter(|a| a.date == commit.date));
        if current != commit.expected_prior {
            return Err(StoreError::Stale { date: commit.date });
        }

        state.allocations.retain(|a| a.date != commit.date);
        state.allocations.extend(commit.allocations.iter().cloned());

        for delta in &commit.loads {
            let Some(faculty) = state.faculty.iter_mut().find(|f| f.id == delta.faculty_id)
            else {
                continue;
            };
            faculty.current_load += delta.current_delta;
            if delta.daily_count == 0 {
                faculty.daily_load.remove(&commit.date);
            } else {
                faculty.daily_load.insert(commit.date, delta.daily_count);
            }
        }
        Ok(())
    }

    async fn apply_reassignment(&self, change: &Reassignment) -> StoreResult<Allocation> {
        let mut state = self.lock();

        let conflict = state.allocations.iter().find(|a| {
            a.id != change.allocation_id
                && a.date == change.date
                && a.slot == change.slot
                && a.invigilator_id == Some(change.new_owner)
                && a.status.is_active()
        });
        if let Some(existing) = conflict {
            return Err(StoreError::SlotTaken {
                faculty_id: change.new_owner,
                existing: existing.id,
            });
        }

        let allocation = state
            .allocations
            .iter_mut()
            .find(|a| a.id == change.allocation_id)
            .ok_or(StoreError::Stale { date: change.date })?;
        if allocation.invigilator_id != change.expected_owner
            || allocation.status != change.expected_status
        {
            return Err(StoreError::Stale { date: change.date });
        }
        allocation.invigilator_id = Some(change.new_owner);
        allocation.status = AllocationStatus::Assigned;
        let updated = allocation.clone();

        for shift in &change.shifts {
            if let Some(faculty) = state.faculty.iter_mut().find(|f| f.id == shift.faculty_id) {
                faculty.current_load += shift.delta;
                let day = faculty.daily_load.entry(change.date).or_insert(0);
                *day = (*day + shift.delta).max(0);
                if *day == 0 {
                    faculty.daily_load.remove(&change.date);
                }
            }
        }
        Ok(updated)
    }

    async fn overwrite_loads(&self, loads: &[LoadSnapshot]) -> StoreResult<()> {
        let mut state = self.lock();

        if Self::take_interference(&mut state) {
            if let Some(first) = loads.first() {
                if let Some(faculty) = state.faculty.iter_mut().find(|f| f.id == first.faculty_id) {
                    faculty.current_load += 1;
                }
            }
        }

        for load in loads {
            let unchanged = state.faculty.iter().any(|f| {
                f.id == load.faculty_id
                    && f.current_load == load.seen_current
                    && f.daily_load == load.seen_daily
            });
            if !unchanged {
                return Err(StoreError::CountersMoved {
                    faculty_id: load.faculty_id,
                });
            }
        }
        for load in loads {
            if let Some(faculty) = state.faculty.iter_mut().find(|f| f.id == load.faculty_id) {
                faculty.current_load = load.current_load;
                faculty.daily_load = load.daily_load.clone();
            }
        }
        Ok(())
    }

    async fn history(&self) -> StoreResult<Vec<DateCount>> {
        let state = self.lock();
        let mut counts = std::collections::BTreeMap::<NaiveDate, i64>::new();
        for allocation in &state.allocations {
            *counts.entry(allocation.date).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .rev()
            .map(|(date, count)| DateCount { date, count })
            .collect())
    }
}
