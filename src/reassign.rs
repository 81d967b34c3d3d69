use tracing::{info, instrument};

use crate::allocator::Scheduler;
use crate::error::{Error, Result, StoreError};
use crate::models::{Allocation, AllocationId, FacultyId};
use crate::store::{CounterShift, Reassignment, Store};

/// Counter moves for handing `current` to `new_owner`.
fn counter_shifts(current: &Allocation, new_owner: FacultyId) -> Vec<CounterShift> {
    let vacated = current.load_owner();
    if vacated == Some(new_owner) {
        return Vec::new();
    }

    let mut shifts = Vec::with_capacity(2);
    if let Some(previous) = vacated {
        shifts.push(CounterShift {
            faculty_id: previous,
            delta: -1,
        });
    }
    shifts.push(CounterShift {
        faculty_id: new_owner,
        delta: 1,
    });
    shifts
}

impl<S: Store> Scheduler<S> {
    /// Hands one allocation to another faculty member.
    ///
    /// The target may not hold any other active allocation in the same
    /// date and slot. Both owners' counters move with the record.
    #[instrument(skip_all, fields(%allocation_id, %to_faculty_id))]
    pub async fn reassign(
        &self,
        allocation_id: AllocationId,
        to_faculty_id: FacultyId,
    ) -> Result<Allocation> {
        if to_faculty_id.is_nil() {
            return Err(Error::Validation("target faculty id is required".to_string()));
        }

        let date = self
            .store()
            .allocation(allocation_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "allocation",
                id: allocation_id,
            })?
            .date;
        let _guard = self.locks().acquire(date).await;

        // Re-read under the date lock; a regeneration may have replaced it.
        let current = self
            .store()
            .allocation(allocation_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "allocation",
                id: allocation_id,
            })?;
        let target = self
            .store()
            .faculty(to_faculty_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "faculty",
                id: to_faculty_id,
            })?;

        if let Some(existing) = self
            .store()
            .active_in_slot(target.id, current.date, current.slot, current.id)
            .await?
        {
            return Err(Error::Conflict {
                faculty_id: target.id,
                date: current.date,
                slot: current.slot,
                existing,
            });
        }

        let change = Reassignment {
            allocation_id: current.id,
            date: current.date,
            slot: current.slot,
            expected_owner: current.invigilator_id,
            expected_status: current.status,
            new_owner: target.id,
            shifts: counter_shifts(&current, target.id),
        };

        let updated = match self.store().apply_reassignment(&change).await {
            Ok(updated) => updated,
            Err(StoreError::SlotTaken {
                faculty_id,
                existing,
            }) => {
                return Err(Error::Conflict {
                    faculty_id,
                    date: current.date,
                    slot: current.slot,
                    existing,
                })
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            date = %updated.date,
            slot = %updated.slot,
            classroom = %updated.classroom_code,
            previous = ?current.invigilator_id,
            "Allocation reassigned"
        );
        Ok(updated)
    }
}
