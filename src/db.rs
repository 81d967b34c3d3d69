use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    Allocation, AllocationId, AllocationStatus, AllocationView, AvailabilityRule, Constraints,
    DateCount, Exam, ExamRoom, FacultyId, FacultyProfile, InvigilatorSummary, RosterEntry, Slot,
};
use crate::store::{DateCommit, LoadSnapshot, PriorRecord, Reassignment, Store};

const SETTINGS_KEY: &str = "global";

const FACULTY_COLUMNS: &str = "id, name, email, department, designation, availability, \
     max_hours_per_day, weekly_cap, current_load, daily_load";

const ALLOCATION_COLUMNS: &str = "a.id, a.exam_id, a.alloc_date, a.slot, a.classroom_code, \
     a.invigilator_id, a.status, a.position, a.created_at";

pub async fn init_db(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> StoreResult<T> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| StoreError::Malformed(format!("{column} = '{raw}'")))
}

fn faculty_from_row(row: &PgRow) -> StoreResult<FacultyProfile> {
    let availability: Json<Vec<AvailabilityRule>> = row.try_get("availability")?;
    let daily_load: Json<BTreeMap<NaiveDate, i64>> = row.try_get("daily_load")?;
    Ok(FacultyProfile {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        department: row.try_get("department")?,
        designation: row.try_get("designation")?,
        availability: availability.0,
        max_hours_per_day: row.try_get("max_hours_per_day")?,
        weekly_cap: row.try_get("weekly_cap")?,
        current_load: row.try_get("current_load")?,
        daily_load: daily_load.0,
    })
}

fn allocation_from_row(row: &PgRow) -> StoreResult<Allocation> {
    Ok(Allocation {
        id: row.try_get("id")?,
        exam_id: row.try_get("exam_id")?,
        date: row.try_get("alloc_date")?,
        slot: parse_column(row, "slot")?,
        classroom_code: row.try_get("classroom_code")?,
        invigilator_id: row.try_get("invigilator_id")?,
        status: parse_column(row, "status")?,
        position: row.try_get("position")?,
        created_at: row.try_get("created_at")?,
    })
}

fn view_from_row(row: &PgRow) -> StoreResult<AllocationView> {
    let allocation = allocation_from_row(row)?;
    let invigilator = match row.try_get::<Option<String>, _>("inv_name")? {
        Some(name) => Some(InvigilatorSummary {
            name,
            email: row.try_get("inv_email")?,
            department: row.try_get("inv_department")?,
            designation: row.try_get("inv_designation")?,
        }),
        None => None,
    };
    Ok(AllocationView {
        allocation,
        invigilator,
    })
}

fn view_query(filter: &str) -> String {
    format!(
        "SELECT {ALLOCATION_COLUMNS}, f.name AS inv_name, f.email AS inv_email, \
         f.department AS inv_department, f.designation AS inv_designation \
         FROM invigilation.allocations a \
         LEFT JOIN invigilation.faculty f ON f.id = a.invigilator_id \
         WHERE {filter} \
         ORDER BY a.position"
    )
}

fn active_statuses() -> Vec<&'static str> {
    AllocationStatus::ALL
        .into_iter()
        .filter(|status| status.is_active())
        .map(AllocationStatus::as_str)
        .collect()
}

async fn find_slot_conflict(
    tx: &mut Transaction<'_, Postgres>,
    faculty_id: FacultyId,
    date: NaiveDate,
    slot: Slot,
    excluding: AllocationId,
) -> StoreResult<Option<AllocationId>> {
    let existing: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM invigilation.allocations
        WHERE alloc_date = $1 AND slot = $2 AND invigilator_id = $3
          AND id <> $4 AND status = ANY($5)
        LIMIT 1
        "#,
    )
    .bind(date)
    .bind(slot.as_str())
    .bind(faculty_id)
    .bind(excluding)
    .bind(active_statuses())
    .fetch_optional(&mut **tx)
    .await?;
    Ok(existing)
}

async fn lock_date(tx: &mut Transaction<'_, Postgres>, date: NaiveDate) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("invigilation:{date}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn load_constraints(&self) -> StoreResult<Option<Constraints>> {
        let row: Option<Json<Constraints>> = sqlx::query_scalar(
            "SELECT constraints FROM invigilation.settings WHERE key = $1",
        )
        .bind(SETTINGS_KEY)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|json| json.0))
    }

    async fn load_roster(&self) -> StoreResult<Vec<RosterEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT name, email, department, designation, availability,
                   max_hours_per_day, weekly_cap
            FROM invigilation.faculty_roster
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut roster = Vec::with_capacity(rows.len());
        for row in rows {
            let availability: Option<Json<Vec<AvailabilityRule>>> =
                row.try_get("availability")?;
            roster.push(RosterEntry {
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                department: row.try_get("department")?,
                designation: row.try_get("designation")?,
                availability: availability.map(|json| json.0),
                max_hours_per_day: row.try_get("max_hours_per_day")?,
                weekly_cap: row.try_get("weekly_cap")?,
            });
        }
        Ok(roster)
    }

    async fn faculty_by_emails(&self, emails: &[String]) -> StoreResult<Vec<FacultyProfile>> {
        let query = format!(
            "SELECT {FACULTY_COLUMNS} FROM invigilation.faculty \
             WHERE lower(email) = ANY($1) ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(emails)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(faculty_from_row).collect()
    }

    async fn faculty(&self, id: FacultyId) -> StoreResult<Option<FacultyProfile>> {
        let query = format!("SELECT {FACULTY_COLUMNS} FROM invigilation.faculty WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(faculty_from_row).transpose()
    }

    async fn list_faculty(&self) -> StoreResult<Vec<FacultyProfile>> {
        let query = format!(
            "SELECT {FACULTY_COLUMNS} FROM invigilation.faculty ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(faculty_from_row).collect()
    }

    async fn exams_for_date(&self, date: NaiveDate) -> StoreResult<Vec<Exam>> {
        let rows = sqlx::query(
            r#"
            SELECT id, course_code, course_name, exam_date, slot, rooms
            FROM invigilation.exams
            WHERE exam_date = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        let mut exams = Vec::with_capacity(rows.len());
        for row in rows {
            let rooms: Json<Vec<ExamRoom>> = row.try_get("rooms")?;
            exams.push(Exam {
                id: row.try_get("id")?,
                course_code: row.try_get("course_code")?,
                course_name: row.try_get("course_name")?,
                date: row.try_get("exam_date")?,
                slot: parse_column(&row, "slot")?,
                rooms: rooms.0,
            });
        }
        Ok(exams)
    }

    async fn exam_dates(&self) -> StoreResult<Vec<NaiveDate>> {
        let dates = sqlx::query_scalar(
            "SELECT DISTINCT exam_date FROM invigilation.exams ORDER BY exam_date",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(dates)
    }

    async fn allocations_for_date(&self, date: NaiveDate) -> StoreResult<Vec<Allocation>> {
        let query = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM invigilation.allocations a \
             WHERE a.alloc_date = $1 ORDER BY a.position"
        );
        let rows = sqlx::query(&query)
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(allocation_from_row).collect()
    }

    async fn list_allocations(&self) -> StoreResult<Vec<Allocation>> {
        let query = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM invigilation.allocations a \
             ORDER BY a.alloc_date, a.position"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(allocation_from_row).collect()
    }

    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        let query = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM invigilation.allocations a WHERE a.id = $1"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(allocation_from_row).transpose()
    }

    async fn views_for_date(&self, date: NaiveDate) -> StoreResult<Vec<AllocationView>> {
        let rows = sqlx::query(&view_query("a.alloc_date = $1"))
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(view_from_row).collect()
    }

    async fn view(&self, id: AllocationId) -> StoreResult<Option<AllocationView>> {
        let row = sqlx::query(&view_query("a.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(view_from_row).transpose()
    }

    async fn active_in_slot(
        &self,
        faculty_id: FacultyId,
        date: NaiveDate,
        slot: Slot,
        excluding: AllocationId,
    ) -> StoreResult<Option<AllocationId>> {
        let mut tx = self.pool.begin().await?;
        let existing = find_slot_conflict(&mut tx, faculty_id, date, slot, excluding).await?;
        tx.commit().await?;
        Ok(existing)
    }

    async fn replace_date(&self, commit: &DateCommit) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_date(&mut tx, commit.date).await?;

        let rows = sqlx::query(
            "SELECT id, invigilator_id, status FROM invigilation.allocations \
             WHERE alloc_date = $1 FOR UPDATE",
        )
        .bind(commit.date)
        .fetch_all(&mut *tx)
        .await?;
        let mut current = Vec::with_capacity(rows.len());
        for row in &rows {
            current.push(PriorRecord {
                id: row.try_get("id")?,
                invigilator_id: row.try_get("invigilator_id")?,
                status: parse_column(row, "status")?,
            });
        }
        current.sort_by_key(|r| r.id);
        if current != commit.expected_prior {
            // Dropping the transaction rolls it back.
            return Err(StoreError::Stale { date: commit.date });
        }

        sqlx::query("DELETE FROM invigilation.allocations WHERE alloc_date = $1")
            .bind(commit.date)
            .execute(&mut *tx)
            .await?;

        for allocation in &commit.allocations {
            sqlx::query(
                r#"
                INSERT INTO invigilation.allocations
                (id, exam_id, alloc_date, slot, classroom_code, invigilator_id, status, position, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(allocation.id)
            .bind(allocation.exam_id)
            .bind(allocation.date)
            .bind(allocation.slot.as_str())
            .bind(&allocation.classroom_code)
            .bind(allocation.invigilator_id)
            .bind(allocation.status.as_str())
            .bind(allocation.position)
            .bind(allocation.created_at)
            .execute(&mut *tx)
            .await?;
        }

        let date_key = commit.date.to_string();
        for load in &commit.loads {
            sqlx::query(
                r#"
                UPDATE invigilation.faculty
                SET current_load = current_load + $2,
                    daily_load = CASE
                        WHEN $4::BIGINT = 0 THEN daily_load - $3::TEXT
                        ELSE jsonb_set(daily_load, ARRAY[$3::TEXT], to_jsonb($4::BIGINT))
                    END
                WHERE id = $1
                "#,
            )
            .bind(load.faculty_id)
            .bind(load.current_delta)
            .bind(&date_key)
            .bind(load.daily_count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn apply_reassignment(&self, change: &Reassignment) -> StoreResult<Allocation> {
        let mut tx = self.pool.begin().await?;
        lock_date(&mut tx, change.date).await?;

        let query = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM invigilation.allocations a \
             WHERE a.id = $1 FOR UPDATE"
        );
        let current = sqlx::query(&query)
            .bind(change.allocation_id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(allocation_from_row)
            .transpose()?
            .ok_or(StoreError::Stale { date: change.date })?;
        if current.invigilator_id != change.expected_owner
            || current.status != change.expected_status
        {
            return Err(StoreError::Stale { date: change.date });
        }

        if let Some(existing) = find_slot_conflict(
            &mut tx,
            change.new_owner,
            change.date,
            change.slot,
            change.allocation_id,
        )
        .await?
        {
            return Err(StoreError::SlotTaken {
                faculty_id: change.new_owner,
                existing,
            });
        }

        let update = format!(
            "UPDATE invigilation.allocations a SET invigilator_id = $2, status = 'assigned' \
             WHERE a.id = $1 RETURNING {ALLOCATION_COLUMNS}"
        );
        let row = sqlx::query(&update)
            .bind(change.allocation_id)
            .bind(change.new_owner)
            .fetch_one(&mut *tx)
            .await?;
        let updated = allocation_from_row(&row)?;

        let date_key = change.date.to_string();
        for shift in &change.shifts {
            sqlx::query(
                r#"
                UPDATE invigilation.faculty
                SET current_load = current_load + $2,
                    daily_load = CASE
                        WHEN COALESCE((daily_load ->> $3::TEXT)::BIGINT, 0) + $2 <= 0
                            THEN daily_load - $3::TEXT
                        ELSE jsonb_set(
                            daily_load,
                            ARRAY[$3::TEXT],
                            to_jsonb(COALESCE((daily_load ->> $3::TEXT)::BIGINT, 0) + $2)
                        )
                    END
                WHERE id = $1
                "#,
            )
            .bind(shift.faculty_id)
            .bind(shift.delta)
            .bind(&date_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn overwrite_loads(&self, loads: &[LoadSnapshot]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for load in loads {
            let updated = sqlx::query(
                r#"
                UPDATE invigilation.faculty
                SET current_load = $2, daily_load = $3
                WHERE id = $1 AND current_load = $4 AND daily_load = $5
                "#,
            )
            .bind(load.faculty_id)
            .bind(load.current_load)
            .bind(Json(&load.daily_load))
            .bind(load.seen_current)
            .bind(Json(&load.seen_daily))
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() != 1 {
                return Err(StoreError::CountersMoved {
                    faculty_id: load.faculty_id,
                });
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn history(&self) -> StoreResult<Vec<DateCount>> {
        let rows = sqlx::query(
            r#"
            SELECT alloc_date, COUNT(*) AS allocation_count
            FROM invigilation.allocations
            GROUP BY alloc_date
            ORDER BY alloc_date DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            history.push(DateCount {
                date: row.try_get("alloc_date")?,
                count: row.try_get("allocation_count")?,
            });
        }
        Ok(history)
    }
}

/// Loads a small, realistic data set for trying the allocator out.
pub async fn seed(pool: &PgPool) -> StoreResult<()> {
    let mut tx = pool.begin().await?;

    let constraints = Constraints {
        max_hours_per_day: 2,
        no_same_day_repeat: true,
        department_weighting: [("CSE".to_string(), 1.2)].into_iter().collect(),
        designation_weighting: [("Professor".to_string(), 0.8)].into_iter().collect(),
    };
    sqlx::query(
        r#"
        INSERT INTO invigilation.settings (key, constraints)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE
        SET constraints = EXCLUDED.constraints, updated_at = now()
        "#,
    )
    .bind(SETTINGS_KEY)
    .bind(Json(&constraints))
    .execute(&mut *tx)
    .await?;

    let thursday = vec![AvailabilityRule {
        date: None,
        day_of_week: Some(4),
        slots: vec![Slot::Forenoon, Slot::Afternoon],
    }];
    let faculty = vec![
        (
            Uuid::parse_str("6f1c2b1e-8a3d-4c55-9d0e-2b7f4e9a1c01").map_err(malformed)?,
            "Meera Iyer",
            "meera.iyer@college.edu",
            "CSE",
            "Assistant Professor",
            Vec::new(),
        ),
        (
            Uuid::parse_str("0a9e7d3c-5b21-4f86-8c4d-7e1a2f3b4c02").map_err(malformed)?,
            "Arjun Rao",
            "arjun.rao@college.edu",
            "ECE",
            "Professor",
            thursday.clone(),
        ),
        (
            Uuid::parse_str("c3d4e5f6-1a2b-4c3d-9e8f-0a1b2c3d4e03").map_err(malformed)?,
            "Fatima Sheikh",
            "fatima.sheikh@college.edu",
            "Mathematics",
            "Associate Professor",
            Vec::new(),
        ),
    ];

    for (id, name, email, department, designation, availability) in faculty {
        sqlx::query(
            r#"
            INSERT INTO invigilation.faculty
            (id, name, email, department, designation, availability)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, department = EXCLUDED.department,
                designation = EXCLUDED.designation, availability = EXCLUDED.availability
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(department)
        .bind(designation)
        .bind(Json(&availability))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO invigilation.faculty_roster (id, name, email, department, designation)
            SELECT $1, $2, $3, $4, $5
            WHERE NOT EXISTS (
                SELECT 1 FROM invigilation.faculty_roster WHERE lower(email) = lower($3)
            )
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(email)
        .bind(department)
        .bind(designation)
        .execute(&mut *tx)
        .await?;
    }

    let exam_date = NaiveDate::from_ymd_opt(2025, 11, 20)
        .ok_or_else(|| StoreError::Malformed("invalid seed date".to_string()))?;
    let exams = vec![
        (
            Uuid::parse_str("e1a2b3c4-d5e6-4f70-8a9b-0c1d2e3f4a01").map_err(malformed)?,
            "CS101",
            "Programming Fundamentals",
            Slot::Forenoon,
            vec![("A101", 2), ("A102", 1)],
        ),
        (
            Uuid::parse_str("e1a2b3c4-d5e6-4f70-8a9b-0c1d2e3f4a02").map_err(malformed)?,
            "MA201",
            "Linear Algebra",
            Slot::Afternoon,
            vec![("B201", 1)],
        ),
    ];

    for (id, code, name, slot, rooms) in exams {
        let rooms: Vec<ExamRoom> = rooms
            .into_iter()
            .map(|(classroom_code, needed)| ExamRoom {
                classroom_code: classroom_code.to_string(),
                needed_invigilators: needed,
            })
            .collect();
        sqlx::query(
            r#"
            INSERT INTO invigilation.exams (id, course_code, course_name, exam_date, slot, rooms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(code)
        .bind(name)
        .bind(exam_date)
        .bind(slot.as_str())
        .bind(Json(&rooms))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn malformed(err: uuid::Error) -> StoreError {
    StoreError::Malformed(err.to_string())
}
