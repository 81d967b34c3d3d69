use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

pub type FacultyId = Uuid;
pub type ExamId = Uuid;
pub type AllocationId = Uuid;

/// Coarse time-of-day period of an exam. Slots never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    #[serde(rename = "FN")]
    Forenoon,
    #[serde(rename = "AN")]
    Afternoon,
    #[serde(rename = "EV")]
    Evening,
}

impl Slot {
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Forenoon => "FN",
            Slot::Afternoon => "AN",
            Slot::Evening => "EV",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "FN" => Ok(Slot::Forenoon),
            "AN" => Ok(Slot::Afternoon),
            "EV" => Ok(Slot::Evening),
            other => Err(Error::Validation(format!("unknown slot '{other}'"))),
        }
    }
}

/// One availability window: either a specific date or a weekday
/// (0 = Sunday through 6 = Saturday), plus the slots allowed on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    #[serde(default)]
    pub slots: Vec<Slot>,
}

/// A faculty member as seen by one allocation run.
#[derive(Debug, Clone, PartialEq)]
pub struct FacultyProfile {
    pub id: FacultyId,
    pub name: String,
    pub email: String,
    pub department: String,
    pub designation: String,
    pub availability: Vec<AvailabilityRule>,
    pub max_hours_per_day: i32,
    /// Carried for callers; the generator does not enforce it.
    pub weekly_cap: i32,
    pub current_load: i64,
    pub daily_load: BTreeMap<NaiveDate, i64>,
}

impl FacultyProfile {
    pub fn daily_load_on(&self, date: NaiveDate) -> i64 {
        self.daily_load.get(&date).copied().unwrap_or(0)
    }
}

/// An uploaded roster row. Every field except identity is an optional override.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterEntry {
    pub name: String,
    pub email: String,
    pub department: Option<String>,
    pub designation: Option<String>,
    pub availability: Option<Vec<AvailabilityRule>>,
    pub max_hours_per_day: Option<i32>,
    pub weekly_cap: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRoom {
    pub classroom_code: String,
    #[serde(default = "default_needed")]
    pub needed_invigilators: i32,
}

fn default_needed() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exam {
    pub id: ExamId,
    pub course_code: String,
    pub course_name: String,
    pub date: NaiveDate,
    pub slot: Slot,
    pub rooms: Vec<ExamRoom>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Assigned,
    Pending,
    Replaced,
    Cancelled,
}

impl AllocationStatus {
    pub const ALL: [AllocationStatus; 4] = [
        AllocationStatus::Assigned,
        AllocationStatus::Pending,
        AllocationStatus::Replaced,
        AllocationStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Assigned => "assigned",
            AllocationStatus::Pending => "pending",
            AllocationStatus::Replaced => "replaced",
            AllocationStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that block the owner from taking another room in the same slot.
    pub fn is_active(self) -> bool {
        matches!(self, AllocationStatus::Assigned | AllocationStatus::Pending)
    }

    /// Statuses counted into an owner's load counters.
    pub fn is_load_bearing(self) -> bool {
        self != AllocationStatus::Cancelled
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "assigned" => Ok(AllocationStatus::Assigned),
            "pending" => Ok(AllocationStatus::Pending),
            "replaced" => Ok(AllocationStatus::Replaced),
            "cancelled" => Ok(AllocationStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown allocation status '{other}'"))),
        }
    }
}

/// Binding of one invigilator to one (date, slot, classroom).
///
/// Unstaffed units are recorded as `Pending` with no owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub id: AllocationId,
    pub exam_id: ExamId,
    pub date: NaiveDate,
    pub slot: Slot,
    pub classroom_code: String,
    pub invigilator_id: Option<FacultyId>,
    pub status: AllocationStatus,
    /// Emission order within the date: exam, then room, then unit.
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    /// The owner whose counters this record contributes to, if any.
    pub fn load_owner(&self) -> Option<FacultyId> {
        self.invigilator_id
            .filter(|_| self.status.is_load_bearing())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvigilatorSummary {
    pub name: String,
    pub email: String,
    pub department: String,
    pub designation: String,
}

impl From<&FacultyProfile> for InvigilatorSummary {
    fn from(profile: &FacultyProfile) -> Self {
        Self {
            name: profile.name.clone(),
            email: profile.email.clone(),
            department: profile.department.clone(),
            designation: profile.designation.clone(),
        }
    }
}

/// An allocation joined with its owner's identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationView {
    #[serde(flatten)]
    pub allocation: Allocation,
    pub invigilator: Option<InvigilatorSummary>,
}

/// Global allocation constraints, stored as a singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Constraints {
    /// Per-day assignment cap; 0 disables it.
    pub max_hours_per_day: i32,
    pub no_same_day_repeat: bool,
    pub department_weighting: HashMap<String, f64>,
    pub designation_weighting: HashMap<String, f64>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_hours_per_day: 0,
            no_same_day_repeat: true,
            department_weighting: HashMap::new(),
            designation_weighting: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// Parses a `YYYY-MM-DD` exam date.
pub fn parse_date(value: &str) -> Result<NaiveDate, Error> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("date is required (YYYY-MM-DD)".to_string()));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|e| Error::Validation(format!("invalid date '{trimmed}': {e}")))
}
