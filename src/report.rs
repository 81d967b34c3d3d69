use std::collections::BTreeMap;
use std::fmt::Write;
use std::io;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{AllocationStatus, AllocationView, Slot};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSummary {
    pub assigned: usize,
    pub pending: usize,
    pub other: usize,
}

pub fn summarize_by_slot(views: &[AllocationView]) -> BTreeMap<Slot, SlotSummary> {
    let mut map: BTreeMap<Slot, SlotSummary> = BTreeMap::new();

    for view in views {
        let entry = map.entry(view.allocation.slot).or_default();
        match view.allocation.status {
            AllocationStatus::Assigned => entry.assigned += 1,
            AllocationStatus::Pending => entry.pending += 1,
            _ => entry.other += 1,
        }
    }
    map
}

pub fn build_report(date: NaiveDate, views: &[AllocationView]) -> String {
    let summaries = summarize_by_slot(views);

    let mut output = String::new();
    let _ = writeln!(output, "# Invigilation Schedule");
    let _ = writeln!(output, "Allocations for {date}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Staffing by Slot");

    if summaries.is_empty() {
        let _ = writeln!(output, "No allocations recorded for this date.");
    } else {
        for (slot, summary) in &summaries {
            let _ = write!(
                output,
                "- {}: {} assigned, {} pending",
                slot, summary.assigned, summary.pending
            );
            if summary.other > 0 {
                let _ = write!(output, ", {} replaced or cancelled", summary.other);
            }
            let _ = writeln!(output);
        }
    }

    let unstaffed: Vec<&AllocationView> = views
        .iter()
        .filter(|v| v.allocation.status == AllocationStatus::Pending)
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Unstaffed Rooms");

    if unstaffed.is_empty() {
        let _ = writeln!(output, "Every room is staffed.");
    } else {
        for view in unstaffed {
            let _ = writeln!(
                output,
                "- {} ({})",
                view.allocation.classroom_code, view.allocation.slot
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Invigilators");

    let staffed: Vec<&AllocationView> = views
        .iter()
        .filter(|v| v.allocation.status == AllocationStatus::Assigned)
        .collect();
    if staffed.is_empty() {
        let _ = writeln!(output, "No invigilators assigned.");
    } else {
        for view in staffed {
            let who = view
                .invigilator
                .as_ref()
                .map(|i| format!("{} <{}>, {}", i.name, i.email, i.department))
                .unwrap_or_else(|| "unknown invigilator".to_string());
            let _ = writeln!(
                output,
                "- {} {}: {}",
                view.allocation.slot, view.allocation.classroom_code, who
            );
        }
    }

    output
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportRow<'a> {
    date: NaiveDate,
    slot: Slot,
    classroom_code: &'a str,
    status: AllocationStatus,
    invigilator_name: &'a str,
    email: &'a str,
    department: &'a str,
    designation: &'a str,
}

/// Writes the day's allocations as CSV, one row per allocation.
pub fn write_csv<W: io::Write>(writer: W, views: &[AllocationView]) -> csv::Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    for view in views {
        let invigilator = view.invigilator.as_ref();
        csv.serialize(ExportRow {
            date: view.allocation.date,
            slot: view.allocation.slot,
            classroom_code: &view.allocation.classroom_code,
            status: view.allocation.status,
            invigilator_name: invigilator.map_or("", |i| i.name.as_str()),
            email: invigilator.map_or("", |i| i.email.as_str()),
            department: invigilator.map_or("", |i| i.department.as_str()),
            designation: invigilator.map_or("", |i| i.designation.as_str()),
        })?;
    }
    csv.flush()?;
    Ok(())
}
