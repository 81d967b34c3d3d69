use std::collections::HashMap;

use crate::models::{FacultyProfile, RosterEntry};

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Distinct, normalized roster emails used to look up accounts.
pub fn roster_emails(roster: &[RosterEntry]) -> Vec<String> {
    let mut emails: Vec<String> = roster
        .iter()
        .map(|entry| normalize_email(&entry.email))
        .filter(|email| !email.is_empty())
        .collect();
    emails.sort();
    emails.dedup();
    emails
}

/// Merges roster overrides onto the matching accounts.
///
/// Only accounts with a roster row take part; account order is kept.
/// When an email appears on several rows the last row wins.
pub fn resolve_profiles(
    roster: &[RosterEntry],
    accounts: Vec<FacultyProfile>,
) -> Vec<FacultyProfile> {
    let by_email: HashMap<String, &RosterEntry> = roster
        .iter()
        .map(|entry| (normalize_email(&entry.email), entry))
        .collect();

    accounts
        .into_iter()
        .filter_map(|account| {
            let entry = by_email.get(&normalize_email(&account.email))?;
            Some(merge(account, entry))
        })
        .collect()
}

fn merge(mut account: FacultyProfile, entry: &RosterEntry) -> FacultyProfile {
    if let Some(availability) = &entry.availability {
        account.availability = availability.clone();
    }
    if let Some(department) = non_blank(&entry.department) {
        account.department = department.to_string();
    }
    if let Some(designation) = non_blank(&entry.designation) {
        account.designation = designation.to_string();
    }
    if let Some(max) = entry.max_hours_per_day {
        account.max_hours_per_day = max;
    }
    if let Some(cap) = entry.weekly_cap {
        account.weekly_cap = cap;
    }
    account
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
