use chrono::{Datelike, NaiveDate};

use crate::models::{FacultyProfile, Slot};

/// Weekday index used by availability rules: 0 = Sunday through 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// A profile with no rules is available everywhere; otherwise one rule
/// must match the date (or its weekday) and list the slot.
pub fn is_available(profile: &FacultyProfile, date: NaiveDate, slot: Slot) -> bool {
    if profile.availability.is_empty() {
        return true;
    }

    let dow = weekday_index(date);
    profile.availability.iter().any(|rule| {
        if !rule.slots.contains(&slot) {
            return false;
        }
        rule.date == Some(date) || rule.day_of_week == Some(dow)
    })
}
