//! Calendar-day grouping of entries

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Entry;

/// Entry ids created on one calendar day, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Day {
    pub ids: Vec<i64>,
}

/// Entries grouped by the local calendar day they were created on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub days: BTreeMap<NaiveDate, Day>,
    /// When the grouping was last recomputed
    pub last_updated: Option<DateTime<Utc>>,
}

impl Timeline {
    /// Group `entries` by day in the local time zone
    pub fn build(entries: &HashMap<i64, Entry>) -> Self {
        Self::build_in(entries, &Local)
    }

    /// Group `entries` by day in `tz`
    pub fn build_in<Tz: TimeZone>(entries: &HashMap<i64, Entry>, tz: &Tz) -> Self {
        let mut dated: Vec<(NaiveDate, DateTime<Utc>, i64)> = entries
            .values()
            .map(|e| (e.created.with_timezone(tz).date_naive(), e.created, e.id))
            .collect();
        // Newest first; ids break ties so equal timestamps stay stable
        dated.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));

        let mut days: BTreeMap<NaiveDate, Day> = BTreeMap::new();
        for (date, _, id) in dated {
            days.entry(date).or_default().ids.push(id);
        }

        Self {
            days,
            last_updated: Some(Utc::now()),
        }
    }

    /// Days, most recent first
    pub fn days_newest_first(&self) -> impl Iterator<Item = (&NaiveDate, &Day)> {
        self.days.iter().rev()
    }

    /// The day an entry falls on, if it is in the timeline
    pub fn day_of(&self, id: i64) -> Option<NaiveDate> {
        self.days
            .iter()
            .find(|(_, day)| day.ids.contains(&id))
            .map(|(date, _)| *date)
    }

    pub fn len(&self) -> usize {
        self.days.values().map(|d| d.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}
