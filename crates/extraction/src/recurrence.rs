//! Recurrence rules deciding on which days a scheduled report is due.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use reportflow_core::{DomainError, DomainResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// Every `interval` days, weeks or months counted from `start`.
///
/// Weekly rules fire on `weekdays` (the start's weekday when empty); monthly
/// rules fire on `month_days` (the start's day when empty), with days past
/// the end of a short month falling on its last day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub start: NaiveDate,
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    #[serde(default)]
    pub month_days: Vec<u32>,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency, interval: u32, start: NaiveDate) -> DomainResult<Self> {
        if interval == 0 {
            return Err(DomainError::validation("recurrence interval must be at least 1"));
        }
        Ok(Self {
            frequency,
            interval,
            start,
            weekdays: Vec::new(),
            month_days: Vec::new(),
        })
    }

    pub fn daily(start: NaiveDate) -> Self {
        Self {
            frequency: Frequency::Daily,
            interval: 1,
            start,
            weekdays: Vec::new(),
            month_days: Vec::new(),
        }
    }

    pub fn on_weekdays(mut self, weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        self.weekdays = weekdays.into_iter().collect();
        self
    }

    pub fn on_month_days(mut self, days: impl IntoIterator<Item = u32>) -> DomainResult<Self> {
        let days: Vec<u32> = days.into_iter().collect();
        if let Some(bad) = days.iter().find(|d| !(1..=31).contains(*d)) {
            return Err(DomainError::validation(format!("invalid day of month: {bad}")));
        }
        self.month_days = days;
        Ok(self)
    }

    pub fn occurs_on(&self, date: NaiveDate) -> bool {
        if date < self.start {
            return false;
        }
        let interval = i64::from(self.interval.max(1));

        match self.frequency {
            Frequency::Daily => (date - self.start).num_days() % interval == 0,
            Frequency::Weekly => {
                let weeks = (week_start(date) - week_start(self.start)).num_days() / 7;
                let weekday_matches = if self.weekdays.is_empty() {
                    date.weekday() == self.start.weekday()
                } else {
                    self.weekdays.contains(&date.weekday())
                };
                weeks % interval == 0 && weekday_matches
            }
            Frequency::Monthly => {
                let months = month_index(date) - month_index(self.start);
                let last = last_day_of_month(date);
                let day_matches = if self.month_days.is_empty() {
                    self.start.day().min(last) == date.day()
                } else {
                    self.month_days.iter().any(|d| (*d).min(last) == date.day())
                };
                months % interval == 0 && day_matches
            }
        }
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day())
}
