//! Next-billing-date calculation.
//!
//! Occurrences form a fixed series anchored on the schedule's start date:
//! month-based cadences land on `billing_day_of_month` (clamped to the last
//! day of short months) every N months from the first occurrence; day-based
//! cadences land every N days from the start date. Querying with any date
//! returns the first occurrence strictly after it, so the result does not
//! drift when a month was clamped.

use chrono::{Datelike, Duration, NaiveDate};

use crate::error::BillingError;
use crate::models::{BillingFrequency, BillingSchedule, IntervalUnit};

/// Longest custom interval accepted, per unit.
pub const MAX_CUSTOM_MONTHS: u32 = 1200;
pub const MAX_CUSTOM_DAYS: u32 = 36_500;

/// Spacing between occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Months(u32),
    Days(u32),
}

impl Cadence {
    pub fn monthly() -> Self {
        Cadence::Months(1)
    }

    pub fn quarterly() -> Self {
        Cadence::Months(3)
    }

    pub fn annually() -> Self {
        Cadence::Months(12)
    }
}

/// Everything needed to enumerate a schedule's billing dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrenceRule {
    cadence: Cadence,
    billing_day: u32,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
}

impl RecurrenceRule {
    pub fn new(
        cadence: Cadence,
        billing_day: u32,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
    ) -> Result<Self, BillingError> {
        if !(1..=31).contains(&billing_day) {
            return Err(BillingError::InvalidSchedule(format!(
                "billing day of month must be between 1 and 31, got {}",
                billing_day
            )));
        }
        match cadence {
            Cadence::Months(0) | Cadence::Days(0) => {
                return Err(BillingError::InvalidSchedule(
                    "billing interval must be at least 1".to_string(),
                ))
            }
            _ => {}
        }
        Ok(Self {
            cadence,
            billing_day,
            start_date,
            end_date,
        })
    }

    /// Build the rule from a schedule's frequency fields.
    pub fn for_schedule(schedule: &BillingSchedule) -> Result<Self, BillingError> {
        let cadence = cadence_for(
            schedule.frequency(),
            schedule.custom_interval_value,
            schedule.custom_interval_unit(),
        )?;
        let billing_day = u32::try_from(schedule.billing_day_of_month).map_err(|_| {
            BillingError::InvalidSchedule(format!(
                "billing day of month must be between 1 and 31, got {}",
                schedule.billing_day_of_month
            ))
        })?;

        Self::new(cadence, billing_day, schedule.start_date, schedule.end_date)
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// First occurrence on or after the start date, if it is within range.
    pub fn first_occurrence(&self) -> Option<NaiveDate> {
        self.within_range(self.series_start()?)
    }

    /// First occurrence strictly after `after`, or the first occurrence when
    /// nothing has run yet. `None` once the end date is passed.
    pub fn next_occurrence(&self, after: Option<NaiveDate>) -> Option<NaiveDate> {
        let first = self.series_start()?;
        let after = match after {
            Some(a) if a >= first => a,
            _ => return self.within_range(first),
        };

        let candidate = match self.cadence {
            Cadence::Months(step) => {
                let step = i32::try_from(step).ok()?;
                let anchor = month_index(first);
                let elapsed = month_index(after) - anchor;
                let mut k = elapsed / step;
                loop {
                    let index = k.checked_mul(step)?.checked_add(anchor)?;
                    let occ = self.month_occurrence(index)?;
                    if occ > after {
                        break occ;
                    }
                    k += 1;
                }
            }
            Cadence::Days(step) => {
                let step = i64::from(step);
                let elapsed = (after - first).num_days();
                let offset = (elapsed / step + 1).checked_mul(step)?;
                first.checked_add_signed(Duration::try_days(offset)?)?
            }
        };

        self.within_range(candidate)
    }

    /// First occurrence on or after `date`.
    pub fn first_on_or_after(&self, date: NaiveDate) -> Option<NaiveDate> {
        match date.pred_opt() {
            Some(previous) => self.next_occurrence(Some(previous)),
            None => self.first_occurrence(),
        }
    }

    /// Key of the calendar period an occurrence bills. At most one successful
    /// run may exist per schedule and key.
    pub fn period_key(&self, occurrence: NaiveDate) -> String {
        period_key(self.cadence, occurrence)
    }

    fn series_start(&self) -> Option<NaiveDate> {
        match self.cadence {
            Cadence::Days(_) => Some(self.start_date),
            Cadence::Months(_) => {
                let in_start_month = self.month_occurrence(month_index(self.start_date))?;
                if in_start_month >= self.start_date {
                    Some(in_start_month)
                } else {
                    self.month_occurrence(month_index(self.start_date) + 1)
                }
            }
        }
    }

    fn month_occurrence(&self, index: i32) -> Option<NaiveDate> {
        let year = index.div_euclid(12);
        let month = index.rem_euclid(12) as u32 + 1;
        clamp_to_month(year, month, self.billing_day)
    }

    fn within_range(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self.end_date {
            Some(end) if date > end => None,
            _ => Some(date),
        }
    }
}

/// Cadence of a frequency. `CUSTOM` needs a positive interval and a unit.
pub fn cadence_for(
    frequency: BillingFrequency,
    custom_value: Option<i32>,
    custom_unit: Option<IntervalUnit>,
) -> Result<Cadence, BillingError> {
    Ok(match frequency {
        BillingFrequency::Monthly => Cadence::monthly(),
        BillingFrequency::Quarterly => Cadence::quarterly(),
        BillingFrequency::Annually => Cadence::annually(),
        BillingFrequency::Custom => {
            let value = custom_value.filter(|v| *v > 0).ok_or_else(|| {
                BillingError::InvalidSchedule(
                    "custom frequency requires a positive interval".to_string(),
                )
            })? as u32;
            let (cadence, max) = match custom_unit {
                Some(IntervalUnit::Days) => (Cadence::Days(value), MAX_CUSTOM_DAYS),
                Some(IntervalUnit::Months) => (Cadence::Months(value), MAX_CUSTOM_MONTHS),
                None => {
                    return Err(BillingError::InvalidSchedule(
                        "custom frequency requires an interval unit".to_string(),
                    ))
                }
            };
            if value > max {
                return Err(BillingError::InvalidSchedule(format!(
                    "custom interval must be at most {}, got {}",
                    max, value
                )));
            }
            cadence
        }
    })
}

/// Next billing date of a schedule strictly after `after` (or its first
/// occurrence when `after` is `None`).
pub fn next_occurrence(
    schedule: &BillingSchedule,
    after: Option<NaiveDate>,
) -> Result<Option<NaiveDate>, BillingError> {
    Ok(RecurrenceRule::for_schedule(schedule)?.next_occurrence(after))
}

/// Month-based cadences key by calendar month; day-based cadences by date.
pub fn period_key(cadence: Cadence, occurrence: NaiveDate) -> String {
    match cadence {
        Cadence::Months(_) => occurrence.format("%Y-%m").to_string(),
        Cadence::Days(_) => occurrence.format("%Y-%m-%d").to_string(),
    }
}

/// `day` of the given month, or the month's last day when it is shorter.
pub fn clamp_to_month(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let last = last_day_of_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, day.min(last))
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}

fn month_index(date: NaiveDate) -> i32 {
    date.year() * 12 + date.month0() as i32
}
