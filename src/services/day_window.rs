use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

/// Longest history range a single query may ask for
pub const MAX_RANGE_DAYS: i64 = 366;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DayRangeError {
    #[error("range start {from} is after range end {to}")]
    Reversed { from: NaiveDate, to: NaiveDate },

    #[error("range spans {0} days, at most {max} allowed", max = MAX_RANGE_DAYS)]
    TooLong(i64),

    #[error("date {0} is outside the supported calendar")]
    OutOfRange(NaiveDate),
}

/// One facility-local calendar day expressed as a half-open UTC interval
/// `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    /// Fails with `OutOfRange` when either edge of the day is not representable
    pub fn for_local_date(date: NaiveDate, offset: FixedOffset) -> Result<Self, DayRangeError> {
        let local_midnight = date.and_time(NaiveTime::MIN);
        let utc_midnight = local_midnight
            .checked_sub_signed(Duration::seconds(i64::from(offset.local_minus_utc())))
            .ok_or(DayRangeError::OutOfRange(date))?;
        let start = Utc.from_utc_datetime(&utc_midnight);
        let end = start
            .checked_add_signed(Duration::days(1))
            .ok_or(DayRangeError::OutOfRange(date))?;

        Ok(Self { date, start, end })
    }

    /// The local day that `instant` falls on
    pub fn containing(instant: DateTime<Utc>, offset: FixedOffset) -> Result<Self, DayRangeError> {
        Self::for_local_date(instant.with_timezone(&offset).date_naive(), offset)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Inclusive range of local dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl DayRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, DayRangeError> {
        if from > to {
            return Err(DayRangeError::Reversed { from, to });
        }

        let span = (to - from).num_days() + 1;
        if span > MAX_RANGE_DAYS {
            return Err(DayRangeError::TooLong(span));
        }

        Ok(Self { from, to })
    }

    /// The `days` days ending on (and including) `last`
    pub fn ending_on(last: NaiveDate, days: u32) -> Result<Self, DayRangeError> {
        let days = i64::from(days.max(1));
        let first = last
            .checked_sub_signed(Duration::days(days - 1))
            .ok_or(DayRangeError::OutOfRange(last))?;
        Self::new(first, last)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        self.from.iter_days().take_while(move |day| *day <= to)
    }

    /// UTC bounds covering every day of the range
    pub fn bounds(
        &self,
        offset: FixedOffset,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), DayRangeError> {
        Ok((
            DayWindow::for_local_date(self.from, offset)?.start,
            DayWindow::for_local_date(self.to, offset)?.end,
        ))
    }
}
