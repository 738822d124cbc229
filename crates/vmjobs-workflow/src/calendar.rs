//! Business-date arithmetic. All dates are UTC calendar dates.

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use serde::Serialize;

/// Data arriving before `cutoff_hour` belongs to the previous day.
///
/// Weekends are not rolled back; a weekend business date simply yields no
/// weekday of its own downstream.
pub fn derive_business_date(now: DateTime<Utc>, cutoff_hour: u32) -> NaiveDate {
    let today = now.date_naive();
    if now.hour() < cutoff_hour {
        today.pred_opt().unwrap_or(today)
    } else {
        today
    }
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekdays in `[business_date - offset_days, business_date]`, ascending.
pub fn weekday_range(business_date: NaiveDate, offset_days: u32) -> Vec<NaiveDate> {
    let start = business_date
        .checked_sub_days(Days::new(offset_days as u64))
        .unwrap_or(NaiveDate::MIN);
    weekdays_between(start, business_date)
}

/// Weekdays in `[start, end]`, ascending. Empty when `start > end`.
pub fn weekdays_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| is_weekday(*d))
        .collect()
}

/// Steps back `n` weekdays from `date`.
pub fn subtract_business_days(date: NaiveDate, n: u32) -> NaiveDate {
    let mut current = date;
    let mut remaining = n;
    while remaining > 0 {
        match current.pred_opt() {
            Some(prev) => current = prev,
            None => break,
        }
        if is_weekday(current) {
            remaining -= 1;
        }
    }
    current
}

/// The `n` weekdays strictly before `date`, ascending.
pub fn preceding_weekdays(date: NaiveDate, n: u32) -> Vec<NaiveDate> {
    let mut out = Vec::with_capacity(n as usize);
    let mut current = date;
    while out.len() < n as usize {
        match current.pred_opt() {
            Some(prev) => current = prev,
            None => break,
        }
        if is_weekday(current) {
            out.push(current);
        }
    }
    out.reverse();
    out
}

pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// `DD/MM/YYYY`, the label format the time-series store uses for business dates.
pub fn biz_date_label(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// One chunk of an extraction query for a business date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtractionWindow {
    pub business_date: NaiveDate,
    pub chunk_start: DateTime<Utc>,
    pub chunk_end: DateTime<Utc>,
}

/// Splits `[business_date 00:00, end)` into `chunk_size_days` windows; the
/// last one is truncated at `end`.
pub fn extraction_windows(
    business_date: NaiveDate,
    end: DateTime<Utc>,
    chunk_size_days: u32,
) -> Vec<ExtractionWindow> {
    let step = chrono::Duration::days(chunk_size_days.max(1) as i64);
    let mut windows = Vec::new();
    let mut chunk_start = day_start(business_date);
    while chunk_start < end {
        let chunk_end = (chunk_start + step).min(end);
        windows.push(ExtractionWindow {
            business_date,
            chunk_start,
            chunk_end,
        });
        chunk_start = chunk_end;
    }
    windows
}

/// 00:00 UTC of the day after `now`. Extraction runs up to here so late
/// writes against past business dates are still picked up.
pub fn extraction_end(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    day_start(today.succ_opt().unwrap_or(today))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn at(date: NaiveDate, h: u32, min: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date.and_hms_opt(h, min, 0).unwrap())
    }

    #[test]
    fn cutoff_boundary() {
        let today = d(2024, 3, 14);
        assert_eq!(derive_business_date(at(today, 5, 59), 6), d(2024, 3, 13));
        assert_eq!(derive_business_date(at(today, 6, 0), 6), today);
        assert_eq!(derive_business_date(at(today, 0, 0), 0), today);
    }

    #[test]
    fn weekday_range_skips_weekends() {
        // Wednesday
        let bd = d(2024, 1, 17);
        let days = weekday_range(bd, 9);
        assert!(days.iter().all(|d| is_weekday(*d)));
        let expected = (0..=9)
            .map(|i| bd - Days::new(i))
            .filter(|d| is_weekday(*d))
            .count();
        assert_eq!(days.len(), expected);
        assert_eq!(days.len(), 8);
        assert_eq!(days.first(), Some(&d(2024, 1, 8)));
        assert_eq!(days.last(), Some(&bd));
        assert!(days.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn business_day_arithmetic() {
        // Monday minus one business day is the previous Friday.
        assert_eq!(subtract_business_days(d(2024, 1, 15), 1), d(2024, 1, 12));
        assert_eq!(subtract_business_days(d(2024, 1, 17), 0), d(2024, 1, 17));
        assert_eq!(
            preceding_weekdays(d(2024, 1, 16), 2),
            vec![d(2024, 1, 12), d(2024, 1, 15)]
        );
    }

    #[test]
    fn windows_cover_range_with_truncated_tail() {
        let bd = d(2024, 1, 15);
        let end = at(d(2024, 1, 19), 0, 0);
        let windows = extraction_windows(bd, end, 3);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].chunk_start, at(bd, 0, 0));
        assert_eq!(windows[0].chunk_end, at(d(2024, 1, 18), 0, 0));
        assert_eq!(windows[1].chunk_end, end);
    }

    #[test]
    fn extraction_end_is_tomorrow_midnight() {
        let now = at(d(2024, 2, 29), 13, 5);
        assert_eq!(extraction_end(now), at(d(2024, 3, 1), 0, 0));
        assert_eq!(biz_date_label(d(2024, 3, 1)), "01/03/2024");
    }
}
