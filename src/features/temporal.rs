//! Calendar-derived features.

use std::f64::consts::PI;

use chrono::{Datelike, NaiveDateTime};

use crate::frame::{CALENDAR_COLUMNS, Frame};

/// Add day-of-week, day-of-year, quarter and the cyclical encodings.
///
/// Rows whose calendar fields do not form a valid date get NaN for every
/// date-derived column. Hour- and month-only encodings are still produced.
pub fn add_time_features(mut frame: Frame) -> Frame {
    if frame.has_all(&CALENDAR_COLUMNS) {
        let stamps = frame.timestamps();
        let from_date = |f: fn(&NaiveDateTime) -> f64| -> Vec<f64> {
            stamps.iter().map(|s| s.as_ref().map_or(f64::NAN, f)).collect()
        };
        frame.set(
            "day_of_week",
            from_date(|s| f64::from(s.weekday().num_days_from_monday())),
        );
        frame.set("day_of_year", from_date(|s| f64::from(s.ordinal())));
        frame.set("quarter", from_date(|s| f64::from((s.month() - 1) / 3 + 1)));
    }

    if let Some(hour) = frame.column("hour").map(<[f64]>::to_vec) {
        let (sin, cos) = cyclical(&hour, 24.0);
        frame.set("hour_sin", sin);
        frame.set("hour_cos", cos);
    }
    if let Some(dow) = frame.column("day_of_week").map(<[f64]>::to_vec) {
        let (sin, cos) = cyclical(&dow, 7.0);
        frame.set("day_sin", sin);
        frame.set("day_cos", cos);
    }
    if let Some(month) = frame.column("month").map(<[f64]>::to_vec) {
        let (sin, cos) = cyclical(&month, 12.0);
        frame.set("month_sin", sin);
        frame.set("month_cos", cos);
    }
    if let Some(doy) = frame.column("day_of_year").map(<[f64]>::to_vec) {
        let (sin, cos) = cyclical(&doy, 365.0);
        frame.set("doy_sin", sin);
        frame.set("doy_cos", cos);
    }

    if let Some(dow) = frame.column("day_of_week") {
        let weekend = dow.iter().map(|&d| indicator(d, |d| d >= 5.0)).collect();
        frame.set("is_weekend", weekend);
    }
    if let Some(hour) = frame.column("hour") {
        let rush = hour
            .iter()
            .map(|&h| indicator(h, |h| (7.0..=9.0).contains(&h) || (17.0..=19.0).contains(&h)))
            .collect();
        frame.set("is_rush_hour", rush);
    }
    if let Some(month) = frame.column("month") {
        let season = month.iter().map(|&m| season_of(m)).collect();
        frame.set("season", season);
    }

    tracing::debug!(rows = frame.len(), "Created temporal features");
    frame
}

fn cyclical(values: &[f64], period: f64) -> (Vec<f64>, Vec<f64>) {
    values
        .iter()
        .map(|&v| {
            let angle = 2.0 * PI * v / period;
            (angle.sin(), angle.cos())
        })
        .unzip()
}

/// 1.0 / 0.0 for a predicate, NaN for a missing input.
pub(crate) fn indicator(value: f64, pred: impl Fn(f64) -> bool) -> f64 {
    if value.is_nan() {
        f64::NAN
    } else if pred(value) {
        1.0
    } else {
        0.0
    }
}

/// Meteorological season: Dec-Feb 0, Mar-May 1, Jun-Aug 2, Sep-Nov 3.
fn season_of(month: f64) -> f64 {
    match month as i64 {
        _ if month.is_nan() => f64::NAN,
        12 | 1 | 2 => 0.0,
        3..=5 => 1.0,
        6..=8 => 2.0,
        9..=11 => 3.0,
        _ => f64::NAN,
    }
}
