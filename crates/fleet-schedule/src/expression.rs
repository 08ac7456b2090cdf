//! Cron expressions and imminent fire times.
//!
//! Schedules are written in the classic five-field form (`min hour dom
//! month dow`, Sunday = 0 or 7). The `cron` crate wants a leading seconds
//! field and counts weekdays from Sunday = 1, so expressions are rewritten
//! before parsing: a seconds field of `0` is prepended and numeric
//! weekdays become names.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use fleet_core::config::CronConfig;

use crate::error::{ScheduleError, ScheduleResult};

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A validated schedule bound to its timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> ScheduleResult<Self> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };
        let rewritten = to_six_fields(expression).map_err(invalid)?;
        let schedule = Schedule::from_str(&rewritten).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            schedule,
            timezone: parse_timezone(timezone)?,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Fire times strictly after `now` that fall in the current scheduling
    /// window, plus the next window when the current one ends within the
    /// configured threshold. Each window yields at most `max_per_window`.
    pub fn imminent(&self, now: DateTime<Utc>, config: &CronConfig) -> Vec<DateTime<Utc>> {
        let window_ms = (config.window().as_millis() as i64).max(1);
        let threshold_ms = config.threshold().as_millis() as i64;
        let now_ms = now.timestamp_millis();

        let current_end = (now_ms / window_ms + 1) * window_ms;
        let mut windows = vec![(now_ms, current_end)];
        if current_end - now_ms <= threshold_ms {
            windows.push((current_end - 1, current_end + window_ms));
        }

        let mut fire_times = Vec::new();
        for (start, end) in windows {
            let (Some(start), Some(end)) = (
                DateTime::<Utc>::from_timestamp_millis(start),
                DateTime::<Utc>::from_timestamp_millis(end),
            ) else {
                continue;
            };
            fire_times.extend(
                self.schedule
                    .after(&start.with_timezone(&self.timezone))
                    .map(|t| t.with_timezone(&Utc))
                    .take_while(|t| *t < end)
                    .take(config.max_per_window),
            );
        }
        fire_times
    }
}

pub fn parse_timezone(timezone: &str) -> ScheduleResult<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))
}

/// Rewrite a five- or six-field expression into the `cron` crate's form.
fn to_six_fields(expression: &str) -> Result<String, String> {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(format!("expected 5 or 6 fields, found {n}")),
    }
    fields[5] = translate_weekdays(&fields[5])?;
    Ok(fields.join(" "))
}

fn translate_weekdays(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(translate_weekday_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn translate_weekday_item(item: &str) -> Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    if let Some((from, "7")) = range.split_once('-') {
        return expand_through_sunday(from, step);
    }
    let translated = match range.split_once('-') {
        _ if range == "*" || range == "?" => range.to_string(),
        Some((from, to)) => format!("{}-{}", weekday(from)?, weekday(to)?),
        None => weekday(range)?,
    };
    Ok(match step {
        Some(step) => format!("{translated}/{step}"),
        None => translated,
    })
}

/// `from-7` wraps past Saturday, which the `cron` crate cannot express as a
/// range, so it becomes an explicit list (or `*` when it spans every day).
fn expand_through_sunday(from: &str, step: Option<&str>) -> Result<String, String> {
    let from = match from {
        "*" => 0,
        n => n
            .parse::<usize>()
            .map_err(|_| format!("invalid day of week range {from}-7"))?,
    };
    if from > 7 {
        return Err(format!("day of week {from} is out of range"));
    }
    let step = match step {
        Some(step) => step
            .parse::<usize>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| format!("invalid step {step}"))?,
        None => 1,
    };

    let mut days: Vec<usize> = Vec::new();
    for n in (from..=7).step_by(step) {
        if !days.contains(&(n % 7)) {
            days.push(n % 7);
        }
    }
    if days.len() == WEEKDAYS.len() {
        return Ok("*".to_string());
    }
    Ok(days.iter().map(|&d| WEEKDAYS[d]).collect::<Vec<_>>().join(","))
}

fn weekday(token: &str) -> Result<String, String> {
    match token.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(WEEKDAYS[n % 7].to_string()),
        Ok(n) => Err(format!("day of week {n} is out of range")),
        Err(_) => Ok(token.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(to_six_fields("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(to_six_fields("30 */5 * * * *").unwrap(), "30 */5 * * * *");
        assert!(to_six_fields("* * *").is_err());
    }

    #[test]
    fn numeric_weekdays_become_names() {
        assert_eq!(to_six_fields("0 9 * * 1-5").unwrap(), "0 0 9 * * Mon-Fri");
        assert_eq!(to_six_fields("0 9 * * 0,7").unwrap(), "0 0 9 * * Sun,Sun");
        assert_eq!(to_six_fields("0 9 * * 5-7").unwrap(), "0 0 9 * * Fri,Sat,Sun");
        assert_eq!(to_six_fields("0 9 * * 0-7").unwrap(), "0 0 9 * * *");
        assert_eq!(to_six_fields("0 9 * * 1-7").unwrap(), "0 0 9 * * *");
        assert_eq!(to_six_fields("0 9 * * 5-7/2").unwrap(), "0 0 9 * * Fri,Sun");
        assert_eq!(to_six_fields("0 9 * * 1,6-7").unwrap(), "0 0 9 * * Mon,Sat,Sun");
        assert!(to_six_fields("0 9 * * 5-7/0").is_err());
        assert_eq!(to_six_fields("0 9 * * MON").unwrap(), "0 0 9 * * MON");
        assert!(to_six_fields("0 9 * * 8").is_err());
    }

    fn fire_days(expression: &str, count: usize) -> Vec<Weekday> {
        let schedule = CronSchedule::parse(expression, "UTC").unwrap();
        schedule
            .schedule
            .after(&at(0, 0, 0).with_timezone(&schedule.timezone()))
            .take(count)
            .map(|t| t.weekday())
            .collect()
    }

    #[test]
    fn ranges_through_sunday_fire_on_every_listed_day() {
        // 2024-01-01 is a Monday.
        assert_eq!(
            fire_days("0 9 * * 0-7", 7),
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun
            ]
        );
        assert_eq!(
            fire_days("0 9 * * 5-7/2", 4),
            vec![Weekday::Fri, Weekday::Sun, Weekday::Fri, Weekday::Sun]
        );
    }

    #[test]
    fn invalid_input_is_rejected() {
        assert!(matches!(
            CronSchedule::parse("not a cron", "UTC"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("* * * * *", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn fire_times_stop_at_the_window_boundary() {
        let schedule = CronSchedule::parse("* * * * *", "UTC").unwrap();
        let times = schedule.imminent(at(12, 3, 30), &CronConfig::default());
        assert_eq!(times.first(), Some(&at(12, 4, 0)));
        assert_eq!(times.last(), Some(&at(12, 9, 0)));
        assert_eq!(times.len(), 6);
    }

    #[test]
    fn next_window_is_included_near_the_boundary() {
        let schedule = CronSchedule::parse("* * * * *", "UTC").unwrap();
        let times = schedule.imminent(at(12, 9, 30), &CronConfig::default());
        assert_eq!(times.first(), Some(&at(12, 10, 0)));
        assert_eq!(times.last(), Some(&at(12, 19, 0)));
        assert_eq!(times.len(), 10);
    }

    #[test]
    fn windows_are_capped() {
        let schedule = CronSchedule::parse("* * * * * *", "UTC").unwrap();
        let times = schedule.imminent(at(12, 0, 0), &CronConfig::default());
        assert_eq!(times.len(), 120);
    }

    #[test]
    fn timezone_shifts_fire_times() {
        // 07:35 in Kolkata is 02:05 UTC.
        let schedule = CronSchedule::parse("35 7 * * *", "Asia/Kolkata").unwrap();
        let times = schedule.imminent(at(2, 1, 0), &CronConfig::default());
        assert_eq!(times, vec![at(2, 5, 0)]);
    }
}
