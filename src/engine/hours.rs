use chrono::{Days, NaiveDate};

use crate::limits::MAX_LOOKAHEAD_DAYS;
use crate::model::*;
use crate::time::weekday_index;

/// Effective business hours for `date`.
///
/// Closed when the weekday is not a working day. Otherwise a per-weekday
/// entry wins over the global hours.
pub fn hours_for(config: &TenantConfig, date: NaiveDate) -> DayHours {
    let weekday = weekday_index(date);
    if !config.working_days.contains(&weekday) {
        return DayHours::Closed;
    }
    let bounds = config
        .weekday_hours
        .get(&weekday)
        .copied()
        .unwrap_or(config.global_hours);
    DayHours::Open {
        open: bounds.open_minutes(),
        close: bounds.close_minutes(),
    }
}

/// First working day strictly after `date`, looking at most a week ahead.
pub fn next_working_day(config: &TenantConfig, date: NaiveDate) -> Option<NaiveDate> {
    (1..=MAX_LOOKAHEAD_DAYS as u64)
        .filter_map(|d| date.checked_add_days(Days::new(d)))
        .find(|candidate| matches!(hours_for(config, *candidate), DayHours::Open { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sunday() -> NaiveDate {
        date(2026, 10, 18)
    }

    #[test]
    fn global_hours_apply_by_default() {
        let config = TenantConfig::default();
        assert_eq!(
            hours_for(&config, sunday()),
            DayHours::Open { open: 540, close: 1080 }
        );
    }

    #[test]
    fn non_working_day_is_closed() {
        let config = TenantConfig {
            working_days: (1..=5).collect(),
            ..TenantConfig::default()
        };
        assert_eq!(hours_for(&config, sunday()), DayHours::Closed);
        assert!(matches!(
            hours_for(&config, date(2026, 10, 19)),
            DayHours::Open { .. }
        ));
    }

    #[test]
    fn weekday_override_wins_for_that_weekday_only() {
        let mut config = TenantConfig::default();
        config.weekday_hours.insert(6, HourBounds::new(10, 14));
        let saturday = date(2026, 10, 24);
        assert_eq!(
            hours_for(&config, saturday),
            DayHours::Open { open: 600, close: 840 }
        );
        assert_eq!(
            hours_for(&config, date(2026, 10, 23)),
            DayHours::Open { open: 540, close: 1080 }
        );
    }

    #[test]
    fn override_on_closed_weekday_stays_closed() {
        let mut config = TenantConfig {
            working_days: (1..=6).collect(),
            ..TenantConfig::default()
        };
        config.weekday_hours.insert(0, HourBounds::new(10, 12));
        assert_eq!(hours_for(&config, sunday()), DayHours::Closed);
    }

    #[test]
    fn next_working_day_skips_closed_days() {
        let config = TenantConfig {
            working_days: (1..=5).collect(),
            ..TenantConfig::default()
        };
        // Friday → Monday
        let friday = date(2026, 10, 23);
        assert_eq!(next_working_day(&config, friday), Some(date(2026, 10, 26)));
        // Sunday → Monday
        assert_eq!(next_working_day(&config, sunday()), Some(date(2026, 10, 19)));
    }

    #[test]
    fn next_working_day_none_when_never_open() {
        let config = TenantConfig {
            working_days: Default::default(),
            ..TenantConfig::default()
        };
        assert_eq!(next_working_day(&config, sunday()), None);
    }
}
