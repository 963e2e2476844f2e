//! Effective-dated hourly-rate resolution.
//!
//! A rate change mid-period applies to the whole period's pay, so callers
//! resolve as of the period *end*. The history is append-only; on
//! duplicate effective dates the last-inserted entry wins.

use tracing::warn;

use crate::staff::StaffRecord;
use crate::timeclock::parse_timestamp;

/// Resolve the hourly rate for a staff pay profile as of the given date.
///
/// Picks the history entry with the latest `effective_from` at or before
/// `as_of`; falls back to the profile's default rate, then to 0. Entries
/// with unparsable dates are skipped. Never errors — a resolved zero is
/// logged so an unconfigured profile shows up in review instead of
/// silently zeroing someone's pay.
pub fn resolve_rate(profile: &StaffRecord, as_of: &str) -> f64 {
    let as_of_ts = parse_timestamp(as_of);

    let mut best: Option<(chrono::DateTime<chrono::Utc>, f64)> = None;
    if let Some(as_of_ts) = as_of_ts {
        for entry in &profile.rate_history {
            let effective = match parse_timestamp(&entry.effective_from) {
                Some(ts) => ts,
                None => continue,
            };
            if effective > as_of_ts {
                continue;
            }
            // >= so a duplicate effective date is won by the later insert
            match best {
                Some((best_ts, _)) if effective < best_ts => {}
                _ => best = Some((effective, entry.rate)),
            }
        }
    }

    let rate = match best {
        Some((_, rate)) => rate,
        None => profile.default_hourly_rate,
    };

    if rate == 0.0 {
        warn!(
            staff_id = %profile.id,
            as_of = %as_of,
            "No usable hourly rate, staff will be paid 0 — check the pay profile"
        );
    }
    rate
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staff::RateEntry;

    fn profile(default_rate: f64, history: Vec<(f64, &str)>) -> StaffRecord {
        StaffRecord {
            id: "s1".to_string(),
            display_name: "Ana".to_string(),
            role: "cashier".to_string(),
            is_active: true,
            default_hourly_rate: default_rate,
            rate_history: history
                .into_iter()
                .map(|(rate, from)| RateEntry {
                    rate,
                    effective_from: from.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_resolves_entry_in_effect() {
        let p = profile(40.0, vec![(50.0, "2025-01-01"), (60.0, "2025-02-01")]);
        assert_eq!(resolve_rate(&p, "2025-01-15"), 50.0);
        assert_eq!(resolve_rate(&p, "2025-02-15"), 60.0);
    }

    #[test]
    fn test_effective_on_as_of_day_applies() {
        let p = profile(40.0, vec![(60.0, "2025-02-01")]);
        assert_eq!(resolve_rate(&p, "2025-02-01"), 60.0);
    }

    #[test]
    fn test_falls_back_to_default_before_any_entry() {
        let p = profile(40.0, vec![(50.0, "2025-01-01"), (60.0, "2025-02-01")]);
        assert_eq!(resolve_rate(&p, "2024-12-31"), 40.0);
    }

    #[test]
    fn test_empty_history_and_zero_default_is_zero() {
        let p = profile(0.0, vec![]);
        assert_eq!(resolve_rate(&p, "2025-01-15"), 0.0);
    }

    #[test]
    fn test_duplicate_effective_date_last_inserted_wins() {
        let p = profile(40.0, vec![(55.0, "2025-01-01"), (58.0, "2025-01-01")]);
        assert_eq!(resolve_rate(&p, "2025-01-15"), 58.0);
    }

    #[test]
    fn test_unparsable_entries_skipped() {
        let p = profile(40.0, vec![(99.0, "soon"), (50.0, "2025-01-01")]);
        assert_eq!(resolve_rate(&p, "2025-01-15"), 50.0);
    }

    #[test]
    fn test_unparsable_as_of_uses_default() {
        let p = profile(40.0, vec![(50.0, "2025-01-01")]);
        assert_eq!(resolve_rate(&p, "whenever"), 40.0);
    }

    #[test]
    fn test_full_timestamps_in_history() {
        let p = profile(
            40.0,
            vec![(50.0, "2025-01-01T00:00:00Z"), (60.0, "2025-02-01T09:30:00Z")],
        );
        assert_eq!(resolve_rate(&p, "2025-02-01"), 50.0);
        assert_eq!(resolve_rate(&p, "2025-02-02"), 60.0);
    }
}
