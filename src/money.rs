//! Currency rounding and cash-count math.
//!
//! All monetary values are f64 rounded to 2 decimals *at the point of
//! aggregation*, matching how the rest of the store records amounts.
//! Deferring rounding lets float drift accumulate across a period's worth
//! of shifts, so every sum that leaves a function here is already rounded.

use serde_json::Value;

/// Round to 2 decimals, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Sum a denomination → count map: `face_value × count` per entry.
///
/// Keys are the bill/coin face values as stored ("1000", "20", "0.25").
/// Keys that don't parse as numbers and non-numeric counts are skipped —
/// a stray annotation key in an old cash count is not an error.
pub fn sum_denominations(counts: &Value) -> f64 {
    let map = match counts.as_object() {
        Some(m) => m,
        None => return 0.0,
    };
    let mut total = 0.0;
    for (face, count) in map {
        let face: f64 = match face.trim().parse() {
            Ok(f) => f,
            Err(_) => continue,
        };
        let count = match count.as_f64() {
            Some(c) => c,
            None => continue,
        };
        total += face * count;
    }
    round2(total)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round2_basic() {
        assert_eq!(round2(400.006), 400.01);
        assert_eq!(round2(399.994), 399.99);
        assert_eq!(round2(0.0), 0.0);
        assert_eq!(round2(-12.345), -12.35);
    }

    #[test]
    fn test_sum_denominations_mixed_faces() {
        let counts = json!({ "1000": 2, "500": 1, "20": 3, "0.25": 4 });
        assert_eq!(sum_denominations(&counts), 2561.0);
    }

    #[test]
    fn test_sum_denominations_ignores_unrecognized_keys() {
        let counts = json!({ "1000": 1, "note": "recount tomorrow", "coins": null });
        assert_eq!(sum_denominations(&counts), 1000.0);
    }

    #[test]
    fn test_sum_denominations_ignores_non_numeric_counts() {
        let counts = json!({ "100": "five", "50": 2 });
        assert_eq!(sum_denominations(&counts), 100.0);
    }

    #[test]
    fn test_sum_denominations_non_object_is_zero() {
        assert_eq!(sum_denominations(&Value::Null), 0.0);
        assert_eq!(sum_denominations(&json!([1000, 500])), 0.0);
    }

    #[test]
    fn test_sum_denominations_empty_map_is_zero() {
        assert_eq!(sum_denominations(&json!({})), 0.0);
    }
}
