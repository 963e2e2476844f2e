//! Per-shift payroll metrics.
//!
//! A shift contributes three things to a payroll run: worked minutes,
//! a cash shortage from its drawer count, and any salary advances taken
//! against it. Expected cash comes from the newer `(total_cash,
//! expenses_total)` pair when present, else the legacy `system_total`
//! column older rows still carry.
//!
//! Bad source data never aborts a run: a shift missing timestamps earns
//! zero minutes, a missing cash count contributes zero shortage, and both
//! are logged for manual review.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::warn;

use crate::error::{PayrollError, PayrollResult};
use crate::money::{round2, sum_denominations};
use crate::timeclock::minutes_between;

/// One shift row as the payroll engine reads it.
#[derive(Debug, Clone)]
pub struct ShiftRow {
    pub id: String,
    pub staff_id: String,
    pub staff_name: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub cash_count: Option<Value>,
    pub system_total: Option<f64>,
    pub total_cash: Option<f64>,
    pub expenses_total: Option<f64>,
    pub payroll_run_id: Option<String>,
}

impl ShiftRow {
    /// Worked minutes from the stored clock-in/out pair.
    pub fn minutes_worked(&self) -> i64 {
        minutes_between(self.start_time.as_deref(), self.end_time.as_deref())
    }

    /// The cash the drawer should have held at close.
    pub fn expected_cash(&self) -> f64 {
        match self.total_cash {
            Some(total) => round2(total - self.expenses_total.unwrap_or(0.0)),
            None => self.system_total.unwrap_or(0.0),
        }
    }

    /// Drawer shortfall: expected minus counted, floored at zero.
    ///
    /// A surplus is never a negative deduction, and a shift with no
    /// recorded count is not charged its full expected cash.
    pub fn shortage(&self) -> f64 {
        let counts = match &self.cash_count {
            Some(c) if c.is_object() => c,
            _ => return 0.0,
        };
        let short = round2(self.expected_cash() - sum_denominations(counts));
        if short > 0.0 {
            short
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Shift store reads
// ---------------------------------------------------------------------------

const SHIFT_COLUMNS: &str = "id, staff_id, staff_name, start_time, end_time, cash_count,
                             system_total, total_cash, expenses_total, payroll_run_id";

fn row_to_shift(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShiftRow> {
    let raw_count: Option<String> = row.get(5)?;
    Ok(ShiftRow {
        id: row.get(0)?,
        staff_id: row.get(1)?,
        staff_name: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        cash_count: raw_count.and_then(|raw| serde_json::from_str(&raw).ok()),
        system_total: row.get(6)?,
        total_cash: row.get(7)?,
        expenses_total: row.get(8)?,
        payroll_run_id: row.get(9)?,
    })
}

/// Log the data-quality gaps a freshly loaded shift carries.
fn audit_shift(shift: &ShiftRow) {
    if shift.start_time.is_none() || shift.end_time.is_none() {
        warn!(shift_id = %shift.id, "Shift missing clock-in/out, contributes 0 minutes");
    } else if shift.cash_count.is_none() {
        warn!(shift_id = %shift.id, "Closed shift has no cash count, contributes 0 shortage");
    }
}

/// Fetch one shift by id.
pub fn load_shift(conn: &Connection, shift_id: &str) -> PayrollResult<Option<ShiftRow>> {
    let sql = format!("SELECT {SHIFT_COLUMNS} FROM staff_shifts WHERE id = ?1");
    match conn.query_row(&sql, params![shift_id], row_to_shift) {
        Ok(shift) => {
            audit_shift(&shift);
            Ok(Some(shift))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(PayrollError::store(format!("load shift {shift_id}"), e)),
    }
}

/// Load all shifts whose start falls on a day within `[from, to]`.
pub fn load_shifts_in_period(
    conn: &Connection,
    from: &str,
    to: &str,
) -> PayrollResult<Vec<ShiftRow>> {
    let from_day = from.get(..10).unwrap_or(from);
    let to_day = to.get(..10).unwrap_or(to);

    let sql = format!(
        "SELECT {SHIFT_COLUMNS} FROM staff_shifts
         WHERE start_time IS NOT NULL
           AND substr(start_time, 1, 10) >= ?1
           AND substr(start_time, 1, 10) <= ?2
         ORDER BY start_time ASC"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| PayrollError::store("load shifts in period", e))?;

    let rows = stmt
        .query_map(params![from_day, to_day], row_to_shift)
        .map_err(|e| PayrollError::store("load shifts in period", e))?;

    let mut shifts = Vec::new();
    for row in rows {
        match row {
            Ok(shift) => {
                audit_shift(&shift);
                shifts.push(shift);
            }
            Err(e) => warn!("skipping malformed shift row: {e}"),
        }
    }
    Ok(shifts)
}

/// Load specific shifts by id (order follows the input ids).
pub fn load_shifts_by_ids(conn: &Connection, ids: &[String]) -> PayrollResult<Vec<ShiftRow>> {
    let mut shifts = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(shift) = load_shift(conn, id)? {
            shifts.push(shift);
        } else {
            warn!(shift_id = %id, "Referenced shift no longer exists, skipping");
        }
    }
    Ok(shifts)
}

/// Tag a consumed shift with the run that paid it (traceability, not deletion).
pub(crate) fn tag_shift_with_run(
    conn: &Connection,
    shift_id: &str,
    run_id: &str,
) -> PayrollResult<()> {
    conn.execute(
        "UPDATE staff_shifts SET payroll_run_id = ?1, updated_at = datetime('now')
         WHERE id = ?2",
        params![run_id, shift_id],
    )
    .map_err(|e| PayrollError::store(format!("tag shift {shift_id} with run {run_id}"), e))?;
    Ok(())
}

/// Clear the run tag from every shift a voided run had consumed.
pub(crate) fn clear_run_tags(conn: &Connection, run_id: &str) -> PayrollResult<usize> {
    conn.execute(
        "UPDATE staff_shifts SET payroll_run_id = NULL, updated_at = datetime('now')
         WHERE payroll_run_id = ?1",
        params![run_id],
    )
    .map_err(|e| PayrollError::store(format!("clear shift tags for run {run_id}"), e))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    fn seed_shift(
        conn: &Connection,
        id: &str,
        staff_id: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) {
        conn.execute(
            "INSERT INTO staff_shifts (id, staff_id, staff_name, start_time, end_time)
             VALUES (?1, ?2, ?2, ?3, ?4)",
            params![id, staff_id, start, end],
        )
        .unwrap();
    }

    fn shift(total_cash: Option<f64>, expenses: Option<f64>, system: Option<f64>, count: Option<Value>) -> ShiftRow {
        ShiftRow {
            id: "sh1".to_string(),
            staff_id: "s1".to_string(),
            staff_name: None,
            start_time: Some("2025-01-05T08:00:00Z".to_string()),
            end_time: Some("2025-01-05T16:00:00Z".to_string()),
            cash_count: count,
            system_total: system,
            total_cash,
            expenses_total: expenses,
            payroll_run_id: None,
        }
    }

    #[test]
    fn test_expected_cash_prefers_newer_pair() {
        let s = shift(Some(5000.0), Some(750.0), Some(9999.0), None);
        assert_eq!(s.expected_cash(), 4250.0);
    }

    #[test]
    fn test_expected_cash_legacy_fallback() {
        let s = shift(None, None, Some(3200.0), None);
        assert_eq!(s.expected_cash(), 3200.0);
    }

    #[test]
    fn test_shortage_from_count() {
        // expected 4250, counted 4150 → short 100
        let count = json!({ "1000": 4, "100": 1, "50": 1 });
        let s = shift(Some(5000.0), Some(750.0), None, Some(count));
        assert_eq!(s.shortage(), 100.0);
    }

    #[test]
    fn test_surplus_is_zero_shortage() {
        let count = json!({ "1000": 5 });
        let s = shift(Some(5000.0), Some(750.0), None, Some(count));
        assert_eq!(s.shortage(), 0.0);
    }

    #[test]
    fn test_missing_count_is_zero_shortage() {
        let s = shift(Some(5000.0), Some(750.0), None, None);
        assert_eq!(s.shortage(), 0.0);
    }

    #[test]
    fn test_minutes_worked_requires_both_stamps() {
        let mut s = shift(None, None, None, None);
        assert_eq!(s.minutes_worked(), 480);
        s.end_time = None;
        assert_eq!(s.minutes_worked(), 0);
    }

    #[test]
    fn test_load_shifts_in_period_day_bounds() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_shift(&conn, "in-1", "s1", Some("2025-01-01T09:00:00Z"), Some("2025-01-01T17:00:00Z"));
        seed_shift(&conn, "in-2", "s1", Some("2025-01-15T23:30:00Z"), Some("2025-01-16T07:00:00Z"));
        seed_shift(&conn, "out-1", "s1", Some("2024-12-31T09:00:00Z"), Some("2024-12-31T17:00:00Z"));
        seed_shift(&conn, "out-2", "s1", Some("2025-01-16T09:00:00Z"), Some("2025-01-16T17:00:00Z"));
        seed_shift(&conn, "no-start", "s1", None, None);

        let shifts = load_shifts_in_period(&conn, "2025-01-01", "2025-01-15").unwrap();
        let ids: Vec<&str> = shifts.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["in-1", "in-2"]);
    }

    #[test]
    fn test_load_shifts_in_period_accepts_timestamp_bounds() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_shift(&conn, "in-1", "s1", Some("2025-01-15T09:00:00Z"), Some("2025-01-15T17:00:00Z"));

        let shifts =
            load_shifts_in_period(&conn, "2025-01-01T00:00:00Z", "2025-01-15T00:00:00Z").unwrap();
        assert_eq!(shifts.len(), 1);
    }

    #[test]
    fn test_cash_count_round_trips_json() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO staff_shifts (id, staff_id, start_time, end_time, cash_count, total_cash, expenses_total)
             VALUES ('sh1', 's1', '2025-01-05T08:00:00Z', '2025-01-05T16:00:00Z',
                     '{\"500\": 2, \"100\": 3}', 1400.0, 0.0)",
            [],
        )
        .unwrap();

        let shift = load_shift(&conn, "sh1").unwrap().unwrap();
        assert_eq!(shift.shortage(), 100.0);
    }

    #[test]
    fn test_tag_and_clear_run_tags() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_shift(&conn, "sh1", "s1", Some("2025-01-05T08:00:00Z"), Some("2025-01-05T16:00:00Z"));
        seed_shift(&conn, "sh2", "s1", Some("2025-01-06T08:00:00Z"), Some("2025-01-06T16:00:00Z"));

        tag_shift_with_run(&conn, "sh1", "run-1").unwrap();
        let shift = load_shift(&conn, "sh1").unwrap().unwrap();
        assert_eq!(shift.payroll_run_id.as_deref(), Some("run-1"));

        let cleared = clear_run_tags(&conn, "run-1").unwrap();
        assert_eq!(cleared, 1);
        let shift = load_shift(&conn, "sh1").unwrap().unwrap();
        assert_eq!(shift.payroll_run_id, None);
    }
}
