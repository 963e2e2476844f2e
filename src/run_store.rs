//! Run document persistence.
//!
//! Saving a draft is an idempotent upsert: the run header's totals, one
//! row per line (adjustments and source ids fully replaced, never
//! merged), and one override row per shift that actually deviates from
//! its source. Overrides are deleted and rewritten on every save so a
//! stale override can never linger after the edit that created it is
//! undone. Safe to call repeatedly.
//!
//! Loading a draft re-reads authoritative state: shift rows and salary
//! advances come fresh from their stores, while edits (rate changes,
//! overrides, manual deductions) come from the saved rows.

use rusqlite::{params, Connection};
use tracing::info;
use uuid::Uuid;

use crate::db::{BatchWriter, DbState};
use crate::error::{PayrollError, PayrollResult};
use crate::ledger;
use crate::line::{
    Adjustment, AdjustmentKind, LineShift, LineTotals, PayrollRun, PostingMode, RunDraft, RunLine,
    RunStatus,
};
use crate::metrics;
use crate::money::round2;
use crate::preview;

// ---------------------------------------------------------------------------
// Row shapes
// ---------------------------------------------------------------------------

/// A stored payroll line as read back from the run store.
#[derive(Debug, Clone)]
pub struct LineRow {
    pub id: String,
    pub staff_id: String,
    pub staff_name: Option<String>,
    pub hourly_rate: f64,
    pub minutes_worked: i64,
    pub gross: f64,
    pub advances: f64,
    pub shortages: f64,
    pub other_deductions: f64,
    pub net: f64,
    pub adjustments: Vec<Adjustment>,
    pub source_shift_ids: Vec<String>,
}

/// A stored per-shift override.
#[derive(Debug, Clone)]
pub struct OverrideRow {
    pub shift_id: String,
    pub override_start: Option<String>,
    pub override_end: Option<String>,
    pub excluded: bool,
    pub minutes_used: i64,
    pub expense_date: Option<String>,
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Persist a draft run: header totals, full line rows, and the override
/// rows for deviating shifts. Idempotent.
pub fn save_draft(db: &DbState, draft: &RunDraft) -> PayrollResult<()> {
    if matches!(draft.run.status, RunStatus::Posted | RunStatus::Voided) {
        return Err(PayrollError::conflict(format!(
            "Run {} is {} and can no longer be saved",
            draft.run.id,
            draft.run.status.as_str()
        )));
    }

    let conn = db
        .conn
        .lock()
        .map_err(|e| PayrollError::store("lock connection", e))?;

    // The store is authoritative on status: a draft loaded before another
    // actor posted the run must not overwrite the posted rows.
    if let Some(stored) = run_status(&conn, &draft.run.id)? {
        if matches!(stored, RunStatus::Posted | RunStatus::Voided) {
            return Err(PayrollError::conflict(format!(
                "Run {} was {} in the store, refusing to save",
                draft.run.id,
                stored.as_str()
            )));
        }
    }

    let mut writer = BatchWriter::begin(&conn, &format!("save draft {}", draft.run.id))?;
    match write_draft(&conn, &mut writer, draft) {
        Ok(()) => {
            writer.finish()?;
        }
        Err(e) => {
            writer.abandon();
            return Err(e);
        }
    }

    info!(
        run_id = %draft.run.id,
        lines = draft.lines.len(),
        total_net = %draft.run.total_net,
        "Draft run saved"
    );
    Ok(())
}

fn write_draft(
    conn: &Connection,
    writer: &mut BatchWriter<'_>,
    draft: &RunDraft,
) -> PayrollResult<()> {
    let run = &draft.run;

    conn.execute(
        "INSERT INTO payroll_runs (
            id, period_start, period_end, pay_date, posting_mode, status, attempt,
            total_gross, total_deductions, total_net
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            period_start = excluded.period_start,
            period_end = excluded.period_end,
            pay_date = excluded.pay_date,
            posting_mode = excluded.posting_mode,
            total_gross = excluded.total_gross,
            total_deductions = excluded.total_deductions,
            total_net = excluded.total_net,
            updated_at = datetime('now')",
        params![
            run.id,
            run.period_start,
            run.period_end,
            run.pay_date,
            run.mode.as_str(),
            run.status.as_str(),
            run.attempt,
            run.total_gross,
            run.total_deductions,
            run.total_net,
        ],
    )
    .map_err(|e| PayrollError::store(format!("upsert run {}", run.id), e))?;
    writer.bump()?;

    // Drop lines for staff no longer on the draft
    let staff_ids: Vec<String> = draft.lines.iter().map(|l| l.staff_id.clone()).collect();
    let sql = if staff_ids.is_empty() {
        "DELETE FROM payroll_lines WHERE run_id = ?".to_string()
    } else {
        let placeholders = vec!["?"; staff_ids.len()].join(", ");
        format!("DELETE FROM payroll_lines WHERE run_id = ? AND staff_id NOT IN ({placeholders})")
    };
    let mut delete_params: Vec<&dyn rusqlite::ToSql> = vec![&run.id];
    for id in &staff_ids {
        delete_params.push(id);
    }
    conn.execute(&sql, delete_params.as_slice())
        .map_err(|e| PayrollError::store(format!("prune lines for run {}", run.id), e))?;
    writer.bump()?;

    for line in &draft.lines {
        let adjustments = serde_json::to_string(&line.adjustments)
            .map_err(|e| PayrollError::store("serialize adjustments", e))?;
        let source_ids = serde_json::to_string(&line.source_shift_ids())
            .map_err(|e| PayrollError::store("serialize source shift ids", e))?;

        conn.execute(
            "INSERT INTO payroll_lines (
                id, run_id, staff_id, staff_name, hourly_rate, minutes_worked,
                gross, advances, shortages, other_deductions, net,
                adjustments, source_shift_ids
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(run_id, staff_id) DO UPDATE SET
                staff_name = excluded.staff_name,
                hourly_rate = excluded.hourly_rate,
                minutes_worked = excluded.minutes_worked,
                gross = excluded.gross,
                advances = excluded.advances,
                shortages = excluded.shortages,
                other_deductions = excluded.other_deductions,
                net = excluded.net,
                adjustments = excluded.adjustments,
                source_shift_ids = excluded.source_shift_ids,
                updated_at = datetime('now')",
            params![
                line.id,
                run.id,
                line.staff_id,
                line.staff_name,
                line.hourly_rate,
                line.totals.minutes,
                line.totals.gross,
                line.totals.advances,
                line.totals.shortages,
                line.totals.other_deductions,
                line.totals.net,
                adjustments,
                source_ids,
            ],
        )
        .map_err(|e| PayrollError::store(format!("upsert line for staff {}", line.staff_id), e))?;
        writer.bump()?;
    }

    // Overrides: cleared and rewritten so stale rows cannot linger
    conn.execute(
        "DELETE FROM shift_overrides WHERE run_id = ?1",
        params![run.id],
    )
    .map_err(|e| PayrollError::store(format!("clear overrides for run {}", run.id), e))?;
    writer.bump()?;

    for line in &draft.lines {
        for shift in line.shifts.iter().filter(|s| s.has_override()) {
            conn.execute(
                "INSERT INTO shift_overrides (
                    id, run_id, shift_id, override_start, override_end,
                    excluded, minutes_used, expense_date
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    run.id,
                    shift.shift.id,
                    shift.override_start,
                    shift.override_end,
                    shift.excluded as i64,
                    shift.minutes_used,
                    shift.expense_date,
                ],
            )
            .map_err(|e| {
                PayrollError::store(format!("insert override for shift {}", shift.shift.id), e)
            })?;
            writer.bump()?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Loads
// ---------------------------------------------------------------------------

fn run_status(conn: &Connection, run_id: &str) -> PayrollResult<Option<RunStatus>> {
    match conn.query_row(
        "SELECT status FROM payroll_runs WHERE id = ?1",
        params![run_id],
        |row| row.get::<_, String>(0),
    ) {
        Ok(raw) => Ok(RunStatus::parse(&raw)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(PayrollError::store(format!("read status of run {run_id}"), e)),
    }
}

/// Read a run header.
pub fn load_run(conn: &Connection, run_id: &str) -> PayrollResult<Option<PayrollRun>> {
    match conn.query_row(
        "SELECT id, period_start, period_end, pay_date, posting_mode, status, attempt,
                total_gross, total_deductions, total_net
         FROM payroll_runs WHERE id = ?1",
        params![run_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, f64>(8)?,
                row.get::<_, f64>(9)?,
            ))
        },
    ) {
        Ok((id, period_start, period_end, pay_date, mode, status, attempt, gross, deductions, net)) => {
            let mode = PostingMode::parse(&mode).ok_or_else(|| {
                PayrollError::store(format!("run {run_id}"), format!("unknown posting mode {mode}"))
            })?;
            let status = RunStatus::parse(&status).ok_or_else(|| {
                PayrollError::store(format!("run {run_id}"), format!("unknown status {status}"))
            })?;
            Ok(Some(PayrollRun {
                id,
                period_start,
                period_end,
                pay_date,
                mode,
                status,
                attempt,
                total_gross: gross,
                total_deductions: deductions,
                total_net: net,
            }))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(PayrollError::store(format!("load run {run_id}"), e)),
    }
}

/// Read a run's stored lines, ordered by staff display name.
pub fn load_lines(conn: &Connection, run_id: &str) -> PayrollResult<Vec<LineRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, staff_id, staff_name, hourly_rate, minutes_worked,
                    gross, advances, shortages, other_deductions, net,
                    adjustments, source_shift_ids
             FROM payroll_lines WHERE run_id = ?1
             ORDER BY staff_name ASC",
        )
        .map_err(|e| PayrollError::store(format!("load lines for run {run_id}"), e))?;

    let rows = stmt
        .query_map(params![run_id], |row| {
            let adjustments_raw: String = row.get(10)?;
            let source_raw: String = row.get(11)?;
            Ok(LineRow {
                id: row.get(0)?,
                staff_id: row.get(1)?,
                staff_name: row.get(2)?,
                hourly_rate: row.get(3)?,
                minutes_worked: row.get(4)?,
                gross: row.get(5)?,
                advances: row.get(6)?,
                shortages: row.get(7)?,
                other_deductions: row.get(8)?,
                net: row.get(9)?,
                adjustments: serde_json::from_str(&adjustments_raw).unwrap_or_default(),
                source_shift_ids: serde_json::from_str(&source_raw).unwrap_or_default(),
            })
        })
        .map_err(|e| PayrollError::store(format!("load lines for run {run_id}"), e))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}

/// Read a run's stored shift overrides.
pub fn load_overrides(conn: &Connection, run_id: &str) -> PayrollResult<Vec<OverrideRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT shift_id, override_start, override_end, excluded, minutes_used, expense_date
             FROM shift_overrides WHERE run_id = ?1",
        )
        .map_err(|e| PayrollError::store(format!("load overrides for run {run_id}"), e))?;

    let rows = stmt
        .query_map(params![run_id], |row| {
            Ok(OverrideRow {
                shift_id: row.get(0)?,
                override_start: row.get(1)?,
                override_end: row.get(2)?,
                excluded: row.get::<_, i64>(3)? != 0,
                minutes_used: row.get(4)?,
                expense_date: row.get(5)?,
            })
        })
        .map_err(|e| PayrollError::store(format!("load overrides for run {run_id}"), e))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}

/// Rebuild the in-memory draft editor for a stored run.
///
/// Shift rows and salary advances are re-read from their stores; saved
/// edits (rates, overrides, manual deductions) are layered back on top.
/// Reattributed advances are re-derived from the ledger rather than
/// trusted from the saved adjustment rows, so a voided or newly recorded
/// advance is reflected on the next load.
pub fn load_draft(db: &DbState, run_id: &str) -> PayrollResult<RunDraft> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| PayrollError::store("lock connection", e))?;

    let run = load_run(&conn, run_id)?
        .ok_or_else(|| PayrollError::validation(format!("Run not found: {run_id}")))?;

    let line_rows = load_lines(&conn, run_id)?;
    let override_rows = load_overrides(&conn, run_id)?;

    // Fresh authoritative reads for everything derived
    let mut all_shift_ids = Vec::new();
    for line in &line_rows {
        all_shift_ids.extend(line.source_shift_ids.iter().cloned());
    }
    let shifts = metrics::load_shifts_by_ids(&conn, &all_shift_ids)?;
    let shift_owner: std::collections::HashMap<String, String> = shifts
        .iter()
        .map(|s| (s.id.clone(), s.staff_id.clone()))
        .collect();
    let advances = ledger::salary_advances_for_shifts(&conn, &all_shift_ids)?;
    let attribution = preview::attribute_advances(advances, &shift_owner);
    let directory = crate::staff::directory(&conn)?;

    let mut shifts_by_id: std::collections::HashMap<String, crate::metrics::ShiftRow> =
        shifts.into_iter().map(|s| (s.id.clone(), s)).collect();

    let mut lines = Vec::with_capacity(line_rows.len());
    for row in line_rows {
        let mut line_shifts = Vec::with_capacity(row.source_shift_ids.len());
        for shift_id in &row.source_shift_ids {
            let shift = match shifts_by_id.remove(shift_id) {
                Some(s) => s,
                None => continue,
            };
            let own_advances = round2(
                attribution
                    .own_by_shift
                    .get(shift_id)
                    .map(|list| list.iter().map(|a| a.amount).sum())
                    .unwrap_or(0.0),
            );
            let mut line_shift = LineShift::new(shift, own_advances);
            if let Some(ov) = override_rows.iter().find(|o| &o.shift_id == shift_id) {
                line_shift.override_start = ov.override_start.clone();
                line_shift.override_end = ov.override_end.clone();
                line_shift.excluded = ov.excluded;
                line_shift.expense_date = ov.expense_date.clone();
            }
            line_shifts.push(line_shift);
        }

        // Manual deductions come from the saved row; reattributed
        // advances are re-derived
        let mut adjustments: Vec<Adjustment> = row
            .adjustments
            .into_iter()
            .filter(|a| a.kind == AdjustmentKind::ManualDeduction)
            .collect();
        if let Some(reattributed) = attribution.extra_by_beneficiary.get(&row.staff_id) {
            adjustments.extend(reattributed.iter().map(Adjustment::from_reattributed));
        }

        let mut line = RunLine {
            id: row.id,
            staff_id: row.staff_id,
            staff_name: row.staff_name.unwrap_or_default(),
            hourly_rate: row.hourly_rate,
            shifts: line_shifts,
            adjustments,
            totals: LineTotals::default(),
        };
        line.recompute();
        lines.push(line);
    }

    // A beneficiary who gained an advance since the draft was saved still
    // needs a line
    for (beneficiary, reattributed) in &attribution.extra_by_beneficiary {
        if lines.iter().any(|l| &l.staff_id == beneficiary) {
            continue;
        }
        let fallback = attribution.beneficiary_names.get(beneficiary);
        let mut line = RunLine {
            id: Uuid::new_v4().to_string(),
            staff_id: beneficiary.clone(),
            staff_name: preview::display_name(
                &directory,
                beneficiary,
                fallback.map(|s| s.as_str()),
            ),
            hourly_rate: preview::rate_for(&directory, beneficiary, &run.period_end),
            shifts: Vec::new(),
            adjustments: reattributed.iter().map(Adjustment::from_reattributed).collect(),
            totals: LineTotals::default(),
        };
        line.recompute();
        lines.push(line);
    }

    lines.sort_by(|a, b| a.staff_name.cmp(&b.staff_name));

    let mut draft = RunDraft { run, lines };
    draft.refresh_totals();
    Ok(draft)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::params;

    fn seed_staff(conn: &Connection, id: &str, name: &str, rate: f64) {
        conn.execute(
            "INSERT INTO staff (id, display_name, role, default_hourly_rate)
             VALUES (?1, ?2, 'cashier', ?3)",
            params![id, name, rate],
        )
        .unwrap();
    }

    fn seed_shift(conn: &Connection, id: &str, staff_id: &str, start: &str, end: &str) {
        conn.execute(
            "INSERT INTO staff_shifts (id, staff_id, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, staff_id, start, end],
        )
        .unwrap();
    }

    fn draft_with_edits(state: &db::DbState) -> RunDraft {
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "s1", "Ana", 50.0);
            seed_shift(&conn, "sh1", "s1", "2025-01-05T08:00:00Z", "2025-01-05T16:00:00Z");
            seed_shift(&conn, "sh2", "s1", "2025-01-06T08:00:00Z", "2025-01-06T16:00:00Z");
        }
        let mut draft =
            RunDraft::create(state, "2025-01-01", "2025-01-15", "2025-01-16", None).unwrap();
        draft
            .override_shift_times(
                "s1",
                "sh1",
                None,
                Some("2025-01-05T12:00:00Z".to_string()),
            )
            .unwrap();
        draft.add_manual_deduction("s1", "Uniform", 40.0).unwrap();
        draft
    }

    fn row_counts(conn: &Connection, run_id: &str) -> (i64, i64) {
        let lines: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM payroll_lines WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .unwrap();
        let overrides: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM shift_overrides WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .unwrap();
        (lines, overrides)
    }

    #[test]
    fn test_save_draft_writes_rows() {
        let state = db::test_state();
        let draft = draft_with_edits(&state);
        save_draft(&state, &draft).unwrap();

        let conn = state.conn.lock().unwrap();
        let (lines, overrides) = row_counts(&conn, &draft.run.id);
        assert_eq!(lines, 1);
        assert_eq!(overrides, 1, "only the overridden shift gets a row");

        let run = load_run(&conn, &draft.run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Draft);
        // 4h overridden + 8h plain at 50/hr, minus the 40 deduction
        assert_eq!(run.total_gross, 600.0);
        assert_eq!(run.total_net, 560.0);
    }

    #[test]
    fn test_save_draft_twice_is_idempotent() {
        let state = db::test_state();
        let draft = draft_with_edits(&state);
        save_draft(&state, &draft).unwrap();
        save_draft(&state, &draft).unwrap();

        let conn = state.conn.lock().unwrap();
        let (lines, overrides) = row_counts(&conn, &draft.run.id);
        assert_eq!((lines, overrides), (1, 1));

        let stored = load_lines(&conn, &draft.run.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].net, 560.0);
        assert_eq!(stored[0].adjustments.len(), 1);
    }

    #[test]
    fn test_save_clears_stale_overrides() {
        let state = db::test_state();
        let mut draft = draft_with_edits(&state);
        save_draft(&state, &draft).unwrap();

        // Undo the override; the stored row must disappear on next save
        draft
            .override_shift_times("s1", "sh1", None, None)
            .unwrap();
        save_draft(&state, &draft).unwrap();

        let conn = state.conn.lock().unwrap();
        let (_, overrides) = row_counts(&conn, &draft.run.id);
        assert_eq!(overrides, 0);
    }

    #[test]
    fn test_save_refuses_posted_run_in_store() {
        let state = db::test_state();
        let draft = draft_with_edits(&state);
        save_draft(&state, &draft).unwrap();
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                "UPDATE payroll_runs SET status = 'posted' WHERE id = ?1",
                params![draft.run.id],
            )
            .unwrap();
        }

        let err = save_draft(&state, &draft);
        assert!(matches!(err, Err(PayrollError::Conflict { .. })));
    }

    #[test]
    fn test_load_draft_round_trips_edits() {
        let state = db::test_state();
        let mut draft = draft_with_edits(&state);
        draft.set_line_rate("s1", 55.0).unwrap();
        save_draft(&state, &draft).unwrap();

        let loaded = load_draft(&state, &draft.run.id).unwrap();
        assert_eq!(loaded.lines.len(), 1);
        let line = &loaded.lines[0];
        assert_eq!(line.hourly_rate, 55.0);
        assert_eq!(line.totals.minutes, 240 + 480);
        let overridden = line.shifts.iter().find(|s| s.shift.id == "sh1").unwrap();
        assert_eq!(
            overridden.override_end.as_deref(),
            Some("2025-01-05T12:00:00Z")
        );
        assert_eq!(line.adjustments.len(), 1);
        assert_eq!(line.adjustments[0].label, "Uniform");
        assert_eq!(loaded.run.total_net, draft.run.total_net);
    }

    #[test]
    fn test_load_draft_missing_run_is_validation() {
        let state = db::test_state();
        let err = load_draft(&state, "nope");
        assert!(matches!(err, Err(PayrollError::Validation { .. })));
    }

    #[test]
    fn test_load_draft_rederives_advances() {
        let state = db::test_state();
        let draft = draft_with_edits(&state);
        save_draft(&state, &draft).unwrap();

        // An advance recorded after the draft was saved shows up on load
        {
            let conn = state.conn.lock().unwrap();
            ledger::record_salary_advance(&conn, "s1", "sh2", 90.0, "2025-01-06T12:00:00Z", None)
                .unwrap();
        }
        let loaded = load_draft(&state, &draft.run.id).unwrap();
        assert_eq!(loaded.lines[0].totals.advances, 90.0);
    }

    #[test]
    fn test_load_draft_picks_up_new_beneficiary() {
        let state = db::test_state();
        let draft = draft_with_edits(&state);
        save_draft(&state, &draft).unwrap();

        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "s2", "Bea", 60.0);
            ledger::record_salary_advance(
                &conn,
                "s1",
                "sh2",
                120.0,
                "2025-01-06T12:00:00Z",
                Some(("s2", "Bea")),
            )
            .unwrap();
        }

        let loaded = load_draft(&state, &draft.run.id).unwrap();
        assert_eq!(loaded.lines.len(), 2);
        let bea = loaded.lines.iter().find(|l| l.staff_id == "s2").unwrap();
        assert_eq!(bea.totals.other_deductions, 120.0);
        assert_eq!(bea.totals.net, -120.0);
    }
}
