//! Payroll preview builder.
//!
//! Scans a pay period, groups shifts by staff, resolves rates as of the
//! period end, and produces one preview line per staff member. The
//! advance-attribution pass runs here as a single explicit step: every
//! salary advance touching an in-period shift is routed either to the
//! shift owner's line or, when the intended beneficiary differs, to the
//! beneficiary's line — creating that line even when the beneficiary
//! worked no shifts. A misrecorded advance must never shrink the wrong
//! person's pay.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{PayrollError, PayrollResult};
use crate::ledger::{self, AdvanceRecord};
use crate::metrics::{self, ShiftRow};
use crate::money::round2;
use crate::rates::resolve_rate;
use crate::staff::{self, StaffRecord};
use crate::timeclock::{parse_timestamp, to_hours};

// ---------------------------------------------------------------------------
// Advance attribution pass
// ---------------------------------------------------------------------------

/// An advance that belongs to a different staff member than the one whose
/// shift it was recorded under.
#[derive(Debug, Clone, Serialize)]
pub struct ReattributedAdvance {
    pub txn_id: String,
    pub shift_id: String,
    pub recorded_staff_id: String,
    pub amount: f64,
}

/// Output of the attribution pass: advances split between shift owners
/// and reattributed beneficiaries.
#[derive(Debug, Default)]
pub(crate) struct AdvanceAttribution {
    /// shift id → advances owed by the shift's own staff
    pub own_by_shift: HashMap<String, Vec<AdvanceRecord>>,
    /// beneficiary staff id → advances recorded under someone else's shift
    pub extra_by_beneficiary: HashMap<String, Vec<ReattributedAdvance>>,
    /// beneficiary staff id → display name carried on the transaction
    pub beneficiary_names: HashMap<String, String>,
}

/// Route each advance to the shift owner or the intended beneficiary.
///
/// `shift_owner` maps shift id → owning staff id for the period's shifts.
pub(crate) fn attribute_advances(
    advances: Vec<AdvanceRecord>,
    shift_owner: &HashMap<String, String>,
) -> AdvanceAttribution {
    let mut out = AdvanceAttribution::default();

    for advance in advances {
        let owner = match shift_owner.get(&advance.shift_id) {
            Some(owner) => owner.as_str(),
            None => {
                warn!(
                    txn_id = %advance.txn_id,
                    shift_id = %advance.shift_id,
                    "Advance references a shift outside this pass, skipping"
                );
                continue;
            }
        };

        match advance.beneficiary_id.as_deref() {
            Some(beneficiary) if beneficiary != owner => {
                if let Some(name) = &advance.beneficiary_name {
                    out.beneficiary_names
                        .entry(beneficiary.to_string())
                        .or_insert_with(|| name.clone());
                }
                out.extra_by_beneficiary
                    .entry(beneficiary.to_string())
                    .or_default()
                    .push(ReattributedAdvance {
                        txn_id: advance.txn_id,
                        shift_id: advance.shift_id,
                        recorded_staff_id: advance.recorded_staff_id,
                        amount: advance.amount,
                    });
            }
            _ => {
                out.own_by_shift
                    .entry(advance.shift_id.clone())
                    .or_default()
                    .push(advance);
            }
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Period data collection
// ---------------------------------------------------------------------------

/// Everything a preview or draft build needs from one authoritative read
/// of the period: shifts grouped by staff, the attribution table, and the
/// staff directory.
pub(crate) struct PeriodData {
    pub shifts_by_staff: BTreeMap<String, Vec<ShiftRow>>,
    pub attribution: AdvanceAttribution,
    pub directory: HashMap<String, StaffRecord>,
}

/// Validate the period bounds. Day-granular; inverted or unparsable
/// bounds are rejected before anything is read.
pub(crate) fn validate_period(from: &str, to: &str) -> PayrollResult<()> {
    if from.trim().is_empty() || to.trim().is_empty() {
        return Err(PayrollError::validation("Pay period start and end are required"));
    }
    let (start, end) = match (parse_timestamp(from), parse_timestamp(to)) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            return Err(PayrollError::validation(format!(
                "Unparsable pay period bounds: {from} .. {to}"
            )))
        }
    };
    if start > end {
        return Err(PayrollError::validation(format!(
            "Pay period start {from} is after end {to}"
        )));
    }
    Ok(())
}

pub(crate) fn collect_period_data(
    conn: &Connection,
    from: &str,
    to: &str,
) -> PayrollResult<PeriodData> {
    let shifts = metrics::load_shifts_in_period(conn, from, to)?;

    let mut shifts_by_staff: BTreeMap<String, Vec<ShiftRow>> = BTreeMap::new();
    let mut shift_owner: HashMap<String, String> = HashMap::new();
    let mut shift_ids = Vec::new();

    for shift in shifts {
        // A shift already consumed by another run is not payable again
        if let Some(prior_run) = &shift.payroll_run_id {
            warn!(
                shift_id = %shift.id,
                run_id = %prior_run,
                "Shift already paid by another run, skipping"
            );
            continue;
        }
        shift_owner.insert(shift.id.clone(), shift.staff_id.clone());
        shift_ids.push(shift.id.clone());
        shifts_by_staff
            .entry(shift.staff_id.clone())
            .or_default()
            .push(shift);
    }

    let advances = ledger::salary_advances_for_shifts(conn, &shift_ids)?;
    let attribution = attribute_advances(advances, &shift_owner);
    let directory = staff::directory(conn)?;

    Ok(PeriodData {
        shifts_by_staff,
        attribution,
        directory,
    })
}

/// Resolve a display name: directory first, then what the rows carry.
pub(crate) fn display_name(
    directory: &HashMap<String, StaffRecord>,
    staff_id: &str,
    fallback: Option<&str>,
) -> String {
    directory
        .get(staff_id)
        .map(|s| s.display_name.clone())
        .or_else(|| fallback.map(|f| f.to_string()))
        .unwrap_or_else(|| staff_id.to_string())
}

/// Resolve the hourly rate for a staff id as of the period end. A staff
/// member missing from the directory resolves through an empty profile
/// (rate 0, surfaced in the resolver's log).
pub(crate) fn rate_for(
    directory: &HashMap<String, StaffRecord>,
    staff_id: &str,
    as_of: &str,
) -> f64 {
    match directory.get(staff_id) {
        Some(profile) => resolve_rate(profile, as_of),
        None => {
            let placeholder = StaffRecord {
                id: staff_id.to_string(),
                display_name: staff_id.to_string(),
                role: String::new(),
                is_active: false,
                default_hourly_rate: 0.0,
                rate_history: Vec::new(),
            };
            resolve_rate(&placeholder, as_of)
        }
    }
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

/// One shift as it appears on a preview line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewShift {
    pub shift_id: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub minutes: i64,
    pub hours: f64,
    pub shortage: f64,
    pub advances: f64,
}

/// One staff member's computed pay for the previewed period.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewLine {
    pub staff_id: String,
    pub staff_name: String,
    pub hourly_rate: f64,
    pub minutes: i64,
    pub gross: f64,
    pub advances: f64,
    pub shortages: f64,
    pub extra_advances: f64,
    pub net: f64,
    pub shifts: Vec<PreviewShift>,
    pub reattributed: Vec<ReattributedAdvance>,
}

/// A whole-period preview, one line per staff, sorted by display name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewReport {
    pub period_start: String,
    pub period_end: String,
    pub lines: Vec<PreviewLine>,
    pub total_gross: f64,
    pub total_net: f64,
}

/// Build a payroll preview for `[from, to]`.
///
/// Reads authoritative state fresh; nothing is written. Staff with no
/// shifts still get a line when a reattributed advance lands on them.
pub fn build_preview(db: &DbState, from: &str, to: &str) -> PayrollResult<PreviewReport> {
    validate_period(from, to)?;

    let conn = db.conn.lock().map_err(|e| PayrollError::store("lock connection", e))?;
    let data = collect_period_data(&conn, from, to)?;

    let mut lines: Vec<PreviewLine> = Vec::new();
    let mut covered: Vec<String> = Vec::new();

    for (staff_id, shifts) in &data.shifts_by_staff {
        covered.push(staff_id.clone());
        let rate = rate_for(&data.directory, staff_id, to);

        let mut minutes = 0_i64;
        let mut advances = 0.0;
        let mut shortages = 0.0;
        let mut preview_shifts = Vec::with_capacity(shifts.len());

        for shift in shifts {
            let shift_minutes = shift.minutes_worked();
            let shift_shortage = shift.shortage();
            let shift_advances = round2(
                data.attribution
                    .own_by_shift
                    .get(&shift.id)
                    .map(|list| list.iter().map(|a| a.amount).sum())
                    .unwrap_or(0.0),
            );

            minutes += shift_minutes;
            advances = round2(advances + shift_advances);
            shortages = round2(shortages + shift_shortage);

            preview_shifts.push(PreviewShift {
                shift_id: shift.id.clone(),
                start_time: shift.start_time.clone(),
                end_time: shift.end_time.clone(),
                minutes: shift_minutes,
                hours: to_hours(shift_minutes),
                shortage: shift_shortage,
                advances: shift_advances,
            });
        }

        let reattributed = data
            .attribution
            .extra_by_beneficiary
            .get(staff_id)
            .cloned()
            .unwrap_or_default();
        let extra_advances = round2(reattributed.iter().map(|a| a.amount).sum());

        let gross = round2((minutes as f64 / 60.0) * rate);
        let net = round2(gross - advances - shortages - extra_advances);
        let staff_name = display_name(
            &data.directory,
            staff_id,
            shifts.first().and_then(|s| s.staff_name.as_deref()),
        );

        lines.push(PreviewLine {
            staff_id: staff_id.clone(),
            staff_name,
            hourly_rate: rate,
            minutes,
            gross,
            advances,
            shortages,
            extra_advances,
            net,
            shifts: preview_shifts,
            reattributed,
        });
    }

    // Beneficiaries with no shifts in the period still owe their advances
    for (beneficiary, reattributed) in &data.attribution.extra_by_beneficiary {
        if covered.contains(beneficiary) {
            continue;
        }
        let extra_advances = round2(reattributed.iter().map(|a| a.amount).sum());
        let fallback = data.attribution.beneficiary_names.get(beneficiary);
        lines.push(PreviewLine {
            staff_id: beneficiary.clone(),
            staff_name: display_name(&data.directory, beneficiary, fallback.map(|s| s.as_str())),
            hourly_rate: rate_for(&data.directory, beneficiary, to),
            minutes: 0,
            gross: 0.0,
            advances: 0.0,
            shortages: 0.0,
            extra_advances,
            net: round2(-extra_advances),
            shifts: Vec::new(),
            reattributed: reattributed.clone(),
        });
    }

    lines.sort_by(|a, b| a.staff_name.cmp(&b.staff_name));

    let total_gross = round2(lines.iter().map(|l| l.gross).sum());
    let total_net = round2(lines.iter().map(|l| l.net).sum());

    info!(
        from = %from,
        to = %to,
        staff = lines.len(),
        total_net = %total_net,
        "Payroll preview built"
    );

    Ok(PreviewReport {
        period_start: from.to_string(),
        period_end: to.to_string(),
        lines,
        total_gross,
        total_net,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::params;

    fn seed_staff(conn: &Connection, id: &str, name: &str, rate: f64, history: &str) {
        conn.execute(
            "INSERT INTO staff (id, display_name, role, default_hourly_rate, rate_history)
             VALUES (?1, ?2, 'cashier', ?3, ?4)",
            params![id, name, rate, history],
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

    #[test]
    fn test_missing_period_is_validation_error() {
        let state = db::test_state();
        let err = build_preview(&state, "", "2025-01-15");
        assert!(matches!(err, Err(PayrollError::Validation { .. })));
        let err = build_preview(&state, "2025-01-15", "2025-01-01");
        assert!(matches!(err, Err(PayrollError::Validation { .. })));
    }

    #[test]
    fn test_single_shift_gross_and_shortage() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "s1", "Ana", 50.0, "[]");
            conn.execute(
                "INSERT INTO staff_shifts (id, staff_id, start_time, end_time, cash_count, total_cash, expenses_total)
                 VALUES ('sh1', 's1', '2025-01-05T08:00:00Z', '2025-01-05T16:00:00Z',
                         '{\"100\": 9}', 1000.0, 0.0)",
                [],
            )
            .unwrap();
        }

        let report = build_preview(&state, "2025-01-01", "2025-01-15").unwrap();
        assert_eq!(report.lines.len(), 1);
        let line = &report.lines[0];
        assert_eq!(line.minutes, 480);
        assert_eq!(line.gross, 400.0);
        assert_eq!(line.shortages, 100.0);
        assert_eq!(line.net, 300.0);
    }

    #[test]
    fn test_rate_resolved_as_of_period_end() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(
                &conn,
                "s1",
                "Ana",
                40.0,
                r#"[{"rate":50,"effectiveFrom":"2025-01-01"},{"rate":60,"effectiveFrom":"2025-01-10"}]"#,
            );
            // Shift worked before the raise still pays at the period-end rate
            seed_shift(&conn, "sh1", "s1", "2025-01-05T08:00:00Z", "2025-01-05T16:00:00Z");
        }

        let report = build_preview(&state, "2025-01-01", "2025-01-15").unwrap();
        assert_eq!(report.lines[0].hourly_rate, 60.0);
        assert_eq!(report.lines[0].gross, 480.0);
    }

    #[test]
    fn test_advance_reattributed_to_beneficiary() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "sa", "Ana", 50.0, "[]");
            seed_staff(&conn, "sb", "Bea", 50.0, "[]");
            seed_shift(&conn, "sh-a", "sa", "2025-01-05T08:00:00Z", "2025-01-05T16:00:00Z");
            // Advance recorded under Ana's shift but intended for Bea
            ledger::record_salary_advance(
                &conn,
                "sa",
                "sh-a",
                150.0,
                "2025-01-05T12:00:00Z",
                Some(("sb", "Bea")),
            )
            .unwrap();
        }

        let report = build_preview(&state, "2025-01-01", "2025-01-15").unwrap();
        assert_eq!(report.lines.len(), 2);

        let ana = report.lines.iter().find(|l| l.staff_id == "sa").unwrap();
        assert_eq!(ana.advances, 0.0, "owner must not be charged");
        assert_eq!(ana.net, 400.0);

        let bea = report.lines.iter().find(|l| l.staff_id == "sb").unwrap();
        assert!(bea.shifts.is_empty());
        assert_eq!(bea.extra_advances, 150.0);
        assert_eq!(bea.net, -150.0);
        assert_eq!(bea.reattributed[0].recorded_staff_id, "sa");
    }

    #[test]
    fn test_own_advance_stays_on_owner() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "s1", "Ana", 50.0, "[]");
            seed_shift(&conn, "sh1", "s1", "2025-01-05T08:00:00Z", "2025-01-05T16:00:00Z");
            ledger::record_salary_advance(&conn, "s1", "sh1", 80.0, "2025-01-05T12:00:00Z", None)
                .unwrap();
        }

        let report = build_preview(&state, "2025-01-01", "2025-01-15").unwrap();
        let line = &report.lines[0];
        assert_eq!(line.advances, 80.0);
        assert_eq!(line.net, 320.0);
        assert!(line.reattributed.is_empty());
    }

    #[test]
    fn test_lines_sorted_by_display_name() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "s1", "Carlos", 50.0, "[]");
            seed_staff(&conn, "s2", "Ana", 50.0, "[]");
            seed_shift(&conn, "sh1", "s1", "2025-01-05T08:00:00Z", "2025-01-05T12:00:00Z");
            seed_shift(&conn, "sh2", "s2", "2025-01-06T08:00:00Z", "2025-01-06T12:00:00Z");
        }

        let report = build_preview(&state, "2025-01-01", "2025-01-15").unwrap();
        let names: Vec<&str> = report.lines.iter().map(|l| l.staff_name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Carlos"]);
    }

    #[test]
    fn test_already_paid_shift_excluded() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "s1", "Ana", 50.0, "[]");
            seed_shift(&conn, "sh1", "s1", "2025-01-05T08:00:00Z", "2025-01-05T16:00:00Z");
            conn.execute(
                "UPDATE staff_shifts SET payroll_run_id = 'old-run' WHERE id = 'sh1'",
                [],
            )
            .unwrap();
        }

        let report = build_preview(&state, "2025-01-01", "2025-01-15").unwrap();
        assert!(report.lines.is_empty());
    }

    #[test]
    fn test_shift_missing_timestamps_contributes_zero() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_staff(&conn, "s1", "Ana", 50.0, "[]");
            seed_shift(&conn, "sh1", "s1", "2025-01-05T08:00:00Z", "2025-01-05T16:00:00Z");
            conn.execute(
                "INSERT INTO staff_shifts (id, staff_id, start_time) VALUES ('sh2', 's1', '2025-01-06T08:00:00Z')",
                [],
            )
            .unwrap();
        }

        let report = build_preview(&state, "2025-01-01", "2025-01-15").unwrap();
        // Both shifts load, the unfinished one adds nothing
        assert_eq!(report.lines[0].shifts.len(), 2);
        assert_eq!(report.lines[0].minutes, 480);
        assert_eq!(report.lines[0].gross, 400.0);
    }
}
