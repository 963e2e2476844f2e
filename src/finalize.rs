//! Finalize/posting engine.
//!
//! Takes a draft run through `draft → posting → posted`. The posting
//! state is a run-level lock: the transition is a conditional update, so
//! two administrators finalizing the same run cannot both get through,
//! and a run found in `posting` at rest was interrupted mid-write and can
//! be re-finalized.
//!
//! Posting is not one atomic transaction — the row count can exceed what
//! a single batch may carry — so the write phase is chunked and leans on
//! a compensating pattern instead: every transaction previously tagged
//! with the run is voided before a fresh set is written. A failure
//! between chunks leaves the run in `posting` with its postings partially
//! written; re-invoking finalize voids whatever landed and posts again.
//! Amounts are never edited in place.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::db::{self, BatchWriter, DbState};
use crate::error::{PayrollError, PayrollResult};
use crate::ledger::{self, SalaryPosting};
use crate::line::{AdjustmentKind, PostingMode, RunDraft, RunLine, RunStatus};
use crate::metrics;
use crate::money::round2;
use crate::run_store;
use crate::timeclock::to_hours;

// ---------------------------------------------------------------------------
// Public shapes
// ---------------------------------------------------------------------------

/// What the confirmation callback sees before anything is written.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSummary {
    pub run_id: String,
    pub pay_date: String,
    pub posting_mode: String,
    pub staff_count: usize,
    pub posting_count: usize,
    pub total_gross: f64,
    pub total_deductions: f64,
    pub total_net: f64,
    pub attempt: i64,
}

/// Result of a completed finalize.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub run_id: String,
    pub voided: usize,
    pub postings: usize,
    pub paystubs: usize,
    pub batches: usize,
    pub total_net: f64,
}

/// One shift as it appears on a paystub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaystubShift {
    pub shift_id: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub minutes: i64,
    pub hours: f64,
    /// This shift's slice of the line gross. Slices always sum exactly to
    /// the line gross; the last one absorbs the rounding remainder.
    pub gross_share: f64,
}

/// One itemized deduction on a paystub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaystubDeduction {
    pub kind: String,
    pub label: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_id: Option<String>,
}

/// Immutable per-staff snapshot of a finalized run.
#[derive(Debug, Clone)]
pub struct Paystub {
    pub id: String,
    pub run_id: String,
    pub staff_id: String,
    pub staff_name: String,
    pub hourly_rate: f64,
    pub minutes_worked: i64,
    pub gross: f64,
    pub total_deductions: f64,
    pub net: f64,
    pub shifts: Vec<PaystubShift>,
    pub deductions: Vec<PaystubDeduction>,
}

/// Confirmation hook invoked with the computed summary before the write
/// phase. Returning false aborts with nothing written.
pub type ConfirmFn<'a> = &'a dyn Fn(&FinalizeSummary) -> bool;

// ---------------------------------------------------------------------------
// Posting plan (pure)
// ---------------------------------------------------------------------------

struct LinePlan {
    paystub: Paystub,
    postings: Vec<SalaryPosting>,
    /// Shift ids this line actually pays (excluded shifts are not consumed).
    consumed_shift_ids: Vec<String>,
}

/// Prorate the line gross across its paying shifts.
///
/// Every share but the last is `round2(minutes/60 × rate)`; the last is
/// the remainder so the shares reconcile exactly with the line gross.
fn gross_shares(line: &RunLine) -> Vec<(usize, f64)> {
    let paying: Vec<usize> = line
        .shifts
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.excluded)
        .map(|(i, _)| i)
        .collect();

    let mut shares = Vec::with_capacity(paying.len());
    let mut allocated = 0.0;
    for (pos, &idx) in paying.iter().enumerate() {
        let share = if pos + 1 == paying.len() {
            round2(line.totals.gross - allocated)
        } else {
            let shift = &line.shifts[idx];
            round2((shift.minutes_used as f64 / 60.0) * line.hourly_rate)
        };
        allocated = round2(allocated + share);
        shares.push((idx, share));
    }
    shares
}

fn plan_line(run: &crate::line::PayrollRun, line: &RunLine) -> LinePlan {
    let shares = gross_shares(line);

    let mut shifts = Vec::with_capacity(shares.len());
    let mut deductions = Vec::new();
    let mut postings = Vec::new();
    let mut consumed_shift_ids = Vec::with_capacity(shares.len());

    for &(idx, share) in &shares {
        let shift = &line.shifts[idx];
        consumed_shift_ids.push(shift.shift.id.clone());

        shifts.push(PaystubShift {
            shift_id: shift.shift.id.clone(),
            start_time: shift.effective_start().map(|s| s.to_string()),
            end_time: shift.effective_end().map(|s| s.to_string()),
            minutes: shift.minutes_used,
            hours: to_hours(shift.minutes_used),
            gross_share: share,
        });

        if shift.advances > 0.0 {
            deductions.push(PaystubDeduction {
                kind: "advance".to_string(),
                label: format!("Advances during shift {}", shift.shift.id),
                amount: shift.advances,
                shift_id: Some(shift.shift.id.clone()),
            });
        }
        if shift.shortage > 0.0 {
            deductions.push(PaystubDeduction {
                kind: "shortage".to_string(),
                label: format!("Cash shortage on shift {}", shift.shift.id),
                amount: shift.shortage,
                shift_id: Some(shift.shift.id.clone()),
            });
        }

        if run.mode == PostingMode::PerShift {
            let amount = round2(share - shift.own_deductions());
            let dated = shift
                .expense_date
                .clone()
                .or_else(|| shift.effective_end().map(|s| s.to_string()))
                .unwrap_or_else(|| run.pay_date.clone());
            if amount != 0.0 {
                postings.push(SalaryPosting {
                    run_id: run.id.clone(),
                    staff_id: line.staff_id.clone(),
                    amount,
                    dated,
                    shift_id: Some(shift.shift.id.clone()),
                    description: format!("Salary for shift {}", shift.shift.id),
                });
            }
        }
    }

    for adjustment in &line.adjustments {
        let kind = match adjustment.kind {
            AdjustmentKind::ManualDeduction => "manual",
            AdjustmentKind::ExtraAdvance => "extra-advance",
        };
        deductions.push(PaystubDeduction {
            kind: kind.to_string(),
            label: adjustment.label.clone(),
            amount: adjustment.amount,
            shift_id: None,
        });
    }

    match run.mode {
        PostingMode::PerStaff => {
            if line.totals.net != 0.0 {
                postings.push(SalaryPosting {
                    run_id: run.id.clone(),
                    staff_id: line.staff_id.clone(),
                    amount: line.totals.net,
                    dated: run.pay_date.clone(),
                    shift_id: None,
                    description: format!(
                        "Salary for {} ({} – {})",
                        line.staff_name, run.period_start, run.period_end
                    ),
                });
            }
        }
        PostingMode::PerShift => {
            // Deductions no shift can carry post once per staff at pay date
            if line.totals.other_deductions != 0.0 {
                postings.push(SalaryPosting {
                    run_id: run.id.clone(),
                    staff_id: line.staff_id.clone(),
                    amount: round2(-line.totals.other_deductions),
                    dated: run.pay_date.clone(),
                    shift_id: None,
                    description: format!("Payroll deductions for {}", line.staff_name),
                });
            }
        }
    }

    let total_deductions = round2(
        line.totals.advances + line.totals.shortages + line.totals.other_deductions,
    );

    LinePlan {
        paystub: Paystub {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            staff_id: line.staff_id.clone(),
            staff_name: line.staff_name.clone(),
            hourly_rate: line.hourly_rate,
            minutes_worked: line.totals.minutes,
            gross: line.totals.gross,
            total_deductions,
            net: line.totals.net,
            shifts,
            deductions,
        },
        postings,
        consumed_shift_ids,
    }
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

/// Post a run: void any previous postings, write paystubs and fresh
/// ledger entries, tag the consumed shifts, and mark the run posted.
///
/// Accepts runs in `draft` and in `posting` (an interrupted earlier
/// attempt). `confirm`, when given, sees the computed summary before the
/// write phase and can abort it.
pub fn finalize_run(
    db: &DbState,
    run_id: &str,
    confirm: Option<ConfirmFn<'_>>,
) -> PayrollResult<FinalizeOutcome> {
    if run_id.trim().is_empty() {
        return Err(PayrollError::validation("Run id is required"));
    }

    // Fresh authoritative read of the run and everything it derives from
    let draft = run_store::load_draft(db, run_id)?;
    match draft.run.status {
        RunStatus::Draft | RunStatus::Posting => {}
        RunStatus::Posted => {
            return Err(PayrollError::conflict(format!(
                "Run {run_id} is already posted"
            )))
        }
        RunStatus::Voided => {
            return Err(PayrollError::conflict(format!("Run {run_id} is voided")))
        }
    }

    // Persist the recomputed draft so the stored rows match what is posted
    run_store::save_draft(db, &draft)?;

    let conn = db
        .conn
        .lock()
        .map_err(|e| PayrollError::store("lock connection", e))?;

    // Run-level lock: only a draft (or our own interrupted posting) may
    // pass. A concurrent finalize that got here first wins.
    let locked = conn
        .execute(
            "UPDATE payroll_runs
             SET status = 'posting', attempt = attempt + 1, updated_at = datetime('now')
             WHERE id = ?1 AND status IN ('draft', 'posting')",
            params![run_id],
        )
        .map_err(|e| PayrollError::store(format!("lock run {run_id}"), e))?;
    if locked == 0 {
        return Err(PayrollError::conflict(format!(
            "Run {run_id} was posted or voided by another actor"
        )));
    }
    let attempt: i64 = conn
        .query_row(
            "SELECT attempt FROM payroll_runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .map_err(|e| PayrollError::store(format!("read attempt for run {run_id}"), e))?;

    // Plan everything in memory before touching the ledger
    let plans: Vec<LinePlan> = draft
        .lines
        .iter()
        .map(|line| plan_line(&draft.run, line))
        .collect();
    let posting_count: usize = plans.iter().map(|p| p.postings.len()).sum();

    let summary = FinalizeSummary {
        run_id: run_id.to_string(),
        pay_date: draft.run.pay_date.clone(),
        posting_mode: draft.run.mode.as_str().to_string(),
        staff_count: draft.lines.len(),
        posting_count,
        total_gross: draft.run.total_gross,
        total_deductions: draft.run.total_deductions,
        total_net: draft.run.total_net,
        attempt,
    };

    if let Some(confirm) = confirm {
        if !confirm(&summary) {
            conn.execute(
                "UPDATE payroll_runs SET status = 'draft', updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'posting'",
                params![run_id],
            )
            .map_err(|e| PayrollError::store(format!("unlock run {run_id}"), e))?;
            info!(run_id = %run_id, "Finalize declined by caller");
            return Err(PayrollError::Aborted);
        }
    }

    // Write phase, chunked. A failure leaves the run in 'posting' with
    // the attempt marker bumped; the operator recovers by re-finalizing.
    let mut writer = BatchWriter::begin(&conn, &format!("finalize run {run_id}"))?;
    let result = write_postings(&conn, &mut writer, run_id, &draft, &plans);
    let (voided, batches) = match result {
        Ok(voided) => {
            let batches = writer.finish()?;
            (voided, batches)
        }
        Err(e) => {
            writer.abandon();
            error!(
                run_id = %run_id,
                attempt = attempt,
                error = %e,
                "Finalize failed mid-write, run left in posting for recovery"
            );
            return Err(e);
        }
    };

    info!(
        run_id = %run_id,
        attempt = attempt,
        voided = voided,
        postings = posting_count,
        paystubs = plans.len(),
        total_net = %draft.run.total_net,
        "Run posted"
    );

    Ok(FinalizeOutcome {
        run_id: run_id.to_string(),
        voided,
        postings: posting_count,
        paystubs: plans.len(),
        batches,
        total_net: draft.run.total_net,
    })
}

fn write_postings(
    conn: &Connection,
    writer: &mut BatchWriter<'_>,
    run_id: &str,
    draft: &RunDraft,
    plans: &[LinePlan],
) -> PayrollResult<usize> {
    // Compensating step: neutralize anything a previous attempt posted
    let voided = ledger::void_run_transactions(conn, run_id)?;
    writer.bump()?;

    // Paystubs are rewritten wholesale
    conn.execute("DELETE FROM paystubs WHERE run_id = ?1", params![run_id])
        .map_err(|e| PayrollError::store(format!("clear paystubs for run {run_id}"), e))?;
    writer.bump()?;

    for plan in plans {
        insert_paystub(conn, &plan.paystub)?;
        writer.bump()?;

        for posting in &plan.postings {
            ledger::insert_salary_posting(conn, posting)?;
            writer.bump()?;
        }

        for shift_id in &plan.consumed_shift_ids {
            metrics::tag_shift_with_run(conn, shift_id, run_id)?;
            writer.bump()?;
        }
    }

    conn.execute(
        "UPDATE payroll_runs
         SET status = 'posted',
             total_gross = ?2, total_deductions = ?3, total_net = ?4,
             updated_at = datetime('now')
         WHERE id = ?1",
        params![
            run_id,
            draft.run.total_gross,
            draft.run.total_deductions,
            draft.run.total_net,
        ],
    )
    .map_err(|e| PayrollError::store(format!("mark run {run_id} posted"), e))?;
    writer.bump()?;

    db::set_setting(conn, "payroll", "last_finalized_run_id", run_id)?;
    writer.bump()?;

    Ok(voided)
}

fn insert_paystub(conn: &Connection, stub: &Paystub) -> PayrollResult<()> {
    let shifts = serde_json::to_string(&stub.shifts)
        .map_err(|e| PayrollError::store("serialize paystub shifts", e))?;
    let deductions = serde_json::to_string(&stub.deductions)
        .map_err(|e| PayrollError::store("serialize paystub deductions", e))?;

    conn.execute(
        "INSERT INTO paystubs (
            id, run_id, staff_id, staff_name, hourly_rate, minutes_worked,
            gross, total_deductions, net, shifts, deductions
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            stub.id,
            stub.run_id,
            stub.staff_id,
            stub.staff_name,
            stub.hourly_rate,
            stub.minutes_worked,
            stub.gross,
            stub.total_deductions,
            stub.net,
            shifts,
            deductions,
        ],
    )
    .map_err(|e| {
        PayrollError::store(format!("insert paystub for staff {}", stub.staff_id), e)
    })?;
    Ok(())
}

/// Read the paystubs written for a run, ordered by staff name.
pub fn load_paystubs(db: &DbState, run_id: &str) -> PayrollResult<Vec<Paystub>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| PayrollError::store("lock connection", e))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, run_id, staff_id, staff_name, hourly_rate, minutes_worked,
                    gross, total_deductions, net, shifts, deductions
             FROM paystubs WHERE run_id = ?1
             ORDER BY staff_name ASC",
        )
        .map_err(|e| PayrollError::store(format!("load paystubs for run {run_id}"), e))?;

    let rows = stmt
        .query_map(params![run_id], |row| {
            let shifts_raw: String = row.get(9)?;
            let deductions_raw: String = row.get(10)?;
            Ok(Paystub {
                id: row.get(0)?,
                run_id: row.get(1)?,
                staff_id: row.get(2)?,
                staff_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                hourly_rate: row.get(4)?,
                minutes_worked: row.get(5)?,
                gross: row.get(6)?,
                total_deductions: row.get(7)?,
                net: row.get(8)?,
                shifts: serde_json::from_str(&shifts_raw).unwrap_or_default(),
                deductions: serde_json::from_str(&deductions_raw).unwrap_or_default(),
            })
        })
        .map_err(|e| PayrollError::store(format!("load paystubs for run {run_id}"), e))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Administrative void
// ---------------------------------------------------------------------------

/// Void a posted run: neutralize its ledger entries and release its
/// shifts for a future run. Paystubs stay as the historical record of
/// what was posted.
pub fn void_run(db: &DbState, run_id: &str) -> PayrollResult<usize> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| PayrollError::store("lock connection", e))?;

    let run = run_store::load_run(&conn, run_id)?
        .ok_or_else(|| PayrollError::validation(format!("Run not found: {run_id}")))?;
    if run.status != RunStatus::Posted {
        return Err(PayrollError::conflict(format!(
            "Only posted runs can be voided (run {run_id} is {})",
            run.status.as_str()
        )));
    }

    let mut writer = BatchWriter::begin(&conn, &format!("void run {run_id}"))?;
    let result = (|| -> PayrollResult<usize> {
        let voided = ledger::void_run_transactions(&conn, run_id)?;
        writer.bump()?;
        metrics::clear_run_tags(&conn, run_id)?;
        writer.bump()?;
        conn.execute(
            "UPDATE payroll_runs SET status = 'voided', updated_at = datetime('now')
             WHERE id = ?1",
            params![run_id],
        )
        .map_err(|e| PayrollError::store(format!("mark run {run_id} voided"), e))?;
        writer.bump()?;
        Ok(voided)
    })();

    match result {
        Ok(voided) => {
            writer.finish()?;
            info!(run_id = %run_id, voided = voided, "Run voided");
            Ok(voided)
        }
        Err(e) => {
            writer.abandon();
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
