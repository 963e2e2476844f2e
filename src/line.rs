//! Run line model and draft editor.
//!
//! A run is corrected interactively before it is posted: shift times can
//! be overridden, shifts excluded, manual deductions added. Every mutation
//! recomputes only the touched line — minutes, gross, advances, shortages,
//! other deductions, net — from its own rows. Nothing is persisted here;
//! `run_store::save_draft` writes the state and `finalize::finalize_run`
//! posts it.
//!
//! All editor methods are status-guarded: once a run has left `draft`,
//! mutation attempts return a conflict instead of silently rewriting
//! posted money.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{PayrollError, PayrollResult};
use crate::metrics::ShiftRow;
use crate::money::round2;
use crate::preview::{self, ReattributedAdvance};
use crate::timeclock::{minutes_between, parse_timestamp};

// ---------------------------------------------------------------------------
// Run header types
// ---------------------------------------------------------------------------

/// How posted salary expenses are distributed in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingMode {
    /// One expense per staff member, dated at the run's pay date.
    PerStaff,
    /// One expense per shift, dated at each shift's expense date.
    PerShift,
}

impl PostingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostingMode::PerStaff => "per-staff",
            PostingMode::PerShift => "per-shift",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "per-staff" => Some(PostingMode::PerStaff),
            "per-shift" => Some(PostingMode::PerShift),
            _ => None,
        }
    }
}

/// Lifecycle of a payroll run.
///
/// `Posting` is the transient lock state the finalize engine holds while
/// writing; a run found in `Posting` at rest was interrupted mid-post and
/// needs to be re-finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Draft,
    Posting,
    Posted,
    Voided,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Draft => "draft",
            RunStatus::Posting => "posting",
            RunStatus::Posted => "posted",
            RunStatus::Voided => "voided",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(RunStatus::Draft),
            "posting" => Some(RunStatus::Posting),
            "posted" => Some(RunStatus::Posted),
            "voided" => Some(RunStatus::Voided),
            _ => None,
        }
    }
}

/// A payroll run header with its aggregate totals snapshot.
#[derive(Debug, Clone)]
pub struct PayrollRun {
    pub id: String,
    pub period_start: String,
    pub period_end: String,
    pub pay_date: String,
    pub mode: PostingMode,
    pub status: RunStatus,
    pub attempt: i64,
    pub total_gross: f64,
    pub total_deductions: f64,
    pub total_net: f64,
}

// ---------------------------------------------------------------------------
// Adjustments
// ---------------------------------------------------------------------------

/// Kind of an adjustment record on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentKind {
    /// An ad-hoc deduction the administrator typed in.
    #[serde(rename = "manual-deduction")]
    ManualDeduction,
    /// An advance recorded under someone else's shift, reattributed here.
    #[serde(rename = "extra-advance")]
    ExtraAdvance,
}

/// One deduction adjustment on a payroll line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adjustment {
    pub kind: AdjustmentKind,
    pub label: String,
    pub amount: f64,
    /// Ledger transaction behind an extra-advance, absent for manual rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_txn_id: Option<String>,
    /// Staff member whose shift the extra-advance was recorded under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_staff_id: Option<String>,
}

impl Adjustment {
    pub fn manual(label: impl Into<String>, amount: f64) -> Self {
        Adjustment {
            kind: AdjustmentKind::ManualDeduction,
            label: label.into(),
            amount,
            source_txn_id: None,
            recorded_staff_id: None,
        }
    }

    pub(crate) fn from_reattributed(advance: &ReattributedAdvance) -> Self {
        Adjustment {
            kind: AdjustmentKind::ExtraAdvance,
            label: format!("Advance recorded under shift {}", advance.shift_id),
            amount: advance.amount,
            source_txn_id: Some(advance.txn_id.clone()),
            recorded_staff_id: Some(advance.recorded_staff_id.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Line model
// ---------------------------------------------------------------------------

/// One source shift on a line, with its per-run corrections.
#[derive(Debug, Clone)]
pub struct LineShift {
    pub shift: ShiftRow,
    pub override_start: Option<String>,
    pub override_end: Option<String>,
    pub excluded: bool,
    /// Expense recognition date for per-shift posting.
    pub expense_date: Option<String>,
    /// Recomputed on every mutation.
    pub minutes_used: i64,
    pub shortage: f64,
    /// Advances taken against this shift by its own staff.
    pub advances: f64,
}

impl LineShift {
    pub(crate) fn new(shift: ShiftRow, advances: f64) -> Self {
        let mut line_shift = LineShift {
            shift,
            override_start: None,
            override_end: None,
            excluded: false,
            expense_date: None,
            minutes_used: 0,
            shortage: 0.0,
            advances,
        };
        line_shift.recompute();
        line_shift
    }

    pub fn effective_start(&self) -> Option<&str> {
        self.override_start
            .as_deref()
            .or(self.shift.start_time.as_deref())
    }

    pub fn effective_end(&self) -> Option<&str> {
        self.override_end
            .as_deref()
            .or(self.shift.end_time.as_deref())
    }

    /// True when this shift needs its own override row in the store.
    pub fn has_override(&self) -> bool {
        self.excluded
            || self.override_start.is_some()
            || self.override_end.is_some()
            || self.expense_date.is_some()
    }

    fn recompute(&mut self) {
        if self.excluded {
            self.minutes_used = 0;
            self.shortage = 0.0;
            return;
        }
        self.minutes_used = minutes_between(self.effective_start(), self.effective_end());
        self.shortage = self.shift.shortage();
    }

    /// Deductions tied to this specific shift (advances + shortage),
    /// zero when excluded.
    pub fn own_deductions(&self) -> f64 {
        if self.excluded {
            0.0
        } else {
            round2(self.advances + self.shortage)
        }
    }
}

/// Recomputed aggregate figures for one line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineTotals {
    pub minutes: i64,
    pub gross: f64,
    pub advances: f64,
    pub shortages: f64,
    pub other_deductions: f64,
    pub net: f64,
}

/// One staff member's pay within a run.
#[derive(Debug, Clone)]
pub struct RunLine {
    pub id: String,
    pub staff_id: String,
    pub staff_name: String,
    pub hourly_rate: f64,
    pub shifts: Vec<LineShift>,
    pub adjustments: Vec<Adjustment>,
    pub totals: LineTotals,
}

impl RunLine {
    /// Pure recomputation of this line's figures. Touches nothing else.
    pub fn recompute(&mut self) {
        let mut minutes = 0_i64;
        let mut advances = 0.0;
        let mut shortages = 0.0;

        for shift in &mut self.shifts {
            shift.recompute();
            if shift.excluded {
                continue;
            }
            minutes += shift.minutes_used;
            advances = round2(advances + shift.advances);
            shortages = round2(shortages + shift.shortage);
        }

        let gross = round2((minutes as f64 / 60.0) * self.hourly_rate);
        let other_deductions = round2(self.adjustments.iter().map(|a| a.amount).sum());
        let net = round2(gross - advances - shortages - other_deductions);

        self.totals = LineTotals {
            minutes,
            gross,
            advances,
            shortages,
            other_deductions,
            net,
        };
    }

    pub fn source_shift_ids(&self) -> Vec<String> {
        self.shifts.iter().map(|s| s.shift.id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Draft editor
// ---------------------------------------------------------------------------

/// A run with its lines, held in memory for interactive correction.
#[derive(Debug, Clone)]
pub struct RunDraft {
    pub run: PayrollRun,
    pub lines: Vec<RunLine>,
}

impl RunDraft {
    /// Build a new draft run over `[from, to]` from authoritative state.
    ///
    /// `mode` falls back to the configured default posting mode, then to
    /// per-staff.
    pub fn create(
        db: &DbState,
        from: &str,
        to: &str,
        pay_date: &str,
        mode: Option<PostingMode>,
    ) -> PayrollResult<RunDraft> {
        preview::validate_period(from, to)?;
        if parse_timestamp(pay_date).is_none() {
            return Err(PayrollError::validation(format!(
                "Unparsable pay date: {pay_date}"
            )));
        }

        let conn = db
            .conn
            .lock()
            .map_err(|e| PayrollError::store("lock connection", e))?;

        let mode = mode
            .or_else(|| {
                db::get_setting(&conn, "payroll", "default_posting_mode")
                    .and_then(|raw| PostingMode::parse(&raw))
            })
            .unwrap_or(PostingMode::PerStaff);

        let data = preview::collect_period_data(&conn, from, to)?;

        let mut lines: Vec<RunLine> = Vec::new();
        for (staff_id, shifts) in data.shifts_by_staff {
            let staff_name = preview::display_name(
                &data.directory,
                &staff_id,
                shifts.first().and_then(|s| s.staff_name.as_deref()),
            );
            let hourly_rate = preview::rate_for(&data.directory, &staff_id, to);

            let line_shifts = shifts
                .into_iter()
                .map(|shift| {
                    let advances = round2(
                        data.attribution
                            .own_by_shift
                            .get(&shift.id)
                            .map(|list| list.iter().map(|a| a.amount).sum())
                            .unwrap_or(0.0),
                    );
                    LineShift::new(shift, advances)
                })
                .collect();

            let adjustments = data
                .attribution
                .extra_by_beneficiary
                .get(&staff_id)
                .map(|list| list.iter().map(Adjustment::from_reattributed).collect())
                .unwrap_or_default();

            let mut line = RunLine {
                id: Uuid::new_v4().to_string(),
                staff_id,
                staff_name,
                hourly_rate,
                shifts: line_shifts,
                adjustments,
                totals: LineTotals::default(),
            };
            line.recompute();
            lines.push(line);
        }

        // Beneficiaries with no shifts still get a line carrying their debt
        for (beneficiary, reattributed) in &data.attribution.extra_by_beneficiary {
            if lines.iter().any(|l| &l.staff_id == beneficiary) {
                continue;
            }
            let fallback = data.attribution.beneficiary_names.get(beneficiary);
            let mut line = RunLine {
                id: Uuid::new_v4().to_string(),
                staff_id: beneficiary.clone(),
                staff_name: preview::display_name(
                    &data.directory,
                    beneficiary,
                    fallback.map(|s| s.as_str()),
                ),
                hourly_rate: preview::rate_for(&data.directory, beneficiary, to),
                shifts: Vec::new(),
                adjustments: reattributed.iter().map(Adjustment::from_reattributed).collect(),
                totals: LineTotals::default(),
            };
            line.recompute();
            lines.push(line);
        }

        lines.sort_by(|a, b| a.staff_name.cmp(&b.staff_name));

        let mut draft = RunDraft {
            run: PayrollRun {
                id: Uuid::new_v4().to_string(),
                period_start: from.to_string(),
                period_end: to.to_string(),
                pay_date: pay_date.to_string(),
                mode,
                status: RunStatus::Draft,
                attempt: 0,
                total_gross: 0.0,
                total_deductions: 0.0,
                total_net: 0.0,
            },
            lines,
        };
        draft.refresh_totals();

        info!(
            run_id = %draft.run.id,
            staff = draft.lines.len(),
            mode = draft.run.mode.as_str(),
            "Draft payroll run created"
        );
        Ok(draft)
    }

    /// Recompute the run header's aggregate totals from its lines.
    pub fn refresh_totals(&mut self) {
        self.run.total_gross = round2(self.lines.iter().map(|l| l.totals.gross).sum());
        self.run.total_deductions = round2(
            self.lines
                .iter()
                .map(|l| l.totals.advances + l.totals.shortages + l.totals.other_deductions)
                .sum(),
        );
        self.run.total_net = round2(self.lines.iter().map(|l| l.totals.net).sum());
    }

    fn ensure_editable(&self) -> PayrollResult<()> {
        if self.run.status != RunStatus::Draft {
            return Err(PayrollError::conflict(format!(
                "Run {} is {} and can no longer be edited",
                self.run.id,
                self.run.status.as_str()
            )));
        }
        Ok(())
    }

    fn line_mut(&mut self, staff_id: &str) -> PayrollResult<&mut RunLine> {
        self.lines
            .iter_mut()
            .find(|l| l.staff_id == staff_id)
            .ok_or_else(|| {
                PayrollError::validation(format!("No payroll line for staff {staff_id}"))
            })
    }

    fn shift_mut<'a>(line: &'a mut RunLine, shift_id: &str) -> PayrollResult<&'a mut LineShift> {
        line.shifts
            .iter_mut()
            .find(|s| s.shift.id == shift_id)
            .ok_or_else(|| {
                PayrollError::validation(format!("Shift {shift_id} is not on this line"))
            })
    }

    /// Change a line's hourly rate.
    pub fn set_line_rate(&mut self, staff_id: &str, rate: f64) -> PayrollResult<()> {
        self.ensure_editable()?;
        if rate < 0.0 {
            return Err(PayrollError::validation("Hourly rate cannot be negative"));
        }
        {
            let line = self.line_mut(staff_id)?;
            line.hourly_rate = rate;
            line.recompute();
        }
        self.refresh_totals();
        Ok(())
    }

    /// Override a shift's clocked times for this run only.
    pub fn override_shift_times(
        &mut self,
        staff_id: &str,
        shift_id: &str,
        start: Option<String>,
        end: Option<String>,
    ) -> PayrollResult<()> {
        self.ensure_editable()?;
        for raw in [&start, &end].into_iter().flatten() {
            if parse_timestamp(raw).is_none() {
                return Err(PayrollError::validation(format!(
                    "Unparsable override timestamp: {raw}"
                )));
            }
        }
        {
            let line = self.line_mut(staff_id)?;
            let shift = Self::shift_mut(line, shift_id)?;
            shift.override_start = start;
            shift.override_end = end;
            line.recompute();
        }
        self.refresh_totals();
        Ok(())
    }

    /// Exclude (or re-include) a shift from this run.
    pub fn set_shift_excluded(
        &mut self,
        staff_id: &str,
        shift_id: &str,
        excluded: bool,
    ) -> PayrollResult<()> {
        self.ensure_editable()?;
        {
            let line = self.line_mut(staff_id)?;
            let shift = Self::shift_mut(line, shift_id)?;
            shift.excluded = excluded;
            line.recompute();
        }
        self.refresh_totals();
        Ok(())
    }

    /// Set the expense recognition date used by per-shift posting.
    pub fn set_shift_expense_date(
        &mut self,
        staff_id: &str,
        shift_id: &str,
        expense_date: Option<String>,
    ) -> PayrollResult<()> {
        self.ensure_editable()?;
        if let Some(raw) = &expense_date {
            if parse_timestamp(raw).is_none() {
                return Err(PayrollError::validation(format!(
                    "Unparsable expense date: {raw}"
                )));
            }
        }
        {
            let line = self.line_mut(staff_id)?;
            let shift = Self::shift_mut(line, shift_id)?;
            shift.expense_date = expense_date;
            line.recompute();
        }
        self.refresh_totals();
        Ok(())
    }

    /// Add a manual deduction to a line.
    pub fn add_manual_deduction(
        &mut self,
        staff_id: &str,
        label: &str,
        amount: f64,
    ) -> PayrollResult<()> {
        self.ensure_editable()?;
        if amount <= 0.0 {
            return Err(PayrollError::validation("Deduction amount must be positive"));
        }
        {
            let line = self.line_mut(staff_id)?;
            line.adjustments.push(Adjustment::manual(label, amount));
            line.recompute();
        }
        self.refresh_totals();
        Ok(())
    }

    /// Edit a manual deduction in place. Reattributed advances are derived
    /// from the ledger and cannot be edited here.
    pub fn update_manual_deduction(
        &mut self,
        staff_id: &str,
        index: usize,
        label: &str,
        amount: f64,
    ) -> PayrollResult<()> {
        self.ensure_editable()?;
        if amount <= 0.0 {
            return Err(PayrollError::validation("Deduction amount must be positive"));
        }
        {
            let line = self.line_mut(staff_id)?;
            let adjustment = line.adjustments.get_mut(index).ok_or_else(|| {
                PayrollError::validation(format!("No adjustment at index {index}"))
            })?;
            if adjustment.kind != AdjustmentKind::ManualDeduction {
                return Err(PayrollError::validation(
                    "Only manual deductions can be edited",
                ));
            }
            adjustment.label = label.to_string();
            adjustment.amount = amount;
            line.recompute();
        }
        self.refresh_totals();
        Ok(())
    }

    /// Remove a manual deduction.
    pub fn remove_manual_deduction(&mut self, staff_id: &str, index: usize) -> PayrollResult<()> {
        self.ensure_editable()?;
        {
            let line = self.line_mut(staff_id)?;
            let adjustment = line.adjustments.get(index).ok_or_else(|| {
                PayrollError::validation(format!("No adjustment at index {index}"))
            })?;
            if adjustment.kind != AdjustmentKind::ManualDeduction {
                return Err(PayrollError::validation(
                    "Only manual deductions can be removed",
                ));
            }
            line.adjustments.remove(index);
            line.recompute();
        }
        self.refresh_totals();
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
