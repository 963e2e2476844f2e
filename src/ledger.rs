//! Transaction ledger operations.
//!
//! The ledger is single-sided: `debit` rows are sales, `credit` rows are
//! expenses (salary advances during a shift, posted salaries at payroll).
//! Amounts are immutable once written — corrections flip the `voided` or
//! `is_deleted` flags and recreate, so a posted figure can always be
//! traced even after it has been neutralized.

use rusqlite::{params, Connection};
use tracing::info;
use uuid::Uuid;

use crate::error::{PayrollError, PayrollResult};

/// Expense type recorded when cash is advanced against a shift.
pub const EXPENSE_TYPE_SALARY_ADVANCE: &str = "Salary Advance";
/// Expense type the posting engine writes at finalize.
pub const EXPENSE_TYPE_SALARY: &str = "Salary";

/// A salary-advance ledger row as the payroll extractor consumes it.
///
/// `beneficiary_id` is the *intended* recipient, which may differ from the
/// staff member whose shift the advance was recorded under.
#[derive(Debug, Clone)]
pub struct AdvanceRecord {
    pub txn_id: String,
    pub shift_id: String,
    pub recorded_staff_id: String,
    pub amount: f64,
    pub beneficiary_id: Option<String>,
    pub beneficiary_name: Option<String>,
}

/// A salary expense to be posted against a run.
#[derive(Debug, Clone)]
pub struct SalaryPosting {
    pub run_id: String,
    pub staff_id: String,
    pub amount: f64,
    pub dated: String,
    pub shift_id: Option<String>,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Record a salary advance taken during a shift.
///
/// `beneficiary` names the intended recipient when the advance was handed
/// to someone other than the shift owner (the payroll run reattributes it).
pub fn record_salary_advance(
    conn: &Connection,
    staff_id: &str,
    shift_id: &str,
    amount: f64,
    happened_at: &str,
    beneficiary: Option<(&str, &str)>,
) -> PayrollResult<String> {
    if amount <= 0.0 {
        return Err(PayrollError::validation("Advance amount must be positive"));
    }
    let txn_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO transactions (
            id, category, amount, happened_at, staff_id, shift_id,
            expense_type, beneficiary_staff_id, beneficiary_staff_name, description
        ) VALUES (?1, 'credit', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            txn_id,
            amount,
            happened_at,
            staff_id,
            shift_id,
            EXPENSE_TYPE_SALARY_ADVANCE,
            beneficiary.map(|(id, _)| id),
            beneficiary.map(|(_, name)| name),
            format!("Salary advance during shift {shift_id}"),
        ],
    )
    .map_err(|e| PayrollError::store("record salary advance", e))?;

    info!(txn_id = %txn_id, shift_id = %shift_id, amount = %amount, "Salary advance recorded");
    Ok(txn_id)
}

/// Insert one posted salary expense for a run.
///
/// Called from inside the finalize write phase; the caller owns the
/// surrounding batch transaction.
pub(crate) fn insert_salary_posting(conn: &Connection, posting: &SalaryPosting) -> PayrollResult<String> {
    let txn_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO transactions (
            id, category, amount, happened_at, staff_id, shift_id,
            expense_type, payroll_run_id, description
        ) VALUES (?1, 'credit', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            txn_id,
            posting.amount,
            posting.dated,
            posting.staff_id,
            posting.shift_id,
            EXPENSE_TYPE_SALARY,
            posting.run_id,
            posting.description,
        ],
    )
    .map_err(|e| PayrollError::store(format!("post salary for run {}", posting.run_id), e))?;
    Ok(txn_id)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Load the live (non-voided, non-deleted) salary advances tied to any of
/// the given shifts.
pub fn salary_advances_for_shifts(
    conn: &Connection,
    shift_ids: &[String],
) -> PayrollResult<Vec<AdvanceRecord>> {
    if shift_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; shift_ids.len()].join(", ");
    let sql = format!(
        "SELECT id, shift_id, staff_id, amount, beneficiary_staff_id, beneficiary_staff_name
         FROM transactions
         WHERE expense_type = '{EXPENSE_TYPE_SALARY_ADVANCE}'
           AND voided = 0 AND is_deleted = 0
           AND shift_id IN ({placeholders})
         ORDER BY happened_at ASC"
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| PayrollError::store("query salary advances", e))?;

    let rows = stmt
        .query_map(rusqlite::params_from_iter(shift_ids.iter()), |row| {
            Ok(AdvanceRecord {
                txn_id: row.get(0)?,
                shift_id: row.get(1)?,
                recorded_staff_id: row.get(2)?,
                amount: row.get(3)?,
                beneficiary_id: row.get(4)?,
                beneficiary_name: row.get(5)?,
            })
        })
        .map_err(|e| PayrollError::store("query salary advances", e))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}

/// Count and sum the live transactions tagged with a run.
pub fn run_posting_totals(conn: &Connection, run_id: &str) -> PayrollResult<(i64, f64)> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(amount), 0)
         FROM transactions
         WHERE payroll_run_id = ?1 AND voided = 0 AND is_deleted = 0",
        params![run_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(|e| PayrollError::store(format!("run posting totals for {run_id}"), e))
}

// ---------------------------------------------------------------------------
// Voiding
// ---------------------------------------------------------------------------

/// Void every live transaction tagged with the run. Returns the count.
///
/// This is the compensating half of the void-then-recreate pattern: a
/// finalize re-run neutralizes its previous postings before writing new
/// ones, so amounts never need to be edited in place.
pub fn void_run_transactions(conn: &Connection, run_id: &str) -> PayrollResult<usize> {
    let voided = conn
        .execute(
            "UPDATE transactions SET voided = 1
             WHERE payroll_run_id = ?1 AND voided = 0 AND is_deleted = 0",
            params![run_id],
        )
        .map_err(|e| PayrollError::store(format!("void transactions for run {run_id}"), e))?;

    if voided > 0 {
        info!(run_id = %run_id, count = voided, "Voided previously posted transactions");
    }
    Ok(voided)
}

// ===========================================================================
// Tests
// ===========================================================================
