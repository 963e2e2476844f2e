//! Payroll run engine for a small-shop POS.
//!
//! Aggregates shift attendance and cash-handling data over a pay period,
//! resolves effective-dated hourly rates, computes per-staff pay lines
//! with interactive correction, and posts the result into the shared
//! transaction ledger. The posting path tolerates edits, re-runs, and
//! partial failures: previously posted entries are voided and recreated
//! rather than mutated, so a run can always be re-finalized without
//! double-paying anyone.
//!
//! Typical flow:
//! 1. [`preview::build_preview`] to inspect a period,
//! 2. [`RunDraft::create`] + editor methods to correct lines,
//! 3. [`run_store::save_draft`] (idempotent, call freely),
//! 4. [`finalize::finalize_run`] to post, [`finalize::void_run`] to undo.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod db;
pub mod error;
pub mod finalize;
pub mod ledger;
pub mod line;
pub mod metrics;
pub mod money;
pub mod preview;
pub mod rates;
pub mod run_store;
pub mod staff;
pub mod timeclock;

pub use db::DbState;
pub use error::{PayrollError, PayrollResult};
pub use finalize::{FinalizeOutcome, FinalizeSummary, Paystub};
pub use line::{Adjustment, AdjustmentKind, PayrollRun, PostingMode, RunDraft, RunLine, RunStatus};
pub use preview::{PreviewLine, PreviewReport};
pub use staff::{RateEntry, StaffRecord};

/// Initialize structured logging for a host embedding the engine.
///
/// `EnvFilter` from the environment with a crate-scoped default; console
/// output always, plus a daily-rolling file log when `log_dir` is given.
pub fn init_logging(log_dir: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_payroll=debug"));
    let console_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "payroll");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            registry.with(file_layer).init();
            // Keep the guard alive for the lifetime of the process —
            // dropping it flushes and closes the file writer.
            std::mem::forget(guard);
        }
        None => registry.init(),
    }

    info!("Payroll engine v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
