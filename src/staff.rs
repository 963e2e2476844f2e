//! Staff directory reads.
//!
//! Staff rows carry the pay profile the rate resolver works from: a
//! default hourly rate plus an append-only `rate_history` JSON array of
//! `{rate, effectiveFrom}` entries. A malformed history degrades to an
//! empty one (the default rate still applies) rather than failing the
//! caller.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::{PayrollError, PayrollResult};

/// One append-only entry in a staff member's rate history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateEntry {
    pub rate: f64,
    #[serde(rename = "effectiveFrom")]
    pub effective_from: String,
}

/// A staff directory record with its pay profile.
#[derive(Debug, Clone)]
pub struct StaffRecord {
    pub id: String,
    pub display_name: String,
    pub role: String,
    pub is_active: bool,
    pub default_hourly_rate: f64,
    pub rate_history: Vec<RateEntry>,
}

fn parse_history(staff_id: &str, raw: &str) -> Vec<RateEntry> {
    match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(staff_id = %staff_id, error = %e, "Malformed rate history, using default rate only");
            Vec::new()
        }
    }
}

fn row_to_staff(row: &rusqlite::Row<'_>) -> rusqlite::Result<(StaffRecord, String)> {
    let id: String = row.get(0)?;
    let record = StaffRecord {
        id: id.clone(),
        display_name: row.get(1)?,
        role: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        default_hourly_rate: row.get(4)?,
        rate_history: Vec::new(),
    };
    let raw_history: String = row.get(5)?;
    Ok((record, raw_history))
}

/// Fetch one staff record by id.
pub fn get_staff(conn: &Connection, staff_id: &str) -> Option<StaffRecord> {
    let (mut record, raw) = conn
        .query_row(
            "SELECT id, display_name, role, is_active, default_hourly_rate, rate_history
             FROM staff WHERE id = ?1",
            params![staff_id],
            row_to_staff,
        )
        .ok()?;
    record.rate_history = parse_history(&record.id, &raw);
    Some(record)
}

/// List staff records, optionally filtered by role, ordered by display name.
pub fn list_staff(conn: &Connection, role: Option<&str>) -> PayrollResult<Vec<StaffRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, display_name, role, is_active, default_hourly_rate, rate_history
             FROM staff
             WHERE (?1 IS NULL OR role = ?1)
             ORDER BY display_name ASC",
        )
        .map_err(|e| PayrollError::store("list staff", e))?;

    let rows = stmt
        .query_map(params![role], row_to_staff)
        .map_err(|e| PayrollError::store("list staff", e))?;

    let mut staff = Vec::new();
    for row in rows {
        match row {
            Ok((mut record, raw)) => {
                record.rate_history = parse_history(&record.id, &raw);
                staff.push(record);
            }
            Err(e) => warn!("skipping malformed staff row: {e}"),
        }
    }
    Ok(staff)
}

/// Load the whole directory keyed by staff id.
pub fn directory(conn: &Connection) -> PayrollResult<HashMap<String, StaffRecord>> {
    Ok(list_staff(conn, None)?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seed_staff(conn: &Connection, id: &str, name: &str, role: &str, rate: f64, history: &str) {
        conn.execute(
            "INSERT INTO staff (id, display_name, role, default_hourly_rate, rate_history)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, role, rate, history],
        )
        .unwrap();
    }

    #[test]
    fn test_get_staff_parses_history() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_staff(
            &conn,
            "s1",
            "Ana",
            "cashier",
            50.0,
            r#"[{"rate":50,"effectiveFrom":"2025-01-01"},{"rate":60,"effectiveFrom":"2025-02-01"}]"#,
        );

        let staff = get_staff(&conn, "s1").unwrap();
        assert_eq!(staff.display_name, "Ana");
        assert_eq!(staff.rate_history.len(), 2);
        assert_eq!(staff.rate_history[1].rate, 60.0);
        assert_eq!(staff.rate_history[1].effective_from, "2025-02-01");
    }

    #[test]
    fn test_get_staff_malformed_history_degrades() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_staff(&conn, "s1", "Ana", "cashier", 50.0, "not json");

        let staff = get_staff(&conn, "s1").unwrap();
        assert!(staff.rate_history.is_empty());
        assert_eq!(staff.default_hourly_rate, 50.0);
    }

    #[test]
    fn test_get_staff_missing_is_none() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        assert!(get_staff(&conn, "ghost").is_none());
    }

    #[test]
    fn test_list_staff_role_filter_and_order() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_staff(&conn, "s1", "Carlos", "cashier", 50.0, "[]");
        seed_staff(&conn, "s2", "Ana", "cashier", 55.0, "[]");
        seed_staff(&conn, "s3", "Bea", "manager", 80.0, "[]");

        let cashiers = list_staff(&conn, Some("cashier")).unwrap();
        assert_eq!(cashiers.len(), 2);
        assert_eq!(cashiers[0].display_name, "Ana");
        assert_eq!(cashiers[1].display_name, "Carlos");

        let all = list_staff(&conn, None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_directory_keyed_by_id() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        seed_staff(&conn, "s1", "Ana", "cashier", 50.0, "[]");
        seed_staff(&conn, "s2", "Bea", "manager", 80.0, "[]");

        let dir = directory(&conn).unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir["s2"].display_name, "Bea");
    }
}
