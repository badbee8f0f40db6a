use crate::calc::{self, CalcContext};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{authed_user, db_conn, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const NOTE_MIN: f64 = 0.0;
pub const NOTE_MAX: f64 = 6.0;

fn parse_annee(req: &Request) -> Result<i64, serde_json::Value> {
    match req.params.get("annee").and_then(|v| v.as_i64()) {
        Some(v) if (1..=4).contains(&v) => Ok(v),
        _ => Err(err(
            &req.id,
            "bad_params",
            "annee must be an integer between 1 and 4",
            None,
        )),
    }
}

fn parse_note(req: &Request) -> Result<f64, HandlerErr> {
    let Some(note) = req.params.get("note").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::new("bad_params", "missing/invalid note"));
    };
    if !(NOTE_MIN..=NOTE_MAX).contains(&note) {
        return Err(HandlerErr::with_details(
            "bad_params",
            "note must be between 0 and 6",
            json!({ "note": note }),
        ));
    }
    Ok(note)
}

fn module_exists(conn: &Connection, module_id: &str) -> Result<(), HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM modules WHERE id = ?", [module_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if found.is_none() {
        return Err(HandlerErr::with_details(
            "not_found",
            "module not found",
            json!({ "moduleId": module_id }),
        ));
    }
    Ok(())
}

/// Conflict-resolving upsert on the (user, module) natural key. The row id and
/// created_at survive an update; only note and updated_at move.
pub fn upsert_note(
    conn: &Connection,
    user_id: &str,
    module_id: &str,
    note: f64,
) -> Result<serde_json::Value, HandlerErr> {
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO user_module_notes(id, user_id, module_id, note, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, module_id) DO UPDATE SET
           note = excluded.note,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            user_id,
            module_id,
            note,
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "user_module_notes" }),
        )
    })?;

    // Callers treat the returned row as the new source of truth.
    conn.query_row(
        "SELECT id, note, created_at, updated_at FROM user_module_notes
         WHERE user_id = ? AND module_id = ?",
        (user_id, module_id),
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "moduleId": module_id,
                "note": r.get::<_, f64>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "updatedAt": r.get::<_, String>(3)?,
            }))
        },
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_modules_by_year(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match authed_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let annee = match parse_annee(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ctx = CalcContext {
        conn,
        user_id: &user.id,
    };
    // Listing reads degrade to an empty set so the page shell stays up.
    let modules = match calc::fetch_modules_by_year(&ctx, annee) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("notesd: modules.byYear read failed: {}: {}", e.code, e.message);
            Vec::new()
        }
    };

    ok(&req.id, json!({ "annee": annee, "modules": modules }))
}

fn handle_modules_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match authed_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = CalcContext {
        conn,
        user_id: &user.id,
    };
    let modules = match calc::fetch_all_modules(&ctx) {
        Ok(v) => v,
        Err(e) => {
            eprintln!(
                "notesd: modules.overview read failed: {}: {}",
                e.code, e.message
            );
            Vec::new()
        }
    };

    let averages = calc::module_averages(&modules);
    let years = calc::group_by_year(modules);
    ok(&req.id, json!({ "years": years, "averages": averages }))
}

fn handle_notes_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match authed_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let module_id = match required_str(req, "moduleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Fail fast: validation precedes any storage mutation.
    let note = match parse_note(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = module_exists(conn, &module_id) {
        return e.response(&req.id);
    }

    match upsert_note(conn, &user.id, &module_id, note) {
        Ok(row) => ok(&req.id, json!({ "note": row })),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "modules.byYear" => Some(handle_modules_by_year(state, req)),
        "modules.overview" => Some(handle_modules_overview(state, req)),
        "notes.set" => Some(handle_notes_set(state, req)),
        _ => None,
    }
}
