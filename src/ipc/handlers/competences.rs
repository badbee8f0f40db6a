use crate::calc::{self, CalcContext, NiveauStats};
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{authed_user, db_conn, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const NIVEAU_MIN: i64 = 1;
pub const NIVEAU_MAX: i64 = 5;

fn parse_niveau(req: &Request) -> Result<i64, HandlerErr> {
    // as_i64 rejects fractional values; niveau is integer-only.
    let Some(niveau) = req.params.get("niveau").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr::new("bad_params", "missing/invalid niveau"));
    };
    if !(NIVEAU_MIN..=NIVEAU_MAX).contains(&niveau) {
        return Err(HandlerErr::with_details(
            "bad_params",
            "niveau must be an integer between 1 and 5",
            json!({ "niveau": niveau }),
        ));
    }
    Ok(niveau)
}

fn competence_exists(conn: &Connection, competence_id: &str) -> Result<(), HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM competences WHERE id = ?",
            [competence_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if found.is_none() {
        return Err(HandlerErr::with_details(
            "not_found",
            "competence not found",
            json!({ "competenceId": competence_id }),
        ));
    }
    Ok(())
}

pub fn upsert_niveau(
    conn: &Connection,
    user_id: &str,
    competence_id: &str,
    niveau: i64,
) -> Result<serde_json::Value, HandlerErr> {
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO user_competence_niveaux(id, user_id, competence_id, niveau, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, competence_id) DO UPDATE SET
           niveau = excluded.niveau,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            user_id,
            competence_id,
            niveau,
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "user_competence_niveaux" }),
        )
    })?;

    conn.query_row(
        "SELECT id, niveau, created_at, updated_at FROM user_competence_niveaux
         WHERE user_id = ? AND competence_id = ?",
        (user_id, competence_id),
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "competenceId": competence_id,
                "niveau": r.get::<_, i64>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "updatedAt": r.get::<_, String>(3)?,
            }))
        },
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_competences_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let competences = match calc::fetch_competences(&ctx) {
        Ok(v) => v,
        Err(e) => {
            eprintln!(
                "notesd: competences.list read failed: {}: {}",
                e.code, e.message
            );
            Vec::new()
        }
    };

    let stats: NiveauStats = calc::niveau_stats(&competences);
    ok(
        &req.id,
        json!({ "competences": competences, "stats": stats }),
    )
}

fn handle_set_niveau(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match authed_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let competence_id = match required_str(req, "competenceId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let niveau = match parse_niveau(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = competence_exists(conn, &competence_id) {
        return e.response(&req.id);
    }

    match upsert_niveau(conn, &user.id, &competence_id, niveau) {
        Ok(row) => ok(&req.id, json!({ "niveau": row })),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "competences.list" => Some(handle_competences_list(state, req)),
        "competences.setNiveau" => Some(handle_set_niveau(state, req)),
        _ => None,
    }
}
