use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
    pub email: String,
    pub name: String,
}

/// Session lookup boundary. The auth collaborator owns token issuance; here a
/// request's `sessionToken` either resolves to a live user or the call fails
/// before any storage is touched.
pub fn authed_user(conn: &Connection, req: &Request) -> Result<AuthedUser, HandlerErr> {
    let token = req
        .params
        .get("sessionToken")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HandlerErr::new("not_authenticated", "missing sessionToken"))?;

    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT u.id, u.email, u.name, s.expires_at
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = ?",
            [token],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    match row {
        Some((id, email, name, expires_at)) if expires_at > crate::db::now_rfc3339() => {
            Ok(AuthedUser { id, email, name })
        }
        Some(_) => Err(HandlerErr::with_details(
            "not_authenticated",
            "session expired",
            json!({ "token": "expired" }),
        )),
        None => Err(HandlerErr::new("not_authenticated", "unknown session")),
    }
}
