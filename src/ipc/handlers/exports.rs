use crate::calc::{self, CalcContext};
use crate::export;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{authed_user, db_conn};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handle_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        Err(e) => return calc_err(req, e),
    };

    ok(
        &req.id,
        json!({
            "filename": export::csv_filename(),
            "contentType": export::CSV_CONTENT_TYPE,
            "content": export::notes_csv(&modules)
        }),
    )
}

fn handle_export_json(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let data = match export::build_seed_data(&ctx) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    ok(
        &req.id,
        json!({
            "filename": export::seed_json_filename(),
            "data": data
        }),
    )
}

fn handle_export_report(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        Err(e) => return calc_err(req, e),
    };
    let groups = calc::group_by_year(modules);

    ok(
        &req.id,
        json!({
            "contentType": "text/html; charset=utf-8",
            "html": export::report_html(&user.name, &groups)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "export.csv" => Some(handle_export_csv(state, req)),
        "export.json" => Some(handle_export_json(state, req)),
        "export.report" => Some(handle_export_report(state, req)),
        _ => None,
    }
}
