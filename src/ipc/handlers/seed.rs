use crate::db;
use crate::export::SeedData;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{competences, modules};
use crate::ipc::helpers::HandlerErr;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const DEFAULT_USER_NAME: &str = "Utilisateur CFC";
const DEFAULT_USER_EMAIL: &str = "user@cfc.local";

struct LoadOutcome {
    user_id: String,
    domaines: usize,
    competences: usize,
    modules: usize,
    liens: usize,
    notes: usize,
    niveaux: usize,
    warnings: Vec<serde_json::Value>,
}

fn query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

fn insert_err(table: &str) -> impl Fn(rusqlite::Error) -> HandlerErr + '_ {
    move |e| HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": table }))
}

fn id_taken(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(query_err)?;
    Ok(found.is_some())
}

/// Keep the dump's id when it is free, otherwise mint a fresh one; the natural
/// key, not the id, decides row identity on reload.
fn usable_id(conn: &Connection, table: &str, wanted: &str) -> Result<String, HandlerErr> {
    if wanted.is_empty() || id_taken(conn, table, wanted)? {
        Ok(Uuid::new_v4().to_string())
    } else {
        Ok(wanted.to_string())
    }
}

fn resolve_target_user(conn: &Connection, explicit: Option<&str>) -> Result<String, HandlerErr> {
    if let Some(user_id) = explicit {
        let found: Option<String> = conn
            .query_row("SELECT id FROM users WHERE id = ?", [user_id], |r| r.get(0))
            .optional()
            .map_err(query_err)?;
        return found.ok_or_else(|| {
            HandlerErr::with_details("not_found", "user not found", json!({ "userId": user_id }))
        });
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM users ORDER BY created_at, id LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    if let Some(id) = existing {
        return Ok(id);
    }

    // Fresh workspace: create the default local user, as the original seed did.
    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO users(id, name, email, created_at, updated_at) VALUES(?, ?, ?, ?, ?)",
        (&id, DEFAULT_USER_NAME, DEFAULT_USER_EMAIL, &now, &now),
    )
    .map_err(insert_err("users"))?;
    Ok(id)
}

fn load_seed(
    conn: &Connection,
    data: &SeedData,
    explicit_user: Option<&str>,
) -> Result<LoadOutcome, HandlerErr> {
    let user_id = resolve_target_user(conn, explicit_user)?;
    let now = db::now_rfc3339();
    let mut warnings: Vec<serde_json::Value> = Vec::new();

    // Reference rows upsert by natural key so a reload never duplicates them.
    let mut domaine_ids: HashMap<&str, String> = HashMap::new();
    let mut domaine_ids_by_nom: HashMap<&str, String> = HashMap::new();
    let mut inserted_domaines = 0usize;
    for d in &data.domaines {
        let existing: Option<String> = conn
            .query_row("SELECT id FROM domaines WHERE nom = ?", [&d.nom], |r| {
                r.get(0)
            })
            .optional()
            .map_err(query_err)?;
        let actual = match existing {
            Some(id) => id,
            None => {
                let id = usable_id(conn, "domaines", &d.id)?;
                conn.execute(
                    "INSERT INTO domaines(id, nom, created_at, updated_at) VALUES(?, ?, ?, ?)",
                    (&id, &d.nom, &now, &now),
                )
                .map_err(insert_err("domaines"))?;
                inserted_domaines += 1;
                id
            }
        };
        domaine_ids.insert(&d.id, actual.clone());
        domaine_ids_by_nom.insert(&d.nom, actual);
    }

    let mut competence_ids: HashMap<&str, String> = HashMap::new();
    let mut inserted_competences = 0usize;
    for c in &data.competences {
        let domaine_id = domaine_ids
            .get(c.domaine_id.as_str())
            .or_else(|| domaine_ids_by_nom.get(c.domaine.as_str()));
        let Some(domaine_id) = domaine_id else {
            warnings.push(json!({
                "entity": "competence",
                "nom": c.nom,
                "code": "unknown_domaine",
                "message": "competence references a domaine absent from the dump"
            }));
            continue;
        };
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM competences WHERE domaine_id = ? AND nom = ?",
                (domaine_id, &c.nom),
                |r| r.get(0),
            )
            .optional()
            .map_err(query_err)?;
        let actual = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE competences SET description = ?, updated_at = ? WHERE id = ?",
                    (&c.description, &now, &id),
                )
                .map_err(insert_err("competences"))?;
                id
            }
            None => {
                let id = usable_id(conn, "competences", &c.id)?;
                conn.execute(
                    "INSERT INTO competences(id, nom, description, domaine_id, created_at, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (&id, &c.nom, &c.description, domaine_id, &now, &now),
                )
                .map_err(insert_err("competences"))?;
                inserted_competences += 1;
                id
            }
        };
        competence_ids.insert(&c.id, actual);
    }

    let mut module_ids: HashMap<&str, String> = HashMap::new();
    let mut inserted_modules = 0usize;
    for m in &data.modules {
        if !(1..=4).contains(&m.annee) {
            warnings.push(json!({
                "entity": "module",
                "moduleCode": m.code,
                "code": "bad_annee",
                "message": "annee must be between 1 and 4"
            }));
            continue;
        }
        let existing: Option<String> = conn
            .query_row("SELECT id FROM modules WHERE code = ?", [&m.code], |r| {
                r.get(0)
            })
            .optional()
            .map_err(query_err)?;
        let actual = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE modules SET nom = ?, annee = ?, is_cie = ?, updated_at = ? WHERE id = ?",
                    (&m.nom, m.annee, m.is_cie as i64, &now, &id),
                )
                .map_err(insert_err("modules"))?;
                id
            }
            None => {
                let id = usable_id(conn, "modules", &m.id)?;
                conn.execute(
                    "INSERT INTO modules(id, nom, code, annee, is_cie, created_at, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?)",
                    (&id, &m.nom, &m.code, m.annee, m.is_cie as i64, &now, &now),
                )
                .map_err(insert_err("modules"))?;
                inserted_modules += 1;
                id
            }
        };
        module_ids.insert(&m.id, actual);
    }

    let mut inserted_liens = 0usize;
    for lien in &data.liens_competence_module {
        let (Some(competence_id), Some(module_id)) = (
            competence_ids.get(lien.competence_id.as_str()),
            module_ids.get(lien.module_id.as_str()),
        ) else {
            warnings.push(json!({
                "entity": "lien",
                "code": "unresolved_link",
                "message": "link references a competence or module absent from the dump"
            }));
            continue;
        };
        let changed = conn
            .execute(
                "INSERT INTO competence_modules(id, competence_id, module_id, created_at)
                 VALUES(?, ?, ?, ?)
                 ON CONFLICT(competence_id, module_id) DO NOTHING",
                (Uuid::new_v4().to_string(), competence_id, module_id, &now),
            )
            .map_err(insert_err("competence_modules"))?;
        inserted_liens += changed;
    }

    let mut loaded_notes = 0usize;
    for n in &data.notes_utilisateur {
        if !(modules::NOTE_MIN..=modules::NOTE_MAX).contains(&n.note) {
            warnings.push(json!({
                "entity": "note",
                "moduleId": n.module_id,
                "code": "bad_note",
                "message": "note must be between 0 and 6"
            }));
            continue;
        }
        let Some(module_id) = module_ids.get(n.module_id.as_str()) else {
            warnings.push(json!({
                "entity": "note",
                "moduleId": n.module_id,
                "code": "unknown_module",
                "message": "note references a module absent from the dump"
            }));
            continue;
        };
        modules::upsert_note(conn, &user_id, module_id, n.note)?;
        loaded_notes += 1;
    }

    let mut loaded_niveaux = 0usize;
    for n in &data.niveaux_competences {
        if !(competences::NIVEAU_MIN..=competences::NIVEAU_MAX).contains(&n.niveau) {
            warnings.push(json!({
                "entity": "niveau",
                "competenceId": n.competence_id,
                "code": "bad_niveau",
                "message": "niveau must be an integer between 1 and 5"
            }));
            continue;
        }
        let Some(competence_id) = competence_ids.get(n.competence_id.as_str()) else {
            warnings.push(json!({
                "entity": "niveau",
                "competenceId": n.competence_id,
                "code": "unknown_competence",
                "message": "niveau references a competence absent from the dump"
            }));
            continue;
        };
        competences::upsert_niveau(conn, &user_id, competence_id, n.niveau)?;
        loaded_niveaux += 1;
    }

    Ok(LoadOutcome {
        user_id,
        domaines: inserted_domaines,
        competences: inserted_competences,
        modules: inserted_modules,
        liens: inserted_liens,
        notes: loaded_notes,
        niveaux: loaded_niveaux,
        warnings,
    })
}

fn handle_seed_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(data_value) = req.params.get("data") else {
        return err(&req.id, "bad_params", "missing params.data", None);
    };
    let data: SeedData = match serde_json::from_value(data_value.clone()) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("malformed seed data: {}", e),
                None,
            )
        }
    };
    let explicit_user = req
        .params
        .get("userId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };
    let outcome = match load_seed(&tx, &data, explicit_user.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id), // tx rolls back on drop
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "internal", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "userId": outcome.user_id,
            "counts": {
                "domaines": outcome.domaines,
                "competences": outcome.competences,
                "modules": outcome.modules,
                "liens": outcome.liens,
                "notes": outcome.notes,
                "niveaux": outcome.niveaux
            },
            "warnings": outcome.warnings
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "seed.load" => Some(handle_seed_load(state, req)),
        _ => None,
    }
}
