use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_notesd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn notesd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// Plays the external auth collaborator: writes a user and a live session
/// straight into the workspace database.
fn install_session(workspace: &Path, user_id: &str, token: &str) {
    let conn = Connection::open(workspace.join("notes.sqlite3")).expect("open workspace db");
    let now = Utc::now().to_rfc3339();
    let expires = (Utc::now() + Duration::days(7)).to_rfc3339();
    conn.execute(
        "INSERT INTO users(id, name, email, created_at, updated_at) VALUES(?, ?, ?, ?, ?)",
        (user_id, "Utilisateur CFC", "user@cfc.local", &now, &now),
    )
    .expect("insert user");
    conn.execute(
        "INSERT INTO sessions(id, token, user_id, expires_at, created_at) VALUES(?, ?, ?, ?, ?)",
        (format!("sess-{user_id}"), token, user_id, &expires, &now),
    )
    .expect("insert session");
}

fn sample_dump() -> serde_json::Value {
    json!({
        "domaines": [
            { "id": "d1", "nom": "Programmation" }
        ],
        "competences": [
            {
                "id": "c1",
                "nom": "Coder un module",
                "description": "Impl\u{e9}menter selon sp\u{e9}cification",
                "domaineId": "d1",
                "domaine": "Programmation"
            }
        ],
        "modules": [
            { "id": "m1", "nom": "117 - Informatique et r\u{e9}seau", "code": "117", "annee": 1, "isCie": false },
            { "id": "m2", "nom": "431 - Ex\u{e9}cuter des mandats", "code": "431", "annee": 2, "isCie": true }
        ],
        "liensCompetenceModule": [
            { "competenceId": "c1", "moduleId": "m1" }
        ],
        "notesUtilisateur": [
            { "moduleId": "m1", "note": 4.5 }
        ],
        "niveauxCompetences": [
            { "competenceId": "c1", "niveau": 3 }
        ]
    })
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("notesd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], true);
    assert!(health["result"]["version"].is_string());

    let selected = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], true);

    install_session(&workspace, "u1", "tok-1");

    let loaded = request(
        &mut stdin,
        &mut reader,
        "3",
        "seed.load",
        json!({ "data": sample_dump(), "userId": "u1" }),
    );
    assert_eq!(loaded["ok"], true, "seed.load failed: {loaded}");
    assert_eq!(loaded["result"]["counts"]["modules"], 2);
    assert_eq!(loaded["result"]["counts"]["notes"], 1);

    let whoami = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.whoami",
        json!({ "sessionToken": "tok-1" }),
    );
    assert_eq!(whoami["result"]["userId"], "u1");
    assert_eq!(whoami["result"]["email"], "user@cfc.local");

    let year1 = request(
        &mut stdin,
        &mut reader,
        "5",
        "modules.byYear",
        json!({ "sessionToken": "tok-1", "annee": 1 }),
    );
    assert_eq!(year1["result"]["modules"][0]["code"], "117");
    assert_eq!(year1["result"]["modules"][0]["note"], 4.5);

    let overview = request(
        &mut stdin,
        &mut reader,
        "6",
        "modules.overview",
        json!({ "sessionToken": "tok-1" }),
    );
    assert_eq!(overview["result"]["averages"]["totalModules"], 2);
    assert_eq!(overview["result"]["averages"]["gradedModules"], 1);

    let competences = request(
        &mut stdin,
        &mut reader,
        "7",
        "competences.list",
        json!({ "sessionToken": "tok-1" }),
    );
    assert_eq!(competences["result"]["competences"][0]["niveau"], 3);
    assert_eq!(competences["result"]["stats"]["niveau34"], 1);

    let csv = request(
        &mut stdin,
        &mut reader,
        "8",
        "export.csv",
        json!({ "sessionToken": "tok-1" }),
    );
    assert_eq!(csv["result"]["contentType"], "text/csv; charset=utf-8; sep=;");
    assert!(csv["result"]["filename"]
        .as_str()
        .expect("filename")
        .starts_with("notes-cfc-"));

    let report = request(
        &mut stdin,
        &mut reader,
        "9",
        "export.report",
        json!({ "sessionToken": "tok-1" }),
    );
    assert!(report["result"]["html"]
        .as_str()
        .expect("html")
        .contains("Notes de Utilisateur CFC"));

    let dump = request(
        &mut stdin,
        &mut reader,
        "10",
        "export.json",
        json!({ "sessionToken": "tok-1" }),
    );
    assert!(dump["result"]["filename"]
        .as_str()
        .expect("filename")
        .starts_with("seed-data-"));
    assert_eq!(dump["result"]["data"]["metadata"]["userId"], "u1");

    let unknown = request(&mut stdin, &mut reader, "11", "nope.nothing", json!({}));
    assert_eq!(unknown["ok"], false);
    assert_eq!(unknown["error"]["code"], "not_implemented");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn storage_methods_require_a_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    for (i, method) in ["modules.overview", "notes.set", "export.csv", "seed.load"]
        .iter()
        .enumerate()
    {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("{i}"),
            method,
            json!({ "sessionToken": "tok-1" }),
        );
        assert_eq!(resp["ok"], false, "{method} should fail");
        assert_eq!(resp["error"]["code"], "no_workspace", "{method}");
    }

    drop(stdin);
    let _ = child.wait();
}
