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

fn setup_workspace(workspace: &Path) {
    let conn = Connection::open(workspace.join("notes.sqlite3")).expect("open workspace db");
    let now = Utc::now().to_rfc3339();
    let expires = (Utc::now() + Duration::days(7)).to_rfc3339();
    conn.execute(
        "INSERT INTO users(id, name, email, created_at, updated_at) VALUES(?, ?, ?, ?, ?)",
        ("u1", "Test User", "u1@cfc.local", &now, &now),
    )
    .expect("insert user");
    conn.execute(
        "INSERT INTO sessions(id, token, user_id, expires_at, created_at) VALUES(?, ?, ?, ?, ?)",
        ("sess-u1", "tok-1", "u1", &expires, &now),
    )
    .expect("insert session");

    let modules: [(&str, &str, &str, i64); 3] = [
        ("m1", "431 - Test \"A\"; B", "431", 2),
        ("m2", "117 - Sans note", "117", 1),
        ("m3", "306 - Note enti\u{e8}re", "306", 1),
    ];
    for (id, nom, code, annee) in modules {
        conn.execute(
            "INSERT INTO modules(id, nom, code, annee, is_cie, created_at, updated_at)
             VALUES(?, ?, ?, ?, 0, ?, ?)",
            (id, nom, code, annee, &now, &now),
        )
        .expect("insert module");
    }
}

#[test]
fn csv_export_matches_locale_conventions_exactly() {
    let workspace = temp_dir("notesd-csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let selected = request(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], true);
    setup_workspace(&workspace);

    for (i, (module_id, note)) in [("m1", json!(4.5)), ("m3", json!(5.0))].iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("set-{i}"),
            "notes.set",
            json!({ "sessionToken": "tok-1", "moduleId": module_id, "note": note }),
        );
        assert_eq!(resp["ok"], true);
    }

    let export = request(
        &mut stdin,
        &mut reader,
        "csv",
        "export.csv",
        json!({ "sessionToken": "tok-1" }),
    );
    assert_eq!(export["ok"], true);
    assert_eq!(
        export["result"]["contentType"],
        "text/csv; charset=utf-8; sep=;"
    );

    // Rows follow (annee, code) order; m2 has no note and is absent; quotes
    // stripped, embedded semicolon becomes a comma, decimal point becomes a
    // decimal comma, integral notes render without a decimal part.
    let content = export["result"]["content"].as_str().expect("content");
    assert_eq!(
        content,
        "Module;Note\n\"306 - Note enti\u{e8}re\";5\n\"431 - Test A, B\";4,5\n"
    );

    let filename = export["result"]["filename"].as_str().expect("filename");
    assert!(filename.starts_with("notes-cfc-") && filename.ends_with(".csv"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn report_includes_ungraded_modules_and_both_average_formulas() {
    let workspace = temp_dir("notesd-report");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let selected = request(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], true);
    setup_workspace(&workspace);

    // One CIE module on top of the three normal ones.
    {
        let conn = Connection::open(workspace.join("notes.sqlite3")).expect("open db");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO modules(id, nom, code, annee, is_cie, created_at, updated_at)
             VALUES(?, ?, ?, ?, 1, ?, ?)",
            ("m4", "CIE - Atelier", "900", 2, &now, &now),
        )
        .expect("insert module");
    }

    for (i, (module_id, note)) in [("m1", 5.0), ("m3", 3.0), ("m4", 4.0)].iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("set-{i}"),
            "notes.set",
            json!({ "sessionToken": "tok-1", "moduleId": module_id, "note": note }),
        );
        assert_eq!(resp["ok"], true);
    }

    // modules.overview carries the weighted 80/20 formula.
    let overview = request(
        &mut stdin,
        &mut reader,
        "ov",
        "modules.overview",
        json!({ "sessionToken": "tok-1" }),
    );
    let averages = &overview["result"]["averages"];
    assert_eq!(averages["normalAverage"], 4.0);
    assert_eq!(averages["cieAverage"], 4.0);
    assert_eq!(averages["weightedAverage"], 4.0);
    assert_eq!(averages["totalModules"], 4);
    assert_eq!(averages["gradedModules"], 3);

    // The report header uses the unweighted mean over all graded modules.
    let report = request(
        &mut stdin,
        &mut reader,
        "rep",
        "export.report",
        json!({ "sessionToken": "tok-1" }),
    );
    let html = report["result"]["html"].as_str().expect("html");
    assert!(html.contains("<strong>Total des modules :</strong> 4"));
    assert!(html.contains("<strong>Modules not\u{e9}s :</strong> 3"));
    assert!(html.contains("<strong>Moyenne g\u{e9}n\u{e9}rale :</strong> 4.00/6"));
    // Ungraded module still renders with the 0 sentinel.
    assert!(html.contains("117 - Sans note"));
    assert!(html.contains("<td class=\"note\">0/6</td>"));
    // CIE rows are visually distinguished.
    assert!(html.contains("<tr class=\"cie\">"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn module_listings_are_deterministic_across_reads() {
    let workspace = temp_dir("notesd-determinism");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let selected = request(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], true);
    setup_workspace(&workspace);

    let first = request(
        &mut stdin,
        &mut reader,
        "r1",
        "modules.byYear",
        json!({ "sessionToken": "tok-1", "annee": 1 }),
    );
    let second = request(
        &mut stdin,
        &mut reader,
        "r2",
        "modules.byYear",
        json!({ "sessionToken": "tok-1", "annee": 1 }),
    );
    assert_eq!(first["result"], second["result"]);
    assert_eq!(first["result"]["modules"][0]["code"], "117");
    assert_eq!(first["result"]["modules"][1]["code"], "306");

    // Years come back ascending in the overview.
    let overview = request(
        &mut stdin,
        &mut reader,
        "ov",
        "modules.overview",
        json!({ "sessionToken": "tok-1" }),
    );
    let years: Vec<i64> = overview["result"]["years"]
        .as_array()
        .expect("years")
        .iter()
        .map(|g| g["annee"].as_i64().expect("annee"))
        .collect();
    assert_eq!(years, vec![1, 2]);

    drop(stdin);
    let _ = child.wait();
}
