use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("notes.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Owned by the auth collaborator; the daemon only resolves tokens here.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            token TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS domaines(
            id TEXT PRIMARY KEY,
            nom TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS competences(
            id TEXT PRIMARY KEY,
            nom TEXT NOT NULL,
            description TEXT NOT NULL,
            domaine_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(domaine_id) REFERENCES domaines(id) ON DELETE CASCADE,
            UNIQUE(domaine_id, nom)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_competences_domaine ON competences(domaine_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS modules(
            id TEXT PRIMARY KEY,
            nom TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            annee INTEGER NOT NULL,
            is_cie INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_modules_annee ON modules(annee, code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS competence_modules(
            id TEXT PRIMARY KEY,
            competence_id TEXT NOT NULL,
            module_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(competence_id) REFERENCES competences(id) ON DELETE CASCADE,
            FOREIGN KEY(module_id) REFERENCES modules(id) ON DELETE CASCADE,
            UNIQUE(competence_id, module_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_competence_modules_competence
         ON competence_modules(competence_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_competence_modules_module
         ON competence_modules(module_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_module_notes(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            module_id TEXT NOT NULL,
            note REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY(module_id) REFERENCES modules(id) ON DELETE CASCADE,
            UNIQUE(user_id, module_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_module_notes_user ON user_module_notes(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_module_notes_module ON user_module_notes(module_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_competence_niveaux(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            competence_id TEXT NOT NULL,
            niveau INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY(competence_id) REFERENCES competences(id) ON DELETE CASCADE,
            UNIQUE(user_id, competence_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_competence_niveaux_user
         ON user_competence_niveaux(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_competence_niveaux_competence
         ON user_competence_niveaux(competence_id)",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use rusqlite::Connection;

    /// Throwaway workspace with the full schema, for unit tests.
    pub fn open_test_db() -> Connection {
        let dir = std::env::temp_dir().join(format!("notesd-unit-{}", uuid::Uuid::new_v4()));
        open_db(&dir).expect("open test db")
    }

    pub fn insert_user(conn: &Connection, id: &str, name: &str, email: &str) {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO users(id, name, email, created_at, updated_at) VALUES(?, ?, ?, ?, ?)",
            (id, name, email, &now, &now),
        )
        .expect("insert user");
    }

    pub fn insert_module(conn: &Connection, id: &str, nom: &str, code: &str, annee: i64, is_cie: bool) {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO modules(id, nom, code, annee, is_cie, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (id, nom, code, annee, is_cie as i64, &now, &now),
        )
        .expect("insert module");
    }

    pub fn insert_domaine(conn: &Connection, id: &str, nom: &str) {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO domaines(id, nom, created_at, updated_at) VALUES(?, ?, ?, ?)",
            (id, nom, &now, &now),
        )
        .expect("insert domaine");
    }

    pub fn insert_competence(conn: &Connection, id: &str, nom: &str, description: &str, domaine_id: &str) {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO competences(id, nom, description, domaine_id, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (id, nom, description, domaine_id, &now, &now),
        )
        .expect("insert competence");
    }

    pub fn insert_note(conn: &Connection, user_id: &str, module_id: &str, note: f64) {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO user_module_notes(id, user_id, module_id, note, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (uuid::Uuid::new_v4().to_string(), user_id, module_id, note, &now, &now),
        )
        .expect("insert note");
    }
}
