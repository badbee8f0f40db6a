use crate::calc::{self, CalcContext, CalcError, ModuleNote, YearGroup};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8; sep=;";

pub fn csv_filename() -> String {
    format!("notes-cfc-{}.csv", Utc::now().format("%Y-%m-%d"))
}

pub fn seed_json_filename() -> String {
    format!("seed-data-{}.json", Utc::now().format("%Y-%m-%d"))
}

/// Decimal-locale rendering: `4.5` -> `4,5`, `5` stays `5`.
fn fmt_note_csv(note: f64) -> String {
    note.to_string().replace('.', ",")
}

/// The module name field is quoted; embedded quotes are stripped and embedded
/// semicolons (the field separator) become commas first.
fn clean_module_name(nom: &str) -> String {
    nom.replace('"', "").replace(';', ",")
}

/// Semicolon CSV of recorded evidence: one row per module with a nonzero note.
/// Historical duplicates for the same module keep the most recently updated row.
pub fn notes_csv(modules: &[ModuleNote]) -> String {
    let mut latest: HashMap<&str, &ModuleNote> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for m in modules {
        match latest.get(m.id.as_str()) {
            Some(existing) if existing.note_updated_at >= m.note_updated_at => {}
            Some(_) => {
                latest.insert(m.id.as_str(), m);
            }
            None => {
                latest.insert(m.id.as_str(), m);
                order.push(m.id.as_str());
            }
        }
    }

    let mut out = String::from("Module;Note\n");
    for id in order {
        let m = latest[id];
        let note = m.note.unwrap_or(0.0);
        if note <= 0.0 {
            continue;
        }
        out.push_str(&format!(
            "\"{}\";{}\n",
            clean_module_name(&m.nom),
            fmt_note_csv(note)
        ));
    }
    out
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Note as displayed in the report body (dot decimal, `0` when unset).
fn fmt_note_html(note: Option<f64>) -> String {
    note.unwrap_or(0.0).to_string()
}

/// Printable report: summary statistics, then one table per year in ascending
/// order with CIE rows visually distinguished. All modules appear, graded or not.
pub fn report_html(user_name: &str, groups: &[YearGroup]) -> String {
    let all: Vec<ModuleNote> = groups.iter().flat_map(|g| g.modules.clone()).collect();
    let averages = calc::module_averages(&all);
    let overall = calc::overall_average(&all);

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!(
        "<title>Notes de {}</title>\n",
        escape_html(user_name)
    ));
    html.push_str(
        "<style>\n\
         body { font-family: Arial, sans-serif; margin: 20px; }\n\
         h1 { color: #333; text-align: center; }\n\
         h2 { color: #666; border-bottom: 2px solid #eee; padding-bottom: 5px; }\n\
         table { width: 100%; border-collapse: collapse; margin: 20px 0; }\n\
         th, td { border: 1px solid #ddd; padding: 8px; text-align: left; }\n\
         th { background-color: #f5f5f5; font-weight: bold; }\n\
         .note { font-weight: bold; }\n\
         .cie { background-color: #fff3cd; }\n\
         .stats { margin: 20px 0; padding: 15px; background-color: #f8f9fa; border-radius: 5px; }\n\
         </style>\n</head>\n<body>\n",
    );
    html.push_str(&format!("<h1>Notes de {}</h1>\n", escape_html(user_name)));
    html.push_str("<div class=\"stats\">\n<h3>Statistiques</h3>\n");
    html.push_str(&format!(
        "<p><strong>Total des modules :</strong> {}</p>\n",
        averages.total_modules
    ));
    html.push_str(&format!(
        "<p><strong>Modules not\u{e9}s :</strong> {}</p>\n",
        averages.graded_modules
    ));
    html.push_str(&format!(
        "<p><strong>Moyenne g\u{e9}n\u{e9}rale :</strong> {:.2}/6</p>\n</div>\n",
        overall
    ));

    for group in groups {
        html.push_str(&format!("<h2>{}\u{e8}me ann\u{e9}e</h2>\n", group.annee));
        html.push_str(
            "<table>\n<thead>\n<tr><th>Code</th><th>Module</th><th>Note</th><th>CIE</th></tr>\n\
             </thead>\n<tbody>\n",
        );
        for m in &group.modules {
            let class = if m.is_cie { " class=\"cie\"" } else { "" };
            html.push_str(&format!(
                "<tr{}><td>{}</td><td>{}</td><td class=\"note\">{}/6</td><td>{}</td></tr>\n",
                class,
                escape_html(&m.code),
                escape_html(&m.nom),
                fmt_note_html(m.note),
                if m.is_cie { "Oui" } else { "Non" }
            ));
        }
        html.push_str("</tbody>\n</table>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

// Seed-data shape, kept field-for-field compatible with the original export so
// a dump reloads through seed.load without translation.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDomaine {
    pub id: String,
    pub nom: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedCompetence {
    pub id: String,
    pub nom: String,
    pub description: String,
    pub domaine_id: String,
    pub domaine: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedModule {
    pub id: String,
    pub nom: String,
    pub code: String,
    pub annee: i64,
    pub is_cie: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedLien {
    pub competence_id: String,
    pub module_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedNote {
    pub module_id: String,
    pub note: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedNiveau {
    pub competence_id: String,
    pub niveau: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedMetadata {
    pub export_date: String,
    pub user_id: String,
    pub total_domaines: usize,
    pub total_competences: usize,
    pub total_modules: usize,
    pub total_notes: usize,
    pub total_niveaux: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedData {
    pub domaines: Vec<SeedDomaine>,
    pub competences: Vec<SeedCompetence>,
    pub modules: Vec<SeedModule>,
    pub liens_competence_module: Vec<SeedLien>,
    pub notes_utilisateur: Vec<SeedNote>,
    pub niveaux_competences: Vec<SeedNiveau>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SeedMetadata>,
}

/// Full reference data plus the caller's notes and niveaux, for reseeding
/// another environment.
pub fn build_seed_data(ctx: &CalcContext<'_>) -> Result<SeedData, CalcError> {
    let db_err = |e: rusqlite::Error| CalcError::new("db_query_failed", e.to_string());

    let mut stmt = ctx
        .conn
        .prepare("SELECT id, nom FROM domaines ORDER BY nom")
        .map_err(db_err)?;
    let domaines: Vec<SeedDomaine> = stmt
        .query_map([], |r| {
            Ok(SeedDomaine {
                id: r.get(0)?,
                nom: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT c.id, c.nom, c.description, c.domaine_id, d.nom
             FROM competences c
             JOIN domaines d ON d.id = c.domaine_id
             ORDER BY d.nom, c.nom",
        )
        .map_err(db_err)?;
    let competences: Vec<SeedCompetence> = stmt
        .query_map([], |r| {
            Ok(SeedCompetence {
                id: r.get(0)?,
                nom: r.get(1)?,
                description: r.get(2)?,
                domaine_id: r.get(3)?,
                domaine: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut stmt = ctx
        .conn
        .prepare("SELECT id, nom, code, annee, is_cie FROM modules ORDER BY annee, code")
        .map_err(db_err)?;
    let modules: Vec<SeedModule> = stmt
        .query_map([], |r| {
            Ok(SeedModule {
                id: r.get(0)?,
                nom: r.get(1)?,
                code: r.get(2)?,
                annee: r.get(3)?,
                is_cie: r.get::<_, i64>(4)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT competence_id, module_id FROM competence_modules
             ORDER BY competence_id, module_id",
        )
        .map_err(db_err)?;
    let liens: Vec<SeedLien> = stmt
        .query_map([], |r| {
            Ok(SeedLien {
                competence_id: r.get(0)?,
                module_id: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT module_id, note FROM user_module_notes
             WHERE user_id = ? ORDER BY module_id",
        )
        .map_err(db_err)?;
    let notes: Vec<SeedNote> = stmt
        .query_map([ctx.user_id], |r| {
            Ok(SeedNote {
                module_id: r.get(0)?,
                note: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT competence_id, niveau FROM user_competence_niveaux
             WHERE user_id = ? ORDER BY competence_id",
        )
        .map_err(db_err)?;
    let niveaux: Vec<SeedNiveau> = stmt
        .query_map([ctx.user_id], |r| {
            Ok(SeedNiveau {
                competence_id: r.get(0)?,
                niveau: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let metadata = SeedMetadata {
        export_date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        user_id: ctx.user_id.to_string(),
        total_domaines: domaines.len(),
        total_competences: competences.len(),
        total_modules: modules.len(),
        total_notes: notes.len(),
        total_niveaux: niveaux.len(),
    };

    Ok(SeedData {
        domaines,
        competences,
        modules,
        liens_competence_module: liens,
        notes_utilisateur: notes,
        niveaux_competences: niveaux,
        metadata: Some(metadata),
    })
}
