use rusqlite::Connection;
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// CIE modules count for one fifth of the final mark.
pub const CIE_WEIGHT: f64 = 0.2;
pub const NORMAL_WEIGHT: f64 = 0.8;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub user_id: &'a str,
}

/// Missing user rows stay `None` inside the engine; the wire shape keeps the
/// original's `0` sentinel, so the coercion happens only at serialization.
fn note_or_zero<S: Serializer>(v: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(v.unwrap_or(0.0))
}

fn niveau_or_zero<S: Serializer>(v: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(v.unwrap_or(0))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleNote {
    pub id: String,
    pub nom: String,
    pub code: String,
    pub annee: i64,
    pub is_cie: bool,
    #[serde(serialize_with = "note_or_zero")]
    pub note: Option<f64>,
    pub note_id: Option<String>,
    pub note_updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearGroup {
    pub annee: i64,
    pub modules: Vec<ModuleNote>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleAverages {
    pub total_modules: usize,
    pub graded_modules: usize,
    pub normal_average: f64,
    pub cie_average: f64,
    pub weighted_average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedModule {
    pub id: String,
    pub nom: String,
    pub code: String,
    pub annee: i64,
    pub is_cie: bool,
    #[serde(serialize_with = "note_or_zero")]
    pub note: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetenceNiveau {
    pub id: String,
    pub nom: String,
    pub description: String,
    pub domaine_id: String,
    pub domaine: String,
    #[serde(serialize_with = "niveau_or_zero")]
    pub niveau: Option<i64>,
    pub niveau_id: Option<String>,
    pub modules: Vec<LinkedModule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NiveauStats {
    pub niveau_1_2: usize,
    pub niveau_3_4: usize,
    pub niveau_5: usize,
    pub non_defini: usize,
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// Modules of one year left-joined with the caller's notes, ordered by code.
pub fn fetch_modules_by_year(
    ctx: &CalcContext<'_>,
    annee: i64,
) -> Result<Vec<ModuleNote>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT m.id, m.nom, m.code, m.annee, m.is_cie, n.note, n.id, n.updated_at
             FROM modules m
             LEFT JOIN user_module_notes n
               ON n.module_id = m.id AND n.user_id = ?
             WHERE m.annee = ?
             ORDER BY m.code",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((ctx.user_id, annee), module_note_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

/// All modules with the caller's notes, ordered by (annee, code).
pub fn fetch_all_modules(ctx: &CalcContext<'_>) -> Result<Vec<ModuleNote>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT m.id, m.nom, m.code, m.annee, m.is_cie, n.note, n.id, n.updated_at
             FROM modules m
             LEFT JOIN user_module_notes n
               ON n.module_id = m.id AND n.user_id = ?
             ORDER BY m.annee, m.code",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([ctx.user_id], module_note_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

fn module_note_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ModuleNote> {
    Ok(ModuleNote {
        id: r.get(0)?,
        nom: r.get(1)?,
        code: r.get(2)?,
        annee: r.get(3)?,
        is_cie: r.get::<_, i64>(4)? != 0,
        note: r.get(5)?,
        note_id: r.get(6)?,
        note_updated_at: r.get(7)?,
    })
}

/// Competencies joined with their domain and the caller's niveau, ordered by
/// (domaine.nom, competence.nom), each carrying its linked modules.
pub fn fetch_competences(ctx: &CalcContext<'_>) -> Result<Vec<CompetenceNiveau>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT c.id, c.nom, c.description, d.id, d.nom, v.niveau, v.id
             FROM competences c
             JOIN domaines d ON d.id = c.domaine_id
             LEFT JOIN user_competence_niveaux v
               ON v.competence_id = c.id AND v.user_id = ?
             ORDER BY d.nom, c.nom",
        )
        .map_err(db_err)?;
    let mut competences: Vec<CompetenceNiveau> = stmt
        .query_map([ctx.user_id], |r| {
            Ok(CompetenceNiveau {
                id: r.get(0)?,
                nom: r.get(1)?,
                description: r.get(2)?,
                domaine_id: r.get(3)?,
                domaine: r.get(4)?,
                niveau: r.get(5)?,
                niveau_id: r.get(6)?,
                modules: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut link_stmt = ctx
        .conn
        .prepare(
            "SELECT cm.competence_id, m.id, m.nom, m.code, m.annee, m.is_cie, n.note
             FROM competence_modules cm
             JOIN modules m ON m.id = cm.module_id
             LEFT JOIN user_module_notes n
               ON n.module_id = m.id AND n.user_id = ?
             ORDER BY m.annee, m.code",
        )
        .map_err(db_err)?;
    let links = link_stmt
        .query_map([ctx.user_id], |r| {
            let competence_id: String = r.get(0)?;
            Ok((
                competence_id,
                LinkedModule {
                    id: r.get(1)?,
                    nom: r.get(2)?,
                    code: r.get(3)?,
                    annee: r.get(4)?,
                    is_cie: r.get::<_, i64>(5)? != 0,
                    note: r.get(6)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut by_competence: HashMap<String, Vec<LinkedModule>> = HashMap::new();
    for (competence_id, module) in links {
        by_competence.entry(competence_id).or_default().push(module);
    }
    for c in &mut competences {
        if let Some(mods) = by_competence.remove(&c.id) {
            c.modules = mods;
        }
    }

    Ok(competences)
}

/// Buckets keyed by annee in ascending order; inner order is whatever the
/// query returned (stable, never re-sorted here).
pub fn group_by_year(modules: Vec<ModuleNote>) -> Vec<YearGroup> {
    let mut groups: Vec<YearGroup> = Vec::new();
    for module in modules {
        match groups.iter_mut().find(|g| g.annee == module.annee) {
            Some(g) => g.modules.push(module),
            None => groups.push(YearGroup {
                annee: module.annee,
                modules: vec![module],
            }),
        }
    }
    groups.sort_by_key(|g| g.annee);
    groups
}

fn graded(module: &ModuleNote) -> Option<f64> {
    // A stored 0 and a missing row are both "ungraded" for the averages.
    module.note.filter(|v| *v > 0.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Normal/CIE split averages plus the fixed 80/20 weighted mark. An empty
/// subset contributes 0 to the weighted sum; there is no renormalization.
pub fn module_averages(modules: &[ModuleNote]) -> ModuleAverages {
    let mut normal: Vec<f64> = Vec::new();
    let mut cie: Vec<f64> = Vec::new();
    let mut graded_count = 0usize;

    for m in modules {
        let Some(note) = graded(m) else {
            continue;
        };
        graded_count += 1;
        if m.is_cie {
            cie.push(note);
        } else {
            normal.push(note);
        }
    }

    let normal_average = mean(&normal);
    let cie_average = mean(&cie);
    ModuleAverages {
        total_modules: modules.len(),
        graded_modules: graded_count,
        normal_average,
        cie_average,
        weighted_average: normal_average * NORMAL_WEIGHT + cie_average * CIE_WEIGHT,
    }
}

/// Unweighted mean across ALL graded modules, CIE or not. This is the report
/// formula, intentionally different from the weighted one above.
pub fn overall_average(modules: &[ModuleNote]) -> f64 {
    let notes: Vec<f64> = modules.iter().filter_map(graded).collect();
    mean(&notes)
}

pub fn niveau_stats(competences: &[CompetenceNiveau]) -> NiveauStats {
    let mut stats = NiveauStats {
        niveau_1_2: 0,
        niveau_3_4: 0,
        niveau_5: 0,
        non_defini: 0,
    };
    for c in competences {
        match c.niveau {
            Some(n) if (1..=2).contains(&n) => stats.niveau_1_2 += 1,
            Some(n) if (3..=4).contains(&n) => stats.niveau_3_4 += 1,
            Some(5) => stats.niveau_5 += 1,
            _ => stats.non_defini += 1,
        }
    }
    stats
}
