//! Canonical catalog lookups (`species`, `defects`, `fungi`).
//!
//! Used by structured extraction to attach candidate matches to
//! name-like suggestions so a curator can tell new from existing entities.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{Database, DatabaseError};

/// Catalog tables that hold a name-like field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogTable {
    Species,
    Defects,
    Fungi,
}

impl CatalogTable {
    fn select_sql(self) -> &'static str {
        match self {
            CatalogTable::Species => {
                "SELECT id, scientific_name, common_name FROM species
                 WHERE lower(scientific_name) LIKE ?1 ESCAPE '\\'
                    OR lower(coalesce(common_name, '')) LIKE ?1 ESCAPE '\\'
                    OR ?2 LIKE '%' || lower(scientific_name) || '%'"
            }
            CatalogTable::Defects => {
                "SELECT id, name, NULL FROM defects
                 WHERE lower(name) LIKE ?1 ESCAPE '\\'
                    OR ?2 LIKE '%' || lower(name) || '%'"
            }
            CatalogTable::Fungi => {
                "SELECT id, scientific_name, NULL FROM fungi
                 WHERE lower(scientific_name) LIKE ?1 ESCAPE '\\'
                    OR ?2 LIKE '%' || lower(scientific_name) || '%'"
            }
        }
    }
}

/// A fuzzy-matched canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub id: String,
    pub name: String,
    pub score: f64,
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn score(term: &str, name: &str) -> f64 {
    let name = name.to_lowercase();
    if name == term {
        1.0
    } else if name.starts_with(term) || term.starts_with(&name) {
        0.8
    } else {
        0.6
    }
}

/// Case-insensitive substring match in both directions, ranked
/// exact > prefix > substring, at most `limit` results.
pub fn find_similar(
    db: &Database,
    table: CatalogTable,
    term: &str,
    limit: usize,
) -> Result<Vec<CandidateMatch>, DatabaseError> {
    let term = term.trim().to_lowercase();
    if term.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let pattern = format!("%{}%", escape_like(&term));

    let mut matches = db.with_conn(|conn| {
        let mut stmt = conn.prepare(table.select_sql())?;
        let rows = stmt
            .query_map(params![pattern, term], |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let common: Option<String> = row.get(2)?;
                Ok((id, name, common))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?
    .into_iter()
    .map(|(id, name, common)| {
        let best = common
            .as_deref()
            .map(|c| score(&term, c))
            .unwrap_or(0.0)
            .max(score(&term, &name));
        CandidateMatch { id, name, score: best }
    })
    .collect::<Vec<_>>();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    matches.truncate(limit);
    Ok(matches)
}

pub fn insert_species(
    db: &Database,
    id: &str,
    scientific_name: &str,
    common_name: Option<&str>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO species (id, scientific_name, common_name) VALUES (?1, ?2, ?3)",
            params![id, scientific_name, common_name],
        )?;
        Ok(())
    })
}

pub fn insert_defect(db: &Database, id: &str, name: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("INSERT INTO defects (id, name) VALUES (?1, ?2)", params![id, name])?;
        Ok(())
    })
}

pub fn insert_fungus(db: &Database, id: &str, scientific_name: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO fungi (id, scientific_name) VALUES (?1, ?2)",
            params![id, scientific_name],
        )?;
        Ok(())
    })
}
