//! Typed suggestion payloads and the confidence policy.
//!
//! The extraction backend returns loosely shaped JSON. Each raw item is
//! parsed into a [`SuggestedData`] variant keyed by its target table;
//! items that do not parse, or whose confidence falls below the floor, are
//! dropped before anything is persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::catalog_repo::{CandidateMatch, CatalogTable};
use crate::db::SuggestionType;

/// One item as returned by an extraction backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawSuggestion {
    pub target_table: String,
    #[serde(default)]
    pub data: Value,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesData {
    pub scientific_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<CandidateMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<CandidateMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FungusData {
    pub scientific_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_species: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<CandidateMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationData {
    pub measure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applies_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
}

/// A measured or observed tree attribute, e.g. trunk girth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureData {
    pub feature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteData {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target_table", content = "data", rename_all = "snake_case")]
pub enum SuggestedData {
    Species(SpeciesData),
    Defects(DefectData),
    Fungi(FungusData),
    MitigationMeasures(MitigationData),
    TreeFeatures(FeatureData),
    KbNotes(NoteData),
}

impl SuggestedData {
    /// Parses a raw item. Unknown tables and malformed payloads yield `None`.
    pub fn from_raw(raw: &RawSuggestion) -> Option<Self> {
        let tagged = serde_json::json!({
            "target_table": raw.target_table.trim(),
            "data": raw.data,
        });
        let parsed: Self = serde_json::from_value(tagged).ok()?;
        (!parsed.primary_text().trim().is_empty()).then_some(parsed)
    }

    pub fn target_table(&self) -> &'static str {
        match self {
            SuggestedData::Species(_) => "species",
            SuggestedData::Defects(_) => "defects",
            SuggestedData::Fungi(_) => "fungi",
            SuggestedData::MitigationMeasures(_) => "mitigation_measures",
            SuggestedData::TreeFeatures(_) => "tree_features",
            SuggestedData::KbNotes(_) => "kb_notes",
        }
    }

    pub fn suggestion_type(&self) -> SuggestionType {
        match self {
            SuggestedData::Species(_) => SuggestionType::Species,
            SuggestedData::Defects(_) => SuggestionType::Defect,
            SuggestedData::Fungi(_) => SuggestionType::Fungus,
            SuggestedData::MitigationMeasures(_) => SuggestionType::Mitigation,
            SuggestedData::TreeFeatures(_) => SuggestionType::Feature,
            SuggestedData::KbNotes(_) => SuggestionType::Other,
        }
    }

    fn primary_text(&self) -> &str {
        match self {
            SuggestedData::Species(d) => &d.scientific_name,
            SuggestedData::Defects(d) => &d.name,
            SuggestedData::Fungi(d) => &d.scientific_name,
            SuggestedData::MitigationMeasures(d) => &d.measure,
            SuggestedData::TreeFeatures(d) => &d.feature,
            SuggestedData::KbNotes(d) => &d.text,
        }
    }

    /// Catalog table and search term for variants with a name-like field.
    pub fn lookup(&self) -> Option<(CatalogTable, &str)> {
        match self {
            SuggestedData::Species(d) => Some((CatalogTable::Species, d.scientific_name.trim())),
            SuggestedData::Defects(d) => Some((CatalogTable::Defects, d.name.trim())),
            SuggestedData::Fungi(d) => Some((CatalogTable::Fungi, d.scientific_name.trim())),
            _ => None,
        }
    }

    pub fn set_matches(&mut self, candidates: Vec<CandidateMatch>) {
        match self {
            SuggestedData::Species(d) => d.matches = candidates,
            SuggestedData::Defects(d) => d.matches = candidates,
            SuggestedData::Fungi(d) => d.matches = candidates,
            _ => {}
        }
    }

    /// The payload stored in `suggested_data`, without the table tag.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// Explicit and complete in the source text.
    Explicit,
    /// Clear with minor gaps.
    Clear,
    /// Partial or interpreted.
    Partial,
}

impl ConfidenceBand {
    /// Band for `confidence`, or `None` when it must be dropped.
    pub fn of(confidence: f64, floor: f64) -> Option<Self> {
        if !confidence.is_finite() || confidence > 1.0 || confidence < floor {
            None
        } else if confidence >= 0.9 {
            Some(ConfidenceBand::Explicit)
        } else if confidence >= 0.7 {
            Some(ConfidenceBand::Clear)
        } else {
            Some(ConfidenceBand::Partial)
        }
    }
}
