//! Closed, versioned taxonomy of payload categories and slots.
//!
//! Categories and slots form the deterministic key space for stored
//! artifacts: every blob a stage writes lands at a key derived from
//! `(run_id, category, slot)`, so re-invocation overwrites instead of
//! duplicating. Adding a slot is an additive, compatible change; renaming
//! or removing one is a breaking schema change and requires bumping
//! [`CATALOG_VERSION`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::VeristateError;

/// Version of the category/slot taxonomy.
pub const CATALOG_VERSION: &str = "1.0.0";

/// The closed set of payload categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Image data: base64 payloads and their metadata.
    Images,
    /// AI prompts and conversation scaffolding.
    Prompts,
    /// Raw AI responses.
    Responses,
    /// Processed analysis and intermediate results.
    Processing,
    /// Error reports written by the finalize-on-error sink.
    Error,
}

impl Category {
    /// All categories, in catalog order.
    #[must_use]
    pub const fn all() -> [Self; 5] {
        [
            Self::Images,
            Self::Prompts,
            Self::Responses,
            Self::Processing,
            Self::Error,
        ]
    }

    /// Canonical lowercase name used in keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Prompts => "prompts",
            Self::Responses => "responses",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = VeristateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "images" => Ok(Self::Images),
            "prompts" => Ok(Self::Prompts),
            "responses" => Ok(Self::Responses),
            "processing" => Ok(Self::Processing),
            "error" => Ok(Self::Error),
            other => Err(VeristateError::validation(
                "parse_category",
                format!("unknown category '{other}'"),
            )),
        }
    }
}

/// The closed set of named payload slots.
///
/// Each slot belongs to exactly one [`Category`]; the pair determines the
/// storage key and the canonical `category_slot` reference name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Slot {
    /// Base64 payload of the reference image.
    ReferenceBase64,
    /// Base64 payload of the checking image.
    CheckingBase64,
    /// Metadata for the reference image.
    ReferenceMetadata,
    /// Metadata for the checking image.
    CheckingMetadata,
    /// The system prompt.
    SystemPrompt,
    /// Prompt for conversation turn 1.
    Turn1Prompt,
    /// Prompt for conversation turn 2.
    Turn2Prompt,
    /// Raw model response for turn 1.
    Turn1Raw,
    /// Raw model response for turn 2.
    Turn2Raw,
    /// Initialization context written at run start.
    Initialization,
    /// Layout metadata resolved during initialization.
    LayoutMetadata,
    /// Historical context for previous-vs-current runs.
    HistoricalContext,
    /// Processed analysis of turn 1.
    Turn1Analysis,
    /// Processed analysis of turn 2.
    Turn2Analysis,
    /// Final verification results.
    FinalResults,
    /// Error report persisted by the finalize-on-error sink.
    ErrorDetails,
}

impl Slot {
    /// The category this slot belongs to.
    #[must_use]
    pub const fn category(self) -> Category {
        match self {
            Self::ReferenceBase64
            | Self::CheckingBase64
            | Self::ReferenceMetadata
            | Self::CheckingMetadata => Category::Images,
            Self::SystemPrompt | Self::Turn1Prompt | Self::Turn2Prompt => Category::Prompts,
            Self::Turn1Raw | Self::Turn2Raw => Category::Responses,
            Self::Initialization
            | Self::LayoutMetadata
            | Self::HistoricalContext
            | Self::Turn1Analysis
            | Self::Turn2Analysis
            | Self::FinalResults => Category::Processing,
            Self::ErrorDetails => Category::Error,
        }
    }

    /// Canonical camel-case slot name used in keys and reference names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReferenceBase64 => "referenceBase64",
            Self::CheckingBase64 => "checkingBase64",
            Self::ReferenceMetadata => "referenceMetadata",
            Self::CheckingMetadata => "checkingMetadata",
            Self::SystemPrompt => "systemPrompt",
            Self::Turn1Prompt => "turn1Prompt",
            Self::Turn2Prompt => "turn2Prompt",
            Self::Turn1Raw => "turn1Raw",
            Self::Turn2Raw => "turn2Raw",
            Self::Initialization => "initialization",
            Self::LayoutMetadata => "layoutMetadata",
            Self::HistoricalContext => "historicalContext",
            Self::Turn1Analysis => "turn1Analysis",
            Self::Turn2Analysis => "turn2Analysis",
            Self::FinalResults => "finalResults",
            Self::ErrorDetails => "details",
        }
    }

    /// The canonical envelope reference name, `category_slot`.
    #[must_use]
    pub fn reference_name(self) -> String {
        format!("{}_{}", self.category(), self.as_str())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the flat deterministic key for `(run_id, category, slot)`.
///
/// Identical inputs always produce identical keys, which is what makes
/// accidental duplicate invocation safe: the last writer for a slot wins.
#[must_use]
pub fn object_key(run_id: &str, slot: Slot) -> String {
    format!("{}/{}/{}", run_id, slot.category(), slot)
}

/// Builds the date-partitioned key variant for human-browsable artifacts:
/// `YYYY/MM/DD/<run_id>/<category>/<slot>.json`.
///
/// The date is supplied by the caller (the envelope manager passes the
/// run's creation date) so keys stay deterministic per run.
#[must_use]
pub fn dated_object_key(date: chrono::NaiveDate, run_id: &str, slot: Slot) -> String {
    format!(
        "{}/{}/{}/{}.json",
        date.format("%Y/%m/%d"),
        run_id,
        slot.category(),
        slot
    )
}

/// A key decomposed back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    /// The run the artifact belongs to.
    pub run_id: String,
    /// The artifact's category.
    pub category: Category,
    /// The slot filename component (extension stripped).
    pub slot: String,
}

/// Parses a flat or date-partitioned key back into its parts.
///
/// # Errors
///
/// Returns a validation error if the key does not follow either layout or
/// names an unknown category.
pub fn parse_key(key: &str) -> Result<ParsedKey, VeristateError> {
    let parts: Vec<&str> = key.split('/').collect();

    // Date-partitioned keys start with YYYY/MM/DD.
    let parts = if parts.len() >= 6 && is_date_prefix(&parts[..3]) {
        &parts[3..]
    } else {
        &parts[..]
    };

    if parts.len() < 3 {
        return Err(VeristateError::validation(
            "parse_key",
            format!("invalid key format: '{key}'"),
        ));
    }

    let run_id = parts[0];
    if run_id.is_empty() {
        return Err(VeristateError::validation(
            "parse_key",
            format!("empty run id in key: '{key}'"),
        ));
    }

    let category = Category::from_str(parts[1])?;
    let slot = parts[2..].join("/");
    let slot = slot.strip_suffix(".json").unwrap_or(&slot).to_string();
    if slot.is_empty() {
        return Err(VeristateError::validation(
            "parse_key",
            format!("empty slot in key: '{key}'"),
        ));
    }

    Ok(ParsedKey {
        run_id: run_id.to_string(),
        category,
        slot,
    })
}

fn is_date_prefix(parts: &[&str]) -> bool {
    parts.len() == 3
        && parts[0].len() == 4
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
}
