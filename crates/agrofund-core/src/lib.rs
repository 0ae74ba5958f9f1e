//! Core domain model for the agricultural funding catalog.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub mod amount;
pub mod env;
pub mod merge;
pub mod normalize;
pub mod query;

pub use amount::{parse_amount, try_parse_amount, AmountError};
pub use merge::{merge, merge_by, DedupKey, MergeOutcome};
pub use normalize::{
    normalize, normalize_batch, with_default_source, NormalizeError, NormalizedBatch, RawRecord,
};
pub use query::{CatalogQuery, CatalogStats, SortOrder};

pub const CRATE_NAME: &str = "agrofund-core";

/// Placeholder written into optional fields that carry no value.
pub const NOT_AVAILABLE: &str = "N/A";

const ID_NAMESPACE: Uuid = Uuid::from_u128(0x5f1c_9a2e_8d3b_4c7a_9e21_6b0f_d4a8_c312);

/// Publication state of a funding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Status {
    #[default]
    Open,
    Closed,
    UnderReview,
    UpcomingOpening,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Open,
        Status::Closed,
        Status::UnderReview,
        Status::UpcomingOpening,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Open => "Open",
            Status::Closed => "Closed",
            Status::UnderReview => "UnderReview",
            Status::UpcomingOpening => "UpcomingOpening",
        }
    }

    /// Parses English or Spanish labels, ignoring case, accents and separators.
    pub fn from_label(label: &str) -> Option<Self> {
        let folded: String = label
            .trim()
            .to_lowercase()
            .chars()
            .filter_map(|c| match c {
                'á' | 'à' => Some('a'),
                'é' | 'è' => Some('e'),
                'í' => Some('i'),
                'ó' | 'ò' => Some('o'),
                'ú' | 'ü' => Some('u'),
                c if c.is_alphanumeric() => Some(c),
                _ => None,
            })
            .collect();
        match folded.as_str() {
            "open" | "abierto" | "abierta" | "vigente" => Some(Status::Open),
            "closed" | "cerrado" | "cerrada" | "finalizado" | "finalizada" => Some(Status::Closed),
            "underreview" | "enevaluacion" | "enrevision" | "evaluacion" => Some(Status::UnderReview),
            "upcomingopening" | "upcoming" | "proximaapertura" | "proximamente" => {
                Some(Status::UpcomingOpening)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Status::from_label(&label).unwrap_or_default())
    }
}

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

/// One catalog entry. Field names double as the tabular header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingOpportunity {
    pub name: String,
    #[serde(default = "not_available")]
    pub source: String,
    #[serde(default = "not_available")]
    pub closing_date: String,
    #[serde(default = "not_available")]
    pub link: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default = "not_available")]
    pub amount: String,
    #[serde(default = "not_available")]
    pub area_of_interest: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "not_available")]
    pub contact_email: String,
    #[serde(default = "not_available")]
    pub phone: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default = "not_available")]
    pub financing_type: String,
    #[serde(default = "not_available")]
    pub complexity_level: String,
    #[serde(default = "not_available")]
    pub estimated_duration: String,
    #[serde(default = "not_available")]
    pub cofinancing_percentage: String,
    #[serde(default)]
    pub keywords: String,
}

impl FundingOpportunity {
    /// A record with only a name; every optional field carries its default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: not_available(),
            closing_date: not_available(),
            link: not_available(),
            status: Status::Open,
            amount: not_available(),
            area_of_interest: not_available(),
            description: String::new(),
            contact_email: not_available(),
            phone: not_available(),
            requirements: String::new(),
            financing_type: not_available(),
            complexity_level: not_available(),
            estimated_duration: not_available(),
            cofinancing_percentage: not_available(),
            keywords: String::new(),
        }
    }

    /// Stable identifier derived from `name + source`.
    pub fn id(&self) -> Uuid {
        let key = DedupKey::NameAndSource.key_for(self);
        Uuid::new_v5(&ID_NAMESPACE, key.as_bytes())
    }

    pub fn amount_value(&self) -> f64 {
        parse_amount(&self.amount)
    }

    pub fn closing_date_parsed(&self) -> Option<NaiveDate> {
        let text = self.closing_date.trim();
        // Timestamps exported from spreadsheets carry a trailing time part.
        let date_part = text.split(['T', ' ']).next().unwrap_or(text);
        ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_accept_spanish_and_english() {
        assert_eq!(Status::from_label("Abierto"), Some(Status::Open));
        assert_eq!(Status::from_label("CERRADA"), Some(Status::Closed));
        assert_eq!(Status::from_label("En evaluación"), Some(Status::UnderReview));
        assert_eq!(Status::from_label("Próxima apertura"), Some(Status::UpcomingOpening));
        assert_eq!(Status::from_label("UpcomingOpening"), Some(Status::UpcomingOpening));
        assert_eq!(Status::from_label("maybe"), None);
    }

    #[test]
    fn missing_json_fields_take_defaults() {
        let record: FundingOpportunity =
            serde_json::from_str(r#"{"name":"Riego Tecnificado","status":"Cerrado"}"#).unwrap();
        assert_eq!(record.status, Status::Closed);
        assert_eq!(record.source, NOT_AVAILABLE);
        assert_eq!(record.description, "");
    }

    #[test]
    fn id_depends_on_name_and_source() {
        let mut a = FundingOpportunity::named("Fondo Agua");
        a.source = "INDAP".into();
        let mut b = a.clone();
        assert_eq!(a.id(), b.id());
        b.source = "CORFO".into();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn closing_dates_parse_common_layouts() {
        let mut record = FundingOpportunity::named("x");
        record.closing_date = "2025-03-31".into();
        assert_eq!(record.closing_date_parsed(), NaiveDate::from_ymd_opt(2025, 3, 31));
        record.closing_date = "31/03/2025".into();
        assert_eq!(record.closing_date_parsed(), NaiveDate::from_ymd_opt(2025, 3, 31));
        record.closing_date = "2025-03-31 00:00:00".into();
        assert_eq!(record.closing_date_parsed(), NaiveDate::from_ymd_opt(2025, 3, 31));
        record.closing_date = NOT_AVAILABLE.into();
        assert_eq!(record.closing_date_parsed(), None);
    }
}
