//! Shapes raw scraped/seeded records into [`FundingOpportunity`] values.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::{FundingOpportunity, Status};

/// Flat field-name to value mapping as produced by a fetch source.
pub type RawRecord = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record has no name")]
    MissingName,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<FundingOpportunity>,
    pub rejected: usize,
}

const NAME: &[&str] = &["name", "nombre", "titulo", "título", "title"];
const SOURCE: &[&str] = &["source", "fuente", "organizacion", "organización"];
const CLOSING_DATE: &[&str] = &["closingDate", "closing_date", "fecha_cierre", "fecha de cierre", "fechaCierre"];
const LINK: &[&str] = &["link", "url", "enlace"];
const STATUS: &[&str] = &["status", "estado"];
const AMOUNT: &[&str] = &["amount", "monto", "financiamiento"];
const AREA: &[&str] = &["areaOfInterest", "area_of_interest", "area_de_interes", "área de interés", "categoria", "categoría"];
const DESCRIPTION: &[&str] = &["description", "descripcion", "descripción"];
const CONTACT_EMAIL: &[&str] = &["contactEmail", "contact_email", "email", "correo"];
const PHONE: &[&str] = &["phone", "telefono", "teléfono"];
const REQUIREMENTS: &[&str] = &["requirements", "requisitos"];
const FINANCING_TYPE: &[&str] = &["financingType", "financing_type", "tipo_financiamiento"];
const COMPLEXITY: &[&str] = &["complexityLevel", "complexity_level", "nivel_complejidad", "complejidad"];
const DURATION: &[&str] = &["estimatedDuration", "estimated_duration", "duracion_estimada", "duración estimada"];
const COFINANCING: &[&str] = &["cofinancingPercentage", "cofinancing_percentage", "porcentaje_cofinanciamiento", "cofinanciamiento"];
const KEYWORDS: &[&str] = &["keywords", "palabras_clave", "palabras clave"];

/// Normalizes one record. Only a missing or blank name is an error.
pub fn normalize(raw: &RawRecord) -> Result<FundingOpportunity, NormalizeError> {
    let name = field(raw, NAME).ok_or(NormalizeError::MissingName)?;
    let mut record = FundingOpportunity::named(name);

    let set = |target: &mut String, aliases: &[&str]| {
        if let Some(value) = field(raw, aliases) {
            *target = value;
        }
    };
    set(&mut record.source, SOURCE);
    set(&mut record.closing_date, CLOSING_DATE);
    set(&mut record.link, LINK);
    set(&mut record.amount, AMOUNT);
    set(&mut record.area_of_interest, AREA);
    set(&mut record.description, DESCRIPTION);
    set(&mut record.contact_email, CONTACT_EMAIL);
    set(&mut record.phone, PHONE);
    set(&mut record.requirements, REQUIREMENTS);
    set(&mut record.financing_type, FINANCING_TYPE);
    set(&mut record.complexity_level, COMPLEXITY);
    set(&mut record.estimated_duration, DURATION);
    set(&mut record.cofinancing_percentage, COFINANCING);
    set(&mut record.keywords, KEYWORDS);

    if let Some(label) = field(raw, STATUS) {
        record.status = Status::from_label(&label).unwrap_or_else(|| {
            debug!(name = %record.name, status = %label, "unrecognized status label, defaulting to Open");
            Status::Open
        });
    }

    Ok(record)
}

/// Normalizes a batch, counting (not failing on) rejected records.
pub fn normalize_batch<'a, I>(raws: I) -> NormalizedBatch
where
    I: IntoIterator<Item = &'a RawRecord>,
{
    let mut batch = NormalizedBatch::default();
    for raw in raws {
        match normalize(raw) {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                debug!(error = %err, "rejecting raw record");
                batch.rejected += 1;
            }
        }
    }
    batch
}

/// Fills in `source` when the record carries no usable source under any alias.
pub fn with_default_source(raw: &mut RawRecord, source: &str) {
    if field(raw, SOURCE).is_none() {
        raw.insert("source".to_string(), Value::String(source.to_string()));
    }
}

fn field(raw: &RawRecord, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        raw.iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(alias))
            .and_then(|(_, v)| value_text(v))
    })
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    };
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NOT_AVAILABLE;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn default_source_only_fills_gaps() {
        let mut blank = raw(json!({"name": "X", "fuente": "  "}));
        with_default_source(&mut blank, "INDAP");
        assert_eq!(normalize(&blank).unwrap().source, "INDAP");

        let mut present = raw(json!({"name": "X", "Fuente": "CORFO"}));
        with_default_source(&mut present, "INDAP");
        assert_eq!(normalize(&present).unwrap().source, "CORFO");
    }

    #[test]
    fn fills_defaults_for_missing_fields() {
        let record = normalize(&raw(json!({"name": "Fondo de Innovación"}))).unwrap();
        assert_eq!(record.name, "Fondo de Innovación");
        assert_eq!(record.source, NOT_AVAILABLE);
        assert_eq!(record.amount, NOT_AVAILABLE);
        assert_eq!(record.keywords, "");
        assert_eq!(record.status, Status::Open);
    }

    #[test]
    fn spanish_aliases_and_non_string_values() {
        let record = normalize(&raw(json!({
            "Nombre": "  Programa Riego ",
            "Fuente": "CNR",
            "Estado": "Cerrado",
            "Monto": 1500000,
            "palabras_clave": ["riego", "agua"],
            "telefono": null
        })))
        .unwrap();
        assert_eq!(record.name, "Programa Riego");
        assert_eq!(record.source, "CNR");
        assert_eq!(record.status, Status::Closed);
        assert_eq!(record.amount, "1500000");
        assert_eq!(record.keywords, "riego, agua");
        assert_eq!(record.phone, NOT_AVAILABLE);
    }

    #[test]
    fn missing_or_blank_name_is_rejected() {
        assert_eq!(normalize(&raw(json!({"source": "FIA"}))), Err(NormalizeError::MissingName));
        assert_eq!(normalize(&raw(json!({"name": "   "}))), Err(NormalizeError::MissingName));
    }

    #[test]
    fn batch_counts_rejections_without_stopping() {
        let raws = vec![
            raw(json!({"name": "A"})),
            raw(json!({"amount": "USD 10"})),
            raw(json!({"name": "B"})),
        ];
        let batch = normalize_batch(&raws);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.rejected, 1);
    }
}
