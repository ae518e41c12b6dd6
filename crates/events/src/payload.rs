//! Typed payloads.

use serde_json::{Map, Value as JsonValue};

use reportflow_core::{ExtractionId, ReportId};

use crate::envelope::Envelope;
use crate::error::ValidationError;

/// `NewExtraction`: start an extraction for a scheduled report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExtractionPayload {
    pub platform: String,
    pub report_id: ReportId,
}

/// Every other pipeline event addresses an existing extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePayload {
    pub extraction_id: ExtractionId,
    pub report_id: ReportId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    NewExtraction(NewExtractionPayload),
    Lifecycle(LifecyclePayload),
    /// Payload of an event nobody validated (fallback handler).
    Raw(Map<String, JsonValue>),
    Empty,
}

impl EventPayload {
    pub fn lifecycle(extraction_id: ExtractionId, report_id: ReportId) -> Self {
        Self::Lifecycle(LifecyclePayload {
            extraction_id,
            report_id,
        })
    }

    pub fn into_map(self) -> Option<Map<String, JsonValue>> {
        let mut map = Map::new();
        match self {
            Self::NewExtraction(p) => {
                map.insert("platform".into(), p.platform.into());
                map.insert("id_report".into(), p.report_id.to_string().into());
            }
            Self::Lifecycle(p) => {
                map.insert("extraction_id".into(), p.extraction_id.to_string().into());
                map.insert("report_id".into(), p.report_id.to_string().into());
            }
            Self::Raw(raw) => return Some(raw),
            Self::Empty => return None,
        }
        Some(map)
    }
}

fn string_field<'a>(
    envelope: &'a Envelope,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    let value = envelope
        .payload
        .as_ref()
        .and_then(|p| p.get(field))
        .ok_or_else(|| ValidationError::MissingField {
            event: envelope.name.clone(),
            field,
        })?;
    value.as_str().ok_or_else(|| ValidationError::FieldNotString {
        event: envelope.name.clone(),
        field,
    })
}

fn id_field<T>(envelope: &Envelope, field: &'static str) -> Result<T, ValidationError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    string_field(envelope, field)?
        .parse()
        .map_err(|e: T::Err| ValidationError::InvalidField {
            event: envelope.name.clone(),
            field,
            reason: e.to_string(),
        })
}

/// Validator for `NewExtraction`: `platform` and `id_report` strings.
pub fn validate_new_extraction(envelope: &Envelope) -> Result<EventPayload, ValidationError> {
    let platform = string_field(envelope, "platform")?;
    if platform.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            event: envelope.name.clone(),
            field: "platform",
            reason: "must not be blank".into(),
        });
    }
    Ok(EventPayload::NewExtraction(NewExtractionPayload {
        platform: platform.to_string(),
        report_id: id_field(envelope, "id_report")?,
    }))
}

/// Validator for lifecycle events: `extraction_id` and `report_id` strings.
pub fn validate_lifecycle(envelope: &Envelope) -> Result<EventPayload, ValidationError> {
    Ok(EventPayload::Lifecycle(LifecyclePayload {
        extraction_id: id_field(envelope, "extraction_id")?,
        report_id: id_field(envelope, "report_id")?,
    }))
}

/// Accepts any payload as-is.
pub fn accept_any(envelope: &Envelope) -> Result<EventPayload, ValidationError> {
    Ok(envelope
        .payload
        .clone()
        .map_or(EventPayload::Empty, EventPayload::Raw))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::name::EventName;

    fn envelope(name: &str, payload: JsonValue) -> Envelope {
        Envelope::from_value(json!({ "name": name, "payload": payload })).unwrap()
    }

    #[test]
    fn new_extraction_payload_is_typed() {
        let report_id = ReportId::new();
        let env = envelope(
            "NewExtraction",
            json!({ "platform": "acme.example.com", "id_report": report_id.to_string() }),
        );

        assert_eq!(
            validate_new_extraction(&env).unwrap(),
            EventPayload::NewExtraction(NewExtractionPayload {
                platform: "acme.example.com".into(),
                report_id,
            })
        );
    }

    #[test]
    fn lifecycle_payload_requires_string_ids() {
        let missing = envelope("CheckQueryStatus", json!({ "report_id": ReportId::new().to_string() }));
        assert_eq!(
            validate_lifecycle(&missing),
            Err(ValidationError::MissingField {
                event: "CheckQueryStatus".into(),
                field: "extraction_id"
            })
        );

        let numeric = envelope("CheckQueryStatus", json!({ "extraction_id": 7, "report_id": "x" }));
        assert!(matches!(
            validate_lifecycle(&numeric),
            Err(ValidationError::FieldNotString { field: "extraction_id", .. })
        ));

        let garbage = envelope(
            "CheckQueryStatus",
            json!({ "extraction_id": "nope", "report_id": "x" }),
        );
        assert!(matches!(
            validate_lifecycle(&garbage),
            Err(ValidationError::InvalidField { field: "extraction_id", .. })
        ));
    }

    #[test]
    fn lifecycle_payload_survives_outgoing_envelope() {
        let payload = EventPayload::lifecycle(ExtractionId::new(), ReportId::new());
        let env = Envelope::new(EventName::ExportCompleted, payload.clone());
        let parsed = Envelope::parse(&env.to_json().unwrap()).unwrap();
        assert_eq!(validate_lifecycle(&parsed).unwrap(), payload);
    }
}
