use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::ValidationError;
use crate::name::EventName;
use crate::payload::EventPayload;

/// Queue message body: `{ name, payload?, domain? }`.
///
/// `name` stays a plain string so that envelopes carrying event names this
/// build does not know about still parse and reach the fallback handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, JsonValue>>,
    /// Tenant routing key, also sent as a transport attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Envelope {
    pub fn new(name: EventName, payload: EventPayload) -> Self {
        Self {
            name: name.as_str().to_string(),
            payload: payload.into_map(),
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Parse and shape-check a raw message body.
    pub fn parse(body: &str) -> Result<Self, ValidationError> {
        let value: JsonValue =
            serde_json::from_str(body).map_err(|e| ValidationError::NotJson(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: JsonValue) -> Result<Self, ValidationError> {
        let JsonValue::Object(mut fields) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let name = match fields.remove("name") {
            Some(JsonValue::String(name)) => name,
            Some(_) => return Err(ValidationError::NameNotString),
            None => return Err(ValidationError::MissingName),
        };
        let payload = match fields.remove("payload") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::Object(map)) => Some(map),
            Some(_) => return Err(ValidationError::PayloadNotObject),
        };
        let domain = match fields.remove("domain") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(domain)) => Some(domain),
            Some(_) => return Err(ValidationError::DomainNotString),
        };

        Ok(Self {
            name,
            payload,
            domain,
        })
    }

    /// Recognized event name, if any.
    pub fn event_name(&self) -> Option<EventName> {
        self.name.parse().ok()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_full_envelope() {
        let env = Envelope::parse(
            r#"{"name":"Initialized","payload":{"extraction_id":"a","report_id":"b"},"domain":"acme"}"#,
        )
        .unwrap();

        assert_eq!(env.event_name(), Some(EventName::Initialized));
        assert_eq!(env.domain.as_deref(), Some("acme"));
        assert_eq!(env.payload.unwrap()["report_id"], json!("b"));
    }

    #[test]
    fn payload_and_domain_are_optional() {
        let env = Envelope::parse(r#"{"name":"SomethingNew"}"#).unwrap();
        assert_eq!(env.event_name(), None);
        assert!(env.payload.is_none());
        assert!(env.domain.is_none());
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert!(matches!(Envelope::parse("{not json"), Err(ValidationError::NotJson(_))));
        assert_eq!(Envelope::parse("[1]"), Err(ValidationError::NotAnObject));
        assert_eq!(Envelope::parse(r#"{"payload":{}}"#), Err(ValidationError::MissingName));
        assert_eq!(Envelope::parse(r#"{"name":42}"#), Err(ValidationError::NameNotString));
        assert_eq!(
            Envelope::parse(r#"{"name":"Initialized","payload":"x"}"#),
            Err(ValidationError::PayloadNotObject)
        );
        assert_eq!(
            Envelope::parse(r#"{"name":"Initialized","domain":7}"#),
            Err(ValidationError::DomainNotString)
        );
    }

    #[test]
    fn serialized_envelope_parses_back() {
        let env = Envelope::new(EventName::QueryCompleted, EventPayload::Empty).with_domain("acme");
        let body = env.to_json().unwrap();
        assert_eq!(body, r#"{"name":"QueryCompleted","domain":"acme"}"#);
        assert_eq!(Envelope::parse(&body).unwrap(), env);
    }
}
