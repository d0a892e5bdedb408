use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Turn>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(rename = "_debug")]
    pub debug: ResponseDebug,
}

/// Diagnostic fields echoed next to the reply. Non-contractual: clients only
/// rely on `text`.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseDebug {
    pub response_time_ms: u64,
    pub client_id: String,
    pub timestamp: String,
}

/// The flat record produced by the extraction call.
///
/// Every field is optional; an absent field means the conversation never
/// mentioned it. The two derived booleans are computed by the validation
/// step, never taken from the model, hence `serde(skip)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedRecord {
    pub event_title: Option<String>,
    pub event_type: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub alt_dates: Vec<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub description: Option<String>,
    #[serde(deserialize_with = "stringish")]
    pub budget: Option<String>,
    #[serde(deserialize_with = "stringish")]
    pub expected_attendees: Option<String>,
    pub additional_requirements: Option<String>,
    pub catering: Option<String>,
    pub seating: Option<String>,
    pub organization_company: Option<String>,
    pub organizer_first_name: Option<String>,
    pub organizer_last_name: Option<String>,
    pub organizer_street: Option<String>,
    #[serde(deserialize_with = "stringish")]
    pub organizer_zip: Option<String>,
    pub organizer_city: Option<String>,
    #[serde(deserialize_with = "stringish")]
    pub organizer_phone: Option<String>,
    pub organizer_email: Option<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub missing: Vec<String>,
    #[serde(skip)]
    pub all_required_fields_present: bool,
    #[serde(skip)]
    pub email_present: bool,
}

impl ExtractedRecord {
    pub fn organizer_name(&self) -> String {
        let mut name = String::new();
        if let Some(first) = &self.organizer_first_name {
            name.push_str(first);
        }
        if let Some(last) = &self.organizer_last_name {
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(last);
        }
        name.trim().to_string()
    }
}

/// Models occasionally emit `altDates`/`missing` as a bare string or `null`
/// instead of an array; normalize all three shapes to a list.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => Vec::new(),
        Value::String(s) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![s]
            }
        }
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        other => vec![other.to_string()],
    })
}

/// Accept a string or a bare number for loosely-typed fields such as
/// attendee counts and zip codes.
fn stringish<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => None,
        Value::String(s) => {
            if s.trim().is_empty() {
                None
            } else {
                Some(s)
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_rejects_unknown_values() {
        let err = serde_json::from_str::<Turn>(r#"{"role":"bot","content":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn record_accepts_camel_case_keys() {
        let record: ExtractedRecord = serde_json::from_str(
            r#"{"eventTitle":"Messe 2030","organizerEmail":"a@b.com","missing":[]}"#,
        )
        .unwrap();
        assert_eq!(record.event_title.as_deref(), Some("Messe 2030"));
        assert_eq!(record.organizer_email.as_deref(), Some("a@b.com"));
        assert!(!record.all_required_fields_present);
    }

    #[test]
    fn alt_dates_bare_string_becomes_single_entry_list() {
        let record: ExtractedRecord =
            serde_json::from_str(r#"{"altDates":"Ende Januar 2029"}"#).unwrap();
        assert_eq!(record.alt_dates, vec!["Ende Januar 2029".to_string()]);
    }

    #[test]
    fn alt_dates_null_becomes_empty_list() {
        let record: ExtractedRecord = serde_json::from_str(r#"{"altDates":null}"#).unwrap();
        assert!(record.alt_dates.is_empty());
    }

    #[test]
    fn missing_single_string_is_coerced() {
        let record: ExtractedRecord = serde_json::from_str(r#"{"missing":"dateFrom"}"#).unwrap();
        assert_eq!(record.missing, vec!["dateFrom".to_string()]);
    }

    #[test]
    fn numeric_attendees_are_stringified() {
        let record: ExtractedRecord = serde_json::from_str(r#"{"expectedAttendees":350}"#).unwrap();
        assert_eq!(record.expected_attendees.as_deref(), Some("350"));
    }

    #[test]
    fn organizer_name_joins_present_parts() {
        let record: ExtractedRecord = serde_json::from_str(
            r#"{"organizerFirstName":"Anna","organizerLastName":"Schulte"}"#,
        )
        .unwrap();
        assert_eq!(record.organizer_name(), "Anna Schulte");

        let record: ExtractedRecord =
            serde_json::from_str(r#"{"organizerLastName":"Schulte"}"#).unwrap();
        assert_eq!(record.organizer_name(), "Schulte");
    }
}
