use std::sync::OnceLock;

use anfragepilot_contracts::{ExtractedRecord, Role, Turn};
use regex::Regex;
use sha2::{Digest, Sha256};

pub const SUMMARY_HEADING: &str = "ZUSAMMENFASSUNG DER VERANSTALTUNGSANFRAGE";

const ID_TURN_WINDOW: usize = 3;
const ID_CONTENT_PREFIX: usize = 100;

fn role_tag(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Stable identity of a conversation, derived from its opening turns only so
/// the id does not change as the dialogue grows. Every caller must use this
/// function; deriving the id twice from different views of the transcript is
/// how duplicate sends happen.
pub fn conversation_id(turns: &[Turn]) -> Option<String> {
    if turns.is_empty() {
        return None;
    }
    let window = &turns[..turns.len().min(ID_TURN_WINDOW)];
    let mut hasher = Sha256::new();
    for turn in window {
        hasher.update(role_tag(turn.role).as_bytes());
        hasher.update(b":");
        let prefix: String = turn.content.chars().take(ID_CONTENT_PREFIX).collect();
        hasher.update(prefix.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(window.len().to_string().as_bytes());
    let digest = hasher.finalize();
    Some(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
}

/// Narrow dispatch lock key over the booking essentials, so two conversations
/// that describe the same booking cannot both mail it out.
pub fn booking_key(event_title: &str, organizer_email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_title.as_bytes());
    hasher.update([0]);
    hasher.update(organizer_email.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Phrase lists driving confirmation detection. Data, not code: the lists
/// come from configuration and can be tuned without touching the ladder.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub summary_markers: Vec<String>,
    pub confirmation_phrases: Vec<String>,
    pub approval_words: Vec<String>,
    pub negation_words: Vec<String>,
    pub short_reply_max_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub summary_presented: bool,
    pub user_confirmed: bool,
}

impl DetectorConfig {
    pub fn contains_summary_marker(&self, text: &str) -> bool {
        self.summary_markers.iter().any(|m| text.contains(m.as_str()))
    }

    /// Runs the confirmation ladder over the transcript.
    ///
    /// `latest_reply` is the assistant reply just produced; it is only used
    /// for summary detection. Confirmation looks at the newest user turn and
    /// the assistant turn the user was replying to.
    pub fn detect(&self, turns: &[Turn], latest_reply: &str) -> Detection {
        let summary_presented = self.contains_summary_marker(latest_reply);

        let user_idx = turns.iter().rposition(|t| t.role == Role::User);
        let user_reply = match user_idx {
            Some(idx) => turns[idx].content.to_lowercase().trim().to_string(),
            None => {
                return Detection {
                    summary_presented,
                    user_confirmed: false,
                }
            }
        };
        let prior_assistant = user_idx
            .and_then(|idx| turns[..idx].iter().rfind(|t| t.role == Role::Assistant))
            .map(|t| t.content.to_lowercase())
            .unwrap_or_default();

        // Rule 1: an explicit send phrase anywhere in the reply.
        let explicit = self
            .confirmation_phrases
            .iter()
            .any(|p| user_reply.contains(&p.to_lowercase()));

        // Rule 2: affirmative plus a send verb stem.
        let yes_and_send = (user_reply.contains("ja") || user_reply == "j")
            && (user_reply.contains("schick") || user_reply.contains("send"));

        // Rule 3: a short bare approval, valid only right after the assistant
        // asked the confirmation question, and never across a negation.
        let assistant_asked = self
            .summary_markers
            .iter()
            .any(|m| prior_assistant.contains(&m.to_lowercase()));
        let contextual = assistant_asked
            && (self.approval_words.iter().any(|w| user_reply == w.to_lowercase())
                || (user_reply.chars().count() < self.short_reply_max_chars
                    && self
                        .approval_words
                        .iter()
                        .any(|w| user_reply.contains(&w.to_lowercase()))
                    && !self
                        .negation_words
                        .iter()
                        .any(|w| user_reply.contains(&w.to_lowercase()))));

        Detection {
            summary_presented,
            user_confirmed: explicit || yes_and_send || contextual,
        }
    }
}

/// First `{` through last `}`, or None when the text holds no object at all.
pub fn slice_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn date_fallback_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)Ende\s+\w+\s+\d{4}",
            r"(?i)Anfang\s+\w+\s+\d{4}",
            r"(?i)Mitte\s+\w+\s+\d{4}",
            r"(?i)\w+\s+\d{4}",
            r"(?i)im\s+\w+\s+\d{4}",
            r"(?i)zwischen\s+.+?\s+und\s+[^\s.]+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("hard-coded pattern"))
        .collect()
    })
}

/// When extraction produced no concrete start date, scan the user's own words
/// for a vague time frame ("Ende Januar 2029") and record it as an alternative
/// date instead of leaving the request dateless.
pub fn apply_date_fallback(record: &mut ExtractedRecord, user_text: &str) {
    if record.date_from.as_deref().is_some_and(|d| !d.trim().is_empty()) {
        return;
    }
    for pattern in date_fallback_patterns() {
        if let Some(m) = pattern.find(user_text) {
            record.alt_dates.push(m.as_str().to_string());
            record.date_from = None;
            record.date_to = None;
            return;
        }
    }
}

pub fn is_valid_email(email: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            .expect("hard-coded pattern")
    });
    re.is_match(email)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordGap {
    MissingEmail,
    MissingType,
}

const PLACEHOLDER: &str = "Nicht angegeben";
const REQUIRED_FIELDS: &[&str] = &["organizerEmail", "eventTitle", "eventType"];
const RECOMMENDED_FIELDS: &[&str] = &[
    "organizerFirstName",
    "organizerLastName",
    "dateFrom",
    "expectedAttendees",
];

fn clear_placeholder(field: &mut Option<String>) {
    if field
        .as_deref()
        .is_none_or(|v| v.trim().is_empty() || v.trim() == PLACEHOLDER)
    {
        *field = None;
    }
}

fn field_present(record: &ExtractedRecord, key: &str) -> bool {
    let value = match key {
        "organizerEmail" => &record.organizer_email,
        "eventTitle" => &record.event_title,
        "eventType" => &record.event_type,
        "organizerFirstName" => &record.organizer_first_name,
        "organizerLastName" => &record.organizer_last_name,
        "dateFrom" => &record.date_from,
        "expectedAttendees" => &record.expected_attendees,
        _ => return true,
    };
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Validates and normalizes an extracted record in place.
///
/// Placeholder values are treated as absent, a missing title is synthesized
/// from whatever the record does carry, and `missing` is recomputed as the
/// union of the model's own list and the fields we find absent. The two
/// derived booleans are set here and nowhere else.
pub fn finalize_record(record: &mut ExtractedRecord, venue_name: &str) -> Result<(), RecordGap> {
    clear_placeholder(&mut record.organizer_email);
    clear_placeholder(&mut record.event_title);
    clear_placeholder(&mut record.event_type);

    match record.organizer_email.as_deref() {
        Some(email) if is_valid_email(email) => record.email_present = true,
        _ => {
            record.email_present = false;
            record.all_required_fields_present = false;
            return Err(RecordGap::MissingEmail);
        }
    }

    ensure_event_title(record, venue_name);

    if record.event_type.is_none() {
        record.all_required_fields_present = false;
        return Err(RecordGap::MissingType);
    }

    for key in REQUIRED_FIELDS.iter().chain(RECOMMENDED_FIELDS.iter()).copied() {
        if !field_present(record, key) && !record.missing.iter().any(|m| m.as_str() == key) {
            record.missing.push(key.to_string());
        }
    }
    record.all_required_fields_present = true;
    Ok(())
}

/// Fallback title chain: event type, else organizer name, else date info.
pub fn ensure_event_title(record: &mut ExtractedRecord, venue_name: &str) {
    if record.event_title.is_some() {
        return;
    }
    record.event_title = Some(if let Some(event_type) = &record.event_type {
        format!("{event_type} in der {venue_name}")
    } else {
        let name = record.organizer_name();
        if !name.is_empty() {
            format!("Veranstaltung von {name} in der {venue_name}")
        } else {
            let date_info = record
                .date_from
                .clone()
                .or_else(|| record.alt_dates.first().cloned())
                .unwrap_or_else(|| "unbekanntem Termin".to_string());
            format!("Veranstaltung in der {venue_name} am {date_info}")
        }
    });
}

/// Long conversations go out even without a type; fill stand-in values so the
/// venue still receives the lead.
pub fn apply_long_conversation_placeholders(record: &mut ExtractedRecord) {
    if record.event_title.is_none() {
        record.event_title = Some("Anfrage über Digitalen Assistenten".to_string());
    }
    if record.event_type.is_none() {
        record.event_type = Some("Veranstaltung".to_string());
    }
}

const SUMMARY_BOUNDARIES: &[&str] = &["\n\nVielen Dank", "\n\nIch habe", "\n\nWir freuen"];

fn cut_at_boundaries(text: &str) -> &str {
    let mut end = text.len();
    for boundary in SUMMARY_BOUNDARIES {
        if let Some(idx) = text.find(boundary) {
            end = end.min(idx);
        }
    }
    &text[..end]
}

/// Builds the summary block that goes into both outgoing mails.
///
/// Prefers the assistant's own phrasing: the block under the summary heading,
/// else a looser "Zusammenfassung..." section, else a deterministic rendering
/// of the extracted record. Markdown emphasis is stripped either way.
pub fn inquiry_summary(summary_text: Option<&str>, record: &ExtractedRecord) -> String {
    let raw = match summary_text {
        Some(text) => {
            if let Some(idx) = text.find(SUMMARY_HEADING) {
                let tail = &text[idx + SUMMARY_HEADING.len()..];
                let tail = match tail.find("\n\nVielen Dank") {
                    Some(end) => &tail[..end],
                    None => tail,
                };
                format!("{SUMMARY_HEADING}{tail}")
            } else {
                static RE: OnceLock<Regex> = OnceLock::new();
                let re = RE.get_or_init(|| {
                    Regex::new(r"(?is)Zusammenfassung[^:]*:?\s*(.+)")
                        .expect("hard-coded pattern")
                });
                match re.captures(text).and_then(|c| c.get(1)) {
                    Some(m) => cut_at_boundaries(m.as_str()).trim().to_string(),
                    None => format_extracted(record),
                }
            }
        }
        None => format_extracted(record),
    };
    strip_emphasis(&raw)
}

pub fn strip_emphasis(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\*\*(.*?)\*\*").expect("hard-coded pattern"));
    re.replace_all(text, "$1").into_owned()
}

/// Deterministic fallback rendering of the record, field order matching the
/// assistant's own summary layout.
pub fn format_extracted(record: &ExtractedRecord) -> String {
    fn push(out: &mut String, label: &str, value: &Option<String>) {
        if let Some(v) = value {
            if !v.trim().is_empty() && v.trim() != PLACEHOLDER {
                out.push_str(&format!("{label}: {v}\n"));
            }
        }
    }

    let mut out = format!("{SUMMARY_HEADING}\n\n");
    push(&mut out, "Veranstaltungstitel", &record.event_title);
    push(&mut out, "Art der Veranstaltung", &record.event_type);
    push(&mut out, "Datum", &record.date_from);
    push(&mut out, "Bis", &record.date_to);
    if !record.alt_dates.is_empty() {
        out.push_str(&format!("Alternative Termine: {}\n", record.alt_dates.join(", ")));
    }
    push(&mut out, "Uhrzeit von", &record.start_time);
    push(&mut out, "Uhrzeit bis", &record.end_time);
    push(&mut out, "Teilnehmerzahl", &record.expected_attendees);
    push(&mut out, "Bestuhlung", &record.seating);
    push(&mut out, "Budget", &record.budget);
    push(&mut out, "Catering", &record.catering);
    push(&mut out, "Zusätzliche Anforderungen", &record.additional_requirements);
    push(&mut out, "Beschreibung", &record.description);
    push(&mut out, "Organisation/Firma", &record.organization_company);
    push(&mut out, "Vorname", &record.organizer_first_name);
    push(&mut out, "Nachname", &record.organizer_last_name);
    push(&mut out, "Straße", &record.organizer_street);
    push(&mut out, "PLZ", &record.organizer_zip);
    push(&mut out, "Ort", &record.organizer_city);
    push(&mut out, "Telefon", &record.organizer_phone);
    push(&mut out, "E-Mail", &record.organizer_email);

    let missing_recommended: Vec<&str> = record
        .missing
        .iter()
        .filter(|m| RECOMMENDED_FIELDS.contains(&m.as_str()))
        .map(|m| match m.as_str() {
            "organizerFirstName" => "Vorname des Ansprechpartners",
            "organizerLastName" => "Nachname des Ansprechpartners",
            "dateFrom" => "Genaues Datum der Veranstaltung",
            "expectedAttendees" => "Anzahl der erwarteten Teilnehmer",
            other => other,
        })
        .collect();
    if !missing_recommended.is_empty() {
        out.push_str("\n--- Hinweis zur Anfrage ---\n");
        out.push_str("Folgende empfohlene Informationen fehlen noch:\n");
        for label in missing_recommended {
            out.push_str(&format!("- {label}\n"));
        }
    }
    out
}

pub fn escape_html(unsafe_text: &str) -> String {
    unsafe_text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
        .replace('\n', "<br>")
}

/// Renders the full transcript for the venue's copy of the mail.
pub fn format_transcript_html(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::User => "Nutzer",
                _ => "Assistent",
            };
            format!(
                "<div style=\"margin-bottom:10px;\"><strong>{role}:</strong> {}</div>",
                escape_html(&turn.content)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strips HTML tags and angle brackets so the value is safe in a mail header.
pub fn sanitize_name(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("hard-coded pattern"));
    re.replace_all(input, "")
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '\r' | '\n'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// `anna.schulte@example.org` becomes `an***@ex***`. Addresses too short to
/// mask meaningfully collapse to `***`.
pub fn mask_email(address: &str) -> String {
    let Some((local, domain)) = address.split_once('@') else {
        return "***".to_string();
    };
    if local.chars().count() < 2 || domain.chars().count() < 2 {
        return "***".to_string();
    }
    let l: String = local.chars().take(2).collect();
    let d: String = domain.chars().take(2).collect();
    format!("{l}***@{d}***")
}

/// Heuristic for "the user has shared contact details".
pub fn contact_info_hint(text: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)@|telefon|tel\.?|handy|vorname|nachname").expect("hard-coded pattern")
    });
    re.is_match(text)
}
