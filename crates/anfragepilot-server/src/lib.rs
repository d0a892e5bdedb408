use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anfragepilot_config::Config;
use anfragepilot_contracts::{
    ChatRequest, ChatResponse, ErrorResponse, ExtractedRecord, ResponseDebug, Role, Turn,
};
use anfragepilot_kernel::{
    apply_date_fallback, apply_long_conversation_placeholders, booking_key, contact_info_hint,
    conversation_id, finalize_record, format_transcript_html, inquiry_summary, mask_email,
    sanitize_name, slice_json_object, DetectorConfig, RecordGap,
};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg)?;

    let memory = state.memory.clone();
    let interval = Duration::from_secs(state.cfg.memory.cleanup_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = memory.evict_sent();
            if evicted > 0 {
                info!(evicted, "sent-marker cleanup");
            }
        }
    });

    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/chat", post(chat))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    memory: Arc<ConversationMemory>,
    usage: Arc<TokenUsageTracker>,
    detector: Arc<DetectorConfig>,
    llm: Arc<LlmClient>,
    mail: Arc<MailClient>,
    chat_system_prompt: Arc<String>,
    extract_system_prompt: Arc<String>,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        let detector = DetectorConfig {
            summary_markers: cfg.detector.summary_markers.clone(),
            confirmation_phrases: cfg.detector.confirmation_phrases.clone(),
            approval_words: cfg.detector.approval_words.clone(),
            negation_words: cfg.detector.negation_words.clone(),
            short_reply_max_chars: cfg.detector.short_reply_max_chars,
        };
        Ok(Self {
            memory: Arc::new(ConversationMemory::new(
                cfg.memory.sent_ceiling,
                cfg.memory.evict_keep,
            )),
            usage: Arc::new(TokenUsageTracker::new(cfg.limits.max_daily_tokens)),
            detector: Arc::new(detector),
            llm: Arc::new(LlmClient::new(&cfg)?),
            mail: Arc::new(MailClient::new(&cfg)?),
            chat_system_prompt: Arc::new(chat_system_prompt(&cfg.venue.name)),
            extract_system_prompt: Arc::new(extract_system_prompt(&cfg.venue.name)),
            cfg: Arc::new(cfg),
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorResponse>)> {
    let started = Instant::now();
    let client_id = resolve_client_id(&headers, &request);

    validate_chat_request(&state.cfg, &request.messages).map_err(|message| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("validation_error", message)),
        )
    })?;

    if !state.usage.admit(&client_id) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::new(
                "token_limit",
                "Token-Limit überschritten. Bitte versuchen Sie es morgen wieder.",
            )),
        ));
    }

    // The identity is derived once, from the request as the client sent it,
    // and handed to every later stage. Re-deriving it from a grown transcript
    // would split one conversation into two and defeat the dedup markers.
    let conv_id = conversation_id(&request.messages);

    let mut messages = request.messages;
    if let Some(id) = &conv_id {
        if let Some(pending_error) = state.memory.take_error(id) {
            warn!(id = %id_prefix(id), "replaying pending mail failure into conversation");
            messages.push(Turn::new(
                Role::System,
                format!(
                    "Es gab ein Problem beim E-Mail-Versand: {pending_error}. \
                     Bitte informiere den Benutzer diskret."
                ),
            ));
        }
    }

    debug!(count = messages.len(), client = %id_prefix(&client_id), "chat request");

    let reply = state
        .llm
        .chat(&state.chat_system_prompt, &messages)
        .await
        .map_err(|e| {
            error!(error = %e, "chat completion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(
                    "upstream_error",
                    "Ein Fehler ist aufgetreten. Bitte versuchen Sie es später erneut.",
                )),
            )
        })?;

    let total = state.usage.record(&client_id, reply.tokens_used);
    debug!(client = %id_prefix(&client_id), total_tokens = total, "token usage");

    let text = reply.text.trim().to_string();
    let response = ChatResponse {
        text: text.clone(),
        debug: ResponseDebug {
            response_time_ms: started.elapsed().as_millis() as u64,
            client_id: id_prefix(&client_id).to_string(),
            timestamp: Utc::now().to_rfc3339(),
        },
    };

    if let Some(id) = conv_id {
        let mut internal = messages;
        internal.push(Turn::new(Role::Assistant, text.clone()));
        let continuation_state = state.clone();
        tokio::spawn(async move {
            run_continuation(continuation_state, id, internal, text).await;
        });
    }

    Ok(Json(response))
}

fn resolve_client_id(headers: &HeaderMap, request: &ChatRequest) -> String {
    if let Some(id) = headers.get("x-client-id").and_then(|v| v.to_str().ok()) {
        if !id.trim().is_empty() {
            return id.trim().to_string();
        }
    }
    if let Some(id) = &request.user_id {
        if !id.trim().is_empty() {
            return id.trim().to_string();
        }
    }
    "unknown".to_string()
}

fn id_prefix(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn validate_chat_request(cfg: &Config, messages: &[Turn]) -> Result<(), String> {
    if messages.is_empty() {
        return Err("messages darf nicht leer sein".to_string());
    }
    if messages.len() > cfg.limits.max_messages {
        return Err("Zu viele Nachrichten".to_string());
    }
    for msg in messages {
        if msg.content.chars().count() > cfg.limits.max_message_length {
            return Err("Nachricht zu lang".to_string());
        }
        let lower = msg.content.to_lowercase();
        if cfg
            .limits
            .injection_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
        {
            warn!("possible prompt injection rejected");
            return Err("Unerlaubte Eingabe erkannt".to_string());
        }
    }
    Ok(())
}

/// Post-response work: detect a presented summary, detect a confirmation, and
/// when both line up, run the extraction job. Runs detached; the client
/// already has its reply.
async fn run_continuation(state: AppState, conv_id: String, internal: Vec<Turn>, reply: String) {
    let detection = state.detector.detect(&internal, &reply);
    debug!(
        id = %id_prefix(&conv_id),
        summary = detection.summary_presented,
        confirmed = detection.user_confirmed,
        "detection"
    );

    if detection.summary_presented {
        state.memory.put_summary(&conv_id, &reply);
        info!(id = %id_prefix(&conv_id), "summary cached");
    }

    if !detection.user_confirmed {
        return;
    }
    if state.memory.is_sent(&conv_id) {
        info!(id = %id_prefix(&conv_id), "mail already sent, skipping");
        return;
    }

    // No summary was ever presented: nothing trustworthy to mail out. The
    // deterministic formatter only backs up a real summary, it never replaces one.
    let Some(summary) = state
        .memory
        .get_summary(&conv_id)
        .or_else(|| fallback_summary(&state.detector, &internal, &reply, detection.summary_presented))
    else {
        warn!(id = %id_prefix(&conv_id), "confirmation without any summary text, skipping");
        return;
    };

    let has_contact_info = internal
        .iter()
        .rev()
        .find(|t| t.role == Role::User)
        .is_some_and(|t| contact_info_hint(&t.content));

    let outcome = run_extraction_job(&state, &conv_id, &internal, summary, has_contact_info).await;
    match &outcome {
        JobOutcome::Sent => info!(id = %id_prefix(&conv_id), "inquiry mailed"),
        JobOutcome::DeliveryFailed(detail) => {
            state.memory.put_error(&conv_id, detail);
            error!(id = %id_prefix(&conv_id), detail = %detail, "mail delivery failed");
        }
        other => info!(id = %id_prefix(&conv_id), reason = other.reason_code(), "extraction skipped"),
    }
}

/// The emergency path from the original flow: confirmation arrived but no
/// summary was cached, so reuse the summary the user just saw.
fn fallback_summary(
    detector: &DetectorConfig,
    internal: &[Turn],
    reply: &str,
    reply_is_summary: bool,
) -> Option<String> {
    if reply_is_summary {
        return Some(reply.to_string());
    }
    let last_user = internal.iter().rposition(|t| t.role == Role::User)?;
    internal[..last_user]
        .iter()
        .rfind(|t| t.role == Role::Assistant)
        .filter(|t| detector.contains_summary_marker(&t.content))
        .map(|t| t.content.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobOutcome {
    Sent,
    AlreadySent,
    AlreadyProcessing,
    LlmFailed,
    InvalidJson,
    JsonProcessingError,
    MissingEmail,
    MissingType,
    BookingLocked,
    DeliveryFailed(String),
}

impl JobOutcome {
    fn reason_code(&self) -> &'static str {
        match self {
            JobOutcome::Sent => "sent",
            JobOutcome::AlreadySent => "already_sent",
            JobOutcome::AlreadyProcessing => "already_processing",
            JobOutcome::LlmFailed => "extraction_failed",
            JobOutcome::InvalidJson => "invalid_json",
            JobOutcome::JsonProcessingError => "json_processing_error",
            JobOutcome::MissingEmail => "missing_email",
            JobOutcome::MissingType => "missing_type",
            JobOutcome::BookingLocked => "booking_locked",
            JobOutcome::DeliveryFailed(_) => "delivery_failed",
        }
    }
}

async fn run_extraction_job(
    state: &AppState,
    conv_id: &str,
    internal: &[Turn],
    summary: String,
    has_contact_info: bool,
) -> JobOutcome {
    if state.memory.is_sent(conv_id) {
        return JobOutcome::AlreadySent;
    }
    let Some(_guard) = state.memory.begin_extraction(conv_id) else {
        return JobOutcome::AlreadyProcessing;
    };
    debug!(id = %id_prefix(conv_id), has_contact_info, "extraction job started");

    let transcript = internal
        .iter()
        .map(|t| {
            let tag = match t.role {
                Role::User => "Human: ",
                _ => "Assistant: ",
            };
            format!("{tag}{}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let extract_text = match state
        .llm
        .extract(&state.extract_system_prompt, &transcript)
        .await
    {
        Ok(reply) => reply.text.trim().to_string(),
        Err(e) => {
            warn!(id = %id_prefix(conv_id), error = %e, "extraction call failed");
            return JobOutcome::LlmFailed;
        }
    };

    let Some(json_text) = slice_json_object(&extract_text) else {
        warn!(id = %id_prefix(conv_id), "no JSON object in extraction output");
        return JobOutcome::InvalidJson;
    };
    let mut record: ExtractedRecord = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            warn!(id = %id_prefix(conv_id), error = %e, "extraction output did not parse");
            return JobOutcome::JsonProcessingError;
        }
    };

    let user_text = internal
        .iter()
        .filter(|t| t.role == Role::User)
        .map(|t| t.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    apply_date_fallback(&mut record, &user_text);

    match finalize_record(&mut record, &state.cfg.venue.name) {
        Ok(()) => {}
        Err(RecordGap::MissingEmail) => {
            warn!(id = %id_prefix(conv_id), "no valid organizer email extracted");
            return JobOutcome::MissingEmail;
        }
        Err(RecordGap::MissingType) => {
            if internal.len() > state.cfg.pipeline.long_conversation_threshold {
                info!(id = %id_prefix(conv_id), "long conversation, sending with placeholders");
                apply_long_conversation_placeholders(&mut record);
                if finalize_record(&mut record, &state.cfg.venue.name).is_err() {
                    return JobOutcome::MissingType;
                }
            } else {
                return JobOutcome::MissingType;
            }
        }
    }

    // Both required fields are present past this point.
    let (title, email) = match (&record.event_title, &record.organizer_email) {
        (Some(t), Some(e)) => (t.clone(), e.clone()),
        _ => return JobOutcome::JsonProcessingError,
    };
    let key = booking_key(&title, &email);
    if !state.memory.lock_booking(&key) {
        info!(id = %id_prefix(conv_id), "booking already being dispatched");
        return JobOutcome::BookingLocked;
    }

    // Marked before dispatch so a racing duplicate can never send a second
    // pair. Kept on failure: recovery is a fresh conversation, not a retry.
    state.memory.mark_sent(conv_id);

    info!(
        id = %id_prefix(conv_id),
        title = %title,
        email = %mask_email(&email),
        "dispatching inquiry"
    );

    match dispatch_emails(state, &record, &summary, internal).await {
        Ok(()) => {
            state.memory.release_booking(&key);
            JobOutcome::Sent
        }
        Err(detail) => JobOutcome::DeliveryFailed(detail),
    }
}

/// Sends the venue copy first, then the customer confirmation. Either failure
/// is reported; a half-delivered booking still counts as failed.
async fn dispatch_emails(
    state: &AppState,
    record: &ExtractedRecord,
    summary_text: &str,
    internal: &[Turn],
) -> Result<(), String> {
    state
        .mail
        .verify()
        .await
        .map_err(|e| format!("Mail-Gateway nicht erreichbar: {e}"))?;

    let venue = &state.cfg.venue.name;
    let summary = inquiry_summary(Some(summary_text), record);
    let name = {
        let raw = record.organizer_name();
        let sanitized = sanitize_name(&raw);
        if sanitized.is_empty() {
            "Veranstalter".to_string()
        } else {
            sanitized
        }
    };

    let transcript_html = format_transcript_html(internal);
    let summary_html = anfragepilot_kernel::escape_html(&summary);
    let venue_mail = OutgoingMail {
        from: state.cfg.mail.from.clone(),
        to: state.cfg.mail.venue_recipient.clone(),
        subject: format!("Neue Veranstaltungsanfrage von {name}"),
        text: format!("{summary}\n\n--- Chat-Verlauf in HTML-Version verfügbar ---"),
        html: format!(
            "<div><h1>Neue Veranstaltungsanfrage</h1>\
             <p>Digitaler Anfragepilot der {venue}</p>\
             <h2>Zusammenfassung der Anfrage</h2>\
             <div style=\"white-space:pre-wrap;\">{summary_html}</div>\
             <h3>Chat-Verlauf:</h3>\
             <div>{transcript_html}</div></div>"
        ),
    };
    let message_id = state
        .mail
        .send(&venue_mail)
        .await
        .map_err(|e| format!("E-Mail an {venue} fehlgeschlagen: {e}"))?;
    info!(message_id = %message_id, "venue mail sent");

    let email = record.organizer_email.clone().unwrap_or_default();
    let signature = if state.cfg.venue.signature_lines.is_empty() {
        venue.clone()
    } else {
        state.cfg.venue.signature_lines.join("\n")
    };
    let customer_mail = OutgoingMail {
        from: state.cfg.mail.from.clone(),
        to: email.clone(),
        subject: format!("Ihre Veranstaltungsanfrage an die {venue} wurde erfolgreich übermittelt"),
        text: format!(
            "Sehr geehrte(r) {name},\n\n\
             vielen Dank für Ihre Anfrage an die {venue}. Wir haben Ihre Anfrage erhalten \
             und werden uns in Kürze bei Ihnen melden.\n\n\
             Nachfolgend finden Sie eine Zusammenfassung Ihrer Anfrage:\n\n{summary}\n\n\
             Mit freundlichen Grüßen,\nIhr Team der {venue}\n\n{signature}"
        ),
        html: format!(
            "<div><h1>Digitaler Anfragepilot der {venue}</h1>\
             <p>Sehr geehrte(r) {name},</p>\
             <p>vielen Dank für Ihre Anfrage an die {venue}. Wir haben Ihre Anfrage erhalten \
             und werden uns in Kürze bei Ihnen melden.</p>\
             <div style=\"white-space:pre-wrap;\">{summary_html}</div>\
             <p>Mit freundlichen Grüßen,<br>Ihr Team der {venue}</p></div>"
        ),
    };
    let message_id = state
        .mail
        .send(&customer_mail)
        .await
        .map_err(|e| format!("E-Mail an Kunden fehlgeschlagen: {e}"))?;
    info!(message_id = %message_id, recipient = %mask_email(&email), "customer mail sent");
    Ok(())
}

/// Process-lifetime conversation state. Every operation is a synchronous
/// check-then-act under one lock; nothing here awaits.
pub struct ConversationMemory {
    inner: Mutex<MemoryInner>,
    sent_ceiling: usize,
    evict_keep: usize,
}

#[derive(Default)]
struct MemoryInner {
    summaries: HashMap<String, String>,
    summary_order: VecDeque<String>,
    error_notes: HashMap<String, String>,
    error_order: VecDeque<String>,
    sent: HashSet<String>,
    sent_order: VecDeque<String>,
    active: HashSet<String>,
    bookings: HashSet<String>,
}

impl ConversationMemory {
    pub fn new(sent_ceiling: usize, evict_keep: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            sent_ceiling,
            evict_keep,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_summary(&self, conv_id: &str, summary: &str) {
        let mut inner = self.lock();
        if inner
            .summaries
            .insert(conv_id.to_string(), summary.to_string())
            .is_none()
        {
            inner.summary_order.push_back(conv_id.to_string());
        }
        let MemoryInner {
            summaries,
            summary_order,
            ..
        } = &mut *inner;
        Self::evict_map(summaries, summary_order, self.sent_ceiling, self.evict_keep);
    }

    pub fn get_summary(&self, conv_id: &str) -> Option<String> {
        self.lock().summaries.get(conv_id).cloned()
    }

    pub fn put_error(&self, conv_id: &str, detail: &str) {
        let mut inner = self.lock();
        if inner
            .error_notes
            .insert(conv_id.to_string(), detail.to_string())
            .is_none()
        {
            inner.error_order.push_back(conv_id.to_string());
        }
        let MemoryInner {
            error_notes,
            error_order,
            ..
        } = &mut *inner;
        Self::evict_map(error_notes, error_order, self.sent_ceiling, self.evict_keep);
    }

    /// Destructive read: the note is surfaced to the user exactly once.
    pub fn take_error(&self, conv_id: &str) -> Option<String> {
        self.lock().error_notes.remove(conv_id)
    }

    pub fn is_sent(&self, conv_id: &str) -> bool {
        self.lock().sent.contains(conv_id)
    }

    pub fn mark_sent(&self, conv_id: &str) {
        let mut inner = self.lock();
        if inner.sent.insert(conv_id.to_string()) {
            inner.sent_order.push_back(conv_id.to_string());
        }
        Self::evict_locked(&mut inner, self.sent_ceiling, self.evict_keep);
    }

    /// Drops the oldest entries of every bounded structure down to
    /// `evict_keep` once the ceiling is passed. Returns how many were evicted.
    pub fn evict_sent(&self) -> usize {
        let mut inner = self.lock();
        let mut evicted = Self::evict_locked(&mut inner, self.sent_ceiling, self.evict_keep);
        let MemoryInner {
            summaries,
            summary_order,
            error_notes,
            error_order,
            ..
        } = &mut *inner;
        evicted += Self::evict_map(summaries, summary_order, self.sent_ceiling, self.evict_keep);
        evicted += Self::evict_map(error_notes, error_order, self.sent_ceiling, self.evict_keep);
        evicted
    }

    /// Same ceiling/keep policy as the sent set, applied to a keyed map with
    /// its own insertion order. Order entries whose key was removed through
    /// another path are skipped.
    fn evict_map(
        map: &mut HashMap<String, String>,
        order: &mut VecDeque<String>,
        ceiling: usize,
        keep: usize,
    ) -> usize {
        if map.len() <= ceiling {
            return 0;
        }
        let mut evicted = 0;
        while map.len() > keep {
            match order.pop_front() {
                Some(oldest) => {
                    if map.remove(&oldest).is_some() {
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        evicted
    }

    fn evict_locked(inner: &mut MemoryInner, ceiling: usize, keep: usize) -> usize {
        if inner.sent.len() <= ceiling {
            return 0;
        }
        let mut evicted = 0;
        while inner.sent.len() > keep {
            match inner.sent_order.pop_front() {
                Some(oldest) => {
                    inner.sent.remove(&oldest);
                    inner.summaries.remove(&oldest);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// Claims the conversation for extraction. `None` means another job holds
    /// it. The returned guard releases the claim on drop, panics included.
    pub fn begin_extraction(self: &Arc<Self>, conv_id: &str) -> Option<ExtractionGuard> {
        let mut inner = self.lock();
        if !inner.active.insert(conv_id.to_string()) {
            return None;
        }
        Some(ExtractionGuard {
            memory: Arc::clone(self),
            conv_id: conv_id.to_string(),
        })
    }

    pub fn is_extracting(&self, conv_id: &str) -> bool {
        self.lock().active.contains(conv_id)
    }

    pub fn lock_booking(&self, key: &str) -> bool {
        self.lock().bookings.insert(key.to_string())
    }

    pub fn release_booking(&self, key: &str) {
        self.lock().bookings.remove(key);
    }

    fn end_extraction(&self, conv_id: &str) {
        self.lock().active.remove(conv_id);
    }
}

pub struct ExtractionGuard {
    memory: Arc<ConversationMemory>,
    conv_id: String,
}

impl Drop for ExtractionGuard {
    fn drop(&mut self) {
        self.memory.end_extraction(&self.conv_id);
    }
}

/// Per-client daily token accounting, keyed by whatever identity the request
/// carried. Windows reset 24h after the first counted request.
struct TokenUsageTracker {
    max_daily_tokens: u64,
    clients: Mutex<HashMap<String, ClientUsage>>,
}

struct ClientUsage {
    total_tokens: u64,
    request_count: u64,
    window_start: Instant,
}

const USAGE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

impl TokenUsageTracker {
    fn new(max_daily_tokens: u64) -> Self {
        Self {
            max_daily_tokens,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClientUsage>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission check plus request counting; false means over budget.
    fn admit(&self, client_id: &str) -> bool {
        let mut clients = self.lock();
        let usage = clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientUsage {
                total_tokens: 0,
                request_count: 0,
                window_start: Instant::now(),
            });
        if usage.window_start.elapsed() > USAGE_WINDOW {
            usage.total_tokens = 0;
            usage.request_count = 0;
            usage.window_start = Instant::now();
        }
        if usage.total_tokens > self.max_daily_tokens {
            return false;
        }
        usage.request_count += 1;
        true
    }

    fn record(&self, client_id: &str, tokens: u64) -> u64 {
        let mut clients = self.lock();
        let usage = clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientUsage {
                total_tokens: 0,
                request_count: 0,
                window_start: Instant::now(),
            });
        usage.total_tokens += tokens;
        usage.total_tokens
    }
}

#[derive(Debug, Error)]
enum LlmError {
    #[error("timeout")]
    Timeout,
    #[error("http status {0}")]
    Http(u16),
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed body: {0}")]
    Body(String),
}

struct LlmReply {
    text: String,
    tokens_used: u64,
}

struct LlmClient {
    endpoint: String,
    api_key: String,
    chat_model: String,
    extract_model: String,
    max_tokens: u32,
    extract_max_tokens: u32,
    client: Client,
}

impl LlmClient {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.llm.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: cfg.llm.endpoint.clone(),
            api_key: std::env::var(&cfg.llm.api_key_env).unwrap_or_default(),
            chat_model: cfg.llm.chat_model.clone(),
            extract_model: cfg.llm.extract_model.clone(),
            max_tokens: cfg.llm.max_tokens,
            extract_max_tokens: cfg.llm.extract_max_tokens,
            client,
        })
    }

    async fn chat(&self, system: &str, messages: &[Turn]) -> Result<LlmReply, LlmError> {
        let body = json!({
            "model": self.chat_model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
        });
        self.request(body).await
    }

    async fn extract(&self, system: &str, transcript: &str) -> Result<LlmReply, LlmError> {
        let body = json!({
            "model": self.extract_model,
            "max_tokens": self.extract_max_tokens,
            "temperature": 0,
            "system": system,
            "messages": [{"role": "user", "content": transcript}],
        });
        self.request(body).await
    }

    async fn request(&self, body: Value) -> Result<LlmReply, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(LlmError::Http(response.status().as_u16()));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Body(e.to_string()))?;
        let text = unwrap_reply(&value);
        if text.is_empty() {
            return Err(LlmError::Body("empty completion".to_string()));
        }
        let tokens_used = value
            .get("usage")
            .map(|u| {
                u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0)
                    + u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0)
            })
            .unwrap_or(0);
        Ok(LlmReply { text, tokens_used })
    }
}

/// Providers differ in where the reply text lives; accept every shape we have
/// seen rather than failing the conversation over an envelope change.
fn unwrap_reply(value: &Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    if let Some(s) = value.get("completion").and_then(Value::as_str) {
        return s.to_string();
    }
    match value.get("content") {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

#[derive(Debug, Error)]
enum MailError {
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("send failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
}

#[derive(Debug, Serialize)]
struct OutgoingMail {
    from: String,
    to: String,
    subject: String,
    text: String,
    html: String,
}

struct MailClient {
    endpoint: String,
    verify_endpoint: String,
    verify_timeout: Duration,
    retry_max_attempts: usize,
    retry_delay: Duration,
    client: Client,
}

impl MailClient {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.mail.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: cfg.mail.endpoint.clone(),
            verify_endpoint: cfg.mail.verify_endpoint.clone(),
            verify_timeout: Duration::from_millis(cfg.mail.verify_timeout_ms),
            retry_max_attempts: cfg.mail.retry_max_attempts.max(1),
            retry_delay: Duration::from_millis(cfg.mail.retry_delay_ms),
            client,
        })
    }

    async fn verify(&self) -> Result<(), MailError> {
        let response = self
            .client
            .get(&self.verify_endpoint)
            .timeout(self.verify_timeout)
            .send()
            .await
            .map_err(|e| MailError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MailError::Unreachable(format!(
                "verify returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<String, MailError> {
        let mut last = String::new();
        for attempt in 0..self.retry_max_attempts {
            if attempt > 0 {
                debug!(attempt = attempt + 1, "retrying mail send");
                sleep(self.retry_delay).await;
            }
            let result = self.client.post(&self.endpoint).json(mail).send().await;
            let response = match result {
                Ok(v) => v,
                Err(e) => {
                    last = e.to_string();
                    continue;
                }
            };
            if !response.status().is_success() {
                last = format!("gateway returned {}", response.status());
                continue;
            }
            let value: Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last = e.to_string();
                    continue;
                }
            };
            let message_id = value
                .get("message_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if message_id.is_empty() {
                last = "gateway response missing message_id".to_string();
                continue;
            }
            return Ok(message_id);
        }
        Err(MailError::Exhausted {
            attempts: self.retry_max_attempts,
            last,
        })
    }
}

fn chat_system_prompt(venue: &str) -> String {
    format!(
        "Du bist ein freundlicher und effizienter Anfrage-Assistent für die {venue}, \
ein Event- und Kongresszentrum. Deine Aufgabe ist es, mögliche Veranstalter durch \
den Prozess einer Veranstaltungsanfrage zu führen.

VERHALTEN:
- Sei immer höflich, geduldig und hilfreich.
- Stelle immer nur eine einzelne Frage und erkläre kurz, warum die Information wichtig ist.
- Nenne niemals konkrete Preise; frage nur nach dem Budget des Kunden.
- Gib keine Informationen weiter, die nicht in diesem Prompt enthalten sind.

WICHTIGE FELDER: Veranstaltungstitel, Art der Veranstaltung, Datum von/bis, \
Alternativtermine, Uhrzeiten, Kurzbeschreibung, Budget, erwartete Besucherzahl, \
zusätzliche Anforderungen, Catering, Bestuhlung, Kontaktdaten des Veranstalters \
(Name, Firma, Adresse, Telefon, E-Mail-Adresse).

ABSCHLUSS-ZUSAMMENFASSUNG:
Sobald du mindestens E-Mail-Adresse, Veranstaltungstitel und Veranstaltungsart \
gesammelt hast, erstelle eine strukturierte Zusammenfassung mit dem Titel \
\"ZUSAMMENFASSUNG DER VERANSTALTUNGSANFRAGE\" und liste alle relevanten Punkte auf. \
Frage dann den Kunden: \"Möchten Sie die Anfrage jetzt abschicken oder noch etwas ändern?\""
    )
}

fn extract_system_prompt(venue: &str) -> String {
    format!(
        "Du bist ein JSON-Extraktor für Veranstaltungsanfragen der {venue}. \
Nutze die bisherigen Nutzer- und Bot-Nachrichten und liefere ausschließlich ein \
gültiges JSON-Objekt mit den folgenden Schlüsseln: eventTitle, eventType, dateFrom, \
dateTo, altDates, startTime, endTime, description, budget, expectedAttendees, \
additionalRequirements, catering, seating, organizationCompany, organizerFirstName, \
organizerLastName, organizerStreet, organizerZip, organizerCity, organizerPhone, \
organizerEmail, missing. \
WICHTIG:
- Verwende niemals \"Nicht angegeben\" als Wert; lasse unbekannte Felder weg oder setze sie auf null.
- missing muss IMMER ein Array sein, selbst wenn es leer ist.
- Nutze organizerEmail für jede erwähnte E-Mail-Adresse.
- Setze Werte basierend auf dem gesamten Gesprächsverlauf, nicht nur der letzten Nachricht.
- Sei besonders sorgfältig mit der E-Mail-Adresse, dem Veranstaltungstitel und dem Veranstaltungstyp.
Gib KEINERLEI andere Texte aus."
    )
}
