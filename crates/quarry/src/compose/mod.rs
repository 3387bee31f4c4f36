use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::llm::LlmClient;
use crate::models::{
    AttemptExecution, QueryPlan, RejectionReason, Resolution, ResolutionAttempt,
    ResolutionOutcome, ResolverState, ResultSet, Row,
};
use crate::synth::strip_code_fence;
use crate::utils::redaction::{DEFAULT_DIAGNOSTIC_MAX_CHARS, redact_diagnostic_text};

pub const NARRATION_SAMPLE_ROWS: usize = 20;

pub const EMPTY_RESULT_MESSAGE: &str = "I couldn't find any data matching your request.";
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Something went wrong while answering your question. Please try rephrasing it.";
pub const SCOPE_UNAVAILABLE_MESSAGE: &str =
    "This question can't be answered here because no data is available for the current context.";
pub const UNSAFE_REQUEST_MESSAGE: &str =
    "I can't run that request. Only read-only questions about the data in this context are allowed.";

const EMPTY_RESULT_INSIGHTS: &[&str] = &[
    "The criteria in the question may not match any records",
    "The data you are looking for may be stored under a different name or status",
];
const EMPTY_RESULT_SUGGESTIONS: &[&str] = &[
    "Try asking about related information",
    "Ask what data is available in this context",
];
const FAILURE_SUGGESTIONS: &[&str] = &[
    "Try rephrasing your question",
    "Ask about a specific table or metric in this context",
];
const REJECTION_SUGGESTIONS: &[&str] = &["Ask a read-only question about the data in this context"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Answered,
    NoData,
    Rejected,
    Exhausted,
}

impl UserStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::NoData => "no_data",
            Self::Rejected => "rejected",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Display-ready copy of a result set. Values are normalized for reading,
/// the raw rows are not modified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub truncated: bool,
}

/// What the end user sees. Never carries raw error text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserResponse {
    pub status: UserStatus,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<FormattedTable>,

    pub insights: Vec<String>,
    pub suggestions: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

/// Operator-facing record of the resolution. Error strings are redacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<QueryPlan>,

    pub context_id: String,
    pub attempts: Vec<ResolutionAttempt>,
    pub synthesizer_calls: usize,
    pub executions: usize,
    pub state_trace: Vec<ResolverState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionReason>,

    pub row_count: usize,
    pub truncated: bool,
    pub narration_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposedResponse {
    pub user: UserResponse,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Narrative {
    pub summary: String,

    #[serde(default)]
    pub insights: Vec<String>,

    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Best-effort prose around a resolution. Every method may fail; the
/// composer always has a fixed fallback.
pub trait Narrator {
    fn summarize(&self, question: &str, explanation: &str, rows: &ResultSet) -> Result<Narrative>;

    fn explain_empty(&self, question: &str) -> Result<Narrative>;

    fn friendly_error(&self, question: &str, error_message: &str) -> Result<String>;
}

/// Narrator that never produces prose, so every response uses the fixed
/// fallback text.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackNarrator;

impl Narrator for FallbackNarrator {
    fn summarize(&self, _question: &str, _explanation: &str, _rows: &ResultSet) -> Result<Narrative> {
        anyhow::bail!("narration disabled")
    }

    fn explain_empty(&self, _question: &str) -> Result<Narrative> {
        anyhow::bail!("narration disabled")
    }

    fn friendly_error(&self, _question: &str, _error_message: &str) -> Result<String> {
        anyhow::bail!("narration disabled")
    }
}

pub struct LlmNarrator<C> {
    client: C,
}

impl<C: LlmClient> LlmNarrator<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C: LlmClient> Narrator for LlmNarrator<C> {
    fn summarize(&self, question: &str, explanation: &str, rows: &ResultSet) -> Result<Narrative> {
        let system = format!(
            "You are a helpful data analyst.\n\n\
             User asked: \"{question}\"\n\
             Query executed: {explanation}\n\
             Rows returned: {row_count}\n\n\
             Mention specific values from the data in your summary. Be concrete, not vague.\n\n\
             Respond with JSON:\n\
             {{\"summary\": \"2-3 sentences with specific numbers and names from the data\", \
             \"insights\": [\"specific insight\"], \"suggestions\": [\"actionable suggestion\"]}}",
            row_count = rows.len()
        );
        let user = format!(
            "Data:\n{}\n\nSummarize with specific details.",
            rows_for_prompt(rows, NARRATION_SAMPLE_ROWS)
        );
        let raw = self.client.complete(&system, &user, true)?;
        parse_narrative(&raw)
    }

    fn explain_empty(&self, question: &str) -> Result<Narrative> {
        let system = format!(
            "You are a helpful assistant explaining why no data was found.\n\n\
             User asked: \"{question}\"\n\
             The query ran successfully but returned 0 results.\n\n\
             Acknowledge what they were looking for, explain likely reasons, and suggest \
             alternative questions they could ask. Do not mention SQL, table names, or column names.\n\n\
             Respond with JSON:\n\
             {{\"summary\": \"friendly explanation\", \"insights\": [\"possible reason\"], \
             \"suggestions\": [\"alternative question\"]}}"
        );
        let raw = self
            .client
            .complete(&system, "Explain why no data was found.", true)?;
        parse_narrative(&raw)
    }

    fn friendly_error(&self, question: &str, error_message: &str) -> Result<String> {
        let system = "You are a helpful assistant. The user's question could not be answered. \
                      Rephrase the technical error into a friendly, non-technical message that \
                      helps them understand what went wrong and what to try next. Do not quote \
                      the error. Keep it under 50 words. Respond with only the message text.";
        let user = format!("User asked: '{question}'\nError: {error_message}");
        let message = self.client.complete(system, &user, false)?;
        Ok(message.trim().to_string())
    }
}

pub fn parse_narrative(raw: &str) -> Result<Narrative> {
    let narrative: Narrative = serde_json::from_str(strip_code_fence(raw))
        .context("narration output is not a JSON object with a summary")?;
    anyhow::ensure!(
        !narrative.summary.trim().is_empty(),
        "narration output has an empty summary"
    );
    Ok(narrative)
}

/// Integral floats become integers, other floats are rounded to two
/// decimals, null becomes an empty string, and anything that is not a
/// number or string is stringified.
#[must_use]
pub fn format_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::Number(number) if number.is_i64() || number.is_u64() => value.clone(),
        Value::Number(number) => number.as_f64().map_or_else(
            || Value::String(number.to_string()),
            format_float,
        ),
        Value::String(_) => value.clone(),
        Value::Bool(flag) => Value::String(flag.to_string()),
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn format_float(float: f64) -> Value {
    if float.fract() == 0.0 && float.abs() < i64::MAX as f64 {
        return Value::from(float as i64);
    }
    let rounded = (float * 100.0).round() / 100.0;
    Number::from_f64(rounded).map_or_else(|| Value::String(float.to_string()), Value::Number)
}

#[must_use]
pub fn format_table(rows: &ResultSet) -> FormattedTable {
    FormattedTable {
        columns: rows.columns.clone(),
        rows: rows
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(column, value)| (column.clone(), format_value(value)))
                    .collect()
            })
            .collect(),
        truncated: rows.truncated,
    }
}

/// Turns a resolution into the user payload plus the operator diagnostics.
pub fn compose(question: &str, resolution: &Resolution, narrator: &dyn Narrator) -> ComposedResponse {
    let mut narration_fallback = false;
    let (user, row_count, truncated) = match &resolution.outcome {
        ResolutionOutcome::Succeeded {
            sql,
            explanation,
            rows,
        } if rows.is_empty() => {
            let narrative = narrator
                .explain_empty(question)
                .ok()
                .filter(|narrative| !narrative.summary.trim().is_empty());
            let narrative = narrative.unwrap_or_else(|| {
                narration_fallback = true;
                empty_result_narrative()
            });
            let suggestions = if narrative.suggestions.is_empty() {
                to_strings(EMPTY_RESULT_SUGGESTIONS)
            } else {
                narrative.suggestions
            };
            let user = UserResponse {
                status: UserStatus::NoData,
                message: narrative.summary,
                table: None,
                insights: narrative.insights,
                suggestions,
                explanation: Some(explanation.clone()),
                sql: Some(sql.clone()),
            };
            (user, 0, rows.truncated)
        }
        ResolutionOutcome::Succeeded {
            sql,
            explanation,
            rows,
        } => {
            let sample = sample_rows(rows, NARRATION_SAMPLE_ROWS);
            let narrative = match narrator.summarize(question, explanation, &sample) {
                Ok(narrative) if !narrative.summary.trim().is_empty() => narrative,
                Ok(_) => {
                    narration_fallback = true;
                    fallback_summary(rows)
                }
                Err(error) => {
                    tracing::debug!(error = %format!("{error:#}"), "summary narration failed");
                    narration_fallback = true;
                    fallback_summary(rows)
                }
            };
            let user = UserResponse {
                status: UserStatus::Answered,
                message: narrative.summary,
                table: Some(format_table(rows)),
                insights: narrative.insights,
                suggestions: narrative.suggestions,
                explanation: Some(explanation.clone()),
                sql: Some(sql.clone()),
            };
            (user, rows.len(), rows.truncated)
        }
        ResolutionOutcome::Rejected { reason } => {
            let message = if reason.is_scope_failure() {
                SCOPE_UNAVAILABLE_MESSAGE
            } else {
                UNSAFE_REQUEST_MESSAGE
            };
            let user = UserResponse {
                status: UserStatus::Rejected,
                message: message.to_string(),
                table: None,
                insights: Vec::new(),
                suggestions: to_strings(REJECTION_SUGGESTIONS),
                explanation: None,
                sql: None,
            };
            (user, 0, false)
        }
        ResolutionOutcome::Exhausted { last_error } => {
            let redacted = redact_diagnostic_text(last_error, DEFAULT_DIAGNOSTIC_MAX_CHARS);
            let message = narrator
                .friendly_error(question, &redacted)
                .ok()
                .map(|message| message.trim().to_string())
                .filter(|message| is_presentable(message, last_error, &redacted));
            let message = message.unwrap_or_else(|| {
                narration_fallback = true;
                GENERIC_FAILURE_MESSAGE.to_string()
            });
            let user = UserResponse {
                status: UserStatus::Exhausted,
                message,
                table: None,
                insights: Vec::new(),
                suggestions: to_strings(FAILURE_SUGGESTIONS),
                explanation: None,
                sql: None,
            };
            (user, 0, false)
        }
    };

    let diagnostics = Diagnostics {
        plan: resolution.plan.clone(),
        context_id: resolution.context_id.clone(),
        attempts: resolution.attempts.iter().map(redact_attempt).collect(),
        synthesizer_calls: resolution.synthesizer_calls,
        executions: resolution.executions,
        state_trace: resolution.state_trace.clone(),
        last_error: match &resolution.outcome {
            ResolutionOutcome::Exhausted { last_error } => Some(redact_diagnostic_text(
                last_error,
                DEFAULT_DIAGNOSTIC_MAX_CHARS,
            )),
            _ => None,
        },
        rejection: match &resolution.outcome {
            ResolutionOutcome::Rejected { reason } => Some(reason.clone()),
            _ => None,
        },
        row_count,
        truncated,
        narration_fallback,
    };

    ComposedResponse { user, diagnostics }
}

/// A friendly message may neither quote the error nor lift identifiers out
/// of it, such as `w.location`, `inventory_balance_v2` or a quoted name.
fn is_presentable(message: &str, raw_error: &str, redacted_error: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lowered = message.to_lowercase();
    [raw_error, redacted_error]
        .into_iter()
        .map(str::trim)
        .filter(|error| !error.is_empty())
        .all(|error| {
            !message.contains(error)
                && !error_identifiers(error).any(|identifier| lowered.contains(&identifier))
        })
}

/// Dotted or underscored names and quoted text found in an error, lower-cased.
fn error_identifiers(error: &str) -> impl Iterator<Item = String> + '_ {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    let identifier = IDENTIFIER.get_or_init(|| {
        Regex::new(
            r#"'([^']{2,})'|"([^"]{2,})"|`([^`]{2,})`|([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)+|[A-Za-z0-9]*_[A-Za-z0-9_]+)"#,
        )
        .expect("error identifier regex should compile")
    });
    identifier.captures_iter(error).filter_map(|captures| {
        captures
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|token| token.as_str().to_lowercase())
    })
}

fn fallback_summary(rows: &ResultSet) -> Narrative {
    let count = rows.len();
    let noun = if count == 1 { "record" } else { "records" };
    let mut summary = format!("Found {count} {noun}.");
    if let Some(first) = rows.rows.first() {
        let values = ordered_values(&rows.columns, first)
            .map(|(column, value)| format!("{column}: {}", display_value(&format_value(value))))
            .collect::<Vec<_>>()
            .join(", ");
        if !values.is_empty() {
            summary.push_str(&format!(" First result: {values}."));
        }
    }
    Narrative {
        summary,
        insights: vec![format!("{count} {noun} returned")],
        suggestions: vec!["Review the detailed data below".to_string()],
    }
}

fn empty_result_narrative() -> Narrative {
    Narrative {
        summary: EMPTY_RESULT_MESSAGE.to_string(),
        insights: to_strings(EMPTY_RESULT_INSIGHTS),
        suggestions: to_strings(EMPTY_RESULT_SUGGESTIONS),
    }
}

fn redact_attempt(attempt: &ResolutionAttempt) -> ResolutionAttempt {
    let mut attempt = attempt.clone();
    attempt.synthesis_error = attempt
        .synthesis_error
        .map(|error| redact_diagnostic_text(&error, DEFAULT_DIAGNOSTIC_MAX_CHARS));
    if let AttemptExecution::Failed { error } = &mut attempt.execution {
        *error = redact_diagnostic_text(error, DEFAULT_DIAGNOSTIC_MAX_CHARS);
    }
    attempt
}

fn sample_rows(rows: &ResultSet, limit: usize) -> ResultSet {
    ResultSet::new(
        rows.columns.clone(),
        rows.rows.iter().take(limit).cloned().collect(),
    )
    .with_truncated(rows.truncated || rows.len() > limit)
}

fn rows_for_prompt(rows: &ResultSet, limit: usize) -> String {
    let mut lines = rows
        .rows
        .iter()
        .take(limit)
        .enumerate()
        .map(|(index, row)| {
            let fields = ordered_values(&rows.columns, row)
                .map(|(column, value)| format!("{column}={}", display_value(value)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("Row {}: {fields}", index + 1)
        })
        .collect::<Vec<_>>();
    if rows.len() > limit {
        lines.push(format!("... and {} more rows", rows.len() - limit));
    }
    lines.join("\n")
}

/// Walks a row in select-list order, falling back to map order when the
/// column list is missing.
fn ordered_values<'a>(
    columns: &'a [String],
    row: &'a Row,
) -> Box<dyn Iterator<Item = (&'a str, &'a Value)> + 'a> {
    if columns.is_empty() {
        return Box::new(row.iter().map(|(column, value)| (column.as_str(), value)));
    }
    Box::new(columns.iter().filter_map(move |column| {
        row.get(column)
            .map(|value| (column.as_str(), value))
    }))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
