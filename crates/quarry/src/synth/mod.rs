use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use thiserror::Error;

use crate::introspect::SchemaDescription;
use crate::llm::{LlmClient, LlmError};
use crate::models::{Candidate, PermissionScope};
use crate::validate::BLOCKED_KEYWORDS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("query synthesizer unreachable: {0}")]
    Unreachable(String),

    #[error("query synthesizer returned unparsable output: {0}")]
    Unparsable(String),

    #[error("query synthesizer returned no SQL: {explanation}")]
    MissingSql { explanation: String },
}

impl From<LlmError> for SynthesisError {
    fn from(error: LlmError) -> Self {
        match error {
            LlmError::Malformed(detail) => Self::Unparsable(detail),
            other => Self::Unreachable(other.to_string()),
        }
    }
}

/// Untrusted translation of a question into one candidate statement.
pub trait QuerySynthesizer {
    fn synthesize(
        &self,
        question: &str,
        schema: &SchemaDescription,
        scope: &PermissionScope,
    ) -> Result<Candidate, SynthesisError>;

    fn repair(
        &self,
        question: &str,
        failed_sql: &str,
        error_message: &str,
        schema: &SchemaDescription,
    ) -> Result<Candidate, SynthesisError>;
}

/// Shape the model is asked to answer with.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CandidatePayload {
    /// One read-only SELECT statement.
    #[serde(default)]
    pub sql: Option<String>,

    /// What the statement returns, in plain language.
    #[serde(default)]
    pub explanation: Option<String>,

    /// False when the request cannot be answered with a read-only query.
    #[serde(default)]
    pub is_safe: Option<bool>,
}

#[must_use]
pub fn candidate_response_schema() -> String {
    let schema = schemars::schema_for!(CandidatePayload);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| {
        r#"{"sql": "string", "explanation": "string", "is_safe": "boolean"}"#.to_string()
    })
}

/// Parses the model's reply. Code fences around the JSON are tolerated; a
/// missing safety flag counts as "not safe".
pub fn parse_candidate(raw: &str) -> Result<Candidate, SynthesisError> {
    let body = strip_code_fence(raw);
    let payload: CandidatePayload = serde_json::from_str(body)
        .map_err(|error| SynthesisError::Unparsable(error.to_string()))?;

    let explanation = payload
        .explanation
        .map(|text| text.trim().to_string())
        .unwrap_or_default();
    let Some(sql) = payload
        .sql
        .map(|sql| sql.trim().to_string())
        .filter(|sql| !sql.is_empty())
    else {
        return Err(SynthesisError::MissingSql { explanation });
    };

    Ok(Candidate {
        sql,
        explanation,
        claimed_safe: payload.is_safe.unwrap_or(false),
    })
}

pub(crate) fn strip_code_fence(raw: &str) -> &str {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").expect("code fence regex should compile")
    });
    fence
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map_or_else(|| raw.trim(), |inner| inner.as_str())
}

/// Synthesizer backed by a chat-completion model.
pub struct LlmQuerySynthesizer<C> {
    client: C,
}

impl<C: LlmClient> LlmQuerySynthesizer<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C: LlmClient> QuerySynthesizer for LlmQuerySynthesizer<C> {
    fn synthesize(
        &self,
        question: &str,
        schema: &SchemaDescription,
        scope: &PermissionScope,
    ) -> Result<Candidate, SynthesisError> {
        let system = synthesis_system_prompt(schema, scope);
        let user = format!(
            "User question: {question}\n\nGenerate one {} SELECT statement that answers it.",
            schema.dialect
        );
        let raw = self.client.complete(&system, &user, true)?;
        parse_candidate(&raw)
    }

    fn repair(
        &self,
        question: &str,
        failed_sql: &str,
        error_message: &str,
        schema: &SchemaDescription,
    ) -> Result<Candidate, SynthesisError> {
        let system = repair_system_prompt(question, failed_sql, error_message, schema);
        let raw = self
            .client
            .complete(&system, "Fix the SQL statement based on the error above.", true)?;
        parse_candidate(&raw)
    }
}

#[must_use]
pub fn synthesis_system_prompt(schema: &SchemaDescription, scope: &PermissionScope) -> String {
    let mut prompt = format!(
        "You are an expert {dialect} query generator for a governed analytics assistant.\n\n{schema_text}\n",
        dialect = schema.dialect,
        schema_text = schema.render()
    );

    prompt.push_str("CONTEXT:\n");
    let _ = writeln!(prompt, "- User is working in: {}", scope.display_name());
    if let Some(primary) = &scope.primary_table {
        let _ = writeln!(prompt, "- Primary focus: {primary}");
    }
    let allowed = scope
        .allowed_tables
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(prompt, "- Allowed tables: {allowed}");
    for (table, columns) in &scope.allowed_columns {
        let columns = columns
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(prompt, "- Allowed columns of {table}: {columns}");
    }

    prompt.push_str(
        "
USE ACTUAL VALUES FROM THE SCHEMA:
When the schema lists Sample Values for a column, filter with those exact literals.
If the schema shows `status: OPEN, PARTIAL, SHIPPED, CANCELLED` and the user asks
for pending orders, use `status IN ('OPEN', 'PARTIAL')`, never a guessed literal
such as 'Pending'.
",
    );
    prompt.push_str(&dialect_rules(&schema.dialect));
    let _ = write!(
        prompt,
        "
QUERY RULES:
1. Exactly one SELECT statement. Never modify data.
2. Only use the allowed tables and columns listed above.
3. JOIN along the foreign keys shown in the schema and use table aliases.
4. Add LIMIT 100 unless the query returns a single aggregate row.
5. GROUP BY every non-aggregated column.
6. Never write these words anywhere, including aliases: {blocked}.

Respond ONLY with JSON matching this schema:
{response_schema}

Example: {{\"sql\": \"SELECT ...\", \"explanation\": \"What the query returns\", \"is_safe\": true}}
If the request cannot be answered with a read-only query over these tables, set is_safe to false.
",
        blocked = BLOCKED_KEYWORDS.join(", "),
        response_schema = candidate_response_schema()
    );
    prompt
}

#[must_use]
pub fn repair_system_prompt(
    question: &str,
    failed_sql: &str,
    error_message: &str,
    schema: &SchemaDescription,
) -> String {
    format!(
        "You are a {dialect} expert fixing a broken query.

{schema_text}
ORIGINAL USER QUESTION: {question}

FAILED SQL:
{failed_sql}

ERROR MESSAGE:
{error_message}

Analyze the error and write a corrected statement that will run. Typical causes:
- syntax from another SQL dialect
- a missing JOIN
- a wrong column or table name
- an aggregate without GROUP BY
- unsupported date functions
{rules}
The corrected statement must still be a single read-only SELECT over the tables above.

Respond ONLY with JSON: {{\"sql\": \"CORRECTED SQL\", \"explanation\": \"What was wrong and how it was fixed\", \"is_safe\": true}}
",
        dialect = schema.dialect,
        schema_text = schema.render(),
        rules = dialect_rules(&schema.dialect)
    )
}

fn dialect_rules(dialect: &str) -> String {
    if dialect.eq_ignore_ascii_case("sqlite") {
        "
SQLITE SYNTAX RULES:
- Current date: date('now'); intervals: date('now', '-7 days')
- Date parts: strftime('%Y-%m', column)
- String concatenation: a || b
- LIKE is case-insensitive for ASCII text
- Use LIMIT N, never TOP N
"
        .to_string()
    } else {
        format!("\nUse {dialect} syntax only.\n")
    }
}
