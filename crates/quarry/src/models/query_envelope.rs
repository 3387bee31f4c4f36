use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::time::{format_unix_ms, unix_timestamp_millis};

pub const QUERY_ENVELOPE_SCHEMA_VERSION: &str = "quarry.query-envelope.v1";

/// What one `ask` run did, reported next to the user payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionMeta {
    pub status: String,
    pub context_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,

    pub synthesizer_calls: usize,
    pub row_count: usize,
    pub truncated: bool,

    /// Redacted attempt log; only present when asked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub schema_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionMeta>,

    /// Command-specific counts such as `table_count` or `context_count`.
    #[serde(flatten)]
    pub counts: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    NarrationFallback,
    ResultTruncated,
}

impl WarningCode {
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NarrationFallback => "narration was unavailable; fixed response text was used",
            Self::ResultTruncated => "result set was truncated at the row cap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelopeWarning {
    pub code: WarningCode,
    pub message: String,
}

/// How a failed command should be reported to the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFailureClass {
    /// The request itself was refused: unsafe SQL or an unknown context.
    Rejection,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelopeError {
    pub code: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<CommandFailureClass>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub ok: bool,
    pub command: String,
    pub generated_at_utc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub meta: EnvelopeMeta,
    pub warnings: Vec<QueryEnvelopeWarning>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryEnvelopeError>,
}

/// A failed command carrying the error envelope it should print. `main`
/// reads the class to pick the exit code.
#[derive(Debug, Clone)]
pub struct QueryEnvelopeCommandFailure {
    envelope: QueryEnvelope,
    class: CommandFailureClass,
}

impl QueryEnvelopeCommandFailure {
    #[must_use]
    pub fn runtime(envelope: QueryEnvelope) -> Self {
        Self::classified(envelope, CommandFailureClass::Runtime)
    }

    #[must_use]
    pub fn rejection(envelope: QueryEnvelope) -> Self {
        Self::classified(envelope, CommandFailureClass::Rejection)
    }

    fn classified(mut envelope: QueryEnvelope, class: CommandFailureClass) -> Self {
        if let Some(error) = envelope.error.as_mut() {
            error.class = Some(class);
        }
        Self { envelope, class }
    }

    #[must_use]
    pub fn envelope(&self) -> &QueryEnvelope {
        &self.envelope
    }

    #[must_use]
    pub const fn class(&self) -> CommandFailureClass {
        self.class
    }
}

impl Display for QueryEnvelopeCommandFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.envelope) {
            Ok(encoded) => f.write_str(&encoded),
            Err(_) => f.write_str("query envelope serialization failure"),
        }
    }
}

impl std::error::Error for QueryEnvelopeCommandFailure {}

impl QueryEnvelope {
    #[must_use]
    pub fn ok(command: impl Into<String>, data: Value) -> Self {
        Self::base(command, true).with_data(data)
    }

    #[must_use]
    pub fn error(
        command: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::base(command, false);
        envelope.error = Some(QueryEnvelopeError {
            code: code.into(),
            message: message.into(),
            class: None,
            details: None,
        });
        envelope
    }

    fn base(command: impl Into<String>, ok: bool) -> Self {
        Self {
            ok,
            command: command.into(),
            generated_at_utc: format_unix_ms(unix_timestamp_millis()),
            data: None,
            meta: EnvelopeMeta {
                schema_version: QUERY_ENVELOPE_SCHEMA_VERSION.to_string(),
                resolution: None,
                counts: BTreeMap::new(),
            },
            warnings: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_count(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.counts.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_resolution(mut self, resolution: ResolutionMeta) -> Self {
        self.meta.resolution = Some(resolution);
        self
    }

    /// Adds `code` once; repeated codes are ignored.
    #[must_use]
    pub fn with_warning(mut self, code: WarningCode) -> Self {
        if !self.warnings.iter().any(|warning| warning.code == code) {
            self.warnings.push(QueryEnvelopeWarning {
                code,
                message: code.message().to_string(),
            });
        }
        self
    }

    #[must_use]
    pub fn with_error_details(mut self, details: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }

    pub fn print(&self) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(self)
            .map_err(|error| anyhow::anyhow!("failed to encode {} response: {error}", self.command))?;
        println!("{encoded}");
        Ok(())
    }
}
