use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

/// Rows from exactly one successful execution, in the order the data store
/// produced them. `columns` carries the select-list order, which the row maps
/// do not preserve.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub truncated: bool,
}

impl ResultSet {
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            truncated: false,
        }
    }

    /// Builds a result set from JSON objects, taking the column order from the
    /// first row.
    #[must_use]
    pub fn from_json_rows(rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect::<Vec<_>>();
        let columns = rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        Self::new(columns, rows)
    }

    #[must_use]
    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Untrusted statement proposed by the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Candidate {
    pub sql: String,
    pub explanation: String,
    pub claimed_safe: bool,
}

impl Candidate {
    #[must_use]
    pub fn new(sql: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            explanation: explanation.into(),
            claimed_safe: true,
        }
    }

    #[must_use]
    pub fn with_claimed_safe(mut self, claimed_safe: bool) -> Self {
        self.claimed_safe = claimed_safe;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryPlan {
    Predefined { metric: String, sql: String },
    Synthesized,
}

impl QueryPlan {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Predefined { .. } => "predefined",
            Self::Synthesized => "synthesized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    Synthesize,
    Repair,
    Predefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverState {
    Synthesizing,
    Validating,
    Executing,
    Retrying,
    Succeeded,
    Rejected,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    ScopeUnavailable {
        context_id: String,
    },
    EmptyScope {
        context_id: String,
    },
    UnsafeStatement {
        violation: String,

        #[serde(skip_serializing_if = "Option::is_none")]
        keyword: Option<String>,
    },
    OutOfScopeTable {
        table: String,
    },
    DeclinedBySynthesizer {
        explanation: String,
    },
}

impl RejectionReason {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ScopeUnavailable { .. } => "scope_unavailable",
            Self::EmptyScope { .. } => "scope_empty",
            Self::UnsafeStatement { .. } => "unsafe_statement",
            Self::OutOfScopeTable { .. } => "out_of_scope_table",
            Self::DeclinedBySynthesizer { .. } => "declined_by_synthesizer",
        }
    }

    #[must_use]
    pub const fn is_scope_failure(&self) -> bool {
        matches!(
            self,
            Self::ScopeUnavailable { .. } | Self::EmptyScope { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptValidation {
    Passed,
    Rejected { reason: RejectionReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptExecution {
    NotAttempted,
    Failed { error: String },
    Succeeded { row_count: usize },
}

/// One synthesize-validate-execute cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionAttempt {
    pub attempt_index: usize,
    pub entry_point: EntryPoint,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<AttemptValidation>,

    pub execution: AttemptExecution,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Succeeded {
        sql: String,
        explanation: String,
        rows: ResultSet,
    },
    Rejected {
        reason: RejectionReason,
    },
    Exhausted {
        last_error: String,
    },
}

impl ResolutionOutcome {
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Rejected { .. } => "rejected",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}

/// Everything one `resolve` call produced: the terminal outcome plus the
/// attempt log operators need to audit it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub context_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<QueryPlan>,

    pub outcome: ResolutionOutcome,
    pub attempts: Vec<ResolutionAttempt>,
    pub state_trace: Vec<ResolverState>,
    pub synthesizer_calls: usize,
    pub executions: usize,
}

impl Resolution {
    #[must_use]
    pub fn rejected_before_planning(context_id: &str, reason: RejectionReason) -> Self {
        Self {
            context_id: context_id.to_string(),
            plan: None,
            outcome: ResolutionOutcome::Rejected { reason },
            attempts: Vec::new(),
            state_trace: vec![ResolverState::Rejected],
            synthesizer_calls: 0,
            executions: 0,
        }
    }

    #[must_use]
    pub fn final_state(&self) -> Option<ResolverState> {
        self.state_trace.last().copied()
    }
}
