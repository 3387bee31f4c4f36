use quarry::compose::{
    EMPTY_RESULT_MESSAGE, FallbackNarrator, GENERIC_FAILURE_MESSAGE, Narrative, Narrator,
    SCOPE_UNAVAILABLE_MESSAGE, UNSAFE_REQUEST_MESSAGE, UserStatus, compose,
};
use quarry::models::{
    AttemptExecution, Candidate, EntryPoint, QueryPlan, RejectionReason, Resolution,
    ResolutionAttempt, ResolutionOutcome, ResolverState, ResultSet,
};
use serde_json::json;

struct CannedNarrator {
    narrative: Narrative,
    friendly: String,
}

impl Narrator for CannedNarrator {
    fn summarize(&self, _question: &str, _explanation: &str, rows: &ResultSet) -> anyhow::Result<Narrative> {
        assert!(rows.len() <= 20, "narrator must only see a bounded sample");
        Ok(self.narrative.clone())
    }

    fn explain_empty(&self, _question: &str) -> anyhow::Result<Narrative> {
        Ok(Narrative {
            suggestions: Vec::new(),
            ..self.narrative.clone()
        })
    }

    fn friendly_error(&self, _question: &str, _error_message: &str) -> anyhow::Result<String> {
        Ok(self.friendly.clone())
    }
}

fn canned() -> CannedNarrator {
    CannedNarrator {
        narrative: Narrative {
            summary: "Mumbai holds 150 units of RM-001.".to_string(),
            insights: vec!["Stock is concentrated in one warehouse".to_string()],
            suggestions: vec!["Compare with last month".to_string()],
        },
        friendly: "I couldn't build that report. Try naming a warehouse.".to_string(),
    }
}

fn succeeded(rows: ResultSet) -> Resolution {
    Resolution {
        context_id: "inventory".to_string(),
        plan: Some(QueryPlan::Synthesized),
        outcome: ResolutionOutcome::Succeeded {
            sql: "SELECT item_id, qty FROM inventory_balance".to_string(),
            explanation: "Lists balances".to_string(),
            rows,
        },
        attempts: Vec::new(),
        state_trace: vec![
            ResolverState::Synthesizing,
            ResolverState::Validating,
            ResolverState::Executing,
            ResolverState::Succeeded,
        ],
        synthesizer_calls: 1,
        executions: 1,
    }
}

fn exhausted(last_error: &str) -> Resolution {
    Resolution {
        context_id: "inventory".to_string(),
        plan: Some(QueryPlan::Synthesized),
        outcome: ResolutionOutcome::Exhausted {
            last_error: last_error.to_string(),
        },
        attempts: vec![ResolutionAttempt {
            attempt_index: 0,
            entry_point: EntryPoint::Synthesize,
            candidate: Some(Candidate::new("SELECT 1 FROM inventory_balance", "sanity check")),
            synthesis_error: None,
            validation: None,
            execution: AttemptExecution::Failed {
                error: last_error.to_string(),
            },
            duration_ms: 3,
        }],
        state_trace: vec![ResolverState::Exhausted],
        synthesizer_calls: 1,
        executions: 1,
    }
}

fn balance_rows() -> ResultSet {
    ResultSet::from_json_rows(vec![
        json!({"item_id": "RM-001", "qty": 150.0}),
        json!({"item_id": "RM-002", "qty": 20.456}),
        json!({"item_id": "RM-003", "qty": null}),
    ])
}

#[test]
fn answered_response_formats_numbers_for_display() {
    let composed = compose("stock per item", &succeeded(balance_rows()), &canned());

    assert_eq!(composed.user.status, UserStatus::Answered);
    assert_eq!(composed.user.message, "Mumbai holds 150 units of RM-001.");
    let table = composed.user.table.expect("answered response should carry a table");
    assert_eq!(table.rows[0]["qty"], json!(150));
    assert_eq!(table.rows[1]["qty"], json!(20.46));
    assert_eq!(table.rows[2]["qty"], json!(""));
    assert_eq!(
        composed.user.sql.as_deref(),
        Some("SELECT item_id, qty FROM inventory_balance")
    );
    assert!(!composed.diagnostics.narration_fallback);
    assert_eq!(composed.diagnostics.row_count, 3);
}

#[test]
fn narrator_sees_at_most_twenty_rows() {
    let rows = ResultSet::from_json_rows(
        (0..45)
            .map(|index| json!({"item_id": format!("RM-{index:03}")}))
            .collect(),
    );
    let composed = compose("list items", &succeeded(rows), &canned());
    assert_eq!(composed.user.table.map(|table| table.rows.len()), Some(45));
}

#[test]
fn fallback_summary_names_count_and_first_row_values() {
    let composed = compose("stock per item", &succeeded(balance_rows()), &FallbackNarrator);

    assert!(composed.user.message.contains("Found 3 records"), "{}", composed.user.message);
    assert!(composed.user.message.contains("RM-001"));
    assert!(composed.user.message.contains("150"));
    assert!(!composed.user.message.contains("150.0"));
    assert!(composed.diagnostics.narration_fallback);
}

#[test]
fn empty_result_always_offers_suggestions() {
    let empty = ResultSet::new(vec!["item_id".to_string()], Vec::new());

    let narrated = compose("negative stock", &succeeded(empty.clone()), &canned());
    assert_eq!(narrated.user.status, UserStatus::NoData);
    assert!(!narrated.user.suggestions.is_empty());

    let fallback = compose("negative stock", &succeeded(empty), &FallbackNarrator);
    assert_eq!(fallback.user.status, UserStatus::NoData);
    assert_eq!(fallback.user.message, EMPTY_RESULT_MESSAGE);
    assert!(!fallback.user.insights.is_empty());
    assert!(!fallback.user.suggestions.is_empty());
}

#[test]
fn rejection_messages_follow_the_reason_family() {
    let scope_missing = Resolution::rejected_before_planning(
        "finance",
        RejectionReason::ScopeUnavailable {
            context_id: "finance".to_string(),
        },
    );
    let composed = compose("revenue", &scope_missing, &canned());
    assert_eq!(composed.user.message, SCOPE_UNAVAILABLE_MESSAGE);
    assert!(composed.user.table.is_none());

    let mut unsafe_request = succeeded(ResultSet::default());
    unsafe_request.outcome = ResolutionOutcome::Rejected {
        reason: RejectionReason::UnsafeStatement {
            violation: "mutating_statement".to_string(),
            keyword: Some("DELETE".to_string()),
        },
    };
    let composed = compose("delete stock", &unsafe_request, &canned());
    assert_eq!(composed.user.status, UserStatus::Rejected);
    assert_eq!(composed.user.message, UNSAFE_REQUEST_MESSAGE);
    assert!(composed.user.sql.is_none());
    assert_eq!(
        composed.diagnostics.rejection.as_ref().map(RejectionReason::code),
        Some("unsafe_statement")
    );
}

#[test]
fn exhausted_uses_friendly_translation_when_it_is_clean() {
    let composed = compose("stock by bin", &exhausted("no such column: bin"), &canned());
    assert_eq!(composed.user.status, UserStatus::Exhausted);
    assert_eq!(
        composed.user.message,
        "I couldn't build that report. Try naming a warehouse."
    );
    assert!(!composed.user.suggestions.is_empty());
}

#[test]
fn exhausted_falls_back_when_translation_is_empty() {
    let narrator = CannedNarrator {
        friendly: "   ".to_string(),
        ..canned()
    };
    let composed = compose("stock by bin", &exhausted("no such column: bin"), &narrator);
    assert_eq!(composed.user.message, GENERIC_FAILURE_MESSAGE);
    assert!(composed.diagnostics.narration_fallback);
}

#[test]
fn diagnostics_redact_secrets_in_errors() {
    let raw = "http 401: invalid api key sk-abcdefghijklmnopqrstuvwxyz123456";
    let composed = compose("stock", &exhausted(raw), &FallbackNarrator);

    let last_error = composed
        .diagnostics
        .last_error
        .expect("exhausted diagnostics should keep the last error");
    assert!(!last_error.contains("sk-abcdefghijklmnopqrstuvwxyz123456"));
    assert!(last_error.contains("[REDACTED]"));
    match &composed.diagnostics.attempts[0].execution {
        AttemptExecution::Failed { error } => assert!(error.contains("[REDACTED]")),
        other => panic!("expected failed execution, got {other:?}"),
    }
    assert!(!composed.user.message.contains("sk-"));
}
