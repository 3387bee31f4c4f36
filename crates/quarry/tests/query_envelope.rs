use quarry::models::{
    CommandFailureClass, QUERY_ENVELOPE_SCHEMA_VERSION, QueryEnvelope, QueryEnvelopeCommandFailure,
    ResolutionMeta, WarningCode,
};
use serde_json::json;

fn answered_meta() -> ResolutionMeta {
    ResolutionMeta {
        status: "answered".to_string(),
        context_id: "inventory".to_string(),
        plan: Some("synthesized".to_string()),
        synthesizer_calls: 1,
        row_count: 1,
        truncated: true,
        diagnostics: None,
    }
}

#[test]
fn ok_envelope_tracks_contract_fields() {
    let envelope = QueryEnvelope::ok(
        "ask",
        json!({
            "status": "answered",
            "message": "Found 1 record."
        }),
    )
    .with_resolution(answered_meta())
    .with_warning(WarningCode::ResultTruncated)
    .with_warning(WarningCode::ResultTruncated);

    assert!(envelope.ok);
    assert_eq!(envelope.command, "ask");
    assert!(envelope.generated_at_utc.ends_with('Z'));
    assert!(envelope.data.is_some());
    assert_eq!(envelope.meta.schema_version, QUERY_ENVELOPE_SCHEMA_VERSION);
    assert_eq!(envelope.meta.resolution.as_ref().map(|meta| meta.row_count), Some(1));
    assert_eq!(envelope.warnings.len(), 1);
    assert_eq!(envelope.warnings[0].code, WarningCode::ResultTruncated);
    assert_eq!(envelope.warnings[0].message, WarningCode::ResultTruncated.message());
    assert!(envelope.error.is_none());
}

#[test]
fn resolution_meta_nests_and_counts_flatten() {
    let ask = serde_json::to_value(
        QueryEnvelope::ok("ask", json!({})).with_resolution(answered_meta()),
    )
    .expect("envelope should serialize");
    assert_eq!(ask.pointer("/meta/resolution/context_id"), Some(&json!("inventory")));
    assert_eq!(ask.pointer("/meta/resolution/plan"), Some(&json!("synthesized")));
    assert!(ask.pointer("/meta/resolution/diagnostics").is_none());

    let schema = serde_json::to_value(
        QueryEnvelope::ok("schema", json!({})).with_count("table_count", json!(2)),
    )
    .expect("envelope should serialize");
    assert_eq!(schema.pointer("/meta/table_count"), Some(&json!(2)));
    assert_eq!(
        schema.pointer("/meta/schema_version"),
        Some(&json!(QUERY_ENVELOPE_SCHEMA_VERSION))
    );
    assert!(schema.pointer("/meta/resolution").is_none());
}

#[test]
fn warnings_serialize_with_snake_case_codes() {
    let encoded = serde_json::to_value(
        QueryEnvelope::ok("ask", json!({})).with_warning(WarningCode::NarrationFallback),
    )
    .expect("envelope should serialize");
    assert_eq!(
        encoded.pointer("/warnings/0/code"),
        Some(&json!("narration_fallback"))
    );
}

#[test]
fn ok_envelope_serializes_required_top_level_fields() {
    let envelope = QueryEnvelope::ok("contexts", json!({"contexts": []}));
    let encoded = serde_json::to_value(&envelope).expect("envelope should serialize");

    let object = encoded
        .as_object()
        .expect("query envelope JSON should be object");
    assert_eq!(object.get("ok"), Some(&json!(true)));
    assert_eq!(object.get("command"), Some(&json!("contexts")));
    assert!(object.contains_key("generated_at_utc"));
    assert!(object.contains_key("data"));
    assert!(object.contains_key("meta"));
    assert!(object.contains_key("warnings"));
    assert!(!object.contains_key("error"));
}

#[test]
fn error_envelope_supports_structured_details() {
    let envelope = QueryEnvelope::error("check", "mutating_statement", "query rejected")
        .with_error_details(json!({"violation": {"reason": "mutating_statement", "detected": "DELETE"}}));

    assert!(!envelope.ok);
    let encoded = serde_json::to_value(&envelope).expect("envelope should serialize");
    assert_eq!(
        encoded
            .pointer("/error/details/violation/detected")
            .and_then(|value| value.as_str()),
        Some("DELETE")
    );
    assert!(encoded.pointer("/error/class").is_none());
}

#[test]
fn command_failure_display_is_json_envelope() {
    let failure = QueryEnvelopeCommandFailure::rejection(QueryEnvelope::error(
        "ask",
        "scope_unavailable",
        "no permission scope",
    ));
    assert_eq!(failure.class(), CommandFailureClass::Rejection);

    let parsed: serde_json::Value =
        serde_json::from_str(&failure.to_string()).expect("display output should be JSON envelope");
    assert_eq!(parsed.get("ok").and_then(|value| value.as_bool()), Some(false));
    assert_eq!(
        parsed.pointer("/error/code").and_then(|value| value.as_str()),
        Some("scope_unavailable")
    );
    assert_eq!(
        parsed.pointer("/error/class").and_then(|value| value.as_str()),
        Some("rejection")
    );

    let runtime = QueryEnvelopeCommandFailure::runtime(QueryEnvelope::error(
        "ask",
        "resolution_exhausted",
        "no attempt succeeded",
    ));
    assert_eq!(runtime.class(), CommandFailureClass::Runtime);
    assert_eq!(runtime.envelope().command, "ask");
    assert_eq!(
        runtime.envelope().error.as_ref().and_then(|error| error.class),
        Some(CommandFailureClass::Runtime)
    );
}
