use anyhow::{Context, Error, Result};
use clap::Args;
use serde_json::json;

use super::{load_catalog, open_store};
use crate::compose::{ComposedResponse, FallbackNarrator, LlmNarrator, Narrator, UserStatus, compose};
use crate::config::{
    DEFAULT_MAX_RETRIES, DEFAULT_ROW_CAP, LlmSettings, ResolverSettings, RuntimePaths,
};
use crate::llm::OpenAiChatClient;
use crate::models::{
    QueryEnvelope, QueryEnvelopeCommandFailure, RejectionReason, Resolution, ResolutionMeta,
    WarningCode,
};
use crate::resolve::Resolver;
use crate::scope::ScopeProvider;
use crate::synth::LlmQuerySynthesizer;
use crate::validate::ReadOnlyValidator;

const COMMAND: &str = "ask";

#[derive(Debug, Clone, Args)]
pub struct AskArgs {
    #[arg(value_name = "QUESTION")]
    pub question: String,

    #[arg(long, value_name = "ID")]
    pub context: String,

    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: usize,

    #[arg(long, default_value_t = DEFAULT_ROW_CAP)]
    pub row_cap: usize,

    /// Include the attempt log and state trace in the envelope meta.
    #[arg(long, default_value_t = false)]
    pub diagnostics: bool,

    /// Skip the language-model narration and use the fixed summaries.
    #[arg(long, default_value_t = false)]
    pub no_narration: bool,

    /// Only apply the read-only keyword gate, not the table-scope check.
    #[arg(long, default_value_t = false)]
    pub no_table_scope: bool,
}

pub fn run(args: &AskArgs, runtime_paths: &RuntimePaths) -> Result<()> {
    let settings = ResolverSettings {
        max_retries: args.max_retries,
        row_cap: args.row_cap,
        enforce_table_scope: !args.no_table_scope,
    };
    settings.validate().map_err(|error| {
        Error::new(QueryEnvelopeCommandFailure::runtime(
            QueryEnvelope::error(COMMAND, "ask_settings_invalid", format!("{error:#}"))
                .with_error_details(json!({
                    "max_retries": args.max_retries,
                    "row_cap": args.row_cap,
                })),
        ))
    })?;

    let catalog = load_catalog(COMMAND, &runtime_paths.catalog_path)?;
    if catalog.scope_for(&args.context).is_none() {
        let resolution = Resolution::rejected_before_planning(
            &args.context,
            RejectionReason::ScopeUnavailable {
                context_id: args.context.clone(),
            },
        );
        return emit(&compose(&args.question, &resolution, &FallbackNarrator), args.diagnostics);
    }

    let store = open_store(COMMAND, &runtime_paths.database_path)?;
    let llm_settings = LlmSettings::from_env().map_err(|error| {
        Error::new(QueryEnvelopeCommandFailure::runtime(
            QueryEnvelope::error(
                COMMAND,
                "llm_unconfigured",
                "language model settings are missing or invalid",
            )
            .with_error_details(json!({ "cause": format!("{error:#}") })),
        ))
    })?;
    let client = OpenAiChatClient::new(llm_settings)?;
    let synthesizer = LlmQuerySynthesizer::new(&client);
    let validator = ReadOnlyValidator {
        enforce_table_scope: settings.enforce_table_scope,
    };

    let resolver = Resolver::new(&store, &synthesizer, &validator, settings);
    let resolution = resolver.resolve_in_context(&catalog, &args.context, &args.question);

    let llm_narrator = LlmNarrator::new(&client);
    let narrator: &dyn Narrator = if args.no_narration {
        &FallbackNarrator
    } else {
        &llm_narrator
    };
    emit(&compose(&args.question, &resolution, narrator), args.diagnostics)
}

fn emit(composed: &ComposedResponse, include_diagnostics: bool) -> Result<()> {
    let user = serde_json::to_value(&composed.user).context("failed to encode ask response")?;
    let diagnostics = &composed.diagnostics;

    let mut envelope = match composed.user.status {
        UserStatus::Answered | UserStatus::NoData => QueryEnvelope::ok(COMMAND, user),
        UserStatus::Rejected => {
            let code = diagnostics
                .rejection
                .as_ref()
                .map_or("rejected", RejectionReason::code);
            QueryEnvelope::error(COMMAND, code, composed.user.message.clone()).with_data(user)
        }
        UserStatus::Exhausted => QueryEnvelope::error(
            COMMAND,
            "resolution_exhausted",
            composed.user.message.clone(),
        )
        .with_data(user),
    }
    .with_resolution(ResolutionMeta {
        status: composed.user.status.as_str().to_string(),
        context_id: diagnostics.context_id.clone(),
        plan: diagnostics.plan.as_ref().map(|plan| plan.label().to_string()),
        synthesizer_calls: diagnostics.synthesizer_calls,
        row_count: diagnostics.row_count,
        truncated: diagnostics.truncated,
        diagnostics: if include_diagnostics {
            Some(serde_json::to_value(diagnostics).context("failed to encode diagnostics")?)
        } else {
            None
        },
    });

    if diagnostics.narration_fallback {
        envelope = envelope.with_warning(WarningCode::NarrationFallback);
    }
    if diagnostics.truncated {
        envelope = envelope.with_warning(WarningCode::ResultTruncated);
    }

    match composed.user.status {
        UserStatus::Answered | UserStatus::NoData => envelope.print(),
        UserStatus::Rejected => Err(Error::new(QueryEnvelopeCommandFailure::rejection(envelope))),
        UserStatus::Exhausted => Err(Error::new(QueryEnvelopeCommandFailure::runtime(envelope))),
    }
}
