use std::time::Instant;

use crate::config::ResolverSettings;
use crate::introspect;
use crate::models::{
    AttemptExecution, AttemptValidation, Candidate, EntryPoint, PermissionScope, QueryPlan,
    RejectionReason, Resolution, ResolutionAttempt, ResolutionOutcome, ResolverState, ResultSet,
};
use crate::scope::ScopeProvider;
use crate::store::{DataStore, ExecutionError, TableAccess};
use crate::synth::QuerySynthesizer;
use crate::utils::time::elapsed_ms;
use crate::validate::SafetyValidator;

/// Picks the query plan once per request: a predefined metric when the
/// question names one the scope allows, otherwise free-form synthesis.
#[must_use]
pub fn plan_query(
    question: &str,
    scope: &PermissionScope,
    provider: &dyn ScopeProvider,
) -> QueryPlan {
    provider
        .metrics()
        .into_iter()
        .find(|metric| scope.allows_metric(&metric.name) && metric.matches_question(question))
        .map_or(QueryPlan::Synthesized, |metric| QueryPlan::Predefined {
            metric: metric.name,
            sql: metric.sql,
        })
}

/// The execution and retry controller. Attempts run strictly in sequence;
/// nothing is shared between them except the last execution failure fed to
/// `repair`.
pub struct Resolver<'a> {
    store: &'a dyn DataStore,
    synthesizer: &'a dyn QuerySynthesizer,
    validator: &'a dyn SafetyValidator,
    settings: ResolverSettings,
}

impl<'a> Resolver<'a> {
    pub fn new(
        store: &'a dyn DataStore,
        synthesizer: &'a dyn QuerySynthesizer,
        validator: &'a dyn SafetyValidator,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            store,
            synthesizer,
            validator,
            settings,
        }
    }

    /// Looks up the scope for `context_id` and routes the question. An
    /// unknown context is refused before anything touches the database.
    pub fn resolve_in_context(
        &self,
        provider: &dyn ScopeProvider,
        context_id: &str,
        question: &str,
    ) -> Resolution {
        let Some(scope) = provider.scope_for(context_id) else {
            tracing::warn!(context_id, "no permission scope registered; refusing request");
            return Resolution::rejected_before_planning(
                context_id,
                RejectionReason::ScopeUnavailable {
                    context_id: context_id.to_string(),
                },
            );
        };

        match plan_query(question, &scope, provider) {
            QueryPlan::Predefined { metric, sql } => self.run_predefined(&scope, metric, sql),
            QueryPlan::Synthesized => self.resolve(question, &scope),
        }
    }

    pub fn resolve(&self, question: &str, scope: &PermissionScope) -> Resolution {
        if scope.allowed_tables.is_empty() {
            return Resolution::rejected_before_planning(
                &scope.context_id,
                RejectionReason::EmptyScope {
                    context_id: scope.context_id.clone(),
                },
            );
        }

        let mut run = RunLog::new(&scope.context_id, QueryPlan::Synthesized);
        let schema = match introspect::describe(self.store, scope) {
            Ok(schema) => schema,
            Err(error) => {
                tracing::error!(
                    context_id = %scope.context_id,
                    error = %format!("{error:#}"),
                    "schema introspection failed"
                );
                return run.exhausted(format!("schema introspection failed: {error:#}"));
            }
        };

        let max_retries = self.settings.max_retries;
        let mut last_error = None::<String>;
        let mut last_execution_failure = None::<(String, String)>;

        for attempt_index in 0..=max_retries {
            let started = Instant::now();
            run.enter(ResolverState::Synthesizing);
            let (entry_point, synthesized) = match &last_execution_failure {
                Some((failed_sql, error_message)) => (
                    EntryPoint::Repair,
                    self.synthesizer
                        .repair(question, failed_sql, error_message, &schema),
                ),
                None => (
                    EntryPoint::Synthesize,
                    self.synthesizer.synthesize(question, &schema, scope),
                ),
            };
            run.synthesizer_calls += 1;
            tracing::info!(
                context_id = %scope.context_id,
                attempt = attempt_index,
                entry_point = ?entry_point,
                "candidate requested"
            );

            let candidate = match synthesized {
                Ok(candidate) => candidate,
                Err(error) => {
                    let message = error.to_string();
                    tracing::warn!(
                        attempt = attempt_index,
                        entry_point = ?entry_point,
                        duration_ms = elapsed_ms(started),
                        error = %message,
                        "synthesis failed"
                    );
                    run.attempts.push(ResolutionAttempt {
                        attempt_index,
                        entry_point,
                        candidate: None,
                        synthesis_error: Some(message.clone()),
                        validation: None,
                        execution: AttemptExecution::NotAttempted,
                        duration_ms: elapsed_ms(started),
                    });
                    last_error = Some(message);
                    if attempt_index < max_retries {
                        run.enter(ResolverState::Retrying);
                    }
                    continue;
                }
            };

            run.enter(ResolverState::Validating);
            if let Err(reason) = self.validate_candidate(&candidate, scope) {
                tracing::warn!(
                    attempt = attempt_index,
                    entry_point = ?entry_point,
                    duration_ms = elapsed_ms(started),
                    reason = reason.code(),
                    "candidate rejected; not executing"
                );
                run.attempts.push(ResolutionAttempt {
                    attempt_index,
                    entry_point,
                    candidate: Some(candidate),
                    synthesis_error: None,
                    validation: Some(AttemptValidation::Rejected {
                        reason: reason.clone(),
                    }),
                    execution: AttemptExecution::NotAttempted,
                    duration_ms: elapsed_ms(started),
                });
                return run.rejected(reason);
            }

            run.enter(ResolverState::Executing);
            run.executions += 1;
            match self.execute(&candidate.sql, scope) {
                Ok(rows) => {
                    tracing::info!(
                        attempt = attempt_index,
                        entry_point = ?entry_point,
                        duration_ms = elapsed_ms(started),
                        row_count = rows.len(),
                        truncated = rows.truncated,
                        "candidate executed"
                    );
                    run.attempts.push(ResolutionAttempt {
                        attempt_index,
                        entry_point,
                        candidate: Some(candidate.clone()),
                        synthesis_error: None,
                        validation: Some(AttemptValidation::Passed),
                        execution: AttemptExecution::Succeeded {
                            row_count: rows.len(),
                        },
                        duration_ms: elapsed_ms(started),
                    });
                    return run.succeeded(candidate, rows);
                }
                Err(error) => {
                    tracing::warn!(
                        attempt = attempt_index,
                        entry_point = ?entry_point,
                        duration_ms = elapsed_ms(started),
                        error = %error,
                        "execution failed"
                    );
                    run.attempts.push(ResolutionAttempt {
                        attempt_index,
                        entry_point,
                        candidate: Some(candidate.clone()),
                        synthesis_error: None,
                        validation: Some(AttemptValidation::Passed),
                        execution: AttemptExecution::Failed {
                            error: error.message.clone(),
                        },
                        duration_ms: elapsed_ms(started),
                    });
                    if let Some(table) = error.denied_table {
                        return run.rejected(RejectionReason::OutOfScopeTable { table });
                    }
                    last_error = Some(error.message.clone());
                    last_execution_failure = Some((candidate.sql, error.message));
                    if attempt_index < max_retries {
                        run.enter(ResolverState::Retrying);
                    }
                }
            }
        }

        run.exhausted(last_error.unwrap_or_else(|| "no attempt produced a result".to_string()))
    }

    fn run_predefined(&self, scope: &PermissionScope, metric: String, sql: String) -> Resolution {
        let mut run = RunLog::new(
            &scope.context_id,
            QueryPlan::Predefined {
                metric: metric.clone(),
                sql: sql.clone(),
            },
        );
        let started = Instant::now();
        let candidate = Candidate::new(sql, format!("Predefined metric `{metric}`"));

        run.enter(ResolverState::Validating);
        if let Err(reason) = self.validate_candidate(&candidate, scope) {
            tracing::warn!(metric = %metric, reason = reason.code(), "predefined metric rejected");
            run.attempts.push(ResolutionAttempt {
                attempt_index: 0,
                entry_point: EntryPoint::Predefined,
                candidate: Some(candidate),
                synthesis_error: None,
                validation: Some(AttemptValidation::Rejected {
                    reason: reason.clone(),
                }),
                execution: AttemptExecution::NotAttempted,
                duration_ms: elapsed_ms(started),
            });
            return run.rejected(reason);
        }

        run.enter(ResolverState::Executing);
        run.executions += 1;
        let executed = self.execute(&candidate.sql, scope);
        let execution = match &executed {
            Ok(rows) => AttemptExecution::Succeeded {
                row_count: rows.len(),
            },
            Err(error) => AttemptExecution::Failed {
                error: error.message.clone(),
            },
        };
        run.attempts.push(ResolutionAttempt {
            attempt_index: 0,
            entry_point: EntryPoint::Predefined,
            candidate: Some(candidate.clone()),
            synthesis_error: None,
            validation: Some(AttemptValidation::Passed),
            execution,
            duration_ms: elapsed_ms(started),
        });

        match executed {
            Ok(rows) => run.succeeded(candidate, rows),
            Err(ExecutionError {
                denied_table: Some(table),
                ..
            }) => run.rejected(RejectionReason::OutOfScopeTable { table }),
            Err(error) => {
                tracing::warn!(metric = %metric, error = %error, "predefined metric failed");
                run.exhausted(error.message)
            }
        }
    }

    /// The store enforces table scope again while the statement runs, unless
    /// scoping is switched off.
    fn execute(&self, sql: &str, scope: &PermissionScope) -> Result<ResultSet, ExecutionError> {
        let access = if self.settings.enforce_table_scope {
            TableAccess::Scoped(scope)
        } else {
            TableAccess::Unrestricted
        };
        self.store.execute(sql, access, self.settings.row_cap)
    }

    /// The validator runs first and is the real boundary. A candidate the
    /// synthesizer itself marked unsafe is refused as well.
    fn validate_candidate(
        &self,
        candidate: &Candidate,
        scope: &PermissionScope,
    ) -> Result<(), RejectionReason> {
        self.validator
            .check(&candidate.sql, scope)
            .map_err(|violation| violation.rejection_reason())?;
        if !candidate.claimed_safe {
            return Err(RejectionReason::DeclinedBySynthesizer {
                explanation: candidate.explanation.clone(),
            });
        }
        Ok(())
    }
}

struct RunLog {
    context_id: String,
    plan: QueryPlan,
    attempts: Vec<ResolutionAttempt>,
    state_trace: Vec<ResolverState>,
    synthesizer_calls: usize,
    executions: usize,
}

impl RunLog {
    fn new(context_id: &str, plan: QueryPlan) -> Self {
        Self {
            context_id: context_id.to_string(),
            plan,
            attempts: Vec::new(),
            state_trace: Vec::new(),
            synthesizer_calls: 0,
            executions: 0,
        }
    }

    fn enter(&mut self, state: ResolverState) {
        tracing::debug!(context_id = %self.context_id, state = ?state, "resolver state");
        self.state_trace.push(state);
    }

    fn succeeded(mut self, candidate: Candidate, rows: ResultSet) -> Resolution {
        self.enter(ResolverState::Succeeded);
        self.finish(ResolutionOutcome::Succeeded {
            sql: candidate.sql,
            explanation: candidate.explanation,
            rows,
        })
    }

    fn rejected(mut self, reason: RejectionReason) -> Resolution {
        self.enter(ResolverState::Rejected);
        self.finish(ResolutionOutcome::Rejected { reason })
    }

    fn exhausted(mut self, last_error: String) -> Resolution {
        self.enter(ResolverState::Exhausted);
        self.finish(ResolutionOutcome::Exhausted { last_error })
    }

    fn finish(self, outcome: ResolutionOutcome) -> Resolution {
        tracing::info!(
            context_id = %self.context_id,
            outcome = outcome.status(),
            synthesizer_calls = self.synthesizer_calls,
            executions = self.executions,
            "resolution finished"
        );
        Resolution {
            context_id: self.context_id,
            plan: Some(self.plan),
            outcome,
            attempts: self.attempts,
            state_trace: self.state_trace,
            synthesizer_calls: self.synthesizer_calls,
            executions: self.executions,
        }
    }
}
