pub mod query_envelope;
pub mod resolution;
pub mod scope;

pub use query_envelope::{
    CommandFailureClass, EnvelopeMeta, QUERY_ENVELOPE_SCHEMA_VERSION, QueryEnvelope,
    QueryEnvelopeCommandFailure, QueryEnvelopeError, QueryEnvelopeWarning, ResolutionMeta,
    WarningCode,
};
pub use resolution::{
    AttemptExecution, AttemptValidation, Candidate, EntryPoint, QueryPlan, RejectionReason,
    Resolution, ResolutionAttempt, ResolutionOutcome, ResolverState, ResultSet, Row,
};
pub use scope::{MetricDefinition, PermissionScope};
