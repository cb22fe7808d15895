//! Pipeline data model: attempts, validation results, execution results, and
//! the typed failure taxonomy the orchestrator converts everything into.

use crate::validate::spec::AppSpec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single decoded result row, column name to JSON value.
pub type JsonRow = serde_json::Map<String, serde_json::Value>;

/// Which kind of artifact a generation call is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Sql,
    Spec,
}

/// The untrusted artifact a generation adapter produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeneratedArtifact {
    Sql { sql: String },
    Spec { spec: AppSpec },
}

impl GeneratedArtifact {
    /// Display form used for repair context, diffs, and audit records.
    pub fn as_text(&self) -> String {
        match self {
            GeneratedArtifact::Sql { sql } => sql.clone(),
            GeneratedArtifact::Spec { spec } => {
                serde_json::to_string_pretty(spec).unwrap_or_default()
            }
        }
    }
}

/// Everything a generation adapter needs to produce (or repair) an artifact.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub intent: String,
    pub role: String,
    pub schema_context: String,
    pub kind: ArtifactKind,
    pub repair: Option<RepairContext>,
    /// Row cap the generated statement should respect.
    pub row_limit: u32,
}

/// Diagnostic context for the single repair call: the artifact that failed and
/// why. The orchestrator never edits the artifact itself.
#[derive(Debug, Clone)]
pub struct RepairContext {
    pub failed_artifact: String,
    pub failure: String,
}

/// What a generation adapter hands back. `refused` means the generator
/// declares it cannot safely answer; `artifact` is absent in that case.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub artifact: Option<GeneratedArtifact>,
    pub refused: bool,
    pub reason: String,
}

impl GenerationOutput {
    pub fn refusal(reason: impl Into<String>) -> Self {
        Self {
            artifact: None,
            refused: true,
            reason: reason.into(),
        }
    }

    pub fn sql(sql: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            artifact: Some(GeneratedArtifact::Sql { sql: sql.into() }),
            refused: false,
            reason: reason.into(),
        }
    }

    pub fn spec(spec: AppSpec, reason: impl Into<String>) -> Self {
        Self {
            artifact: Some(GeneratedArtifact::Spec { spec }),
            refused: false,
            reason: reason.into(),
        }
    }
}

/// Why a statement or spec field was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCause {
    EmptyStatement,
    NotReadOnly,
    BannedPattern,
    TableNotAllowed,
    RowLimitExceeded,
    ChartNotAllowed,
    UnknownRole,
    OperationNotAllowed,
    PiiColumnNotAllowed,
}

/// A single reason an artifact failed validation, attached to the offending
/// field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub field: String,
    pub cause: ViolationCause,
    pub reason: String,
}

impl Violation {
    pub fn new(
        field: impl Into<String>,
        cause: ViolationCause,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            cause,
            reason: reason.into(),
        }
    }
}

/// Outcome of the statement validator. Pure data, no side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub passed: bool,
    pub cleaned_statement: String,
    pub violations: Vec<Violation>,
}

/// Terminal status of one top-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Success,
    Healed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "success",
            PipelineStatus::Healed => "healed",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PipelineStatus::Success),
            "healed" => Ok(PipelineStatus::Healed),
            "failed" => Ok(PipelineStatus::Failed),
            other => Err(format!("unknown pipeline status '{other}'")),
        }
    }
}

/// The phase a deadline expired in. Timeouts fold into that phase's failure
/// mode and consume the same single repair budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generation,
    Execution,
}

/// How one generation attempt ended; kept per request for audit detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Refused { reason: String },
    GenerationFailed { error: String },
    Invalid { violations: Vec<Violation> },
    ExecutionFailed { error: String },
    TimedOut { phase: Phase },
}

/// One pass through generate -> validate -> execute. `attempt_number` is 1 for
/// the original pass and 2 for the single repair pass; nothing ever issues a
/// third.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAttempt {
    pub intent_text: String,
    pub role: String,
    pub candidate_artifact: Option<String>,
    pub attempt_number: u8,
    pub outcome: AttemptOutcome,
}

/// Caller-safe result of the SQL path. Every terminal state maps onto this;
/// raw faults never leave the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub status: PipelineStatus,
    pub message: String,
    pub sql: Option<String>,
    pub rows: Option<Vec<JsonRow>>,
    pub row_count: u64,
    pub was_repaired: bool,
    pub repair_diff: Option<String>,
    pub violations: Vec<Violation>,
    /// Example intents offered when the pipeline could not answer.
    pub suggestions: Vec<String>,
    pub attempts: Vec<GenerationAttempt>,
    pub audit_id: Uuid,
}

/// Caller-safe result of the factory (app-spec) path. The spec path never
/// retries; it degrades to a reduced spec plus the violation list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryOutcome {
    pub status: PipelineStatus,
    pub message: String,
    pub spec: AppSpec,
    pub violations: Vec<Violation>,
    pub audit_id: Uuid,
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("generation adapter failed: {0}")]
    Adapter(String),
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("{0}")]
    Failed(String),
}
