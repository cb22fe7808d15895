//! Self-Healing Orchestrator
//!
//! Drives the generate -> validate -> execute state machine for the SQL path
//! and the reduce-and-annotate flow for the spec path. Any first-attempt
//! failure (refusal, policy violation, execution error, or deadline expiry)
//! gets exactly one repair cycle; the bound is structural, not conventional.
//! Every terminal state writes one audit record before the caller sees a
//! result, and nothing leaves here as a raw fault.

use crate::audit::{artifact_checksum, AuditRecord, AuditRecorder, RequestSource};
use crate::pipeline::adapters::{ExecutionAdapter, GenerationAdapter};
use crate::pipeline::diff::unified_diff;
use crate::pipeline::types::{
    ArtifactKind, AttemptOutcome, FactoryOutcome, GeneratedArtifact, GenerationAttempt,
    GenerationRequest, JsonRow, Phase, PipelineStatus, QueryOutcome, RepairContext, Violation,
};
use crate::policy::PolicyStore;
use crate::validate::spec::{validate_spec, AppSpec};
use crate::validate::statement::{referenced_tables, validate_statement, RowLimitMode};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The single allowed repair cycle. Never raise this.
pub const MAX_REPAIRS: u32 = 1;

const MAX_ATTEMPTS: u8 = MAX_REPAIRS as u8 + 1;

/// Example intents offered back to the caller when the pipeline cannot answer.
const EXAMPLE_INTENTS: [&str; 3] = [
    "Show total sales amount by region",
    "Top 10 SKUs by quantity on hand",
    "In-transit shipment value by shipping organization",
];

/// Deadlines and validator mode for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct PipelineLimits {
    pub generation_timeout: Duration,
    pub execution_timeout: Duration,
    pub row_limit_mode: RowLimitMode,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(30),
            row_limit_mode: RowLimitMode::Rewrite,
        }
    }
}

/// One top-level request into the pipeline.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub session_id: Uuid,
    pub intent: String,
    pub role: String,
    pub source: RequestSource,
}

/// Pipeline states; terminal ones are `Succeeded`, `Healed`, `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Generated,
    Validating,
    Valid,
    Invalid,
    Executing,
    Succeeded,
    ExecFailed,
    Repairing,
    Healed,
    Failed,
}

/// Why one attempt died; feeds both the repair context and the final message.
enum AttemptFailure {
    Refused(String),
    Generation(String),
    TimedOut(Phase),
    Invalid(Vec<Violation>),
    Execution(String),
}

impl AttemptFailure {
    fn diagnostic(&self) -> String {
        match self {
            AttemptFailure::Refused(reason) => format!("generator refused: {reason}"),
            AttemptFailure::Generation(error) => format!("generation failed: {error}"),
            AttemptFailure::TimedOut(Phase::Generation) => "generation timed out".to_string(),
            AttemptFailure::TimedOut(Phase::Execution) => "execution timed out".to_string(),
            AttemptFailure::Invalid(violations) => violations
                .iter()
                .map(|v| v.reason.clone())
                .collect::<Vec<_>>()
                .join("; "),
            AttemptFailure::Execution(error) => format!("execution failed: {error}"),
        }
    }

    fn friendly_message(&self) -> String {
        match self {
            AttemptFailure::Refused(_) => {
                "I can't answer that safely with the governed tables.".to_string()
            }
            AttemptFailure::Generation(_) | AttemptFailure::TimedOut(Phase::Generation) => {
                "The query generator did not respond in time. Please try again.".to_string()
            }
            AttemptFailure::Invalid(_) => {
                "The generated query was blocked by governance policy.".to_string()
            }
            AttemptFailure::Execution(_) | AttemptFailure::TimedOut(Phase::Execution) => {
                "The query could not be executed against the warehouse.".to_string()
            }
        }
    }
}

struct AttemptSuccess {
    cleaned_sql: String,
    rows: Vec<JsonRow>,
}

/// Drives the whole pipeline. One instance serves many concurrent requests;
/// the only shared state is the read-only policy snapshot each request
/// captures at start.
pub struct Orchestrator {
    policy: Arc<PolicyStore>,
    generator: Arc<dyn GenerationAdapter>,
    executor: Arc<dyn ExecutionAdapter>,
    audit: Arc<AuditRecorder>,
    limits: PipelineLimits,
}

impl Orchestrator {
    pub fn new(
        policy: Arc<PolicyStore>,
        generator: Arc<dyn GenerationAdapter>,
        executor: Arc<dyn ExecutionAdapter>,
        audit: Arc<AuditRecorder>,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            policy,
            generator,
            executor,
            audit,
            limits,
        }
    }

    /// SQL path: generate, validate, execute, repair once on any failure.
    pub async fn run_query(&self, req: QueryRequest) -> QueryOutcome {
        let audit_id = Uuid::new_v4();
        let snapshot = self.policy.snapshot().await;
        let (role_policy, _) = snapshot.role_or_fallback(&req.role);
        let row_cap = snapshot.row_cap(role_policy);
        let schema_context = snapshot.schema_context_text();

        // If this request is cancelled mid-flight, still write a best-effort
        // audit record describing the cancellation as a failure.
        let mut cancel_guard = CancelGuard::arm(self.audit.clone(), &req, audit_id);

        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut repair: Option<RepairContext> = None;
        let mut original_text: Option<String> = None;
        let mut last_candidate: Option<String> = None;
        let mut last_failure: Option<AttemptFailure> = None;

        for attempt_number in 1..=MAX_ATTEMPTS {
            if attempt_number > 1 {
                debug!(session_id = %req.session_id, "state: {:?}", PipelineState::Repairing);
            }
            let request = GenerationRequest {
                intent: req.intent.clone(),
                role: req.role.clone(),
                schema_context: schema_context.clone(),
                kind: ArtifactKind::Sql,
                repair: repair.clone(),
                row_limit: row_cap,
            };

            match self
                .attempt_once(&req, &snapshot, role_policy, &request, attempt_number, &mut attempts)
                .await
            {
                Ok(success) => {
                    let healed = attempt_number > 1;
                    let state = if healed {
                        PipelineState::Healed
                    } else {
                        PipelineState::Succeeded
                    };
                    debug!(session_id = %req.session_id, "state: {state:?}");

                    let repair_diff = if healed {
                        original_text
                            .as_deref()
                            .map(|first| unified_diff(first, &success.cleaned_sql))
                            .filter(|d| !d.is_empty())
                    } else {
                        None
                    };
                    let status = if healed {
                        PipelineStatus::Healed
                    } else {
                        PipelineStatus::Success
                    };
                    let row_count = success.rows.len() as u64;

                    let record = AuditRecord {
                        id: audit_id,
                        session_id: req.session_id,
                        role: req.role.clone(),
                        intent_text: req.intent.clone(),
                        final_artifact_text: success.cleaned_sql.clone(),
                        artifact_checksum: artifact_checksum(&success.cleaned_sql),
                        validated: true,
                        table_accessed: referenced_tables(&success.cleaned_sql)
                            .into_iter()
                            .next(),
                        rows_returned: row_count,
                        was_repaired: healed,
                        repair_diff: repair_diff.clone().unwrap_or_default(),
                        timestamp: Utc::now(),
                        status,
                        source: req.source,
                    };
                    cancel_guard.disarm();
                    self.audit.record(&record).await;

                    info!(
                        session_id = %req.session_id,
                        status = status.as_str(),
                        rows = row_count,
                        "pipeline finished"
                    );
                    return QueryOutcome {
                        status,
                        message: if healed {
                            "Query repaired and executed successfully.".to_string()
                        } else {
                            "Query executed successfully.".to_string()
                        },
                        sql: Some(success.cleaned_sql),
                        rows: Some(success.rows),
                        row_count,
                        was_repaired: healed,
                        repair_diff,
                        violations: Vec::new(),
                        suggestions: Vec::new(),
                        attempts,
                        audit_id,
                    };
                }
                Err((candidate, failure)) => {
                    if candidate.is_some() && original_text.is_none() {
                        original_text = candidate.clone();
                    }
                    if candidate.is_some() {
                        last_candidate = candidate.clone();
                    }
                    if attempt_number < MAX_ATTEMPTS {
                        repair = Some(RepairContext {
                            failed_artifact: candidate.unwrap_or_default(),
                            failure: failure.diagnostic(),
                        });
                        warn!(
                            session_id = %req.session_id,
                            attempt = attempt_number,
                            "attempt failed, entering repair cycle: {}",
                            failure.diagnostic()
                        );
                    }
                    last_failure = Some(failure);
                }
            }
        }

        debug!(session_id = %req.session_id, "state: {:?}", PipelineState::Failed);
        let failure = last_failure.unwrap_or(AttemptFailure::Generation(
            "pipeline produced no attempts".to_string(),
        ));
        let violations = match &failure {
            AttemptFailure::Invalid(violations) => violations.clone(),
            _ => Vec::new(),
        };
        let final_text = last_candidate.unwrap_or_default();

        let record = AuditRecord {
            id: audit_id,
            session_id: req.session_id,
            role: req.role.clone(),
            intent_text: req.intent.clone(),
            final_artifact_text: final_text.clone(),
            artifact_checksum: artifact_checksum(&final_text),
            validated: matches!(failure, AttemptFailure::Execution(_))
                || matches!(failure, AttemptFailure::TimedOut(Phase::Execution)),
            table_accessed: referenced_tables(&final_text).into_iter().next(),
            rows_returned: 0,
            was_repaired: attempts.len() > 1,
            repair_diff: String::new(),
            timestamp: Utc::now(),
            status: PipelineStatus::Failed,
            source: req.source,
        };
        cancel_guard.disarm();
        self.audit.record(&record).await;

        info!(session_id = %req.session_id, status = "failed", "pipeline finished");
        QueryOutcome {
            status: PipelineStatus::Failed,
            message: failure.friendly_message(),
            sql: None,
            rows: None,
            row_count: 0,
            was_repaired: attempts.len() > 1,
            repair_diff: None,
            violations,
            suggestions: EXAMPLE_INTENTS.iter().map(|s| s.to_string()).collect(),
            attempts,
            audit_id,
        }
    }

    /// One pass through GENERATED -> VALIDATING -> EXECUTING. Returns the
    /// candidate text alongside the failure so the repair request can carry it.
    async fn attempt_once(
        &self,
        req: &QueryRequest,
        snapshot: &crate::policy::PolicySnapshot,
        role_policy: &crate::policy::RolePolicy,
        request: &GenerationRequest,
        attempt_number: u8,
        attempts: &mut Vec<GenerationAttempt>,
    ) -> Result<AttemptSuccess, (Option<String>, AttemptFailure)> {
        debug!(session_id = %req.session_id, "state: {:?}", PipelineState::Generated);
        let mut push_attempt = |candidate: Option<String>, outcome: AttemptOutcome| {
            attempts.push(GenerationAttempt {
                intent_text: req.intent.clone(),
                role: req.role.clone(),
                candidate_artifact: candidate,
                attempt_number,
                outcome,
            });
        };

        let generated = match timeout(
            self.limits.generation_timeout,
            self.generator.generate(request),
        )
        .await
        {
            Err(_) => {
                push_attempt(None, AttemptOutcome::TimedOut {
                    phase: Phase::Generation,
                });
                return Err((None, AttemptFailure::TimedOut(Phase::Generation)));
            }
            Ok(Err(e)) => {
                push_attempt(None, AttemptOutcome::GenerationFailed {
                    error: e.to_string(),
                });
                return Err((None, AttemptFailure::Generation(e.to_string())));
            }
            Ok(Ok(output)) => output,
        };

        let candidate = match (&generated.artifact, generated.refused) {
            (_, true) | (None, _) => {
                push_attempt(None, AttemptOutcome::Refused {
                    reason: generated.reason.clone(),
                });
                return Err((None, AttemptFailure::Refused(generated.reason)));
            }
            (Some(GeneratedArtifact::Sql { sql }), false) => sql.clone(),
            (Some(GeneratedArtifact::Spec { .. }), false) => {
                let error = "generator returned an app spec on the SQL path".to_string();
                push_attempt(None, AttemptOutcome::GenerationFailed {
                    error: error.clone(),
                });
                return Err((None, AttemptFailure::Generation(error)));
            }
        };

        debug!(session_id = %req.session_id, "state: {:?}", PipelineState::Validating);
        let result =
            validate_statement(&candidate, snapshot, role_policy, self.limits.row_limit_mode);
        if !result.passed {
            debug!(session_id = %req.session_id, "state: {:?}", PipelineState::Invalid);
            push_attempt(
                Some(candidate.clone()),
                AttemptOutcome::Invalid {
                    violations: result.violations.clone(),
                },
            );
            return Err((
                Some(candidate),
                AttemptFailure::Invalid(result.violations),
            ));
        }
        debug!(session_id = %req.session_id, "state: {:?}", PipelineState::Valid);

        // Only validator-cleaned statements ever reach the executor.
        debug!(session_id = %req.session_id, "state: {:?}", PipelineState::Executing);
        match timeout(
            self.limits.execution_timeout,
            self.executor.execute(&result.cleaned_statement),
        )
        .await
        {
            Err(_) => {
                debug!(session_id = %req.session_id, "state: {:?}", PipelineState::ExecFailed);
                push_attempt(
                    Some(result.cleaned_statement.clone()),
                    AttemptOutcome::TimedOut {
                        phase: Phase::Execution,
                    },
                );
                Err((
                    Some(result.cleaned_statement),
                    AttemptFailure::TimedOut(Phase::Execution),
                ))
            }
            Ok(Err(e)) => {
                debug!(session_id = %req.session_id, "state: {:?}", PipelineState::ExecFailed);
                push_attempt(
                    Some(result.cleaned_statement.clone()),
                    AttemptOutcome::ExecutionFailed {
                        error: e.to_string(),
                    },
                );
                Err((
                    Some(result.cleaned_statement),
                    AttemptFailure::Execution(e.to_string()),
                ))
            }
            Ok(Ok(rows)) => {
                push_attempt(
                    Some(result.cleaned_statement.clone()),
                    AttemptOutcome::Succeeded,
                );
                Ok(AttemptSuccess {
                    cleaned_sql: result.cleaned_statement,
                    rows,
                })
            }
        }
    }

    /// Spec path: generate once, reduce against policy, annotate. No retry;
    /// a partially satisfiable spec is returned instead of a failure.
    pub async fn run_factory(&self, req: QueryRequest) -> FactoryOutcome {
        let audit_id = Uuid::new_v4();
        let snapshot = self.policy.snapshot().await;
        let (role_policy, _) = snapshot.role_or_fallback(&req.role);
        let row_cap = snapshot.row_cap(role_policy);

        // Same cancellation posture as the SQL path: a request dropped
        // mid-generate still leaves an audit trace.
        let mut cancel_guard = CancelGuard::arm(self.audit.clone(), &req, audit_id);

        let request = GenerationRequest {
            intent: req.intent.clone(),
            role: req.role.clone(),
            schema_context: snapshot.schema_context_text(),
            kind: ArtifactKind::Spec,
            repair: None,
            row_limit: row_cap,
        };

        let failure_reason = match timeout(
            self.limits.generation_timeout,
            self.generator.generate(&request),
        )
        .await
        {
            Err(_) => Some("spec generation timed out".to_string()),
            Ok(Err(e)) => Some(e.to_string()),
            Ok(Ok(output)) => match (output.artifact, output.refused) {
                (_, true) | (None, false) => Some(output.reason),
                (Some(GeneratedArtifact::Sql { .. }), false) => {
                    Some("generator returned SQL on the spec path".to_string())
                }
                (Some(GeneratedArtifact::Spec { spec }), false) => {
                    let (cleaned, violations) = validate_spec(&spec, &req.role, &snapshot);
                    let spec_json = serde_json::to_string_pretty(&cleaned).unwrap_or_default();
                    let record = AuditRecord {
                        id: audit_id,
                        session_id: req.session_id,
                        role: req.role.clone(),
                        intent_text: req.intent.clone(),
                        final_artifact_text: spec_json.clone(),
                        artifact_checksum: artifact_checksum(&spec_json),
                        validated: true,
                        table_accessed: cleaned.tables.first().cloned(),
                        rows_returned: 0,
                        was_repaired: false,
                        repair_diff: String::new(),
                        timestamp: Utc::now(),
                        status: PipelineStatus::Success,
                        source: req.source,
                    };
                    cancel_guard.disarm();
                    self.audit.record(&record).await;

                    let message = if violations.is_empty() {
                        "App spec generated.".to_string()
                    } else {
                        format!(
                            "App spec generated; {} request(s) were filtered by governance.",
                            violations.len()
                        )
                    };
                    info!(session_id = %req.session_id, filtered = violations.len(), "factory finished");
                    return FactoryOutcome {
                        status: PipelineStatus::Success,
                        message,
                        spec: cleaned,
                        violations,
                        audit_id,
                    };
                }
            },
        };

        let reason = failure_reason.unwrap_or_default();
        let record = AuditRecord {
            id: audit_id,
            session_id: req.session_id,
            role: req.role.clone(),
            intent_text: req.intent.clone(),
            final_artifact_text: String::new(),
            artifact_checksum: artifact_checksum(""),
            validated: false,
            table_accessed: None,
            rows_returned: 0,
            was_repaired: false,
            repair_diff: String::new(),
            timestamp: Utc::now(),
            status: PipelineStatus::Failed,
            source: req.source,
        };
        cancel_guard.disarm();
        self.audit.record(&record).await;

        warn!(session_id = %req.session_id, "factory failed: {reason}");
        FactoryOutcome {
            status: PipelineStatus::Failed,
            message: format!("Could not generate an app spec: {reason}"),
            spec: AppSpec::default(),
            violations: Vec::new(),
            audit_id,
        }
    }
}

/// Best-effort audit on cancellation: if the request future is dropped before
/// a terminal state, spawn a write describing the cancellation as a failure.
struct CancelGuard {
    recorder: Arc<AuditRecorder>,
    record: Option<AuditRecord>,
}

impl CancelGuard {
    fn arm(recorder: Arc<AuditRecorder>, req: &QueryRequest, audit_id: Uuid) -> Self {
        Self {
            recorder,
            record: Some(AuditRecord {
                id: audit_id,
                session_id: req.session_id,
                role: req.role.clone(),
                intent_text: req.intent.clone(),
                final_artifact_text: String::new(),
                artifact_checksum: artifact_checksum(""),
                validated: false,
                table_accessed: None,
                rows_returned: 0,
                was_repaired: false,
                repair_diff: String::new(),
                timestamp: Utc::now(),
                status: PipelineStatus::Failed,
                source: req.source,
            }),
        }
    }

    fn disarm(&mut self) {
        self.record = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.timestamp = Utc::now();
            let recorder = self.recorder.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    recorder.record(&record).await;
                });
            }
        }
    }
}
