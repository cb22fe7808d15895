//! Generation and execution adapters.
//!
//! The orchestrator is agnostic to which generator produced an artifact: the
//! deterministic keyword engine and a scripted stand-in for a model-backed
//! generator implement the same capability trait. Generators never execute
//! anything; executors only ever see statements the validator passed.

use crate::pipeline::types::{
    ArtifactKind, ExecutionError, GenerationError, GenerationOutput, GenerationRequest, JsonRow,
};
use crate::policy::PolicyDocument;
use crate::validate::spec::AppSpec;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use tokio_postgres::types::Type;

/// Produces a candidate artifact from natural-language intent. Pure producer.
#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
        -> Result<GenerationOutput, GenerationError>;
}

/// Runs a validated statement against the data source.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<JsonRow>, ExecutionError>;
}

// =============================================================================
// NATIVE GENERATOR
// =============================================================================

/// Deterministic NL-to-SQL engine over the governed schema: scores tables by
/// keyword overlap with the intent and emits an explicit-projection SELECT.
/// No model involved, so it refuses anything it cannot match.
pub struct NativeSqlGenerator {
    /// table -> columns, from the guardrail document's schema section.
    tables: BTreeMap<String, Vec<String>>,
    /// Columns that never make it into a projection.
    pii_columns: BTreeSet<String>,
}

impl NativeSqlGenerator {
    pub fn from_policy(document: &PolicyDocument) -> Self {
        Self {
            tables: document.schema.clone(),
            pii_columns: document.pii_columns.clone(),
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect()
    }

    fn score(table: &str, columns: &[String], tokens: &[String]) -> usize {
        let mut score = 0;
        // the unqualified table name weighs more than a column hit
        let short = table.rsplit('.').next().unwrap_or(table).to_lowercase();
        if tokens.iter().any(|t| short.contains(t.as_str()) || t.contains(&short)) {
            score += 2;
        }
        for column in columns {
            let column = column.to_lowercase();
            if tokens.iter().any(|t| column.contains(t.as_str())) {
                score += 1;
            }
        }
        score
    }

    fn pick_table(&self, request: &GenerationRequest) -> Option<(&String, &Vec<String>)> {
        let tokens = Self::tokens(&request.intent);
        self.tables
            .iter()
            .filter(|(table, _)| {
                // on repair, skip any table the failure text already named
                request
                    .repair
                    .as_ref()
                    .map_or(true, |r| !r.failure.contains(table.as_str()))
            })
            .map(|(table, columns)| (table, columns, Self::score(table, columns, &tokens)))
            .filter(|(_, _, score)| *score > 0)
            .max_by_key(|(table, _, score)| (*score, std::cmp::Reverse(table.as_str())))
            .map(|(table, columns, _)| (table, columns))
    }
}

#[async_trait]
impl GenerationAdapter for NativeSqlGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, GenerationError> {
        match request.kind {
            ArtifactKind::Sql => {
                let Some((table, columns)) = self.pick_table(request) else {
                    return Ok(GenerationOutput::refusal(
                        "none of the governed tables match the question",
                    ));
                };
                let projected: Vec<String> = columns
                    .iter()
                    .filter(|c| !self.pii_columns.contains(*c))
                    .cloned()
                    .collect();
                if projected.is_empty() {
                    return Ok(GenerationOutput::refusal(format!(
                        "every column of {table} is masked as PII"
                    )));
                }
                let sql = format!(
                    "SELECT {} FROM {} LIMIT {}",
                    projected.join(", "),
                    table,
                    request.row_limit
                );
                Ok(GenerationOutput::sql(
                    sql,
                    format!("keyword match against {table}"),
                ))
            }
            ArtifactKind::Spec => {
                let tokens = Self::tokens(&request.intent);
                let tables: Vec<String> = self
                    .tables
                    .iter()
                    .filter(|(table, columns)| Self::score(table, columns, &tokens) > 0)
                    .map(|(table, _)| table.clone())
                    .collect();
                if tables.is_empty() {
                    return Ok(GenerationOutput::refusal(
                        "no governed table matches the requested application",
                    ));
                }
                let spec = AppSpec {
                    domain: "general".to_string(),
                    tables,
                    kpis: vec!["Total Count".to_string()],
                    filters: vec!["region".to_string()],
                    charts: vec!["bar".to_string(), "line".to_string()],
                    chatbot: request.intent.to_lowercase().contains("chat"),
                };
                Ok(GenerationOutput::spec(spec, "keyword-matched app spec"))
            }
        }
    }
}

// =============================================================================
// SCRIPTED GENERATOR
// =============================================================================

/// Replays a fixed sequence of generation outputs. Stands in for the
/// model-backed generator in tests and demos; the orchestrator cannot tell
/// the difference.
pub struct ScriptedGenerator {
    outputs: Mutex<VecDeque<Result<GenerationOutput, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(outputs: Vec<Result<GenerationOutput, GenerationError>>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request this generator has seen, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl GenerationAdapter for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, GenerationError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.outputs
            .lock()
            .expect("outputs lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(GenerationError::Adapter(
                    "scripted generator exhausted".to_string(),
                ))
            })
    }
}

// =============================================================================
// EXECUTORS
// =============================================================================

/// Executes validated statements against Postgres and decodes rows to JSON.
pub struct PostgresExecutor {
    pool: Pool,
}

impl PostgresExecutor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionAdapter for PostgresExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<JsonRow>, ExecutionError> {
        let client = self.pool.get().await?;
        let rows = client.query(sql, &[]).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

fn row_to_json(row: &tokio_postgres::Row) -> JsonRow {
    let mut out = JsonRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx).ok().flatten().map(Value::from)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx).ok().flatten().map(Value::from)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx).ok().flatten().map(Value::from)
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx).ok().flatten().map(Value::from)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx).ok().flatten().map(Value::from)
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx).ok().flatten().map(Value::from)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<Value>>(idx).ok().flatten()
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .ok()
                .flatten()
                .map(|ts| Value::from(ts.to_rfc3339()))
        } else if *ty == Type::UUID {
            row.try_get::<_, Option<uuid::Uuid>>(idx)
                .ok()
                .flatten()
                .map(|u| Value::from(u.to_string()))
        } else {
            row.try_get::<_, Option<String>>(idx).ok().flatten().map(Value::from)
        };
        out.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    out
}

/// Replays fixed execution results; the test-side execution backend.
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<Result<Vec<JsonRow>, ExecutionError>>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<Result<Vec<JsonRow>, ExecutionError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Every statement this executor was asked to run, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }
}

#[async_trait]
impl ExecutionAdapter for ScriptedExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<JsonRow>, ExecutionError> {
        self.executed
            .lock()
            .expect("executed lock")
            .push(sql.to_string());
        self.results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ExecutionError::Failed(
                    "no scripted execution result remaining".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::model::tests::{GUARDRAILS_YAML, ROLES_YAML};
    use crate::policy::PolicySnapshot;

    fn sql_request(intent: &str) -> GenerationRequest {
        GenerationRequest {
            intent: intent.to_string(),
            role: "analyst".to_string(),
            schema_context: String::new(),
            kind: ArtifactKind::Sql,
            repair: None,
            row_limit: 5000,
        }
    }

    fn generator() -> NativeSqlGenerator {
        let snap = PolicySnapshot::from_yaml(GUARDRAILS_YAML, ROLES_YAML).unwrap();
        NativeSqlGenerator::from_policy(&snap.document)
    }

    #[tokio::test]
    async fn native_generator_matches_a_table_by_keyword() {
        let out = generator()
            .generate(&sql_request("show inventory quantity on hand"))
            .await
            .unwrap();
        assert!(!out.refused);
        let text = out.artifact.unwrap().as_text();
        assert!(text.contains("FROM governed.inventory"));
        assert!(text.ends_with("LIMIT 5000"));
        assert!(!text.contains('*'));
    }

    #[tokio::test]
    async fn native_generator_never_projects_pii_columns() {
        let guardrails =
            GUARDRAILS_YAML.replace("    - store_id", "    - store_id\n    - regional_manager");
        let snap = PolicySnapshot::from_yaml(&guardrails, ROLES_YAML).unwrap();
        let out = NativeSqlGenerator::from_policy(&snap.document)
            .generate(&sql_request("sales amount by region"))
            .await
            .unwrap();
        assert!(!out.refused);
        let text = out.artifact.unwrap().as_text();
        assert!(text.contains("store_id"));
        assert!(!text.contains("regional_manager"));
    }

    #[tokio::test]
    async fn native_generator_refuses_unmatched_intents() {
        let out = generator()
            .generate(&sql_request("what is the meaning of life"))
            .await
            .unwrap();
        assert!(out.refused);
        assert!(out.artifact.is_none());
    }

    #[tokio::test]
    async fn native_generator_avoids_tables_named_in_repair_context() {
        let mut request = sql_request("sales and inventory by region");
        request.repair = Some(crate::pipeline::types::RepairContext {
            failed_artifact: "SELECT ... FROM governed.sales".to_string(),
            failure: "the invoking role has no access to table 'governed.sales'".to_string(),
        });
        let out = generator().generate(&request).await.unwrap();
        assert!(!out.refused);
        let text = out.artifact.unwrap().as_text();
        assert!(!text.contains("governed.sales"));
    }

    #[tokio::test]
    async fn scripted_generator_replays_then_errors() {
        let gen = ScriptedGenerator::new(vec![Ok(GenerationOutput::sql("SELECT 1", "ok"))]);
        assert!(gen.generate(&sql_request("x")).await.is_ok());
        assert!(gen.generate(&sql_request("y")).await.is_err());
        assert_eq!(gen.requests().len(), 2);
    }
}
