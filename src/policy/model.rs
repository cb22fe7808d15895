//! Policy documents
//!
//! Guardrails apply to everyone; role policies overlay per-role allow-lists and
//! quotas. Both are parsed from YAML into an immutable `PolicySnapshot`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// The role every unrecognized caller is downgraded to.
pub const FALLBACK_ROLE: &str = "viewer";

#[derive(Error, Debug)]
pub enum PolicyLoadError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid policy: {0}")]
    Invalid(String),

    #[error("banned pattern '{pattern}' does not compile: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Process-wide guardrails, enforced independent of role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Exact set of governed tables statements may reference.
    pub allowed_tables: BTreeSet<String>,
    /// Ordered, case-insensitive patterns that make a statement unsafe.
    pub banned_patterns: Vec<String>,
    /// Hard cap on rows any statement may return.
    pub max_rows_returned: u32,
    #[serde(default)]
    pub pii_columns: BTreeSet<String>,
    #[serde(default)]
    pub allowed_chart_types: BTreeSet<String>,
    /// Optional column listing per governed table, fed to the generation
    /// adapter as schema context.
    #[serde(default)]
    pub schema: BTreeMap<String, Vec<String>>,
}

/// Which tables a role may touch. `All` is the only wildcard; everything else
/// is exact set membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TableScope {
    All(String),
    Only(BTreeSet<String>),
}

impl TableScope {
    pub fn allows(&self, table: &str) -> bool {
        match self {
            TableScope::All(_) => true,
            TableScope::Only(tables) => tables.contains(table),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, TableScope::All(_))
    }
}

impl<'de> Deserialize<'de> for TableScope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Word(String),
            List(BTreeSet<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Word(w) if w == "all" => Ok(TableScope::All(w)),
            Raw::Word(w) => Err(D::Error::custom(format!(
                "allowed_tables must be a list or the literal \"all\", got \"{w}\""
            ))),
            Raw::List(tables) => Ok(TableScope::Only(tables)),
        }
    }
}

/// Per-role allow-list and quota overlaid on top of the guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePolicy {
    pub allowed_tables: TableScope,
    pub allowed_operations: BTreeSet<String>,
    pub max_rows: u32,
    pub can_see_unmasked_pii: bool,
}

/// A compiled banned pattern, kept alongside its raw form for violation text.
#[derive(Debug, Clone)]
pub struct BannedPattern {
    pub raw: String,
    pub regex: Regex,
}

/// One immutable view of the whole policy. Requests capture an `Arc` of this
/// at start and keep it for their lifetime; reload never mutates in place.
#[derive(Debug)]
pub struct PolicySnapshot {
    pub document: PolicyDocument,
    pub roles: BTreeMap<String, RolePolicy>,
    banned: Vec<BannedPattern>,
    pii: Vec<BannedPattern>,
}

impl PolicySnapshot {
    /// Build a snapshot from already-parsed documents, validating shape.
    pub fn new(
        document: PolicyDocument,
        roles: BTreeMap<String, RolePolicy>,
    ) -> Result<Self, PolicyLoadError> {
        if document.max_rows_returned == 0 {
            return Err(PolicyLoadError::Invalid(
                "max_rows_returned must be a positive integer".to_string(),
            ));
        }
        if document.allowed_tables.is_empty() {
            return Err(PolicyLoadError::Invalid(
                "allowed_tables must not be empty".to_string(),
            ));
        }
        if !roles.contains_key(FALLBACK_ROLE) {
            return Err(PolicyLoadError::Invalid(format!(
                "role policy must define the '{FALLBACK_ROLE}' fallback role"
            )));
        }
        for (name, role) in &roles {
            if role.max_rows == 0 {
                return Err(PolicyLoadError::Invalid(format!(
                    "role '{name}' has max_rows = 0"
                )));
            }
        }

        let banned = document
            .banned_patterns
            .iter()
            .map(|raw| {
                compile_pattern(raw).map(|regex| BannedPattern {
                    raw: raw.clone(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pii = document
            .pii_columns
            .iter()
            .map(|raw| {
                compile_pattern(raw).map(|regex| BannedPattern {
                    raw: raw.clone(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            document,
            roles,
            banned,
            pii,
        })
    }

    /// Parse guardrails and roles YAML text into a snapshot.
    pub fn from_yaml(guardrails: &str, roles: &str) -> Result<Self, PolicyLoadError> {
        let document: PolicyDocument =
            serde_yaml::from_str(guardrails).map_err(|source| PolicyLoadError::Parse {
                path: "guardrails".to_string(),
                source,
            })?;
        let roles: BTreeMap<String, RolePolicy> =
            serde_yaml::from_str(roles).map_err(|source| PolicyLoadError::Parse {
                path: "roles".to_string(),
                source,
            })?;
        Self::new(document, roles)
    }

    pub fn banned_patterns(&self) -> &[BannedPattern] {
        &self.banned
    }

    /// Compiled word-boundary matchers for the PII column names.
    pub fn pii_patterns(&self) -> &[BannedPattern] {
        &self.pii
    }

    /// Resolve a role name, falling back to `viewer` for anything unknown.
    /// Returns the policy and whether a downgrade happened.
    pub fn role_or_fallback(&self, name: &str) -> (&RolePolicy, bool) {
        match self.roles.get(name) {
            Some(role) => (role, false),
            // new() guarantees the fallback role exists
            None => (&self.roles[FALLBACK_ROLE], true),
        }
    }

    /// Effective row cap for a role: the tighter of guardrail and role quota.
    pub fn row_cap(&self, role: &RolePolicy) -> u32 {
        self.document.max_rows_returned.min(role.max_rows)
    }

    /// Human-readable schema listing handed to generation adapters.
    pub fn schema_context_text(&self) -> String {
        let mut out = String::from("Governed tables:\n");
        for table in &self.document.allowed_tables {
            out.push_str("  ");
            out.push_str(table);
            if let Some(columns) = self.document.schema.get(table) {
                out.push_str(" (");
                out.push_str(&columns.join(", "));
                out.push(')');
            }
            out.push('\n');
        }
        out
    }
}

/// Compile a banned pattern case-insensitively. Keyword-shaped patterns get
/// word boundaries so `DROP` does not match `backdrop`; multi-token patterns
/// like `SELECT *` tolerate arbitrary whitespace between tokens.
fn compile_pattern(raw: &str) -> Result<Regex, PolicyLoadError> {
    let tokens: Vec<String> = raw.split_whitespace().map(|t| regex::escape(t)).collect();
    if tokens.is_empty() {
        return Err(PolicyLoadError::Invalid(
            "banned pattern must not be blank".to_string(),
        ));
    }
    let mut body = tokens.join(r"\s+");
    if raw.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
        body = format!(r"\b{body}");
    }
    if raw.ends_with(|c: char| c.is_alphanumeric() || c == '_') {
        body = format!(r"{body}\b");
    }
    Regex::new(&format!("(?i){body}")).map_err(|source| PolicyLoadError::BadPattern {
        pattern: raw.to_string(),
        source,
    })
}
