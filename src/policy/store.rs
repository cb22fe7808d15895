//! Policy snapshot store
//!
//! Loads the guardrail/role documents once at startup and exposes them as an
//! immutable snapshot. `reload` is the only mutation point: it parses fresh
//! documents and atomically swaps the `Arc`, so in-flight requests keep the
//! snapshot they captured and new requests observe the new one.

use crate::policy::model::{PolicyDocument, PolicyLoadError, PolicySnapshot, RolePolicy};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Where the two policy documents live on disk.
#[derive(Debug, Clone)]
pub struct PolicyPaths {
    pub guardrails: PathBuf,
    pub roles: PathBuf,
}

/// Thread-safe holder of the active policy snapshot.
pub struct PolicyStore {
    paths: Option<PolicyPaths>,
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    /// Load both documents from disk. Fails hard on any missing key, type
    /// mismatch, or uncompilable banned pattern - the process must not serve
    /// requests without a valid policy.
    pub fn load(paths: PolicyPaths) -> Result<Self, PolicyLoadError> {
        let snapshot = read_snapshot(&paths)?;
        info!(
            tables = snapshot.document.allowed_tables.len(),
            roles = snapshot.roles.len(),
            "policy loaded"
        );
        Ok(Self {
            paths: Some(paths),
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Wrap an already-built snapshot. No file source, so `reload` will fail.
    pub fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            paths: None,
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The currently active snapshot. Callers hold the returned `Arc` for the
    /// whole request so a concurrent reload never tears their view.
    pub async fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().await.clone()
    }

    /// Re-read the policy documents and swap the active snapshot atomically.
    /// On any load error the previous snapshot stays active.
    pub async fn reload(&self) -> Result<Arc<PolicySnapshot>, PolicyLoadError> {
        let paths = self.paths.as_ref().ok_or_else(|| {
            PolicyLoadError::Invalid("policy store has no file source to reload from".to_string())
        })?;
        let fresh = Arc::new(read_snapshot(paths)?);
        let mut guard = self.current.write().await;
        *guard = fresh.clone();
        info!(
            tables = fresh.document.allowed_tables.len(),
            roles = fresh.roles.len(),
            "policy reloaded"
        );
        Ok(fresh)
    }
}

fn read_snapshot(paths: &PolicyPaths) -> Result<PolicySnapshot, PolicyLoadError> {
    let guardrails_text =
        std::fs::read_to_string(&paths.guardrails).map_err(|source| PolicyLoadError::Io {
            path: paths.guardrails.display().to_string(),
            source,
        })?;
    let roles_text = std::fs::read_to_string(&paths.roles).map_err(|source| PolicyLoadError::Io {
        path: paths.roles.display().to_string(),
        source,
    })?;

    let document: PolicyDocument =
        serde_yaml::from_str(&guardrails_text).map_err(|source| PolicyLoadError::Parse {
            path: paths.guardrails.display().to_string(),
            source,
        })?;
    let roles: BTreeMap<String, RolePolicy> =
        serde_yaml::from_str(&roles_text).map_err(|source| PolicyLoadError::Parse {
            path: paths.roles.display().to_string(),
            source,
        })?;

    PolicySnapshot::new(document, roles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::model::tests::{GUARDRAILS_YAML, ROLES_YAML};

    #[tokio::test]
    async fn snapshot_survives_reload() {
        let store = PolicyStore::from_snapshot(
            PolicySnapshot::from_yaml(GUARDRAILS_YAML, ROLES_YAML).unwrap(),
        );
        let before = store.snapshot().await;

        // No file source configured, so reload must fail and leave the
        // active snapshot untouched.
        assert!(store.reload().await.is_err());
        let after = store.snapshot().await;
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn reload_swaps_for_new_requests_only() {
        let dir = std::env::temp_dir().join(format!("governor-policy-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let guardrails = dir.join("guardrails.yaml");
        let roles = dir.join("roles.yaml");
        std::fs::write(&guardrails, GUARDRAILS_YAML).unwrap();
        std::fs::write(&roles, ROLES_YAML).unwrap();

        let store = PolicyStore::load(PolicyPaths {
            guardrails: guardrails.clone(),
            roles,
        })
        .unwrap();

        let captured = store.snapshot().await;
        assert_eq!(captured.document.max_rows_returned, 10_000);

        std::fs::write(
            &guardrails,
            GUARDRAILS_YAML.replace("max_rows_returned: 10000", "max_rows_returned: 500"),
        )
        .unwrap();
        store.reload().await.unwrap();

        // The in-flight capture is unchanged; a fresh capture sees the swap.
        assert_eq!(captured.document.max_rows_returned, 10_000);
        assert_eq!(store.snapshot().await.document.max_rows_returned, 500);
    }
}
