//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::audit::AuditRecorder;
use crate::pipeline::Orchestrator;
use crate::policy::PolicyStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Governance policy store (snapshot per request, hot-reloadable)
    pub policy: Arc<PolicyStore>,

    /// Audit recorder wrapping the configured sink
    pub audit: Arc<AuditRecorder>,

    /// The generation-validation-execution pipeline
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(
        policy: Arc<PolicyStore>,
        audit: Arc<AuditRecorder>,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            policy,
            audit,
            orchestrator,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
