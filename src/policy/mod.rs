//! Governance policy: guardrail document, role policies, and the snapshot store.

pub mod model;
pub mod store;

pub use model::{PolicyDocument, PolicyLoadError, PolicySnapshot, RolePolicy, TableScope};
pub use store::{PolicyPaths, PolicyStore};
