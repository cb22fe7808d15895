//! Static validators for generated artifacts.
//!
//! Both validators are pure functions of (artifact, policy snapshot, role).
//! The statement validator can fail; the spec validator never does - it
//! reduces the spec and reports what it removed.

pub mod spec;
pub mod statement;

pub use spec::{validate_spec, AppSpec};
pub use statement::{referenced_tables, validate_statement, RowLimitMode};
