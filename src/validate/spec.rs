//! Spec Validator
//!
//! Allow-list check on a generated application spec. Total and non-throwing:
//! every input yields a usable (possibly reduced) spec plus the list of what
//! was removed and why. A partially satisfiable spec beats an all-or-nothing
//! rejection.

use crate::pipeline::types::{Violation, ViolationCause};
use crate::policy::PolicySnapshot;
use serde::{Deserialize, Serialize};

/// A structured, declarative description of a data application. Missing
/// fields default rather than fail; the generator may emit partial specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSpec {
    pub domain: String,
    pub tables: Vec<String>,
    pub kpis: Vec<String>,
    pub filters: Vec<String>,
    pub charts: Vec<String>,
    pub chatbot: bool,
}

impl Default for AppSpec {
    fn default() -> Self {
        Self {
            domain: "general".to_string(),
            tables: Vec::new(),
            kpis: Vec::new(),
            filters: Vec::new(),
            charts: Vec::new(),
            chatbot: false,
        }
    }
}

/// Reduce a spec to what the guardrails and the caller's role allow.
///
/// Unknown roles are downgraded to the `viewer` floor with a recorded
/// violation. Returns `(cleaned_spec, violations)`, both always present.
pub fn validate_spec(
    spec: &AppSpec,
    role_name: &str,
    snapshot: &PolicySnapshot,
) -> (AppSpec, Vec<Violation>) {
    let mut violations = Vec::new();

    let (role, downgraded) = snapshot.role_or_fallback(role_name);
    if downgraded {
        violations.push(Violation::new(
            "role",
            ViolationCause::UnknownRole,
            format!("role '{role_name}' is not recognized; applying viewer restrictions"),
        ));
    }

    let mut cleaned = spec.clone();
    if cleaned.domain.trim().is_empty() {
        cleaned.domain = AppSpec::default().domain;
    }

    cleaned.tables.retain(|table| {
        if !snapshot.document.allowed_tables.contains(table) {
            violations.push(Violation::new(
                "tables",
                ViolationCause::TableNotAllowed,
                format!("table '{table}' was removed because it is not a governed table"),
            ));
            false
        } else if !role.allowed_tables.allows(table) {
            violations.push(Violation::new(
                "tables",
                ViolationCause::TableNotAllowed,
                format!("role '{role_name}' has no access to '{table}'"),
            ));
            false
        } else {
            true
        }
    });

    cleaned.charts.retain(|chart| {
        if snapshot.document.allowed_chart_types.contains(chart) {
            true
        } else {
            violations.push(Violation::new(
                "charts",
                ViolationCause::ChartNotAllowed,
                format!("chart type '{chart}' was removed because it is not supported"),
            ));
            false
        }
    });

    (cleaned, violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::model::tests::{GUARDRAILS_YAML, ROLES_YAML};
    use pretty_assertions::assert_eq;

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot::from_yaml(GUARDRAILS_YAML, ROLES_YAML).unwrap()
    }

    fn spec(tables: &[&str], charts: &[&str]) -> AppSpec {
        AppSpec {
            domain: "supply chain".to_string(),
            tables: tables.iter().map(|s| s.to_string()).collect(),
            kpis: vec!["Total Orders".to_string()],
            filters: vec!["region".to_string()],
            charts: charts.iter().map(|s| s.to_string()).collect(),
            chatbot: true,
        }
    }

    #[test]
    fn allowed_fields_pass_through_unchanged() {
        let snap = snapshot();
        let input = spec(&["governed.sales", "governed.inventory"], &["bar", "line"]);
        let (cleaned, violations) = validate_spec(&input, "analyst", &snap);
        assert_eq!(cleaned, input);
        assert!(violations.is_empty());
    }

    #[test]
    fn out_of_role_table_is_removed_with_reason() {
        let snap = snapshot();
        // governed.shipping is governed but not in the analyst allow-list
        let input = spec(&["governed.sales", "governed.shipping"], &["bar"]);
        let (cleaned, violations) = validate_spec(&input, "analyst", &snap);

        assert_eq!(cleaned.tables, vec!["governed.sales".to_string()]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "tables");
        assert!(violations[0].reason.contains("analyst"));
        assert!(violations[0].reason.contains("governed.shipping"));
        // Everything else survives
        assert_eq!(cleaned.charts, vec!["bar".to_string()]);
        assert_eq!(cleaned.kpis, input.kpis);
    }

    #[test]
    fn ungoverned_table_gets_a_distinct_reason() {
        let snap = snapshot();
        let input = spec(&["governed.salaries"], &[]);
        let (cleaned, violations) = validate_spec(&input, "admin", &snap);
        assert!(cleaned.tables.is_empty());
        assert!(violations[0].reason.contains("not a governed table"));
    }

    #[test]
    fn unsupported_chart_types_are_removed() {
        let snap = snapshot();
        let input = spec(&["governed.sales"], &["bar", "hologram"]);
        let (cleaned, violations) = validate_spec(&input, "admin", &snap);
        assert_eq!(cleaned.charts, vec!["bar".to_string()]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].cause, ViolationCause::ChartNotAllowed);
    }

    #[test]
    fn fully_rejected_spec_still_returns_a_usable_result() {
        let snap = snapshot();
        let input = spec(
            &["secret.payroll", "secret.salaries"],
            &["hologram", "gauge"],
        );
        let (cleaned, violations) = validate_spec(&input, "viewer", &snap);

        assert!(cleaned.tables.is_empty());
        assert!(cleaned.charts.is_empty());
        // one violation per removed entry
        assert_eq!(violations.len(), 4);
        // untouched fields keep their values
        assert_eq!(cleaned.domain, "supply chain");
        assert!(cleaned.chatbot);
    }

    #[test]
    fn unknown_role_is_downgraded_to_viewer() {
        let snap = snapshot();
        let input = spec(&["governed.sales", "governed.inventory"], &["bar"]);
        let (cleaned, violations) = validate_spec(&input, "superuser", &snap);

        // viewer only sees governed.sales
        assert_eq!(cleaned.tables, vec!["governed.sales".to_string()]);
        assert!(violations
            .iter()
            .any(|v| v.cause == ViolationCause::UnknownRole));
    }

    #[test]
    fn missing_fields_default_instead_of_failing() {
        let parsed: AppSpec = serde_json::from_str(r#"{"tables": ["governed.sales"]}"#).unwrap();
        assert_eq!(parsed.domain, "general");
        assert!(parsed.filters.is_empty());
        assert!(parsed.charts.is_empty());
        assert!(!parsed.chatbot);
    }
}
