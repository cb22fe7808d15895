//! Statement Validator
//!
//! Static safety check on a generated SQL statement. Pure function of
//! (statement, policy snapshot, role): no I/O, no side effects, deterministic.
//!
//! Order of checks: read-only gate first (empty / not a single SELECT-shaped
//! statement short-circuits), then banned patterns, table scope, the role's
//! operation allow-list, PII masking, and the row limit are all evaluated so
//! the caller sees every violation at once.

use crate::pipeline::types::{ValidationResult, Violation, ViolationCause};
use crate::policy::{PolicySnapshot, RolePolicy};
use once_cell::sync::Lazy;
use regex::Regex;

/// What to do about a missing or oversized LIMIT clause.
///
/// `Rewrite` (default) treats the limit as a validator-side repair: a missing
/// clause is injected at the effective cap and an oversized one is clamped,
/// without failing validation or consuming the repair cycle. `Strict` rejects
/// with `row_limit_exceeded` instead. Both modes are deterministic and tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowLimitMode {
    #[default]
    Rewrite,
    Strict,
}

static FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*```(?:sql)?\s*").unwrap());
static FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*```\s*$").unwrap());
static LIMIT_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)\b").unwrap());
static TABLE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap());
// Continuation of a comma-form join list: an optional alias (never dotted),
// a comma, then the next table name.
static COMMA_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:(?:AS\s+)?[A-Za-z_][A-Za-z0-9_]*\s*)?,\s*([A-Za-z_][A-Za-z0-9_.]*)")
        .unwrap()
});

/// Strip markdown code fences and trailing semicolons the generator tends to
/// wrap statements in.
fn clean_statement(sql: &str) -> String {
    let stripped = FENCE_OPEN.replace(sql, "");
    let stripped = FENCE_CLOSE.replace(&stripped, "");
    stripped.trim().trim_end_matches(';').trim().to_string()
}

/// Tables referenced by FROM/JOIN clauses, in order of appearance,
/// de-duplicated. Comma-form join lists after a FROM count in full, with
/// aliases skipped.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for cap in TABLE_REF.captures_iter(sql) {
        let table = cap[1].to_string();
        if !seen.contains(&table) {
            seen.push(table);
        }
        let mut rest = &sql[cap.get(0).map_or(sql.len(), |m| m.end())..];
        while let Some(next) = COMMA_TABLE.captures(rest) {
            let table = next[1].to_string();
            if !seen.contains(&table) {
                seen.push(table);
            }
            rest = &rest[next.get(0).map_or(rest.len(), |m| m.end())..];
        }
    }
    seen
}

/// Validate a generated SQL statement against the guardrails and the invoking
/// role's policy.
pub fn validate_statement(
    sql: &str,
    snapshot: &PolicySnapshot,
    role: &RolePolicy,
    mode: RowLimitMode,
) -> ValidationResult {
    let mut cleaned = clean_statement(sql);
    let mut violations = Vec::new();

    if cleaned.is_empty() {
        return ValidationResult {
            passed: false,
            cleaned_statement: cleaned,
            violations: vec![Violation::new(
                "statement",
                ViolationCause::EmptyStatement,
                "statement is empty",
            )],
        };
    }

    // Read-only gate: a single SELECT (or WITH, for CTEs) statement.
    let upper = cleaned.to_uppercase();
    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return ValidationResult {
            passed: false,
            cleaned_statement: cleaned,
            violations: vec![Violation::new(
                "statement",
                ViolationCause::NotReadOnly,
                "only SELECT statements are allowed",
            )],
        };
    }
    if cleaned.contains(';') {
        return ValidationResult {
            passed: false,
            cleaned_statement: cleaned,
            violations: vec![Violation::new(
                "statement",
                ViolationCause::NotReadOnly,
                "multiple statements are not allowed",
            )],
        };
    }

    for pattern in snapshot.banned_patterns() {
        if pattern.regex.is_match(&cleaned) {
            violations.push(Violation::new(
                "statement",
                ViolationCause::BannedPattern,
                format!("banned SQL pattern detected: {}", pattern.raw),
            ));
        }
    }

    for table in referenced_tables(&cleaned) {
        if !snapshot.document.allowed_tables.contains(&table) {
            violations.push(Violation::new(
                "tables",
                ViolationCause::TableNotAllowed,
                format!("table '{table}' is not a governed table"),
            ));
        } else if !role.allowed_tables.allows(&table) {
            violations.push(Violation::new(
                "tables",
                ViolationCause::TableNotAllowed,
                format!("the invoking role has no access to table '{table}'"),
            ));
        }
    }

    // The read-only gate means the operation is always select here; roles
    // without it in their allow-list cannot run anything.
    if !role.allowed_operations.contains("select") {
        violations.push(Violation::new(
            "statement",
            ViolationCause::OperationNotAllowed,
            "the invoking role is not allowed to run select statements",
        ));
    }

    if !role.can_see_unmasked_pii {
        for pattern in snapshot.pii_patterns() {
            if pattern.regex.is_match(&cleaned) {
                violations.push(Violation::new(
                    "columns",
                    ViolationCause::PiiColumnNotAllowed,
                    format!(
                        "column '{}' contains PII and is masked for the invoking role",
                        pattern.raw
                    ),
                ));
            }
        }
    }

    let cap = snapshot.row_cap(role);
    match (LIMIT_CLAUSE.captures(&cleaned), mode) {
        (None, RowLimitMode::Rewrite) => {
            cleaned = format!("{cleaned} LIMIT {cap}");
        }
        (None, RowLimitMode::Strict) => {
            violations.push(Violation::new(
                "limit",
                ViolationCause::RowLimitExceeded,
                format!("no row limit clause present (cap is {cap})"),
            ));
        }
        (Some(caps), mode) => {
            let declared: u64 = caps[1].parse().unwrap_or(u64::MAX);
            if declared > u64::from(cap) {
                match mode {
                    RowLimitMode::Rewrite => {
                        cleaned = LIMIT_CLAUSE
                            .replace(&cleaned, format!("LIMIT {cap}"))
                            .into_owned();
                    }
                    RowLimitMode::Strict => {
                        violations.push(Violation::new(
                            "limit",
                            ViolationCause::RowLimitExceeded,
                            format!("declared limit {declared} exceeds the cap of {cap}"),
                        ));
                    }
                }
            }
        }
    }

    ValidationResult {
        passed: violations.is_empty(),
        cleaned_statement: cleaned,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::model::tests::{GUARDRAILS_YAML, ROLES_YAML};
    use pretty_assertions::assert_eq;

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot::from_yaml(GUARDRAILS_YAML, ROLES_YAML).unwrap()
    }

    fn causes(result: &ValidationResult) -> Vec<ViolationCause> {
        result.violations.iter().map(|v| v.cause).collect()
    }

    #[test]
    fn valid_select_gets_limit_injected() {
        let snap = snapshot();
        let role = &snap.roles["analyst"];
        let result = validate_statement(
            "SELECT store_id, amount FROM governed.sales",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(result.passed);
        assert_eq!(
            result.cleaned_statement,
            "SELECT store_id, amount FROM governed.sales LIMIT 5000"
        );
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let snap = snapshot();
        let role = &snap.roles["analyst"];
        let result = validate_statement(
            "SELECT store_id FROM governed.sales LIMIT 50000",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(result.passed);
        assert!(result.cleaned_statement.ends_with("LIMIT 5000"));
        assert!(!result.cleaned_statement.contains("50000"));
    }

    #[test]
    fn lower_limit_is_kept() {
        let snap = snapshot();
        let role = &snap.roles["analyst"];
        let result = validate_statement(
            "SELECT store_id FROM governed.sales LIMIT 10",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(result.passed);
        assert!(result.cleaned_statement.ends_with("LIMIT 10"));
    }

    #[test]
    fn strict_mode_rejects_missing_and_oversized_limits() {
        let snap = snapshot();
        let role = &snap.roles["analyst"];

        let missing = validate_statement(
            "SELECT store_id FROM governed.sales",
            &snap,
            role,
            RowLimitMode::Strict,
        );
        assert!(!missing.passed);
        assert_eq!(causes(&missing), vec![ViolationCause::RowLimitExceeded]);

        let oversized = validate_statement(
            "SELECT store_id FROM governed.sales LIMIT 50000",
            &snap,
            role,
            RowLimitMode::Strict,
        );
        assert!(!oversized.passed);
        assert_eq!(causes(&oversized), vec![ViolationCause::RowLimitExceeded]);
    }

    #[test]
    fn banned_patterns_are_rejected() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let adversarial = [
            "DROP TABLE governed.sales",
            "SELECT id FROM governed.sales WHERE name = 'DROP'",
            "SELECT id FROM governed.inventory UNION UPDATE governed.inventory SET qty=0",
            "SELECT 1 WHERE EXISTS (INSERT INTO governed.sales VALUES (1))",
            "SELECT id FROM TRUNCATE TABLE governed.shipping",
            "SELECT CREATE TABLE governed.hacked",
            "SELECT id FROM ALTER TABLE",
            "SELECT GRANT ALL",
        ];
        for sql in adversarial {
            let result = validate_statement(sql, &snap, role, RowLimitMode::Rewrite);
            assert!(!result.passed, "expected rejection: {sql}");
            assert!(
                result
                    .violations
                    .iter()
                    .any(|v| matches!(v.cause, ViolationCause::BannedPattern | ViolationCause::NotReadOnly)),
                "expected a banned-pattern violation: {sql}"
            );
        }
    }

    #[test]
    fn select_star_is_rejected() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let result = validate_statement(
            "SELECT * FROM governed.sales LIMIT 10",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert_eq!(causes(&result), vec![ViolationCause::BannedPattern]);
    }

    #[test]
    fn markdown_fences_are_stripped() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let result = validate_statement(
            "```sql\nSELECT store_id FROM governed.sales LIMIT 5\n```",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(result.passed);
        assert_eq!(
            result.cleaned_statement,
            "SELECT store_id FROM governed.sales LIMIT 5"
        );
    }

    #[test]
    fn empty_statement_fails() {
        let snap = snapshot();
        let role = &snap.roles["viewer"];
        let result = validate_statement("   ```sql``` ", &snap, role, RowLimitMode::Rewrite);
        assert!(!result.passed);
        assert_eq!(causes(&result), vec![ViolationCause::EmptyStatement]);
    }

    #[test]
    fn non_select_fails_the_read_only_gate() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let result = validate_statement(
            "EXPLAIN SELECT 1",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert_eq!(causes(&result), vec![ViolationCause::NotReadOnly]);
    }

    #[test]
    fn stacked_statements_fail() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let result = validate_statement(
            "SELECT 1; SELECT 2",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert_eq!(causes(&result), vec![ViolationCause::NotReadOnly]);
    }

    #[test]
    fn comma_joined_tables_are_all_scoped() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let result = validate_statement(
            "SELECT s.amount FROM governed.sales s, secret.payroll p LIMIT 10",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert!(causes(&result).contains(&ViolationCause::TableNotAllowed));
        assert!(result
            .violations
            .iter()
            .any(|v| v.reason.contains("secret.payroll")));
    }

    #[test]
    fn comma_join_of_governed_tables_passes() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let result = validate_statement(
            "SELECT s.amount, i.qoh FROM governed.sales s, governed.inventory i LIMIT 10",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn referenced_tables_walks_comma_lists() {
        let tables = referenced_tables(
            "SELECT x FROM governed.sales s, governed.inventory, secret.payroll p \
             JOIN governed.shipping sh ON sh.region = s.region",
        );
        assert_eq!(
            tables,
            vec![
                "governed.sales".to_string(),
                "governed.inventory".to_string(),
                "secret.payroll".to_string(),
                "governed.shipping".to_string(),
            ]
        );
    }

    #[test]
    fn pii_columns_are_masked_per_role() {
        let snap = snapshot();

        let masked = validate_statement(
            "SELECT regional_manager FROM governed.sales LIMIT 10",
            &snap,
            &snap.roles["viewer"],
            RowLimitMode::Rewrite,
        );
        assert!(!masked.passed);
        assert_eq!(causes(&masked), vec![ViolationCause::PiiColumnNotAllowed]);
        assert!(masked.violations[0].reason.contains("regional_manager"));

        // admin may see unmasked PII
        let unmasked = validate_statement(
            "SELECT regional_manager FROM governed.sales LIMIT 10",
            &snap,
            &snap.roles["admin"],
            RowLimitMode::Rewrite,
        );
        assert!(unmasked.passed, "{:?}", unmasked.violations);
    }

    #[test]
    fn roles_without_select_cannot_run_statements() {
        // strip select from the first role block (admin)
        let roles = ROLES_YAML.replacen("allowed_operations: [select]", "allowed_operations: []", 1);
        let snap = PolicySnapshot::from_yaml(GUARDRAILS_YAML, &roles).unwrap();
        let result = validate_statement(
            "SELECT store_id FROM governed.sales LIMIT 10",
            &snap,
            &snap.roles["admin"],
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert_eq!(causes(&result), vec![ViolationCause::OperationNotAllowed]);
    }

    #[test]
    fn ungoverned_table_is_rejected() {
        let snap = snapshot();
        let role = &snap.roles["admin"];
        let result = validate_statement(
            "SELECT id FROM secret.salaries LIMIT 5",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert_eq!(causes(&result), vec![ViolationCause::TableNotAllowed]);
    }

    #[test]
    fn role_scope_is_enforced_on_governed_tables() {
        let snap = snapshot();
        let role = &snap.roles["viewer"];
        let result = validate_statement(
            "SELECT sku FROM governed.inventory LIMIT 5",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert_eq!(causes(&result), vec![ViolationCause::TableNotAllowed]);
        assert!(result.violations[0].reason.contains("governed.inventory"));
    }

    #[test]
    fn select_star_and_role_scope_reported_together() {
        let snap = snapshot();
        let role = &snap.roles["viewer"];
        let result = validate_statement(
            "SELECT * FROM governed.shipping",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(!result.passed);
        assert!(causes(&result).contains(&ViolationCause::BannedPattern));
        assert!(causes(&result).contains(&ViolationCause::TableNotAllowed));
    }

    #[test]
    fn revalidating_a_cleaned_statement_is_a_no_op() {
        let snap = snapshot();
        let role = &snap.roles["analyst"];
        let first = validate_statement(
            "SELECT store_id FROM governed.sales",
            &snap,
            role,
            RowLimitMode::Rewrite,
        );
        assert!(first.passed);

        let second =
            validate_statement(&first.cleaned_statement, &snap, role, RowLimitMode::Rewrite);
        assert!(second.passed);
        assert!(second.violations.is_empty());
        assert_eq!(second.cleaned_statement, first.cleaned_statement);
    }
}
