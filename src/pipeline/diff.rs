//! Unified diff between the original and repaired artifact.
//!
//! Shown in the admin audit feed to prove a heal happened. Line-based LCS;
//! SQL statements are short, so the quadratic table is fine.

/// Produce a unified-diff text between the failed original and the healed
/// replacement. Returns an empty string when the two are identical.
pub fn unified_diff(original: &str, repaired: &str) -> String {
    let a: Vec<&str> = original.trim().lines().collect();
    let b: Vec<&str> = repaired.trim().lines().collect();
    if a == b {
        return String::new();
    }

    // LCS length table, a-indexed rows, b-indexed columns.
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut body = String::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            body.push(' ');
            body.push_str(a[i]);
            body.push('\n');
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            body.push('-');
            body.push_str(a[i]);
            body.push('\n');
            i += 1;
        } else {
            body.push('+');
            body.push_str(b[j]);
            body.push('\n');
            j += 1;
        }
    }
    for line in &a[i..] {
        body.push('-');
        body.push_str(line);
        body.push('\n');
    }
    for line in &b[j..] {
        body.push('+');
        body.push_str(line);
        body.push('\n');
    }

    format!(
        "--- original\n+++ repaired\n@@ -1,{} +1,{} @@\n{}",
        a.len(),
        b.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_no_diff() {
        assert_eq!(unified_diff("SELECT 1", "SELECT 1"), "");
        assert_eq!(unified_diff("SELECT 1\n", "SELECT 1"), "");
    }

    #[test]
    fn single_line_replacement() {
        let diff = unified_diff(
            "SELECT * FROM governed.sales",
            "SELECT store_id, amount FROM governed.sales LIMIT 1000",
        );
        assert!(diff.starts_with("--- original\n+++ repaired\n"));
        assert!(diff.contains("-SELECT * FROM governed.sales"));
        assert!(diff.contains("+SELECT store_id, amount FROM governed.sales LIMIT 1000"));
    }

    #[test]
    fn unchanged_lines_appear_as_context() {
        let original = "SELECT store_id,\n  amount\nFROM governed.sales";
        let repaired = "SELECT store_id,\n  amount\nFROM governed.sales\nLIMIT 100";
        let diff = unified_diff(original, repaired);
        assert!(diff.contains(" SELECT store_id,"));
        assert!(diff.contains("+LIMIT 100"));
        assert!(!diff.contains("-SELECT"));
    }
}
