//! SQL text builders for row access (PostgreSQL dialect, `$n` placeholders).
//!
//! Identifiers are always quoted; user supplied values only ever travel as
//! bind arguments.

use crate::types::RowFilter;

/// Quote an identifier, doubling embedded quotes.
pub fn escape_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// `"schema"."table"`
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(table))
}

/// Strip whitespace and one trailing statement terminator.
pub fn strip_trailing_semicolon(sql: &str) -> &str {
    let trimmed = sql.trim();
    match trimmed.strip_suffix(';') {
        Some(stripped) => stripped.trim_end(),
        None => trimmed,
    }
}

/// Wrap a query so at most `limit` rows come back.
pub fn apply_row_limit(sql: &str, limit: Option<i64>) -> String {
    let stripped = strip_trailing_semicolon(sql);
    match limit {
        Some(limit) if limit >= 0 => format!("SELECT * FROM ({}) AS _q LIMIT {}", stripped, limit),
        _ => stripped.to_string(),
    }
}

/// A statement plus its text bind arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSql {
    pub sql: String,
    pub args: Vec<String>,
}

/// `SELECT COUNT(*) FROM schema.table [WHERE ...]`
pub fn count_rows_sql(schema: &str, table: &str, column_names: &[String], filter: &RowFilter) -> BoundSql {
    let mut sql = format!("SELECT COUNT(*) FROM {}", qualified_table(schema, table));
    let mut args = Vec::new();
    push_filtering(&mut sql, &mut args, column_names, filter);
    BoundSql { sql, args }
}

/// `SELECT cols FROM schema.table [WHERE ...] [ORDER BY ...] [LIMIT .. OFFSET ..]`
pub fn fetch_rows_sql(
    schema: &str,
    table: &str,
    column_names: &[String],
    ordering: Option<&str>,
    page: u64,
    page_size: u64,
    filter: &RowFilter,
) -> BoundSql {
    let columns = if column_names.is_empty() {
        "*".to_string()
    } else {
        column_names
            .iter()
            .map(|c| escape_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!("SELECT {} FROM {}", columns, qualified_table(schema, table));
    let mut args = Vec::new();
    push_filtering(&mut sql, &mut args, column_names, filter);
    push_ordering(&mut sql, column_names, ordering);

    if page_size > 0 {
        let offset = page.max(1).saturating_sub(1).saturating_mul(page_size);
        sql.push_str(&format!(" LIMIT {} OFFSET {}", page_size, offset));
    }

    BoundSql { sql, args }
}

fn push_filtering(sql: &mut String, args: &mut Vec<String>, column_names: &[String], filter: &RowFilter) {
    let mut where_stmts = Vec::new();

    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        let search_stmts: Vec<String> = column_names
            .iter()
            .map(|column| {
                args.push(format!("%{}%", search));
                format!("CAST({} AS TEXT) ILIKE ${}", escape_identifier(column), args.len())
            })
            .collect();
        if !search_stmts.is_empty() {
            where_stmts.push(format!("({})", search_stmts.join(" OR ")));
        }
    }

    for (column, values) in &filter.filters {
        let filter_stmts: Vec<String> = values
            .iter()
            .map(|value| {
                args.push(value.clone());
                format!("CAST({} AS TEXT) = ${}", escape_identifier(column), args.len())
            })
            .collect();
        if !filter_stmts.is_empty() {
            where_stmts.push(format!("({})", filter_stmts.join(" OR ")));
        }
    }

    if !where_stmts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_stmts.join(" AND "));
    }
}

/// Parse `col` / `-col` into (column, descending).
pub fn parse_ordering(ordering: &str) -> (&str, bool) {
    match ordering.strip_prefix('-') {
        Some(column) => (column, true),
        None => (ordering, false),
    }
}

fn push_ordering(sql: &mut String, column_names: &[String], ordering: Option<&str>) {
    let Some(ordering) = ordering.filter(|o| !o.is_empty()) else {
        return;
    };
    let (column, descending) = parse_ordering(ordering);
    // Unknown ordering columns are ignored rather than rejected.
    if column_names.iter().any(|c| c == column) {
        sql.push_str(&format!(
            " ORDER BY {} {}",
            escape_identifier(column),
            if descending { "DESC" } else { "ASC" }
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_escape_identifier_doubles_quotes() {
        assert_eq!(escape_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(qualified_table("s", "t"), "\"s\".\"t\"");
    }

    #[test]
    fn test_strip_trailing_semicolon() {
        assert_eq!(strip_trailing_semicolon("SELECT 1 ;  "), "SELECT 1");
        assert_eq!(strip_trailing_semicolon("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_apply_row_limit() {
        assert_eq!(
            apply_row_limit("SELECT a FROM t;", Some(10)),
            "SELECT * FROM (SELECT a FROM t) AS _q LIMIT 10"
        );
        assert_eq!(apply_row_limit("SELECT a FROM t;", None), "SELECT a FROM t");
    }

    #[test]
    fn test_fetch_rows_paging_and_ordering() {
        let q = fetch_rows_sql("s", "t", &cols(&["a", "b"]), Some("-b"), 3, 10, &RowFilter::default());
        assert_eq!(
            q.sql,
            "SELECT \"a\", \"b\" FROM \"s\".\"t\" ORDER BY \"b\" DESC LIMIT 10 OFFSET 20"
        );
        assert!(q.args.is_empty());
    }

    #[test]
    fn test_fetch_rows_ignores_unknown_ordering_and_zero_page_size() {
        let q = fetch_rows_sql("s", "t", &cols(&["a"]), Some("zzz"), 1, 0, &RowFilter::default());
        assert_eq!(q.sql, "SELECT \"a\" FROM \"s\".\"t\"");
    }

    #[test]
    fn test_search_and_filters_bind_arguments() {
        let filter = RowFilter::search("m31").with_filter("b", vec!["1".into(), "2".into()]);
        let q = count_rows_sql("s", "t", &cols(&["a", "b"]), &filter);
        assert_eq!(
            q.sql,
            "SELECT COUNT(*) FROM \"s\".\"t\" WHERE (CAST(\"a\" AS TEXT) ILIKE $1 OR CAST(\"b\" AS TEXT) ILIKE $2) AND (CAST(\"b\" AS TEXT) = $3 OR CAST(\"b\" AS TEXT) = $4)"
        );
        assert_eq!(q.args, vec!["%m31%", "%m31%", "1", "2"]);
    }
}
