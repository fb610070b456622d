//! Query translation and analysis.
//!
//! [`QueryProcessor`] is the seam to the dialect translator. The built-in
//! [`NativeSqlProcessor`] passes native SQL through, handles the `TOP n`
//! form of ADQL, enforces read-only single statements and extracts the
//! referenced tables, columns and functions with a small tokenizer.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyntaxError;

/// A table referenced by a query. `schema` is empty when unqualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn qualified(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }
}

/// A column referenced in the select list; `column` may be `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub schema: String,
    pub table: String,
    pub column: String,
}

/// Processor output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedQuery {
    /// Canonical native query
    pub query: String,
    pub keywords: Vec<String>,
    pub tables: Vec<TableRef>,
    pub columns: Vec<ColumnRef>,
    pub functions: Vec<String>,
    pub display_columns: Vec<String>,
}

pub trait QueryProcessor: Send + Sync {
    /// Translate `query` written in `language` into the native dialect.
    fn translate(&self, language: &str, query: &str) -> Result<String, SyntaxError>;

    /// Analyse a native query.
    fn process(&self, native_query: &str) -> Result<ProcessedQuery, SyntaxError>;
}

const ALLOWED_PREFIXES: &[&str] = &["SELECT", "WITH"];
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "COPY", "GRANT",
    "REVOKE", "VACUUM",
];
const KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "DISTINCT", "FROM", "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL",
    "OUTER", "CROSS", "NATURAL", "ON", "USING", "GROUP", "BY", "HAVING", "ORDER", "ASC", "DESC",
    "LIMIT", "OFFSET", "UNION", "INTERSECT", "EXCEPT", "ALL", "AS", "AND", "OR", "NOT", "IN",
    "IS", "NULL", "LIKE", "ILIKE", "BETWEEN", "EXISTS", "CASE", "WHEN", "THEN", "ELSE", "END",
    "TRUE", "FALSE", "TOP", "CAST", "ANY", "SOME",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Number,
    Str,
    Symbol(char),
}

impl Token {
    fn keyword(&self) -> Option<String> {
        match self {
            Token::Word(w) => {
                let upper = w.to_ascii_uppercase();
                KEYWORDS
                    .iter()
                    .chain(FORBIDDEN_KEYWORDS)
                    .any(|k| *k == upper)
                    .then_some(upper)
            }
            _ => None,
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn identifier(&self) -> Option<&str> {
        match self {
            Token::Quoted(name) => Some(name),
            Token::Word(_) if self.keyword().is_some() => None,
            Token::Word(name) => Some(name),
            _ => None,
        }
    }
}

/// 1-based line and column of byte offset `pos`.
fn position(sql: &str, pos: usize) -> (usize, usize) {
    let before = &sql[..pos.min(sql.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |i| before.len() - i - 1) + 1;
    (line, column)
}

fn tokenize(sql: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((start, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() => {}
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    if c == '*' && matches!(chars.peek(), Some((_, '/'))) {
                        chars.next();
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    let (line, column) = position(sql, start);
                    return Err(SyntaxError::new("Unterminated comment").at(line, column));
                }
            }
            '\'' => {
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    if c == '\'' {
                        if matches!(chars.peek(), Some((_, '\''))) {
                            chars.next();
                            continue;
                        }
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    let (line, column) = position(sql, start);
                    return Err(SyntaxError::new("Unterminated string literal").at(line, column));
                }
                tokens.push(Token::Str);
            }
            '"' => {
                let mut name = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    if c == '"' {
                        if matches!(chars.peek(), Some((_, '"'))) {
                            chars.next();
                            name.push('"');
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    let (line, column) = position(sql, start);
                    return Err(SyntaxError::new("Unterminated quoted identifier").at(line, column));
                }
                tokens.push(Token::Quoted(name));
            }
            c if c.is_ascii_digit() => {
                while matches!(chars.peek(), Some((_, c)) if c.is_ascii_alphanumeric() || *c == '.') {
                    chars.next();
                }
                tokens.push(Token::Number);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = c.to_string();
                while let Some((_, c)) = chars.peek() {
                    if c.is_alphanumeric() || *c == '_' || *c == '$' {
                        word.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            c => tokens.push(Token::Symbol(c)),
        }
    }
    Ok(tokens)
}

/// Passthrough processor for SQL-like dialects.
#[derive(Debug, Clone, Default)]
pub struct NativeSqlProcessor;

impl NativeSqlProcessor {
    pub fn new() -> Self {
        Self
    }
}

fn adql_top() -> &'static Regex {
    static TOP: OnceLock<Regex> = OnceLock::new();
    TOP.get_or_init(|| {
        Regex::new(r"(?is)^\s*SELECT\s+(DISTINCT\s+)?TOP\s+(\d+)\s+(.*?)\s*;?\s*$")
            .expect("TOP pattern is valid")
    })
}

impl QueryProcessor for NativeSqlProcessor {
    fn translate(&self, language: &str, query: &str) -> Result<String, SyntaxError> {
        if query.trim().is_empty() {
            return Err(SyntaxError::new("Query is empty"));
        }
        if language.starts_with("adql") {
            if let Some(caps) = adql_top().captures(query) {
                let distinct = caps.get(1).map_or("", |m| m.as_str());
                return Ok(format!(
                    "SELECT {}{} LIMIT {}",
                    distinct,
                    &caps[3],
                    &caps[2]
                ));
            }
        }
        Ok(query.trim().to_string())
    }

    fn process(&self, native_query: &str) -> Result<ProcessedQuery, SyntaxError> {
        let tokens = tokenize(native_query)?;
        validate_read_only(&tokens)?;

        let keywords = extract_keywords(&tokens);
        let tables = extract_tables(&tokens);
        let functions = extract_functions(&tokens);
        let (columns, display_columns) = extract_select_list(&tokens, native_query)?;

        Ok(ProcessedQuery {
            query: native_query.trim().trim_end_matches(';').trim_end().to_string(),
            keywords,
            tables,
            columns,
            functions,
            display_columns,
        })
    }
}

fn validate_read_only(tokens: &[Token]) -> Result<(), SyntaxError> {
    let Some(first) = tokens.first() else {
        return Err(SyntaxError::new("Query is empty"));
    };
    if !ALLOWED_PREFIXES.iter().any(|p| first.is_keyword(p)) {
        return Err(SyntaxError::new("Query must start with SELECT or WITH").at(1, 1));
    }

    let mut depth: i32 = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => {
                depth -= 1;
                if depth < 0 {
                    return Err(SyntaxError::new("Unbalanced parentheses"));
                }
            }
            Token::Symbol(';') if i + 1 < tokens.len() => {
                return Err(SyntaxError::new("Multiple statements are not allowed"));
            }
            Token::Word(w) => {
                let upper = w.to_ascii_uppercase();
                if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                    return Err(SyntaxError::new(format!(
                        "Query contains forbidden keyword: {}",
                        upper
                    )));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SyntaxError::new("Unbalanced parentheses"));
    }
    Ok(())
}

fn extract_keywords(tokens: &[Token]) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for keyword in tokens.iter().filter_map(Token::keyword) {
        if !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
    keywords
}

/// `ident` or `ident.ident` starting at `i`; returns the parts and the next index.
fn qualified_name(tokens: &[Token], mut i: usize) -> Option<(Vec<String>, usize)> {
    let mut parts = vec![tokens.get(i)?.identifier()?.to_string()];
    i += 1;
    while matches!(tokens.get(i), Some(Token::Symbol('.'))) {
        match tokens.get(i + 1) {
            Some(Token::Symbol('*')) => {
                parts.push("*".to_string());
                i += 2;
                break;
            }
            Some(token) => match token.identifier() {
                Some(part) => {
                    parts.push(part.to_string());
                    i += 2;
                }
                None => break,
            },
            None => break,
        }
    }
    Some((parts, i))
}

fn extract_tables(tokens: &[Token]) -> Vec<TableRef> {
    let mut tables: Vec<TableRef> = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if !(tokens[i].is_keyword("FROM") || tokens[i].is_keyword("JOIN")) {
            i += 1;
            continue;
        }
        let is_from = tokens[i].is_keyword("FROM");
        i += 1;

        loop {
            let Some((parts, next)) = qualified_name(tokens, i) else {
                break;
            };
            // function call in FROM (table valued function)
            if matches!(tokens.get(next), Some(Token::Symbol('('))) {
                break;
            }
            let table = match parts.as_slice() {
                [table] => TableRef::new("", table.as_str()),
                [.., schema, table] => TableRef::new(schema.as_str(), table.as_str()),
                [] => break,
            };
            if !tables.contains(&table) {
                tables.push(table);
            }
            i = next;

            // optional alias
            if tokens.get(i).map_or(false, |t| t.is_keyword("AS")) {
                i += 1;
            }
            if tokens.get(i).and_then(Token::identifier).is_some() {
                i += 1;
            }
            if is_from && matches!(tokens.get(i), Some(Token::Symbol(','))) {
                i += 1;
                continue;
            }
            break;
        }
    }
    tables
}

fn extract_functions(tokens: &[Token]) -> Vec<String> {
    let mut functions: Vec<String> = Vec::new();
    for window in tokens.windows(2) {
        if let (Token::Word(name), Token::Symbol('(')) = (&window[0], &window[1]) {
            let upper = name.to_ascii_uppercase();
            let is_keyword = KEYWORDS.contains(&upper.as_str()) && upper != "CAST";
            if !is_keyword {
                let lower = name.to_ascii_lowercase();
                if !functions.contains(&lower) {
                    functions.push(lower);
                }
            }
        }
    }
    functions
}

/// Columns and display names of the outermost select list.
fn extract_select_list(
    tokens: &[Token],
    sql: &str,
) -> Result<(Vec<ColumnRef>, Vec<String>), SyntaxError> {
    let Some(select) = tokens.iter().position(|t| t.is_keyword("SELECT")) else {
        return Ok((Vec::new(), Vec::new()));
    };

    let mut items: Vec<&[Token]> = Vec::new();
    let mut depth = 0;
    let mut start = select + 1;
    if tokens.get(start).map_or(false, |t| t.is_keyword("DISTINCT")) {
        start += 1;
    }
    let mut end = tokens.len();
    for (i, token) in tokens.iter().enumerate().skip(start) {
        match token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => depth -= 1,
            Token::Symbol(',') if depth == 0 => {
                items.push(&tokens[start..i]);
                start = i + 1;
            }
            t if depth == 0
                && (t.is_keyword("FROM")
                    || t.is_keyword("LIMIT")
                    || t.is_keyword("UNION")
                    || t.is_keyword("ORDER")) =>
            {
                end = i;
                break;
            }
            _ => {}
        }
    }
    items.push(&tokens[start.min(end)..end]);

    let mut columns = Vec::new();
    let mut display_columns = Vec::new();
    for (n, item) in items.into_iter().enumerate() {
        if item.is_empty() {
            let (line, column) = position(sql, sql.len());
            return Err(SyntaxError::new("Empty select list item").at(line, column));
        }

        let alias = match item {
            [.., as_kw, alias] if as_kw.is_keyword("AS") => alias.identifier().map(str::to_string),
            _ => None,
        };

        match item {
            [Token::Symbol('*')] => {
                columns.push(ColumnRef {
                    schema: String::new(),
                    table: String::new(),
                    column: "*".to_string(),
                });
                display_columns.push("*".to_string());
                continue;
            }
            _ => {}
        }

        let reference = qualified_name(item, 0).filter(|(_, next)| {
            *next == item.len() || (item.len() == *next + 2 && item[*next].is_keyword("AS"))
        });
        if let Some((parts, _)) = reference {
            let (schema, table, column) = match parts.as_slice() {
                [column] => (String::new(), String::new(), column.clone()),
                [table, column] => (String::new(), table.clone(), column.clone()),
                [.., schema, table, column] => (schema.clone(), table.clone(), column.clone()),
                [] => continue,
            };
            display_columns.push(alias.clone().unwrap_or_else(|| column.clone()));
            columns.push(ColumnRef {
                schema,
                table,
                column,
            });
        } else {
            display_columns.push(alias.unwrap_or_else(|| format!("col_{}", n + 1)));
        }
    }
    Ok((columns, display_columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(sql: &str) -> ProcessedQuery {
        NativeSqlProcessor::new().process(sql).unwrap()
    }

    #[test]
    fn test_translate_adql_top() {
        let processor = NativeSqlProcessor::new();
        assert_eq!(
            processor
                .translate("adql", "SELECT TOP 10 ra, dec FROM gaia.dr3;")
                .unwrap(),
            "SELECT ra, dec FROM gaia.dr3 LIMIT 10"
        );
        assert_eq!(
            processor.translate("postgresql", " SELECT 1 ").unwrap(),
            "SELECT 1"
        );
        assert!(processor.translate("adql", "   ").is_err());
    }

    #[test]
    fn test_extracts_tables_functions_and_columns() {
        let q = process(
            "SELECT s.ra, s.dec AS declination, COUNT(*) FROM gaia.dr3 AS s, twomass t \
             JOIN \"sdss\".\"dr16\" d ON s.id = d.id WHERE pdist(s.ra, 1) < 2;",
        );
        assert_eq!(
            q.tables,
            vec![
                TableRef::new("gaia", "dr3"),
                TableRef::new("", "twomass"),
                TableRef::new("sdss", "dr16"),
            ]
        );
        assert_eq!(q.functions, vec!["count", "pdist"]);
        assert_eq!(q.display_columns, vec!["ra", "declination", "col_3"]);
        assert_eq!(q.columns.len(), 2);
        assert_eq!(q.columns[0].table, "s");
        assert!(q.keywords.contains(&"JOIN".to_string()));
        assert!(!q.query.ends_with(';'));
    }

    #[test]
    fn test_select_star() {
        let q = process("SELECT * FROM t");
        assert_eq!(q.display_columns, vec!["*"]);
        assert_eq!(q.tables, vec![TableRef::new("", "t")]);
    }

    #[test]
    fn test_rejects_writes_and_multiple_statements() {
        let processor = NativeSqlProcessor::new();
        assert!(processor.process("DELETE FROM t").is_err());
        assert!(processor.process("SELECT 1; DROP TABLE t").is_err());
        assert!(processor.process("SELECT (1").is_err());
    }

    #[test]
    fn test_syntax_error_position() {
        let err = NativeSqlProcessor::new()
            .process("SELECT a\nFROM t WHERE b = 'open")
            .unwrap_err();
        assert_eq!((err.line, err.column), (Some(2), Some(18)));
    }

    #[test]
    fn test_strings_and_comments_are_ignored() {
        let q = process("SELECT a FROM t -- FROM hidden\nWHERE b = 'FROM x'");
        assert_eq!(q.tables, vec![TableRef::new("", "t")]);
    }
}
