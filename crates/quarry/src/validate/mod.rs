use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Value, json};

use crate::models::{PermissionScope, RejectionReason};

/// Keywords that must never appear anywhere in a statement. Matched as
/// substrings of the upper-cased text, so `update_count` is refused too.
pub const BLOCKED_KEYWORDS: &[&str] = &[
    "UPDATE",
    "DELETE",
    "INSERT",
    "DROP",
    "ALTER",
    "TRUNCATE",
    "CREATE",
    "GRANT",
    "REVOKE",
    "EXEC",
    "EXECUTE",
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    EmptyStatement,
    UnsupportedStatement,
    MutatingStatement,
    MultiStatement,
    OutOfScopeTable,
}

impl ViolationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmptyStatement => "empty_statement",
            Self::UnsupportedStatement => "unsupported_statement",
            Self::MutatingStatement => "mutating_statement",
            Self::MultiStatement => "multi_statement",
            Self::OutOfScopeTable => "out_of_scope_table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyViolation {
    pub kind: ViolationKind,
    pub message: String,
    pub detected: Option<String>,
}

impl SafetyViolation {
    fn new(kind: ViolationKind, message: impl Into<String>, detected: Option<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detected,
        }
    }

    #[must_use]
    pub fn details(&self) -> Value {
        json!({
            "guardrail": "read_only_select_single_statement",
            "allowed_forms": ["SELECT ..."],
            "violation": {
                "reason": self.kind.as_str(),
                "detected": self.detected,
            }
        })
    }

    #[must_use]
    pub fn rejection_reason(&self) -> RejectionReason {
        match self.kind {
            ViolationKind::OutOfScopeTable => RejectionReason::OutOfScopeTable {
                table: self.detected.clone().unwrap_or_default(),
            },
            kind => RejectionReason::UnsafeStatement {
                violation: kind.as_str().to_string(),
                keyword: self.detected.clone(),
            },
        }
    }
}

/// The gate every candidate passes before execution, independent of what the
/// synthesizer claims about its own output.
pub trait SafetyValidator {
    fn check(&self, sql: &str, scope: &PermissionScope) -> Result<(), SafetyViolation>;
}

/// Read-only keyword gate, optionally followed by the table-scope check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOnlyValidator {
    pub enforce_table_scope: bool,
}

impl Default for ReadOnlyValidator {
    fn default() -> Self {
        Self {
            enforce_table_scope: true,
        }
    }
}

impl SafetyValidator for ReadOnlyValidator {
    fn check(&self, sql: &str, scope: &PermissionScope) -> Result<(), SafetyViolation> {
        check_read_only(sql)?;
        if self.enforce_table_scope {
            check_table_scope(sql, scope)?;
        }
        Ok(())
    }
}

#[must_use]
pub fn is_safe(sql: &str) -> bool {
    check_read_only(sql).is_ok()
}

pub fn check_read_only(raw_sql: &str) -> Result<(), SafetyViolation> {
    let trimmed = raw_sql.trim();
    if trimmed.is_empty() {
        return Err(SafetyViolation::new(
            ViolationKind::EmptyStatement,
            "SQL statement is empty",
            None,
        ));
    }

    let upper = trimmed.to_ascii_uppercase();
    let leading = leading_keyword(&upper);
    if leading != "SELECT" {
        return Err(SafetyViolation::new(
            ViolationKind::UnsupportedStatement,
            "Only SELECT statements are allowed",
            Some(leading.to_string()),
        ));
    }

    if let Some(keyword) = BLOCKED_KEYWORDS
        .iter()
        .find(|keyword| upper.contains(*keyword))
    {
        return Err(SafetyViolation::new(
            ViolationKind::MutatingStatement,
            format!("Blocked SQL keyword `{keyword}` is not allowed"),
            Some((*keyword).to_string()),
        ));
    }

    if strip_trailing_semicolons(trimmed).contains(';') {
        return Err(SafetyViolation::new(
            ViolationKind::MultiStatement,
            "Multi-statement SQL is not allowed; submit exactly one SELECT",
            None,
        ));
    }

    Ok(())
}

/// Rejects tables read in a `FROM` clause or `JOIN` that are outside the
/// scope. Comma-separated items, parenthesized table groups and comments are
/// all seen through. Names introduced by `WITH name AS (...)` count as local.
pub fn check_table_scope(sql: &str, scope: &PermissionScope) -> Result<(), SafetyViolation> {
    let tokens = tokenize(sql);
    let local_names = cte_names(&tokens);
    for table in tables_in(&tokens) {
        if local_names.contains(&table.to_ascii_lowercase()) || scope.allows_table(&table) {
            continue;
        }
        return Err(SafetyViolation::new(
            ViolationKind::OutOfScopeTable,
            format!(
                "Table `{table}` is outside the `{}` context",
                scope.context_id
            ),
            Some(table),
        ));
    }
    Ok(())
}

#[must_use]
pub fn referenced_tables(sql: &str) -> Vec<String> {
    tables_in(&tokenize(sql))
}

const FROM_CLAUSE_TERMINATORS: &[&str] = &[
    "WHERE", "GROUP", "HAVING", "WINDOW", "ORDER", "LIMIT", "UNION", "EXCEPT", "INTERSECT",
    "SELECT", "VALUES",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum SqlToken {
    Word { text: String, quoted: bool },
    Literal,
    Punct(char),
}

impl SqlToken {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word { text, quoted: false } if text.eq_ignore_ascii_case(keyword))
    }
}

/// Parenthesis nesting while walking a statement. Only a query frame has a
/// `FROM` clause; a table group is `FROM (a JOIN b ...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Query { in_from: bool },
    TableGroup,
    Expression,
}

impl Frame {
    const fn lists_tables(self) -> bool {
        matches!(self, Self::Query { in_from: true } | Self::TableGroup)
    }
}

fn tables_in(tokens: &[SqlToken]) -> Vec<String> {
    let mut frames = vec![Frame::Query { in_from: false }];
    let mut expect_table = false;
    let mut seen = BTreeSet::new();
    let mut tables = Vec::new();

    let mut index = 0;
    while index < tokens.len() {
        let token = &tokens[index];
        index += 1;

        if token.is_keyword("FROM") {
            if let Some(Frame::Query { in_from }) = frames.last_mut() {
                *in_from = true;
                expect_table = true;
            }
            continue;
        }
        if token.is_keyword("JOIN") {
            expect_table = frames.last().is_some_and(|frame| frame.lists_tables());
            continue;
        }
        if token.is_keyword("ON") || token.is_keyword("USING") {
            expect_table = false;
            continue;
        }
        if FROM_CLAUSE_TERMINATORS
            .iter()
            .any(|keyword| token.is_keyword(keyword))
        {
            if let Some(Frame::Query { in_from }) = frames.last_mut() {
                *in_from = false;
            }
            expect_table = false;
            continue;
        }

        match token {
            SqlToken::Punct('(') => {
                let frame = if starts_subquery(tokens.get(index)) {
                    Frame::Query { in_from: false }
                } else if expect_table {
                    Frame::TableGroup
                } else {
                    Frame::Expression
                };
                expect_table = frame == Frame::TableGroup;
                frames.push(frame);
            }
            SqlToken::Punct(')') => {
                if frames.len() > 1 {
                    frames.pop();
                }
                expect_table = false;
            }
            SqlToken::Punct(',') => {
                expect_table = frames.last().is_some_and(|frame| frame.lists_tables());
            }
            SqlToken::Word { text, .. } if expect_table => {
                let name = qualified_tail(tokens, &mut index, text);
                if seen.insert(name.to_ascii_lowercase()) {
                    tables.push(name);
                }
                expect_table = false;
            }
            _ => {}
        }
    }

    tables
}

fn starts_subquery(token: Option<&SqlToken>) -> bool {
    token.is_some_and(|token| {
        token.is_keyword("SELECT") || token.is_keyword("WITH") || token.is_keyword("VALUES")
    })
}

/// `main.inventory_balance` names the table `inventory_balance`.
fn qualified_tail(tokens: &[SqlToken], index: &mut usize, first: &str) -> String {
    let mut name = first.to_string();
    while let (Some(SqlToken::Punct('.')), Some(SqlToken::Word { text, .. })) =
        (tokens.get(*index), tokens.get(*index + 1))
    {
        name.clone_from(text);
        *index += 2;
    }
    name
}

fn cte_names(tokens: &[SqlToken]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for (start, token) in tokens.iter().enumerate() {
        if !token.is_keyword("WITH") {
            continue;
        }
        let mut index = start + 1;
        if tokens.get(index).is_some_and(|token| token.is_keyword("RECURSIVE")) {
            index += 1;
        }
        while let Some(SqlToken::Word { text, .. }) = tokens.get(index) {
            index += 1;
            if tokens.get(index) == Some(&SqlToken::Punct('(')) {
                index = skip_group(tokens, index);
            }
            if !tokens.get(index).is_some_and(|token| token.is_keyword("AS")) {
                break;
            }
            index += 1;
            while tokens
                .get(index)
                .is_some_and(|token| token.is_keyword("NOT") || token.is_keyword("MATERIALIZED"))
            {
                index += 1;
            }
            if tokens.get(index) != Some(&SqlToken::Punct('(')) {
                break;
            }
            names.insert(text.to_ascii_lowercase());
            index = skip_group(tokens, index);
            if tokens.get(index) != Some(&SqlToken::Punct(',')) {
                break;
            }
            index += 1;
        }
    }
    names
}

/// `open` points at a `(`; returns the index just past its matching `)`.
fn skip_group(tokens: &[SqlToken], open: usize) -> usize {
    let mut depth = 0_usize;
    for (index, token) in tokens.iter().enumerate().skip(open) {
        match token {
            SqlToken::Punct('(') => depth += 1,
            SqlToken::Punct(')') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return index + 1;
                }
            }
            _ => {}
        }
    }
    tokens.len()
}

/// Splits SQL into words, literals and punctuation. Comments vanish, quoted
/// identifiers become unquoted words, and string literals carry no text.
fn tokenize(sql: &str) -> Vec<SqlToken> {
    let chars = sql.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut index = 0;

    while let Some(&ch) = chars.get(index) {
        let next = chars.get(index + 1).copied();
        if ch.is_whitespace() {
            index += 1;
        } else if ch == '-' && next == Some('-') {
            while chars.get(index).is_some_and(|&ch| ch != '\n') {
                index += 1;
            }
        } else if ch == '/' && next == Some('*') {
            index += 2;
            while index < chars.len() && !(chars[index] == '*' && chars.get(index + 1) == Some(&'/')) {
                index += 1;
            }
            index = (index + 2).min(chars.len());
        } else if ch == '\'' {
            let (_, end) = read_delimited(&chars, index + 1, '\'');
            tokens.push(SqlToken::Literal);
            index = end;
        } else if let Some(close) = identifier_close(ch) {
            let (text, end) = read_delimited(&chars, index + 1, close);
            tokens.push(SqlToken::Word { text, quoted: true });
            index = end;
        } else if ch.is_alphabetic() || ch == '_' {
            let start = index;
            while chars
                .get(index)
                .is_some_and(|&ch| ch.is_alphanumeric() || matches!(ch, '_' | '$'))
            {
                index += 1;
            }
            tokens.push(SqlToken::Word {
                text: chars[start..index].iter().collect(),
                quoted: false,
            });
        } else if ch.is_ascii_digit() {
            while chars
                .get(index)
                .is_some_and(|&ch| ch.is_ascii_alphanumeric() || ch == '.')
            {
                index += 1;
            }
            tokens.push(SqlToken::Literal);
        } else {
            tokens.push(SqlToken::Punct(ch));
            index += 1;
        }
    }

    tokens
}

const fn identifier_close(open: char) -> Option<char> {
    match open {
        '"' => Some('"'),
        '`' => Some('`'),
        '[' => Some(']'),
        _ => None,
    }
}

/// Reads up to `close`, where a doubled `close` is an escaped one (except for
/// `]`). Returns the text and the index just past the closing character.
fn read_delimited(chars: &[char], mut index: usize, close: char) -> (String, usize) {
    let mut text = String::new();
    while let Some(&ch) = chars.get(index) {
        if ch == close {
            if close != ']' && chars.get(index + 1) == Some(&close) {
                text.push(close);
                index += 2;
                continue;
            }
            return (text, index + 1);
        }
        text.push(ch);
        index += 1;
    }
    (text, index)
}

fn leading_keyword(normalized_sql: &str) -> &str {
    normalized_sql
        .split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .find(|token| !token.is_empty())
        .unwrap_or("UNKNOWN")
}

fn strip_trailing_semicolons(raw_sql: &str) -> &str {
    let mut candidate = raw_sql.trim();
    while let Some(stripped) = candidate.strip_suffix(';') {
        candidate = stripped.trim_end();
    }
    candidate
}
