//! Parameter binding utilities for database queries.
//!
//! This module provides the `SqlParam` value model and the functions that
//! bind it to database-specific query objects. Binding is driven by the
//! runtime type of each value: typed nulls, dates as timestamps, large text
//! flagged for character-large-object treatment and byte arrays flagged for
//! binary-large-object treatment.

use crate::db::conn::DbKind;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

/// Declared SQL type for an explicitly typed null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Int,
    Float,
    Bool,
    Bytes,
    Timestamp,
}

/// One bind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// Null, optionally with an explicit SQL type.
    Null(Option<SqlType>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Large string bound as a character large object.
    LargeText(String),
    /// Byte array bound as a binary large object.
    Bytes(Vec<u8>),
    /// Dates always bind as timestamps.
    Timestamp(DateTime<Utc>),
}

impl SqlParam {
    pub fn str(v: impl Into<String>) -> Self {
        Self::Str(v.into())
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i32> for SqlParam {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q SqlParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        SqlParam::Null(ty) => bind_null_mysql(query, *ty),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Str(v) => query.bind(v.as_str()),
        SqlParam::LargeText(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
        SqlParam::Timestamp(v) => query.bind(*v),
    }
}

fn bind_null_mysql<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    ty: Option<SqlType>,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match ty {
        Some(SqlType::Int) => query.bind(None::<i64>),
        Some(SqlType::Float) => query.bind(None::<f64>),
        Some(SqlType::Bool) => query.bind(None::<bool>),
        Some(SqlType::Bytes) => query.bind(None::<Vec<u8>>),
        Some(SqlType::Timestamp) => query.bind(None::<DateTime<Utc>>),
        Some(SqlType::Text) | None => query.bind(None::<String>),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q SqlParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        SqlParam::Null(ty) => bind_null_postgres(query, *ty),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Str(v) => query.bind(v.as_str()),
        SqlParam::LargeText(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
        SqlParam::Timestamp(v) => query.bind(*v),
    }
}

fn bind_null_postgres<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    ty: Option<SqlType>,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match ty {
        Some(SqlType::Int) => query.bind(None::<i64>),
        Some(SqlType::Float) => query.bind(None::<f64>),
        Some(SqlType::Bool) => query.bind(None::<bool>),
        Some(SqlType::Bytes) => query.bind(None::<Vec<u8>>),
        Some(SqlType::Timestamp) => query.bind(None::<DateTime<Utc>>),
        Some(SqlType::Text) | None => query.bind(None::<String>),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q SqlParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        SqlParam::Null(ty) => bind_null_sqlite(query, *ty),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Str(v) => query.bind(v.as_str()),
        SqlParam::LargeText(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
        SqlParam::Timestamp(v) => query.bind(*v),
    }
}

fn bind_null_sqlite<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ty: Option<SqlType>,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match ty {
        Some(SqlType::Int) => query.bind(None::<i64>),
        Some(SqlType::Float) => query.bind(None::<f64>),
        Some(SqlType::Bool) => query.bind(None::<bool>),
        Some(SqlType::Bytes) => query.bind(None::<Vec<u8>>),
        Some(SqlType::Timestamp) => query.bind(None::<DateTime<Utc>>),
        Some(SqlType::Text) | None => query.bind(None::<String>),
    }
}

/// Count the bind placeholders in a statement.
///
/// `?` markers for MySQL/SQLite, the highest `$n` for PostgreSQL. Quoted
/// literals and quoted identifiers are skipped.
pub(crate) fn placeholder_count(kind: DbKind, sql: &str) -> usize {
    match kind {
        DbKind::MySql | DbKind::Sqlite => count_question_marks(sql),
        DbKind::Postgres => max_numbered_placeholder(sql),
    }
}

fn count_question_marks(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}

fn max_numbered_placeholder(sql: &str) -> usize {
    let mut max = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '$' => {
                    let mut n = 0usize;
                    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                        n = n * 10 + d as usize;
                        chars.next();
                    }
                    max = max.max(n);
                }
                _ => {}
            },
        }
    }
    max
}

/// Rewrite `?` markers into `$1..$n` for engines with numbered placeholders.
pub(crate) fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_conversions() {
        assert_eq!(SqlParam::from(7i32), SqlParam::Int(7));
        assert_eq!(SqlParam::from("x"), SqlParam::Str("x".to_string()));
        assert_eq!(SqlParam::from(true), SqlParam::Bool(true));
    }

    #[test]
    fn test_count_question_marks() {
        assert_eq!(count_question_marks("SELECT * FROM t WHERE a = ? AND b = ?"), 2);
        assert_eq!(count_question_marks("SELECT '?' FROM t WHERE a = ?"), 1);
        assert_eq!(count_question_marks("SELECT \"a?\" FROM t"), 0);
        assert_eq!(count_question_marks("SELECT `c?` FROM t WHERE a = ?"), 1);
        assert_eq!(count_question_marks("SELECT 1"), 0);
    }

    #[test]
    fn test_max_numbered_placeholder() {
        assert_eq!(max_numbered_placeholder("SELECT $1, $2 WHERE a = $3"), 3);
        assert_eq!(max_numbered_placeholder("SELECT '$9' WHERE a = $2"), 2);
        assert_eq!(max_numbered_placeholder("SELECT 1"), 0);
    }

    #[test]
    fn test_placeholder_count_by_kind() {
        assert_eq!(
            placeholder_count(DbKind::MySql, "INSERT INTO t VALUES (?, ?)"),
            2
        );
        assert_eq!(
            placeholder_count(DbKind::Postgres, "INSERT INTO t VALUES ($1, $2)"),
            2
        );
    }

    #[test]
    fn test_numbered_placeholders_rewrite() {
        assert_eq!(
            numbered_placeholders("SELECT CONCAT(?, ?)"),
            "SELECT CONCAT($1, $2)"
        );
        assert_eq!(
            numbered_placeholders("SELECT '?' WHERE a = ?"),
            "SELECT '?' WHERE a = $1"
        );
        assert_eq!(numbered_placeholders("SELECT 1"), "SELECT 1");
    }
}
