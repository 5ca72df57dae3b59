//! Runtime database-capability probing.
//!
//! Runs once per handle, on first demand: a battery of dialect probe
//! statements determines how the engine spells string concatenation, row
//! limiting and text casts, which trivial statement keeps a connection
//! alive, and which string-length semantics apply. Each sub-probe is
//! independently best-effort - probing wrong syntax is an expected, silent
//! event - so failures leave the corresponding capability unset and the
//! caller falls back to a conservative default.
//!
//! The probe is single-flight per handle and the result latches only at
//! the end of a successful run, so a probe that failed to obtain a
//! connection can be retried by a later call.

use crate::db::conn::{DbKind, DbProduct};
use crate::db::executor::{ExecOptions, QueryExecutor};
use crate::db::params::{SqlParam, numbered_placeholders};
use crate::db::registry::Handle;
use crate::db::transaction::ContextId;
use crate::db::truncate::LengthSemantics;
use crate::error::{DbError, DbResult};
use tracing::{debug, info};

/// How the engine spells string concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatStyle {
    /// `CONCAT(a, b)`
    Function,
    /// `CONCAT(a, b)` requiring a dummy source table.
    FunctionDual,
    /// `a + b`
    PlusOperator,
    /// `a || b`
    PipesOperator,
}

impl ConcatStyle {
    /// Render a concatenation of two SQL fragments.
    pub fn expression(&self, left: &str, right: &str) -> String {
        match self {
            Self::Function | Self::FunctionDual => format!("CONCAT({left}, {right})"),
            Self::PlusOperator => format!("({left} + {right})"),
            Self::PipesOperator => format!("({left} || {right})"),
        }
    }
}

/// How the engine limits result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// Trailing `LIMIT n`.
    Trailing,
    /// `ROWNUM` range predicate.
    Rownum,
    Unsupported,
}

/// Cast statement shape that round-trips values through a text type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextCast {
    /// Type name accepted by `CAST(... AS type)`.
    pub type_name: String,
    /// Whether the value must be truncated with SUBSTR before casting.
    pub truncate_before_cast: bool,
}

/// Probed dialect capabilities of one handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub product: DbProduct,
    pub concat: Option<ConcatStyle>,
    pub limit: LimitStyle,
    pub text_cast: Option<TextCast>,
    /// Trivial statement usable as a connection-liveness probe.
    pub keep_alive: Option<String>,
    pub length_semantics: LengthSemantics,
    pub folds_uppercase: bool,
    pub supports_batch: bool,
}

const CONCAT_PROBES: &[(ConcatStyle, &str)] = &[
    (ConcatStyle::Function, "SELECT CONCAT(?, ?)"),
    (ConcatStyle::FunctionDual, "SELECT CONCAT(?, ?) FROM DUAL"),
    (ConcatStyle::PlusOperator, "SELECT ? + ?"),
    (ConcatStyle::PipesOperator, "SELECT ? || ?"),
];

const LIMIT_PROBES: &[(LimitStyle, &str)] = &[
    (LimitStyle::Trailing, "SELECT 1 LIMIT 1"),
    (LimitStyle::Trailing, "SELECT 1 FROM DUAL LIMIT 1"),
    (LimitStyle::Rownum, "SELECT 1 FROM DUAL WHERE ROWNUM <= 1"),
];

/// (template, truncates before cast) - `{}` is replaced by the type name.
const CAST_PROBES: &[(&str, bool)] = &[
    ("SELECT CAST(? AS {})", false),
    ("SELECT CAST(? AS {}) FROM DUAL", false),
    ("SELECT CAST(SUBSTR(?, 1, 255) AS {})", true),
    ("SELECT CAST(SUBSTR(?, 1, 255) AS {}) FROM DUAL", true),
];

const CAST_TYPE_NAMES: &[&str] = &["CHAR", "TEXT", "VARCHAR(255)"];

const KEEP_ALIVE_PROBES: &[&str] = &["SELECT 1", "SELECT 1 FROM DUAL", "VALUES(1)"];

/// Determines a handle's dialect capabilities, once.
#[derive(Debug, Clone)]
pub struct CapabilityProber {
    executor: QueryExecutor,
}

impl CapabilityProber {
    pub fn new(executor: QueryExecutor) -> Self {
        Self { executor }
    }

    /// The handle's capabilities, probing them on first call. Subsequent
    /// calls return the cached result without touching the database.
    pub async fn ensure(&self, handle: &Handle) -> DbResult<Capabilities> {
        let state = self.executor.transactions().registry().lookup(handle)?;
        let caps = state
            .capabilities
            .get_or_try_init(|| self.run_probe(handle))
            .await?;
        Ok(caps.clone())
    }

    async fn run_probe(&self, handle: &Handle) -> DbResult<Capabilities> {
        let state = self.executor.transactions().registry().lookup(handle)?;
        let kind = state.connector().kind()?;

        // The probe runs under its own context so a failing sub-probe can
        // never poison a caller's open transaction.
        let ctx = ContextId::new();

        let version = self.server_version(&ctx, handle).await?;
        let product = DbProduct::from_version(kind, &version);
        info!(handle = %handle, product = %product, version = %version, "probing database capabilities");

        let concat = self.probe_concat(&ctx, handle, kind).await;
        let limit = self.probe_limit(&ctx, handle).await;
        let text_cast = self.probe_text_cast(&ctx, handle, kind).await;
        let keep_alive = self.probe_keep_alive(&ctx, handle).await;
        let length_semantics = self.probe_length_semantics(&ctx, handle, product).await;

        let caps = Capabilities {
            product,
            concat,
            limit,
            text_cast,
            keep_alive,
            length_semantics,
            folds_uppercase: product.folds_uppercase(),
            supports_batch: product.supports_batch(),
        };
        info!(
            handle = %handle,
            concat = ?caps.concat,
            limit = ?caps.limit,
            semantics = %caps.length_semantics,
            "database capabilities probed"
        );
        Ok(caps)
    }

    async fn server_version(&self, ctx: &ContextId, handle: &Handle) -> DbResult<String> {
        let state = self.executor.transactions().registry().lookup(handle)?;
        let sql = state.connector().kind()?.version_sql();
        self.executor
            .query_opts(ctx, handle, sql, &[], &ExecOptions::quiet(), |rs| {
                if rs.next() {
                    Ok(rs.get_string(0)?.unwrap_or_default())
                } else {
                    Err(DbError::probe_inconclusive("server version"))
                }
            })
            .await
    }

    async fn probe_concat(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        kind: DbKind,
    ) -> Option<ConcatStyle> {
        let params = [SqlParam::str("para"), SqlParam::str("meter")];
        for (style, template) in CONCAT_PROBES {
            let sql = dialect_sql(kind, template);
            let result = self
                .executor
                .query_opts(ctx, handle, &sql, &params, &ExecOptions::quiet(), |rs| {
                    if rs.next() { rs.get_string(0) } else { Ok(None) }
                })
                .await;
            if let Ok(Some(value)) = result {
                if value == "parameter" {
                    debug!(handle = %handle, style = ?style, "concat style detected");
                    return Some(*style);
                }
            }
        }
        debug!(handle = %handle, "concat style undetermined");
        None
    }

    async fn probe_limit(&self, ctx: &ContextId, handle: &Handle) -> LimitStyle {
        for (style, sql) in LIMIT_PROBES {
            let result = self
                .executor
                .query_opts(ctx, handle, sql, &[], &ExecOptions::quiet(), |_| Ok(()))
                .await;
            if result.is_ok() {
                debug!(handle = %handle, style = ?style, "limit style detected");
                return *style;
            }
        }
        debug!(handle = %handle, "row limiting unsupported");
        LimitStyle::Unsupported
    }

    async fn probe_text_cast(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        kind: DbKind,
    ) -> Option<TextCast> {
        let long_value = "lorem-ipsum-".repeat(16);
        for (template, truncates) in CAST_PROBES {
            for type_name in CAST_TYPE_NAMES {
                let sql = dialect_sql(kind, &template.replace("{}", type_name));
                if self.round_trips(ctx, handle, &sql, SqlParam::Int(42), "42").await
                    && self
                        .round_trips(
                            ctx,
                            handle,
                            &sql,
                            SqlParam::str(long_value.as_str()),
                            &long_value,
                        )
                        .await
                {
                    debug!(handle = %handle, cast_type = type_name, "text cast detected");
                    return Some(TextCast {
                        type_name: type_name.to_string(),
                        truncate_before_cast: *truncates,
                    });
                }
            }
        }
        debug!(handle = %handle, "text cast undetermined");
        None
    }

    async fn round_trips(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        sql: &str,
        param: SqlParam,
        expected: &str,
    ) -> bool {
        let result = self
            .executor
            .query_opts(
                ctx,
                handle,
                sql,
                std::slice::from_ref(&param),
                &ExecOptions::quiet(),
                |rs| {
                    if rs.next() { rs.get_string(0) } else { Ok(None) }
                },
            )
            .await;
        matches!(result, Ok(Some(value)) if value == expected)
    }

    async fn probe_keep_alive(&self, ctx: &ContextId, handle: &Handle) -> Option<String> {
        for sql in KEEP_ALIVE_PROBES {
            let result = self
                .executor
                .query_opts(ctx, handle, sql, &[], &ExecOptions::quiet(), |_| Ok(()))
                .await;
            if result.is_ok() {
                return Some(sql.to_string());
            }
        }
        None
    }

    async fn probe_length_semantics(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        product: DbProduct,
    ) -> LengthSemantics {
        match product {
            // Character-semantics engine: lengths count code points.
            DbProduct::Postgres => LengthSemantics::CodePoints,
            // UTF-16 storage encodings: lengths count code units.
            DbProduct::Sqlite => LengthSemantics::Utf16Units,
            // Session-configurable: a Unicode connection character set
            // counts code points, anything else counts bytes.
            DbProduct::MySql | DbProduct::MariaDb => {
                let charset = self
                    .executor
                    .query_opts(
                        ctx,
                        handle,
                        "SELECT @@character_set_connection",
                        &[],
                        &ExecOptions::quiet(),
                        |rs| {
                            if rs.next() { rs.get_string(0) } else { Ok(None) }
                        },
                    )
                    .await;
                match charset {
                    Ok(Some(cs)) if cs.to_lowercase().starts_with("utf8") => {
                        LengthSemantics::CodePoints
                    }
                    Ok(Some(_)) => LengthSemantics::Bytes,
                    _ => {
                        debug!(handle = %handle, "connection character set undetermined");
                        LengthSemantics::Bytes
                    }
                }
            }
            DbProduct::Unknown => LengthSemantics::Bytes,
        }
    }
}

/// Rewrite a `?`-placeholder probe template for the target dialect.
fn dialect_sql(kind: DbKind, template: &str) -> String {
    match kind {
        DbKind::Postgres => numbered_placeholders(template),
        DbKind::MySql | DbKind::Sqlite => template.to_string(),
    }
}
