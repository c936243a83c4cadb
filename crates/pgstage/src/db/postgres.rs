//! PostgreSQL implementation of the database collaborator
//!
//! Every bind value is sent as text and cast to the type the server infers for its
//! placeholder, so the target column decides how `"2024-01-02T03:04:05Z"`, a UUID or
//! a 20-digit integer is parsed:
//!
//! ```text
//! INSERT INTO t(id,at) VALUES($1,$2)
//! INSERT INTO t(id,at) VALUES($1::text::bigint,$2::text::timestamp with time zone)
//! ```
//!
//! The rewritten text is cached per statement, so each statement shape costs one
//! extra round trip to describe.

use super::{Database, DbResult, Transaction};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::{Either, Executor, PgConnection, Postgres, Statement as _};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

/// Resolves parameter type OIDs to names usable in a cast, in input order. A typmod
/// of -1 keeps `bpchar` from being named `character`, which would mean `char(1)`.
const FORMAT_TYPES_SQL: &str = "SELECT format_type(t.oid::oid, -1) \
     FROM unnest($1::int8[]) WITH ORDINALITY AS t(oid, n) ORDER BY t.n";

/// Cast statement text, keyed by the statement as compiled
type CastCache = Arc<Mutex<HashMap<String, Arc<str>>>>;

/// Shared connection pool; each transaction checks out its own connection
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    casts: CastCache,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            casts: CastCache::default(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction {
            tx,
            casts: self.casts.clone(),
        }))
    }

    async fn execute(&self, sql: &str) -> DbResult<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// An open `sqlx` transaction. Dropping it without commit rolls back.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    casts: CastCache,
}

impl PgTransaction {
    /// `sql` with every placeholder cast from text to its inferred type
    async fn with_casts(&mut self, sql: &str) -> DbResult<Arc<str>> {
        if let Some(cached) = self.cached(sql) {
            return Ok(cached);
        }

        let conn: &mut PgConnection = &mut self.tx;
        let statement = conn.prepare(sql).await?;
        let oids: Vec<i64> = match statement.parameters() {
            Some(Either::Left(types)) => types
                .iter()
                .map(|ty| ty.oid().map_or(0, |oid| i64::from(oid.0)))
                .collect(),
            _ => Vec::new(),
        };
        let names: Vec<String> = sqlx::query_scalar(FORMAT_TYPES_SQL)
            .bind(oids)
            .fetch_all(&mut *self.tx)
            .await?;

        let rewritten: Arc<str> = cast_placeholders(sql, &names).into();
        self.casts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sql.to_string(), rewritten.clone());
        Ok(rewritten)
    }

    fn cached(&self, sql: &str) -> Option<Arc<str>> {
        self.casts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sql)
            .cloned()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64> {
        if args.is_empty() {
            let result = sqlx::query(sql).execute(&mut *self.tx).await?;
            return Ok(result.rows_affected());
        }

        let sql = self.with_casts(sql).await?;
        let query = args.iter().fold(sqlx::query(&sql), bind_text);
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Bind the text form of a JSON value; NULL stays NULL.
fn bind_text<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::String(s) => query.bind(s.clone()),
        // numbers keep their exact digits, nested values become JSON text
        other => query.bind(other.to_string()),
    }
}

/// Rewrite each `$n` that starts a value (after `(` or `,`) to `$n::text::<type>`.
///
/// `types[n - 1]` is the type name for `$n`; placeholders without one, or whose type
/// is already `text`, are only declared as text.
fn cast_placeholders(sql: &str, types: &[String]) -> String {
    let mut out = String::with_capacity(sql.len() * 2);
    let mut chars = sql.chars().peekable();
    let mut prev = ' ';

    while let Some(c) = chars.next() {
        let starts_value = prev == '(' || prev == ',';
        prev = c;
        if c != '$' || !starts_value {
            out.push(c);
            continue;
        }

        let mut digits = String::new();
        while let Some(&d) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits.push(d);
            chars.next();
        }
        let Ok(position) = digits.parse::<usize>() else {
            out.push('$');
            out.push_str(&digits);
            continue;
        };

        let _ = write!(out, "${}::text", position);
        match types.get(position.wrapping_sub(1)).map(String::as_str) {
            Some(ty) if !matches!(ty, "text" | "unknown" | "-") => {
                let _ = write!(out, "::{}", ty);
            },
            _ => {},
        }
        prev = '0';
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn names(types: &[&str]) -> Vec<String> {
        types.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_placeholders_cast_to_column_types() {
        let sql = cast_placeholders(
            "INSERT INTO t(id,at) VALUES($1,$2),($3,$4) ON CONFLICT (id) DO UPDATE SET at=EXCLUDED.at",
            &names(&["bigint", "timestamp with time zone", "bigint", "timestamp with time zone"]),
        );
        assert_eq!(
            sql,
            "INSERT INTO t(id,at) VALUES($1::text::bigint,$2::text::timestamp with time zone),\
             ($3::text::bigint,$4::text::timestamp with time zone) \
             ON CONFLICT (id) DO UPDATE SET at=EXCLUDED.at"
        );
    }

    #[test]
    fn test_text_and_unresolved_placeholders_stay_text() {
        let sql = cast_placeholders(
            "INSERT INTO t(a,b,c,d) VALUES($1,$2,$3,$4)",
            &names(&["text", "uuid", "-"]),
        );
        assert_eq!(
            sql,
            "INSERT INTO t(a,b,c,d) VALUES($1::text,$2::text::uuid,$3::text,$4::text)"
        );
    }

    #[test]
    fn test_dollar_inside_identifiers_is_not_a_placeholder() {
        let sql = cast_placeholders("INSERT INTO t(a$1,b) VALUES($1,$2)", &names(&["integer", "integer"]));
        assert_eq!(
            sql,
            "INSERT INTO t(a$1,b) VALUES($1::text::integer,$2::text::integer)"
        );
    }

    #[test]
    fn test_multi_digit_placeholders() {
        let types = names(&["integer"; 12]);
        let sql = cast_placeholders("INSERT INTO t(a) VALUES($11),($12)", &types);
        assert_eq!(sql, "INSERT INTO t(a) VALUES($11::text::integer),($12::text::integer)");
    }

    #[tokio::test]
    async fn test_database_construction_is_lazy() {
        let pool = PgPool::connect_lazy("postgresql://localhost/test").unwrap();
        let db = PgDatabase::new(pool);
        assert_eq!(db.pool().size(), 0);
    }
}
