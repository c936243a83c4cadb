//! Statement compilation
//!
//! Turns a [`NormalizedBatch`] and a [`WriteTarget`] into a parameterized multi-row
//! PostgreSQL INSERT, optionally followed by an `ON CONFLICT ... DO UPDATE` clause.
//!
//! ```text
//! INSERT INTO t(a,b) VALUES($1,$2),($3,$4) ON CONFLICT (a) DO UPDATE SET a=EXCLUDED.a,b=EXCLUDED.b
//! ```
//!
//! The statement text depends only on the column set, the row count, and the target,
//! never on the row values.

use crate::error::{Result, SinkError};
use crate::record::NormalizedBatch;
use regex::Regex;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::LazyLock;

/// PostgreSQL rejects statements binding more parameters than this.
pub const MAX_BIND_PARAMETERS: usize = 65_535;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$")
        .unwrap_or_else(|e| unreachable!("identifier pattern is valid: {e}"))
});

/// Where and how a batch is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub table_name: String,
    pub upsert_enabled: bool,
    /// Conflict target; required when `upsert_enabled`
    pub conflict_index: String,
    /// Columns assigned on conflict; empty means every column in the batch
    pub conflict_update_columns: Vec<String>,
}

impl WriteTarget {
    /// Plain INSERT into `table_name`
    pub fn insert(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            upsert_enabled: false,
            conflict_index: String::new(),
            conflict_update_columns: Vec::new(),
        }
    }

    /// INSERT that updates the existing row when `conflict_index` conflicts
    pub fn upsert(table_name: impl Into<String>, conflict_index: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            upsert_enabled: true,
            conflict_index: conflict_index.into(),
            conflict_update_columns: Vec::new(),
        }
    }

    pub fn with_update_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_update_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Same conflict handling, different table
    pub fn retarget(&self, table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..self.clone()
        }
    }

    /// Check the target independently of any data.
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.table_name) {
            return Err(SinkError::invalid_target(format!(
                "table name {:?} is not a valid identifier",
                self.table_name
            )));
        }
        if self.upsert_enabled && self.conflict_index.trim().is_empty() {
            return Err(SinkError::invalid_target(format!(
                "upsert into {} requires a conflict index",
                self.table_name
            )));
        }
        if self.upsert_enabled && !is_column_list(&self.conflict_index) {
            return Err(SinkError::invalid_target(format!(
                "conflict index {:?} must be a comma-separated list of column names",
                self.conflict_index
            )));
        }
        if let Some(bad) = self.conflict_update_columns.iter().find(|c| !is_identifier(c)) {
            return Err(SinkError::invalid_target(format!(
                "conflict update column {:?} is not a valid identifier",
                bad
            )));
        }
        Ok(())
    }
}

/// Statement text plus its positional bind values
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    /// Row-major, column-ordered; `args[i]` binds placeholder `$(i + 1)`
    pub args: Vec<Value>,
}

/// Compile a parameterized INSERT (or upsert) for `batch`.
///
/// Row `r`, column `c` is bound to placeholder `$(r * columns + c + 1)`.
pub fn compile_insert(batch: NormalizedBatch, target: &WriteTarget) -> Result<CompiledStatement> {
    check_shape(&batch, target)?;

    let width = batch.columns().len();
    let param_count = width * batch.row_count();
    if param_count > MAX_BIND_PARAMETERS {
        return Err(SinkError::invalid_target(format!(
            "{} rows x {} columns needs {} bind parameters, PostgreSQL allows {}; lower max_rows_per_statement",
            batch.row_count(),
            width,
            param_count,
            MAX_BIND_PARAMETERS
        )));
    }

    let mut sql = insert_head(&batch, &target.table_name);
    for row in 0..batch.row_count() {
        if row > 0 {
            sql.push(',');
        }
        sql.push('(');
        for col in 0..width {
            if col > 0 {
                sql.push(',');
            }
            let _ = write!(sql, "${}", row * width + col + 1);
        }
        sql.push(')');
    }

    if target.upsert_enabled {
        push_conflict_clause(&mut sql, &batch, target);
    }

    Ok(CompiledStatement {
        sql,
        args: batch.into_values(),
    })
}

/// Compile an INSERT with the values written inline as SQL literals.
///
/// **Not safe for untrusted input.** Strings are single-quoted with embedded quotes
/// doubled and nothing else; this exists for call sites that run outside a
/// transaction on data that has already been validated. Prefer [`compile_insert`].
/// Upsert settings are ignored.
pub fn compile_literal_insert(batch: &NormalizedBatch, table_name: &str) -> Result<String> {
    check_shape(batch, &WriteTarget::insert(table_name))?;

    let mut sql = insert_head(batch, table_name);
    for (idx, row) in batch.rows().iter().enumerate() {
        if idx > 0 {
            sql.push(',');
        }
        sql.push('(');
        for (col, value) in row.iter().enumerate() {
            if col > 0 {
                sql.push(',');
            }
            push_literal(&mut sql, value);
        }
        sql.push(')');
    }

    Ok(sql)
}

fn check_shape(batch: &NormalizedBatch, target: &WriteTarget) -> Result<()> {
    target.validate()?;

    if batch.columns().is_empty() {
        return Err(SinkError::invalid_target(format!(
            "cannot build an INSERT into {} with zero columns",
            target.table_name
        )));
    }
    if let Some(bad) = batch.columns().iter().find(|c| !is_identifier(c)) {
        return Err(SinkError::malformed(format!(
            "record key {:?} is not a valid column name",
            bad
        )));
    }
    Ok(())
}

fn insert_head(batch: &NormalizedBatch, table_name: &str) -> String {
    format!(
        "INSERT INTO {}({}) VALUES",
        table_name,
        batch.columns().as_slice().join(",")
    )
}

fn push_conflict_clause(sql: &mut String, batch: &NormalizedBatch, target: &WriteTarget) {
    let _ = write!(sql, " ON CONFLICT ({}) DO UPDATE SET ", target.conflict_index);

    let assignments: Vec<String> = if target.conflict_update_columns.is_empty() {
        batch.columns().iter().map(excluded_assignment).collect()
    } else {
        target
            .conflict_update_columns
            .iter()
            .map(|c| excluded_assignment(c))
            .collect()
    };
    sql.push_str(&assignments.join(","));
}

fn excluded_assignment(column: &str) -> String {
    format!("{0}=EXCLUDED.{0}", column)
}

fn push_literal(sql: &mut String, value: &Value) {
    match value {
        Value::Null => sql.push_str("NULL"),
        Value::Bool(b) => sql.push_str(if *b { "TRUE" } else { "FALSE" }),
        Value::Number(n) => {
            let _ = write!(sql, "{}", n);
        },
        Value::String(s) => quote_into(sql, s),
        nested => quote_into(sql, &nested.to_string()),
    }
}

fn quote_into(sql: &mut String, text: &str) {
    sql.push('\'');
    sql.push_str(&text.replace('\'', "''"));
    sql.push('\'');
}

fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// `id` or `tenant_id, id`
fn is_column_list(list: &str) -> bool {
    list.split(',').all(|column| is_identifier(column.trim()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::{normalize, Batch, Record};
    use proptest::prelude::*;
    use serde_json::json;

    fn normalized(value: Value) -> NormalizedBatch {
        normalize(Batch::from_value(value).unwrap().records())
    }

    #[test]
    fn test_plain_insert() {
        let stmt = compile_insert(
            normalized(json!([{"a": 1, "b": 2}, {"a": 3}])),
            &WriteTarget::insert("t"),
        )
        .unwrap();

        assert_eq!(stmt.sql, "INSERT INTO t(a,b) VALUES($1,$2),($3,$4)");
        assert_eq!(stmt.args, vec![json!(1), json!(2), json!(3), Value::Null]);
    }

    #[test]
    fn test_upsert_updates_all_columns_by_default() {
        let stmt = compile_insert(
            normalized(json!([{"a": 1, "b": 2}, {"a": 3}])),
            &WriteTarget::upsert("t", "a"),
        )
        .unwrap();

        assert!(stmt
            .sql
            .ends_with(" ON CONFLICT (a) DO UPDATE SET a=EXCLUDED.a,b=EXCLUDED.b"));
        assert_eq!(stmt.args.len(), 4);
    }

    #[test]
    fn test_upsert_with_explicit_update_columns() {
        let target = WriteTarget::upsert("public.t", "id").with_update_columns(["total", "name"]);
        let stmt = compile_insert(normalized(json!({"id": 1, "name": "x", "total": 2})), &target)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "INSERT INTO public.t(id,name,total) VALUES($1,$2,$3) \
             ON CONFLICT (id) DO UPDATE SET total=EXCLUDED.total,name=EXCLUDED.name"
        );
    }

    #[test]
    fn test_upsert_without_conflict_index_fails_at_compile() {
        let target = WriteTarget::upsert("t", "  ");
        let err = compile_insert(normalized(json!({"a": 1})), &target).unwrap_err();
        assert!(matches!(err, SinkError::InvalidTarget(_)));
    }

    #[test]
    fn test_zero_columns_is_invalid_target() {
        let err = compile_insert(normalized(json!([{}, {}])), &WriteTarget::insert("t")).unwrap_err();
        assert!(matches!(err, SinkError::InvalidTarget(_)));

        let err = compile_literal_insert(&normalized(json!([{}])), "t").unwrap_err();
        assert!(matches!(err, SinkError::InvalidTarget(_)));
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let err = compile_insert(normalized(json!({"a": 1})), &WriteTarget::insert("t; DROP TABLE t"))
            .unwrap_err();
        assert!(matches!(err, SinkError::InvalidTarget(_)));

        let err = compile_insert(normalized(json!({"a) VALUES (1); --": 1})), &WriteTarget::insert("t"))
            .unwrap_err();
        assert!(matches!(err, SinkError::MalformedInput(_)));

        let target = WriteTarget::upsert("t", "a").with_update_columns(["b=1"]);
        let err = compile_insert(normalized(json!({"a": 1})), &target).unwrap_err();
        assert!(matches!(err, SinkError::InvalidTarget(_)));
    }

    #[test]
    fn test_conflict_index_must_name_columns() {
        let batch = || normalized(json!({"tenant": 1, "id": 2}));

        let stmt = compile_insert(batch(), &WriteTarget::upsert("t", "tenant, id")).unwrap();
        assert!(stmt.sql.contains(" ON CONFLICT (tenant, id) DO UPDATE SET "));

        for bad in ["id) DO NOTHING; DROP TABLE t; --", "id,", "lower(email)"] {
            let err = compile_insert(batch(), &WriteTarget::upsert("t", bad)).unwrap_err();
            assert!(matches!(err, SinkError::InvalidTarget(_)), "{bad:?} accepted");
        }

        // ignored when upsert is off
        assert!(WriteTarget { conflict_index: "x y".into(), ..WriteTarget::insert("t") }
            .validate()
            .is_ok());
    }

    #[test]
    fn test_parameter_limit() {
        let row: Record = (0..100).map(|i| (format!("c{}", i), json!(i))).collect();
        let records = vec![row; 700];
        let err = compile_insert(normalize(&records), &WriteTarget::insert("wide")).unwrap_err();
        assert!(matches!(err, SinkError::InvalidTarget(_)));
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_literal_insert() {
        let sql = compile_literal_insert(
            &normalized(json!([{"a": 1, "b": "it's"}, {"a": 2.5, "c": true}])),
            "t",
        )
        .unwrap();

        assert_eq!(
            sql,
            "INSERT INTO t(a,b,c) VALUES(1,'it''s',NULL),(2.5,NULL,TRUE)"
        );
    }

    #[test]
    fn test_retarget_keeps_conflict_settings() {
        let target = WriteTarget::upsert("t1", "id").with_update_columns(["v"]);
        let other = target.retarget("t2");
        assert_eq!(other.table_name, "t2");
        assert_eq!(other.conflict_index, "id");
        assert_eq!(other.conflict_update_columns, vec!["v".to_string()]);
        assert_eq!(target.table_name, "t1");
    }

    proptest! {
        #[test]
        fn prop_statement_text_ignores_values(
            a in prop::collection::vec(any::<i64>(), 1..20),
            b in prop::collection::vec(".*", 1..20),
        ) {
            let rows = a.len().min(b.len());
            let first: Vec<Record> = (0..rows)
                .map(|i| [("k".to_string(), json!(a[i])), ("v".to_string(), json!(b[i]))].into_iter().collect())
                .collect();
            let second: Vec<Record> = (0..rows)
                .map(|i| [("k".to_string(), json!(i)), ("v".to_string(), Value::Null)].into_iter().collect())
                .collect();

            let target = WriteTarget::upsert("t", "k");
            let s1 = compile_insert(normalize(&first), &target).unwrap();
            let s2 = compile_insert(normalize(&second), &target).unwrap();

            prop_assert_eq!(&s1.sql, &s2.sql);
            prop_assert_eq!(s1.args.len(), rows * 2);
            prop_assert_eq!(s2.args.len(), rows * 2);
        }
    }
}
