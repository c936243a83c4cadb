//! In-memory database that records every call
//!
//! Used by `pgstage --dry-run` to show the statements a pipeline would issue, and by
//! tests to observe transaction boundaries and inject failures.

use super::{Database, DbError, DbResult, Transaction};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One observed call
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    Begin {
        tx: u64,
    },
    /// `tx` is `None` for statements run outside a transaction
    Execute {
        tx: Option<u64>,
        sql: String,
        args: Vec<Value>,
    },
    Commit {
        tx: u64,
    },
    Rollback {
        tx: u64,
    },
}

#[derive(Default)]
struct Faults {
    reject_matching: Vec<String>,
    #[cfg(test)]
    panic_matching: Vec<String>,
    fail_begin: bool,
    fail_commit: bool,
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<DbEvent>>,
    faults: Mutex<Faults>,
    next_tx: AtomicU64,
}

/// Recording [`Database`] with failure injection
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any statement containing `fragment`
    pub fn reject_statements_containing(&self, fragment: impl Into<String>) -> &Self {
        lock(&self.shared.faults).reject_matching.push(fragment.into());
        self
    }

    /// Panic while executing any statement containing `fragment`
    #[cfg(test)]
    pub(crate) fn panic_on_statements_containing(&self, fragment: impl Into<String>) -> &Self {
        lock(&self.shared.faults).panic_matching.push(fragment.into());
        self
    }

    pub fn fail_begin(&self) -> &Self {
        lock(&self.shared.faults).fail_begin = true;
        self
    }

    pub fn fail_commit(&self) -> &Self {
        lock(&self.shared.faults).fail_commit = true;
        self
    }

    pub fn events(&self) -> Vec<DbEvent> {
        lock(&self.shared.events).clone()
    }

    /// Every executed statement, in order, with its bind values
    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DbEvent::Execute { sql, args, .. } => Some((sql, args)),
                _ => None,
            })
            .collect()
    }

    /// Number of executed statements containing `fragment`
    pub fn count_statements_containing(&self, fragment: &str) -> usize {
        self.statements()
            .iter()
            .filter(|(sql, _)| sql.contains(fragment))
            .count()
    }

    pub fn commits(&self) -> usize {
        self.count_events(|e| matches!(e, DbEvent::Commit { .. }))
    }

    pub fn rollbacks(&self) -> usize {
        self.count_events(|e| matches!(e, DbEvent::Rollback { .. }))
    }

    fn count_events(&self, pred: impl Fn(&DbEvent) -> bool) -> usize {
        lock(&self.shared.events).iter().filter(|e| pred(e)).count()
    }

    fn record(&self, event: DbEvent) {
        lock(&self.shared.events).push(event);
    }

    fn run(&self, tx: Option<u64>, sql: &str, args: &[Value]) -> DbResult<u64> {
        let reject = lock(&self.shared.faults)
            .reject_matching
            .iter()
            .any(|f| sql.contains(f.as_str()));

        self.record(DbEvent::Execute {
            tx,
            sql: sql.to_string(),
            args: args.to_vec(),
        });

        #[cfg(test)]
        self.maybe_panic(sql);
        if reject {
            return Err(DbError::Rejected(format!("injected failure for: {}", sql)));
        }

        Ok(affected_rows(sql, args))
    }

    #[cfg(test)]
    fn maybe_panic(&self, sql: &str) {
        let panic = lock(&self.shared.faults)
            .panic_matching
            .iter()
            .any(|f| sql.contains(f.as_str()));
        if panic {
            panic!("injected panic while executing: {}", sql);
        }
    }
}

/// Rows an INSERT would affect: one per VALUES group. Other statements report zero.
fn affected_rows(sql: &str, args: &[Value]) -> u64 {
    if !sql.starts_with("INSERT INTO") {
        return 0;
    }
    if !args.is_empty() {
        let width = sql
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(cols, _)| cols.split(',').count())
            .unwrap_or(1);
        return (args.len() / width.max(1)) as u64;
    }
    sql.split_once(" VALUES")
        .map(|(_, values)| literal_row_groups(values))
        .unwrap_or(0)
}

/// Count the parenthesized row groups of a literal VALUES list, skipping over
/// quoted strings (`''` is an escaped quote and keeps the string open).
fn literal_row_groups(values: &str) -> u64 {
    let mut groups = 0;
    let mut depth = 0usize;
    let mut quoted = false;
    for c in values.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => {
                if depth == 0 {
                    groups += 1;
                }
                depth += 1;
            },
            ')' if !quoted => depth = depth.saturating_sub(1),
            _ => {},
        }
    }
    groups
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        if lock(&self.shared.faults).fail_begin {
            return Err(DbError::Rejected("injected begin failure".to_string()));
        }
        let id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(DbEvent::Begin { tx: id });
        Ok(Box::new(MemoryTransaction {
            id,
            db: self.clone(),
            finished: false,
        }))
    }

    async fn execute(&self, sql: &str) -> DbResult<u64> {
        self.run(None, sql, &[])
    }
}

struct MemoryTransaction {
    id: u64,
    db: MemoryDatabase,
    finished: bool,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64> {
        self.db.run(Some(self.id), sql, args)
    }

    async fn commit(mut self: Box<Self>) -> DbResult<()> {
        self.finished = true;
        if lock(&self.db.shared.faults).fail_commit {
            self.db.record(DbEvent::Rollback { tx: self.id });
            return Err(DbError::Rejected("injected commit failure".to_string()));
        }
        self.db.record(DbEvent::Commit { tx: self.id });
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> DbResult<()> {
        self.finished = true;
        self.db.record(DbEvent::Rollback { tx: self.id });
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    // mirrors sqlx: an unfinished transaction is rolled back when dropped
    fn drop(&mut self) {
        if !self.finished {
            self.db.record(DbEvent::Rollback { tx: self.id });
        }
    }
}
