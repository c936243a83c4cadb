//! Shared helpers for pgstage integration tests
//!
//! Most tests run against [`MemoryDatabase`]; [`TestPostgres`] starts a throwaway
//! PostgreSQL container for the round-trip tests (requires Docker).

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use pgstage::db::DbResult;
use pgstage::{Database, KillSwitch, MemoryDatabase, Outbound, Payload, Transaction};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::mpsc;
use tracing::info;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pgstage=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One payload per JSON value
pub fn payloads(values: impl IntoIterator<Item = Value>) -> Vec<Payload> {
    values.into_iter().map(Payload::from).collect()
}

/// Outbound channel with its receiving end
pub fn outbound(capacity: usize) -> (Outbound, mpsc::Receiver<Payload>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbound::new(tx), rx)
}

/// Drain everything currently buffered in `rx`
pub fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Payload> {
    let mut out = Vec::new();
    while let Ok(unit) = rx.try_recv() {
        out.push(unit);
    }
    out
}

/// Fresh switch plus an assertion helper for the common "nothing went wrong" case
pub fn kill_switch() -> KillSwitch {
    KillSwitch::new()
}

pub fn assert_clean(kill: &KillSwitch) {
    if let Some(err) = kill.take_error() {
        panic!("unexpected fatal error: {err}");
    }
}

/// [`MemoryDatabase`] whose n-th `begin` completes only after `delays[n]`.
/// Calls past the end of `delays` complete immediately.
pub struct LaggyDatabase {
    inner: MemoryDatabase,
    delays: Vec<Duration>,
    calls: AtomicUsize,
}

impl LaggyDatabase {
    pub fn new(inner: MemoryDatabase, delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            inner,
            delays: delays.into_iter().collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Database for LaggyDatabase {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(call) {
            tokio::time::sleep(*delay).await;
        }
        self.inner.begin().await
    }

    async fn execute(&self, sql: &str) -> DbResult<u64> {
        self.inner.execute(sql).await
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}
