//! Pipeline-wide cancellation
//!
//! A [`KillSwitch`] is cloned into every stage. The first fatal error reported through
//! it is kept and the shared [`CancellationToken`] fires, which every stage and the
//! pipeline runner select on wherever they could otherwise block. Later reports are
//! counted and dropped so a stage never waits to be heard.

use crate::error::FatalError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Default)]
struct Inner {
    token: CancellationToken,
    first: Mutex<Option<FatalError>>,
    suppressed: AtomicUsize,
}

/// Single-fire, pipeline-wide error carrier
#[derive(Clone, Default)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal error and stop the pipeline.
    ///
    /// Never blocks. Returns `true` when this was the first error reported; any later
    /// error is logged at debug level and counted.
    pub fn report_fatal(&self, err: FatalError) -> bool {
        let mut slot = self.inner.first.lock().unwrap_or_else(PoisonError::into_inner);

        let first = slot.is_none();
        if first {
            tracing::error!(
                stage = %err.stage,
                table = err.table.as_deref().unwrap_or("-"),
                rows = err.rows_attempted,
                kind = %err.kind(),
                error = %err.source,
                "Fatal pipeline error"
            );
            *slot = Some(err);
        } else {
            self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stage = %err.stage, error = %err, "Suppressed error after shutdown began");
        }
        drop(slot);

        self.inner.token.cancel();
        first
    }

    /// Stop the pipeline without an error (e.g. Ctrl-C)
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the switch has fired
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Token to hand to code that only needs to observe shutdown
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Take the first reported error, if any
    pub fn take_error(&self) -> Option<FatalError> {
        self.inner
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Number of errors reported after the first
    pub fn suppressed(&self) -> usize {
        self.inner.suppressed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("cancelled", &self.is_cancelled())
            .field("suppressed", &self.suppressed())
            .finish()
    }
}
