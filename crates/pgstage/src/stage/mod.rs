//! Pipeline stages
//!
//! A [`Stage`] is driven by the [`Pipeline`](crate::Pipeline) runner: it receives
//! units one at a time (or up to [`Stage::concurrency`] at once), may forward units on
//! its [`Outbound`] channel, and reports anything fatal through the
//! [`KillSwitch`](crate::KillSwitch) instead of returning it.

mod passthrough;
mod write;

pub use passthrough::PassthroughStage;
pub use write::WriteStage;

use crate::cancel::KillSwitch;
use crate::error::{Result, SinkError};
use crate::payload::Payload;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;

#[async_trait]
pub trait Stage: Send + Sync {
    /// Handle one unit. Failures go to `kill`; nothing is returned.
    async fn process_unit(&self, unit: Payload, out: &Outbound, kill: &KillSwitch);

    /// Called once after the input is exhausted, unless the pipeline was cancelled
    async fn finish(&self, _out: &Outbound, _kill: &KillSwitch) {}

    /// Units this stage may process at the same time
    fn concurrency(&self) -> usize {
        1
    }

    /// Diagnostic label
    fn name(&self) -> &str;
}

/// Sending half of a stage's output channel
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Payload>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Payload>) -> Self {
        Self { tx }
    }

    /// Forward `unit` downstream.
    ///
    /// Returns `false` without waiting further once the pipeline is cancelled or the
    /// receiver is gone.
    pub async fn send(&self, unit: Payload, kill: &KillSwitch) -> bool {
        tokio::select! {
            biased;
            _ = kill.cancelled() => false,
            sent = self.tx.send(unit) => sent.is_ok(),
        }
    }
}

/// Run `work`, turning a panic into [`SinkError::Execution`].
pub(crate) async fn fault_boundary<F, T>(work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(SinkError::Execution(format!(
            "fault while processing unit: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::FatalError;

    #[tokio::test]
    async fn test_fault_boundary_converts_panics() {
        let err = fault_boundary(async {
            if true {
                panic!("invariant broken");
            }
            Ok::<_, SinkError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SinkError::Execution(ref msg) if msg.contains("invariant broken")));
    }

    #[tokio::test]
    async fn test_fault_boundary_passes_results_through() {
        let value = fault_boundary(async { Ok::<_, SinkError>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err = fault_boundary(async { Err::<(), _>(SinkError::malformed("bad")) })
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn test_send_returns_false_after_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let out = Outbound::new(tx);
        let kill = KillSwitch::new();

        assert!(out.send(Payload::from("1"), &kill).await);

        // channel is now full; without cancellation this send would wait forever
        kill.report_fatal(FatalError::new("test", SinkError::execution("stop")));
        assert!(!out.send(Payload::from("2"), &kill).await);
    }

    #[tokio::test]
    async fn test_send_to_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let out = Outbound::new(tx);
        assert!(!out.send(Payload::from("1"), &KillSwitch::new()).await);
    }
}
