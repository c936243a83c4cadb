//! Pipeline runner
//!
//! Chains stages with bounded channels and runs each stage as its own task. Every
//! stage pulls from the previous stage's channel, up to its declared concurrency,
//! until the input is exhausted or the [`KillSwitch`] fires. Output of the last stage
//! is collected into the [`PipelineReport`].

use crate::cancel::KillSwitch;
use crate::error::{FatalError, SinkError};
use crate::payload::Payload;
use crate::stage::{Outbound, Stage};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Default capacity of each inter-stage channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Result of a pipeline that did not fail
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Units forwarded by the last stage, in arrival order
    pub output: Vec<Payload>,
    /// Units taken from the input
    pub units_in: usize,
    /// Stopped by [`KillSwitch::cancel`] rather than by exhausting the input
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    capacity: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Append a stage
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append a stage the caller keeps a handle to
    pub fn shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run<S>(&self, input: S) -> Result<PipelineReport, FatalError>
    where
        S: Stream<Item = Payload> + Send + 'static,
    {
        self.run_with(KillSwitch::new(), input).await
    }

    /// Run with a caller-owned kill switch, so the pipeline can be stopped from outside.
    ///
    /// Returns the first fatal error reported by any stage.
    pub async fn run_with<S>(&self, kill: KillSwitch, input: S) -> Result<PipelineReport, FatalError>
    where
        S: Stream<Item = Payload> + Send + 'static,
    {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        info!(stages = ?names, "Starting pipeline");

        let (feed_tx, mut upstream) = mpsc::channel(self.capacity);
        let feeder = tokio::spawn(feed(input, Outbound::new(feed_tx), kill.clone()));

        let mut workers = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let (tx, rx) = mpsc::channel(self.capacity);
            let inbound = std::mem::replace(&mut upstream, rx);
            workers.push((
                stage.name().to_string(),
                tokio::spawn(drive(stage.clone(), inbound, Outbound::new(tx), kill.clone())),
            ));
        }

        let output = collect(upstream, &kill).await;

        let units_in = match feeder.await {
            Ok(n) => n,
            Err(e) => {
                report_join_error("input", e, &kill);
                0
            },
        };
        for (name, worker) in workers {
            if let Err(e) = worker.await {
                report_join_error(&name, e, &kill);
            }
        }

        if let Some(err) = kill.take_error() {
            warn!(suppressed = kill.suppressed(), "Pipeline failed");
            return Err(err);
        }

        let cancelled = kill.is_cancelled();
        info!(units_in, units_out = output.len(), cancelled, "Pipeline finished");
        Ok(PipelineReport {
            output,
            units_in,
            cancelled,
        })
    }
}

async fn feed<S>(input: S, out: Outbound, kill: KillSwitch) -> usize
where
    S: Stream<Item = Payload> + Send + 'static,
{
    let mut input = std::pin::pin!(input);
    let mut count = 0;
    while let Some(unit) = input.next().await {
        if !out.send(unit, &kill).await {
            break;
        }
        count += 1;
    }
    count
}

/// Run one stage until its input closes or the pipeline is cancelled
async fn drive(stage: Arc<dyn Stage>, input: mpsc::Receiver<Payload>, out: Outbound, kill: KillSwitch) {
    let limit = stage.concurrency().max(1);
    debug!(stage = stage.name(), concurrency = limit, "Stage started");

    {
        let stage = &stage;
        let out = &out;
        let kill = &kill;
        ReceiverStream::new(input)
            .take_until(kill.cancelled())
            .for_each_concurrent(limit, move |unit| async move {
                if !kill.is_cancelled() {
                    stage.process_unit(unit, out, kill).await;
                }
            })
            .await;
    }

    if kill.is_cancelled() {
        debug!(stage = stage.name(), "Stage stopped by cancellation");
        return;
    }
    stage.finish(&out, &kill).await;
    debug!(stage = stage.name(), "Stage finished");
}

async fn collect(mut rx: mpsc::Receiver<Payload>, kill: &KillSwitch) -> Vec<Payload> {
    let mut output = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = kill.cancelled() => break,
            unit = rx.recv() => match unit {
                Some(unit) => output.push(unit),
                None => break,
            },
        }
    }
    output
}

fn report_join_error(stage: &str, err: tokio::task::JoinError, kill: &KillSwitch) {
    kill.report_fatal(FatalError::new(
        stage,
        SinkError::Execution(format!("stage task failed: {}", err)),
    ));
}

/// Handle to a pipeline running in the background
pub fn spawn<S>(
    pipeline: Pipeline,
    kill: KillSwitch,
    input: S,
) -> JoinHandle<Result<PipelineReport, FatalError>>
where
    S: Stream<Item = Payload> + Send + 'static,
{
    tokio::spawn(async move { pipeline.run_with(kill, input).await })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Forwards every unit and counts finish calls
    #[derive(Default)]
    struct Echo {
        finished: AtomicUsize,
    }

    #[async_trait]
    impl Stage for Echo {
        async fn process_unit(&self, unit: Payload, out: &Outbound, kill: &KillSwitch) {
            out.send(unit, kill).await;
        }

        async fn finish(&self, _out: &Outbound, _kill: &KillSwitch) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "Echo"
        }
    }

    /// Fails on a given unit
    struct FailOn(Payload);

    #[async_trait]
    impl Stage for FailOn {
        async fn process_unit(&self, unit: Payload, out: &Outbound, kill: &KillSwitch) {
            if unit == self.0 {
                kill.report_fatal(FatalError::new("FailOn", SinkError::execution("bad unit")));
                return;
            }
            out.send(unit, kill).await;
        }

        fn name(&self) -> &str {
            "FailOn"
        }
    }

    fn units(n: usize) -> Vec<Payload> {
        (0..n).map(|i| Payload::from(i.to_string().as_str())).collect()
    }

    #[tokio::test]
    async fn test_units_flow_through_in_order() {
        let echo = Arc::new(Echo::default());
        let pipeline = Pipeline::new()
            .shared_stage(echo.clone())
            .stage(Echo::default());

        let report = pipeline.run(futures::stream::iter(units(40))).await.unwrap();

        assert_eq!(report.units_in, 40);
        assert_eq!(report.output, units(40));
        assert!(!report.cancelled);
        assert_eq!(echo.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_error_stops_everything() {
        let echo = Arc::new(Echo::default());
        let pipeline = Pipeline::new()
            .with_capacity(1)
            .stage(FailOn(Payload::from("3")))
            .shared_stage(echo.clone());

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pipeline.run(futures::stream::iter(units(10_000))),
        )
        .await
        .expect("pipeline must not hang")
        .unwrap_err();

        assert_eq!(err.stage, "FailOn");
        assert_eq!(echo.finished.load(Ordering::SeqCst), 0, "finish only runs on clean exhaustion");
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let kill = KillSwitch::new();
        kill.cancel();

        let report = Pipeline::new()
            .stage(Echo::default())
            .run_with(kill, futures::stream::iter(units(5)))
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(report.output.len() <= 5);
    }

    #[tokio::test]
    async fn test_empty_pipeline_returns_input() {
        let report = Pipeline::new().run(futures::stream::iter(units(3))).await.unwrap();
        assert_eq!(report.output, units(3));
    }
}
