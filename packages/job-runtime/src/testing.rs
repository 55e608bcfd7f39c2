//! Test utilities: simulated clock, scripted handlers, recording sinks.
//!
//! These are used by the runtime's own tests and by hosts that want to
//! exercise job wiring without real time or real sinks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::alert::{AlertEvent, AlertSink};
use crate::clock::Clock;
use crate::context::JobContext;
use crate::definition::JobHandler;
use crate::error::JobError;
use crate::metrics::{Labels, MetricsSink};

/// Clock driven by the tokio timer, so paused-time tests control it with
/// `tokio::time::advance`.
pub struct SimClock {
    epoch: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl SimClock {
    /// Anchor the simulated clock at `epoch`. Must be called inside a tokio
    /// runtime.
    pub fn at(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        self.epoch
            + chrono::Duration::from_std(self.start.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// One step of a scripted handler run.
pub struct ScriptStep {
    pub delay: Duration,
    pub outcome: Result<(), JobError>,
}

impl ScriptStep {
    pub fn ok() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(()),
        }
    }

    pub fn fail(error: JobError) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Handler that plays back a fixed sequence of outcomes, then keeps
/// succeeding. Sleeps honor cancellation.
pub struct ScriptedHandler {
    script: Mutex<VecDeque<ScriptStep>>,
    invocations: AtomicU32,
}

impl ScriptedHandler {
    pub fn new(script: Vec<ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            invocations: AtomicU32::new(0),
        })
    }

    /// Fail `failures` times with `error`, then succeed.
    pub fn fail_times(failures: usize, error: JobError) -> Arc<Self> {
        let script = (0..failures)
            .map(|_| ScriptStep::fail(error.clone()))
            .collect();
        Self::new(script)
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match step {
            Some(step) => {
                if !step.delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(step.delay) => {}
                        _ = ctx.done() => return Err(ctx.fail(
                            crate::error::ErrorKind::Cancelled,
                            "cancelled during scripted delay",
                        )),
                    }
                }
                step.outcome
            }
            None => Ok(()),
        }
    }
}

/// Captures every routed alert for assertions.
#[derive(Default)]
pub struct RecordingAlertSink {
    events: Mutex<Vec<(String, AlertEvent)>>,
}

impl RecordingAlertSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, AlertEvent)> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn emit(&self, channel_id: &str, event: &AlertEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel_id.to_string(), event.clone()));
        Ok(())
    }
}

/// Captures counters for assertions; gauges and histograms are dropped.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<Vec<(String, u64, Vec<(String, String)>)>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sum of a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, _)| v)
            .sum()
    }
}

impl MetricsSink for RecordingMetrics {
    fn counter(&self, name: &str, value: u64, labels: Labels<'_>) {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((
                name.to_string(),
                value,
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ));
    }

    fn gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}
