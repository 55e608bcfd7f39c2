//! Alert routing with per-channel circuit breaking.
//!
//! Jobs declare an ordered list of channel ids; the host registers a sink per
//! channel. Emission is best-effort: a failing sink never alters the run's
//! stored outcome, and a sink that keeps failing is circuit-broken so a dead
//! pager integration cannot slow down the worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::ErrorKind;
use crate::run::{RunRecord, RunStatus};

/// The payload delivered to alert sinks on terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub job_name: String,
    pub run_id: Uuid,
    pub attempt: i32,
    pub status: RunStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl AlertEvent {
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            job_name: record.job_name.clone(),
            run_id: record.run_id,
            attempt: record.attempt,
            status: record.status,
            error_kind: record.error_kind,
            error_message: record.error_message.clone(),
            duration_ms: record.duration_ms(),
            scheduled_for: record.scheduled_for,
        }
    }
}

/// Host-provided delivery for one or more channels.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, channel_id: &str, event: &AlertEvent) -> Result<()>;
}

/// Default sink: the alert lands in the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, channel_id: &str, event: &AlertEvent) -> Result<()> {
        warn!(
            channel = channel_id,
            job_name = %event.job_name,
            run_id = %event.run_id,
            attempt = event.attempt,
            status = %event.status,
            error_kind = ?event.error_kind,
            error_message = event.error_message.as_deref().unwrap_or(""),
            "job alert"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
    suppressed: u64,
}

/// Routes alert events to the sinks registered per channel id.
pub struct AlertRouter {
    clock: SharedClock,
    sinks: HashMap<String, Arc<dyn AlertSink>>,
    breakers: Mutex<HashMap<String, BreakerState>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl AlertRouter {
    pub fn new(clock: SharedClock, failure_threshold: u32) -> Self {
        Self {
            clock,
            sinks: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
            failure_threshold,
            cooldown: Duration::from_secs(60),
        }
    }

    pub fn register(&mut self, channel_id: impl Into<String>, sink: Arc<dyn AlertSink>) {
        self.sinks.insert(channel_id.into(), sink);
    }

    /// Deliver `event` to every listed channel, in order. Failures are logged
    /// and counted; they never propagate to the caller.
    pub async fn route(&self, channels: &[String], event: &AlertEvent) {
        for channel in channels {
            let Some(sink) = self.sinks.get(channel) else {
                warn!(channel = %channel, job_name = %event.job_name, "no alert sink registered for channel");
                continue;
            };

            if self.is_open(channel) {
                let mut breakers = self.lock_breakers();
                let state = breakers.entry(channel.clone()).or_default();
                state.suppressed += 1;
                debug!(
                    channel = %channel,
                    suppressed = state.suppressed,
                    "alert suppressed by open circuit breaker"
                );
                continue;
            }

            match sink.emit(channel, event).await {
                Ok(()) => {
                    let mut breakers = self.lock_breakers();
                    if let Some(state) = breakers.get_mut(channel) {
                        if state.suppressed > 0 {
                            warn!(
                                channel = %channel,
                                suppressed = state.suppressed,
                                "alert channel recovered; alerts were suppressed while broken"
                            );
                        }
                        *state = BreakerState::default();
                    }
                }
                Err(error) => {
                    warn!(channel = %channel, error = %error, "alert emission failed");
                    let now = self.clock.now();
                    let mut breakers = self.lock_breakers();
                    let state = breakers.entry(channel.clone()).or_default();
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.failure_threshold {
                        state.open_until = Some(
                            now + chrono::Duration::from_std(self.cooldown)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                        );
                        warn!(
                            channel = %channel,
                            failures = state.consecutive_failures,
                            "alert channel circuit-broken"
                        );
                    }
                }
            }
        }
    }

    fn is_open(&self, channel: &str) -> bool {
        let now = self.clock.now();
        let mut breakers = self.lock_breakers();
        match breakers.get_mut(channel) {
            Some(state) => match state.open_until {
                Some(until) if until > now => true,
                Some(_) => {
                    // Cooldown elapsed: half-open, allow one probe.
                    state.open_until = None;
                    state.consecutive_failures = self.failure_threshold.saturating_sub(1);
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    fn lock_breakers(&self) -> std::sync::MutexGuard<'_, HashMap<String, BreakerState>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
