//! Schedule descriptions and fire-time resolution.
//!
//! A schedule is parsed once at registration and resolved on demand by the
//! dispatcher. Supported kinds:
//!
//! - cron: standard 5-field expression with an optional seconds prefix and an
//!   optional `@ZONE` suffix naming an IANA zone (absent means UTC)
//! - interval: `every Ns|Nm|Nh|Nd`, optionally `@phase=...`, anchored to the
//!   Unix epoch so replicas stay aligned across restarts
//! - one-shot: an RFC3339 timestamp
//! - `manual`: no fire times; only explicit triggers run the job
//! - `on_event: ID`: no fire times; runs are enqueued when the host emits
//!   the named event
//!
//! Cron resolution is zone-aware: a local fire time erased by a
//! spring-forward transition is skipped, and a time that occurs twice on a
//! fall-back day fires once, at the first occurrence.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleParseError {
    #[error("empty schedule expression")]
    Empty,

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown time zone {0:?}")]
    UnknownZone(String),

    #[error("invalid interval expression {expr:?}: {reason}")]
    InvalidInterval { expr: String, reason: String },

    #[error("invalid one-shot timestamp {expr:?}: {reason}")]
    InvalidOneShot { expr: String, reason: String },

    #[error("event schedule is missing a source id")]
    MissingEventSource,
}

/// What to do with fires missed while no replica was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchUpPolicy {
    /// Discard everything missed; resume with the next future fire.
    SkipMissed,
    /// Enqueue the most recent missed fire, discard older ones.
    #[default]
    FireOnce,
    /// Enqueue every missed fire.
    FireAll,
}

/// A parsed schedule description.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron {
        expr: Box<cron::Schedule>,
        zone: Tz,
        raw: String,
    },
    Interval {
        period: Duration,
        phase: Duration,
        raw: String,
    },
    OneShot {
        at: DateTime<Utc>,
        raw: String,
    },
    Manual,
    Event {
        source: String,
    },
}

impl Schedule {
    /// Parse a schedule expression (syntax above).
    pub fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ScheduleParseError::Empty);
        }

        if expr.eq_ignore_ascii_case("manual") {
            return Ok(Schedule::Manual);
        }

        if let Some(rest) = expr.strip_prefix("on_event:") {
            let source = rest.trim();
            if source.is_empty() {
                return Err(ScheduleParseError::MissingEventSource);
            }
            return Ok(Schedule::Event {
                source: source.to_string(),
            });
        }

        if expr.starts_with("every ") || expr.starts_with("every\t") {
            return parse_interval(expr);
        }

        // RFC3339 one-shot. Cron expressions never contain 'T' followed by
        // digits and a timezone designator, so a successful parse is decisive.
        if let Ok(at) = DateTime::parse_from_rfc3339(expr) {
            return Ok(Schedule::OneShot {
                at: at.with_timezone(&Utc),
                raw: expr.to_string(),
            });
        }
        if expr.contains('T') && expr.contains('-') && !expr.contains(' ') {
            return Err(ScheduleParseError::InvalidOneShot {
                expr: expr.to_string(),
                reason: "timestamp is not valid RFC3339".to_string(),
            });
        }

        parse_cron(expr)
    }

    /// The next fire time at or after `after`, or `None` for schedules that
    /// never fire on their own. Deterministic given identical inputs.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { expr, zone, .. } => {
                // cron's iterator is exclusive of its anchor; back off one
                // nanosecond so a fire exactly at `after` is included.
                let anchor = (after - chrono::Duration::nanoseconds(1)).with_timezone(zone);
                expr.after(&anchor).next().map(|t| t.with_timezone(&Utc))
            }
            Schedule::Interval { period, phase, .. } => {
                Some(next_interval_fire(*period, *phase, after))
            }
            Schedule::OneShot { at, .. } => (*at >= after).then_some(*at),
            Schedule::Manual | Schedule::Event { .. } => None,
        }
    }

    /// Lazy sequence of fire times in `[from, until)`. Tooling only; the
    /// dispatcher never calls this on the hot path.
    ///
    /// Fire times have at most millisecond resolution, so advancing the
    /// anchor by one millisecond never skips a fire.
    pub fn iterate(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        std::iter::successors(self.next_after(from), move |prev| {
            self.next_after(*prev + chrono::Duration::milliseconds(1))
        })
        .take_while(move |t| *t < until)
    }

    /// Whether the schedule ever produces fire times on its own.
    pub fn is_timed(&self) -> bool {
        matches!(
            self,
            Schedule::Cron { .. } | Schedule::Interval { .. } | Schedule::OneShot { .. }
        )
    }

    /// The event source id, for `on_event` schedules.
    pub fn event_source(&self) -> Option<&str> {
        match self {
            Schedule::Event { source } => Some(source),
            _ => None,
        }
    }

    /// The zone fires are computed in (UTC unless a cron carries `@ZONE`).
    pub fn zone(&self) -> Tz {
        match self {
            Schedule::Cron { zone, .. } => *zone,
            _ => Tz::UTC,
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Cron { raw, .. }
            | Schedule::Interval { raw, .. }
            | Schedule::OneShot { raw, .. } => f.write_str(raw),
            Schedule::Manual => f.write_str("manual"),
            Schedule::Event { source } => write!(f, "on_event: {source}"),
        }
    }
}

/// Epoch-anchored interval arithmetic, in milliseconds.
///
/// Fires occur at `epoch + k * period + phase`; the anchor keeps replicas
/// aligned without drift across process restarts. The reference instant is
/// rounded up to the next millisecond so a sub-millisecond `after` cannot
/// produce a fire in the past.
fn next_interval_fire(period: Duration, phase: Duration, after: DateTime<Utc>) -> DateTime<Utc> {
    let period_ms = period.as_millis() as i64;
    let phase_ms = phase.as_millis() as i64;
    let micros = after.timestamp_micros();
    let after_ms = micros.div_euclid(1_000) + i64::from(micros.rem_euclid(1_000) != 0);

    let offset = after_ms - phase_ms;
    let k = if offset <= 0 {
        0
    } else {
        (offset + period_ms - 1) / period_ms
    };
    let fire_ms = k * period_ms + phase_ms;

    Utc.timestamp_millis_opt(fire_ms)
        .single()
        .unwrap_or(after)
}

fn parse_interval(expr: &str) -> Result<Schedule, ScheduleParseError> {
    let invalid = |reason: &str| ScheduleParseError::InvalidInterval {
        expr: expr.to_string(),
        reason: reason.to_string(),
    };

    let body = expr["every".len()..].trim();
    let (period_part, phase_part) = match body.split_once("@phase=") {
        Some((p, rest)) => (p.trim(), Some(rest.trim())),
        None => (body, None),
    };

    let period = parse_duration_token(period_part)
        .ok_or_else(|| invalid("expected a duration like 30s, 5m, 1h, or 1d"))?;
    if period < Duration::from_secs(1) {
        return Err(invalid("interval period must be at least 1 second"));
    }

    let phase = match phase_part {
        Some(p) => {
            let phase = parse_duration_token(p)
                .ok_or_else(|| invalid("phase must be a duration like 30s or 5m"))?;
            if phase >= period {
                return Err(invalid("phase offset must be smaller than the period"));
            }
            phase
        }
        None => Duration::ZERO,
    };

    Ok(Schedule::Interval {
        period,
        phase,
        raw: expr.to_string(),
    })
}

/// Parse `Nx` where `x ∈ {s, m, h, d}`.
fn parse_duration_token(token: &str) -> Option<Duration> {
    let token = token.trim();
    if token.len() < 2 {
        return None;
    }
    let (num, unit) = token.split_at(token.len() - 1);
    let n: u64 = num.parse().ok()?;
    let secs = match unit {
        "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3_600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

fn parse_cron(expr: &str) -> Result<Schedule, ScheduleParseError> {
    // Split off an optional trailing `@ZONE` token.
    let (body, zone) = match expr.rsplit_once('@') {
        Some((body, zone_name)) if !zone_name.trim().is_empty() && body.contains(' ') => {
            let zone = Tz::from_str(zone_name.trim())
                .map_err(|_| ScheduleParseError::UnknownZone(zone_name.trim().to_string()))?;
            (body.trim(), zone)
        }
        _ => (expr, Tz::UTC),
    };

    let fields: Vec<&str> = body.split_whitespace().collect();
    // The cron crate wants a seconds field; the standard 5-field form gets
    // second zero prepended.
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 => fields.join(" "),
        n => {
            return Err(ScheduleParseError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 fields (or 6 with a seconds prefix), found {n}"),
            })
        }
    };

    let parsed = cron::Schedule::from_str(&normalized).map_err(|e| ScheduleParseError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Schedule::Cron {
        expr: Box::new(parsed),
        zone,
        raw: expr.to_string(),
    })
}
