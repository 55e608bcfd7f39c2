//! Support for the thin operational CLI.
//!
//! The binary stays a wrapper: argument parsing lives there, while input
//! binding, synchronous execution, and exit-code mapping live here so every
//! embedding gets identical behavior.

use serde_json::Value;
use uuid::Uuid;

use crate::error::TriggerError;
use crate::run::RunStatus;
use crate::runtime::{JobRuntime, TriggerOptions};
use crate::store::RunFilter;

/// Exit codes of the CLI surface.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_JOB_FAILED: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_STARTUP: i32 = 3;

/// Parse `key=value` arguments into the JSON object the input binder takes.
pub fn parse_inputs(pairs: &[String]) -> Result<Value, String> {
    let mut object = serde_json::Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!("expected key=value, got {pair:?}"));
        };
        if key.trim().is_empty() {
            return Err(format!("empty key in {pair:?}"));
        }
        if object
            .insert(key.trim().to_string(), Value::String(value.to_string()))
            .is_some()
        {
            return Err(format!("duplicate key {key:?}"));
        }
    }
    Ok(Value::Object(object))
}

/// `run <job_name> [key=value ...]`: synchronous one-shot execution bypassing
/// the schedule. Honors singleton policy and timeout; honors the retry policy
/// only when `retry` is set.
pub async fn cmd_run(runtime: &JobRuntime, job_name: &str, pairs: &[String], retry: bool) -> i32 {
    let inputs = match parse_inputs(pairs) {
        Ok(inputs) => inputs,
        Err(message) => {
            eprintln!("error: {message}");
            return EXIT_USAGE;
        }
    };

    let options = TriggerOptions {
        cause: Some("cli".to_string()),
        dedupe_key: None,
        suppress_retry: !retry,
    };

    let result = if retry {
        runtime
            .run_fire_to_completion(job_name, inputs, options)
            .await
    } else {
        runtime.run_to_completion(job_name, inputs, options).await
    };

    match result {
        Ok(record) => {
            println!(
                "{} {} attempt {} in {}ms",
                record.job_name,
                record.status,
                record.attempt,
                record.duration_ms().unwrap_or(0)
            );
            if let Some(message) = &record.error_message {
                eprintln!(
                    "error [{}]: {message}",
                    record
                        .error_kind
                        .map(|k| k.as_str())
                        .unwrap_or("unclassified")
                );
            }
            if record.status == RunStatus::Succeeded {
                EXIT_SUCCESS
            } else {
                EXIT_JOB_FAILED
            }
        }
        Err(TriggerError::UnknownJob(name)) => {
            eprintln!("error: unknown job {name:?}");
            EXIT_USAGE
        }
        Err(TriggerError::InvalidInput(message)) => {
            eprintln!("error: invalid input: {message}");
            EXIT_USAGE
        }
        Err(error) => {
            eprintln!("error: {error}");
            EXIT_JOB_FAILED
        }
    }
}

/// `list`: registered jobs with their schedules and next fire times.
pub async fn cmd_list(runtime: &JobRuntime) -> i32 {
    println!(
        "{:<32} {:<10} {:<28} {:<24} {}",
        "JOB", "PRIORITY", "SCHEDULE", "ZONE", "NEXT FIRE (UTC)"
    );
    for def in runtime.registry().list() {
        let next = def
            .schedule
            .next_after(chrono::Utc::now())
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<10} {:<28} {:<24} {}",
            def.name,
            format!("{:?}", def.priority).to_lowercase(),
            def.schedule.to_string(),
            def.schedule.zone().name(),
            next
        );
    }
    EXIT_SUCCESS
}

/// `status <run_id>`: print the run record.
pub async fn cmd_status(runtime: &JobRuntime, run_id: &str) -> i32 {
    let run_id = match Uuid::parse_str(run_id) {
        Ok(id) => id,
        Err(_) => {
            eprintln!("error: {run_id:?} is not a run id");
            return EXIT_USAGE;
        }
    };

    match runtime.status(run_id).await {
        Ok(Some(record)) => {
            match serde_json::to_string_pretty(&record) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("error: {e}");
                    return EXIT_JOB_FAILED;
                }
            }
            EXIT_SUCCESS
        }
        Ok(None) => {
            eprintln!("error: no run {run_id}");
            EXIT_USAGE
        }
        Err(error) => {
            eprintln!("error: {error}");
            EXIT_JOB_FAILED
        }
    }
}

/// `dead`: list dead-lettered runs awaiting operator attention.
pub async fn cmd_dead(runtime: &JobRuntime, limit: i64) -> i32 {
    let filter = RunFilter::builder().status(RunStatus::Dead).build();
    match runtime.tail_runs(&filter, limit).await {
        Ok(runs) => {
            println!(
                "{:<38} {:<32} {:<8} {:<20} {}",
                "RUN", "JOB", "ATTEMPT", "FINISHED (UTC)", "ERROR"
            );
            for run in runs {
                println!(
                    "{:<38} {:<32} {:<8} {:<20} {}",
                    run.run_id,
                    run.job_name,
                    run.attempt,
                    run.finished_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    run.error_message.as_deref().unwrap_or("")
                );
            }
            EXIT_SUCCESS
        }
        Err(error) => {
            eprintln!("error: {error}");
            EXIT_JOB_FAILED
        }
    }
}

/// `replay <run_id>`: re-enqueue a dead run.
pub async fn cmd_replay(runtime: &JobRuntime, run_id: &str) -> i32 {
    let run_id = match Uuid::parse_str(run_id) {
        Ok(id) => id,
        Err(_) => {
            eprintln!("error: {run_id:?} is not a run id");
            return EXIT_USAGE;
        }
    };

    match runtime.replay(run_id).await {
        Ok(new_run_id) => {
            println!("replaying as {new_run_id}");
            EXIT_SUCCESS
        }
        Err(TriggerError::InvalidInput(message)) => {
            eprintln!("error: {message}");
            EXIT_USAGE
        }
        Err(error) => {
            eprintln!("error: {error}");
            EXIT_JOB_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        let inputs = parse_inputs(&["region=houston".to_string(), "batch_size=50".to_string()])
            .unwrap();
        assert_eq!(inputs["region"], "houston");
        assert_eq!(inputs["batch_size"], "50");
    }

    #[test]
    fn value_may_contain_equals() {
        let inputs = parse_inputs(&["query=a=b".to_string()]).unwrap();
        assert_eq!(inputs["query"], "a=b");
    }

    #[test]
    fn rejects_bare_words_and_duplicates() {
        assert!(parse_inputs(&["nonsense".to_string()]).is_err());
        assert!(parse_inputs(&["a=1".to_string(), "a=2".to_string()]).is_err());
        assert!(parse_inputs(&["=x".to_string()]).is_err());
    }
}
