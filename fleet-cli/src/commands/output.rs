//! Terminal output shared by the commands
//!
//! Streams job events as they happen and prints the final job summary.

use anyhow::{Result, bail};
use colored::*;
use fleet_core::domain::job::{JobId, JobState};
use fleet_core::domain::log::{LogEntry, LogLevel};
use fleet_core::dto::job::JobView;
use fleet_orchestrator::{ChannelObserver, JobError, JobEvent, JobService};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Starts `service`, runs `submit` and follows the job until it finishes
///
/// Returns an error when the job ends in any state but Completed.
pub async fn follow_job<F>(service: &JobService, submit: F) -> Result<()>
where
    F: FnOnce(&JobService) -> std::result::Result<JobId, JobError>,
{
    let observer = Arc::new(ChannelObserver::new(1024));
    let mut events = observer.subscribe();
    service.subscribe(observer);
    service.start();

    let id = submit(service)?;
    println!("{} {}", "Submitted job".bold(), id.to_string().cyan());

    let wait = service.wait(id);
    tokio::pin!(wait);
    let view = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event, id),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    println!("{}", format!("... {} events skipped", missed).dimmed());
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            view = &mut wait => break view?,
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event, id);
    }

    service.shutdown().await;
    print_job_details(service, &view);

    if view.state != JobState::Completed {
        bail!("job {} ended {}", view.id, view.state);
    }
    Ok(())
}

fn print_event(event: &JobEvent, root: JobId) {
    match event {
        JobEvent::Created { .. } => {}
        JobEvent::Transitioned {
            job_id, to, error, ..
        } => {
            let mut line = format!("{} {}", job_label(*job_id, root), colorize_state(to));
            if let Some(error) = error {
                line.push_str(&format!(": {}", error.message.red()));
            }
            println!("{}", line);
        }
        JobEvent::Output { job_id, entry } => {
            print_log_entry(&job_label(*job_id, root), entry);
        }
    }
}

fn job_label(id: JobId, root: JobId) -> ColoredString {
    let short: String = id.to_string().chars().take(8).collect();
    if id == root {
        format!("[{}]", short).cyan()
    } else {
        format!("[{}]", short).dimmed()
    }
}

/// Print a log entry
pub fn print_log_entry(label: &ColoredString, log: &LogEntry) {
    let level_str = format!("{:?}", log.level).to_uppercase();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "{} {} [{}] {}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        label,
        level_colored,
        log.message
    );
}

/// Print detailed job information
fn print_job_details(service: &JobService, job: &JobView) {
    println!();
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Operation:   {}", job.operation);
    if let Some(host) = &job.target_host {
        println!("  Host:        {}", host);
    }
    println!("  State:       {}", colorize_state(&job.state));

    if let (Some(started), Some(finished)) = (job.started_at, job.finished_at) {
        let seconds = finished.signed_duration_since(started).num_milliseconds() as f64 / 1000.0;
        println!("  Duration:    {:.1}s", seconds);
    }

    if let Some(error) = &job.error {
        let code = error
            .code
            .as_deref()
            .map(|code| format!(" [{}]", code))
            .unwrap_or_default();
        println!("  Error:       {}{}", error.message.red(), code.red());
    }

    if !job.children.is_empty() {
        println!("\n{}", "Steps:".bold());
        for (index, child) in job.children.iter().enumerate() {
            match service.get(*child) {
                Ok(step) => println!(
                    "  {}. {:<14} {}",
                    index + 1,
                    step.operation.to_string(),
                    colorize_state(&step.state)
                ),
                Err(_) => println!("  {}. {}", index + 1, "unknown".dimmed()),
            }
        }
    }

    if let Some(result) = &job.result {
        println!("\n{}", "Result:".bold());
        if let Ok(pretty) = serde_json::to_string_pretty(result) {
            println!("{}", pretty);
        } else {
            println!("{:?}", result);
        }
    }
}

/// Colorize job state for display
pub fn colorize_state(state: &JobState) -> ColoredString {
    let state_str = state.to_string();
    match state {
        JobState::Pending => state_str.yellow(),
        JobState::Running => state_str.cyan(),
        JobState::Completed => state_str.green(),
        JobState::Failed => state_str.red(),
        JobState::Partial => state_str.yellow(),
        JobState::Cancelled => state_str.dimmed(),
    }
}
