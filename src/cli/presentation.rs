//! CLI presentation: tables and progress lines for each command.

use crate::service::ServiceEndpointConfig;
use crate::session::{JobEvent, JobEventKind, JobStatus, JobSummary, RequestState};
use crate::types::RequestId;
use comfy_table::Table;
use owo_colors::OwoColorize;
use std::collections::HashMap;

/// One line of the per-request summary table.
#[derive(Debug, Clone)]
pub struct RequestRow {
    pub label: String,
    pub state: RequestState,
    pub attempts: Option<u32>,
    pub seed: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
}

fn heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

pub fn state_word(state: RequestState) -> String {
    match state {
        RequestState::Succeeded => state.as_str().green().to_string(),
        RequestState::Failed => state.as_str().red().to_string(),
        RequestState::Skipped => state.as_str().yellow().to_string(),
        RequestState::Pending | RequestState::Running => state.as_str().dimmed().to_string(),
    }
}

pub fn status_word(status: JobStatus) -> String {
    match status {
        JobStatus::Completed => status.as_str().green().to_string(),
        JobStatus::Cancelled => status.as_str().yellow().to_string(),
        JobStatus::Running => status.as_str().to_string(),
    }
}

fn flag(enabled: bool) -> String {
    if enabled {
        "yes".green().to_string()
    } else {
        "no".red().to_string()
    }
}

pub fn format_probe_result(endpoint: &ServiceEndpointConfig) -> String {
    let capabilities = &endpoint.capabilities;
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Capability", "Installed", "Model"]);
    table.add_row(vec![
        "feature adapter".to_string(),
        flag(capabilities.feature_adapter.is_some()),
        capabilities.feature_adapter.clone().unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row(vec![
        "pose conditioning".to_string(),
        flag(capabilities.pose_conditioning.is_some()),
        capabilities.pose_conditioning.clone().unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row(vec![
        "multi-region composition".to_string(),
        flag(capabilities.multi_region),
        "-".to_string(),
    ]);
    table.add_row(vec![
        "face correction".to_string(),
        flag(capabilities.face_correction),
        "-".to_string(),
    ]);

    format!(
        "{}\nEndpoint: {}\nAvailable: {}\nModel: {}\n\n{}",
        heading("Generation service"),
        endpoint.base_url,
        flag(endpoint.available),
        endpoint.model.as_deref().unwrap_or("(none loaded)"),
        table
    )
}

/// One progress line for stderr.
pub fn format_event_line(event: &JobEvent, labels: &HashMap<RequestId, String>) -> String {
    let label = |id: &RequestId| labels.get(id).cloned().unwrap_or_else(|| id.to_string());
    match &event.kind {
        JobEventKind::RequestStarted { request_id, .. } => {
            format!("{} {}", "start".dimmed(), label(request_id))
        }
        JobEventKind::RequestRetrying {
            request_id,
            attempt,
            error,
        } => format!(
            "{} {} (attempt {} failed: {})",
            "retry".yellow(),
            label(request_id),
            attempt,
            error
        ),
        JobEventKind::RequestSucceeded {
            request_id,
            candidates,
            seed,
        } => format!(
            "{} {} ({} candidate(s), seed {})",
            "done".green(),
            label(request_id),
            candidates,
            seed.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string())
        ),
        JobEventKind::RequestFailed {
            request_id,
            kind,
            message,
        } => format!("{} {} [{}] {}", "fail".red(), label(request_id), kind, message),
        JobEventKind::JobCompleted {
            succeeded,
            failed,
            skipped,
        } => format!(
            "{} {} succeeded, {} failed, {} skipped",
            status_word(JobStatus::Completed),
            succeeded,
            failed,
            skipped
        ),
        JobEventKind::JobCancelled {
            succeeded,
            failed,
            skipped,
        } => format!(
            "{} {} succeeded, {} failed, {} skipped",
            status_word(JobStatus::Cancelled),
            succeeded,
            failed,
            skipped
        ),
    }
}

pub fn format_job_report(
    title: &str,
    status: JobStatus,
    summary: &JobSummary,
    rows: &[RequestRow],
) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Request", "State", "Attempts", "Seed", "Output / Error"]);
    for row in rows {
        let detail = row
            .output
            .clone()
            .or_else(|| row.error.clone())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            row.label.clone(),
            state_word(row.state),
            row.attempts.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
            row.seed.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            detail,
        ]);
    }
    format!(
        "{}\nStatus: {}  ({}/{} succeeded, {} failed, {} skipped)\n\n{}",
        heading(title),
        status_word(status),
        summary.succeeded,
        summary.total,
        summary.failed,
        summary.skipped,
        table
    )
}

pub fn format_validation_result(problems: &[String]) -> String {
    if problems.is_empty() {
        return format!("{} configuration is valid", "ok".green());
    }
    let mut output = format!("{} configuration has {} problem(s):\n", "error".red(), problems.len());
    for problem in problems {
        output.push_str(&format!("  - {}\n", problem));
    }
    output
}
