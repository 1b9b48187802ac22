//! CLI domain: parse, route, output, and presentation only.
//! No domain orchestration; single route table dispatches to domain services.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, ConfigCommands};
pub use presentation::{format_event_line, format_job_report, format_probe_result, RequestRow};
pub use route::RunContext;
