//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::ApiError;

/// Map domain/service errors to a string for CLI output.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::Service(err) => format!("{} ({})", err, err.kind()),
        ApiError::ConfigError(_) => format!("{}\nRun 'komagen config validate' for details.", e),
        _ => e.to_string(),
    }
}
