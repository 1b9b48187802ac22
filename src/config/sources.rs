//! Configuration sources, lowest to highest precedence: global file, project files, environment.

pub(crate) mod environment;
pub(crate) mod global_file;
pub(crate) mod project_file;
