//! Integration tests for komagen

mod config_loading;
mod http_client;
mod orchestration;
mod session_store;
mod story_planning;
mod test_utils;
