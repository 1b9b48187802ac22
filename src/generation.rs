//! Generation: single-request tasks, batch jobs and the orchestrator that runs them.

pub mod executor;
pub mod plan;
pub mod story;
pub mod task;

pub use executor::{BatchOrchestrator, JobHandle};
pub use plan::BatchJob;
pub use story::{plan_story, PlannedPanel, StoryPlan, StorySpec};
pub use task::{GenerationTask, TaskContext, TaskOutcome, TaskReport, TaskState};
