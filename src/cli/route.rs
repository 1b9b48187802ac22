//! CLI route: single route table and run context. Dispatches to domain services and presentation.

use crate::character::CharacterSet;
use crate::cli::parse::{Commands, ConfigCommands};
use crate::cli::presentation::{
    format_event_line, format_job_report, format_probe_result, format_validation_result,
    RequestRow,
};
use crate::config::{ConfigLoader, KomagenConfig};
use crate::error::ApiError;
use crate::generation::{plan_story, BatchJob, BatchOrchestrator, JobHandle, StorySpec};
use crate::service::{ForgeClient, GenerationService};
use crate::session::{GenerationSession, JobStatus, SessionManager};
use crate::types::{
    CharacterBinding, GenerationRequest, JobId, PanelRef, RegionLayout, RequestId, RequestPurpose,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Characters file picked up from the project root when none is given.
const DEFAULT_CHARACTERS_FILE: &str = "characters.json";

/// Runtime context for CLI execution: project root and the effective configuration.
pub struct RunContext {
    project_root: PathBuf,
    config: KomagenConfig,
    sessions: SessionManager,
}

impl RunContext {
    /// Create run context from project root and optional config path. Uses ConfigLoader only.
    pub fn new(project_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&project_root)?
        };
        Ok(Self::with_config(project_root, config))
    }

    pub fn with_config(project_root: PathBuf, config: KomagenConfig) -> Self {
        Self {
            project_root,
            config,
            sessions: SessionManager::new(),
        }
    }

    pub fn config(&self) -> &KomagenConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        match command {
            Commands::Config { command } => self.handle_config(command),
            Commands::Probe => {
                self.config.ensure_valid()?;
                self.handle_probe()
            }
            Commands::Generate {
                prompt,
                characters,
                negative,
                seed,
                count,
                characters_file,
                out,
            } => {
                self.config.ensure_valid()?;
                self.handle_generate(
                    prompt,
                    characters,
                    negative.as_deref(),
                    *seed,
                    *count,
                    characters_file.as_deref(),
                    out,
                )
            }
            Commands::Story {
                file,
                characters,
                out,
                regenerate_references,
                retry_failed,
            } => {
                self.config.ensure_valid()?;
                self.handle_story(
                    file,
                    characters.as_deref(),
                    out,
                    *regenerate_references,
                    *retry_failed,
                )
            }
        }
    }

    fn handle_config(&self, command: &ConfigCommands) -> Result<String, ApiError> {
        match command {
            ConfigCommands::Show => self.config.to_toml(),
            ConfigCommands::Validate => {
                let problems: Vec<String> = match self.config.validate() {
                    Ok(()) => Vec::new(),
                    Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
                };
                let output = format_validation_result(&problems);
                if problems.is_empty() {
                    Ok(output)
                } else {
                    Err(ApiError::ConfigError(output))
                }
            }
        }
    }

    fn runtime() -> Result<tokio::runtime::Runtime, ApiError> {
        tokio::runtime::Runtime::new().map_err(|e| {
            ApiError::ConfigError(format!("Failed to create tokio runtime: {}", e))
        })
    }

    fn handle_probe(&self) -> Result<String, ApiError> {
        let client = ForgeClient::new(&self.config.service)?;
        let rt = Self::runtime()?;
        let endpoint = rt.block_on(client.check_availability())?;
        Ok(format_probe_result(&endpoint))
    }

    fn load_characters(&self, path: Option<&Path>) -> Result<CharacterSet, ApiError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = self.project_root.join(DEFAULT_CHARACTERS_FILE);
                if !default.exists() {
                    debug!(path = %default.display(), "No characters file; using none");
                    return Ok(CharacterSet::new());
                }
                default
            }
        };
        let characters = CharacterSet::load_json(&path)?;
        info!(path = %path.display(), characters = characters.len(), "Characters loaded");
        Ok(characters)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_generate(
        &self,
        prompt: &str,
        characters: &[String],
        negative: Option<&str>,
        seed: Option<i64>,
        count: u32,
        characters_file: Option<&Path>,
        out: &Path,
    ) -> Result<String, ApiError> {
        let project = self.load_characters(characters_file)?;
        let defaults = &self.config.generation;

        let mut sampling = defaults.sampling(defaults.portrait_size);
        sampling.seed = seed;
        sampling.batch_size = count.max(1);
        let mut request = GenerationRequest::panel(
            PanelRef::new(1, 0),
            join_prompt(&[prompt, &defaults.common_prompt]),
        )
        .with_negative(
            negative
                .map(str::to_string)
                .unwrap_or_else(|| defaults.common_negative_prompt.clone()),
        )
        .with_sampling(sampling);
        for id in characters {
            request = request.with_character(CharacterBinding::new(id.as_str()));
        }
        if characters.len() >= 2 {
            request = request
                .with_layout(RegionLayout::even(defaults.region_split))
                .with_face_correction(defaults.face_correction);
        }
        let request_id = request.id;

        let rt = Self::runtime()?;
        let session = self.sessions.open("generate");
        let orchestrator = self.orchestrator(project)?;
        let job = BatchJob::new(vec![request]);
        let (handle, status) = rt.block_on(run_job(&orchestrator, &session, job))?;

        std::fs::create_dir_all(out)?;
        let mut written = Vec::new();
        if let Some(result) = session.result(request_id) {
            for (n, candidate) in result.candidates.iter().enumerate() {
                let path = out.join(format!("candidate_{}_{}.png", n, candidate.id.short()));
                std::fs::write(&path, &candidate.bytes)?;
                written.push(path.display().to_string());
            }
        }
        let report = self.report(&session, handle.id(), "Generate", &HashMap::new());
        debug!(status = status.as_str(), "Generate finished");
        self.sessions.close();

        let mut output = report;
        for path in written {
            output.push_str(&format!("\nwrote {}", path));
        }
        Ok(output)
    }

    fn handle_story(
        &self,
        file: &Path,
        characters_file: Option<&Path>,
        out: &Path,
        regenerate_references: bool,
        retry_failed: bool,
    ) -> Result<String, ApiError> {
        let story = StorySpec::load(file)?;
        let project = self.load_characters(characters_file)?;
        let mut defaults = self.config.generation.clone();
        defaults.regenerate_references |= regenerate_references;
        let plan = plan_story(&story, &project, &defaults)?;

        let title = if plan.title.is_empty() {
            file.display().to_string()
        } else {
            plan.title.clone()
        };
        let rt = Self::runtime()?;
        let session = self.sessions.open(title.clone());
        let orchestrator = self.orchestrator(project)?;

        let (handle, status) = rt.block_on(run_job(&orchestrator, &session, plan.job))?;
        if retry_failed && status == JobStatus::Completed {
            let failed = handle.summary().map(|s| s.failed).unwrap_or(0);
            if failed > 0 {
                info!(job_id = %handle.id(), failed, "Retrying failed requests");
                let retry = orchestrator.resubmit_failed(&session, handle.id())?;
                rt.block_on(follow_job(&session, retry))?;
            }
        }

        let mut outputs = HashMap::new();
        for job_id in session.jobs() {
            outputs.extend(commit_outputs(&session, job_id, out)?);
        }
        let reports: Vec<String> = session
            .jobs()
            .into_iter()
            .enumerate()
            .map(|(n, job_id)| {
                let heading = if n == 0 {
                    title.clone()
                } else {
                    format!("{} (retry {})", title, n)
                };
                self.report(&session, job_id, &heading, &outputs)
            })
            .collect();
        self.sessions.close();
        Ok(reports.join("\n\n"))
    }

    fn orchestrator(&self, characters: CharacterSet) -> Result<BatchOrchestrator, ApiError> {
        let client = ForgeClient::new(&self.config.service)?;
        Ok(BatchOrchestrator::new(
            Arc::new(client),
            Arc::new(characters),
            self.config.orchestrator.clone(),
        ))
    }

    fn report(
        &self,
        session: &GenerationSession,
        job_id: JobId,
        title: &str,
        outputs: &HashMap<RequestId, Committed>,
    ) -> String {
        let failures: HashMap<RequestId, String> = session
            .failures(job_id)
            .into_iter()
            .map(|f| (f.request_id, format!("[{}] {}", f.kind, f.message)))
            .collect();
        let rows: Vec<RequestRow> = session
            .request_states(job_id)
            .into_iter()
            .map(|(request_id, state)| {
                let result = session.result(request_id);
                let committed = outputs.get(&request_id);
                RequestRow {
                    label: session
                        .request(request_id)
                        .map(|r| r.purpose.label())
                        .unwrap_or_else(|| request_id.to_string()),
                    state,
                    attempts: result.as_ref().map(|r| r.attempts),
                    seed: result
                        .as_ref()
                        .and_then(|r| r.seed())
                        .or_else(|| committed.and_then(|c| c.seed)),
                    output: committed.map(|c| c.path.display().to_string()),
                    error: failures.get(&request_id).cloned(),
                }
            })
            .collect();
        let summary = session.summary(job_id).unwrap_or_default();
        let status = session.job_status(job_id).unwrap_or(JobStatus::Running);
        format_job_report(title, status, &summary, &rows)
    }
}

/// Submit a job and follow its progress until it is terminal.
async fn run_job(
    orchestrator: &BatchOrchestrator,
    session: &GenerationSession,
    job: BatchJob,
) -> Result<(JobHandle, JobStatus), ApiError> {
    let handle = orchestrator.submit(session, job)?;
    follow_job(session, handle).await
}

async fn follow_job(
    session: &GenerationSession,
    handle: JobHandle,
) -> Result<(JobHandle, JobStatus), ApiError> {
    let labels: HashMap<RequestId, String> = session
        .request_states(handle.id())
        .into_iter()
        .filter_map(|(id, _)| session.request(id).map(|r| (id, r.purpose.label())))
        .collect();
    let mut events = handle.events()?;
    while let Some(event) = events.next().await {
        eprintln!("{}", format_event_line(&event, &labels));
    }
    let status = handle.wait().await?;
    Ok((handle, status))
}

/// A candidate taken out of the session and written to disk.
struct Committed {
    path: PathBuf,
    seed: Option<i64>,
}

/// Take the first candidate of every successful request out of the session and write it.
fn commit_outputs(
    session: &GenerationSession,
    job_id: JobId,
    out: &Path,
) -> Result<HashMap<RequestId, Committed>, ApiError> {
    let mut written = HashMap::new();
    for result in session.results(job_id) {
        let Some(first) = result.candidates.first() else {
            continue;
        };
        let Some(request) = session.request(result.request_id) else {
            continue;
        };
        let path = match &request.purpose {
            RequestPurpose::Panel { target } => out
                .join(format!("page_{}", target.page))
                .join(format!("panel_{}.png", target.panel)),
            RequestPurpose::CharacterReference { character } => {
                out.join("references").join(format!("{}.png", character))
            }
        };
        let candidate = match session.select_candidate(result.request_id, &first.id) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(request_id = %result.request_id, error = %err, "Candidate no longer available");
                continue;
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &candidate.bytes)?;
        debug!(request_id = %result.request_id, path = %path.display(), "Output written");
        written.insert(
            result.request_id,
            Committed {
                path,
                seed: candidate.seed,
            },
        );
    }
    Ok(written)
}

fn join_prompt(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
