use crate::character::{CharacterSet, ReferenceOverrides};
use crate::error::JobError;
use crate::types::{CharacterId, GenerationRequest, JobId, RequestId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// An ordered set of requests plus the dependency graph between them.
///
/// `new` derives the reference rule: every request citing character `C` depends on each
/// reference request for `C` in the same job. Further edges may be added by hand.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: JobId,
    requests: Vec<Arc<GenerationRequest>>,
    depends_on: HashMap<RequestId, Vec<RequestId>>,
    characters: CharacterSet,
    seed_references: ReferenceOverrides,
}

impl BatchJob {
    pub fn new(requests: impl IntoIterator<Item = GenerationRequest>) -> Self {
        let requests: Vec<Arc<GenerationRequest>> = requests.into_iter().map(Arc::new).collect();

        let mut references: HashMap<&CharacterId, Vec<RequestId>> = HashMap::new();
        for request in &requests {
            if let Some(character) = request.reference_for() {
                references.entry(character).or_default().push(request.id);
            }
        }

        let mut depends_on: HashMap<RequestId, Vec<RequestId>> = HashMap::new();
        for request in &requests {
            let own = request.reference_for();
            for character in request.cited_characters() {
                if Some(character) == own {
                    continue;
                }
                if let Some(ids) = references.get(character) {
                    let edges = depends_on.entry(request.id).or_default();
                    for id in ids {
                        if !edges.contains(id) {
                            edges.push(*id);
                        }
                    }
                }
            }
        }

        Self {
            id: JobId::next(),
            requests,
            depends_on,
            characters: CharacterSet::new(),
            seed_references: ReferenceOverrides::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Characters known only to this job, layered under the project's characters.
    pub fn with_characters(mut self, characters: CharacterSet) -> Self {
        self.characters = characters;
        self
    }

    /// Reference state the job starts from, e.g. references generated by an earlier job.
    pub fn with_references(mut self, references: ReferenceOverrides) -> Self {
        self.seed_references = references;
        self
    }

    /// `request` may not start until `prerequisite` is terminal.
    pub fn add_dependency(&mut self, request: RequestId, prerequisite: RequestId) {
        let edges = self.depends_on.entry(request).or_default();
        if !edges.contains(&prerequisite) {
            edges.push(prerequisite);
        }
    }

    pub fn requests(&self) -> &[Arc<GenerationRequest>] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn dependencies(&self, request: RequestId) -> &[RequestId] {
        self.depends_on
            .get(&request)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn characters(&self) -> &CharacterSet {
        &self.characters
    }

    pub fn seed_references(&self) -> &ReferenceOverrides {
        &self.seed_references
    }

    /// Reference requests and everything else, each in submission order.
    pub fn partition(&self) -> (Vec<Arc<GenerationRequest>>, Vec<Arc<GenerationRequest>>) {
        self.requests
            .iter()
            .cloned()
            .partition(|request| request.purpose.is_reference())
    }

    /// Order in which ready requests are considered for dispatch: references first.
    pub fn dispatch_order(&self) -> Vec<Arc<GenerationRequest>> {
        let (mut references, panels) = self.partition();
        references.extend(panels);
        references
    }

    /// Reject empty jobs, duplicate ids, dangling edges and cycles.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.requests.is_empty() {
            return Err(JobError::EmptyJob);
        }

        let mut ids = HashSet::new();
        for request in &self.requests {
            if !ids.insert(request.id) {
                return Err(JobError::InvalidDependency(format!(
                    "request {} appears more than once",
                    request.id
                )));
            }
        }
        for (request, prerequisites) in &self.depends_on {
            if !ids.contains(request) {
                return Err(JobError::InvalidDependency(format!(
                    "dependency declared for unknown request {}",
                    request
                )));
            }
            for prerequisite in prerequisites {
                if !ids.contains(prerequisite) {
                    return Err(JobError::InvalidDependency(format!(
                        "{} depends on unknown request {}",
                        request, prerequisite
                    )));
                }
                if prerequisite == request {
                    return Err(JobError::InvalidDependency(format!(
                        "{} depends on itself",
                        request
                    )));
                }
            }
        }

        // Kahn's algorithm: anything left unvisited sits on a cycle.
        let mut indegree: HashMap<RequestId, usize> =
            self.requests.iter().map(|r| (r.id, 0)).collect();
        let mut dependents: HashMap<RequestId, Vec<RequestId>> = HashMap::new();
        for (request, prerequisites) in &self.depends_on {
            for prerequisite in prerequisites {
                *indegree.entry(*request).or_default() += 1;
                dependents.entry(*prerequisite).or_default().push(*request);
            }
        }
        let mut ready: VecDeque<RequestId> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = ready.pop_front() {
            visited += 1;
            for dependent in dependents.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }
        if visited != self.requests.len() {
            return Err(JobError::InvalidDependency(
                "dependency cycle between requests".to_string(),
            ));
        }
        Ok(())
    }
}
