//! In-memory store
//!
//! Implements every store trait over maps behind a single `RwLock`, with the
//! same compare-and-set and transaction semantics as the Postgres store.
//! Used by tests and by `CONDUIT_STORE=memory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::Status;
use conduit_core::domain::artifact::{
    ArtifactLock, ArtifactType, DeletedObject, JobArtifact, NewJobArtifact, NewPipelineArtifact,
    PipelineArtifact,
};
use conduit_core::domain::job::{Job, JobKind, NewJob};
use conduit_core::domain::pipeline::{LockState, NewPipeline, NewStage, Pipeline, Stage};
use conduit_core::domain::project::{MemberRole, NewProject, Project, Trigger, User};
use conduit_core::domain::runner::{NewRunner, Runner, RunnerStatus, RunnerType};
use conduit_core::domain::trace::{PendingState, TraceChunk, TraceMetadata};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::repository::{
    ArtifactStore, JobStore, LeaseStore, PipelineStore, ProjectStore, RunnerScope, RunnerStore,
    TraceStore,
};

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    users: BTreeMap<i64, User>,
    projects: BTreeMap<i64, Project>,
    members: HashMap<(i64, i64), MemberRole>,
    triggers: BTreeMap<i64, Trigger>,
    pipelines: BTreeMap<i64, Pipeline>,
    stages: BTreeMap<i64, Stage>,
    jobs: BTreeMap<i64, Job>,
    runners: BTreeMap<i64, Runner>,
    chunks: BTreeMap<(i64, i32), TraceChunk>,
    pending_states: HashMap<i64, PendingState>,
    trace_metadata: HashMap<i64, TraceMetadata>,
    job_artifacts: BTreeMap<i64, JobArtifact>,
    pipeline_artifacts: BTreeMap<i64, PipelineArtifact>,
    deleted_objects: BTreeMap<i64, DeletedObject>,
    leases: HashMap<String, (Uuid, DateTime<Utc>)>,
}

impl MemoryState {
    /// Ids come from one sequence so creation order is total
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn project_in_scope(&self, project_id: i64, scope: &RunnerScope) -> bool {
        let Some(project) = self.projects.get(&project_id) else {
            return false;
        };
        match scope {
            RunnerScope::Instance => project.shared_runners_enabled,
            RunnerScope::Group(group_id) => project.group_id == Some(*group_id),
            RunnerScope::Projects(ids) => ids.contains(&project_id),
        }
    }

    fn adjust_artifacts_size(&mut self, project_id: i64, delta: i64) {
        if let Some(project) = self.projects.get_mut(&project_id) {
            project.artifacts_size = (project.artifacts_size + delta).max(0);
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryStore {
    async fn create_user(&self, username: &str, admin: bool) -> StoreResult<User> {
        let mut state = self.state.write().await;
        if state.users.values().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!(
                "user '{}' already exists",
                username
            )));
        }
        let user = User {
            id: state.next_id(),
            username: username.to_string(),
            admin,
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| u.username == username).cloned())
    }

    async fn create_project(
        &self,
        project: NewProject,
        runners_token: &str,
    ) -> StoreResult<Project> {
        let mut state = self.state.write().await;
        if state.projects.values().any(|p| p.path == project.path) {
            return Err(StoreError::Conflict(format!(
                "project '{}' already exists",
                project.path
            )));
        }
        let project = Project {
            id: state.next_id(),
            path: project.path,
            group_id: project.group_id,
            visibility: project.visibility,
            shared_runners_enabled: project.shared_runners_enabled,
            protected_branches: project.protected_branches,
            ci_config: project.ci_config,
            keep_latest_artifact: project.keep_latest_artifact,
            runners_token: runners_token.to_string(),
            artifacts_size: 0,
            created_at: Utc::now(),
        };
        state.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn find_project(&self, id: i64) -> StoreResult<Option<Project>> {
        Ok(self.state.read().await.projects.get(&id).cloned())
    }

    async fn find_project_by_path(&self, path: &str) -> StoreResult<Option<Project>> {
        let state = self.state.read().await;
        Ok(state.projects.values().find(|p| p.path == path).cloned())
    }

    async fn find_project_by_runners_token(&self, token: &str) -> StoreResult<Option<Project>> {
        let state = self.state.read().await;
        Ok(state
            .projects
            .values()
            .find(|p| p.runners_token == token)
            .cloned())
    }

    async fn add_member(
        &self,
        project_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.projects.contains_key(&project_id) {
            return Err(StoreError::NotFound {
                entity: "project",
                id: project_id,
            });
        }
        if !state.users.contains_key(&user_id) {
            return Err(StoreError::NotFound {
                entity: "user",
                id: user_id,
            });
        }
        state.members.insert((project_id, user_id), role);
        Ok(())
    }

    async fn member_role(&self, project_id: i64, user_id: i64) -> StoreResult<Option<MemberRole>> {
        let state = self.state.read().await;
        Ok(state.members.get(&(project_id, user_id)).copied())
    }

    async fn create_trigger(
        &self,
        project_id: i64,
        owner_id: i64,
        token: &str,
        description: Option<String>,
    ) -> StoreResult<Trigger> {
        let mut state = self.state.write().await;
        let trigger = Trigger {
            id: state.next_id(),
            project_id,
            owner_id,
            token: token.to_string(),
            description,
            created_at: Utc::now(),
        };
        state.triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn find_trigger_by_token(&self, token: &str) -> StoreResult<Option<Trigger>> {
        let state = self.state.read().await;
        Ok(state.triggers.values().find(|t| t.token == token).cloned())
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn create_pipeline(
        &self,
        pipeline: NewPipeline,
        stages: Vec<NewStage>,
        jobs: Vec<NewJob>,
    ) -> StoreResult<Pipeline> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let iid = state
            .pipelines
            .values()
            .filter(|p| p.project_id == pipeline.project_id)
            .map(|p| p.iid)
            .max()
            .unwrap_or(0)
            + 1;
        let id = state.next_id();
        let project_id = pipeline.project_id;
        let pipeline = pipeline.into_pipeline(id, iid, now);
        state.pipelines.insert(id, pipeline.clone());

        for stage in stages {
            let stage = Stage {
                id: state.next_id(),
                pipeline_id: id,
                name: stage.name,
                position: stage.position,
                status: Status::Created,
            };
            state.stages.insert(stage.id, stage);
        }

        for job in jobs {
            let job_id = state.next_id();
            state
                .jobs
                .insert(job_id, job.into_job(job_id, id, project_id, now));
        }

        Ok(pipeline)
    }

    async fn find_pipeline(&self, id: i64) -> StoreResult<Option<Pipeline>> {
        Ok(self.state.read().await.pipelines.get(&id).cloned())
    }

    async fn list_pipelines(&self, project_id: i64, limit: usize) -> StoreResult<Vec<Pipeline>> {
        let state = self.state.read().await;
        Ok(state
            .pipelines
            .values()
            .rev()
            .filter(|p| p.project_id == project_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> StoreResult<Pipeline> {
        let mut state = self.state.write().await;
        let stored = state
            .pipelines
            .get_mut(&pipeline.id)
            .ok_or(StoreError::NotFound {
                entity: "pipeline",
                id: pipeline.id,
            })?;
        if stored.lock_version != pipeline.lock_version {
            return Err(StoreError::StaleObject {
                entity: "pipeline",
                id: pipeline.id,
            });
        }
        *stored = pipeline.clone();
        stored.lock_version += 1;
        Ok(stored.clone())
    }

    async fn stages(&self, pipeline_id: i64) -> StoreResult<Vec<Stage>> {
        let state = self.state.read().await;
        let mut stages: Vec<Stage> = state
            .stages
            .values()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.position);
        Ok(stages)
    }

    async fn update_stage_status(&self, stage_id: i64, status: Status) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let stage = state.stages.get_mut(&stage_id).ok_or(StoreError::NotFound {
            entity: "stage",
            id: stage_id,
        })?;
        stage.status = status;
        Ok(())
    }

    async fn downstream_pipelines(&self, pipeline_id: i64) -> StoreResult<Vec<Pipeline>> {
        let state = self.state.read().await;
        Ok(state
            .pipelines
            .values()
            .filter(|p| p.upstream.is_some_and(|u| u.pipeline_id == pipeline_id))
            .cloned()
            .collect())
    }

    async fn pipeline_for_bridge(&self, bridge_id: i64) -> StoreResult<Option<Pipeline>> {
        let state = self.state.read().await;
        Ok(state
            .pipelines
            .values()
            .find(|p| p.upstream.is_some_and(|u| u.job_id == bridge_id))
            .cloned())
    }

    async fn locked_pipelines_before(
        &self,
        project_id: i64,
        ref_name: &str,
        before_iid: i64,
    ) -> StoreResult<Vec<Pipeline>> {
        let state = self.state.read().await;
        Ok(state
            .pipelines
            .values()
            .filter(|p| {
                p.project_id == project_id
                    && p.ref_name == ref_name
                    && p.iid < before_iid
                    && p.locked == LockState::ArtifactsLocked
            })
            .cloned()
            .collect())
    }

    async fn unlock_pipeline(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(pipeline) = state.pipelines.get_mut(&id) {
            if pipeline.locked != LockState::Unlocked {
                pipeline.locked = LockState::Unlocked;
                pipeline.lock_version += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn find_job(&self, id: i64) -> StoreResult<Option<Job>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn find_job_by_token(&self, token: &str) -> StoreResult<Option<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .find(|j| j.token.as_deref() == Some(token))
            .cloned())
    }

    async fn pipeline_jobs(&self, pipeline_id: i64) -> StoreResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn update_job(&self, job: &Job) -> StoreResult<Job> {
        let mut state = self.state.write().await;
        let stored = state.jobs.get_mut(&job.id).ok_or(StoreError::NotFound {
            entity: "job",
            id: job.id,
        })?;
        if stored.lock_version != job.lock_version {
            return Err(StoreError::StaleObject {
                entity: "job",
                id: job.id,
            });
        }
        *stored = job.clone();
        stored.lock_version += 1;
        Ok(stored.clone())
    }

    async fn retry_job(&self, original: &Job, clone: NewJob) -> StoreResult<Job> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get_mut(&original.id)
            .ok_or(StoreError::NotFound {
                entity: "job",
                id: original.id,
            })?;
        if stored.lock_version != original.lock_version || stored.retried {
            return Err(StoreError::StaleObject {
                entity: "job",
                id: original.id,
            });
        }
        stored.retried = true;
        stored.lock_version += 1;

        let id = state.next_id();
        let job = clone.into_job(id, original.pipeline_id, original.project_id, Utc::now());
        state.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn pending_builds(
        &self,
        runner: &Runner,
        scope: &RunnerScope,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.status == Status::Pending
                    && j.kind == JobKind::Build
                    && j.runner_id.is_none()
                    && state.project_in_scope(j.project_id, scope)
                    && runner.can_pick(j)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn running_shared_builds(&self) -> StoreResult<HashMap<i64, i64>> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for job in state.jobs.values().filter(|j| j.status == Status::Running) {
            let shared = job
                .runner_id
                .and_then(|id| state.runners.get(&id))
                .is_some_and(|r| r.runner_type == RunnerType::Instance);
            if shared {
                *counts.entry(job.project_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn jobs_for_sweep(
        &self,
        status: Status,
        kind: Option<JobKind>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == status && kind.is_none_or(|kind| j.kind == kind))
            .filter(|j| {
                let at = match status {
                    Status::Pending => j.queued_at,
                    Status::Scheduled => j.scheduled_at,
                    _ => Some(j.updated_at),
                };
                at.is_some_and(|at| at < before)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunnerStore for InMemoryStore {
    async fn create_runner(&self, runner: NewRunner, token: &str) -> StoreResult<Runner> {
        let mut state = self.state.write().await;
        let runner = Runner {
            id: state.next_id(),
            token: token.to_string(),
            description: runner.description,
            runner_type: runner.runner_type,
            group_id: runner.group_id,
            project_ids: runner.project_ids,
            tags: runner.tags,
            run_untagged: runner.run_untagged,
            access_level: runner.access_level,
            active: true,
            status: RunnerStatus::Offline,
            contacted_at: None,
            created_at: Utc::now(),
        };
        state.runners.insert(runner.id, runner.clone());
        Ok(runner)
    }

    async fn find_runner(&self, id: i64) -> StoreResult<Option<Runner>> {
        Ok(self.state.read().await.runners.get(&id).cloned())
    }

    async fn find_runner_by_token(&self, token: &str) -> StoreResult<Option<Runner>> {
        let state = self.state.read().await;
        Ok(state.runners.values().find(|r| r.token == token).cloned())
    }

    async fn list_runners(&self) -> StoreResult<Vec<Runner>> {
        Ok(self.state.read().await.runners.values().cloned().collect())
    }

    async fn delete_runner(&self, id: i64) -> StoreResult<bool> {
        Ok(self.state.write().await.runners.remove(&id).is_some())
    }

    async fn touch_runner(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(runner) = state.runners.get_mut(&id) {
            runner.contacted_at = Some(at);
            runner.status = RunnerStatus::Online;
        }
        Ok(())
    }

    async fn mark_stale_runners(&self, contacted_before: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut marked = 0;
        for runner in state.runners.values_mut() {
            let stale = runner.contacted_at.is_none_or(|at| at < contacted_before);
            if runner.status == RunnerStatus::Online && stale {
                runner.status = RunnerStatus::Offline;
                marked += 1;
            }
        }
        Ok(marked)
    }
}

#[async_trait]
impl TraceStore for InMemoryStore {
    async fn trace_chunks(&self, job_id: i64) -> StoreResult<Vec<TraceChunk>> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .range((job_id, i32::MIN)..=(job_id, i32::MAX))
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }

    async fn save_trace_chunk(&self, chunk: &TraceChunk) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .chunks
            .insert((chunk.job_id, chunk.chunk_index), chunk.clone());
        Ok(())
    }

    async fn delete_trace_chunks(&self, job_id: i64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.chunks.retain(|(id, _), _| *id != job_id);
        Ok(())
    }

    async fn create_pending_state(&self, pending: &PendingState) -> StoreResult<PendingState> {
        let mut state = self.state.write().await;
        Ok(state
            .pending_states
            .entry(pending.job_id)
            .or_insert_with(|| pending.clone())
            .clone())
    }

    async fn delete_pending_state(&self, job_id: i64) -> StoreResult<()> {
        self.state.write().await.pending_states.remove(&job_id);
        Ok(())
    }

    async fn trace_metadata(&self, job_id: i64) -> StoreResult<Option<TraceMetadata>> {
        Ok(self.state.read().await.trace_metadata.get(&job_id).cloned())
    }

    async fn save_trace_metadata(&self, metadata: &TraceMetadata) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .trace_metadata
            .insert(metadata.job_id, metadata.clone());
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn create_job_artifact(&self, artifact: NewJobArtifact) -> StoreResult<JobArtifact> {
        let mut state = self.state.write().await;
        let duplicate = state
            .job_artifacts
            .values()
            .any(|a| a.job_id == artifact.job_id && a.file_type == artifact.file_type);
        if duplicate {
            return Err(StoreError::Conflict(
                "artifact of this type already exists".to_string(),
            ));
        }
        let artifact = JobArtifact {
            id: state.next_id(),
            job_id: artifact.job_id,
            pipeline_id: artifact.pipeline_id,
            project_id: artifact.project_id,
            file_type: artifact.file_type,
            file_path: artifact.file_path,
            size: artifact.size,
            locked: artifact.locked,
            expire_at: artifact.expire_at,
            created_at: Utc::now(),
        };
        state.adjust_artifacts_size(artifact.project_id, artifact.size);
        state.job_artifacts.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn job_artifacts(&self, job_id: i64) -> StoreResult<Vec<JobArtifact>> {
        let state = self.state.read().await;
        Ok(state
            .job_artifacts
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn pipeline_job_artifacts(&self, pipeline_id: i64) -> StoreResult<Vec<JobArtifact>> {
        let state = self.state.read().await;
        Ok(state
            .job_artifacts
            .values()
            .filter(|a| a.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn resolve_unknown_artifact_locks(&self, limit: usize) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let locks: HashMap<i64, ArtifactLock> = state
            .pipelines
            .values()
            .map(|p| (p.id, ArtifactLock::from(p.locked)))
            .collect();
        let mut resolved = 0;
        for artifact in state
            .job_artifacts
            .values_mut()
            .filter(|a| a.locked == ArtifactLock::Unknown)
            .take(limit)
        {
            artifact.locked = locks
                .get(&artifact.pipeline_id)
                .copied()
                .unwrap_or(ArtifactLock::Unlocked);
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn expired_job_artifacts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobArtifact>> {
        let state = self.state.read().await;
        Ok(state
            .job_artifacts
            .values()
            .filter(|a| {
                a.locked == ArtifactLock::Unlocked
                    && a.file_type != ArtifactType::Trace
                    && a.is_expired(now)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn destroy_job_artifacts(
        &self,
        artifacts: &[JobArtifact],
        pick_up_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut destroyed = 0;
        for artifact in artifacts {
            let Some(removed) = state.job_artifacts.remove(&artifact.id) else {
                continue;
            };
            let id = state.next_id();
            state.deleted_objects.insert(
                id,
                DeletedObject {
                    id,
                    file_path: removed.file_path,
                    pick_up_at,
                    created_at: now,
                },
            );
            state.adjust_artifacts_size(removed.project_id, -removed.size);
            destroyed += 1;
        }
        Ok(destroyed)
    }

    async fn unlock_job_artifacts(&self, pipeline_id: i64, limit: usize) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut unlocked = 0;
        for artifact in state
            .job_artifacts
            .values_mut()
            .filter(|a| a.pipeline_id == pipeline_id && a.locked != ArtifactLock::Unlocked)
            .take(limit)
        {
            artifact.locked = ArtifactLock::Unlocked;
            unlocked += 1;
        }
        Ok(unlocked)
    }

    async fn create_pipeline_artifact(
        &self,
        artifact: NewPipelineArtifact,
    ) -> StoreResult<PipelineArtifact> {
        let mut state = self.state.write().await;
        let duplicate = state
            .pipeline_artifacts
            .values()
            .any(|a| a.pipeline_id == artifact.pipeline_id && a.file_type == artifact.file_type);
        if duplicate {
            return Err(StoreError::Conflict(
                "pipeline artifact of this type already exists".to_string(),
            ));
        }
        let artifact = PipelineArtifact {
            id: state.next_id(),
            pipeline_id: artifact.pipeline_id,
            project_id: artifact.project_id,
            file_type: artifact.file_type,
            file_path: artifact.file_path,
            size: artifact.size,
            locked: artifact.locked,
            expire_at: artifact.expire_at,
            created_at: Utc::now(),
        };
        state
            .pipeline_artifacts
            .insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn pipeline_artifacts(&self, pipeline_id: i64) -> StoreResult<Vec<PipelineArtifact>> {
        let state = self.state.read().await;
        Ok(state
            .pipeline_artifacts
            .values()
            .filter(|a| a.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn unlock_pipeline_artifacts(&self, pipeline_id: i64) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut unlocked = 0;
        for artifact in state
            .pipeline_artifacts
            .values_mut()
            .filter(|a| a.pipeline_id == pipeline_id && a.locked != ArtifactLock::Unlocked)
        {
            artifact.locked = ArtifactLock::Unlocked;
            unlocked += 1;
        }
        Ok(unlocked)
    }

    async fn claim_deleted_objects(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        retry_at: DateTime<Utc>,
    ) -> StoreResult<Vec<DeletedObject>> {
        let mut state = self.state.write().await;
        let mut claimed = Vec::new();
        for object in state
            .deleted_objects
            .values_mut()
            .filter(|o| o.pick_up_at <= now)
            .take(limit)
        {
            claimed.push(object.clone());
            object.pick_up_at = retry_at;
        }
        Ok(claimed)
    }

    async fn remove_deleted_objects(&self, ids: &[i64]) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        Ok(ids
            .iter()
            .filter(|id| state.deleted_objects.remove(id).is_some())
            .count() as u64)
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn try_obtain_lease(&self, key: &str, owner: Uuid, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let held_by_other = state
            .leases
            .get(key)
            .is_some_and(|(holder, expires_at)| *holder != owner && *expires_at > now);
        if held_by_other {
            return Ok(false);
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        state.leases.insert(key.to_string(), (owner, now + ttl));
        Ok(true)
    }

    async fn release_lease(&self, key: &str, owner: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.leases.get(key).is_some_and(|(holder, _)| *holder == owner) {
            state.leases.remove(key);
        }
        Ok(())
    }
}
