//! Shared fixtures for service tests

use chrono::Utc;
use conduit_core::domain::job::{FailureReason, Job};
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::domain::project::{MemberRole, NewProject, Project, User};
use conduit_core::domain::runner::{NewRunner, Runner, RunnerAccessLevel, RunnerType};
use conduit_core::dto::pipeline::CreatePipeline;
use conduit_core::{JobEvent, Status};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::{Config, StoreKind};
use crate::error::ServiceResult;
use crate::repository::InMemoryStore;
use crate::service::context::ServiceContext;
use crate::service::pipeline;
use crate::storage::LocalObjectStore;
use crate::worker::{self, BackgroundJob, RecordingQueue};

/// Two jobs in two stages: `compile` (build) then `unit` (test)
pub fn simple_config() -> &'static str {
    r#"
    return {
        stages = { "build", "test" },
        jobs = {
            { name = "compile", stage = "build", script = "make" },
            { name = "unit", stage = "test", script = "make test" },
        },
    }
    "#
}

/// In-memory store, recording queue and a scratch object store
pub struct TestEnv {
    pub ctx: ServiceContext,
    pub queue: Arc<RecordingQueue>,
    _dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config {
            store: StoreKind::Memory,
            registration_token: "register-me".to_string(),
            artifacts_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        tweak(&mut config);

        let queue = Arc::new(RecordingQueue::new());
        let ctx = ServiceContext::new(
            Arc::new(InMemoryStore::new()),
            queue.clone(),
            Arc::new(LocalObjectStore::new(dir.path())),
            config,
        );

        Self {
            ctx,
            queue,
            _dir: dir,
        }
    }

    pub async fn user(&self, username: &str) -> User {
        self.ctx.store.create_user(username, false).await.unwrap()
    }

    pub async fn admin(&self, username: &str) -> User {
        self.ctx.store.create_user(username, true).await.unwrap()
    }

    /// Private project owned by `owner`, without a stored definition
    pub async fn project(&self, owner: &User, path: &str) -> Project {
        self.create_project(owner, path, None).await
    }

    pub async fn project_with_config(&self, owner: &User, path: &str, config: &str) -> Project {
        self.create_project(owner, path, Some(config)).await
    }

    async fn create_project(&self, owner: &User, path: &str, config: Option<&str>) -> Project {
        let new_project: NewProject = serde_json::from_value(serde_json::json!({
            "path": path,
            "ci_config": config,
        }))
        .unwrap();

        let token = format!("runners-{}", path.replace('/', "-"));
        let project = self
            .ctx
            .store
            .create_project(new_project, &token)
            .await
            .unwrap();
        self.member(&project, owner, MemberRole::Owner).await;
        project
    }

    pub async fn member(&self, project: &Project, user: &User, role: MemberRole) {
        self.ctx
            .store
            .add_member(project.id, user.id, role)
            .await
            .unwrap();
    }

    pub async fn try_create_pipeline(
        &self,
        user: &User,
        project: &Project,
        config: &str,
    ) -> ServiceResult<Pipeline> {
        pipeline::create_pipeline(
            &self.ctx,
            Some(user),
            project.id,
            CreatePipeline {
                ref_name: "main".to_string(),
                sha: Some("a1b2c3".to_string()),
                config: Some(config.to_string()),
                variables: BTreeMap::new(),
            },
        )
        .await
    }

    /// Owner `owner`, project `acme/app` and a pipeline on `main`; nothing
    /// is processed yet
    pub async fn pipeline_from(&self, config: &str) -> (User, Pipeline) {
        let owner = self.user("owner").await;
        let project = self.project(&owner, "acme/app").await;
        let pipeline = self
            .try_create_pipeline(&owner, &project, config)
            .await
            .unwrap();
        (owner, pipeline)
    }

    /// Latest attempt of the named job
    pub async fn job_named(&self, pipeline_id: i64, name: &str) -> Job {
        self.ctx
            .latest_jobs(pipeline_id)
            .await
            .unwrap()
            .into_iter()
            .find(|job| job.name == name)
            .unwrap_or_else(|| panic!("no job named {name}"))
    }

    pub async fn status_of(&self, pipeline_id: i64, name: &str) -> Status {
        self.job_named(pipeline_id, name).await.status
    }

    /// Every attempt of the named job, oldest first
    pub async fn attempts(&self, pipeline_id: i64, name: &str) -> Vec<Job> {
        self.ctx
            .store
            .pipeline_jobs(pipeline_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|job| job.name == name)
            .collect()
    }

    /// Move a pending job to running with a known token, as assignment does
    pub async fn start(&self, pipeline_id: i64, name: &str) -> Job {
        let mut job = self.job_named(pipeline_id, name).await;
        job.fire(JobEvent::Run, Utc::now()).unwrap();
        job.token = Some(format!("job-token-{}", job.id));
        self.ctx.store.update_job(&job).await.unwrap()
    }

    /// Drive a pending job to `status` as a runner would, then queue
    /// processing
    pub async fn finish(&self, pipeline_id: i64, name: &str, status: Status) -> Job {
        let mut job = self.job_named(pipeline_id, name).await;
        let now = Utc::now();

        if job.status == Status::Pending {
            job.fire(JobEvent::Run, now).unwrap();
        }
        match status {
            Status::Success => job.fire(JobEvent::Succeed, now).unwrap(),
            Status::Failed => job.drop_with(FailureReason::ScriptFailure, Some(1), now).unwrap(),
            Status::Canceled => job.fire(JobEvent::Cancel, now).unwrap(),
            other => panic!("cannot finish a job as {other}"),
        }

        let job = self.ctx.store.update_job(&job).await.unwrap();
        self.ctx
            .queue
            .enqueue(BackgroundJob::ProcessPipeline { pipeline_id });
        job
    }

    pub async fn runner(&self, runner_type: RunnerType, tags: &[&str], token: &str) -> Runner {
        self.ctx
            .store
            .create_runner(
                NewRunner {
                    description: Some(format!("{token} runner")),
                    runner_type,
                    group_id: None,
                    project_ids: Vec::new(),
                    tags: tags.iter().map(|tag| tag.to_string()).collect(),
                    run_untagged: tags.is_empty(),
                    access_level: RunnerAccessLevel::NotProtected,
                },
                token,
            )
            .await
            .unwrap()
    }

    /// Project runner assigned to `project`
    pub async fn project_runner(&self, project: &Project, token: &str) -> Runner {
        self.ctx
            .store
            .create_runner(
                NewRunner {
                    description: None,
                    runner_type: RunnerType::Project,
                    group_id: None,
                    project_ids: vec![project.id],
                    tags: Vec::new(),
                    run_untagged: true,
                    access_level: RunnerAccessLevel::NotProtected,
                },
                token,
            )
            .await
            .unwrap()
    }

    /// Perform queued background jobs until none are left
    pub async fn drain(&self) -> usize {
        worker::drain(&self.ctx, &self.queue).await
    }
}
