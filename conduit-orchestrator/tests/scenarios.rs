//! End-to-end scenarios against the in-memory store

use chrono::Utc;
use conduit_core::domain::job::{FailureReason, Job};
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::domain::project::{NewProject, User};
use conduit_core::domain::runner::{NewRunner, RunnerAccessLevel, RunnerType};
use conduit_core::dto::job::{RemoteState, RequestJob, UpdateJob};
use conduit_core::dto::pipeline::CreatePipeline;
use conduit_core::{JobEvent, Status};
use std::sync::Arc;
use tempfile::TempDir;

use conduit_orchestrator::config::{Config, StoreKind};
use conduit_orchestrator::repository::InMemoryStore;
use conduit_orchestrator::service::register_job::{self, RequestOutcome};
use conduit_orchestrator::service::{ServiceContext, build_state, pipeline, project, retry};
use conduit_orchestrator::storage::LocalObjectStore;
use conduit_orchestrator::worker::{self, RecordingQueue};

struct Harness {
    ctx: ServiceContext,
    queue: Arc<RecordingQueue>,
    owner: User,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(RecordingQueue::new());
        let config = Config {
            store: StoreKind::Memory,
            registration_token: "register-me".to_string(),
            artifacts_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let ctx = ServiceContext::new(
            Arc::new(InMemoryStore::new()),
            queue.clone(),
            Arc::new(LocalObjectStore::new(dir.path())),
            config,
        );
        let owner = ctx.store.create_user("owner", false).await.unwrap();

        Self {
            ctx,
            queue,
            owner,
            _dir: dir,
        }
    }

    async fn pipeline(&self, config: &str) -> Pipeline {
        let new_project: NewProject =
            serde_json::from_value(serde_json::json!({ "path": "acme/service" })).unwrap();
        let created = project::create_project(&self.ctx, Some(&self.owner), new_project)
            .await
            .unwrap();

        let pipeline = pipeline::create_pipeline(
            &self.ctx,
            Some(&self.owner),
            created.project.id,
            CreatePipeline {
                ref_name: "main".to_string(),
                sha: Some("deadbeef".to_string()),
                config: Some(config.to_string()),
                variables: Default::default(),
            },
        )
        .await
        .unwrap();
        self.drain().await;
        pipeline
    }

    async fn drain(&self) {
        worker::drain(&self.ctx, &self.queue).await;
    }

    async fn job(&self, pipeline_id: i64, name: &str) -> Job {
        self.ctx
            .latest_jobs(pipeline_id)
            .await
            .unwrap()
            .into_iter()
            .find(|job| job.name == name)
            .unwrap()
    }

    async fn runner(&self, token: &str) {
        self.ctx
            .store
            .create_runner(
                NewRunner {
                    description: None,
                    runner_type: RunnerType::Instance,
                    group_id: None,
                    project_ids: Vec::new(),
                    tags: Vec::new(),
                    run_untagged: true,
                    access_level: RunnerAccessLevel::NotProtected,
                },
                token,
            )
            .await
            .unwrap();
    }

    /// Take the job through a runner and report `state`
    async fn run_as_runner(&self, runner_token: &str, state: RemoteState) -> Job {
        let outcome = register_job::request_job(
            &self.ctx,
            RequestJob {
                token: runner_token.to_string(),
            },
        )
        .await
        .unwrap();
        let RequestOutcome::Assigned(payload) = outcome else {
            panic!("expected a job, got {:?}", outcome);
        };

        let job = self.ctx.job(payload.id).await.unwrap();
        let response = build_state::update_job_state(
            &self.ctx,
            &job,
            UpdateJob {
                token: payload.token.clone(),
                state,
                checksum: None,
                failure_reason: None,
                exit_code: if state == RemoteState::Failed { Some(1) } else { None },
            },
        )
        .await
        .unwrap();
        assert!(response.accepted);
        self.drain().await;

        self.ctx.job(payload.id).await.unwrap()
    }
}

const WITH_CLEANUP: &str = r#"
    return {
        stages = { "build", "test", "cleanup" },
        jobs = {
            { name = "compile", stage = "build", script = "make" },
            { name = "unit", stage = "test", script = "make test" },
            { name = "report", stage = "cleanup", script = "collect", when = "always" },
        },
    }
"#;

#[tokio::test]
async fn failed_build_still_runs_always_jobs_and_fails_the_pipeline() {
    let harness = Harness::new().await;
    harness.runner("shared").await;
    let pipeline = harness.pipeline(WITH_CLEANUP).await;

    let compile = harness.run_as_runner("shared", RemoteState::Failed).await;
    assert_eq!(compile.name, "compile");
    assert_eq!(compile.failure_reason, Some(FailureReason::ScriptFailure));

    assert_eq!(harness.job(pipeline.id, "unit").await.status, Status::Skipped);
    assert_eq!(harness.job(pipeline.id, "report").await.status, Status::Pending);

    let report = harness.run_as_runner("shared", RemoteState::Success).await;
    assert_eq!(report.name, "report");

    let pipeline = harness.ctx.pipeline(pipeline.id).await.unwrap();
    assert_eq!(pipeline.status, Status::Failed);
    assert!(pipeline.finished_at.is_some());
}

#[tokio::test]
async fn concurrent_requests_assign_a_build_once() {
    let harness = Harness::new().await;
    harness.runner("first").await;
    harness.runner("second").await;
    let pipeline = harness
        .pipeline(r#"return { jobs = { { name = "only", script = "true" } } }"#)
        .await;

    let request = |token: &str| {
        register_job::request_job(
            &harness.ctx,
            RequestJob {
                token: token.to_string(),
            },
        )
    };
    let (a, b) = tokio::join!(request("first"), request("second"));
    let outcomes = [a.unwrap(), b.unwrap()];

    let assigned = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, RequestOutcome::Assigned(_)))
        .count();
    assert_eq!(assigned, 1);

    let job = harness.job(pipeline.id, "only").await;
    assert_eq!(job.status, Status::Running);
    assert!(job.runner_id.is_some());
}

#[tokio::test]
async fn retrying_a_failed_build_reopens_skipped_stages() {
    let harness = Harness::new().await;
    harness.runner("shared").await;
    let pipeline = harness.pipeline(WITH_CLEANUP).await;

    let compile = harness.run_as_runner("shared", RemoteState::Failed).await;
    harness.run_as_runner("shared", RemoteState::Success).await;
    assert_eq!(
        harness.ctx.pipeline(pipeline.id).await.unwrap().status,
        Status::Failed
    );

    let clone = retry::retry_job(&harness.ctx, Some(&harness.owner), compile.id)
        .await
        .unwrap();
    assert_ne!(clone.id, compile.id);
    harness.drain().await;

    assert!(harness.ctx.job(compile.id).await.unwrap().retried);
    assert_eq!(harness.job(pipeline.id, "compile").await.status, Status::Pending);
    assert_eq!(harness.job(pipeline.id, "unit").await.status, Status::Created);
    // The earlier `report` success keeps the pipeline running rather than pending
    assert_eq!(
        harness.ctx.pipeline(pipeline.id).await.unwrap().status,
        Status::Running
    );

    harness.run_as_runner("shared", RemoteState::Success).await;
    assert_eq!(harness.job(pipeline.id, "unit").await.status, Status::Pending);
}

#[tokio::test]
async fn manual_job_waits_for_play() {
    let harness = Harness::new().await;
    let pipeline = harness
        .pipeline(r#"return { jobs = { { name = "deploy", script = "ship", when = "manual" } } }"#)
        .await;

    let deploy = harness.job(pipeline.id, "deploy").await;
    assert_eq!(deploy.status, Status::Manual);

    retry::play_job(&harness.ctx, Some(&harness.owner), deploy.id)
        .await
        .unwrap();
    harness.drain().await;

    let mut deploy = harness.ctx.job(deploy.id).await.unwrap();
    assert_eq!(deploy.status, Status::Pending);
    assert_eq!(deploy.user_id, Some(harness.owner.id));

    // Played jobs can not be played again
    deploy.fire(JobEvent::Run, Utc::now()).unwrap();
    harness.ctx.store.update_job(&deploy).await.unwrap();
    assert!(
        retry::play_job(&harness.ctx, Some(&harness.owner), deploy.id)
            .await
            .is_err()
    );
}
