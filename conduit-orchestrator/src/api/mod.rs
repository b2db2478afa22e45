//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod extract;
pub mod health;
pub mod job;
pub mod pipeline;
pub mod project;
pub mod runner;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::ServiceContext;

/// Create the main API router with all endpoints
pub fn create_router(ctx: ServiceContext) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Users and projects
        .route("/api/users", post(project::create_user))
        .route("/api/projects", post(project::create_project))
        .route("/api/projects/{id}", get(project::get_project))
        .route("/api/projects/{id}/members", post(project::add_member))
        .route("/api/projects/{id}/triggers", post(project::create_trigger))
        // Pipeline endpoints
        .route(
            "/api/projects/{id}/pipelines",
            post(pipeline::create_pipeline).get(pipeline::list_pipelines),
        )
        .route(
            "/api/projects/{id}/trigger/pipeline",
            post(pipeline::trigger_pipeline),
        )
        .route("/api/pipelines/{id}", get(pipeline::get_pipeline))
        .route("/api/pipelines/{id}/jobs", get(pipeline::list_pipeline_jobs))
        .route("/api/pipelines/{id}/cancel", post(pipeline::cancel_pipeline))
        .route("/api/pipelines/{id}/retry", post(pipeline::retry_pipeline))
        // Job endpoints
        .route("/api/jobs/request", post(job::request_job))
        .route("/api/jobs/{id}", get(job::get_job).put(job::update_job))
        .route("/api/jobs/{id}/retry", post(job::retry_job))
        .route("/api/jobs/{id}/play", post(job::play_job))
        .route("/api/jobs/{id}/cancel", post(job::cancel_job))
        .route(
            "/api/jobs/{id}/trace",
            get(job::get_trace).patch(job::append_trace),
        )
        .route("/api/jobs/{id}/artifacts", post(job::upload_artifact))
        // Runner endpoints
        .route(
            "/api/runners",
            post(runner::register_runner).get(runner::list_runners),
        )
        .route("/api/runners/verify", post(runner::verify_runner))
        .route("/api/runners/heartbeat", post(runner::runner_heartbeat))
        .route("/api/runners/{id}", delete(runner::delete_runner))
        // Add state and middleware
        .with_state(ctx)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{TestEnv, simple_config};
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::TestServer;
    use conduit_core::Status;
    use conduit_core::domain::runner::RunnerType;
    use serde_json::{Value, json};

    fn server(env: &TestEnv) -> TestServer {
        TestServer::new(create_router(env.ctx.clone())).unwrap()
    }

    fn user_header(name: &'static str) -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static(extract::USER_HEADER),
            HeaderValue::from_static(name),
        )
    }

    #[tokio::test]
    async fn test_health() {
        let env = TestEnv::new();
        let response = server(&env).get("/health").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }

    #[tokio::test]
    async fn test_project_and_pipeline_flow() {
        let env = TestEnv::new();
        let server = server(&env);
        env.user("alice").await;
        let (name, value) = user_header("alice");

        let created: Value = server
            .post("/api/projects")
            .add_header(name.clone(), value.clone())
            .json(&json!({ "path": "acme/web", "ci_config": simple_config() }))
            .await
            .json();
        let project_id = created["project"]["id"].as_i64().unwrap();
        assert!(created["runners_token"].as_str().is_some());

        let response = server
            .post(&format!("/api/projects/{}/pipelines", project_id))
            .add_header(name.clone(), value.clone())
            .json(&json!({ "ref": "main" }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let pipeline_id = response.json::<Value>()["id"].as_i64().unwrap();
        env.drain().await;

        let details: Value = server
            .get(&format!("/api/pipelines/{}", pipeline_id))
            .add_header(name.clone(), value.clone())
            .await
            .json();
        assert_eq!(details["jobs"].as_array().unwrap().len(), 2);
        assert_eq!(details["pipeline"]["status"], "pending");

        // Private projects are invisible to anonymous callers
        server
            .get(&format!("/api/pipelines/{}", pipeline_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let response = server
            .post(&format!("/api/pipelines/{}/cancel", pipeline_id))
            .add_header(name, value)
            .await;
        response.assert_status_ok();
        env.drain().await;
        assert_eq!(
            env.ctx.pipeline(pipeline_id).await.unwrap().status,
            Status::Canceled
        );
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected() {
        let env = TestEnv::new();
        let (name, value) = user_header("mallory");
        let response = server(&env)
            .post("/api/projects")
            .add_header(name, value)
            .json(&json!({ "path": "x/y" }))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["reason"], "unauthorized");
    }

    #[tokio::test]
    async fn test_runner_job_lifecycle() {
        let env = TestEnv::new();
        let server = server(&env);
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        env.runner(RunnerType::Instance, &[], "runner-token").await;

        let response = server
            .post("/api/jobs/request")
            .json(&json!({ "token": "runner-token" }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let payload: Value = response.json();
        let job_id = payload["id"].as_i64().unwrap();
        let token = payload["token"].as_str().unwrap().to_string();
        assert_eq!(payload["name"], "compile");

        // Nothing else is runnable until compile finishes
        server
            .post("/api/jobs/request")
            .json(&json!({ "token": "runner-token" }))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let job_token = HeaderName::from_static(extract::JOB_TOKEN_HEADER);
        let token_value = HeaderValue::from_str(&token).unwrap();

        let response = server
            .patch(&format!("/api/jobs/{}/trace", job_id))
            .add_header(job_token.clone(), token_value.clone())
            .add_header(
                axum::http::header::CONTENT_RANGE,
                HeaderValue::from_static("0-5"),
            )
            .bytes("hello\n".into())
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        assert_eq!(response.header("range"), "0-6");
        assert_eq!(response.header("job-status"), "running");

        // Resending from the start is refused with the current size
        let response = server
            .patch(&format!("/api/jobs/{}/trace", job_id))
            .add_header(job_token.clone(), token_value.clone())
            .add_header(
                axum::http::header::CONTENT_RANGE,
                HeaderValue::from_static("0-2"),
            )
            .bytes("abc".into())
            .await;
        response.assert_status(StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.header("range"), "0-6");

        let update = json!({ "token": token, "state": "success" });
        let response = server.put(&format!("/api/jobs/{}", job_id)).json(&update).await;
        response.assert_status(StatusCode::ACCEPTED);
        assert_eq!(response.json::<Value>()["backoff_secs"], 5);

        env.drain().await;
        server
            .put(&format!("/api/jobs/{}", job_id))
            .json(&update)
            .await
            .assert_status_ok();
        env.drain().await;

        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Success);
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Pending);

        // The job is over, so its token no longer opens the trace
        let response = server
            .patch(&format!("/api/jobs/{}/trace", job_id))
            .add_header(job_token, token_value)
            .add_header(
                axum::http::header::CONTENT_RANGE,
                HeaderValue::from_static("6-7"),
            )
            .bytes("ok".into())
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.header("job-status"), "success");

        let (name, value) = user_header("owner");
        let response = server
            .get(&format!("/api/jobs/{}/trace", job_id))
            .add_header(name, value)
            .await;
        response.assert_status_ok();
        response.assert_text("hello\n");
    }

    #[tokio::test]
    async fn test_bad_job_token() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        let job = env.start(pipeline.id, "compile").await;

        let response = server(&env)
            .put(&format!("/api/jobs/{}", job.id))
            .json(&json!({ "token": "wrong", "state": "running" }))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_runner_registration() {
        let env = TestEnv::new();
        let server = server(&env);

        server
            .post("/api/runners")
            .json(&json!({ "token": "nope" }))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/api/runners")
            .json(&json!({ "token": "register-me", "tags": ["linux"] }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let token = response.json::<Value>()["token"].as_str().unwrap().to_string();

        server
            .post("/api/runners/verify")
            .json(&json!({ "token": token }))
            .await
            .assert_status_ok();
        server
            .post("/api/runners/heartbeat")
            .json(&json!({ "token": token }))
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_runner_deletion_requires_admin() {
        let env = TestEnv::new();
        env.user("alice").await;
        env.admin("root").await;
        let runner = env.runner(RunnerType::Instance, &[], "gone").await;
        let server = server(&env);
        let path = format!("/api/runners/{}", runner.id);

        let (name, value) = user_header("alice");
        server
            .delete(&path)
            .add_header(name, value)
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let (name, value) = user_header("root");
        server
            .delete(&path)
            .add_header(name.clone(), value.clone())
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .delete(&path)
            .add_header(name, value)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
