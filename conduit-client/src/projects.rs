//! User and project endpoints

use crate::ConduitClient;
use crate::error::Result;
use conduit_core::domain::project::{NewProject, Project, User};
use conduit_core::dto::project::{AddMember, CreateTrigger, CreateUser, CreatedProject, CreatedTrigger};
use reqwest::Method;

impl ConduitClient {
    /// Create a user; the username then works with [`ConduitClient::as_user`]
    pub async fn create_user(&self, req: &CreateUser) -> Result<User> {
        let response = self.request(Method::POST, "/api/users").json(req).send().await?;
        self.handle_response(response).await
    }

    /// Create a project owned by the current user
    pub async fn create_project(&self, req: &NewProject) -> Result<CreatedProject> {
        let response = self
            .request(Method::POST, "/api/projects")
            .json(req)
            .send()
            .await?;
        self.handle_response(response).await
    }

    pub async fn get_project(&self, project_id: i64) -> Result<Project> {
        let path = format!("/api/projects/{}", project_id);
        let response = self.request(Method::GET, &path).send().await?;
        self.handle_response(response).await
    }

    pub async fn add_member(&self, project_id: i64, req: &AddMember) -> Result<()> {
        let path = format!("/api/projects/{}/members", project_id);
        let response = self.request(Method::POST, &path).json(req).send().await?;
        self.handle_empty_response(response).await
    }

    /// Create a pipeline trigger token for the project
    pub async fn create_trigger(&self, project_id: i64, req: &CreateTrigger) -> Result<CreatedTrigger> {
        let path = format!("/api/projects/{}/triggers", project_id);
        let response = self.request(Method::POST, &path).json(req).send().await?;
        self.handle_response(response).await
    }
}
