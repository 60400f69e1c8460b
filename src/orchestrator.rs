//! Deployment orchestrator: owns every status transition a deployment
//! makes.
//!
//! `create_deployment` persists a queued row and submits the job;
//! `build_and_deploy` is the worker-side pipeline that drives the
//! repository manager and the container engine while recording progress.
//! Rows only ever move `queued -> building -> deployed | failed`, with
//! `failed` reachable from any non-terminal state.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::engine::ContainerEngine;
use crate::errors::DeployError;
use crate::queue::{DeployJob, JobQueue};
use crate::repo::RepoManager;
use crate::store::DbHandle;
use crate::store::models::{BuildStep, Deployment, Project};

/// Characters of a failure message persisted into `deployment.logs`.
const LOG_TAIL_CHARS: usize = 4000;

pub struct Orchestrator {
    db: DbHandle,
    queue: Arc<dyn JobQueue>,
    engine: Arc<dyn ContainerEngine>,
    repos: Arc<RepoManager>,
    prefix: String,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        queue: Arc<dyn JobQueue>,
        engine: Arc<dyn ContainerEngine>,
        repos: Arc<RepoManager>,
        prefix: &str,
    ) -> Self {
        Self {
            db,
            queue,
            engine,
            repos,
            prefix: prefix.to_string(),
        }
    }

    /// Persist a queued deployment for the caller's project and submit the
    /// job. A project owned by someone else reads as missing. An
    /// unreachable queue backend is logged and swallowed: the row is
    /// already durable and can be re-submitted once the backend returns.
    pub async fn create_deployment(
        &self,
        project_id: i64,
        user_id: &str,
    ) -> Result<Deployment, DeployError> {
        let user = user_id.to_string();
        let project = self
            .db
            .call(move |db| db.get_project_for_user(project_id, &user))
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("project {} not found", project_id)))?;

        let deployment = self
            .db
            .call(move |db| db.create_deployment(project_id))
            .await?;

        let job = DeployJob::new(deployment.id, project.id);
        match self.queue.submit(&job).await {
            Ok(()) => {
                info!(deployment_id = deployment.id, project = %project.slug, "deployment queued");
            }
            Err(DeployError::QueueUnavailable(msg)) => {
                warn!(
                    deployment_id = deployment.id,
                    "queue backend unreachable, deployment stays queued for later pickup: {}",
                    msg
                );
            }
            Err(other) => return Err(other),
        }

        Ok(deployment)
    }

    /// The pipeline. Any step failure marks the row failed (with the log
    /// tail) and is returned to the caller so the queue can apply its
    /// retry policy. A missing deployment or project means the job is
    /// stale and is silently dropped.
    pub async fn build_and_deploy(&self, deployment_id: i64) -> Result<(), DeployError> {
        let Some(deployment) = self
            .db
            .call(move |db| db.get_deployment(deployment_id))
            .await?
        else {
            info!(deployment_id, "dropping stale job: deployment no longer exists");
            return Ok(());
        };

        let project_id = deployment.project_id;
        let Some(project) = self.db.call(move |db| db.get_project(project_id)).await? else {
            info!(deployment_id, "dropping stale job: project no longer exists");
            return Ok(());
        };

        if project.repo_url.trim().is_empty() {
            self.db
                .call(move |db| db.mark_failed(deployment_id, "project has no repository URL"))
                .await?;
            return Ok(());
        }

        self.db.call(move |db| db.mark_building(deployment_id)).await?;

        match self.run_pipeline(deployment_id, &project).await {
            Ok(host_port) => {
                info!(
                    deployment_id,
                    project = %project.slug,
                    host_port,
                    "deployment is live"
                );
                Ok(())
            }
            Err(err) => {
                error!(deployment_id, project = %project.slug, error = %err, "pipeline failed");
                let tail = log_tail(&err.to_string());
                if let Err(db_err) = self
                    .db
                    .call(move |db| db.mark_failed(deployment_id, &tail))
                    .await
                {
                    error!(deployment_id, error = %db_err, "failed to record pipeline failure");
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        deployment_id: i64,
        project: &Project,
    ) -> Result<u16, DeployError> {
        let work_dir = self
            .repos
            .ensure_repo(&project.repo_url, &project.slug, &project.branch)
            .await?;

        self.db
            .call(move |db| db.set_build_step(deployment_id, BuildStep::BuildingImage))
            .await?;
        let image = self
            .engine
            .build_image(&project.slug, &work_dir, project.framework)
            .await?;

        self.db
            .call(move |db| db.set_build_step(deployment_id, BuildStep::Starting))
            .await?;
        let container_name = project.container_name(&self.prefix);
        let host_port = self
            .engine
            .replace_and_run(&image, project.framework, &container_name)
            .await?;

        // Subdomain handoff and the terminal write happen under one store
        // lock so no reader ever sees two holders.
        let project_id = project.id;
        let slug = project.slug.clone();
        self.db
            .call(move |db| {
                db.clear_subdomain_on_other_deployments(project_id, &slug, deployment_id)?;
                db.mark_deployed(deployment_id, host_port, &slug)
            })
            .await?;

        Ok(host_port)
    }

    /// Startup sweep: a row can only sit in `building` with no live
    /// pipeline when a worker died mid-build.
    pub async fn sweep_stuck_building(&self) -> Result<usize, DeployError> {
        let swept = self.db.call(|db| db.sweep_stuck_building()).await?;
        if swept > 0 {
            warn!(count = swept, "marked orphaned building deployments as failed");
        }
        Ok(swept)
    }

    /// Project-deletion hook: stop and remove the project's container,
    /// then delete the row (deployments cascade).
    pub async fn teardown_project(
        &self,
        project_id: i64,
        user_id: &str,
    ) -> Result<(), DeployError> {
        let user = user_id.to_string();
        let project = self
            .db
            .call(move |db| db.get_project_for_user(project_id, &user))
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("project {} not found", project_id)))?;

        self.engine
            .remove_container(&project.container_name(&self.prefix))
            .await?;
        self.db.call(move |db| db.delete_project(project_id)).await?;
        info!(project = %project.slug, "project removed");
        Ok(())
    }
}

fn log_tail(message: &str) -> String {
    if message.len() <= LOG_TAIL_CHARS {
        return message.to_string();
    }
    let mut start = message.len() - LOG_TAIL_CHARS;
    while !message.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &message[start..])
}
