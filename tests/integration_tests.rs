//! End-to-end exercises of the deployment core: the HTTP surface, the
//! orchestrator pipeline against a real git remote, the entity-store
//! invariants, and the reverse-proxy lookup, with the container engine
//! and the queue backend replaced by recording doubles.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use futures_util::stream;
use http_body_util::BodyExt;
use tower::ServiceExt;

use dropdeploy::api::{AppState, build_router};
use dropdeploy::engine::demux::{StreamKind, encode_frame};
use dropdeploy::engine::{ContainerEngine, ExecSession};
use dropdeploy::errors::DeployError;
use dropdeploy::gateway::CommandGateway;
use dropdeploy::orchestrator::Orchestrator;
use dropdeploy::queue::{CompletedJob, DeployJob, JobQueue};
use dropdeploy::repo::RepoManager;
use dropdeploy::store::models::{DeploymentStatus, Framework};
use dropdeploy::store::{DbHandle, StoreDb};

// ── Doubles ───────────────────────────────────────────────────────────

/// Container engine double: prepares the build context like the real
/// adapter, then records what it was asked to build and run.
struct RecordingEngine {
    port: u16,
    fail_with: Mutex<Option<DeployError>>,
    built: Mutex<Vec<(String, PathBuf)>>,
    ran: Mutex<Vec<String>>,
}

impl RecordingEngine {
    fn new(port: u16) -> Self {
        Self {
            port,
            fail_with: Mutex::new(None),
            built: Mutex::new(Vec::new()),
            ran: Mutex::new(Vec::new()),
        }
    }

    fn fail_next_build(&self, err: DeployError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl ContainerEngine for RecordingEngine {
    async fn build_image(
        &self,
        slug: &str,
        context_dir: &Path,
        framework: Framework,
    ) -> Result<String, DeployError> {
        if let Some(err) = self.fail_with.lock().unwrap().take() {
            return Err(err);
        }
        dropdeploy::recipes::prepare_context(framework, context_dir)?;
        self.built
            .lock()
            .unwrap()
            .push((slug.to_string(), context_dir.to_path_buf()));
        Ok(format!("dropdeploy/{}:latest", slug))
    }

    async fn replace_and_run(
        &self,
        _image: &str,
        _framework: Framework,
        container_name: &str,
    ) -> Result<u16, DeployError> {
        self.ran.lock().unwrap().push(container_name.to_string());
        Ok(self.port)
    }

    async fn exec(&self, _container: &str, cmd: Vec<String>) -> Result<ExecSession, DeployError> {
        let reply = format!("ran: {}\n", cmd.last().cloned().unwrap_or_default());
        Ok(ExecSession {
            exec_id: "exec-1".into(),
            output: stream::iter(vec![Ok(encode_frame(StreamKind::Stdout, reply.as_bytes()))])
                .boxed(),
        })
    }

    async fn exec_exit_code(&self, _exec_id: &str) -> Result<Option<i64>, DeployError> {
        Ok(Some(0))
    }

    async fn logs(&self, _container: &str, tail: u32) -> Result<String, DeployError> {
        Ok(format!("last {} lines", tail))
    }

    async fn container_running(&self, _name: &str) -> Result<bool, DeployError> {
        Ok(true)
    }

    async fn find_running_by_image(&self, _image: &str) -> Result<Option<String>, DeployError> {
        Ok(None)
    }

    async fn remove_container(&self, _name: &str) -> Result<(), DeployError> {
        Ok(())
    }
}

/// Queue double: captures submitted jobs; optionally refuses like a dead
/// backend.
#[derive(Default)]
struct RecordingQueue {
    unavailable: bool,
    submitted: Mutex<Vec<DeployJob>>,
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn submit(&self, job: &DeployJob) -> Result<(), DeployError> {
        if self.unavailable {
            return Err(DeployError::QueueUnavailable("connection refused".into()));
        }
        self.submitted.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn pop(&self, _timeout: Duration) -> Result<Option<DeployJob>, DeployError> {
        Ok(None)
    }

    async fn record_completed(&self, _entry: &CompletedJob) -> Result<(), DeployError> {
        Ok(())
    }
}

// ── Fixture ───────────────────────────────────────────────────────────

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@test.invalid")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@test.invalid")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("git binary available");
    assert!(status.success(), "git {:?} failed", args);
}

struct TestEnv {
    app: Router,
    db: DbHandle,
    engine: Arc<RecordingEngine>,
    queue: Arc<RecordingQueue>,
    orchestrator: Arc<Orchestrator>,
    upstream: tempfile::TempDir,
    _projects_root: tempfile::TempDir,
}

fn setup(queue: RecordingQueue) -> TestEnv {
    let upstream = tempfile::tempdir().unwrap();
    git(upstream.path(), &["init", "--initial-branch=main"]);
    std::fs::write(upstream.path().join("index.html"), "<h1>v1</h1>").unwrap();
    git(upstream.path(), &["add", "."]);
    git(upstream.path(), &["commit", "-m", "initial"]);

    let projects_root = tempfile::tempdir().unwrap();
    let db = DbHandle::new(StoreDb::new_in_memory().unwrap());
    let engine = Arc::new(RecordingEngine::new(8765));
    let queue = Arc::new(queue);
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        queue.clone() as Arc<dyn JobQueue>,
        engine.clone() as Arc<dyn ContainerEngine>,
        Arc::new(RepoManager::new(projects_root.path())),
        "dropdeploy",
    ));
    let gateway = Arc::new(CommandGateway::new(
        engine.clone() as Arc<dyn ContainerEngine>,
        "dropdeploy",
    ));

    let state = Arc::new(AppState {
        db: db.clone(),
        orchestrator: orchestrator.clone(),
        gateway,
        container_prefix: "dropdeploy".to_string(),
    });

    TestEnv {
        app: build_router(state),
        db,
        engine,
        queue,
        orchestrator,
        upstream,
        _projects_root: projects_root,
    }
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", "u1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-user-id", "u1")
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn register_project(env: &TestEnv, name: &str, framework: &str) -> i64 {
    let resp = env
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/projects",
            serde_json::json!({
                "name": name,
                "repo_url": format!("file://{}", env.upstream.path().display()),
                "framework": framework,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    body_json(resp).await["id"].as_i64().unwrap()
}

/// Deploy via the API, then run the captured job like a worker would.
async fn deploy_and_run(env: &TestEnv, project_id: i64) -> (i64, Result<(), DeployError>) {
    let resp = env
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/projects/{}/deploy", project_id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let deployment_id = body_json(resp).await["deployment_id"].as_i64().unwrap();

    let job = env
        .queue
        .submitted
        .lock()
        .unwrap()
        .last()
        .cloned()
        .expect("deploy submits a job");
    assert_eq!(job.deployment_id, deployment_id);

    let result = env.orchestrator.build_and_deploy(job.deployment_id).await;
    (deployment_id, result)
}

// ── Scenarios ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_static_happy_path() {
    let env = setup(RecordingQueue::default());
    let project_id = register_project(&env, "site", "static").await;

    let (deployment_id, result) = deploy_and_run(&env, project_id).await;
    result.unwrap();

    // The pipeline built from the per-slug working directory, with the
    // recipe written into the context root.
    {
        let built = env.engine.built.lock().unwrap();
        assert_eq!(built[0].0, "site");
        assert!(built[0].1.ends_with("site"));
        assert!(built[0].1.join("Dockerfile").exists());
        assert!(built[0].1.join("index.html").exists());
        assert_eq!(
            *env.engine.ran.lock().unwrap(),
            vec!["dropdeploy-site".to_string()]
        );
    }

    // Client view: project detail renders terminal state and port.
    let resp = env
        .app
        .clone()
        .oneshot(get_request(&format!("/api/projects/{}", project_id)))
        .await
        .unwrap();
    let detail = body_json(resp).await;
    let latest = &detail["deployments"][0];
    assert_eq!(latest["id"].as_i64().unwrap(), deployment_id);
    assert_eq!(latest["status"], "deployed");
    assert_eq!(latest["build_step"], serde_json::Value::Null);
    assert_eq!(latest["subdomain"], "site");
    assert_eq!(latest["container_port"], 8765);

    // Reverse-proxy view: subdomain resolves to the loopback target.
    let resp = env
        .app
        .clone()
        .oneshot(get_request("/api/routes/site"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let route = body_json(resp).await;
    assert_eq!(route["target"], "127.0.0.1:8765");
}

#[tokio::test]
async fn test_branch_switch_redeploy_hands_over_subdomain() {
    let env = setup(RecordingQueue::default());
    let project_id = register_project(&env, "site", "static").await;

    let (first_id, result) = deploy_and_run(&env, project_id).await;
    result.unwrap();

    // New work lands on a dev branch upstream.
    git(env.upstream.path(), &["checkout", "-b", "dev"]);
    std::fs::write(env.upstream.path().join("index.html"), "<h1>dev</h1>").unwrap();
    git(env.upstream.path(), &["add", "."]);
    git(env.upstream.path(), &["commit", "-m", "dev work"]);
    git(env.upstream.path(), &["checkout", "main"]);

    // Operator switches the project to dev; a marker file in the clone
    // proves the second run fetched instead of re-cloning.
    env.db
        .call(move |db| db.set_project_branch(project_id, "dev"))
        .await
        .unwrap();
    let clone_dir = env.engine.built.lock().unwrap()[0].1.clone();
    std::fs::write(clone_dir.join("marker.txt"), "no re-clone").unwrap();

    let (second_id, result) = deploy_and_run(&env, project_id).await;
    result.unwrap();

    assert!(clone_dir.join("marker.txt").exists());
    assert_eq!(
        std::fs::read_to_string(clone_dir.join("index.html")).unwrap(),
        "<h1>dev</h1>"
    );

    let first = env
        .db
        .call(move |db| db.get_deployment(first_id))
        .await
        .unwrap()
        .unwrap();
    let second = env
        .db
        .call(move |db| db.get_deployment(second_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, DeploymentStatus::Deployed);
    assert!(first.subdomain.is_none());
    assert_eq!(second.subdomain.as_deref(), Some("site"));
}

#[tokio::test]
async fn test_nodejs_build_that_produces_no_image() {
    let env = setup(RecordingQueue::default());
    let project_id = register_project(&env, "app", "nodejs").await;
    env.engine
        .fail_next_build(DeployError::ImageMissingAfterBuild {
            hint: "the build stream completed but no image exists; check that package.json \
                   defines a `start` script"
                .into(),
        });

    let (deployment_id, result) = deploy_and_run(&env, project_id).await;
    let err = result.unwrap_err();
    assert!(err.is_retryable());

    let failed = env
        .db
        .call(move |db| db.get_deployment(deployment_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.logs.unwrap().contains("`start` script"));
    assert!(env.engine.ran.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_terminal_round_trip_and_allow_list() {
    let env = setup(RecordingQueue::default());
    let project_id = register_project(&env, "site", "static").await;
    deploy_and_run(&env, project_id).await.1.unwrap();

    // Destructive commands are rejected before any engine call.
    let resp = env
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/projects/{}/terminal", project_id),
            serde_json::json!({"command": "rm -rf /"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = env
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/projects/{}/terminal", project_id),
            serde_json::json!({"command": "ls -la"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let outcome = body_json(resp).await;
    assert_eq!(outcome["stdout"], "ran: ls -la\n");
    assert_eq!(outcome["exit_code"], 0);
}

#[tokio::test]
async fn test_deploy_succeeds_while_queue_backend_is_down() {
    let env = setup(RecordingQueue {
        unavailable: true,
        ..Default::default()
    });
    let project_id = register_project(&env, "site", "static").await;

    let resp = env
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/projects/{}/deploy", project_id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let deployment_id = body_json(resp).await["deployment_id"].as_i64().unwrap();

    // No job was delivered, but the row is durable and queued: operator
    // re-submission after the backend recovers proceeds normally.
    assert!(env.queue.submitted.lock().unwrap().is_empty());
    let row = env
        .db
        .call(move |db| db.get_deployment(deployment_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, DeploymentStatus::Queued);

    env.orchestrator.build_and_deploy(deployment_id).await.unwrap();
    let row = env
        .db
        .call(move |db| db.get_deployment(deployment_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, DeploymentStatus::Deployed);
}

#[tokio::test]
async fn test_rerun_of_same_deployment_is_safe() {
    let env = setup(RecordingQueue::default());
    let project_id = register_project(&env, "site", "static").await;

    let (deployment_id, result) = deploy_and_run(&env, project_id).await;
    result.unwrap();

    // A duplicate delivery simply rebuilds and replaces the container;
    // the row lands in the same terminal state.
    env.orchestrator.build_and_deploy(deployment_id).await.unwrap();
    let row = env
        .db
        .call(move |db| db.get_deployment(deployment_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, DeploymentStatus::Deployed);
    assert_eq!(row.subdomain.as_deref(), Some("site"));
    assert_eq!(
        *env.engine.ran.lock().unwrap(),
        vec!["dropdeploy-site".to_string(), "dropdeploy-site".to_string()]
    );
}

#[tokio::test]
async fn test_nextjs_context_receives_config_patch() {
    let env = setup(RecordingQueue::default());
    let project_id = register_project(&env, "shop", "nextjs").await;

    deploy_and_run(&env, project_id).await.1.unwrap();

    let context = env.engine.built.lock().unwrap()[0].1.clone();
    let config = std::fs::read_to_string(context.join("next.config.js")).unwrap();
    assert!(config.contains("ignoreBuildErrors"));
}
