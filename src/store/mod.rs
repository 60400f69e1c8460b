//! Entity store: typed access to Project and Deployment rows.
//!
//! All mutations of a single deployment go through single-row UPDATEs here,
//! which makes the store the synchronization point between concurrent
//! pipelines. The `mark_*` helpers maintain the lifecycle invariants:
//! `completed_at` is set exactly on the terminal statuses and `build_step`
//! is cleared whenever a deployment leaves `building`.

pub mod models;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::DeployError;
use self::models::{BuildStep, Deployment, DeploymentStatus, Framework, Project};

/// Async-safe handle to the entity store.
///
/// Wraps `StoreDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl DbHandle {
    pub fn new(db: StoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, DeployError>
    where
        F: FnOnce(&StoreDb) -> Result<R, DeployError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| DeployError::Internal(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| DeployError::Internal(format!("DB task panicked: {}", e)))?
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, DeployError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, DeployError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), DeployError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<(), DeployError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                repo_url TEXT NOT NULL,
                framework TEXT NOT NULL,
                branch TEXT NOT NULL DEFAULT 'main',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'queued',
                build_step TEXT,
                container_port INTEGER,
                subdomain TEXT,
                logs TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_project
                ON deployments(project_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_subdomain
                ON deployments(subdomain)
                WHERE subdomain IS NOT NULL;
            ",
        )?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        user_id: &str,
        name: &str,
        slug: &str,
        repo_url: &str,
        framework: Framework,
        branch: &str,
    ) -> Result<Project, DeployError> {
        let ts = now();
        let result = self.conn.execute(
            "INSERT INTO projects (user_id, name, slug, repo_url, framework, branch, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![user_id, name, slug, repo_url, framework.as_str(), branch, ts],
        );
        match result {
            Ok(_) => {}
            Err(e) if e.to_string().contains("UNIQUE constraint failed: projects.slug") => {
                return Err(DeployError::Validation(format!(
                    "slug '{}' is already in use",
                    slug
                )));
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .ok_or_else(|| DeployError::Database("project vanished after insert".into()))
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>, DeployError> {
        self.conn
            .query_row(
                "SELECT id, user_id, name, slug, repo_url, framework, branch, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id],
                row_to_project,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Load a project only when it belongs to `user_id`. A foreign owner
    /// reads the same as a missing project so existence never leaks.
    pub fn get_project_for_user(
        &self,
        id: i64,
        user_id: &str,
    ) -> Result<Option<Project>, DeployError> {
        self.conn
            .query_row(
                "SELECT id, user_id, name, slug, repo_url, framework, branch, created_at, updated_at
                 FROM projects WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                row_to_project,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_projects(&self, user_id: &str) -> Result<Vec<Project>, DeployError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, slug, repo_url, framework, branch, created_at, updated_at
             FROM projects WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_project)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Point a project at a different branch; the next deployment picks
    /// it up.
    pub fn set_project_branch(&self, id: i64, branch: &str) -> Result<(), DeployError> {
        self.conn.execute(
            "UPDATE projects SET branch = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, branch, now()],
        )?;
        Ok(())
    }

    /// Delete a project and (via cascade) its deployments. Returns whether a
    /// row existed. The caller is responsible for stopping the project's
    /// container first.
    pub fn delete_project(&self, id: i64) -> Result<bool, DeployError> {
        let n = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ── Deployments ───────────────────────────────────────────────────

    pub fn create_deployment(&self, project_id: i64) -> Result<Deployment, DeployError> {
        let ts = now();
        self.conn.execute(
            "INSERT INTO deployments (project_id, status, created_at, updated_at)
             VALUES (?1, 'queued', ?2, ?2)",
            params![project_id, ts],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_deployment(id)?
            .ok_or_else(|| DeployError::Database("deployment vanished after insert".into()))
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>, DeployError> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_DEPLOYMENT),
                params![id],
                row_to_deployment,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn recent_deployments(
        &self,
        project_id: i64,
        limit: i64,
    ) -> Result<Vec<Deployment>, DeployError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
            SELECT_DEPLOYMENT
        ))?;
        let rows = stmt.query_map(params![project_id, limit], row_to_deployment)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn latest_deployment(&self, project_id: i64) -> Result<Option<Deployment>, DeployError> {
        Ok(self.recent_deployments(project_id, 1)?.into_iter().next())
    }

    /// Move a queued (or re-delivered) deployment into `building` with the
    /// `cloning` step and stamp `started_at`.
    pub fn mark_building(&self, id: i64) -> Result<(), DeployError> {
        let ts = now();
        self.conn.execute(
            "UPDATE deployments
             SET status = 'building', build_step = 'cloning', started_at = ?2,
                 completed_at = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, ts],
        )?;
        Ok(())
    }

    pub fn set_build_step(&self, id: i64, step: BuildStep) -> Result<(), DeployError> {
        self.conn.execute(
            "UPDATE deployments SET build_step = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, step.as_str(), now()],
        )?;
        Ok(())
    }

    pub fn mark_deployed(
        &self,
        id: i64,
        container_port: u16,
        subdomain: &str,
    ) -> Result<(), DeployError> {
        let ts = now();
        self.conn.execute(
            "UPDATE deployments
             SET status = 'deployed', build_step = NULL, container_port = ?2,
                 subdomain = ?3, completed_at = ?4, updated_at = ?4
             WHERE id = ?1",
            params![id, container_port as i64, subdomain, ts],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, logs: &str) -> Result<(), DeployError> {
        let ts = now();
        self.conn.execute(
            "UPDATE deployments
             SET status = 'failed', build_step = NULL, logs = ?2,
                 completed_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, logs, ts],
        )?;
        Ok(())
    }

    /// Clear the subdomain on every other deployment of the project so the
    /// uniqueness invariant holds before `keep_id` takes it over. Returns
    /// the number of rows cleared.
    pub fn clear_subdomain_on_other_deployments(
        &self,
        project_id: i64,
        subdomain: &str,
        keep_id: i64,
    ) -> Result<usize, DeployError> {
        let n = self.conn.execute(
            "UPDATE deployments SET subdomain = NULL, updated_at = ?4
             WHERE project_id = ?1 AND subdomain = ?2 AND id != ?3",
            params![project_id, subdomain, keep_id, now()],
        )?;
        Ok(n)
    }

    /// Reverse-proxy lookup: the host port serving a subdomain, if any
    /// deployment currently holds it.
    pub fn resolve_subdomain(&self, subdomain: &str) -> Result<Option<u16>, DeployError> {
        let port: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT container_port FROM deployments
                 WHERE subdomain = ?1 AND status = 'deployed'",
                params![subdomain],
                |row| row.get(0),
            )
            .optional()?;
        Ok(port.flatten().map(|p| p as u16))
    }

    /// Mark deployments stranded in `building` as failed. A row can only be
    /// in that state with no live pipeline when a worker died mid-build, so
    /// this runs once at worker startup. Returns the number swept.
    pub fn sweep_stuck_building(&self) -> Result<usize, DeployError> {
        let ts = now();
        let n = self.conn.execute(
            "UPDATE deployments
             SET status = 'failed', build_step = NULL,
                 logs = 'worker restarted while the build was in progress',
                 completed_at = ?1, updated_at = ?1
             WHERE status = 'building'",
            params![ts],
        )?;
        Ok(n)
    }
}

const SELECT_DEPLOYMENT: &str = "SELECT id, project_id, status, build_step, container_port, \
     subdomain, logs, started_at, completed_at, created_at, updated_at FROM deployments";

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let framework: String = row.get(5)?;
    Ok(Project {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        repo_url: row.get(4)?,
        framework: Framework::from_str(&framework).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
        branch: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deployment> {
    let status: String = row.get(2)?;
    let build_step: Option<String> = row.get(3)?;
    let container_port: Option<i64> = row.get(4)?;
    Ok(Deployment {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status: DeploymentStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
        build_step: build_step
            .map(|s| {
                BuildStep::from_str(&s).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                    )
                })
            })
            .transpose()?,
        container_port: container_port.map(|p| p as u16),
        subdomain: row.get(5)?,
        logs: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
