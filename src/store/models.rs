use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Framework classification of a registered repository. Decides which
/// container recipe is written into the build context and which internal
/// port the container exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Static,
    Nodejs,
    Nextjs,
    Django,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Nodejs => "nodejs",
            Self::Nextjs => "nextjs",
            Self::Django => "django",
        }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "nodejs" => Ok(Self::Nodejs),
            "nextjs" => Ok(Self::Nextjs),
            "django" => Ok(Self::Django),
            _ => Err(format!("Invalid framework: {}", s)),
        }
    }
}

/// Lifecycle state of a deployment. `Deployed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deployed | Self::Failed)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "building" => Ok(Self::Building),
            "deployed" => Ok(Self::Deployed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Progress marker within the `Building` state, advanced strictly
/// `Cloning -> BuildingImage -> Starting`. Null once the deployment
/// reaches a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    Cloning,
    BuildingImage,
    Starting,
}

impl BuildStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloning => "cloning",
            Self::BuildingImage => "building_image",
            Self::Starting => "starting",
        }
    }
}

impl std::fmt::Display for BuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloning" => Ok(Self::Cloning),
            "building_image" => Ok(Self::BuildingImage),
            "starting" => Ok(Self::Starting),
            _ => Err(format!("Invalid build step: {}", s)),
        }
    }
}

/// A registered source repository owned by a user. The slug doubles as the
/// public subdomain and as the root of the container and image names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub slug: String,
    pub repo_url: String,
    pub framework: Framework,
    pub branch: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    /// Name of the container that serves this project: `<prefix>-<slug>`.
    pub fn container_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.slug)
    }

    /// Image reference built for this project: `<prefix>/<slug>:latest`.
    pub fn image_ref(&self, prefix: &str) -> String {
        format!("{}/{}:latest", prefix, self.slug)
    }
}

/// One attempt to build and run a project at a point in time. Created as
/// `Queued` and mutated only by the orchestrator as the pipeline advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub project_id: i64,
    pub status: DeploymentStatus,
    pub build_step: Option<BuildStep>,
    pub container_port: Option<u16>,
    pub subdomain: Option<String>,
    pub logs: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
