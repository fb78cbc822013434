use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Recorded, nothing launched yet (or launched and waiting for the
    /// agent callback).
    Created,
    /// Accepted by a batch queue, waiting for placement.
    Submitted,
    /// ip/port known.
    Running,
    Stopped,
    Exited,
}

impl TaskStatus {
    /// `stopped` and `exited` are terminal: the task may be deleted and its
    /// tunnel port is released.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exited)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "exited" => Ok(Self::Exited),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Backend kind of a computing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ComputingKind {
    /// Docker on the orchestrator's own host.
    Local,
    /// A single host reached over ssh.
    Remote,
    /// A slurm cluster reached over ssh to its submit host.
    Slurm,
    /// A host reached over ssh through a first-hop gateway.
    #[sqlx(rename = "remotehop")]
    #[serde(rename = "remotehop")]
    RemoteHop,
}

impl ComputingKind {
    pub const ALL: [ComputingKind; 4] = [Self::Local, Self::Remote, Self::Slurm, Self::RemoteHop];
}

impl fmt::Display for ComputingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Slurm => "slurm",
            Self::RemoteHop => "remotehop",
        };
        f.write_str(s)
    }
}

impl FromStr for ComputingKind {
    type Err = ComputingKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "slurm" => Ok(Self::Slurm),
            "remotehop" => Ok(Self::RemoteHop),
            other => Err(ComputingKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ComputingKind`] string.
#[derive(Debug, Clone)]
pub struct ComputingKindParseError(pub String);

impl fmt::Display for ComputingKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid computing kind: {:?}", self.0)
    }
}

impl std::error::Error for ComputingKindParseError {}

// ---------------------------------------------------------------------------

/// Container runtime an image is packaged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContainerRuntime {
    Docker,
    Singularity,
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Docker => "docker",
            Self::Singularity => "singularity",
        })
    }
}

impl FromStr for ContainerRuntime {
    type Err = ContainerRuntimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "singularity" => Ok(Self::Singularity),
            other => Err(ContainerRuntimeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ContainerRuntime`] string.
#[derive(Debug, Clone)]
pub struct ContainerRuntimeParseError(pub String);

impl fmt::Display for ContainerRuntimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid container runtime: {:?}", self.0)
    }
}

impl std::error::Error for ContainerRuntimeParseError {}

// ---------------------------------------------------------------------------

/// Where an image is pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Registry {
    /// The deployment's private registry.
    DockerLocal,
    DockerHub,
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DockerLocal => "docker_local",
            Self::DockerHub => "docker_hub",
        })
    }
}

impl FromStr for Registry {
    type Err = RegistryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker_local" => Ok(Self::DockerLocal),
            "docker_hub" => Ok(Self::DockerHub),
            other => Err(RegistryParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Registry`] string.
#[derive(Debug, Clone)]
pub struct RegistryParseError(pub String);

impl fmt::Display for RegistryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid registry: {:?}", self.0)
    }
}

impl std::error::Error for RegistryParseError {}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A container spec. Immutable once a task references it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Container {
    pub id: Uuid,
    /// `None` for containers shared with every user.
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub image: String,
    pub runtime: ContainerRuntime,
    pub registry: Registry,
    /// Comma-separated list; the first entry is the default port.
    pub ports: Option<String>,
    pub supports_dynamic_ports: bool,
    pub supports_user_auth: bool,
    pub supports_pass_auth: bool,
    pub created_at: DateTime<Utc>,
}

impl Container {
    /// First entry of `ports`, if it parses as a port number.
    pub fn default_port(&self) -> Option<i32> {
        self.ports
            .as_deref()?
            .split(',')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .filter(|p| *p != 0)
            .map(i32::from)
    }

    pub fn is_visible_to(&self, user: Uuid) -> bool {
        self.owner_id.is_none_or(|owner| owner == user)
    }
}

/// A computing resource descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Computing {
    pub id: Uuid,
    /// `None` for resources shared with every user.
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub kind: ComputingKind,
    pub requires_sys_conf: bool,
    pub requires_user_conf: bool,
    pub requires_user_keys: bool,
    pub supports_docker: bool,
    pub supports_singularity: bool,
    pub created_at: DateTime<Utc>,
}

impl Computing {
    pub fn is_visible_to(&self, user: Uuid) -> bool {
        self.owner_id.is_none_or(|owner| owner == user)
    }

    pub fn is_owned_by(&self, user: Uuid) -> bool {
        self.owner_id == Some(user)
    }
}

/// A per-user ssh identity. The key material lives on disk; the row records
/// where.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KeyPair {
    pub id: Uuid,
    pub user_id: Uuid,
    pub private_key_file: String,
    pub public_key_file: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// A task record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub container_id: Uuid,
    pub computing_id: Uuid,
    /// Backend identifier: docker container id, or the task id for the ssh
    /// backends.
    pub tid: Option<String>,
    /// Remote pid or slurm job id.
    pub pid: Option<i64>,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub tunnel_port: Option<i32>,
    pub tunnel_pid: Option<i32>,
    pub auth_user: Option<String>,
    #[serde(skip_serializing, default)]
    pub auth_pass: Option<String>,
    pub extra_binds: Option<String>,
    pub options: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Backend options stored in `options`. Rows written through
    /// [`crate::queries::tasks::insert_task`] always decode; anything else
    /// falls back to no options.
    pub fn computing_options(&self) -> ComputingOptions {
        serde_json::from_value(self.options.clone()).unwrap_or_default()
    }
}

/// Free-form backend options attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ComputingOptions {
    pub fn is_empty(&self) -> bool {
        self.partition.is_none() && self.cpus.is_none() && self.memory.is_none()
    }
}
