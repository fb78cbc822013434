//! Operator-mode CLI handlers for registering what tasks run on:
//!
//! - `tether container add|list`  -- container specs
//! - `tether computing add|list`  -- computing resources
//! - `tether computing conf`      -- resource-level and per-user conf payloads
//! - `tether keys add|list`       -- per-user key pairs

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use tether_core::resource::{ResourceConf, validate_conf_data};
use tether_db::models::{Computing, ComputingKind, ContainerRuntime, Registry};
use tether_db::queries::computings::{self, NewComputing};
use tether_db::queries::containers::{self, NewContainer};
use tether_db::queries::keypairs;

use crate::{ComputingCommands, ContainerCommands, KeyCommands};

// -----------------------------------------------------------------------
// Public entry points
// -----------------------------------------------------------------------

pub async fn run_container_command(
    command: ContainerCommands,
    pool: &PgPool,
    operator: Uuid,
) -> Result<()> {
    match command {
        ContainerCommands::Add {
            name,
            image,
            runtime,
            registry,
            ports,
            dynamic_ports,
            user_auth,
            pass_auth,
            private,
        } => {
            let runtime: ContainerRuntime = runtime.parse().map_err(|_| {
                anyhow!("invalid runtime {runtime:?}; expected one of: docker, singularity")
            })?;
            let registry: Registry = registry.parse().map_err(|_| {
                anyhow!("invalid registry {registry:?}; expected one of: docker_hub, docker_local")
            })?;
            if let Some(list) = &ports {
                parse_ports(list)?;
            }

            let container = containers::insert_container(
                pool,
                &NewContainer {
                    owner_id: private.then_some(operator),
                    name,
                    image,
                    runtime,
                    registry,
                    ports,
                    supports_dynamic_ports: dynamic_ports,
                    supports_user_auth: user_auth,
                    supports_pass_auth: pass_auth,
                },
            )
            .await?;

            println!("Container registered:");
            println!("  ID:       {}", container.id);
            println!("  Name:     {}", container.name);
            println!("  Image:    {}", container.image);
            println!("  Runtime:  {}", container.runtime);
            println!("  Registry: {}", container.registry);
            if let Some(port) = container.default_port() {
                println!("  Port:     {port}");
            }
            Ok(())
        }
        ContainerCommands::List => {
            let list = containers::list_containers_visible_to(pool, operator).await?;
            if list.is_empty() {
                println!("No containers found. Use `tether container add` to register one.");
                return Ok(());
            }

            let name_w = list.iter().map(|c| c.name.len()).max().unwrap_or(4).max(4);
            let image_w = list.iter().map(|c| c.image.len()).max().unwrap_or(5).max(5);
            println!(
                "{:<36}  {:<name_w$}  {:<image_w$}  {:<11}  {:<12}  PORTS",
                "ID", "NAME", "IMAGE", "RUNTIME", "REGISTRY",
            );
            for c in &list {
                println!(
                    "{:<36}  {:<name_w$}  {:<image_w$}  {:<11}  {:<12}  {}",
                    c.id,
                    c.name,
                    c.image,
                    c.runtime.to_string(),
                    c.registry.to_string(),
                    c.ports.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}

pub async fn run_computing_command(
    command: ComputingCommands,
    pool: &PgPool,
    operator: Uuid,
) -> Result<()> {
    match command {
        ComputingCommands::Add {
            name,
            kind,
            no_sys_conf,
            user_conf,
            user_keys,
            docker,
            singularity,
            private,
        } => {
            let kind: ComputingKind = kind.parse().map_err(|_| {
                anyhow!("invalid kind {kind:?}; expected one of: local, remote, slurm, remotehop")
            })?;
            let remote = kind != ComputingKind::Local;

            let computing = computings::insert_computing(
                pool,
                &NewComputing {
                    owner_id: private.then_some(operator),
                    name,
                    kind,
                    requires_sys_conf: remote && !no_sys_conf,
                    requires_user_conf: remote && user_conf,
                    requires_user_keys: remote && user_keys,
                    supports_docker: docker || !remote,
                    supports_singularity: singularity || remote,
                },
            )
            .await?;

            println!("Computing resource registered:");
            println!("  ID:   {}", computing.id);
            println!("  Name: {}", computing.name);
            println!("  Kind: {}", computing.kind);
            if computing.requires_sys_conf {
                println!();
                println!(
                    "Next: `tether computing conf {} --sys '<json>'` to set host and credentials.",
                    computing.id
                );
            }
            Ok(())
        }
        ComputingCommands::List => {
            let list = computings::list_computings_visible_to(pool, operator).await?;
            if list.is_empty() {
                println!("No computing resources found. Use `tether computing add` to register one.");
                return Ok(());
            }

            let name_w = list.iter().map(|c| c.name.len()).max().unwrap_or(4).max(4);
            println!("{:<36}  {:<name_w$}  {:<9}  {:<7}  REQUIRES", "ID", "NAME", "KIND", "SHARED");
            for c in &list {
                let mut requires = Vec::new();
                if c.requires_sys_conf {
                    requires.push("sys_conf");
                }
                if c.requires_user_conf {
                    requires.push("user_conf");
                }
                if c.requires_user_keys {
                    requires.push("user_keys");
                }
                println!(
                    "{:<36}  {:<name_w$}  {:<9}  {:<7}  {}",
                    c.id,
                    c.name,
                    c.kind.to_string(),
                    if c.owner_id.is_none() { "yes" } else { "no" },
                    if requires.is_empty() { "-".to_owned() } else { requires.join(",") },
                );
            }
            Ok(())
        }
        ComputingCommands::Conf {
            computing_id,
            data,
            sys,
        } => {
            let id = Uuid::parse_str(&computing_id)
                .with_context(|| format!("invalid computing resource ID: {computing_id}"))?;
            let data: Value = serde_json::from_str(&data).context("conf data is not valid JSON")?;
            let scope = if sys { ConfScope::Resource } else { ConfScope::User };

            let outcome = save_conf(pool, operator, id, scope, data).await?;
            println!("Saved {} conf for computing resource {id}.", scope.label());
            if let ConfOutcome::Incomplete(missing) = outcome {
                println!("Resource still needs its {missing} conf before tasks can start.");
            }
            Ok(())
        }
    }
}

pub async fn run_key_command(command: KeyCommands, pool: &PgPool, operator: Uuid) -> Result<()> {
    match command {
        KeyCommands::Add {
            private_key,
            public_key,
            default,
        } => {
            if !std::path::Path::new(&private_key).is_file() {
                bail!("private key file {private_key} does not exist");
            }
            let keypair =
                keypairs::insert_keypair(pool, operator, &private_key, &public_key, default).await?;
            println!("Key pair registered:");
            println!("  ID:      {}", keypair.id);
            println!("  Private: {}", keypair.private_key_file);
            println!("  Public:  {}", keypair.public_key_file);
            println!("  Default: {}", keypair.is_default);
            Ok(())
        }
        KeyCommands::List => {
            let list = keypairs::list_keypairs(pool, operator).await?;
            if list.is_empty() {
                println!("No key pairs found. Use `tether keys add` to register one.");
                return Ok(());
            }
            let key_w = list
                .iter()
                .map(|k| k.private_key_file.len())
                .max()
                .unwrap_or(11)
                .max(11);
            println!("{:<36}  {:<key_w$}  DEFAULT", "ID", "PRIVATE KEY");
            for k in &list {
                println!(
                    "{:<36}  {:<key_w$}  {}",
                    k.id,
                    k.private_key_file,
                    if k.is_default { "*" } else { "" },
                );
            }
            Ok(())
        }
    }
}

// -----------------------------------------------------------------------
// Conf payloads
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfScope {
    Resource,
    User,
}

impl ConfScope {
    fn label(self) -> &'static str {
        match self {
            Self::Resource => "resource-level",
            Self::User => "user-level",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfOutcome {
    /// Every required payload is present and together they validate.
    Complete,
    /// Saved, but the named required payload is still missing.
    Incomplete(&'static str),
}

/// Store a conf payload for `operator` on a visible computing resource.
///
/// Once every payload the resource requires is present, the merged conf
/// must satisfy [`validate_conf_data`]; otherwise nothing is saved.
pub async fn save_conf(
    pool: &PgPool,
    operator: Uuid,
    computing_id: Uuid,
    scope: ConfScope,
    data: Value,
) -> Result<ConfOutcome> {
    if !data.is_object() {
        bail!("conf data must be a JSON object");
    }
    let computing = visible_computing(pool, operator, computing_id).await?;

    let (sys, user) = match scope {
        ConfScope::Resource => {
            if computing.owner_id.is_some_and(|owner| owner != operator) {
                bail!("computing resource {computing_id} is owned by another user");
            }
            let user = computings::get_user_conf(pool, computing_id, operator).await?;
            (Some(data), user)
        }
        ConfScope::User => {
            let sys = computings::get_sys_conf(pool, computing_id).await?;
            ResourceConf::attach(&computing, operator, None, Some(data.clone()))?;
            (sys, Some(data))
        }
    };

    let outcome = if computing.requires_sys_conf && sys.is_none() {
        ConfOutcome::Incomplete("resource-level")
    } else if computing.requires_user_conf && user.is_none() {
        ConfOutcome::Incomplete("user-level")
    } else {
        validate_conf_data(computing.kind, sys.as_ref(), user.as_ref())?;
        ConfOutcome::Complete
    };

    match scope {
        ConfScope::Resource => {
            let data = sys.as_ref().context("resource-level conf missing")?;
            computings::upsert_sys_conf(pool, computing_id, data).await?;
        }
        ConfScope::User => {
            let data = user.as_ref().context("user-level conf missing")?;
            computings::upsert_user_conf(pool, computing_id, operator, data).await?;
        }
    }
    tracing::info!(%computing_id, scope = scope.label(), ?outcome, "saved conf");
    Ok(outcome)
}

async fn visible_computing(pool: &PgPool, operator: Uuid, id: Uuid) -> Result<Computing> {
    match computings::get_computing(pool, id).await? {
        Some(c) if c.is_visible_to(operator) => Ok(c),
        _ => bail!("computing resource {id} not found"),
    }
}

/// Check a comma-separated port list.
fn parse_ports(list: &str) -> Result<Vec<u16>> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(anyhow!("invalid port {p:?} in {list:?}")),
        })
        .collect()
}
