mod config;
mod resource_cmds;
mod serve_cmd;
mod task_cmds;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use tether_core::service::TaskService;
use tether_core::shell::SystemShell;
use tether_db::pool;

use config::TetherConfig;

#[derive(Parser)]
#[command(name = "tether", about = "Run containers on local, ssh, double-hop and slurm backends")]
struct Cli {
    /// Database URL (overrides TETHER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a tether config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/tether")]
        db_url: String,
        /// Address remote workloads use to reach `tether serve`
        #[arg(long)]
        callback_url: Option<String>,
        /// Generate a secret so agent callbacks must carry a per-task token
        #[arg(long)]
        signed_callbacks: bool,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the tether database (requires config file or env vars)
    DbInit,
    /// Serve the agent callback endpoint
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Container specs
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },
    /// Computing resources and their conf payloads
    Computing {
        #[command(subcommand)]
        command: ComputingCommands,
    },
    /// Key pairs used to reach remote backends
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Task lifecycle
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
pub enum ContainerCommands {
    /// Register a container spec
    Add {
        /// Display name
        name: String,
        /// Image reference without registry (e.g. jupyter/base-notebook)
        #[arg(long)]
        image: String,
        /// Runtime the image is packaged for: docker or singularity
        #[arg(long, default_value = "docker")]
        runtime: String,
        /// docker_hub or docker_local
        #[arg(long, default_value = "docker_hub")]
        registry: String,
        /// Comma-separated ports; the first is the default
        #[arg(long)]
        ports: Option<String>,
        /// The image can listen on a port chosen at start time
        #[arg(long)]
        dynamic_ports: bool,
        /// The image reads AUTH_USER
        #[arg(long)]
        user_auth: bool,
        /// The image reads AUTH_PASS
        #[arg(long)]
        pass_auth: bool,
        /// Visible to the operator only
        #[arg(long)]
        private: bool,
    },
    /// List container specs visible to the operator
    List,
}

#[derive(Subcommand)]
pub enum ComputingCommands {
    /// Register a computing resource
    Add {
        /// Display name
        name: String,
        /// local, remote, slurm or remotehop
        #[arg(long)]
        kind: String,
        /// Do not require a resource-level conf payload
        #[arg(long)]
        no_sys_conf: bool,
        /// Require a per-user conf payload
        #[arg(long)]
        user_conf: bool,
        /// Require the task owner to have a default key pair
        #[arg(long)]
        user_keys: bool,
        /// The resource can run docker images
        #[arg(long)]
        docker: bool,
        /// The resource can run singularity images
        #[arg(long)]
        singularity: bool,
        /// Visible to the operator only
        #[arg(long)]
        private: bool,
    },
    /// List computing resources visible to the operator
    List,
    /// Save a conf payload (JSON object) for a computing resource
    Conf {
        /// Computing resource ID
        computing_id: String,
        /// JSON object, e.g. '{"host": "hpc.example.org", "user": "alice"}'
        data: String,
        /// Save the resource-level payload instead of the operator's own
        #[arg(long)]
        sys: bool,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Register a key pair for the operator
    Add {
        /// Path to the private key on this host
        #[arg(long)]
        private_key: String,
        /// Path to the public key on this host
        #[arg(long)]
        public_key: String,
        /// Make it the operator's default key pair
        #[arg(long)]
        default: bool,
    },
    /// List the operator's key pairs
    List,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task (and optionally start it)
    Create {
        /// Task name
        name: String,
        /// Container spec ID
        #[arg(long)]
        container: String,
        /// Computing resource ID
        #[arg(long)]
        computing: String,
        /// Port, for containers supporting dynamic ports
        #[arg(long)]
        port: Option<i32>,
        /// Username passed to the container as AUTH_USER
        #[arg(long)]
        auth_user: Option<String>,
        /// Password passed to the container as AUTH_PASS
        #[arg(long)]
        auth_pass: Option<String>,
        /// Extra comma-separated singularity binds
        #[arg(long)]
        binds: Option<String>,
        /// Slurm partition
        #[arg(long)]
        partition: Option<String>,
        /// Slurm CPUs per task
        #[arg(long)]
        cpus: Option<u32>,
        /// Slurm memory (e.g. 4G)
        #[arg(long)]
        memory: Option<String>,
        /// Start the task right away; the record is removed if start fails
        #[arg(long)]
        start: bool,
    },
    /// Start a created task
    Start { task_id: String },
    /// Stop a task
    Stop { task_id: String },
    /// Print a task's log
    Log { task_id: String },
    /// Delete a task, stopping it first if needed
    Delete { task_id: String },
    /// Open (or reuse) a tunnel to a running task
    Connect { task_id: String },
    /// Refresh and show a task's status
    Status { task_id: String },
    /// List the operator's tasks
    List,
}

/// Execute the `tether init` command: write config file.
fn cmd_init(
    db_url: &str,
    callback_url: Option<String>,
    signed_callbacks: bool,
    force: bool,
) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    cfg.database.url = db_url.to_owned();
    if let Some(url) = callback_url {
        cfg.agent.callback_url = url;
    }
    if signed_callbacks {
        cfg.agent.secret = Some(config::generate_agent_secret());
    }

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  agent.callback_url = {}", cfg.agent.callback_url);
    if let Some(secret) = &cfg.agent.secret {
        println!("  agent.secret = {}...{}", &secret[..8], &secret[56..]);
    }
    println!();
    println!("Set operator.user in the config file (or TETHER_USER) before running task commands.");
    println!("Next: run `tether db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `tether db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TetherConfig::resolve(cli_db_url)?;

    println!("Initializing tether database...");

    if pool::ensure_database_exists(&resolved.db_config).await? {
        println!("Created database.");
    }
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("tether db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            callback_url,
            signed_callbacks,
            force,
        } => {
            cmd_init(&db_url, callback_url, signed_callbacks, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = TetherConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                serve_cmd::run_serve(db_pool.clone(), resolved.settings, &bind, port).await;
            db_pool.close().await;
            result?;
        }
        Commands::Container { command } => {
            let resolved = TetherConfig::resolve(cli.database_url.as_deref())?;
            let operator = resolved.operator()?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = resource_cmds::run_container_command(command, &db_pool, operator).await;
            db_pool.close().await;
            result?;
        }
        Commands::Computing { command } => {
            let resolved = TetherConfig::resolve(cli.database_url.as_deref())?;
            let operator = resolved.operator()?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = resource_cmds::run_computing_command(command, &db_pool, operator).await;
            db_pool.close().await;
            result?;
        }
        Commands::Keys { command } => {
            let resolved = TetherConfig::resolve(cli.database_url.as_deref())?;
            let operator = resolved.operator()?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = resource_cmds::run_key_command(command, &db_pool, operator).await;
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = TetherConfig::resolve(cli.database_url.as_deref())?;
            let operator = resolved.operator()?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let service = TaskService::new(
                Arc::new(db_pool.clone()),
                Arc::new(SystemShell::new(resolved.exec_timeout)),
                resolved.settings,
            );
            let result = task_cmds::run_task_command(command, &service, operator).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that touch process-wide environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
