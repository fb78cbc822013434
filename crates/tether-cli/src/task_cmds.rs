//! Operator-mode CLI handlers for `tether task` subcommands.

use anyhow::{Context, Result, anyhow};
use uuid::Uuid;

use tether_core::error::TetherError;
use tether_core::service::{CreateTask, TaskService};
use tether_db::models::{ComputingOptions, Task};

use crate::TaskCommands;

// -----------------------------------------------------------------------
// Public entry point
// -----------------------------------------------------------------------

pub async fn run_task_command(
    command: TaskCommands,
    service: &TaskService,
    operator: Uuid,
) -> Result<()> {
    match command {
        TaskCommands::Create {
            name,
            container,
            computing,
            port,
            auth_user,
            auth_pass,
            binds,
            partition,
            cpus,
            memory,
            start,
        } => {
            let req = CreateTask {
                name,
                container_id: parse_id("container", &container)?,
                computing_id: parse_id("computing resource", &computing)?,
                port,
                auth_user,
                auth_pass,
                extra_binds: binds,
                options: ComputingOptions {
                    partition,
                    cpus,
                    memory,
                },
            };
            let task = if start {
                service.launch_task(operator, req).await
            } else {
                service.create_task(operator, req).await
            }
            .map_err(report)?;
            print_task(&task);
            Ok(())
        }
        TaskCommands::Start { task_id } => {
            let id = parse_id("task", &task_id)?;
            let task = service.start_task(operator, id).await.map_err(report)?;
            print_task(&task);
            Ok(())
        }
        TaskCommands::Stop { task_id } => {
            let id = parse_id("task", &task_id)?;
            let task = service.stop_task(operator, id).await.map_err(report)?;
            println!("Task {} {}.", task.id, task.status);
            Ok(())
        }
        TaskCommands::Log { task_id } => {
            let id = parse_id("task", &task_id)?;
            let log = service.fetch_log(operator, id).await.map_err(report)?;
            println!("{log}");
            Ok(())
        }
        TaskCommands::Delete { task_id } => {
            let id = parse_id("task", &task_id)?;
            service.delete_task(operator, id).await.map_err(report)?;
            println!("Task {id} deleted.");
            Ok(())
        }
        TaskCommands::Connect { task_id } => {
            let id = parse_id("task", &task_id)?;
            let endpoint = service.connect(operator, id).await.map_err(report)?;
            println!("Task {id} reachable at {endpoint}");
            Ok(())
        }
        TaskCommands::Status { task_id } => {
            let id = parse_id("task", &task_id)?;
            let task = service.update_status(operator, id).await.map_err(report)?;
            print_task(&task);
            Ok(())
        }
        TaskCommands::List => {
            let tasks = service.list_tasks(operator).await.map_err(report)?;
            print_task_table(&tasks);
            Ok(())
        }
    }
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

fn parse_id(what: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid {what} ID: {raw}"))
}

/// Execution and store failures are logged in full and reported
/// generically; everything else is shown as is.
fn report(err: TetherError) -> anyhow::Error {
    if err.is_user_facing() {
        return anyhow!(err);
    }
    tracing::error!(error = %err, "task operation failed");
    match err {
        TetherError::TimedOut { command, after } => anyhow!(
            "backend command `{command}` did not finish within {}s",
            after.as_secs()
        ),
        _ => anyhow!("task operation failed; see the log above for details"),
    }
}

fn print_task(task: &Task) {
    println!("Task:");
    println!("  ID:        {}", task.id);
    println!("  Name:      {}", task.name);
    println!("  Status:    {}", task.status);
    println!("  Container: {}", task.container_id);
    println!("  Computing: {}", task.computing_id);
    if let Some(tid) = &task.tid {
        println!("  Handle:    {tid}");
    }
    if let Some(pid) = task.pid {
        println!("  Pid/job:   {pid}");
    }
    match (&task.ip, task.port) {
        (Some(ip), Some(port)) => println!("  Address:   {ip}:{port}"),
        (None, Some(port)) => println!("  Port:      {port}"),
        _ => {}
    }
    if let Some(tunnel_port) = task.tunnel_port {
        println!("  Tunnel:    {tunnel_port}");
    }
}

fn print_task_table(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found. Use `tether task create` to create one.");
        return;
    }

    let name_w = tasks.iter().map(|t| t.name.len()).max().unwrap_or(4).max(4);
    let status_w = tasks
        .iter()
        .map(|t| t.status.to_string().len())
        .max()
        .unwrap_or(6)
        .max(6);

    println!("{:<36}  {:<name_w$}  {:<status_w$}  {:<21}  TUNNEL", "ID", "NAME", "STATUS", "ADDRESS");
    for t in tasks {
        let address = match (&t.ip, t.port) {
            (Some(ip), Some(port)) => format!("{ip}:{port}"),
            _ => "-".to_owned(),
        };
        let tunnel = t
            .tunnel_port
            .map_or_else(|| "-".to_owned(), |p| p.to_string());
        println!(
            "{:<36}  {:<name_w$}  {:<status_w$}  {:<21}  {}",
            t.id,
            t.name,
            t.status.to_string(),
            address,
            tunnel,
        );
    }
}
