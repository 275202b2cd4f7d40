//! `bosun task` -- inspect and steer the internal task store.

use std::path::Path;

use anyhow::{Context, Result};
use uuid::Uuid;

use bosun_core::taskstore::TaskStore;
use bosun_db::config::DbConfig;
use bosun_db::pool;

use crate::TaskCommands;

async fn open_store(config_dir: &Path) -> Result<TaskStore> {
    let db_config = DbConfig::in_config_dir(config_dir);
    let pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&pool, pool::default_migrations_path()).await?;
    Ok(TaskStore::new(
        pool,
        format!("bosun-cli-{}", std::process::id()),
    ))
}

fn parse_task_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("{raw:?} is not a task id"))
}

pub async fn run(config_dir: &Path, command: TaskCommands) -> Result<()> {
    let store = open_store(config_dir).await?;

    match command {
        TaskCommands::List { all } => {
            let tasks = store.list_tasks(all).await?;
            if tasks.is_empty() {
                println!("no tasks");
                return Ok(());
            }
            for task in tasks {
                let archived = if task.archived { " [archived]" } else { "" };
                println!("{}  {:<12} {}{archived}", task.id, task.status.to_string(), task.title);
            }
        }
        TaskCommands::Show { task_id } => {
            let id = parse_task_id(&task_id)?;
            let task = store.get_task(id).await?;
            println!("id:       {}", task.id);
            println!("title:    {}", task.title);
            if let Some(scope) = &task.scope {
                println!("scope:    {scope}");
            }
            println!("status:   {}", task.status);
            println!("labels:   {}", task.labels.0.join(", "));
            println!("retries:  {}", task.retry_count);
            if let Some(owner) = &task.owner_id {
                println!("owner:    {owner}");
            }
            if let Some(reason) = &task.ignore_reason {
                println!("ignored:  {reason}");
            }
            if let Some(attempt) = store.latest_attempt(id).await? {
                println!("latest attempt:");
                println!("  token:    {}", attempt.id);
                println!("  profile:  {}", attempt.executor_profile);
                println!("  outcome:  {}", attempt.outcome);
                if let Some(branch) = &attempt.branch_name {
                    println!("  branch:   {branch}");
                }
                if let Some(kind) = &attempt.failure_kind {
                    println!("  failure:  {kind}");
                }
            }
        }
        TaskCommands::Events { task_id } => {
            let id = parse_task_id(&task_id)?;
            // Ensure the task exists before printing an empty log.
            store.get_task(id).await?;
            for event in store.events_for_task(id).await? {
                println!(
                    "{:>4}  {}  {}  {}",
                    event.seq,
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    event.kind,
                    event.payload.0,
                );
            }
        }
        TaskCommands::Retry { task_id } => {
            let id = parse_task_id(&task_id)?;
            store.retry_task(id).await?;
            println!("task {id} is dispatchable again");
        }
        TaskCommands::Cancel { task_id } => {
            let id = parse_task_id(&task_id)?;
            store.cancel_task(id).await?;
            println!("task {id} cancelled");
        }
    }
    Ok(())
}
