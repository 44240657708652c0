//! Media collection backup tool
//!
//! CLI over backup creation, restore, listing and the automatic scheduler.

// collection-backup/src/main.rs
use anyhow::{Context, Result};
use collection_backup::backup::{BackupOptions, BackupOrchestrator};
use collection_backup::config::AppConfig;
use collection_backup::context::Services;
use collection_backup::database::{check_db_connection, lazy_pool};
use collection_backup::restore::RestoreEngine;
use collection_backup::scheduler::Scheduler;
use collection_backup::store::{BackupSortField, BackupType, ListQuery};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    match run_app().await {
        Ok(true) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("❌ Operation failed.");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `Ok(false)` when the operation ran but reported failure.
async fn run_app() -> Result<bool> {
    dotenv::dotenv().ok();

    let config_path = env::var("COLLECTION_BACKUP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;
    let services = Services::from_config(&config).context("Failed to set up services")?;
    let orchestrator = BackupOrchestrator::new(services.clone(), BackupOptions::from(&config));

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            let result = orchestrator.create_backup(BackupType::Manual).await;
            print_json(&result)?;
            Ok(result.success)
        }
        "2" | "restore" => {
            let backup_id = match args.get(2) {
                Some(id) => id.trim().to_string(),
                None => prompt("Backup id to restore: ")?,
            };
            anyhow::ensure!(!backup_id.is_empty(), "A backup id is required to restore");
            let pool = lazy_pool(&config.database_url).context("Invalid database URL")?;
            anyhow::ensure!(
                check_db_connection(&pool).await,
                "Database is not reachable; nothing was changed"
            );
            println!("🔄 Starting Restore Process for {backup_id}...");

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupt received; the restore stops if it has not reset the schema yet.");
                    on_interrupt.cancel();
                }
            });

            let result = RestoreEngine::new(services).restore(&backup_id, &cancel).await;
            print_json(&result)?;
            Ok(result.success)
        }
        "3" | "list" => {
            let query = list_query(&args[2.min(args.len())..])?;
            let page = services
                .store
                .list(&query)
                .await
                .context("Failed to list backups")?;
            print_json(&page)?;
            Ok(true)
        }
        "4" | "test-cloud" => {
            let settings = services
                .settings
                .load()
                .await
                .context("Failed to read backup settings")?;
            let Some(cloud) = settings.cloud_settings() else {
                println!("☁️ Cloud storage is disabled in backup_settings.");
                return Ok(true);
            };
            let outcome = services.cloud.test_connection(&cloud).await;
            print_json(&outcome)?;
            Ok(outcome.success)
        }
        "5" | "schedule" => {
            let scheduler = Scheduler::new(orchestrator, config.scheduler);
            scheduler.start();
            println!("⏰ Scheduler running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            println!("Waiting for a running backup to finish...");
            scheduler.shutdown().await;
            print_json(&scheduler.get_logs())?;
            Ok(true)
        }
        _ => {
            println!(
                "❌ Invalid choice. Please enter 'backup', 'restore <id>', 'list', 'test-cloud' or 'schedule'."
            );
            anyhow::bail!("Invalid operation choice");
        }
    }
}

/// `list [sortField] [asc|desc] [page] [perPage]`
fn list_query(args: &[String]) -> Result<ListQuery> {
    let mut query = ListQuery::default();
    if let Some(field) = args.first() {
        query.sort_by = serde_json::from_value::<BackupSortField>(serde_json::Value::String(
            field.clone(),
        ))
        .with_context(|| format!("Unknown sort field '{field}'"))?;
    }
    if let Some(direction) = args.get(1) {
        query.descending = match direction.as_str() {
            "asc" => false,
            "desc" => true,
            other => anyhow::bail!("Sort direction must be 'asc' or 'desc', got '{other}'"),
        };
    }
    if let Some(page) = args.get(2) {
        query.page = page.parse().context("Page must be a positive number")?;
    }
    if let Some(per_page) = args.get(3) {
        query.per_page = per_page.parse().context("Page size must be a positive number")?;
    }
    Ok(query)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{json}");
    Ok(())
}

fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. List Backups (or type 'list')");
    println!("4. Test Cloud Connection (or type 'test-cloud')");
    println!("5. Run Scheduler (or type 'schedule')");
    prompt("Enter your choice: ")
}

fn prompt(label: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{label}");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
