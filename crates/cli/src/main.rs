//! `flowdeck` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`  — run pending database migrations.
//! - `validate` — validate a workflow definition JSON file and print the
//!   DAG level ordering.

use clap::{Parser, Subcommand};
use tracing::info;

use engine::{build_dag, WorkflowDefinition};

#[derive(Parser)]
#[command(
    name = "flowdeck",
    about = "Workflow orchestration core for browser automation and data integration",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow definition JSON file.
        path: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .unwrap_or_else(|e| panic!("failed to connect to database: {e}"));
            db::pool::run_migrations(&pool)
                .await
                .unwrap_or_else(|e| panic!("migration failed: {e}"));
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("cannot read file {}: {e}", path.display()));

            let definition: WorkflowDefinition = serde_json::from_str(&content)
                .unwrap_or_else(|e| panic!("invalid JSON: {e}"));

            match build_dag(&definition.tasks) {
                Ok(nodes) => {
                    println!("Workflow is valid ({} tasks).", nodes.len());
                    let max_level = nodes.iter().map(|n| n.level).max().unwrap_or(0);
                    for level in 0..=max_level {
                        let names: Vec<&str> = nodes
                            .iter()
                            .filter(|n| n.level == level)
                            .map(|n| n.name())
                            .collect();
                        println!("  level {level}: {}", names.join(", "));
                    }
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
