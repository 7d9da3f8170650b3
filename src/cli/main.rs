use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::json;
use std::path::PathBuf;

use aegis_gateway::policy::{PolicyFile, PolicyStore};

#[derive(Parser)]
#[command(name = "aegis-cli")]
#[command(about = "Aegis Gateway admin CLI", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a policy document without loading it into a store
    Validate {
        #[arg(value_name = "POLICY_FILE")]
        file: PathBuf,
    },

    /// List policies in a local store
    Policies {
        #[arg(short, long, default_value = "./data/policies.json")]
        store: PathBuf,

        /// Only show active policies
        #[arg(short, long)]
        active_only: bool,
    },

    /// Export a local store to a single document
    Export {
        #[arg(short, long, default_value = "./data/policies.json")]
        store: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a policy document into a local store (replaces contents)
    Import {
        #[arg(short, long, default_value = "./data/policies.json")]
        store: PathBuf,

        #[arg(value_name = "POLICY_FILE")]
        file: PathBuf,
    },

    /// Submit a task to the agent
    Send {
        #[arg(short, long)]
        prompt: String,

        #[arg(short = 'P', long, default_value = "normal")]
        priority: String,
    },

    /// Get a task by id
    Get {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },

    /// Cancel a task
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },

    /// Show audit statistics
    Stats,

    /// Check gateway health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Validate { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let parsed: PolicyFile = serde_json::from_str(&raw)?;
            println!(
                "OK: {} policies ({} active)",
                parsed.policies.len(),
                parsed.policies.iter().filter(|p| p.is_active()).count()
            );
        }

        Commands::Policies { store, active_only } => {
            let store = PolicyStore::open(&store)?;
            let policies = if active_only {
                store.list_active()
            } else {
                store.list_all()
            };
            for policy in policies {
                println!(
                    "{:<30} v{:<8} {:<8} priority={}",
                    policy.id,
                    policy.version,
                    policy.status.to_string(),
                    policy.priority()
                );
            }
        }

        Commands::Export { store, output } => {
            let store = PolicyStore::open(&store)?;
            let document = serde_json::to_string_pretty(&store.export())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, document)?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{}", document),
            }
        }

        Commands::Import { store, file } => {
            let raw = std::fs::read_to_string(&file)?;
            let parsed: PolicyFile = serde_json::from_str(&raw)?;
            let store = PolicyStore::open(&store)?;
            let count = store.import(parsed)?;
            println!("Imported {} policies", count);
        }

        Commands::Send { prompt, priority } => {
            let response = client
                .post(format!("{}/rpc", cli.endpoint))
                .json(&json!({
                    "jsonrpc": "2.0",
                    "method": "tasks/send",
                    "params": { "prompt": prompt, "priority": priority },
                    "id": 1,
                }))
                .send()
                .await?;
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Get { id } => {
            let response = client
                .post(format!("{}/rpc", cli.endpoint))
                .json(&json!({
                    "jsonrpc": "2.0",
                    "method": "tasks/get",
                    "params": { "taskId": id },
                    "id": 1,
                }))
                .send()
                .await?;
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Cancel { id } => {
            let response = client
                .post(format!("{}/rpc", cli.endpoint))
                .json(&json!({
                    "jsonrpc": "2.0",
                    "method": "tasks/cancel",
                    "params": { "taskId": id },
                    "id": 1,
                }))
                .send()
                .await?;
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Stats => {
            let response = client
                .get(format!("{}/audit/statistics", cli.endpoint))
                .send()
                .await?;
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Health => {
            let response = client
                .get(format!("{}/health", cli.endpoint))
                .send()
                .await?;
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
