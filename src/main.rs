use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use traineasy_local::{
    AccessPrompt, LinearEngine, Manager, StorageStrategy, StoreConfig, StoreError, TrainingConfig,
};

#[derive(Parser)]
#[command(author, version, about = "Local projects, datasets and training runs", long_about = None)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(short, long, env = "TRAINEASY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List projects
    Projects,
    /// Create a project
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Show a project with its dataset, sessions and models
    Show { project: String },
    /// Upload a CSV or JSON dataset to a project
    Upload { project: String, path: PathBuf },
    /// Train a model on the project's dataset
    Train {
        project: String,
        #[arg(short, long)]
        target: String,
        #[arg(short, long)]
        epochs: Option<u32>,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Predict one row: `predict <model> col=value ...`
    Predict { model: String, values: Vec<String> },
    /// Show store counts and storage strategy
    Status,
    /// Ask for the persistent dataset area
    GrantStorage,
}

/// Asks on the terminal before using the persistent area
struct ConsolePrompt;

impl AccessPrompt for ConsolePrompt {
    fn confirm(&self, area: &Path) -> bool {
        print!("Allow storing datasets in {}? [y/N] ", area.display());
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref() {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn parse_row(values: &[String]) -> Result<HashMap<String, String>, StoreError> {
    values
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| StoreError::Config(format!("expected column=value, got {:?}", pair)))
        })
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::load(cli.config.as_deref())?;
    let default_epochs = config.default_epochs;
    let manager = Manager::init(config, Arc::new(LinearEngine::new()), Arc::new(ConsolePrompt)).await?;

    match cli.command {
        Command::Projects => {
            let projects = manager.get_projects().await?;
            if projects.is_empty() {
                println!("No projects yet.");
            }
            for p in projects {
                println!(
                    "{}  {:<24} {:<9} {:<14} {:>3}%",
                    p.id,
                    p.name,
                    p.status.as_str(),
                    p.stage,
                    p.progress
                );
            }
        }
        Command::Create { name, description } => {
            let project = manager.create_project(&name, description).await?;
            println!("✅ Created project {} ({})", project.name, project.id);
        }
        Command::Show { project } => {
            let p = manager
                .get_project(&project)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    collection: "projects",
                    id: project.clone(),
                })?;
            println!("{}", serde_json::to_string_pretty(&p)?);

            for file in manager.get_project_files(&project).await? {
                let rows = file.analysis.as_ref().map(|a| a.row_count).unwrap_or(0);
                println!("📄 {} ({} bytes, {} rows, {:?})", file.name, file.size, rows, file.location);
            }
            for s in manager.get_project_sessions(&project).await? {
                println!(
                    "🏋️  {} {:<9} {:>3}% {}",
                    s.id,
                    s.status.as_str(),
                    s.progress,
                    s.error.as_deref().unwrap_or("")
                );
            }
            for m in manager.get_project_models(&project).await? {
                println!(
                    "🧠 {} {} ({}) accuracy={:.3}",
                    m.id,
                    m.name,
                    m.model_type.as_str(),
                    m.metrics.accuracy
                );
            }
        }
        Command::Upload { project, path } => {
            let bytes = tokio::fs::read(&path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "dataset".to_string());
            let record = manager
                .save_dataset(&project, &bytes, &file_name, mime_for(&path))
                .await?;

            println!("✅ Uploaded {} ({:?})", record.name, record.location);
            if let Some(analysis) = &record.analysis {
                println!("   {} rows", analysis.row_count);
                for c in &analysis.columns {
                    println!(
                        "   {:<20} {:?} unique={} nulls={} e.g. {}",
                        c.name,
                        c.column_type,
                        c.unique_count,
                        c.null_count,
                        c.sample_values.join(", ")
                    );
                }
            }
        }
        Command::Train {
            project,
            target,
            epochs,
            learning_rate,
            name,
        } => {
            let mut config = TrainingConfig::new(target);
            config.epochs = epochs.unwrap_or(default_epochs);
            if let Some(lr) = learning_rate {
                config.learning_rate = lr;
            }
            config.model_name = name;

            let every = (config.epochs / 10).max(1);
            let session = manager
                .start_training(&project, config, move |e| {
                    if e.epoch % every == 0 || e.epoch == e.total_epochs {
                        println!(
                            "⏳ Epoch {}/{} loss={:.4} accuracy={:.3}",
                            e.epoch, e.total_epochs, e.loss, e.accuracy
                        );
                    }
                })
                .await?;
            println!(
                "✅ Session {} completed, model {}",
                session.id,
                session.model_id.unwrap_or_default()
            );
        }
        Command::Predict { model, values } => {
            let row = parse_row(&values)?;
            let prediction = manager.predict(&model, &row).await?;
            match (prediction.label, prediction.confidence) {
                (Some(label), Some(confidence)) => println!("{} ({:.1}%)", label, confidence * 100.0),
                _ => println!("{}", prediction.value),
            }
        }
        Command::Status => {
            let status = manager.storage_status().await?;
            println!("Projects:        {}", status.projects);
            println!("Models:          {}", status.models);
            println!("Active sessions: {}", status.active_sessions);
            println!("Strategy:        {:?}", status.strategy);
            if status.strategy == StorageStrategy::PersistentArea {
                println!("Durable usage:   {} bytes", status.durable_usage_bytes);
            } else if status.durable_supported {
                println!("Run `traineasy grant-storage` to keep datasets on disk.");
            }
        }
        Command::GrantStorage => {
            if manager.request_storage_access().await? {
                println!("✅ Persistent dataset area granted");
            } else {
                println!("Persistent dataset area not granted; small datasets stay inline.");
            }
        }
    }

    manager.close();
    Ok(())
}
