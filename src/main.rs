//! Graph World Model - command line
//!
//! Trains the model against a graph store, syncs proposed edges back, and
//! answers prediction queries. Every command prints its result as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use graph_world_model::inference::ObservationSource;
use graph_world_model::store::HttpGraphStore;
use graph_world_model::training::checkpoint;
use graph_world_model::{
    InferenceEngine, SnapshotClient, Trainer, WorldModel, WorldModelConfig,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "world-model")]
#[command(about = "Learned world model over a knowledge graph's attention edges")]
struct Cli {
    /// Path to the YAML config (default: world-model.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train against live snapshots of the graph store
    Train {
        /// Number of epochs (overrides training.epochs)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Resume from a checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Re-encode the graph, propose new edges and write them back
    Sync {
        /// Compute proposals without writing
        #[arg(long)]
        dry_run: bool,

        /// Checkpoint to load (default: <checkpoint_dir>/final.safetensors)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Answer a prediction query
    Predict {
        #[arg(long, global = true)]
        checkpoint: Option<PathBuf>,

        #[command(subcommand)]
        query: PredictQuery,
    },

    /// Roll the dynamics forward (diagnostic only)
    Simulate {
        #[arg(short, long)]
        steps: Option<usize>,

        /// Observation source: self or random
        #[arg(long)]
        source: Option<ObservationSource>,

        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PredictQuery {
    /// Entities most likely to matter next
    Next {
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Probability that two entities should be linked
    Link { source: String, target: String },
    /// Entities closest to ENTITY in the learned space
    Related {
        entity: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_similarity: Option<f32>,
    },
    /// Free-text search re-ranked by relevance to the current state
    Search {
        text: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Latent state of the current snapshot
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,graph_world_model=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = WorldModelConfig::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Train { epochs, resume } => run_train(config, epochs, resume.as_deref()).await,
        Commands::Sync {
            dry_run,
            checkpoint,
        } => {
            let mut engine = load_engine(&config, checkpoint.as_deref())?;
            print_json(&engine.full_sync(dry_run).await?)
        }
        Commands::Predict { checkpoint, query } => {
            let mut engine = load_engine(&config, checkpoint.as_deref())?;
            run_predict(&mut engine, &config, query).await
        }
        Commands::Simulate {
            steps,
            source,
            checkpoint,
        } => {
            let mut engine = load_engine(&config, checkpoint.as_deref())?;
            let steps = steps.unwrap_or(config.inference.simulation_steps);
            let source = source.unwrap_or(config.inference.observation_source);
            print_json(&engine.simulate_trajectory(steps, source).await?)
        }
    }
}

fn snapshot_client(config: &WorldModelConfig) -> Result<SnapshotClient> {
    let store = HttpGraphStore::from_config(&config.store)?;
    Ok(SnapshotClient::new(Arc::new(store), config.store.clone()))
}

async fn run_train(
    config: WorldModelConfig,
    epochs: Option<usize>,
    resume: Option<&Path>,
) -> Result<()> {
    let device = config.device.resolve()?;
    tracing::info!("Training on {:?} against {}", device, config.store.url);

    let epochs = epochs.unwrap_or(config.training.epochs);
    let client = snapshot_client(&config)?;
    let mut trainer = Trainer::new(config, client, &device)?;
    if let Some(path) = resume {
        trainer.resume(path)?;
    }

    let report = trainer.fit(epochs).await?;
    print_json(&report)
}

/// Build the model, load weights, and wrap it in an inference engine.
fn load_engine(
    config: &WorldModelConfig,
    checkpoint_path: Option<&Path>,
) -> Result<InferenceEngine> {
    let device = config.device.resolve()?;
    let model = WorldModel::new(config.model.clone(), &device)?;

    let default_path = config.training.checkpoint_dir.join("final.safetensors");
    let path = checkpoint_path.unwrap_or(&default_path);
    let meta = checkpoint::load_into(path, &model)?;
    tracing::info!(
        "Loaded checkpoint {} (epoch {}, best loss {:?})",
        path.display(),
        meta.epoch,
        meta.best_loss
    );

    Ok(InferenceEngine::new(
        Arc::new(model),
        snapshot_client(config)?,
        config.inference.clone(),
    ))
}

async fn run_predict(
    engine: &mut InferenceEngine,
    config: &WorldModelConfig,
    query: PredictQuery,
) -> Result<()> {
    let default_k = config.inference.top_k;
    match query {
        PredictQuery::Next { top_k } => {
            print_json(&engine.predict_next_entities(top_k.unwrap_or(default_k)).await?)
        }
        PredictQuery::Link { source, target } => {
            let probability = engine.predict_link_probability(&source, &target).await?;
            print_json(&serde_json::json!({
                "source": source,
                "target": target,
                "probability": probability,
            }))
        }
        PredictQuery::Related {
            entity,
            top_k,
            min_similarity,
        } => {
            let related = engine
                .find_related_entities(
                    &entity,
                    top_k.unwrap_or(default_k),
                    min_similarity.unwrap_or(config.inference.min_similarity),
                )
                .await?;
            print_json(&related)
        }
        PredictQuery::Search { text, top_k } => {
            let hits = engine
                .search_relevant_entities(&text, top_k.unwrap_or(default_k))
                .await?;
            print_json(&hits)
        }
        PredictQuery::State => {
            engine.refresh_state().await?;
            print_json(&serde_json::json!({
                "entities": engine.entity_ids().len(),
                "latent": engine.latent()?,
            }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
