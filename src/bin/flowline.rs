use clap::{Parser, Subcommand};
use flowline::compiler::{load_definition_from_yaml, Compiler};
use flowline::config::EngineConfig;
use flowline::runtime::engine::Engine;
use flowline::runtime::redis_storage::{RedisDefinitionStore, RedisExecutionStore};
use flowline::runtime::storage::ExecutionStore;
use flowline::services::http::HttpPluginRuntime;
use flowline::services::transform::BuiltinTransform;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition and print the finished execution as JSON
    Run {
        /// Path to the workflow definition (YAML or JSON)
        #[arg(long, short)]
        file: PathBuf,

        /// Input fields (key=value, value parsed as JSON when possible)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,

        /// Engine configuration file (YAML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Keep definitions and executions in Redis instead of memory
        #[arg(long)]
        redis: Option<String>,

        /// Base URL of the HTTP plugin runtime
        #[arg(long)]
        plugin_endpoint: Option<String>,
    },

    /// Check a definition without running it
    Validate {
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Print a stored execution from Redis
    Inspect {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Execution id
        id: Uuid,

        /// Only show records of this node
        #[arg(long)]
        node: Option<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn build_engine(config: EngineConfig, redis: Option<String>, plugin_endpoint: Option<String>) -> Result<Engine> {
    let mut builder = Engine::builder()
        .config(config)
        .data_transform(Arc::new(BuiltinTransform::new()));

    if let Some(url) = redis {
        info!("Using Redis store: {}", url);
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        builder = builder
            .definition_store(Arc::new(RedisDefinitionStore::new(client.clone())))
            .execution_store(Arc::new(RedisExecutionStore::new(client)));
    }
    if let Some(endpoint) = plugin_endpoint {
        builder = builder.plugin_runtime(Arc::new(HttpPluginRuntime::new(endpoint)));
    }
    Ok(builder.build())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, vars, config, redis, plugin_endpoint } => {
            let config = match config {
                Some(path) => EngineConfig::from_yaml_file(path)?,
                None => EngineConfig::default(),
            };
            let engine = Arc::new(build_engine(config, redis, plugin_endpoint)?);

            let definition = load_definition_from_yaml(&file)?;
            let definition_id = definition.id.clone();
            engine.register_definition(definition).await?;

            let input: Map<String, Value> = vars.into_iter().collect();
            let execution_id = engine.start_execution(&definition_id, Value::Object(input)).await?;
            info!("Execution started: {}", execution_id);

            let waiting = engine.wait_for(execution_id);
            tokio::pin!(waiting);
            let execution = tokio::select! {
                finished = &mut waiting => finished?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, cancelling {}", execution_id);
                    engine.cancel_execution(execution_id);
                    waiting.await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&execution)?);
        }

        Commands::Validate { file } => {
            let definition = load_definition_from_yaml(&file)?;
            let id = definition.id.clone();
            Compiler::new()
                .compile(definition)
                .map_err(|e| anyhow!("{} is invalid: {}", file.display(), e))?;
            println!("{} ok", id);
        }

        Commands::Inspect { redis, id, node } => {
            let client = redis::Client::open(redis).context("Invalid Redis URL")?;
            let store = RedisExecutionStore::new(client);
            let output = match node {
                Some(key) => serde_json::to_string_pretty(&store.load_records(id, Some(&key)).await?)?,
                None => {
                    let execution = store.load_execution(id).await?
                        .ok_or_else(|| anyhow!("execution {} not found", id))?;
                    serde_json::to_string_pretty(&execution)?
                }
            };
            println!("{}", output);
        }
    }

    Ok(())
}
