use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_loop::agent::tools::{DefaultToolOptions, ToolRegistry};
use agent_loop::agent::{Engine, LoopResult};
use agent_loop::embedding::{Embedder, HashingEmbedder};
use agent_loop::models::{ModelGateway, OllamaGateway, OpenAiCompatibleGateway};
use agent_loop::preferences::{InMemoryPreferenceStore, PreferenceStore, SqlitePreferenceStore};
use agent_loop::server;
use agent_loop::settings::{AppConfig, ModelProvider, ReasoningStrategy};
use agent_loop::storage::{InMemoryStore, MemoryStore, SqliteMemoryStore};

#[derive(Debug, Parser)]
#[command(name = "agent_loop")]
#[command(about = "Tool-using reasoning agent with conversation memory", long_about = None)]
struct Cli {
    /// Keep memory in-process only instead of SQLite.
    #[arg(long, global = true)]
    ephemeral: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        #[arg(long)]
        metrics_listen: Option<String>,
    },
    /// Run one loop and print the result.
    Ask {
        #[arg(long, default_value = "cli")]
        session: String,
        /// react, chain_of_thought or tree_of_thoughts.
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<ReasoningStrategy>,
        message: String,
    },
    /// Print the registered tool specs.
    Tools,
}

fn parse_strategy(raw: &str) -> Result<ReasoningStrategy, String> {
    ReasoningStrategy::parse(raw).ok_or_else(|| format!("unknown strategy: {}", raw))
}

fn build_gateway(cfg: &AppConfig) -> Arc<dyn ModelGateway> {
    match cfg.provider {
        ModelProvider::Ollama => Arc::new(OllamaGateway::new(cfg.ollama_host.clone(), cfg.ollama_model.clone(), cfg.temperature)),
        ModelProvider::OpenAi => Arc::new(OpenAiCompatibleGateway::new(
            cfg.openai_base_url.clone(),
            cfg.openai_api_key.clone(),
            cfg.openai_model.clone(),
            cfg.temperature,
        )),
    }
}

struct Services {
    engine: Engine,
    preferences: Arc<dyn PreferenceStore>,
}

async fn build_services(cfg: &AppConfig, ephemeral: bool) -> anyhow::Result<Services> {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let (memory, preferences): (Arc<dyn MemoryStore>, Arc<dyn PreferenceStore>) = if ephemeral {
        (Arc::new(InMemoryStore::new(embedder.clone())), Arc::new(InMemoryPreferenceStore::new()))
    } else {
        let store = SqliteMemoryStore::initialize(cfg.database_url.clone(), embedder.clone()).await?;
        let prefs = SqlitePreferenceStore::new(store.pool().clone());
        (Arc::new(store), Arc::new(prefs))
    };
    let tools = ToolRegistry::with_default_tools(DefaultToolOptions { fetch_allowlist: cfg.fetch_allowlist.clone() })?;
    let mut engine = Engine::new(build_gateway(cfg), Arc::new(tools), memory, embedder);
    if let Some(prompt) = &cfg.system_prompt {
        info!("using configured system prompt");
        engine = engine.with_system_prompt(prompt.clone());
    }
    Ok(Services { engine, preferences })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::from_env();
    match cli.command {
        Commands::Serve { listen, metrics_listen } => {
            let addr: SocketAddr = listen.parse()?;
            if let Some(m) = metrics_listen {
                let maddr: SocketAddr = m.parse()?;
                metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(maddr).install()?;
                info!(addr = %maddr, "metrics exporter listening");
            }
            let services = build_services(&cfg, cli.ephemeral).await?;
            let state = server::AppState::new(Arc::new(services.engine), services.preferences, cfg.loop_defaults.clone());
            server::serve(addr, state).await?;
        }
        Commands::Ask { session, strategy, message } => {
            let services = build_services(&cfg, cli.ephemeral).await?;
            let mut config = cfg.loop_defaults.clone();
            if let Some(strategy) = strategy {
                config.strategy = strategy;
            }
            let report = services.engine.run_loop(&session, &message, &config).await;
            match report.result {
                LoopResult::Answer(answer) => println!("{}", answer),
                LoopResult::Exhausted(steps) => {
                    eprintln!("step budget exhausted after {} tool calls", report.step_count);
                    println!("{}", serde_json::to_string_pretty(&steps)?);
                }
                LoopResult::Failed(kind) => anyhow::bail!("loop failed: {}", kind),
            }
        }
        Commands::Tools => {
            let tools = ToolRegistry::with_default_tools(DefaultToolOptions { fetch_allowlist: cfg.fetch_allowlist.clone() })?;
            for spec in tools.specs() {
                println!("{}", serde_json::to_string_pretty(&spec.to_schema())?);
            }
        }
    }
    Ok(())
}
