//! Thin CLI driver over [`flowforge_orchestrator::WorkflowEngine`]'s
//! programmatic surface (spec.md §6). The HTTP/WS control plane and
//! dashboard UI are a separate, out-of-scope concern; this binary exists so
//! the engine can be exercised and scripted without one.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flowforge_bus::RedisMessageBus;
use flowforge_core::bus::MessageBus;
use flowforge_core::kv::KvStore;
use flowforge_kv::RedisKvStore;
use flowforge_orchestrator::{Config, WorkflowEngine};
use flowforge_schemas::agent_envelope::Priority;
use uuid::Uuid;

/// Process-level exit code categories (spec.md §6).
mod exit {
    use std::process::ExitCode;
    pub const SUCCESS: ExitCode = ExitCode::SUCCESS;
    pub const CONFIG_ERROR: ExitCode = ExitCode::from(1);
    pub const DEPENDENCY_UNAVAILABLE: ExitCode = ExitCode::from(2);
    pub const VALIDATION_FAILURE: ExitCode = ExitCode::from(3);
}

#[derive(Parser)]
#[command(name = "flowforge", about = "Drive the flowforge workflow engine from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a workflow and dispatch its first stage.
    Create {
        workflow_type: String,
        #[arg(long)]
        platform_id: Option<String>,
        #[arg(long, value_enum, default_value = "medium")]
        priority: CliPriority,
    },
    /// Print a workflow's current snapshot as JSON.
    Get { workflow_id: Uuid },
    Cancel { workflow_id: Uuid },
    Pause { workflow_id: Uuid },
    Resume { workflow_id: Uuid },
    Retry { workflow_id: Uuid },
}

#[derive(Clone, clap::ValueEnum)]
enum CliPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl From<CliPriority> for Priority {
    fn from(p: CliPriority) -> Self {
        match p {
            CliPriority::Critical => Priority::Critical,
            CliPriority::High => Priority::High,
            CliPriority::Medium => Priority::Medium,
            CliPriority::Low => Priority::Low,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "flowforge_cli=info".to_string()))
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return exit::CONFIG_ERROR;
        }
    };

    let bus: Arc<dyn MessageBus> = match RedisMessageBus::connect(&config.message_bus_url).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            eprintln!("message bus unavailable: {e}");
            return exit::DEPENDENCY_UNAVAILABLE;
        }
    };
    let kv: Arc<dyn KvStore> = match RedisKvStore::connect(&config.kv_url).await {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            eprintln!("KV store unavailable: {e}");
            return exit::DEPENDENCY_UNAVAILABLE;
        }
    };

    let engine = WorkflowEngine::new(config.instance_id.clone(), bus, kv);

    match run(&engine, cli.command).await {
        Ok(()) => exit::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            exit::VALIDATION_FAILURE
        }
    }
}

async fn run(engine: &WorkflowEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create {
            workflow_type,
            platform_id,
            priority,
        } => {
            let id = engine.create_workflow(&workflow_type, platform_id, priority.into()).await?;
            println!("{id}");
        }
        Command::Get { workflow_id } => {
            let workflow = engine.get_workflow(workflow_id).await?;
            println!("{}", serde_json::to_string_pretty(&workflow)?);
        }
        Command::Cancel { workflow_id } => {
            engine.cancel_workflow(workflow_id).await?;
        }
        Command::Pause { workflow_id } => {
            engine.pause_workflow(workflow_id).await?;
        }
        Command::Resume { workflow_id } => {
            engine.resume_workflow(workflow_id).await?;
        }
        Command::Retry { workflow_id } => {
            engine.retry_workflow(workflow_id).await?;
        }
    }
    Ok(())
}
