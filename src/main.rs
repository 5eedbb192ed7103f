//! tiny-backspace CLI
//!
//! Runs the HTTP service, or a single request with events printed as NDJSON.
//! `permissions` inspects and resets remembered consent decisions.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tiny_backspace::config::{ServiceConfig, Validate};
use tiny_backspace::emitter::write_ndjson;
use tiny_backspace::orchestrator::{self, CodeRequest, OrchestratorDeps, OrchestratorState, Request};
use tiny_backspace::permissions::{
    forget, sorted_decisions, AuditLog, ConsentProvider, DecisionStore, FileDecisionStore,
    NonInteractiveConsent, TerminalConsent,
};
use tiny_backspace::{server, telemetry};

#[derive(Parser)]
#[command(name = "tiny-backspace")]
#[command(version, about = "Sandboxed coding agent that streams its work and opens a pull request")]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve,
    /// Run one request and print its events as NDJSON
    Run {
        /// GitHub repository URL
        #[arg(long)]
        repo: String,
        /// What the agent should do
        #[arg(long)]
        prompt: String,
        /// Ask on the terminal before medium and high risk operations
        #[arg(short, long)]
        interactive: bool,
    },
    /// Inspect or reset remembered permission decisions
    Permissions {
        #[command(subcommand)]
        action: PermissionsAction,
    },
}

#[derive(Subcommand)]
enum PermissionsAction {
    /// List stored decisions
    List,
    /// Forget one stored decision, or all of them
    Reset {
        /// Decision key such as `agent:bash_exec`; bare keys mean `pipeline:`
        key: Option<String>,
    },
    /// Show the most recent audit records
    Audit {
        /// Number of records to show
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "otlp")]
    let (otel, otel_guard) = match telemetry::endpoint_from_env().map(|e| telemetry::layer(&e)) {
        Some(Ok((layer, guard))) => (Some(layer), Some(guard)),
        Some(Err(e)) => {
            eprintln!("span export disabled: {}", e);
            (None, None)
        }
        None => (None, None),
    };
    #[cfg(feature = "otlp")]
    let registry = registry.with(otel);

    registry.init();
    if cfg!(not(feature = "otlp")) && telemetry::endpoint_from_env().is_some() {
        tracing::warn!(
            "{} is set but this build has no otlp feature; spans are not exported",
            telemetry::ENDPOINT_ENV
        );
    }

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };

    #[cfg(feature = "otlp")]
    drop(otel_guard);
    std::process::exit(code);
}

async fn run(cli: Cli) -> tiny_backspace::Result<i32> {
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    let interactive = matches!(cli.command, Commands::Run { interactive: true, .. });
    config.permissions.interactive |= interactive;

    for warning in config.validate().into_result()? {
        tracing::warn!("{}", warning);
    }

    match cli.command {
        Commands::Permissions { action } => permissions(&config, action).await,
        Commands::Serve => {
            let deps = service_deps(config).await?;
            server::serve(deps).await?;
            Ok(0)
        }
        Commands::Run { repo, prompt, .. } => {
            let deps = service_deps(config).await?;
            let body = CodeRequest {
                repo_url: repo,
                prompt,
            };
            let request = Request::new(&body, &deps.config.limits)?;
            let handle = orchestrator::spawn(request, deps);

            let printed = write_ndjson(handle.events, tokio::io::stdout()).await?;
            let outcome = handle.task.await.map_err(|e| {
                tiny_backspace::Error::Sandbox(format!("request task failed: {}", e))
            })?;

            tracing::info!(events = printed, state = %outcome.state, "run finished");
            Ok(if outcome.state == OrchestratorState::Completed {
                0
            } else {
                1
            })
        }
    }
}

async fn service_deps(config: ServiceConfig) -> tiny_backspace::Result<OrchestratorDeps> {
    let consent: Arc<dyn ConsentProvider> = if config.permissions.interactive {
        Arc::new(TerminalConsent::new())
    } else {
        Arc::new(NonInteractiveConsent)
    };
    OrchestratorDeps::from_config(config, consent).await
}

async fn permissions(config: &ServiceConfig, action: PermissionsAction) -> tiny_backspace::Result<i32> {
    match action {
        PermissionsAction::List => {
            let store = open_store(config).await?;
            let entries = sorted_decisions(&store);
            if entries.is_empty() {
                println!("no stored decisions");
            }
            for (key, decision) in entries {
                println!("{:<32} {:?}", key, decision);
            }
        }
        PermissionsAction::Reset { key: Some(key) } => {
            let store = open_store(config).await?;
            let (key, removed) = forget(&store, &key).await?;
            if !removed {
                println!("no stored decision for {}", key);
                return Ok(1);
            }
            println!("forgot {}", key);
        }
        PermissionsAction::Reset { key: None } => {
            let store = open_store(config).await?;
            let count = store.snapshot().len();
            store.clear().await?;
            println!("forgot {} decisions", count);
        }
        PermissionsAction::Audit { limit } => {
            let path = config.permissions.audit_path.as_deref().ok_or_else(|| {
                tiny_backspace::Error::Config("permissions.audit_path is not set".to_string())
            })?;
            let log = AuditLog::with_file(path).await?;
            for record in log.recent(limit) {
                println!("{}", record.summary());
            }
        }
    }
    Ok(0)
}

async fn open_store(config: &ServiceConfig) -> tiny_backspace::Result<FileDecisionStore> {
    let path = config.permissions.store_path.as_deref().ok_or_else(|| {
        tiny_backspace::Error::Config("permissions.store_path is not set".to_string())
    })?;
    FileDecisionStore::open(path).await
}
