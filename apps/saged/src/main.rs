mod demo;
mod terminal;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use sage_kernel::{Assistant, SageConfig};
use sage_knowledge::FileFactStore;
use sage_memory::FileSessionStore;
use sage_personality::FileProfileStore;
use sage_runtime::ExchangePolicy;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::demo::DemoBackend;
use crate::terminal::{StdinInput, StdoutOutput};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Concurrent,
    Queue,
    Reject,
}

impl From<PolicyArg> for ExchangePolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Concurrent => Self::Concurrent,
            PolicyArg::Queue => Self::Queue,
            PolicyArg::Reject => Self::Reject,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "saged")]
#[command(about = "Sage assistant daemon")]
struct Cli {
    /// JSON config file; missing sections keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Persist sessions, facts and the personality profile here.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
    /// Used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,
    #[arg(long)]
    max_tool_iterations: Option<usize>,
    #[arg(long)]
    no_shell: bool,
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn load_config(cli: &Cli) -> Result<SageConfig> {
    let mut config = match &cli.config {
        Some(path) => SageConfig::from_json_file(path).await?,
        None => SageConfig::default(),
    };
    if let Some(policy) = cli.policy {
        config.orchestrator.exchange_policy = policy.into();
    }
    if let Some(max) = cli.max_tool_iterations {
        config.orchestrator.max_tool_iterations = max;
    }
    if cli.no_shell {
        config.tools.enable_shell = false;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = load_config(&cli).await?;
    let quit = Arc::new(Notify::new());

    let mut builder = Assistant::builder(config)
        .backend(Arc::new(DemoBackend::new()))
        .input(Arc::new(StdinInput::new(quit.clone())))
        .output(Arc::new(StdoutOutput::new()));
    if let Some(dir) = &cli.data_dir {
        builder = builder
            .session_store(Arc::new(FileSessionStore::new(dir.join("sessions"))))
            .fact_store(Arc::new(FileFactStore::open(dir.join("facts.json")).await?))
            .profile_store(Arc::new(FileProfileStore::new(dir.join("profile.json"))));
        info!(data_dir = %dir.display(), "using file stores");
    }

    let assistant = builder.build()?;
    assistant.awake().await?;
    info!(tools = ?assistant.tools().list(), "sage is listening; type /quit to leave");

    tokio::select! {
        _ = quit.notified() => info!("input closed"),
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!(%error, "failed to listen for ctrl-c");
            }
            info!("interrupted");
        }
    }

    assistant.sleep().await?;
    Ok(())
}
