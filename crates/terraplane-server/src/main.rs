use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use terraplane_core::{install_signal_handler, Orchestrator};
use terraplane_schema::{parse_config_file, OrchestratorConfig};
use tracing::{error, info, warn};

/// How long running requests get to settle after shutdown cancels them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "terraplane-server", about = "Terraplane provisioning API server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Path to terraplane.toml.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the configured store root.
    #[arg(long)]
    store: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => parse_config_file(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.store_root.clone_from(store);
    }
    Ok(config)
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli)?;
    let orchestrator = Orchestrator::from_config(&config)?;
    let server = terraplane_server::bind(&cli.listen)?;

    install_signal_handler();
    info!("starting terraplane-server on {}", cli.listen);
    info!("store root: {}", config.store_root.display());
    info!("templates: {}", config.templates_dir().display());
    terraplane_server::run_server(&orchestrator, &server)?;

    for req in orchestrator.list()?.iter().filter(|r| !r.is_terminal()) {
        let settled = orchestrator.wait(&req.provision_id, DRAIN_TIMEOUT)?;
        if !settled.is_terminal() {
            warn!("{} still {} at exit", settled.provision_id, settled.state);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
