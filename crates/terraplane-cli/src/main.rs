mod commands;

use clap::{Parser, Subcommand};
use commands::{parse_var, EXIT_BUSY, EXIT_CONFIG_ERROR, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;
use terraplane_core::{install_signal_handler, Orchestrator};
use terraplane_schema::{parse_config_file, OrchestratorConfig};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "terraplane",
    version,
    about = "Isolated, lock-guarded infrastructure provisioning"
)]
struct Cli {
    /// Path to terraplane.toml.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the configured store root.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision a workspace from a template and wait for the result.
    Provision {
        /// Workspace ID ([a-zA-Z0-9_-], at most 64 characters).
        workspace: String,
        /// Template name under the templates directory.
        #[arg(long, short = 't')]
        template: String,
        /// Template variable, repeatable.
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Destroy every resource in a workspace and wait for the result.
    Destroy {
        /// Workspace ID.
        workspace: String,
        /// Template to destroy with (defaults to the workspace's last template).
        #[arg(long, short = 't')]
        template: Option<String>,
        /// Template variable, repeatable (defaults to the last variables).
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Show the current state of a provisioning request.
    Status {
        /// Provisioning ID.
        provision_id: String,
    },
    /// List all known provisioning requests, newest first.
    List,
    /// Ask a running terraplane-server to cancel a request.
    Cancel {
        /// Provisioning ID.
        provision_id: String,
        /// Base URL of the server running the request.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig, String> {
    let mut config = match &cli.config {
        Some(path) => parse_config_file(path).map_err(|e| format!("config error: {e}"))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.store_root.clone_from(store);
    }
    debug!(
        "store root {}, templates {}",
        config.store_root.display(),
        config.templates_dir().display()
    );
    Ok(config)
}

fn open(cli: &Cli) -> Result<Orchestrator, String> {
    let config = load_config(cli)?;
    Orchestrator::from_config(&config).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TERRAPLANE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();
    let json_output = cli.json;

    let result = match &cli.command {
        Commands::Provision {
            workspace,
            template,
            vars,
        } => open(&cli).and_then(|orchestrator| {
            commands::provision::run(&orchestrator, workspace, template, vars, json_output)
        }),
        Commands::Destroy {
            workspace,
            template,
            vars,
        } => open(&cli).and_then(|orchestrator| {
            commands::destroy::run(
                &orchestrator,
                workspace,
                template.as_deref(),
                vars,
                json_output,
            )
        }),
        Commands::Status { provision_id } => open(&cli).and_then(|orchestrator| {
            commands::status::run(&orchestrator, provision_id, json_output)
        }),
        Commands::List => {
            open(&cli).and_then(|orchestrator| commands::list::run(&orchestrator, json_output))
        }
        Commands::Cancel {
            provision_id,
            server,
        } => commands::cancel::run(server, provision_id, json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") || msg.starts_with("configuration error:")
            {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("busy:") {
                EXIT_BUSY
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
