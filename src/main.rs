//! modgate - Dynamic Method Invocation Gateway
//!
//! CLI entry point for serving the gateway and running one-shot invocations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modgate::{ErrorBody, Gateway, GatewayConfig, InvocationRequest, NativeLoader, Server};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modgate")]
#[command(version)]
#[command(about = "Invoke methods in dynamically loaded modules", long_about = None)]
struct Cli {
    /// Config file (default: modgate.toml in the current directory or a parent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a module's types and method signatures as JSON
    Describe {
        /// Module path
        module: String,
    },

    /// Run a single invocation and print the response as JSON
    Invoke {
        /// Module path
        module: String,

        /// Fully qualified type name
        type_name: String,

        /// Method name
        method: String,

        /// Parameters, one string per declared parameter
        params: Vec<String>,
    },

    /// Serve the HTTP transport
    Serve {
        /// Listen address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GatewayConfig::load_from_cwd().context("Failed to load config")?,
    };
    init_tracing(&config.logging.filter);

    match cli.command {
        Commands::Describe { module } => cmd_describe(&module),
        Commands::Invoke {
            module,
            type_name,
            method,
            params,
        } => cmd_invoke(&module, &type_name, &method, params),
        Commands::Serve { bind } => cmd_serve(config, bind),
    }
}

/// `RUST_LOG` wins over the configured filter
fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_describe(module: &str) -> Result<()> {
    let gateway = Gateway::new(NativeLoader::new());
    let description = gateway.describe(module).context("Describe failed")?;
    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(())
}

fn cmd_invoke(module: &str, type_name: &str, method: &str, params: Vec<String>) -> Result<()> {
    let gateway = Gateway::new(NativeLoader::new());
    let request = InvocationRequest {
        module_path: module.to_string(),
        type_name: type_name.to_string(),
        method_name: method.to_string(),
        parameters: params,
    };

    match gateway.invoke(&request) {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(err) => {
            let envelope = serde_json::json!({ "error": ErrorBody::from(&err) });
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Err(err).context("Invocation failed")
        }
    }
}

fn cmd_serve(mut config: GatewayConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let gateway = Gateway::new(NativeLoader::new());
    for report in gateway.preload(&config.modules.preload) {
        match report.outcome {
            Ok(()) => info!(path = %report.path, "preloaded"),
            Err(e) => warn!(path = %report.path, error = %e, "skipping module"),
        }
    }

    let bind = config.server.bind.clone();
    Server::new(gateway, config.server)
        .serve()
        .with_context(|| format!("Failed to serve on {}", bind))
}
