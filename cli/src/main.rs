//! PodTunnel CLI - Self-healing port forwards to Kubernetes pods
//!
//! A command-line tool that keeps local ports forwarded to pods and
//! services, following the traffic to a new pod when the old one dies.

mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "podtunnel")]
#[command(author, version, about = "Self-healing port forwards to Kubernetes pods")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (default: ~/.podtunnel/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// kubeconfig context to use
    #[arg(long, global = true)]
    context: Option<String>,

    /// Namespace of the target
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward local ports to a pod or service until interrupted
    #[command(alias = "pf")]
    Forward {
        /// Target resource: `svc/NAME`, `pod/NAME` or a bare pod name
        target: String,

        /// Port mappings: `LOCAL:REMOTE`, `:REMOTE` or `REMOTE`
        #[arg(required = true)]
        ports: Vec<String>,
    },

    /// Show which pod a target currently resolves to
    Resolve {
        /// Target resource: `svc/NAME`, `pod/NAME` or a bare pod name
        target: String,

        /// Remote port
        port: u16,
    },

    /// Show current configuration
    Config {
        /// Write the effective configuration to disk
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let store = commands::config_store(cli.config.as_deref())?;

    match cli.command {
        Commands::Forward { target, ports } => {
            let options = commands::forward::ForwardOptions {
                namespace: cli.namespace,
                context: cli.context,
                target,
                ports,
                json: cli.json,
            };
            commands::forward::run(&store, options).await?;
        }
        Commands::Resolve { target, port } => {
            commands::resolve::run(&cli.namespace, cli.context, &target, port, cli.json).await?;
        }
        Commands::Config { init } => {
            commands::config::show(&store, init, cli.json).await?;
        }
    }

    Ok(())
}
