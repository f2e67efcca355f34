mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "agentwire")]
#[command(about = "Event bus, driver bridge and WebSocket transport for agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one agent over WebSocket
    Serve {
        /// Host to bind to (overrides config server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Definition to register and run
        #[arg(short, long, default_value = "Echo")]
        definition: String,
    },

    /// Connect to a server, send one message and print the reply
    Connect {
        /// Message to send
        message: String,

        /// Server URL (defaults to the configured server)
        #[arg(short, long)]
        url: Option<String>,

        /// Print every event as a JSON line
        #[arg(long)]
        raw: bool,

        /// Seconds to wait for the turn to finish
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Run an agent in-process and send it one message
    Run {
        /// Message to send
        message: String,

        /// Definition to register and run
        #[arg(short, long, default_value = "Echo")]
        definition: String,

        /// Commit the session to a derived image afterwards
        #[arg(long)]
        commit: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file if it does not exist
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            definition,
        } => {
            commands::serve::run(host, port, definition).await?;
        }
        Commands::Connect {
            message,
            url,
            raw,
            timeout,
        } => {
            commands::connect::run(url, message, raw, timeout).await?;
        }
        Commands::Run {
            message,
            definition,
            commit,
        } => {
            commands::run_cmd::run(definition, message, commit).await?;
        }
        Commands::Config { init } => {
            commands::config_cmd::show(init).await?;
        }
    }

    Ok(())
}
