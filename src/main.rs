use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use kurs::core::log::init_logging;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl From<Commands> for kurs::AppCommand {
    fn from(cmd: Commands) -> kurs::AppCommand {
        match cmd {
            Commands::Convert { query } => kurs::AppCommand::Convert { query },
            Commands::Subscribe {
                subscriber,
                chat,
                plan,
                query,
            } => kurs::AppCommand::Subscribe {
                chat: chat.unwrap_or_else(|| subscriber.clone()),
                subscriber,
                plan,
                query,
            },
            Commands::Unsubscribe { subscriber } => kurs::AppCommand::Unsubscribe { subscriber },
            Commands::Serve => kurs::AppCommand::Serve,
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Convert a "<amount> <currency>" query to rubles
    Convert { query: String },
    /// Register a recurring conversion notification
    Subscribe {
        /// Subscriber identity; one subscription per subscriber
        #[arg(long)]
        subscriber: String,
        /// Delivery address; defaults to the subscriber identity
        #[arg(long)]
        chat: Option<String>,
        /// One of: daily, weekly, monthly
        #[arg(long)]
        plan: String,
        query: String,
    },
    /// Remove a subscriber's recurring notification
    Unsubscribe {
        #[arg(long)]
        subscriber: String,
    },
    /// Rehydrate persisted subscriptions and run the dispatcher
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => setup(),
        Some(cmd) => kurs::run_command(cmd.into(), cli.config_path.as_deref()).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}

fn setup() -> anyhow::Result<()> {
    use anyhow::Context;

    let path = kurs::core::config::AppConfig::default_config_path()?;

    if path.exists() {
        anyhow::bail!("Configuration file already exists at {}", path.display());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let default_config = r#"---
source:
  base_url: "https://www.cbr-xml-daily.ru"
  timeout_secs: 10
  retries: 3

freshness_hours: 24
"#;

    std::fs::write(&path, default_config)
        .with_context(|| format!("Failed to write config file to {}", path.display()))?;

    tracing::info!("Created default configuration at {}", path.display());
    Ok(())
}
