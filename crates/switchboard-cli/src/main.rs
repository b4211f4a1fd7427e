use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use switchboard_core::config::{Config, ScenarioConfig};
use switchboard_core::scenario::ScenarioDoc;
use switchboard_core::store::{JsonSessionStore, SessionStateStore};

#[derive(Parser)]
#[command(
    name = "switchboard",
    about = "Multi-agent voice conversation backend with tiered speech pools, barge-in, and live agent handoffs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice WebSocket server
    Serve {
        /// Port to listen on (default: 18850)
        #[arg(long)]
        port: Option<u16>,

        /// Scenario document path (overrides config)
        #[arg(long)]
        scenario: Option<String>,
    },

    /// Scenario document tooling
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },

    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// Parse a scenario document and cross-check its agents and routes
    Validate { path: String },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List stored sessions, newest first
    List,
    /// Print one stored session as JSON
    Show { session: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the config file
    Check,
    /// Show the resolved configuration
    Show,
}

/// Honors `RUST_LOG` first, then the config's logging section, then
/// `--verbose`. The `json` format is for shipping logs off-box.
fn init_logging(config: &Config, verbose: bool) {
    let default_level = if verbose {
        "debug".to_string()
    } else {
        config.log_level().unwrap_or_else(|| "info".to_string())
    };
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let mut json = false;
    if let Some(logging) = &config.logging {
        json = logging.format == "json";
        for directive in &logging.filters {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
            }
        }
    }

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn store(config: &Config) -> JsonSessionStore {
    JsonSessionStore::new(config.store_dir(), config.session_ttl())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);
    let mut config = Config::load(&config_path)?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Serve { port, scenario } => {
            if let Some(path) = scenario {
                config.scenario = Some(ScenarioConfig { path: Some(path) });
            }

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("configuration is invalid ({} error(s))", errors.len());
            }

            let manager = switchboard_server::build_manager(&config)?;
            manager.start_upkeep();

            // Hot reload is best-effort: a watcher failure should not stop
            // the server from taking calls.
            let _watcher = match switchboard_server::ScenarioWatcher::start(
                config.scenario_path(),
                Arc::clone(&manager),
            ) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::warn!(error = %e, "Scenario hot reload disabled");
                    None
                }
            };

            let port = port.unwrap_or_else(|| config.server_port());
            let bind = config.server_bind();
            switchboard_server::start_server(manager, &bind, port).await?;
        }

        Commands::Scenario { action } => match action {
            ScenarioAction::Validate { path } => {
                let doc = ScenarioDoc::load_from_file(Path::new(&path))?;
                println!("Scenario '{}' is valid", doc.name);
                println!("  start agent: {}", doc.start_agent);
                let agents: Vec<&str> = doc.agents.iter().map(|a| a.name.as_str()).collect();
                println!("  agents: {}", agents.join(", "));
                if doc.handoffs.is_empty() {
                    println!("  handoffs: none");
                }
                for handoff in &doc.handoffs {
                    println!(
                        "  handoff: {} -> {} via {} ({})",
                        handoff.from,
                        handoff.to,
                        handoff.tool,
                        format!("{:?}", handoff.kind).to_lowercase()
                    );
                }
            }
        },

        Commands::Sessions { action } => match action {
            SessionAction::List => {
                let store = store(&config);
                let sessions = store.list().await?;
                if sessions.is_empty() {
                    println!("No stored sessions in {}", config.store_dir().display());
                }
                for summary in sessions {
                    println!(
                        "{}  {:<12} {:>3} turns  {:<10} last active {}",
                        summary.session_id,
                        summary.active_agent,
                        summary.turns,
                        format!("{:?}", summary.transport).to_lowercase(),
                        summary.last_activity_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    );
                }
            }
            SessionAction::Show { session } => {
                let store = store(&config);
                match store.load(&session).await? {
                    Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
                    None => anyhow::bail!("session '{session}' not found (or expired)"),
                }
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Check => {
                let (warnings, errors) = config.validate();
                if warnings.is_empty() && errors.is_empty() {
                    println!("Config OK: {}", config_path.display());
                }
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s)", errors.len());
                }
            }
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
        },
    }

    Ok(())
}
