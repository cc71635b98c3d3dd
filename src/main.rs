use clap::{Parser, Subcommand};
use samlvpn::config::{find_config_file, LOCAL_CONFIG_FILE};
use samlvpn::credentials::CredentialStore;
use samlvpn::{signal, Config, Session};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "samlvpn")]
#[command(about = "Connect to OpenVPN gateways that log in through SAML")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./samlvpn.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in through the browser and run OpenVPN
    Connect,
    /// Generate default config file
    Init {
        /// Where to write the config
        #[arg(default_value = LOCAL_CONFIG_FILE)]
        path: PathBuf,
    },
    /// Validate the config and show the login URL without connecting
    Check,
    /// Remove a credentials file left behind by a crashed run
    Clean,
}

fn load_config(explicit: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = find_config_file(explicit)
        .ok_or("No config file found, run `samlvpn init` to create one")?;
    info!("Using config {}", path.display());
    Config::load(&path).map_err(|e| format!("{}: {}", path.display(), e).into())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout is reserved for URLs and commands to paste
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Connect => {
            let config = load_config(cli.config.as_deref())?;
            let mut session = Session::new(config)?;
            let mut shutdown = signal::install_interrupt_handler()?;

            let report = session.run(&mut shutdown).await?;
            info!(
                "Session finished after {} attempt(s) in {:.0?}",
                report.attempts, report.elapsed
            );
            Ok(report.exit_code())
        }
        Commands::Init { path } => {
            if path.exists() {
                return Err(format!("{} already exists", path.display()).into());
            }
            info!("Generating default config...");
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
            println!("Set openvpn-binary and openvpn-config-file before connecting.");
            Ok(0)
        }
        Commands::Check => {
            let config = load_config(cli.config.as_deref())?;
            let session = Session::new(config)?;
            println!("Config OK");
            println!("  Gateway: {}", session.endpoint());
            println!("  Attempts: {}", session.max_attempts());
            println!("  Login URL: {}", session.preview_url()?);
            Ok(0)
        }
        Commands::Clean => {
            let path = match load_config(cli.config.as_deref()) {
                Ok(config) => config.temp_credentials_file_path,
                Err(e) => {
                    info!("{}, using the default credentials path", e);
                    Config::default().temp_credentials_file_path
                }
            };
            let store = CredentialStore::new(path, 0);
            store.clear()?;
            println!("Removed credentials file {}", store.path().display());
            Ok(0)
        }
    }
}
